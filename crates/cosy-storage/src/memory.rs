use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use cosy_core::{fold_text, CurationFamily, CurationSlot, ScopeStat, ScoreRecord, ScoredVenue, VenueRecord};
use tokio::sync::Mutex;

use crate::store::{SlugLookup, StoreError, VenueStore};

#[derive(Debug, Default)]
struct MemoryInner {
    venues: BTreeMap<String, VenueRecord>,
    identities: HashMap<String, String>,
    scores: BTreeMap<String, ScoreRecord>,
    stats: Vec<ScopeStat>,
    slots: HashMap<CurationFamily, Vec<CurationSlot>>,
    redirects: BTreeMap<String, String>,
}

/// In-process store with the same upsert semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryVenueStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryVenueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn venue_count(&self) -> usize {
        self.inner.lock().await.venues.len()
    }

    pub async fn venue(&self, slug: &str) -> Option<VenueRecord> {
        self.inner.lock().await.venues.get(slug).cloned()
    }

    pub async fn score(&self, slug: &str) -> Option<ScoreRecord> {
        self.inner.lock().await.scores.get(slug).cloned()
    }
}

fn same_city(stored: Option<&String>, city: &str) -> bool {
    stored.is_some_and(|c| fold_text(c) == fold_text(city))
}

fn page_after<'a, V>(
    map: &'a BTreeMap<String, V>,
    after: Option<&str>,
) -> impl Iterator<Item = (&'a String, &'a V)> {
    let lower = match after {
        Some(slug) => Bound::Excluded(slug.to_string()),
        None => Bound::Unbounded,
    };
    map.range((lower, Bound::Unbounded))
}

#[async_trait]
impl SlugLookup for MemoryVenueStore {
    async fn slug_taken(&self, slug: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.venues.contains_key(slug) || inner.redirects.contains_key(slug))
    }

    async fn countries_for_city(&self, city: &str) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .venues
            .values()
            .filter(|v| same_city(v.city.as_ref(), city))
            .filter_map(|v| v.country.clone())
            .collect())
    }
}

#[async_trait]
impl VenueStore for MemoryVenueStore {
    async fn find_by_identity(&self, identity_key: &str) -> Result<Option<VenueRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .identities
            .get(identity_key)
            .and_then(|slug| inner.venues.get(slug))
            .cloned())
    }

    async fn upsert_venue(&self, venue: &VenueRecord) -> Result<VenueRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing_slug) = inner.identities.get(&venue.identity_key).cloned() {
            let stored = VenueRecord {
                slug: existing_slug.clone(),
                ..venue.clone()
            };
            inner.venues.insert(existing_slug, stored.clone());
            return Ok(stored);
        }
        if inner.venues.contains_key(&venue.slug) {
            return Err(StoreError::Conflict(format!(
                "slug {} already belongs to another venue",
                venue.slug
            )));
        }
        if let Some(provider_id) = &venue.provider_id {
            let clash = inner
                .venues
                .values()
                .any(|v| v.provider == venue.provider && v.provider_id.as_ref() == Some(provider_id));
            if clash {
                return Err(StoreError::Conflict(format!(
                    "provider id {}:{} already stored under another identity",
                    venue.provider, provider_id
                )));
            }
        }
        inner
            .identities
            .insert(venue.identity_key.clone(), venue.slug.clone());
        inner.venues.insert(venue.slug.clone(), venue.clone());
        Ok(venue.clone())
    }

    async fn upsert_raw_score(&self, score: &ScoreRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.venues.contains_key(&score.slug) {
            return Err(StoreError::Conflict(format!("no venue for score slug {}", score.slug)));
        }
        let calibrated = inner.scores.get(&score.slug).and_then(|s| s.calibrated);
        inner.scores.insert(
            score.slug.clone(),
            ScoreRecord {
                calibrated,
                ..score.clone()
            },
        );
        Ok(())
    }

    async fn count_venues_in_city(&self, city: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .venues
            .values()
            .filter(|v| same_city(v.city.as_ref(), city))
            .count() as u64)
    }

    async fn venues_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<VenueRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(page_after(&inner.venues, after)
            .take(limit)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn scored_page(
        &self,
        city: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredVenue>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(page_after(&inner.scores, after)
            .filter_map(|(slug, score)| {
                inner.venues.get(slug).map(|venue| ScoredVenue {
                    venue: venue.clone(),
                    score: score.clone(),
                })
            })
            .filter(|sv| city.map_or(true, |c| same_city(sv.venue.city.as_ref(), c)))
            .take(limit)
            .collect())
    }

    async fn scored_cities(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let mut seen = BTreeMap::new();
        for slug in inner.scores.keys() {
            if let Some(city) = inner.venues.get(slug).and_then(|v| v.city.clone()) {
                seen.entry(fold_text(&city)).or_insert(city);
            }
        }
        Ok(seen.into_values().collect())
    }

    async fn city_countries(&self) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for venue in inner.venues.values() {
            if let (Some(city), Some(country)) = (&venue.city, &venue.country) {
                out.entry(fold_text(city)).or_default().insert(country.clone());
            }
        }
        Ok(out)
    }

    async fn replace_scope_stats(&self, stats: &[ScopeStat]) -> Result<(), StoreError> {
        self.inner.lock().await.stats = stats.to_vec();
        Ok(())
    }

    async fn scope_stats(&self) -> Result<Vec<ScopeStat>, StoreError> {
        Ok(self.inner.lock().await.stats.clone())
    }

    async fn set_calibrated(&self, updates: &[(String, f64)]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for (slug, calibrated) in updates {
            match inner.scores.get_mut(slug) {
                Some(score) => score.calibrated = Some(*calibrated),
                None => return Err(StoreError::NotFound(format!("score for {slug}"))),
            }
        }
        Ok(())
    }

    async fn replace_slots(&self, family: &CurationFamily, slots: &[CurationSlot]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(missing) = slots.iter().find(|s| !inner.venues.contains_key(&s.slug)) {
            return Err(StoreError::Conflict(format!("slot references unknown venue {}", missing.slug)));
        }
        inner.slots.insert(family.clone(), slots.to_vec());
        Ok(())
    }

    async fn slots(&self, family: &CurationFamily) -> Result<Vec<CurationSlot>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.slots.get(family).cloned().unwrap_or_default())
    }

    async fn rename_slug(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.venues.contains_key(new) {
            return Err(StoreError::Conflict(format!("slug {new} already in use")));
        }
        let Some(mut venue) = inner.venues.remove(old) else {
            return Err(StoreError::NotFound(format!("venue {old}")));
        };
        venue.slug = new.to_string();
        inner.identities.insert(venue.identity_key.clone(), new.to_string());
        inner.venues.insert(new.to_string(), venue);
        if let Some(mut score) = inner.scores.remove(old) {
            score.slug = new.to_string();
            inner.scores.insert(new.to_string(), score);
        }
        for slots in inner.slots.values_mut() {
            for slot in slots.iter_mut().filter(|s| s.slug == old) {
                slot.slug = new.to_string();
            }
        }
        for target in inner.redirects.values_mut() {
            if target == old {
                *target = new.to_string();
            }
        }
        inner.redirects.remove(new);
        inner.redirects.insert(old.to_string(), new.to_string());
        Ok(())
    }

    async fn redirect_for(&self, old: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.redirects.get(old).cloned())
    }
}
