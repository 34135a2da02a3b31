//! Capped top-K selection for the featured list and per-city guides.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use cosy_core::{CurationFamily, CurationSlot, ScopeKind, ScopeStat, ScoredVenue};
use cosy_storage::{StoreError, VenueStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::brand::{detect_brand, Brand};
use crate::features::Amenity;
use crate::normalize::{normalized, scope_key};
use crate::scoring::amenity_weight;

/// Public score a venue needs before it can be curated.
pub const APPROVAL_THRESHOLD: f64 = 7.0;
const CUE_TAGS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurationPolicy {
    pub slots: usize,
    pub country_cap: Option<usize>,
    pub brand_cap: usize,
    pub pool_size: usize,
    pub threshold: f64,
}

impl CurationPolicy {
    pub fn featured() -> Self {
        Self {
            slots: 9,
            country_cap: Some(4),
            brand_cap: 3,
            pool_size: 60,
            threshold: APPROVAL_THRESHOLD,
        }
    }

    pub fn city() -> Self {
        Self {
            slots: 9,
            country_cap: None,
            brand_cap: 2,
            pool_size: 60,
            threshold: APPROVAL_THRESHOLD,
        }
    }
}

/// City and country statistics indexed by folded scope key.
#[derive(Debug, Clone, Default)]
pub struct ScopeNorms {
    cities: HashMap<String, ScopeStat>,
    countries: HashMap<String, ScopeStat>,
}

impl ScopeNorms {
    pub fn new(stats: Vec<ScopeStat>) -> Self {
        let mut norms = Self::default();
        for stat in stats {
            match stat.kind {
                ScopeKind::City => norms.cities.insert(stat.key.clone(), stat),
                ScopeKind::Country => norms.countries.insert(stat.key.clone(), stat),
            };
        }
        norms
    }

    fn norm(table: &HashMap<String, ScopeStat>, scope: Option<&str>, raw: f64) -> f64 {
        scope
            .and_then(|name| table.get(&scope_key(name)))
            .map_or(raw, |stat| normalized(raw, stat))
    }

    pub fn city_norm(&self, city: Option<&str>, raw: f64) -> f64 {
        Self::norm(&self.cities, city, raw)
    }

    pub fn country_norm(&self, country: Option<&str>, raw: f64) -> f64 {
        Self::norm(&self.countries, country, raw)
    }
}

/// Trust multiplier from review volume, in [0.6, 1.0].
pub fn confidence(reviews: Option<u32>) -> f64 {
    let reviews = f64::from(reviews.unwrap_or(0));
    (1.0 + reviews).log10().clamp(0.6, 1.0)
}

pub fn ranking_key(raw: f64, city_norm: f64, country_norm: f64, reviews: Option<u32>) -> f64 {
    (0.5 * raw + 0.3 * city_norm + 0.2 * country_norm) * confidence(reviews)
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub scored: ScoredVenue,
    pub key: f64,
    pub brand: Brand,
    country: Option<String>,
}

impl RankedCandidate {
    pub fn slug(&self) -> &str {
        &self.scored.venue.slug
    }
}

/// Approved venues with their ranking keys, best first, ties by slug.
pub fn rank_candidates(
    venues: Vec<ScoredVenue>,
    norms: &ScopeNorms,
    policy: &CurationPolicy,
) -> Vec<RankedCandidate> {
    let mut ranked = venues
        .into_iter()
        .filter(|sv| sv.score.public() >= policy.threshold)
        .map(|scored| {
            let venue = &scored.venue;
            let raw = scored.score.raw;
            let key = ranking_key(
                raw,
                norms.city_norm(venue.city.as_deref(), raw),
                norms.country_norm(venue.country.as_deref(), raw),
                venue.review_count,
            );
            let brand = detect_brand(&venue.name, venue.website.as_deref());
            let country = venue.country.as_deref().map(scope_key);
            RankedCandidate {
                scored,
                key,
                brand,
                country,
            }
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        b.key
            .partial_cmp(&a.key)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.slug().cmp(b.slug()))
    });
    ranked
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub picks: Vec<RankedCandidate>,
    /// Picks admitted by the second pass over the full ranked list.
    pub relaxed_admissions: usize,
}

#[derive(Default)]
struct Caps {
    countries: HashMap<String, usize>,
    brands: HashMap<&'static str, usize>,
    taken: HashSet<String>,
}

impl Caps {
    fn admits(&self, candidate: &RankedCandidate, policy: &CurationPolicy) -> bool {
        if self.taken.contains(candidate.slug()) {
            return false;
        }
        if let (Some(cap), Some(country)) = (policy.country_cap, candidate.country.as_ref()) {
            if self.countries.get(country).copied().unwrap_or(0) >= cap {
                return false;
            }
        }
        match candidate.brand {
            Brand::Independent => true,
            Brand::Chain(name) => self.brands.get(name).copied().unwrap_or(0) < policy.brand_cap,
        }
    }

    fn admit(&mut self, candidate: &RankedCandidate) {
        self.taken.insert(candidate.slug().to_string());
        if let Some(country) = &candidate.country {
            *self.countries.entry(country.clone()).or_default() += 1;
        }
        if let Brand::Chain(name) = candidate.brand {
            *self.brands.entry(name).or_default() += 1;
        }
    }
}

/// Greedy selection under caps. Returns fewer than `policy.slots` picks when
/// the ranked list cannot fill them without breaking a cap.
pub fn select_diverse(ranked: &[RankedCandidate], policy: &CurationPolicy) -> Selection {
    let mut caps = Caps::default();
    let mut selection = Selection::default();

    for candidate in ranked.iter().take(policy.pool_size) {
        if selection.picks.len() >= policy.slots {
            break;
        }
        if caps.admits(candidate, policy) {
            caps.admit(candidate);
            selection.picks.push(candidate.clone());
        } else {
            debug!(slug = candidate.slug(), brand = candidate.brand.label(), "cap reached; skipped");
        }
    }

    if selection.picks.len() < policy.slots {
        for candidate in ranked {
            if selection.picks.len() >= policy.slots {
                break;
            }
            if caps.admits(candidate, policy) {
                caps.admit(candidate);
                selection.picks.push(candidate.clone());
                selection.relaxed_admissions += 1;
            }
        }
        if selection.relaxed_admissions > 0 {
            warn!(
                admitted = selection.relaxed_admissions,
                pool = policy.pool_size,
                "curation filled slots from beyond the candidate pool"
            );
        }
    }
    selection
}

/// Up to three amenity labels, strongest first.
pub fn cue_tags(amenities: &[String]) -> Vec<String> {
    let mut known = amenities
        .iter()
        .filter_map(|label| Amenity::from_label(label))
        .collect::<Vec<_>>();
    known.sort_by(|a, b| {
        amenity_weight(*b)
            .partial_cmp(&amenity_weight(*a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    known.dedup();
    known
        .into_iter()
        .take(CUE_TAGS)
        .map(|a| a.label().to_string())
        .collect()
}

pub fn to_slots(family: &CurationFamily, picks: &[RankedCandidate]) -> Vec<CurationSlot> {
    picks
        .iter()
        .zip(1u8..)
        .map(|(pick, position)| CurationSlot {
            family: family.clone(),
            position,
            slug: pick.slug().to_string(),
            score: pick.key,
            image_url: pick.scored.venue.image_url.clone(),
            rating: pick.scored.venue.rating,
            cue_tags: cue_tags(&pick.scored.venue.amenities),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationSummary {
    pub family: CurationFamily,
    /// Approved venues considered.
    pub considered: usize,
    pub selected: usize,
    pub relaxed_admissions: usize,
    pub slugs: Vec<String>,
}

async fn approved_venues(
    store: &dyn VenueStore,
    city: Option<&str>,
    threshold: f64,
    page_size: usize,
) -> Result<Vec<ScoredVenue>, StoreError> {
    let mut out = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let page = store.scored_page(city, after.as_deref(), page_size.max(1)).await?;
        let Some(last) = page.last() else { break };
        after = Some(last.venue.slug.clone());
        out.extend(page.into_iter().filter(|sv| sv.score.public() >= threshold));
    }
    Ok(out)
}

async fn curate_scope(
    store: &dyn VenueStore,
    family: CurationFamily,
    city: Option<&str>,
    policy: &CurationPolicy,
    page_size: usize,
) -> Result<CurationSummary, StoreError> {
    let norms = ScopeNorms::new(store.scope_stats().await?);
    let approved = approved_venues(store, city, policy.threshold, page_size).await?;
    let considered = approved.len();
    let ranked = rank_candidates(approved, &norms, policy);
    let selection = select_diverse(&ranked, policy);
    let slots = to_slots(&family, &selection.picks);
    store.replace_slots(&family, &slots).await?;

    info!(considered, selected = slots.len(), "curation replaced slots");
    Ok(CurationSummary {
        family,
        considered,
        selected: slots.len(),
        relaxed_admissions: selection.relaxed_admissions,
        slugs: slots.into_iter().map(|s| s.slug).collect(),
    })
}

pub async fn curate_featured(
    store: &dyn VenueStore,
    policy: &CurationPolicy,
    page_size: usize,
) -> Result<CurationSummary, StoreError> {
    curate_scope(store, CurationFamily::Featured, None, policy, page_size)
        .instrument(info_span!("curate", family = "featured"))
        .await
}

/// City slots are keyed by the folded city name.
pub async fn curate_city(
    store: &dyn VenueStore,
    city: &str,
    policy: &CurationPolicy,
    page_size: usize,
) -> Result<CurationSummary, StoreError> {
    let family = CurationFamily::City(scope_key(city));
    curate_scope(store, family, Some(city.trim()), policy, page_size)
        .instrument(info_span!("curate", family = "city", city = %city))
        .await
}

pub async fn curate_all_cities(
    store: &dyn VenueStore,
    policy: &CurationPolicy,
    page_size: usize,
) -> Result<Vec<CurationSummary>, StoreError> {
    let mut out = Vec::new();
    for city in store.scored_cities().await? {
        out.push(curate_city(store, &city, policy, page_size).await?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_scored, venue};
    use chrono::Utc;
    use cosy_core::ScoreRecord;
    use cosy_storage::MemoryVenueStore;

    fn scored(slug: &str, name: &str, country: &str, raw: f64, reviews: u32) -> ScoredVenue {
        let mut v = venue(slug, name, Some("Somewhere"), Some(country));
        v.review_count = Some(reviews);
        ScoredVenue {
            venue: v,
            score: ScoreRecord::raw(slug, raw, Utc::now()),
        }
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(confidence(None), 0.6);
        assert_eq!(confidence(Some(2)), 0.6);
        assert_eq!(confidence(Some(5000)), 1.0);
        let mid = confidence(Some(6));
        assert!(mid > 0.6 && mid < 1.0);
    }

    #[test]
    fn missing_scope_stats_fall_back_to_raw() {
        let norms = ScopeNorms::default();
        assert_eq!(norms.city_norm(Some("Lisbon"), 8.0), 8.0);
        let key = ranking_key(8.0, 8.0, 8.0, Some(999));
        assert!((key - 8.0).abs() < 1e-12);
    }

    #[test]
    fn ranking_drops_unapproved_and_breaks_ties_by_slug() {
        let venues = vec![
            scored("b", "B", "Portugal", 8.0, 100),
            scored("a", "A", "Portugal", 8.0, 100),
            scored("low", "Low", "Portugal", 6.9, 100),
        ];
        let ranked = rank_candidates(venues, &ScopeNorms::default(), &CurationPolicy::featured());
        let slugs = ranked.iter().map(|r| r.slug()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["a", "b"]);
    }

    #[test]
    fn featured_caps_countries() {
        let venues = (0..12)
            .map(|i| {
                let country = if i < 8 { "Portugal" } else { "Norway" };
                scored(&format!("v{i:02}"), &format!("Inn {i}"), country, 9.9 - i as f64 * 0.1, 500)
            })
            .collect();
        let policy = CurationPolicy::featured();
        let ranked = rank_candidates(venues, &ScopeNorms::default(), &policy);
        let selection = select_diverse(&ranked, &policy);
        let portugal = selection
            .picks
            .iter()
            .filter(|p| p.scored.venue.country.as_deref() == Some("Portugal"))
            .count();
        assert_eq!(portugal, 4);
        assert_eq!(selection.picks.len(), 8);
    }

    #[test]
    fn chains_are_capped_and_independents_are_not() {
        let mut venues = (0..5)
            .map(|i| scored(&format!("ibis-{i}"), &format!("Ibis Centre {i}"), "France", 9.8, 500))
            .collect::<Vec<_>>();
        venues.extend((0..5).map(|i| scored(&format!("ind-{i}"), &format!("Maison {i}"), "France", 8.0, 500)));
        let policy = CurationPolicy::city();
        let ranked = rank_candidates(venues, &ScopeNorms::default(), &policy);
        let selection = select_diverse(&ranked, &policy);
        let chains = selection.picks.iter().filter(|p| !p.brand.is_independent()).count();
        assert_eq!(chains, 2);
        assert_eq!(selection.picks.len(), 7);
    }

    #[test]
    fn relaxed_pass_fills_from_beyond_the_pool() {
        let mut venues = (0..4)
            .map(|i| scored(&format!("h-{i}"), &format!("Hilton {i}"), "Austria", 9.9, 500))
            .collect::<Vec<_>>();
        venues.push(scored("tail", "Gasthof", "Austria", 7.5, 500));
        let policy = CurationPolicy {
            pool_size: 4,
            ..CurationPolicy::city()
        };
        let ranked = rank_candidates(venues, &ScopeNorms::default(), &policy);
        let selection = select_diverse(&ranked, &policy);
        assert_eq!(selection.picks.len(), 3);
        assert_eq!(selection.relaxed_admissions, 1);
        assert_eq!(selection.picks[2].slug(), "tail");
    }

    #[test]
    fn caps_hold_for_many_mixed_lists() {
        let brands = ["Ibis", "Hilton", "Casa", "Novotel", "Quinta"];
        let countries = ["Portugal", "Spain", "France"];
        let mut seed = 7u64;
        for round in 0..50 {
            let venues = (0..40)
                .map(|i| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let raw = 5.0 + (seed >> 33) as f64 % 50.0 / 10.0;
                    let brand = brands[(seed >> 13) as usize % brands.len()];
                    let country = countries[(seed >> 21) as usize % countries.len()];
                    scored(&format!("r{round}-{i}"), &format!("{brand} {i}"), country, raw, 50)
                })
                .collect();
            let policy = CurationPolicy::featured();
            let ranked = rank_candidates(venues, &ScopeNorms::default(), &policy);
            let picks = select_diverse(&ranked, &policy).picks;
            assert!(picks.len() <= policy.slots);
            let mut per_country = HashMap::new();
            let mut per_brand = HashMap::new();
            for pick in &picks {
                assert!(pick.scored.score.public() >= APPROVAL_THRESHOLD);
                *per_country.entry(pick.scored.venue.country.clone()).or_insert(0) += 1;
                if let Brand::Chain(name) = pick.brand {
                    *per_brand.entry(name).or_insert(0) += 1;
                }
            }
            assert!(per_country.values().all(|n| *n <= 4));
            assert!(per_brand.values().all(|n| *n <= 3));
        }
    }

    #[test]
    fn cue_tags_prefer_stronger_amenities() {
        let tags = cue_tags(&["Gym".into(), "Garden".into(), "Fireplace".into(), "Spa".into(), "Bar".into()]);
        assert_eq!(tags, vec!["Fireplace", "Spa", "Garden"]);
    }

    #[tokio::test]
    async fn curate_jobs_replace_slots() {
        let store = MemoryVenueStore::new();
        let mut v = venue("lisbon-casa-luz", "Casa Luz", Some("Lisbon"), Some("Portugal"));
        v.amenities = vec!["Fireplace".into()];
        v.review_count = Some(200);
        seed_scored(&store, v, 9.1).await;
        seed_scored(&store, venue("lisbon-ok-inn", "OK Inn", Some("Lisbon"), Some("Portugal")), 7.4).await;
        seed_scored(&store, venue("lisbon-meh", "Meh", Some("Lisbon"), Some("Portugal")), 5.0).await;
        seed_scored(&store, venue("porto-rio", "Rio", Some("Porto"), Some("Portugal")), 8.0).await;

        let featured = curate_featured(&store, &CurationPolicy::featured(), 2).await.unwrap();
        assert_eq!(featured.considered, 3);
        assert_eq!(featured.slugs[0], "lisbon-casa-luz");

        let slots = store.slots(&CurationFamily::Featured).await.unwrap();
        assert_eq!(slots.iter().map(|s| s.position).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(slots[0].cue_tags, vec!["Fireplace"]);

        let cities = curate_all_cities(&store, &CurationPolicy::city(), 2).await.unwrap();
        assert_eq!(cities.len(), 2);
        let lisbon = store.slots(&CurationFamily::City("lisbon".into())).await.unwrap();
        assert_eq!(lisbon.len(), 2);
    }
}
