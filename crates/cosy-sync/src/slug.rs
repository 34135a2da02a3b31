//! Human-readable venue slugs and the batch re-slug pass.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use cosy_core::{fold_text, slug_fragment, SlugRedirect};
use cosy_storage::{SlugLookup, StoreError, VenueStore};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

/// `base` plus suffixes `-2` through `-100`.
pub const MAX_SLUG_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlugAllocation {
    pub slug: String,
    /// Every numbered candidate was taken and a timestamp suffix was used.
    pub fallback_used: bool,
}

pub fn base_slug(name: &str, city: Option<&str>, country: Option<&str>, ambiguous_city: bool) -> String {
    let name = Some(slug_fragment(name))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "venue".to_string());
    let city = city.map(slug_fragment).filter(|s| !s.is_empty());
    let country = country.map(slug_fragment).filter(|s| !s.is_empty());
    match (city, country) {
        (Some(city), Some(country)) if ambiguous_city => format!("{country}-{city}-{name}"),
        (Some(city), _) => format!("{city}-{name}"),
        (None, Some(country)) => format!("{country}-{name}"),
        (None, None) => name,
    }
}

pub fn candidate_slugs(base: &str) -> impl Iterator<Item = String> + '_ {
    std::iter::once(base.to_string()).chain((2..=MAX_SLUG_ATTEMPTS).map(move |n| format!("{base}-{n}")))
}

/// A city is ambiguous when venues stored under it already span more than one country.
pub async fn is_ambiguous_city<L>(lookup: &L, city: &str) -> Result<bool, StoreError>
where
    L: SlugLookup + ?Sized,
{
    let countries = lookup
        .countries_for_city(city)
        .await?
        .iter()
        .map(|c| fold_text(c.trim()))
        .collect::<BTreeSet<_>>();
    Ok(countries.len() > 1)
}

pub async fn allocate_slug<L>(
    lookup: &L,
    name: &str,
    city: Option<&str>,
    country: Option<&str>,
) -> Result<SlugAllocation, StoreError>
where
    L: SlugLookup + ?Sized,
{
    let ambiguous = match city {
        Some(city) => is_ambiguous_city(lookup, city).await?,
        None => false,
    };
    let base = base_slug(name, city, country, ambiguous);
    for candidate in candidate_slugs(&base) {
        if !lookup.slug_taken(&candidate).await? {
            return Ok(SlugAllocation {
                slug: candidate,
                fallback_used: false,
            });
        }
    }

    let mut stamp = Utc::now().timestamp_millis();
    loop {
        let candidate = format!("{base}-{stamp}");
        if !lookup.slug_taken(&candidate).await? {
            warn!(base = %base, slug = %candidate, "numbered slugs exhausted; using timestamp suffix");
            return Ok(SlugAllocation {
                slug: candidate,
                fallback_used: true,
            });
        }
        stamp += 1;
    }
}

/// In-memory slug snapshot used while re-slugging a whole corpus.
#[derive(Debug, Clone, Default)]
pub struct ReservedSlugs {
    slugs: HashSet<String>,
    city_countries: BTreeMap<String, BTreeSet<String>>,
}

impl ReservedSlugs {
    /// `city_countries` is keyed by folded city name.
    pub fn new(city_countries: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self {
            slugs: HashSet::new(),
            city_countries,
        }
    }

    pub fn reserve(&mut self, slug: impl Into<String>) -> bool {
        self.slugs.insert(slug.into())
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.slugs.contains(slug)
    }

    pub fn len(&self) -> usize {
        self.slugs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slugs.is_empty()
    }
}

#[async_trait]
impl SlugLookup for ReservedSlugs {
    async fn slug_taken(&self, slug: &str) -> Result<bool, StoreError> {
        Ok(self.contains(slug))
    }

    async fn countries_for_city(&self, city: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .city_countries
            .get(&fold_text(city))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReslugSummary {
    pub examined: u64,
    pub unchanged: u64,
    pub renamed: u64,
    pub exhausted: u64,
    pub rename_failures: u64,
    pub redirects: Vec<SlugRedirect>,
}

/// Recompute every slug against a reserved set seeded from all current slugs.
///
/// A venue keeps its slug when the walk over its candidates reaches that slug
/// before any free one. Renamed venues leave their old slug behind as a redirect,
/// so running the pass twice changes nothing the second time.
pub async fn reslug_all(store: &dyn VenueStore, page_size: usize) -> Result<ReslugSummary, StoreError> {
    let span = info_span!("reslug");
    async {
        let page_size = page_size.max(1);
        let mut reserved = ReservedSlugs::new(store.city_countries().await?);
        let mut after: Option<String> = None;
        loop {
            let page = store.venues_page(after.as_deref(), page_size).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.slug.clone());
            for venue in &page {
                reserved.reserve(venue.slug.clone());
            }
        }

        let mut summary = ReslugSummary::default();
        let mut plan = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = store.venues_page(after.as_deref(), page_size).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.slug.clone());

            for venue in &page {
                summary.examined += 1;
                let city = venue.city.as_deref();
                let country = venue.country.as_deref();
                let ambiguous = match city {
                    Some(city) => is_ambiguous_city(&reserved, city).await?,
                    None => false,
                };
                let base = base_slug(&venue.name, city, country, ambiguous);

                let mut target = None;
                let mut reached_current = false;
                for candidate in candidate_slugs(&base) {
                    if candidate == venue.slug {
                        reached_current = true;
                        break;
                    }
                    if !reserved.contains(&candidate) && !store.slug_taken(&candidate).await? {
                        target = Some(candidate);
                        break;
                    }
                }

                match target {
                    Some(new_slug) => {
                        reserved.reserve(new_slug.clone());
                        plan.push(SlugRedirect {
                            old_slug: venue.slug.clone(),
                            new_slug,
                        });
                    }
                    None if reached_current => summary.unchanged += 1,
                    None => {
                        warn!(slug = %venue.slug, base = %base, "no free slug candidate; keeping current slug");
                        summary.exhausted += 1;
                    }
                }
            }
        }

        for change in plan {
            match store.rename_slug(&change.old_slug, &change.new_slug).await {
                Ok(()) => {
                    summary.renamed += 1;
                    summary.redirects.push(change);
                }
                Err(err) => {
                    warn!(old = %change.old_slug, new = %change.new_slug, error = %err, "rename failed");
                    summary.rename_failures += 1;
                }
            }
        }

        info!(
            examined = summary.examined,
            renamed = summary.renamed,
            unchanged = summary.unchanged,
            "re-slug finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}
