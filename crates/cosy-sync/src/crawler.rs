//! Budgeted, paced crawl over the query plan.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cosy_adapters::SearchProvider;
use cosy_core::{fold_text, CandidateListing, ScoreRecord, VenueRecord};
use cosy_storage::{StoreError, VenueStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{Identity, SeenSet};
use crate::features::extract_features;
use crate::plan::{PlannedQuery, QueryPlan};
use crate::scoring::{cosy_score, RoomCount, ScoreInputs};
use crate::slug::allocate_slug;

/// Lodging types that are never cosy venues.
pub const EXCLUDED_CATEGORIES: &[&str] = &[
    "hostel",
    "capsule",
    "serviced apartment",
    "apartment hotel",
    "campground",
];

pub fn excluded_category(categories: &[String]) -> Option<&'static str> {
    categories.iter().find_map(|category| {
        let folded = fold_text(&category.replace('_', " "));
        EXCLUDED_CATEGORIES.iter().copied().find(|ex| folded.contains(ex))
    })
}

/// City and country from provider fields, else the last two address segments.
pub fn locality(candidate: &CandidateListing) -> (Option<String>, Option<String>) {
    let segments = candidate
        .address
        .as_deref()
        .map(|a| {
            a.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let (address_city, address_country) = match segments.as_slice() {
        [.., city, country] => {
            let city = city
                .split_whitespace()
                .filter(|token| !token.chars().any(|c| c.is_ascii_digit()))
                .collect::<Vec<_>>()
                .join(" ");
            (Some(city).filter(|c| !c.is_empty()), Some(country.to_string()))
        }
        _ => (None, None),
    };
    let pick = |field: Option<&str>, fallback: Option<String>| {
        field
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .or(fallback)
    };
    (
        pick(candidate.city.as_deref(), address_city),
        pick(candidate.country.as_deref(), address_country),
    )
}

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub pages_per_query: u32,
    pub scan_budget: u64,
    /// Wait before every continuation-token page.
    pub page_delay: Duration,
    pub sufficient_venues: u64,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            pages_per_query: 3,
            scan_budget: 500,
            page_delay: Duration::from_secs(2),
            sufficient_venues: 20,
        }
    }
}

/// Candidates a run may still examine, skipped ones included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanBudget {
    limit: u64,
    used: u64,
}

impl ScanBudget {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn try_consume(&mut self) -> bool {
        if self.exhausted() {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoToken,
    PageLimit,
    BudgetExhausted,
    SearchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    /// Fetch the page behind `token`; `None` is the first page.
    Issue { token: Option<String> },
    Done(StopReason),
}

/// Pagination state of one query against one provider.
#[derive(Debug, Clone)]
pub struct QueryCursor {
    state: CursorState,
    pages: u32,
    page_limit: u32,
}

impl QueryCursor {
    pub fn new(page_limit: u32, budget: &ScanBudget) -> Self {
        let state = if budget.exhausted() {
            CursorState::Done(StopReason::BudgetExhausted)
        } else if page_limit == 0 {
            CursorState::Done(StopReason::PageLimit)
        } else {
            CursorState::Issue { token: None }
        };
        Self {
            state,
            pages: 0,
            page_limit,
        }
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Next page is only issued with a token, under the page limit, and with budget left.
    pub fn page_received(&mut self, next_token: Option<String>, budget: &ScanBudget) {
        self.pages += 1;
        self.state = match next_token {
            _ if budget.exhausted() => CursorState::Done(StopReason::BudgetExhausted),
            None => CursorState::Done(StopReason::NoToken),
            Some(_) if self.pages >= self.page_limit => CursorState::Done(StopReason::PageLimit),
            Some(token) => CursorState::Issue { token: Some(token) },
        };
    }

    pub fn search_failed(&mut self) {
        self.state = CursorState::Done(StopReason::SearchFailed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CrawlTarget {
    Global,
    City { city: String, country: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub target: CrawlTarget,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries_issued: u64,
    pub pages_fetched: u64,
    pub scanned: u64,
    pub upserted: u64,
    pub skipped_category: u64,
    pub skipped_duplicate: u64,
    pub provider_failures: u64,
    pub not_upserted: u64,
    pub slug_fallbacks: u64,
    pub short_circuited: bool,
    pub budget_exhausted: bool,
}

impl CrawlSummary {
    fn start(target: CrawlTarget) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            target,
            started_at: now,
            finished_at: now,
            queries_issued: 0,
            pages_fetched: 0,
            scanned: 0,
            upserted: 0,
            skipped_category: 0,
            skipped_duplicate: 0,
            provider_failures: 0,
            not_upserted: 0,
            slug_fallbacks: 0,
            short_circuited: false,
            budget_exhausted: false,
        }
    }
}

struct RunState {
    seen: SeenSet,
    budget: ScanBudget,
    summary: CrawlSummary,
}

pub struct Crawler<'a> {
    store: &'a dyn VenueStore,
    providers: &'a [Arc<dyn SearchProvider>],
    settings: CrawlSettings,
}

impl<'a> Crawler<'a> {
    pub fn new(store: &'a dyn VenueStore, providers: &'a [Arc<dyn SearchProvider>], settings: CrawlSettings) -> Self {
        Self {
            store,
            providers,
            settings,
        }
    }

    /// Run the plan's queries for `target`. A city run without `force`
    /// returns at once when the city already has enough venues.
    pub async fn crawl(
        &self,
        target: CrawlTarget,
        plan: &QueryPlan,
        force: bool,
    ) -> Result<CrawlSummary, StoreError> {
        let span = info_span!("crawl", target = ?target);
        async {
            let mut run = RunState {
                seen: SeenSet::new(),
                budget: ScanBudget::new(self.settings.scan_budget),
                summary: CrawlSummary::start(target.clone()),
            };

            let queries = match &target {
                CrawlTarget::Global => plan.global_queries(),
                CrawlTarget::City { city, country } => {
                    if !force {
                        let existing = self.store.count_venues_in_city(city).await?;
                        if existing >= self.settings.sufficient_venues {
                            info!(city = %city, existing, "city already has enough venues");
                            run.summary.short_circuited = true;
                            run.summary.finished_at = Utc::now();
                            return Ok(run.summary);
                        }
                    }
                    let country = country.as_deref().or_else(|| plan.country_for_city(city));
                    plan.city_queries(city, country)
                }
            };

            'queries: for query in &queries {
                for provider in self.providers {
                    if run.budget.exhausted() {
                        break 'queries;
                    }
                    self.run_query(provider.as_ref(), query, &mut run).await;
                }
            }

            run.summary.budget_exhausted = run.budget.exhausted();
            run.summary.finished_at = Utc::now();
            info!(
                run_id = %run.summary.run_id,
                scanned = run.summary.scanned,
                upserted = run.summary.upserted,
                failures = run.summary.provider_failures,
                budget_exhausted = run.summary.budget_exhausted,
                "crawl finished"
            );
            Ok(run.summary)
        }
        .instrument(span)
        .await
    }

    async fn run_query(&self, provider: &dyn SearchProvider, query: &PlannedQuery, run: &mut RunState) {
        let mut cursor = QueryCursor::new(self.settings.pages_per_query, &run.budget);
        run.summary.queries_issued += 1;

        while let CursorState::Issue { token } = cursor.state().clone() {
            if token.is_some() {
                tokio::time::sleep(self.settings.page_delay).await;
            }
            let page = match provider.text_search(&query.text, token.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(provider = provider.provider_name(), query = %query.text, error = %err, "search failed");
                    run.summary.provider_failures += 1;
                    cursor.search_failed();
                    break;
                }
            };
            run.summary.pages_fetched += 1;

            for candidate in page.candidates {
                if !run.budget.try_consume() {
                    break;
                }
                run.summary.scanned += 1;
                self.process_candidate(provider, candidate, run).await;
            }
            cursor.page_received(page.next_token, &run.budget);
        }

        debug!(query = %query.text, pages = cursor.pages(), state = ?cursor.state(), "query finished");
    }

    async fn process_candidate(
        &self,
        provider: &dyn SearchProvider,
        candidate: CandidateListing,
        run: &mut RunState,
    ) {
        if let Some(category) = excluded_category(&candidate.categories) {
            debug!(name = %candidate.name, category, "excluded lodging type");
            run.summary.skipped_category += 1;
            return;
        }

        let (city, country) = locality(&candidate);
        let identity = Identity::of(&candidate, city.as_deref(), country.as_deref());
        if !run.seen.first_sighting(&identity) {
            debug!(name = %candidate.name, "already seen this run");
            run.summary.skipped_duplicate += 1;
            return;
        }

        let candidate = match candidate.provider_id.value().cloned() {
            Some(id) => match provider.details(&id).await {
                Ok(details) => candidate.merge_details(details),
                Err(err) => {
                    warn!(provider = provider.provider_name(), id = %id, error = %err, "details failed");
                    run.summary.provider_failures += 1;
                    return;
                }
            },
            None => candidate,
        };
        if let Some(category) = excluded_category(&candidate.categories) {
            debug!(name = %candidate.name, category, "excluded lodging type after details");
            run.summary.skipped_category += 1;
            return;
        }

        match self.persist(&candidate, &identity, run).await {
            Ok(slug) => {
                debug!(slug = %slug, "venue stored");
                run.summary.upserted += 1;
            }
            Err(err) => {
                warn!(name = %candidate.name, error = %err, "venue not stored");
                run.summary.not_upserted += 1;
            }
        }
    }

    async fn persist(
        &self,
        candidate: &CandidateListing,
        identity: &Identity,
        run: &mut RunState,
    ) -> Result<String, StoreError> {
        let (city, country) = locality(candidate);
        let identity_key = identity.key();
        let summary = candidate.summary.as_deref();
        let features = extract_features(summary.as_slice(), &candidate.categories);

        let slug = match self.store.find_by_identity(&identity_key).await? {
            Some(existing) => existing.slug,
            None => {
                let allocation =
                    allocate_slug(self.store, &candidate.name, city.as_deref(), country.as_deref()).await?;
                if allocation.fallback_used {
                    run.summary.slug_fallbacks += 1;
                }
                allocation.slug
            }
        };

        let record = VenueRecord {
            slug,
            provider: candidate.provider.clone(),
            provider_id: candidate.provider_id.value().cloned(),
            identity_key,
            name: candidate.name.clone(),
            city,
            country,
            coordinates: candidate.coordinates.value().copied(),
            rating: candidate.rating_ten_point(),
            review_count: candidate.review_count.value().copied(),
            amenities: features.amenity_labels(),
            description: summary.map(ToString::to_string),
            website: candidate.website.value().cloned(),
            image_url: candidate.image_url.value().cloned(),
            updated_at: Utc::now(),
        };
        let stored = self.store.upsert_venue(&record).await?;

        let raw = cosy_score(ScoreInputs {
            rating: record.rating,
            amenities: Some(&features.amenities),
            description: summary,
            rooms: RoomCount::from_provider(candidate.rooms.value().copied()),
            image_warmth: None,
        });
        self.store
            .upsert_raw_score(&ScoreRecord::raw(stored.slug.clone(), raw, Utc::now()))
            .await?;
        Ok(stored.slug)
    }
}
