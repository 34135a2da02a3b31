use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use cosy_core::{CurationFamily, CurationSlot, ScopeStat, ScoreRecord, ScoredVenue, VenueRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A write violated a uniqueness or reference constraint.
    #[error("persistence conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

/// Uniqueness and ambiguity checks needed to allocate slugs.
#[async_trait]
pub trait SlugLookup: Send + Sync {
    async fn slug_taken(&self, slug: &str) -> Result<bool, StoreError>;

    /// Distinct countries of stored venues whose city matches `city` case-insensitively.
    async fn countries_for_city(&self, city: &str) -> Result<BTreeSet<String>, StoreError>;
}

/// Persistent store for venues, scores, scope statistics, curated slots and redirects.
///
/// Every write is an upsert keyed by a natural identity so re-running a job is safe.
/// Bulk reads are keyset-paginated by slug.
#[async_trait]
pub trait VenueStore: SlugLookup {
    async fn find_by_identity(&self, identity_key: &str) -> Result<Option<VenueRecord>, StoreError>;

    /// Insert or update by `identity_key`. An existing venue keeps its slug; the
    /// stored record is returned.
    async fn upsert_venue(&self, venue: &VenueRecord) -> Result<VenueRecord, StoreError>;

    /// Write the raw score, leaving any calibrated score in place.
    async fn upsert_raw_score(&self, score: &ScoreRecord) -> Result<(), StoreError>;

    async fn count_venues_in_city(&self, city: &str) -> Result<u64, StoreError>;

    async fn venues_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<VenueRecord>, StoreError>;

    /// Scored venues ordered by slug, optionally restricted to one city.
    async fn scored_page(
        &self,
        city: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredVenue>, StoreError>;

    /// Distinct cities that have at least one scored venue.
    async fn scored_cities(&self) -> Result<Vec<String>, StoreError>;

    /// Countries seen per city, keyed by the folded city name.
    async fn city_countries(&self) -> Result<BTreeMap<String, BTreeSet<String>>, StoreError>;

    async fn replace_scope_stats(&self, stats: &[ScopeStat]) -> Result<(), StoreError>;

    async fn scope_stats(&self) -> Result<Vec<ScopeStat>, StoreError>;

    async fn set_calibrated(&self, updates: &[(String, f64)]) -> Result<(), StoreError>;

    async fn replace_slots(&self, family: &CurationFamily, slots: &[CurationSlot]) -> Result<(), StoreError>;

    async fn slots(&self, family: &CurationFamily) -> Result<Vec<CurationSlot>, StoreError>;

    /// Rename a venue and record `old -> new`, re-pointing earlier redirects at `new`.
    async fn rename_slug(&self, old: &str, new: &str) -> Result<(), StoreError>;

    async fn redirect_for(&self, old: &str) -> Result<Option<String>, StoreError>;
}
