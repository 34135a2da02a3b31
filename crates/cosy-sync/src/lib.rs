//! Discovery, scoring, normalization and curation jobs.

pub mod brand;
pub mod config;
pub mod crawler;
pub mod curate;
pub mod dedup;
pub mod features;
pub mod jobs;
pub mod normalize;
pub mod plan;
pub mod scheduler;
pub mod scoring;
pub mod slug;

pub use brand::{detect_brand, Brand};
pub use config::SyncConfig;
pub use crawler::{CrawlSettings, CrawlSummary, CrawlTarget, Crawler, QueryCursor, ScanBudget, StopReason};
pub use curate::{curate_all_cities, curate_city, curate_featured, CurationPolicy, CurationSummary};
pub use dedup::{Identity, SeenSet};
pub use features::{extract_features, Amenity, Features};
pub use jobs::{run_job, CrawlRequest, JobError, JobRunner};
pub use normalize::{run_normalization, NormalizeSummary, Percentiles};
pub use plan::{PlannedQuery, QueryPlan, QueryScope};
pub use scheduler::maybe_build_scheduler;
pub use scoring::{cosy_score, RoomCount, ScoreInputs};
pub use slug::{allocate_slug, reslug_all, ReslugSummary, SlugAllocation};

pub const CRATE_NAME: &str = "cosy-sync";

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use cosy_core::{ScoreRecord, VenueRecord};
    use cosy_storage::VenueStore;

    pub fn venue(slug: &str, name: &str, city: Option<&str>, country: Option<&str>) -> VenueRecord {
        VenueRecord {
            slug: slug.to_string(),
            provider: "test".to_string(),
            provider_id: None,
            identity_key: format!("test:{slug}"),
            name: name.to_string(),
            city: city.map(ToString::to_string),
            country: country.map(ToString::to_string),
            coordinates: None,
            rating: None,
            review_count: None,
            amenities: Vec::new(),
            description: None,
            website: None,
            image_url: None,
            updated_at: Utc::now(),
        }
    }

    pub async fn seed_scored(store: &dyn VenueStore, venue: VenueRecord, raw: f64) {
        let stored = store.upsert_venue(&venue).await.unwrap();
        store
            .upsert_raw_score(&ScoreRecord::raw(stored.slug, raw, Utc::now()))
            .await
            .unwrap();
    }
}
