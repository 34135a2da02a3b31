//! Job boundary shared by the HTTP triggers, the CLI and the scheduler.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use cosy_adapters::{provider_for, DetailsCache, ProviderError, SearchProvider};
use cosy_core::{JobOutcome, JobStatus};
use cosy_storage::{HttpFetcher, TtlCache, VenueStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::crawler::{CrawlSummary, CrawlTarget, Crawler};
use crate::curate::{curate_all_cities, curate_city, curate_featured, CurationPolicy, CurationSummary};
use crate::normalize::{run_normalization, NormalizeSummary};
use crate::plan::QueryPlan;
use crate::slug::{reslug_all, ReslugSummary};

/// Errors raised before a job starts. Failures while it runs are reported in
/// its `JobOutcome`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("{0}")]
    Failed(String),
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ConfigurationMissing(var) => JobError::ConfigurationMissing(var),
            other => JobError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlRequest {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// Page limit per query.
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub scan_budget: Option<u64>,
    #[serde(default)]
    pub force: bool,
}

impl CrawlRequest {
    pub fn required_city(&self) -> Result<&str, JobError> {
        self.city
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(JobError::MissingParameter("city"))
    }
}

pub async fn run_job<T, F>(job: &str, work: F) -> JobOutcome<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let result = work.instrument(info_span!("job", job, run_id = %run_id)).await;
    let finished_at = Utc::now();
    match result {
        Ok(summary) => {
            info!(job, run_id = %run_id, "job completed");
            JobOutcome {
                run_id,
                job: job.to_string(),
                status: JobStatus::Completed,
                started_at,
                finished_at,
                error: None,
                summary: Some(summary),
            }
        }
        Err(err) => {
            error!(job, run_id = %run_id, error = %format!("{err:#}"), "job failed");
            JobOutcome {
                run_id,
                job: job.to_string(),
                status: JobStatus::Failed,
                started_at,
                finished_at,
                error: Some(format!("{err:#}")),
                summary: None,
            }
        }
    }
}

pub struct JobRunner {
    store: Arc<dyn VenueStore>,
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    details_cache: Arc<DetailsCache>,
    providers: Option<Vec<Arc<dyn SearchProvider>>>,
    plan: Option<QueryPlan>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn VenueStore>, config: SyncConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let details_cache = TtlCache::new(config.details_cache_capacity, config.details_cache_ttl());
        Ok(Self {
            store,
            config,
            http: Arc::new(http),
            details_cache: Arc::new(details_cache),
            providers: None,
            plan: None,
        })
    }

    /// Use these providers instead of building them from configuration.
    pub fn with_providers(mut self, providers: Vec<Arc<dyn SearchProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_plan(mut self, plan: QueryPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VenueStore> {
        &self.store
    }

    fn resolve_providers(&self) -> Result<Vec<Arc<dyn SearchProvider>>, JobError> {
        if let Some(providers) = &self.providers {
            return Ok(providers.clone());
        }
        if self.config.providers.is_empty() {
            return Err(JobError::ConfigurationMissing("COSY_PROVIDERS".to_string()));
        }
        let settings = self.config.provider_settings();
        self.config
            .providers
            .iter()
            .map(|name| {
                provider_for(name, &settings, &self.http, &self.details_cache)
                    .map(Arc::from)
                    .map_err(JobError::from)
            })
            .collect()
    }

    /// Fails the way a crawl would when provider configuration is missing.
    pub fn check_crawl_config(&self) -> Result<(), JobError> {
        self.resolve_providers().map(|_| ())
    }

    fn resolve_plan(&self) -> anyhow::Result<QueryPlan> {
        match &self.plan {
            Some(plan) => Ok(plan.clone()),
            None => QueryPlan::load(&self.config.query_plan_path).context("loading query plan"),
        }
    }

    async fn run_crawl(
        &self,
        job: &str,
        target: CrawlTarget,
        request: &CrawlRequest,
    ) -> Result<JobOutcome<CrawlSummary>, JobError> {
        let providers = self.resolve_providers()?;
        let mut settings = self.config.crawl_settings();
        if let Some(pages) = request.pages {
            settings.pages_per_query = pages;
        }
        if let Some(budget) = request.scan_budget {
            settings.scan_budget = budget;
        }
        let force = request.force;
        Ok(run_job(job, async {
            let plan = self.resolve_plan()?;
            let crawler = Crawler::new(self.store.as_ref(), &providers, settings);
            anyhow::Ok(crawler.crawl(target, &plan, force).await?)
        })
        .await)
    }

    /// Full sweep over the query plan.
    pub async fn crawl(&self, request: CrawlRequest) -> Result<JobOutcome<CrawlSummary>, JobError> {
        self.run_crawl("crawl", CrawlTarget::Global, &request).await
    }

    pub async fn city_crawl(&self, request: CrawlRequest) -> Result<JobOutcome<CrawlSummary>, JobError> {
        let city = request.required_city()?;
        let target = CrawlTarget::City {
            city: city.to_string(),
            country: request.country.clone().filter(|c| !c.trim().is_empty()),
        };
        self.run_crawl("city-crawl", target, &request).await
    }

    pub async fn normalize(&self) -> JobOutcome<NormalizeSummary> {
        run_job("normalize", async {
            anyhow::Ok(run_normalization(self.store.as_ref(), self.config.page_size).await?)
        })
        .await
    }

    pub async fn curate_featured(&self) -> JobOutcome<CurationSummary> {
        run_job("curate-featured", async {
            let policy = CurationPolicy::featured();
            anyhow::Ok(curate_featured(self.store.as_ref(), &policy, self.config.page_size).await?)
        })
        .await
    }

    pub async fn curate_city(&self, city: Option<&str>) -> Result<JobOutcome<CurationSummary>, JobError> {
        let city = city
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(JobError::MissingParameter("city"))?;
        Ok(run_job("curate-city", async {
            anyhow::Ok(curate_city(self.store.as_ref(), city, &CurationPolicy::city(), self.config.page_size).await?)
        })
        .await)
    }

    pub async fn curate_all_cities(&self) -> JobOutcome<Vec<CurationSummary>> {
        run_job("curate-cities", async {
            anyhow::Ok(curate_all_cities(self.store.as_ref(), &CurationPolicy::city(), self.config.page_size).await?)
        })
        .await
    }

    pub async fn reslug(&self) -> JobOutcome<ReslugSummary> {
        run_job("reslug", async {
            anyhow::Ok(reslug_all(self.store.as_ref(), self.config.page_size).await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_scored, venue};
    use cosy_adapters::FixtureProvider;
    use cosy_storage::MemoryVenueStore;
    use serde_json::json;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::from_env();
        config.providers = vec!["places".to_string()];
        config.places_api_key = None;
        config.page_delay_ms = 0;
        config.page_size = 2;
        config
    }

    fn plan() -> QueryPlan {
        QueryPlan::from_yaml_str("variants: [cosy hotel]").unwrap()
    }

    #[tokio::test]
    async fn missing_credentials_are_reported_before_running() {
        let store: Arc<dyn VenueStore> = Arc::new(MemoryVenueStore::new());
        let runner = JobRunner::new(store, config()).unwrap().with_plan(plan());
        let err = runner.crawl(CrawlRequest::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "configuration missing: COSY_PLACES_API_KEY");
    }

    #[tokio::test]
    async fn city_jobs_require_a_city() {
        let store: Arc<dyn VenueStore> = Arc::new(MemoryVenueStore::new());
        let runner = JobRunner::new(store, config())
            .unwrap()
            .with_providers(vec![Arc::new(FixtureProvider::new("fixture"))]);
        assert!(matches!(
            runner.city_crawl(CrawlRequest::default()).await,
            Err(JobError::MissingParameter("city"))
        ));
        assert!(matches!(runner.curate_city(Some("  ")).await, Err(JobError::MissingParameter("city"))));
    }

    #[tokio::test]
    async fn unreadable_plans_fail_the_job() {
        let store: Arc<dyn VenueStore> = Arc::new(MemoryVenueStore::new());
        let mut config = config();
        config.query_plan_path = "/nonexistent/queries.yaml".into();
        let runner = JobRunner::new(store, config)
            .unwrap()
            .with_providers(vec![Arc::new(FixtureProvider::new("fixture"))]);
        let outcome = runner.crawl(CrawlRequest::default()).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.error.unwrap().contains("loading query plan"));
    }

    #[tokio::test]
    async fn pipeline_runs_end_to_end() {
        let provider = FixtureProvider::new("fixture").with_search(
            "cosy hotel Reykjavik, Iceland",
            None,
            json!({"status": "OK", "results": [
                {
                    "place_id": "r1",
                    "name": "Hraun Lodge",
                    "formatted_address": "Laugavegur 1, 101 Reykjavik, Iceland",
                    "rating": 4.6,
                    "user_ratings_total": 300
                },
                {
                    "place_id": "r2",
                    "name": "Nordic Nest",
                    "formatted_address": "Skolavordustigur 9, 101 Reykjavik, Iceland",
                    "rating": 4.2,
                    "user_ratings_total": 40
                }
            ]}),
        );
        let memory = Arc::new(MemoryVenueStore::new());
        let store: Arc<dyn VenueStore> = memory.clone();
        let runner = JobRunner::new(store, config())
            .unwrap()
            .with_providers(vec![Arc::new(provider)])
            .with_plan(plan());

        let crawl = runner
            .city_crawl(CrawlRequest {
                city: Some("Reykjavik".into()),
                country: Some("Iceland".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(crawl.is_completed());
        assert_eq!(crawl.summary.unwrap().upserted, 2);

        let extra = venue("reykjavik-extra", "Extra", Some("Reykjavik"), Some("Iceland"));
        seed_scored(memory.as_ref(), extra, 8.0).await;

        let normalize = runner.normalize().await;
        assert_eq!(normalize.summary.unwrap().scored, 3);

        let featured = runner.curate_featured().await;
        assert!(featured.is_completed());
        let city = runner.curate_city(Some("Reykjavik")).await.unwrap();
        assert!(city.is_completed());

        let reslug = runner.reslug().await;
        assert_eq!(reslug.summary.unwrap().renamed, 0);
    }
}
