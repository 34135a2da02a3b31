use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::jobs::{CrawlRequest, JobRunner};

/// Cron jobs for crawl, normalize and curate, when the scheduler is enabled.
/// The caller starts the returned scheduler.
pub async fn maybe_build_scheduler(runner: Arc<JobRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let crawl_cron = runner.config().crawl_cron.clone();
    let crawl_runner = Arc::clone(&runner);
    let job = Job::new_async(crawl_cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&crawl_runner);
        Box::pin(async move {
            match runner.crawl(CrawlRequest::default()).await {
                Ok(outcome) => info!(status = ?outcome.status, "scheduled crawl finished"),
                Err(err) => warn!(error = %err, "scheduled crawl not started"),
            }
        })
    })
    .with_context(|| format!("creating crawl job for cron {crawl_cron}"))?;
    sched.add(job).await.context("adding crawl job")?;

    let normalize_cron = runner.config().normalize_cron.clone();
    let normalize_runner = Arc::clone(&runner);
    let job = Job::new_async(normalize_cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&normalize_runner);
        Box::pin(async move {
            let outcome = runner.normalize().await;
            info!(status = ?outcome.status, "scheduled normalization finished");
        })
    })
    .with_context(|| format!("creating normalize job for cron {normalize_cron}"))?;
    sched.add(job).await.context("adding normalize job")?;

    let curate_cron = runner.config().curate_cron.clone();
    let curate_runner = Arc::clone(&runner);
    let job = Job::new_async(curate_cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&curate_runner);
        Box::pin(async move {
            let featured = runner.curate_featured().await;
            let cities = runner.curate_all_cities().await;
            info!(
                featured = ?featured.status,
                cities = ?cities.status,
                "scheduled curation finished"
            );
        })
    })
    .with_context(|| format!("creating curate job for cron {curate_cron}"))?;
    sched.add(job).await.context("adding curate job")?;

    Ok(Some(sched))
}
