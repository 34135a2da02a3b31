//! Axum trigger surface for the sync jobs and read-only views of curated sets.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cosy_core::{CurationFamily, JobOutcome};
use cosy_storage::{PgVenueStore, StoreError};
use cosy_sync::normalize::scope_key;
use cosy_sync::{maybe_build_scheduler, CrawlRequest, JobError, JobRunner, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cosy-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<JobRunner>,
}

impl AppState {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CityQuery {
    city: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/jobs/crawl", get(schedule_crawl).post(run_crawl))
        .route("/jobs/city-crawl", get(schedule_city_crawl).post(run_city_crawl))
        .route("/jobs/normalize", get(schedule_normalize).post(run_normalize))
        .route("/jobs/curate/featured", get(schedule_curate_featured).post(run_curate_featured))
        .route("/jobs/curate/city", get(schedule_curate_city).post(run_curate_city))
        .route("/jobs/reslug", get(schedule_reslug).post(run_reslug))
        .route("/featured", get(featured_handler))
        .route("/guides/{city}", get(guide_handler))
        .route("/redirects/{slug}", get(redirect_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("COSY_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let store = PgVenueStore::connect(&config.database_url).await?;
    let runner = Arc::new(JobRunner::new(Arc::new(store), config)?);

    let scheduler = maybe_build_scheduler(Arc::clone(&runner)).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!("scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(runner))).await?;
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn job_error(err: &JobError) -> Response {
    let status = match err {
        JobError::MissingParameter(_) => StatusCode::BAD_REQUEST,
        JobError::ConfigurationMissing(_) | JobError::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, err.to_string())
}

fn store_error(err: &StoreError) -> Response {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn bad_query(rejection: QueryRejection) -> Response {
    error_body(StatusCode::BAD_REQUEST, rejection.body_text())
}

fn outcome<T: Serialize>(outcome: JobOutcome<T>) -> Response {
    let status = if outcome.is_completed() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(outcome)).into_response()
}

fn job_result<T: Serialize>(result: Result<JobOutcome<T>, JobError>) -> Response {
    match result {
        Ok(done) => outcome(done),
        Err(err) => job_error(&err),
    }
}

/// Acknowledge with `{"scheduled": true, "job": ..}` plus the request parameters.
fn accepted(job: &str, params: impl Serialize) -> Response {
    let mut body = json!({ "scheduled": true, "job": job });
    if let (Some(body), Ok(JsonValue::Object(params))) = (body.as_object_mut(), serde_json::to_value(params)) {
        for (key, value) in params.into_iter().filter(|(_, v)| !v.is_null()) {
            body.insert(key, value);
        }
    }
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

fn spawn_job<T, F>(job: &'static str, work: F)
where
    T: Send + 'static,
    F: Future<Output = Result<JobOutcome<T>, JobError>> + Send + 'static,
{
    tokio::spawn(async move {
        match work.await {
            Ok(done) => info!(job, status = ?done.status, "background job finished"),
            Err(err) => warn!(job, error = %err, "background job not started"),
        }
    });
}

async fn healthz_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn schedule_crawl(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CrawlRequest>, QueryRejection>,
) -> Response {
    let Query(request) = match query {
        Ok(q) => q,
        Err(rejection) => return bad_query(rejection),
    };
    if let Err(err) = state.runner.check_crawl_config() {
        return job_error(&err);
    }
    let response = accepted("crawl", &request);
    let runner = Arc::clone(&state.runner);
    spawn_job("crawl", async move { runner.crawl(request).await });
    response
}

async fn run_crawl(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CrawlRequest>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(request)) => job_result(state.runner.crawl(request).await),
        Err(rejection) => bad_query(rejection),
    }
}

async fn schedule_city_crawl(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CrawlRequest>, QueryRejection>,
) -> Response {
    let Query(request) = match query {
        Ok(q) => q,
        Err(rejection) => return bad_query(rejection),
    };
    if let Err(err) = request
        .required_city()
        .map(|_| ())
        .and_then(|_| state.runner.check_crawl_config())
    {
        return job_error(&err);
    }
    let response = accepted("city-crawl", &request);
    let runner = Arc::clone(&state.runner);
    spawn_job("city-crawl", async move { runner.city_crawl(request).await });
    response
}

async fn run_city_crawl(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CrawlRequest>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(request)) => job_result(state.runner.city_crawl(request).await),
        Err(rejection) => bad_query(rejection),
    }
}

async fn schedule_normalize(State(state): State<Arc<AppState>>) -> Response {
    let runner = Arc::clone(&state.runner);
    spawn_job("normalize", async move { Ok::<_, JobError>(runner.normalize().await) });
    accepted("normalize", json!({}))
}

async fn run_normalize(State(state): State<Arc<AppState>>) -> Response {
    outcome(state.runner.normalize().await)
}

async fn schedule_curate_featured(State(state): State<Arc<AppState>>) -> Response {
    let runner = Arc::clone(&state.runner);
    spawn_job("curate-featured", async move { Ok::<_, JobError>(runner.curate_featured().await) });
    accepted("curate-featured", json!({}))
}

async fn run_curate_featured(State(state): State<Arc<AppState>>) -> Response {
    outcome(state.runner.curate_featured().await)
}

async fn schedule_curate_city(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CityQuery>, QueryRejection>,
) -> Response {
    let Query(params) = match query {
        Ok(q) => q,
        Err(rejection) => return bad_query(rejection),
    };
    let Some(city) = params.city.clone().filter(|c| !c.trim().is_empty()) else {
        return job_error(&JobError::MissingParameter("city"));
    };
    let runner = Arc::clone(&state.runner);
    spawn_job("curate-city", async move { runner.curate_city(Some(&city)).await });
    accepted("curate-city", &params)
}

async fn run_curate_city(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CityQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(params)) => job_result(state.runner.curate_city(params.city.as_deref()).await),
        Err(rejection) => bad_query(rejection),
    }
}

async fn schedule_reslug(State(state): State<Arc<AppState>>) -> Response {
    let runner = Arc::clone(&state.runner);
    spawn_job("reslug", async move { Ok::<_, JobError>(runner.reslug().await) });
    accepted("reslug", json!({}))
}

async fn run_reslug(State(state): State<Arc<AppState>>) -> Response {
    outcome(state.runner.reslug().await)
}

async fn featured_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.store().slots(&CurationFamily::Featured).await {
        Ok(slots) => Json(slots).into_response(),
        Err(err) => store_error(&err),
    }
}

async fn guide_handler(State(state): State<Arc<AppState>>, Path(city): Path<String>) -> Response {
    let family = CurationFamily::City(scope_key(&city));
    match state.runner.store().slots(&family).await {
        Ok(slots) => Json(slots).into_response(),
        Err(err) => store_error(&err),
    }
}

async fn redirect_handler(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> Response {
    match state.runner.store().redirect_for(&slug).await {
        Ok(Some(new_slug)) => Json(json!({ "old_slug": slug, "new_slug": new_slug })).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("no redirect for {slug}")),
        Err(err) => store_error(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cosy_adapters::{FixtureProvider, SearchProvider};
    use cosy_storage::{MemoryVenueStore, VenueStore};
    use cosy_sync::QueryPlan;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn runner(store: Arc<MemoryVenueStore>, providers: Option<Vec<Arc<dyn SearchProvider>>>) -> Arc<JobRunner> {
        let mut config = SyncConfig::from_env();
        config.providers = vec!["places".to_string()];
        config.places_api_key = None;
        config.page_delay_ms = 0;
        let store: Arc<dyn VenueStore> = store;
        let plan = QueryPlan::from_yaml_str("variants: [cosy hotel]").unwrap();
        let runner = JobRunner::new(store, config).unwrap().with_plan(plan);
        Arc::new(match providers {
            Some(providers) => runner.with_providers(providers),
            None => runner,
        })
    }

    fn reykjavik() -> Vec<Arc<dyn SearchProvider>> {
        let provider = FixtureProvider::new("fixture").with_search(
            "cosy hotel Reykjavik, Iceland",
            None,
            json!({"status": "OK", "results": [
                {
                    "place_id": "r1",
                    "name": "Hraun Lodge",
                    "formatted_address": "Laugavegur 1, 101 Reykjavik, Iceland",
                    "rating": 4.8,
                    "user_ratings_total": 300,
                    "types": ["lodging", "spa"]
                },
                {
                    "place_id": "r2",
                    "name": "Nordic Nest",
                    "formatted_address": "Skolavordustigur 9, 101 Reykjavik, Iceland",
                    "rating": 4.6,
                    "user_ratings_total": 40
                }
            ]}),
        );
        vec![Arc::new(provider)]
    }

    async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(JsonValue::Null))
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = app(AppState::new(runner(Arc::new(MemoryVenueStore::new()), None)));
        let (status, body) = send(&app, "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_credentials_name_the_variable() {
        let app = app(AppState::new(runner(Arc::new(MemoryVenueStore::new()), None)));
        for method in ["GET", "POST"] {
            let (status, body) = send(&app, method, "/jobs/crawl").await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body["error"], "configuration missing: COSY_PLACES_API_KEY");
        }
    }

    #[tokio::test]
    async fn city_jobs_without_a_city_are_client_errors() {
        let app = app(AppState::new(runner(Arc::new(MemoryVenueStore::new()), Some(reykjavik()))));
        for (method, uri) in [
            ("GET", "/jobs/city-crawl"),
            ("POST", "/jobs/city-crawl?country=Iceland"),
            ("GET", "/jobs/curate/city"),
            ("POST", "/jobs/curate/city"),
        ] {
            let (status, body) = send(&app, method, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{method} {uri}");
            assert_eq!(body["error"], "missing required parameter: city");
        }
        let (status, _) = send(&app, "POST", "/jobs/crawl?pages=many").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_triggers_acknowledge_with_params() {
        let app = app(AppState::new(runner(Arc::new(MemoryVenueStore::new()), Some(reykjavik()))));
        let (status, body) = send(&app, "GET", "/jobs/city-crawl?city=Reykjavik&country=Iceland&force=true").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["scheduled"], true);
        assert_eq!(body["job"], "city-crawl");
        assert_eq!(body["city"], "Reykjavik");
        assert_eq!(body["force"], true);

        let (status, body) = send(&app, "GET", "/jobs/normalize").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["job"], "normalize");
    }

    #[tokio::test]
    async fn post_triggers_run_the_pipeline() {
        let store = Arc::new(MemoryVenueStore::new());
        let app = app(AppState::new(runner(Arc::clone(&store), Some(reykjavik()))));

        let (status, body) = send(&app, "POST", "/jobs/city-crawl?city=Reykjavik&country=Iceland").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["summary"]["upserted"], 2);

        let (status, body) = send(&app, "POST", "/jobs/normalize").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["scored"], 2);

        let (status, _) = send(&app, "POST", "/jobs/curate/featured").await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "POST", "/jobs/curate/city?city=Reykjavik").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"], "curate-city");

        let (status, featured) = send(&app, "GET", "/featured").await;
        assert_eq!(status, StatusCode::OK);
        assert!(featured.is_array());
        let (status, guide) = send(&app, "GET", "/guides/Reykjavik").await;
        assert_eq!(status, StatusCode::OK);
        assert!(guide.is_array());
    }

    #[tokio::test]
    async fn redirects_resolve_renamed_slugs() {
        let store = Arc::new(MemoryVenueStore::new());
        let app = app(AppState::new(runner(Arc::clone(&store), Some(reykjavik()))));
        let (status, _) = send(&app, "POST", "/jobs/city-crawl?city=Reykjavik&country=Iceland").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "POST", "/jobs/reslug").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["renamed"], 0);

        let (status, _) = send(&app, "GET", "/redirects/reykjavik-hraun-lodge").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        store
            .rename_slug("reykjavik-hraun-lodge", "iceland-reykjavik-hraun-lodge")
            .await
            .unwrap();
        let (status, body) = send(&app, "GET", "/redirects/reykjavik-hraun-lodge").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["new_slug"], "iceland-reykjavik-hraun-lodge");
    }
}
