//! Search provider contracts and the places, hotel-vendor and fixture providers.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cosy_core::CandidateListing;
use cosy_storage::{FetchError, HttpFetcher};
use thiserror::Error;

mod fixture;
mod hotel;
pub mod parse;
mod places;

pub use fixture::{FixtureCall, FixtureCatalog, FixtureProvider, FixtureSearch, FIXTURE_PROVIDER};
pub use hotel::{
    details_url, parse_hotel_details, parse_hotel_search, strip_html, HotelApiProvider, HOTEL_API_PROVIDER,
};
pub use places::{
    parse_places_details, parse_places_search, DetailsCache, PlacesProvider, DEFAULT_PLACES_BASE_URL,
    PLACES_PROVIDER,
};

/// One page of search results plus the opaque token for the next page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub candidates: Vec<CandidateListing>,
    pub next_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("{provider} request failed: {message}")]
    RequestFailed { provider: String, message: String },
    #[error("{provider} returned status {status}")]
    Status { provider: String, status: String },
    #[error("{provider} response malformed: {message}")]
    Malformed { provider: String, message: String },
}

pub(crate) fn provider_error_from_fetch(provider: &str, err: FetchError) -> ProviderError {
    let provider = provider.to_string();
    match err {
        FetchError::HttpStatus { status, .. } => ProviderError::Status {
            provider,
            status: format!("HTTP {status}"),
        },
        FetchError::Decode { message, .. } => ProviderError::Malformed { provider, message },
        FetchError::Request(e) => ProviderError::RequestFailed {
            provider,
            message: e.without_url().to_string(),
        },
    }
}

/// External provider boundary: paginated text search plus a details lookup.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn text_search(&self, query: &str, page_token: Option<&str>) -> Result<SearchPage, ProviderError>;

    async fn details(&self, provider_id: &str) -> Result<CandidateListing, ProviderError>;
}

/// Credentials and endpoints needed to build providers by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub places_api_key: Option<String>,
    pub places_base_url: Option<String>,
    pub hotel_api_key: Option<String>,
    pub hotel_base_url: Option<String>,
    pub fixture_path: Option<PathBuf>,
    pub page_size: u32,
}

pub fn provider_for(
    name: &str,
    settings: &ProviderSettings,
    http: &Arc<HttpFetcher>,
    details_cache: &Arc<DetailsCache>,
) -> Result<Box<dyn SearchProvider>, ProviderError> {
    match name {
        PLACES_PROVIDER => {
            let key = require(&settings.places_api_key, "COSY_PLACES_API_KEY")?;
            let base_url = settings
                .places_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_PLACES_BASE_URL.to_string());
            Ok(Box::new(PlacesProvider::new(
                Arc::clone(http),
                key,
                base_url,
                Arc::clone(details_cache),
            )))
        }
        HOTEL_API_PROVIDER => {
            let key = require(&settings.hotel_api_key, "COSY_HOTEL_API_KEY")?;
            let base_url = require(&settings.hotel_base_url, "COSY_HOTEL_BASE_URL")?;
            Ok(Box::new(HotelApiProvider::new(
                Arc::clone(http),
                key,
                base_url,
                settings.page_size,
            )))
        }
        FIXTURE_PROVIDER => {
            let path = settings
                .fixture_path
                .as_ref()
                .ok_or_else(|| ProviderError::ConfigurationMissing("COSY_FIXTURE_PATH".to_string()))?;
            let provider = FixtureProvider::load(path).map_err(|e| ProviderError::Malformed {
                provider: FIXTURE_PROVIDER.to_string(),
                message: format!("{e:#}"),
            })?;
            Ok(Box::new(provider))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

fn require(value: &Option<String>, var: &str) -> Result<String, ProviderError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| ProviderError::ConfigurationMissing(var.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosy_storage::HttpClientConfig;
    use std::time::Duration;

    fn deps() -> (Arc<HttpFetcher>, Arc<DetailsCache>) {
        (
            Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            Arc::new(DetailsCache::new(16, Duration::from_secs(60))),
        )
    }

    #[test]
    fn missing_credentials_name_the_variable() {
        let (http, cache) = deps();
        let err = provider_for("places", &ProviderSettings::default(), &http, &cache)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "configuration missing: COSY_PLACES_API_KEY");

        let settings = ProviderSettings {
            hotel_api_key: Some("k".into()),
            ..Default::default()
        };
        let err = provider_for("hotel", &settings, &http, &cache).err().unwrap();
        assert_eq!(err.to_string(), "configuration missing: COSY_HOTEL_BASE_URL");
    }

    #[test]
    fn configured_providers_report_their_name() {
        let (http, cache) = deps();
        let settings = ProviderSettings {
            places_api_key: Some("secret".into()),
            ..Default::default()
        };
        let provider = provider_for("places", &settings, &http, &cache).unwrap();
        assert_eq!(provider.provider_name(), "places");
        assert!(matches!(
            provider_for("yelp", &settings, &http, &cache),
            Err(ProviderError::UnknownProvider(_))
        ));
    }
}
