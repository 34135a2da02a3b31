use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cosy_core::CandidateListing;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::places::{parse_places_details, parse_places_search};
use crate::{ProviderError, SearchPage, SearchProvider};

pub const FIXTURE_PROVIDER: &str = "fixture";
const FIXTURE_PHOTO_BASE: &str = "fixture://photos";

/// Recorded search and details responses in the places JSON shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureCatalog {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub searches: Vec<FixtureSearch>,
    #[serde(default)]
    pub details: HashMap<String, JsonValue>,
    #[serde(default)]
    pub failing_details: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSearch {
    pub query: String,
    #[serde(default)]
    pub token: Option<String>,
    pub body: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureCall {
    Search { query: String, token: Option<String> },
    Details { provider_id: String },
}

/// Offline provider answering from recorded responses.
///
/// Unknown queries return an empty page; unknown continuation tokens are
/// rejected the way a live provider rejects a stale token. Details fall back
/// to the matching search result when no details body was recorded.
#[derive(Debug, Default)]
pub struct FixtureProvider {
    name: String,
    searches: HashMap<(String, Option<String>), JsonValue>,
    details: HashMap<String, JsonValue>,
    failing_details: HashSet<String>,
    calls: Mutex<Vec<FixtureCall>>,
}

impl FixtureProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_catalog(catalog: FixtureCatalog) -> Self {
        let mut provider = Self::new(catalog.provider.unwrap_or_else(|| FIXTURE_PROVIDER.to_string()));
        for search in catalog.searches {
            provider.searches.insert((search.query, search.token), search.body);
        }
        provider.details = catalog.details;
        provider.failing_details = catalog.failing_details.into_iter().collect();
        provider
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let catalog: FixtureCatalog =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_catalog(catalog))
    }

    pub fn with_search(mut self, query: impl Into<String>, token: Option<&str>, body: JsonValue) -> Self {
        self.searches
            .insert((query.into(), token.map(ToString::to_string)), body);
        self
    }

    pub fn with_details(mut self, provider_id: impl Into<String>, body: JsonValue) -> Self {
        self.details.insert(provider_id.into(), body);
        self
    }

    pub fn with_failing_details(mut self, provider_id: impl Into<String>) -> Self {
        self.failing_details.insert(provider_id.into());
        self
    }

    pub fn calls(&self) -> Vec<FixtureCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn search_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, FixtureCall::Search { .. }))
            .count()
    }

    fn record(&self, call: FixtureCall) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    fn search_result_for(&self, provider_id: &str) -> Option<&JsonValue> {
        self.searches
            .values()
            .filter_map(|body| body.get("results").and_then(JsonValue::as_array))
            .flatten()
            .find(|item| item.get("place_id").and_then(JsonValue::as_str) == Some(provider_id))
    }
}

#[async_trait]
impl SearchProvider for FixtureProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn text_search(&self, query: &str, page_token: Option<&str>) -> Result<SearchPage, ProviderError> {
        self.record(FixtureCall::Search {
            query: query.to_string(),
            token: page_token.map(ToString::to_string),
        });
        let key = (query.to_string(), page_token.map(ToString::to_string));
        match (self.searches.get(&key), page_token) {
            (Some(body), _) => parse_places_search(&self.name, body, FIXTURE_PHOTO_BASE),
            (None, None) => Ok(SearchPage::default()),
            (None, Some(_)) => Err(ProviderError::Status {
                provider: self.name.clone(),
                status: "INVALID_REQUEST".to_string(),
            }),
        }
    }

    async fn details(&self, provider_id: &str) -> Result<CandidateListing, ProviderError> {
        self.record(FixtureCall::Details {
            provider_id: provider_id.to_string(),
        });
        if self.failing_details.contains(provider_id) {
            return Err(ProviderError::RequestFailed {
                provider: self.name.clone(),
                message: format!("recorded failure for {provider_id}"),
            });
        }
        if let Some(body) = self.details.get(provider_id) {
            return parse_places_details(&self.name, body, FIXTURE_PHOTO_BASE);
        }
        match self.search_result_for(provider_id) {
            Some(result) => parse_places_details(
                &self.name,
                &json!({"status": "OK", "result": result}),
                FIXTURE_PHOTO_BASE,
            ),
            None => Err(ProviderError::Status {
                provider: self.name.clone(),
                status: "NOT_FOUND".to_string(),
            }),
        }
    }
}
