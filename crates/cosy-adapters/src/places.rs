use std::sync::Arc;

use async_trait::async_trait;
use cosy_core::{AbsenceReason, CandidateListing, Field, RatingScale};
use cosy_storage::{HttpFetcher, TtlCache};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::parse::JsonRecord;
use crate::{provider_error_from_fetch, ProviderError, SearchPage, SearchProvider};

pub const PLACES_PROVIDER: &str = "places";
pub const DEFAULT_PLACES_BASE_URL: &str = "https://maps.googleapis.com/maps/api/place";

const DETAIL_FIELDS: &str = "place_id,name,formatted_address,address_components,rating,\
user_ratings_total,website,editorial_summary,types,geometry,photos";

pub type DetailsCache = TtlCache<String, CandidateListing>;

/// Places/geocoding provider speaking the text-search + place-details JSON shape.
pub struct PlacesProvider {
    http: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
    details_cache: Arc<DetailsCache>,
}

impl PlacesProvider {
    pub fn new(
        http: Arc<HttpFetcher>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        details_cache: Arc<DetailsCache>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            details_cache,
        }
    }
}

#[async_trait]
impl SearchProvider for PlacesProvider {
    fn provider_name(&self) -> &str {
        PLACES_PROVIDER
    }

    async fn text_search(&self, query: &str, page_token: Option<&str>) -> Result<SearchPage, ProviderError> {
        let url = format!("{}/textsearch/json", self.base_url);
        let params = match page_token {
            Some(token) => vec![("pagetoken", token.to_string()), ("key", self.api_key.clone())],
            None => vec![
                ("query", query.to_string()),
                ("type", "lodging".to_string()),
                ("key", self.api_key.clone()),
            ],
        };
        let body = self
            .http
            .get_json(PLACES_PROVIDER, &url, &params, &[])
            .await
            .map_err(|e| provider_error_from_fetch(PLACES_PROVIDER, e))?;
        parse_places_search(PLACES_PROVIDER, &body, &self.base_url)
    }

    async fn details(&self, provider_id: &str) -> Result<CandidateListing, ProviderError> {
        if let Some(hit) = self.details_cache.get(&provider_id.to_string()) {
            debug!(provider_id, "place details served from cache");
            return Ok(hit);
        }
        let url = format!("{}/details/json", self.base_url);
        let params = [
            ("place_id", provider_id.to_string()),
            ("fields", DETAIL_FIELDS.to_string()),
            ("key", self.api_key.clone()),
        ];
        let body = self
            .http
            .get_json(PLACES_PROVIDER, &url, &params, &[])
            .await
            .map_err(|e| provider_error_from_fetch(PLACES_PROVIDER, e))?;
        let listing = parse_places_details(PLACES_PROVIDER, &body, &self.base_url)?;
        self.details_cache.insert(provider_id.to_string(), listing.clone());
        Ok(listing)
    }
}

fn check_status(provider: &str, body: &JsonValue) -> Result<(), ProviderError> {
    match body.get("status").and_then(JsonValue::as_str) {
        None | Some("OK") | Some("ZERO_RESULTS") => Ok(()),
        Some(other) => Err(ProviderError::Status {
            provider: provider.to_string(),
            status: other.to_string(),
        }),
    }
}

/// Parse one text-search page. A page whose `results` is not an array is
/// treated as empty rather than failing the query.
pub fn parse_places_search(provider: &str, body: &JsonValue, photo_base: &str) -> Result<SearchPage, ProviderError> {
    check_status(provider, body)?;
    let root = JsonRecord::new(body, "");
    let next_token = root.string("/next_page_token").into_value();

    let Some(items) = root.items("/results") else {
        if body.get("results").is_some() {
            warn!(provider, "search results are not an array; treating page as empty");
        }
        return Ok(SearchPage {
            candidates: Vec::new(),
            next_token,
        });
    };

    let mut candidates = Vec::with_capacity(items.len());
    for (pointer, item) in items {
        let record = JsonRecord::new(item, &pointer);
        match place_from_json(provider, &record, photo_base) {
            Some(candidate) => candidates.push(candidate),
            None => debug!(provider, pointer = %pointer, "search result without a name skipped"),
        }
    }
    Ok(SearchPage {
        candidates,
        next_token,
    })
}

pub fn parse_places_details(
    provider: &str,
    body: &JsonValue,
    photo_base: &str,
) -> Result<CandidateListing, ProviderError> {
    check_status(provider, body)?;
    let Some(result) = body.get("result").filter(|v| v.is_object()) else {
        return Err(ProviderError::Malformed {
            provider: provider.to_string(),
            message: "details response has no result object".to_string(),
        });
    };
    let record = JsonRecord::new(result, "/result");
    let mut listing = place_from_json(provider, &record, photo_base)
        .unwrap_or_else(|| CandidateListing::new(provider, "", RatingScale::FivePoint));
    if !listing.provider_id.is_present() {
        listing.provider_id = record.string("/place_id");
    }
    Ok(listing)
}

fn place_from_json(provider: &str, record: &JsonRecord<'_>, photo_base: &str) -> Option<CandidateListing> {
    let name = record.string("/name").into_value()?;
    let mut listing = CandidateListing::new(provider, name, RatingScale::FivePoint);
    listing.provider_id = record.string("/place_id");
    listing.address = record.string("/formatted_address");
    listing.city = address_component(record, &["locality", "postal_town"]);
    listing.country = address_component(record, &["country"]);
    listing.rating = record.number("/rating", 0.0, 5.0);
    listing.review_count = record.count("/user_ratings_total");
    listing.summary = record.string("/editorial_summary/overview");
    listing.website = record.string("/website");
    listing.coordinates = record.geo("/geometry/location/lat", "/geometry/location/lng");
    listing.categories = record.strings("/types").into_value().unwrap_or_default();
    listing.rooms = Field::absent("/rooms", AbsenceReason::Missing);
    listing.image_url = record
        .string("/photos/0/photo_reference")
        .map(|reference| format!("{photo_base}/photo?maxwidth=800&photo_reference={reference}"));
    Some(listing)
}

/// Long name of the first address component carrying one of `types`.
fn address_component(record: &JsonRecord<'_>, types: &[&str]) -> Field<String> {
    let Some(components) = record.items("/address_components") else {
        let reason = match record.value().get("address_components") {
            None | Some(JsonValue::Null) => AbsenceReason::Missing,
            Some(_) => AbsenceReason::WrongType,
        };
        return record.absent("/address_components", reason);
    };
    for (pointer, component) in components {
        let component = JsonRecord::new(component, &pointer);
        let tags = component.strings("/types").into_value().unwrap_or_default();
        if tags.iter().any(|t| types.contains(&t.as_str())) {
            return component.string("/long_name");
        }
    }
    record.absent("/address_components", AbsenceReason::Missing)
}
