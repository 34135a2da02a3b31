use std::sync::Arc;

use async_trait::async_trait;
use cosy_core::{AbsenceReason, CandidateListing, Field, RatingScale};
use cosy_storage::HttpFetcher;
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use url::Url;

use crate::parse::JsonRecord;
use crate::{provider_error_from_fetch, ProviderError, SearchPage, SearchProvider};

pub const HOTEL_API_PROVIDER: &str = "hotel";

/// Hotel-content vendor API. Pages are addressed by offset; the continuation
/// token is the next offset rendered as a string.
pub struct HotelApiProvider {
    http: Arc<HttpFetcher>,
    api_key: String,
    base_url: String,
    page_size: u32,
}

impl HotelApiProvider {
    pub fn new(
        http: Arc<HttpFetcher>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
        }
    }

    fn headers(&self) -> [(&'static str, String); 2] {
        [("x-api-key", self.api_key.clone()), ("accept", "application/json".to_string())]
    }
}

#[async_trait]
impl SearchProvider for HotelApiProvider {
    fn provider_name(&self) -> &str {
        HOTEL_API_PROVIDER
    }

    async fn text_search(&self, query: &str, page_token: Option<&str>) -> Result<SearchPage, ProviderError> {
        let offset = match page_token {
            Some(token) => token.parse::<u64>().map_err(|_| ProviderError::Malformed {
                provider: HOTEL_API_PROVIDER.to_string(),
                message: format!("continuation token `{token}` is not an offset"),
            })?,
            None => 0,
        };
        let url = format!("{}/hotels/search", self.base_url);
        let params = [
            ("query", query.to_string()),
            ("offset", offset.to_string()),
            ("limit", self.page_size.to_string()),
        ];
        let body = self
            .http
            .get_json(HOTEL_API_PROVIDER, &url, &params, &self.headers())
            .await
            .map_err(|e| provider_error_from_fetch(HOTEL_API_PROVIDER, e))?;
        Ok(parse_hotel_search(&body, offset))
    }

    async fn details(&self, provider_id: &str) -> Result<CandidateListing, ProviderError> {
        let url = details_url(&self.base_url, provider_id)?;
        let body = self
            .http
            .get_json(HOTEL_API_PROVIDER, url.as_str(), &[], &self.headers())
            .await
            .map_err(|e| provider_error_from_fetch(HOTEL_API_PROVIDER, e))?;
        parse_hotel_details(&body)
    }
}

/// `{base}/hotels/{id}` with the id percent-encoded as a single path segment.
pub fn details_url(base_url: &str, provider_id: &str) -> Result<Url, ProviderError> {
    let malformed = |message: String| ProviderError::Malformed {
        provider: HOTEL_API_PROVIDER.to_string(),
        message,
    };
    let mut url = Url::parse(base_url).map_err(|e| malformed(format!("base url {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| malformed(format!("base url {base_url} cannot carry a path")))?
        .pop_if_empty()
        .push("hotels")
        .push(provider_id);
    Ok(url)
}

pub fn parse_hotel_search(body: &JsonValue, offset: u64) -> SearchPage {
    let root = JsonRecord::new(body, "");
    let Some(items) = root.items("/data") else {
        warn!(provider = HOTEL_API_PROVIDER, "search response has no data array; treating page as empty");
        return SearchPage::default();
    };

    let returned = items.len() as u64;
    let mut candidates = Vec::with_capacity(items.len());
    for (pointer, item) in items {
        match hotel_from_json(&JsonRecord::new(item, &pointer)) {
            Some(candidate) => candidates.push(candidate),
            None => debug!(pointer = %pointer, "hotel without a name skipped"),
        }
    }

    let next_offset = offset + returned;
    let total = root.count("/meta/total").value.map(u64::from);
    let next_token = match total {
        Some(total) if returned > 0 && next_offset < total => Some(next_offset.to_string()),
        _ => None,
    };
    SearchPage {
        candidates,
        next_token,
    }
}

pub fn parse_hotel_details(body: &JsonValue) -> Result<CandidateListing, ProviderError> {
    let Some(data) = body.get("data").filter(|v| v.is_object()) else {
        return Err(ProviderError::Malformed {
            provider: HOTEL_API_PROVIDER.to_string(),
            message: "details response has no data object".to_string(),
        });
    };
    let record = JsonRecord::new(data, "/data");
    Ok(hotel_from_json(&record)
        .unwrap_or_else(|| CandidateListing::new(HOTEL_API_PROVIDER, "", RatingScale::TenPoint)))
}

fn hotel_from_json(record: &JsonRecord<'_>) -> Option<CandidateListing> {
    let name = record.string("/name").into_value()?;
    let mut listing = CandidateListing::new(HOTEL_API_PROVIDER, name, RatingScale::TenPoint);
    listing.provider_id = record.identifier("/id");
    listing.address = record.string("/address/line");
    listing.city = record.string("/address/city");
    listing.country = record.string("/address/country");
    listing.rating = record.number("/review/score", 0.0, 10.0);
    listing.review_count = record.count("/review/count");
    listing.summary = html_text(record, "/description");
    listing.website = record.string("/website");
    listing.coordinates = record.geo("/location/latitude", "/location/longitude");
    let mut categories = record.strings("/categories").into_value().unwrap_or_default();
    if let Some(kind) = record.string("/property_type").into_value() {
        categories.push(kind);
    }
    listing.categories = categories;
    listing.rooms = record.integer("/rooms");
    listing.image_url = record.string("/images/0/url");
    Some(listing)
}

fn html_text(record: &JsonRecord<'_>, rel: &str) -> Field<String> {
    let raw = record.string(rel);
    let Some(html) = raw.value() else {
        return raw;
    };
    let text = strip_html(html);
    if text.is_empty() {
        record.absent(rel, AbsenceReason::Empty)
    } else {
        Field::present(text)
    }
}

/// Visible text of an HTML fragment with whitespace collapsed.
pub fn strip_html(fragment: &str) -> String {
    let document = Html::parse_fragment(fragment);
    document
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn html_descriptions_are_reduced_to_text() {
        assert_eq!(
            strip_html("<p>Quiet <b>boutique</b> rooms,</p>\n<ul><li>wood burner</li></ul>"),
            "Quiet boutique rooms, wood burner"
        );
        assert_eq!(strip_html("<br/>"), "");
    }

    #[test]
    fn search_offsets_advance_until_total() {
        let body = json!({
            "data": [
                {"id": 11, "name": "Hotel Alpenrose", "review": {"score": 8.0, "count": 410}, "rooms": 24,
                 "address": {"line": "Dorfstrasse 3", "city": "Zermatt", "country": "Switzerland"},
                 "description": "<p>Snug chalet with a <em>fireplace</em>.</p>",
                 "property_type": "Chalet"},
                {"id": 12, "name": "Seehof"}
            ],
            "meta": {"total": 5}
        });
        let page = parse_hotel_search(&body, 2);
        assert_eq!(page.next_token.as_deref(), Some("4"));
        let alpenrose = &page.candidates[0];
        assert_eq!(alpenrose.provider_id.as_deref(), Some("11"));
        assert_eq!(alpenrose.rating_ten_point(), Some(8.0));
        assert_eq!(alpenrose.rooms.value, Some(24));
        assert_eq!(alpenrose.summary.as_deref(), Some("Snug chalet with a fireplace ."));
        assert_eq!(alpenrose.categories, vec!["Chalet".to_string()]);

        let last = parse_hotel_search(&body, 3);
        assert!(last.next_token.is_none());
    }

    #[test]
    fn missing_data_array_is_an_empty_page() {
        let page = parse_hotel_search(&json!({"error": "nope"}), 0);
        assert!(page.candidates.is_empty());
        assert!(page.next_token.is_none());
    }

    #[test]
    fn details_url_encodes_the_id_as_one_segment() {
        let url = details_url("https://api.example/v2", "a/b c?x").unwrap();
        assert_eq!(url.as_str(), "https://api.example/v2/hotels/a%2Fb%20c%3Fx");
        assert_eq!(
            details_url("https://api.example/v2/", "11").unwrap().as_str(),
            "https://api.example/v2/hotels/11"
        );
        assert!(details_url("not a url", "11").is_err());
    }

    #[test]
    fn details_require_a_data_object() {
        assert!(parse_hotel_details(&json!({"data": []})).is_err());
        let listing = parse_hotel_details(&json!({"data": {"id": "x1", "name": "Villa"}})).unwrap();
        assert_eq!(listing.provider_id.as_deref(), Some("x1"));
    }
}
