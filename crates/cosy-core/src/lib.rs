//! Core domain model for the cosy venue pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};
use uuid::Uuid;

/// Why an external field could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceReason {
    Missing,
    WrongType,
    Empty,
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Absence {
    pub pointer: String,
    pub reason: AbsenceReason,
}

/// Parsed external field: either a value, or the reason it is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub absence: Option<Absence>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self {
            value: None,
            absence: None,
        }
    }
}

impl<T> Field<T> {
    pub fn present(value: T) -> Self {
        Self {
            value: Some(value),
            absence: None,
        }
    }

    pub fn absent(pointer: impl Into<String>, reason: AbsenceReason) -> Self {
        Self {
            value: None,
            absence: Some(Absence {
                pointer: pointer.into(),
                reason,
            }),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Keep `self` when present, otherwise take `other`.
    pub fn or(self, other: Field<T>) -> Field<T> {
        if self.value.is_some() {
            self
        } else {
            other
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Field<U> {
        Field {
            value: self.value.map(f),
            absence: self.absence,
        }
    }
}

impl Field<String> {
    pub fn as_deref(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Scale a provider reports ratings on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingScale {
    FivePoint,
    TenPoint,
}

impl RatingScale {
    pub fn max(self) -> f64 {
        match self {
            RatingScale::FivePoint => 5.0,
            RatingScale::TenPoint => 10.0,
        }
    }

    /// Convert a provider rating to the 0-10 scale stored on venues.
    pub fn to_ten_point(self, rating: f64) -> Option<f64> {
        if !rating.is_finite() {
            return None;
        }
        Some((rating / self.max() * 10.0).clamp(0.0, 10.0))
    }
}

/// Transient result of a provider search or details call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateListing {
    pub provider: String,
    pub provider_id: Field<String>,
    pub name: String,
    pub address: Field<String>,
    pub city: Field<String>,
    pub country: Field<String>,
    pub rating: Field<f64>,
    pub rating_scale: RatingScale,
    pub review_count: Field<u32>,
    pub summary: Field<String>,
    pub website: Field<String>,
    pub coordinates: Field<GeoPoint>,
    pub categories: Vec<String>,
    pub rooms: Field<i64>,
    pub image_url: Field<String>,
}

impl CandidateListing {
    pub fn new(provider: impl Into<String>, name: impl Into<String>, rating_scale: RatingScale) -> Self {
        Self {
            provider: provider.into(),
            provider_id: Field::default(),
            name: name.into(),
            address: Field::default(),
            city: Field::default(),
            country: Field::default(),
            rating: Field::default(),
            rating_scale,
            review_count: Field::default(),
            summary: Field::default(),
            website: Field::default(),
            coordinates: Field::default(),
            categories: Vec::new(),
            rooms: Field::default(),
            image_url: Field::default(),
        }
    }

    /// Overlay extended details onto a search result; detail values win when present.
    pub fn merge_details(self, details: CandidateListing) -> CandidateListing {
        let mut categories = self.categories;
        for category in details.categories {
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
        CandidateListing {
            provider: self.provider,
            provider_id: self.provider_id.or(details.provider_id),
            name: if details.name.trim().is_empty() {
                self.name
            } else {
                details.name
            },
            address: details.address.or(self.address),
            city: details.city.or(self.city),
            country: details.country.or(self.country),
            rating: details.rating.or(self.rating),
            rating_scale: self.rating_scale,
            review_count: details.review_count.or(self.review_count),
            summary: details.summary.or(self.summary),
            website: details.website.or(self.website),
            coordinates: details.coordinates.or(self.coordinates),
            categories,
            rooms: details.rooms.or(self.rooms),
            image_url: details.image_url.or(self.image_url),
        }
    }

    /// Rating normalized to 0-10, when the provider reported one.
    pub fn rating_ten_point(&self) -> Option<f64> {
        self.rating
            .value()
            .and_then(|r| self.rating_scale.to_ten_point(*r))
    }
}

/// Persisted venue, keyed by slug and by identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub slug: String,
    pub provider: String,
    pub provider_id: Option<String>,
    pub identity_key: String,
    pub name: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub coordinates: Option<GeoPoint>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub amenities: Vec<String>,
    pub description: Option<String>,
    pub website: Option<String>,
    pub image_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub slug: String,
    pub raw: f64,
    pub calibrated: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

impl ScoreRecord {
    pub fn raw(slug: impl Into<String>, raw: f64, computed_at: DateTime<Utc>) -> Self {
        Self {
            slug: slug.into(),
            raw: clamp_score(raw),
            calibrated: None,
            computed_at,
        }
    }

    /// Public score: calibrated when a calibration pass has run, raw otherwise.
    pub fn public(&self) -> f64 {
        self.calibrated.unwrap_or(self.raw)
    }
}

/// Venue joined with its score, as read by bulk passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredVenue {
    pub venue: VenueRecord,
    pub score: ScoreRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    City,
    Country,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::City => "city",
            ScopeKind::Country => "country",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "city" => Some(ScopeKind::City),
            "country" => Some(ScopeKind::Country),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeStat {
    pub kind: ScopeKind,
    pub key: String,
    pub median: f64,
    pub iqr: f64,
    pub samples: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", content = "city", rename_all = "snake_case")]
pub enum CurationFamily {
    Featured,
    City(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurationSlot {
    pub family: CurationFamily,
    pub position: u8,
    pub slug: String,
    pub score: f64,
    pub image_url: Option<String>,
    pub rating: Option<f64>,
    pub cue_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlugRedirect {
    pub old_slug: String,
    pub new_slug: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Structured status returned at the job boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome<T> {
    pub run_id: Uuid,
    pub job: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    pub summary: Option<T>,
}

impl<T> JobOutcome<T> {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 10.0)
}

/// Lowercase and strip diacritics ("Zürich" -> "zurich").
pub fn fold_text(input: &str) -> String {
    input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Folded text with every run of non-alphanumeric characters replaced by `separator`.
pub fn collapse_separators(input: &str, separator: char) -> String {
    let folded = fold_text(input);
    let mut out = String::with_capacity(folded.len());
    let mut pending = false;
    for ch in folded.chars() {
        if ch.is_alphanumeric() {
            if pending && !out.is_empty() {
                out.push(separator);
            }
            pending = false;
            out.push(ch);
        } else {
            pending = true;
        }
    }
    out
}

pub fn slug_fragment(input: &str) -> String {
    collapse_separators(input, '-')
}

pub fn identity_fragment(input: &str) -> String {
    collapse_separators(input, ' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_strips_diacritics_and_case() {
        assert_eq!(fold_text("Zürich Café"), "zurich cafe");
        assert_eq!(fold_text("SÃO PAULO"), "sao paulo");
    }

    #[test]
    fn slug_fragments_collapse_punctuation_runs() {
        assert_eq!(slug_fragment("  Hôtel  du -- Petit Moulin! "), "hotel-du-petit-moulin");
        assert_eq!(slug_fragment("B&B 'La Casa'"), "b-b-la-casa");
        assert_eq!(slug_fragment("!!!"), "");
    }

    #[test]
    fn non_latin_letters_survive_folding() {
        assert_eq!(slug_fragment("京都旅館 月"), "京都旅館-月");
        assert_eq!(slug_fragment("Гостиница «Уют»"), "гостиница-уют");
        assert_eq!(slug_fragment("Ξενοδοχείο Αθήνα"), "ξενοδοχειο-αθηνα");
        assert_ne!(identity_fragment("京都旅館 月"), identity_fragment("嵐山ホテル"));
    }

    #[test]
    fn identity_fragments_ignore_superficial_differences() {
        assert_eq!(identity_fragment("Casa Luz!"), identity_fragment("casa   luz"));
        assert_eq!(identity_fragment("Café Crème"), identity_fragment("CAFE-CREME"));
    }

    #[test]
    fn detail_values_override_search_values() {
        let mut search = CandidateListing::new("places", "Casa Luz", RatingScale::FivePoint);
        search.provider_id = Field::present("abc".into());
        search.rating = Field::present(4.0);
        search.categories = vec!["lodging".into()];

        let mut details = CandidateListing::new("places", "", RatingScale::FivePoint);
        details.rating = Field::present(4.5);
        details.website = Field::present("https://casaluz.example".into());
        details.categories = vec!["lodging".into(), "spa".into()];

        let merged = search.merge_details(details);
        assert_eq!(merged.name, "Casa Luz");
        assert_eq!(merged.provider_id.as_deref(), Some("abc"));
        assert_eq!(merged.rating.value, Some(4.5));
        assert_eq!(merged.rating_ten_point(), Some(9.0));
        assert_eq!(merged.categories, vec!["lodging".to_string(), "spa".to_string()]);
    }

    #[test]
    fn absent_fields_carry_their_reason() {
        let field: Field<f64> = Field::absent("/rating", AbsenceReason::WrongType);
        assert!(!field.is_present());
        assert_eq!(field.absence.unwrap().reason, AbsenceReason::WrongType);
    }

    #[test]
    fn curation_family_serializes_with_city_key() {
        let json = serde_json::to_value(CurationFamily::City("Vienna".into())).unwrap();
        assert_eq!(json["family"], "city");
        assert_eq!(json["city"], "Vienna");
    }
}
