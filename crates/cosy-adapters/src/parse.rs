//! Explicit field parsers for provider JSON.
//!
//! Every field a provider consumes goes through one of these readers, which
//! return either a value or the reason it is absent together with the JSON
//! pointer it was read from.

use cosy_core::{AbsenceReason, Field, GeoPoint};
use serde_json::Value as JsonValue;

/// One JSON object positioned at `base` inside a larger response.
#[derive(Debug, Clone, Copy)]
pub struct JsonRecord<'a> {
    value: &'a JsonValue,
    base: &'a str,
}

impl<'a> JsonRecord<'a> {
    pub fn new(value: &'a JsonValue, base: &'a str) -> Self {
        Self { value, base }
    }

    pub fn value(&self) -> &'a JsonValue {
        self.value
    }

    fn pointer(&self, rel: &str) -> String {
        format!("{}{}", self.base, rel)
    }

    pub fn absent<T>(&self, rel: &str, reason: AbsenceReason) -> Field<T> {
        Field::absent(self.pointer(rel), reason)
    }

    fn lookup(&self, rel: &str) -> Option<&'a JsonValue> {
        match self.value.pointer(rel) {
            None | Some(JsonValue::Null) => None,
            Some(v) => Some(v),
        }
    }

    pub fn string(&self, rel: &str) -> Field<String> {
        match self.lookup(rel) {
            None => Field::absent(self.pointer(rel), AbsenceReason::Missing),
            Some(JsonValue::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Field::absent(self.pointer(rel), AbsenceReason::Empty)
                } else {
                    Field::present(trimmed.to_string())
                }
            }
            Some(_) => Field::absent(self.pointer(rel), AbsenceReason::WrongType),
        }
    }

    /// String or integer identifier, rendered as a string.
    pub fn identifier(&self, rel: &str) -> Field<String> {
        match self.lookup(rel) {
            Some(JsonValue::Number(n)) if n.is_i64() || n.is_u64() => Field::present(n.to_string()),
            _ => self.string(rel),
        }
    }

    /// Finite number inside `[min, max]`. Numeric strings are accepted.
    pub fn number(&self, rel: &str, min: f64, max: f64) -> Field<f64> {
        let parsed = match self.lookup(rel) {
            None => return Field::absent(self.pointer(rel), AbsenceReason::Missing),
            Some(JsonValue::Number(n)) => n.as_f64(),
            Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match parsed {
            None => Field::absent(self.pointer(rel), AbsenceReason::WrongType),
            Some(v) if !v.is_finite() || v < min || v > max => {
                Field::absent(self.pointer(rel), AbsenceReason::OutOfRange)
            }
            Some(v) => Field::present(v),
        }
    }

    /// Whole number; the sign is kept so callers can validate it themselves.
    pub fn integer(&self, rel: &str) -> Field<i64> {
        match self.lookup(rel) {
            None => Field::absent(self.pointer(rel), AbsenceReason::Missing),
            Some(JsonValue::Number(n)) => match n.as_i64() {
                Some(v) => Field::present(v),
                None if n.is_u64() => Field::absent(self.pointer(rel), AbsenceReason::OutOfRange),
                None => Field::absent(self.pointer(rel), AbsenceReason::WrongType),
            },
            Some(_) => Field::absent(self.pointer(rel), AbsenceReason::WrongType),
        }
    }

    pub fn count(&self, rel: &str) -> Field<u32> {
        let integer = self.integer(rel);
        match integer.value {
            Some(v) => match u32::try_from(v) {
                Ok(count) => Field::present(count),
                Err(_) => Field::absent(self.pointer(rel), AbsenceReason::OutOfRange),
            },
            None => Field {
                value: None,
                absence: integer.absence,
            },
        }
    }

    /// Array of strings; non-string members are dropped.
    pub fn strings(&self, rel: &str) -> Field<Vec<String>> {
        match self.lookup(rel) {
            None => Field::absent(self.pointer(rel), AbsenceReason::Missing),
            Some(JsonValue::Array(items)) => {
                let values = items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>();
                if values.is_empty() {
                    Field::absent(self.pointer(rel), AbsenceReason::Empty)
                } else {
                    Field::present(values)
                }
            }
            Some(_) => Field::absent(self.pointer(rel), AbsenceReason::WrongType),
        }
    }

    pub fn geo(&self, lat_rel: &str, lng_rel: &str) -> Field<GeoPoint> {
        let lat = self.number(lat_rel, -90.0, 90.0);
        let lng = self.number(lng_rel, -180.0, 180.0);
        match (lat.value, lng.value) {
            (Some(lat), Some(lng)) => Field::present(GeoPoint { lat, lng }),
            _ => Field {
                value: None,
                absence: lat.absence.or(lng.absence),
            },
        }
    }

    /// Members of the array at `rel`, or `None` when it is not an array.
    pub fn items(&self, rel: &str) -> Option<Vec<(String, &'a JsonValue)>> {
        let items = self.lookup(rel)?.as_array()?;
        Some(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("{}{}/{}", self.base, rel, i), v))
                .collect(),
        )
    }
}
