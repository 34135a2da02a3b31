//! Scope statistics (median/IQR per city and country) and the global
//! percentile recalibration of raw scores.

use std::collections::BTreeMap;

use cosy_core::{clamp_score, fold_text, ScopeKind, ScopeStat, ScoredVenue};
use cosy_storage::{StoreError, VenueStore};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};

pub const SIGMOID_SLOPE: f64 = 1.4;
/// IQR of a standard normal distribution.
pub const IQR_TO_SIGMA: f64 = 1.349;
const MIN_SAMPLES_FOR_IQR: usize = 4;

fn sorted(mut samples: Vec<f64>) -> Vec<f64> {
    samples.retain(|s| s.is_finite());
    samples.sort_by(f64::total_cmp);
    samples
}

/// Median of an already sorted slice.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    }
}

/// Tukey interquartile range of a sorted slice: the distance between the
/// medians of the lower and upper halves, the middle value excluded for odd
/// lengths. Small or flat samples report 1.0.
pub fn tukey_iqr(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n < MIN_SAMPLES_FOR_IQR {
        return 1.0;
    }
    let lower = &sorted[..n / 2];
    let upper = &sorted[(n + 1) / 2..];
    match (median(lower), median(upper)) {
        (Some(q1), Some(q3)) if q3 - q1 > 0.0 => q3 - q1,
        _ => 1.0,
    }
}

pub fn scope_stat(kind: ScopeKind, key: impl Into<String>, samples: Vec<f64>) -> Option<ScopeStat> {
    let sorted = sorted(samples);
    let median = median(&sorted)?;
    Some(ScopeStat {
        kind,
        key: key.into(),
        median,
        iqr: tukey_iqr(&sorted),
        samples: u32::try_from(sorted.len()).unwrap_or(u32::MAX),
    })
}

/// Score relative to its scope peers, on 0-10.
pub fn normalized(score: f64, stat: &ScopeStat) -> f64 {
    let iqr = if stat.iqr > 0.0 { stat.iqr } else { 1.0 };
    let z = SIGMOID_SLOPE * (score - stat.median) / (iqr / IQR_TO_SIGMA);
    10.0 / (1.0 + (-z).exp())
}

/// Nearest-rank percentile of a sorted slice; `p` in (0, 1].
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (p * n as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

impl Percentiles {
    pub fn from_sorted(sorted: &[f64]) -> Option<Self> {
        Some(Self {
            p50: percentile(sorted, 0.50)?,
            p90: percentile(sorted, 0.90)?,
            p99: percentile(sorted, 0.99)?,
        })
    }

    /// Piecewise-linear map pinning p50 to 7.0, p90 to 9.0 and p99 to 9.8.
    /// Zero-width segments use slope 1.
    pub fn calibrate(&self, raw: f64) -> f64 {
        let calibrated = if raw <= self.p90 {
            if self.p90 > self.p50 {
                7.0 + (raw - self.p50) * 2.0 / (self.p90 - self.p50)
            } else {
                7.0 + (raw - self.p50)
            }
        } else if self.p99 > self.p90 {
            9.0 + (raw - self.p90) * 0.8 / (self.p99 - self.p90)
        } else {
            9.0 + (raw - self.p90)
        };
        clamp_score(calibrated)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizeSummary {
    pub scored: u64,
    pub cities: usize,
    pub countries: usize,
    pub calibrated: u64,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p99: Option<f64>,
}

/// Folded key under which a venue's city or country statistics are stored.
pub fn scope_key(name: &str) -> String {
    fold_text(name.trim())
}

/// Replace every scope statistic and recalibrate every score.
///
/// Reads the corpus twice in pages of `page_size`: once to collect raw samples,
/// once to write calibrated scores. Safe to re-run.
pub async fn run_normalization(store: &dyn VenueStore, page_size: usize) -> Result<NormalizeSummary, StoreError> {
    let span = info_span!("normalize");
    async {
        let page_size = page_size.max(1);
        let mut cities: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut countries: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut all = Vec::new();

        let mut after: Option<String> = None;
        loop {
            let page = store.scored_page(None, after.as_deref(), page_size).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.venue.slug.clone());
            for ScoredVenue { venue, score } in &page {
                all.push(score.raw);
                if let Some(city) = venue.city.as_deref() {
                    cities.entry(scope_key(city)).or_default().push(score.raw);
                }
                if let Some(country) = venue.country.as_deref() {
                    countries.entry(scope_key(country)).or_default().push(score.raw);
                }
            }
        }

        let mut stats = Vec::with_capacity(cities.len() + countries.len());
        stats.extend(
            cities
                .into_iter()
                .filter_map(|(key, samples)| scope_stat(ScopeKind::City, key, samples)),
        );
        let city_count = stats.len();
        stats.extend(
            countries
                .into_iter()
                .filter_map(|(key, samples)| scope_stat(ScopeKind::Country, key, samples)),
        );
        store.replace_scope_stats(&stats).await?;

        let scored = all.len() as u64;
        let sorted_all = sorted(all);
        let percentiles = Percentiles::from_sorted(&sorted_all);
        let mut summary = NormalizeSummary {
            scored,
            cities: city_count,
            countries: stats.len() - city_count,
            calibrated: 0,
            p50: percentiles.map(|p| p.p50),
            p90: percentiles.map(|p| p.p90),
            p99: percentiles.map(|p| p.p99),
        };

        if let Some(percentiles) = percentiles {
            let mut after: Option<String> = None;
            loop {
                let page = store.scored_page(None, after.as_deref(), page_size).await?;
                let Some(last) = page.last() else { break };
                after = Some(last.venue.slug.clone());
                let updates = page
                    .iter()
                    .map(|sv| (sv.venue.slug.clone(), percentiles.calibrate(sv.score.raw)))
                    .collect::<Vec<_>>();
                store.set_calibrated(&updates).await?;
                summary.calibrated += updates.len() as u64;
            }
        }

        info!(
            scored = summary.scored,
            cities = summary.cities,
            countries = summary.countries,
            p50 = ?summary.p50,
            p90 = ?summary.p90,
            "normalization finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_scored, venue};
    use cosy_storage::MemoryVenueStore;

    const SCENARIO: [f64; 10] = [5.0, 6.0, 7.0, 7.0, 8.0, 9.0, 9.5, 9.8, 10.0, 6.5];

    #[test]
    fn tukey_iqr_uses_half_medians() {
        assert_eq!(tukey_iqr(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]), 4.0);
        assert_eq!(tukey_iqr(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]), 4.0);
        assert_eq!(tukey_iqr(&[1.0, 5.0, 9.0]), 1.0);
        assert_eq!(tukey_iqr(&[6.0, 6.0, 6.0, 6.0]), 1.0);
    }

    #[test]
    fn normalized_is_centered_and_monotone() {
        let stat = scope_stat(ScopeKind::City, "lisbon", vec![5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
        assert_eq!(stat.median, 7.0);
        assert!((normalized(7.0, &stat) - 5.0).abs() < 1e-12);

        let mut previous = f64::MIN;
        for step in 0..=200 {
            let value = normalized(step as f64 * 0.05, &stat);
            assert!(value >= previous);
            assert!((0.0..=10.0).contains(&value));
            previous = value;
        }
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let sorted = sorted(SCENARIO.to_vec());
        let p = Percentiles::from_sorted(&sorted).unwrap();
        assert_eq!(p.p50, 7.0);
        assert_eq!(p.p90, 9.8);
        assert_eq!(p.p99, 10.0);
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn calibration_pins_reference_percentiles() {
        let p = Percentiles::from_sorted(&sorted(SCENARIO.to_vec())).unwrap();
        assert!((p.calibrate(7.0) - 7.0).abs() < 1e-9);
        assert!((p.calibrate(9.8) - 9.0).abs() < 1e-9);
        assert!((p.calibrate(10.0) - 9.8).abs() < 1e-9);
        assert_eq!(p.calibrate(0.0), 0.0);
    }

    #[test]
    fn degenerate_segments_use_unit_slope() {
        let flat = Percentiles {
            p50: 6.0,
            p90: 6.0,
            p99: 6.0,
        };
        assert_eq!(flat.calibrate(6.0), 7.0);
        assert_eq!(flat.calibrate(5.0), 6.0);
        assert_eq!(flat.calibrate(6.5), 9.5);
    }

    #[tokio::test]
    async fn normalization_replaces_stats_and_calibrates() {
        let store = MemoryVenueStore::new();
        for (i, raw) in SCENARIO.iter().enumerate() {
            let city = if i % 2 == 0 { "Lisbon" } else { "Porto" };
            seed_scored(&store, venue(&format!("v-{i:02}"), "Venue", Some(city), Some("Portugal")), *raw).await;
        }
        store
            .upsert_venue(&venue("unscored", "Unscored", Some("Faro"), Some("Portugal")))
            .await
            .unwrap();

        let summary = run_normalization(&store, 3).await.unwrap();
        assert_eq!(summary.scored, 10);
        assert_eq!(summary.cities, 2);
        assert_eq!(summary.countries, 1);
        assert_eq!(summary.calibrated, 10);
        assert_eq!(summary.p90, Some(9.8));

        let stats = store.scope_stats().await.unwrap();
        assert!(stats.iter().any(|s| s.kind == ScopeKind::City && s.key == "lisbon" && s.samples == 5));

        let v07 = store.score("v-07").await.unwrap();
        assert!((v07.calibrated.unwrap() - 9.0).abs() < 1e-9);

        let again = run_normalization(&store, 3).await.unwrap();
        assert_eq!(again.p50, summary.p50);
        assert_eq!(store.scope_stats().await.unwrap().len(), stats.len());
    }

    #[tokio::test]
    async fn empty_corpus_clears_stats() {
        let store = MemoryVenueStore::new();
        let summary = run_normalization(&store, 10).await.unwrap();
        assert_eq!(summary.scored, 0);
        assert!(summary.p50.is_none());
        assert!(store.scope_stats().await.unwrap().is_empty());
    }
}
