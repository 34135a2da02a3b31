use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Search plan loaded from `queries.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Synonyms of the base query, possibly in several languages.
    pub variants: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub cities: Vec<CityTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityTarget {
    pub city: String,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    Global,
    Region,
    Country,
    City,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub scope: QueryScope,
    pub text: String,
}

impl QueryPlan {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let plan: QueryPlan = serde_yaml::from_str(text)?;
        if plan.variants.iter().all(|v| v.trim().is_empty()) {
            bail!("query plan has no query variants");
        }
        Ok(plan)
    }

    fn variants(&self) -> impl Iterator<Item = &str> + '_ {
        self.variants.iter().map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Every query of a full run: global, then region, country and city scopes.
    pub fn global_queries(&self) -> Vec<PlannedQuery> {
        let mut out = Vec::new();
        for variant in self.variants() {
            out.push(PlannedQuery {
                scope: QueryScope::Global,
                text: variant.to_string(),
            });
        }
        for region in &self.regions {
            for variant in self.variants() {
                out.push(PlannedQuery {
                    scope: QueryScope::Region,
                    text: format!("{variant} {region}"),
                });
            }
        }
        for country in &self.countries {
            for variant in self.variants() {
                out.push(PlannedQuery {
                    scope: QueryScope::Country,
                    text: format!("{variant} {country}"),
                });
            }
        }
        for target in &self.cities {
            out.extend(self.city_queries(&target.city, target.country.as_deref()));
        }
        dedup_queries(out)
    }

    /// Queries for one city: `"{variant} {city}, {country}"`.
    pub fn city_queries(&self, city: &str, country: Option<&str>) -> Vec<PlannedQuery> {
        let place = match country.map(str::trim).filter(|c| !c.is_empty()) {
            Some(country) => format!("{}, {}", city.trim(), country),
            None => city.trim().to_string(),
        };
        let queries = self
            .variants()
            .map(|variant| PlannedQuery {
                scope: QueryScope::City,
                text: format!("{variant} {place}"),
            })
            .collect();
        dedup_queries(queries)
    }

    /// Country recorded for `city` in the sweep, if any.
    pub fn country_for_city(&self, city: &str) -> Option<&str> {
        self.cities
            .iter()
            .find(|t| t.city.eq_ignore_ascii_case(city.trim()))
            .and_then(|t| t.country.as_deref())
    }
}

fn dedup_queries(queries: Vec<PlannedQuery>) -> Vec<PlannedQuery> {
    let mut seen = HashSet::new();
    queries
        .into_iter()
        .filter(|q| seen.insert(q.text.to_lowercase()))
        .collect()
}
