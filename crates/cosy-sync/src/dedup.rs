use std::collections::HashSet;

use cosy_core::{identity_fragment, CandidateListing};
use sha2::{Digest, Sha256};

/// Stable identity of a real-world venue across providers and runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Provider { provider: String, id: String },
    Signature { name: String, city: String, country: String },
}

impl Identity {
    /// Provider id when present, otherwise the folded name/city/country signature.
    pub fn of(candidate: &CandidateListing, city: Option<&str>, country: Option<&str>) -> Self {
        match candidate.provider_id.as_deref() {
            Some(id) => Identity::Provider {
                provider: candidate.provider.clone(),
                id: id.to_string(),
            },
            None => Identity::signature(&candidate.name, city, country),
        }
    }

    pub fn signature(name: &str, city: Option<&str>, country: Option<&str>) -> Self {
        Identity::Signature {
            name: identity_fragment(name),
            city: city.map(identity_fragment).unwrap_or_default(),
            country: country.map(identity_fragment).unwrap_or_default(),
        }
    }

    /// Storage key: `provider:id`, or `sig:` and the hex SHA-256 of the signature.
    pub fn key(&self) -> String {
        match self {
            Identity::Provider { provider, id } => format!("{provider}:{id}"),
            Identity::Signature { name, city, country } => {
                let mut hasher = Sha256::new();
                hasher.update(name.as_bytes());
                hasher.update([0x1f]);
                hasher.update(city.as_bytes());
                hasher.update([0x1f]);
                hasher.update(country.as_bytes());
                format!("sig:{}", hex::encode(hasher.finalize()))
            }
        }
    }
}

/// Identities already processed in one crawl run.
#[derive(Debug, Default)]
pub struct SeenSet {
    seen: HashSet<Identity>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time an identity is offered, false on every repeat.
    pub fn first_sighting(&mut self, identity: &Identity) -> bool {
        if self.seen.contains(identity) {
            return false;
        }
        self.seen.insert(identity.clone())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosy_core::{Field, RatingScale};

    #[test]
    fn provider_ids_win_over_text() {
        let mut a = CandidateListing::new("places", "Casa Luz", RatingScale::FivePoint);
        a.provider_id = Field::present("p-1".into());
        let mut b = CandidateListing::new("places", "CASA LUZ (renovated)", RatingScale::FivePoint);
        b.provider_id = Field::present("p-1".into());
        assert_eq!(Identity::of(&a, Some("Lisbon"), None), Identity::of(&b, None, None));
        assert_eq!(Identity::of(&a, None, None).key(), "places:p-1");
    }

    #[test]
    fn signatures_ignore_case_accents_and_punctuation() {
        let a = Identity::signature("Hôtel du Lac!", Some("Genève"), Some("Switzerland"));
        let b = Identity::signature("hotel du lac", Some("GENEVE"), Some("switzerland."));
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert!(a.key().starts_with("sig:"));

        let other_city = Identity::signature("Hotel du Lac", Some("Annecy"), Some("France"));
        assert_ne!(a.key(), other_city.key());
    }

    #[test]
    fn non_latin_names_keep_distinct_signatures() {
        let ryokan = Identity::signature("京都旅館 月", Some("Kyoto"), Some("Japan"));
        let hotel = Identity::signature("嵐山ホテル", Some("Kyoto"), Some("Japan"));
        assert_ne!(ryokan.key(), hotel.key());

        let moscow = Identity::signature("Гостиница Уют", Some("Москва"), Some("Россия"));
        let moscow_again = Identity::signature("гостиница уют!", Some("МОСКВА"), Some("Россия"));
        assert_eq!(moscow.key(), moscow_again.key());
    }

    #[test]
    fn seen_set_reports_repeats() {
        let mut seen = SeenSet::new();
        let id = Identity::signature("Casa Luz", Some("Lisbon"), Some("Portugal"));
        assert!(seen.first_sighting(&id));
        assert!(!seen.first_sighting(&id));
        assert_eq!(seen.len(), 1);
    }
}
