use cosy_core::fold_text;
use serde::Serialize;

/// Known multi-property chains, matched as case-insensitive substrings.
pub const KNOWN_CHAINS: &[&str] = &[
    "ibis",
    "novotel",
    "mercure",
    "sofitel",
    "pullman",
    "hampton",
    "hilton",
    "doubletree",
    "marriott",
    "sheraton",
    "westin",
    "courtyard",
    "holiday inn",
    "crowne plaza",
    "intercontinental",
    "hyatt",
    "radisson",
    "best western",
    "premier inn",
    "travelodge",
    "motel one",
    "nh hotels",
    "melia",
    "barcelo",
    "kempinski",
    "four seasons",
    "ritz-carlton",
    "moxy",
    "aloft",
    "citizenm",
    "wyndham",
    "ramada",
    "scandic",
    "b&b hotels",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Brand {
    Chain(&'static str),
    Independent,
}

impl Brand {
    pub fn label(&self) -> &'static str {
        match self {
            Brand::Chain(name) => name,
            Brand::Independent => "independent",
        }
    }

    pub fn is_independent(&self) -> bool {
        matches!(self, Brand::Independent)
    }
}

pub fn detect_brand(name: &str, website: Option<&str>) -> Brand {
    let name = fold_text(name);
    let website = website.map(fold_text).unwrap_or_default();
    KNOWN_CHAINS
        .iter()
        .copied()
        .find(|chain| name.contains(chain) || website.contains(&chain.replace(' ', "")))
        .map_or(Brand::Independent, Brand::Chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_are_detected() {
        assert_eq!(detect_brand("Ibis Budget Lagoon View", None), Brand::Chain("ibis"));
        assert_eq!(detect_brand("Casa Luz", Some("https://casaluz.example")), Brand::Independent);
        assert_eq!(detect_brand("Hotel Meliá Sevilla", None), Brand::Chain("melia"));
    }

    #[test]
    fn websites_identify_chains_too() {
        let brand = detect_brand("Lakeside Rooms", Some("https://www.bestwestern.com/en/lakeside"));
        assert_eq!(brand.label(), "best western");
        assert!(detect_brand("Lakeside Rooms", None).is_independent());
    }
}
