//! Literal keyword matching for amenities and warmth sentiment.
//!
//! Matching is case-insensitive substring search over folded text. There is no
//! stemming and no word-boundary check, so "bar" also matches "barn".

use std::collections::BTreeSet;

use cosy_core::fold_text;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Amenity {
    Fireplace,
    Bathtub,
    Spa,
    Sauna,
    Garden,
    Rooftop,
    Bar,
    Restaurant,
    PetFriendly,
    Gym,
}

impl Amenity {
    pub const ALL: [Amenity; 10] = [
        Amenity::Fireplace,
        Amenity::Bathtub,
        Amenity::Spa,
        Amenity::Sauna,
        Amenity::Garden,
        Amenity::Rooftop,
        Amenity::Bar,
        Amenity::Restaurant,
        Amenity::PetFriendly,
        Amenity::Gym,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Amenity::Fireplace => "Fireplace",
            Amenity::Bathtub => "Bathtub",
            Amenity::Spa => "Spa",
            Amenity::Sauna => "Sauna",
            Amenity::Garden => "Garden",
            Amenity::Rooftop => "Rooftop",
            Amenity::Bar => "Bar",
            Amenity::Restaurant => "Restaurant",
            Amenity::PetFriendly => "Pet-friendly",
            Amenity::Gym => "Gym",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.label().eq_ignore_ascii_case(label.trim()))
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            Amenity::Fireplace => &["fireplace", "log fire", "open fire", "wood burner", "wood-burning"],
            Amenity::Bathtub => &["bath", "soaking tub", "clawfoot"],
            Amenity::Spa => &["spa"],
            Amenity::Sauna => &["sauna"],
            Amenity::Garden => &["garden"],
            Amenity::Rooftop => &["rooftop", "roof terrace"],
            Amenity::Bar => &["bar"],
            Amenity::Restaurant => &["restaurant"],
            Amenity::PetFriendly => &[
                "pet-friendly",
                "pet friendly",
                "pets",
                "dog-friendly",
                "dog friendly",
                "dogs welcome",
            ],
            Amenity::Gym => &["gym", "fitness"],
        }
    }
}

const COSY_WORDS: &[&str] = &[
    "cosy", "cozy", "snug", "warm", "intimate", "charming", "boutique", "quiet", "romantic", "character",
    "fireplace", "bath", "candle", "hygge", "rustic", "homely", "tranquil", "peaceful",
];

/// Distinct cosy words needed for a full sentiment score.
const SENTIMENT_SATURATION: f64 = 8.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub amenities: BTreeSet<Amenity>,
    /// Keyword sentiment in [0, 1].
    pub sentiment: f64,
}

impl Features {
    pub fn amenity_labels(&self) -> Vec<String> {
        self.amenities.iter().map(|a| a.label().to_string()).collect()
    }
}

pub fn amenities_in(text: &str) -> BTreeSet<Amenity> {
    let folded = fold_text(text);
    Amenity::ALL
        .into_iter()
        .filter(|a| a.keywords().iter().any(|k| folded.contains(k)))
        .collect()
}

pub fn cosy_sentiment(text: &str) -> f64 {
    let folded = fold_text(text);
    let matched = COSY_WORDS.iter().filter(|w| folded.contains(*w)).count();
    (matched as f64 / SENTIMENT_SATURATION).min(1.0)
}

/// Amenities from free text plus provider category tags, and sentiment from the text.
pub fn extract_features(texts: &[&str], categories: &[String]) -> Features {
    let text = texts.join(" \n ");
    let mut amenities = amenities_in(&text);
    for category in categories {
        amenities.extend(amenities_in(&category.replace('_', " ")));
    }
    Features {
        amenities,
        sentiment: cosy_sentiment(&text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_map_to_canonical_amenities() {
        let found = amenities_in("Log fire in the lounge, a SAUNA, dogs welcome and a rooftop terrace.");
        assert!(found.contains(&Amenity::Fireplace));
        assert!(found.contains(&Amenity::Sauna));
        assert!(found.contains(&Amenity::PetFriendly));
        assert!(found.contains(&Amenity::Rooftop));
        assert!(!found.contains(&Amenity::Gym));
    }

    #[test]
    fn substring_matches_are_literal() {
        assert!(amenities_in("a converted barn").contains(&Amenity::Bar));
    }

    #[test]
    fn sentiment_saturates_at_eight_words() {
        assert_eq!(cosy_sentiment("plain concrete block"), 0.0);
        assert_eq!(cosy_sentiment("Cosy and quiet"), 0.25);
        let all = COSY_WORDS.join(" ");
        assert_eq!(cosy_sentiment(&all), 1.0);
    }

    #[test]
    fn repeated_words_count_once() {
        assert_eq!(cosy_sentiment("snug snug snug"), 1.0 / 8.0);
    }

    #[test]
    fn categories_contribute_amenities() {
        let features = extract_features(&["Small inn"], &["lodging".into(), "spa".into(), "night_club".into()]);
        assert_eq!(features.amenity_labels(), vec!["Spa".to_string()]);
    }

    #[test]
    fn labels_round_trip() {
        for amenity in Amenity::ALL {
            assert_eq!(Amenity::from_label(amenity.label()), Some(amenity));
        }
        assert_eq!(Amenity::from_label("pet-friendly"), Some(Amenity::PetFriendly));
    }
}
