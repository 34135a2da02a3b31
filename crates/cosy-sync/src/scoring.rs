use std::collections::BTreeSet;

use cosy_core::clamp_score;
use serde::Serialize;
use tracing::debug;

use crate::features::{cosy_sentiment, Amenity};

/// Rating assumed when the provider reports none, on the 0-10 scale.
const NEUTRAL_RATING: f64 = 8.0;
const AMENITY_CAP: f64 = 3.0;
const AMENITY_MULTIPLIER: f64 = 1.2;
const SENTIMENT_MULTIPLIER: f64 = 2.0;

/// Validated room count feeding the scale penalty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RoomCount {
    #[default]
    Unknown,
    Known(u32),
}

impl RoomCount {
    pub const MAX_PLAUSIBLE: i64 = 5000;

    /// Provider values that are zero, negative or implausibly large are unknown.
    pub fn from_provider(raw: Option<i64>) -> Self {
        match raw {
            None => RoomCount::Unknown,
            Some(n) if n <= 0 || n > Self::MAX_PLAUSIBLE => {
                debug!(rooms = n, "ignoring implausible room count");
                RoomCount::Unknown
            }
            Some(n) => u32::try_from(n).map_or(RoomCount::Unknown, RoomCount::Known),
        }
    }
}

pub fn scale_penalty(rooms: RoomCount) -> f64 {
    match rooms {
        RoomCount::Unknown => 0.0,
        RoomCount::Known(n) if n <= 20 => 0.0,
        RoomCount::Known(n) if n <= 50 => -0.2,
        RoomCount::Known(n) if n <= 100 => -0.5,
        RoomCount::Known(_) => -1.0,
    }
}

pub fn amenity_weight(amenity: Amenity) -> f64 {
    match amenity {
        Amenity::Fireplace => 1.0,
        Amenity::Bathtub => 0.6,
        Amenity::Spa => 0.7,
        Amenity::Sauna => 0.6,
        Amenity::Garden => 0.4,
        Amenity::Rooftop => 0.3,
        Amenity::Bar => 0.2,
        Amenity::Restaurant => 0.2,
        Amenity::PetFriendly => 0.2,
        Amenity::Gym => -0.1,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInputs<'a> {
    /// Rating on the 0-10 scale.
    pub rating: Option<f64>,
    pub amenities: Option<&'a BTreeSet<Amenity>>,
    pub description: Option<&'a str>,
    pub rooms: RoomCount,
    pub image_warmth: Option<f64>,
}

/// Composite warmth score in [0, 10]. Pure: no I/O and no randomness.
pub fn cosy_score(inputs: ScoreInputs<'_>) -> f64 {
    let rating = inputs
        .rating
        .filter(|r| r.is_finite())
        .map(|r| r.clamp(0.0, 10.0))
        .unwrap_or(NEUTRAL_RATING);
    let base = rating / 10.0 * 5.0;

    let amenities = inputs
        .amenities
        .map(|set| set.iter().map(|a| amenity_weight(*a)).sum::<f64>())
        .unwrap_or(0.0)
        .clamp(0.0, AMENITY_CAP);

    let sentiment = inputs.description.map(cosy_sentiment).unwrap_or(0.0);

    let warmth = inputs
        .image_warmth
        .filter(|w| w.is_finite())
        .map(|w| w.clamp(0.0, 1.0))
        .unwrap_or(0.0);

    clamp_score(
        base + amenities * AMENITY_MULTIPLIER
            + sentiment * SENTIMENT_MULTIPLIER
            + warmth
            + scale_penalty(inputs.rooms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[Amenity]) -> BTreeSet<Amenity> {
        items.iter().copied().collect()
    }

    #[test]
    fn neutral_inputs_score_four() {
        assert_eq!(cosy_score(ScoreInputs::default()), 4.0);
    }

    #[test]
    fn components_add_up() {
        let amenities = set(&[Amenity::Fireplace, Amenity::Spa]);
        let score = cosy_score(ScoreInputs {
            rating: Some(9.0),
            amenities: Some(&amenities),
            description: Some("cosy snug rooms"),
            rooms: RoomCount::Known(35),
            image_warmth: Some(0.5),
        });
        // 4.5 + 1.7 * 1.2 + 0.25 * 2 + 0.5 - 0.2
        assert!((score - 7.34).abs() < 1e-9, "{score}");
    }

    #[test]
    fn score_stays_within_bounds() {
        let everything = set(&Amenity::ALL);
        let words = "cosy cozy snug warm intimate charming boutique quiet romantic";
        let high = cosy_score(ScoreInputs {
            rating: Some(50.0),
            amenities: Some(&everything),
            description: Some(words),
            rooms: RoomCount::Known(4),
            image_warmth: Some(7.0),
        });
        assert_eq!(high, 10.0);

        let gym_only = set(&[Amenity::Gym]);
        let low = cosy_score(ScoreInputs {
            rating: Some(-3.0),
            amenities: Some(&gym_only),
            rooms: RoomCount::Known(900),
            image_warmth: Some(f64::NAN),
            ..Default::default()
        });
        assert_eq!(low, 0.0);

        let nan_rating = cosy_score(ScoreInputs {
            rating: Some(f64::NAN),
            ..Default::default()
        });
        assert_eq!(nan_rating, 4.0);
    }

    #[test]
    fn amenity_sum_is_capped() {
        let everything = set(&Amenity::ALL);
        let score = cosy_score(ScoreInputs {
            rating: Some(0.0),
            amenities: Some(&everything),
            ..Default::default()
        });
        assert!((score - 3.6).abs() < 1e-9);
    }

    #[test]
    fn scale_penalty_never_increases_with_rooms() {
        let mut previous = scale_penalty(RoomCount::Unknown);
        for rooms in 1..=400u32 {
            let penalty = scale_penalty(RoomCount::Known(rooms));
            assert!(penalty <= previous, "penalty rose at {rooms}");
            previous = penalty;
        }
        assert_eq!(scale_penalty(RoomCount::Known(20)), 0.0);
        assert_eq!(scale_penalty(RoomCount::Known(21)), -0.2);
        assert_eq!(scale_penalty(RoomCount::Known(100)), -0.5);
        assert_eq!(scale_penalty(RoomCount::Known(101)), -1.0);
    }

    #[test]
    fn implausible_room_counts_are_unknown() {
        assert_eq!(RoomCount::from_provider(None), RoomCount::Unknown);
        assert_eq!(RoomCount::from_provider(Some(0)), RoomCount::Unknown);
        assert_eq!(RoomCount::from_provider(Some(-12)), RoomCount::Unknown);
        assert_eq!(RoomCount::from_provider(Some(12_000)), RoomCount::Unknown);
        assert_eq!(RoomCount::from_provider(Some(48)), RoomCount::Known(48));
    }
}
