use std::fmt;

use serde::{Deserialize, Serialize};

use crate::normalize::NormalizedAddress;

/// How a coordinate pair was obtained, most specific first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Manual,
    Structured,
    FreeText,
    CityFallback,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Manual => "manual",
            Strategy::Structured => "structured",
            Strategy::FreeText => "free_text",
            Strategy::CityFallback => "city_fallback",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityScore(u8);

impl QualityScore {
    pub const MAX: u8 = 100;

    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
    Missing,
}

impl QualityTier {
    pub const ALL: [QualityTier; 5] = [
        QualityTier::Excellent,
        QualityTier::Good,
        QualityTier::Fair,
        QualityTier::Poor,
        QualityTier::Missing,
    ];

    pub fn of(score: Option<QualityScore>) -> Self {
        match score.map(|s| s.value()) {
            None => QualityTier::Missing,
            Some(80..=100) => QualityTier::Excellent,
            Some(60..=79) => QualityTier::Good,
            Some(40..=59) => QualityTier::Fair,
            Some(_) => QualityTier::Poor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Fair => "fair",
            QualityTier::Poor => "poor",
            QualityTier::Missing => "missing",
        }
    }

    pub fn range_label(&self) -> &'static str {
        match self {
            QualityTier::Excellent => "80-100",
            QualityTier::Good => "60-79",
            QualityTier::Fair => "40-59",
            QualityTier::Poor => "1-39",
            QualityTier::Missing => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Band {
    floor: u8,
    width: u8,
}

fn band(strategy: Strategy, has_number: bool) -> Band {
    match (strategy, has_number) {
        (Strategy::Manual, _) => Band {
            floor: 100,
            width: 0,
        },
        (Strategy::Structured, true) => Band { floor: 95, width: 5 },
        (Strategy::Structured, false) => Band {
            floor: 75,
            width: 10,
        },
        (Strategy::FreeText, true) => Band {
            floor: 70,
            width: 10,
        },
        (Strategy::FreeText, false) => Band {
            floor: 55,
            width: 10,
        },
        (Strategy::CityFallback, _) => Band {
            floor: 40,
            width: 10,
        },
    }
}

/// Scores a match: the strategy picks the band, display-name overlap picks the point inside it.
pub fn score(strategy: Strategy, address: &NormalizedAddress, display_name: &str) -> QualityScore {
    let band = band(strategy, address.has_number());
    let bonus = (overlap_ratio(address, display_name) * f64::from(band.width)).round() as u8;
    QualityScore::new(band.floor.saturating_add(bonus.min(band.width)))
}

/// Fraction of the address tokens (street words, number, city) found in the display name.
pub fn overlap_ratio(address: &NormalizedAddress, display_name: &str) -> f64 {
    let display = display_name.to_lowercase();
    let mut tokens: Vec<String> = address
        .street_name_clean
        .as_deref()
        .unwrap_or_default()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect();
    if let Some(number) = &address.street_number {
        tokens.push(number.to_lowercase());
    }
    if !address.city.is_empty() {
        tokens.push(address.city.to_lowercase());
    }
    if tokens.is_empty() {
        return 0.0;
    }
    let matched = tokens.iter().filter(|t| display.contains(t.as_str())).count();
    matched as f64 / tokens.len() as f64
}
