//! Address cleanup for the registry's free-text address and settlement columns.
//!
//! Registry addresses mix street prefixes in several spellings, floor and
//! cabinet qualifiers, landmark descriptions and glued house numbers. None of
//! that helps a geocoder, so it is reduced to `<prefix> <street> <number>` plus
//! a clean settlement name before any query is built.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

pub const COUNTRY: &str = "Bulgaria";

/// Known misspellings in the source registry.
const TYPO_FIXES: &[(&str, &str)] = &[
    ("Боо Божилов", "Божко Божилов"),
    ("Боo Божилов", "Божко Божилов"),
    ("Пков", "Петков"),
    ("Христо Смиpненски", "Христо Смирненски"),
    ("Христо Смирнeнски", "Христо Смирненски"),
    ("Цаp Симеон", "Цар Симеон"),
    ("Цаp Освободител", "Цар Освободител"),
    ("Доц.д-р", "Доц. д-р"),
];

/// Settlement spellings that cannot be fixed by prefix stripping alone.
const CITY_ALIASES: &[(&str, &str)] = &[
    ("С О Ф И Я", "София"),
    ("ОБРОЧИЩЕ К.К.АЛБЕНА", "Албена"),
    ("ОБРОЧИЩЕ АЛБЕНА", "Албена"),
];

mod patterns {
    use super::*;

    pub static NUMBER_SIGN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"№|\bNo\.").expect("invalid number sign regex"));

    /// A floor, entrance, flat or cabinet keyword with its value, including
    /// ranges and lists such as `ет. 1-2` or `ет. 2 и 3`.
    pub static QUALIFIER: Lazy<Regex> = Lazy::new(|| {
        Regex::new(concat!(
            r"(?i)(?:^|[\s,]+)",
            r"(?:ет\.|етаж\b|вх\.|вход\b|ап\.|апартамент\b|каб\.|кабинет\b)",
            r"(?:\s*(?:\d+[а-я]?(?:\s*(?:-|,|\bи\b)\s*\d+[а-я]?)*|[а-я]\b))?",
        ))
        .expect("invalid qualifier regex")
    });

    pub static GROUND_FLOOR: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)[\s,]+(?:партер|сутерен).*$").expect("invalid ground floor regex")
    });

    pub static COMPLEX_PREFIX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\b(?:ж\.\s*к\.?|жк\.?)\s*").expect("invalid complex prefix regex")
    });

    pub static STREET_PREFIX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\b(бул|ул|пл|кв)(?:\.\s*|\s+)").expect("invalid street prefix regex")
    });

    pub static REPEATED_PREFIX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(бул\. |ул\. |пл\. |кв\. )(?:бул\. |ул\. |пл\. |кв\. )+")
            .expect("invalid repeated prefix regex")
    });

    pub static BUILDING_TAIL: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)^((?:бул\.|ул\.)\s*[^\d]+?\s+\d+[а-я]?)\s+.*?(?:корпус|блок|сграда|част).*$")
            .expect("invalid building tail regex")
    });

    pub static LANDMARK_TAIL: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)^(.*?\d+[а-яa-z]?)\s+(?:до|срещу|зад|пред)\s+.*$")
            .expect("invalid landmark tail regex")
    });

    pub static COMPLEX_BLOCK: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(жк\s+[^\d,]+?)\s+бл\.?\s*(\d+)").expect("invalid complex block regex")
    });

    pub static GLUED_NUMBER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\p{L})(\d)").expect("invalid glued number regex"));

    pub static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("invalid space regex"));

    pub static COMMAS: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\s*,\s*").expect("invalid comma regex"));

    pub static TRAILING_NUMBER: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(?:^|[\s,])(\d+[а-яa-z]?(?:[-/]\d+[а-яa-z]?)?)[\s,.]*$")
            .expect("invalid trailing number regex")
    });

    pub static NAME_PREFIX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?:бул\.|ул\.|пл\.|кв\.|жк)\s*").expect("invalid name prefix regex")
    });

    pub static CITY_PREFIX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)^(?:гр\.\s*|гр\s+|град\s+|с\.\s*|село\s+|к\.\s*к\.\s*)")
            .expect("invalid city prefix regex")
    });

    pub static CITY_SUFFIX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)(?:\s*-\s*|\s+)град$").expect("invalid city suffix regex"));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedAddress {
    /// Street line with canonical prefix and without the house number.
    pub street: String,
    /// Street name with neither prefix nor number.
    pub street_name_clean: Option<String>,
    pub street_number: Option<String>,
    pub city: String,
    pub search_query: String,
}

impl NormalizedAddress {
    pub fn has_street(&self) -> bool {
        !self.street.is_empty()
    }

    pub fn has_number(&self) -> bool {
        self.street_number.is_some()
    }

    /// `"<street> <number>"`, or just the street when no number was found.
    /// Empty when there is no street; a bare number locates nothing.
    pub fn street_line(&self) -> String {
        match &self.street_number {
            Some(number) if !self.street.is_empty() => format!("{} {}", self.street, number),
            _ => self.street.clone(),
        }
    }

    /// Coarse query naming only the settlement.
    pub fn city_query(&self) -> Option<String> {
        if self.city.is_empty() {
            None
        } else {
            Some(format!("{}, {COUNTRY}", self.city))
        }
    }
}

pub fn normalize(raw_address: &str, raw_city: &str) -> NormalizedAddress {
    let line = clean_street_line(raw_address);
    let (street, street_number) = split_number(&line);
    let street_name_clean = Some(patterns::NAME_PREFIX.replace(&street, "").trim().to_string())
        .filter(|name| !name.is_empty());

    let mut city = clean_city(raw_city);
    if city.is_empty() && !raw_city.trim().is_empty() {
        city = collapse(raw_city);
    }

    let mut normalized = NormalizedAddress {
        street,
        street_name_clean,
        street_number,
        city,
        search_query: String::new(),
    };
    normalized.search_query = build_search_query(&normalized, raw_address);
    normalized
}

/// Without a street or city the raw address is the only thing left to search for.
fn build_search_query(address: &NormalizedAddress, raw_address: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    let street_line = address.street_line();
    if !street_line.is_empty() {
        parts.push(street_line);
    }
    if !address.city.is_empty() {
        parts.push(address.city.clone());
    }
    if parts.is_empty() {
        let raw = collapse(raw_address);
        if raw.is_empty() {
            return String::new();
        }
        parts.push(raw);
    }
    parts.push(COUNTRY.to_string());
    parts.join(", ")
}

/// Cleans the address column into `<prefix> <street> <number>`.
pub fn clean_street_line(raw: &str) -> String {
    let mut addr = collapse(raw);
    if addr.is_empty() {
        return addr;
    }

    addr = patterns::NUMBER_SIGN.replace_all(&addr, " ").into_owned();
    for (wrong, right) in TYPO_FIXES {
        addr = addr.replace(wrong, right);
    }

    addr = patterns::QUALIFIER.replace_all(&addr, "").into_owned();
    addr = patterns::GROUND_FLOOR.replace_all(&addr, "").into_owned();

    addr = patterns::COMPLEX_PREFIX.replace_all(&addr, "жк ").into_owned();
    addr = patterns::STREET_PREFIX
        .replace_all(&addr, |caps: &Captures<'_>| {
            format!("{}. ", caps[1].to_lowercase())
        })
        .into_owned();
    addr = patterns::REPEATED_PREFIX.replace_all(&addr, "$1").into_owned();

    addr = patterns::GLUED_NUMBER.replace_all(&addr, "$1 $2").into_owned();
    addr = collapse(&addr);
    addr = patterns::BUILDING_TAIL.replace(&addr, "$1").into_owned();
    addr = patterns::LANDMARK_TAIL.replace(&addr, "$1").into_owned();
    addr = patterns::COMPLEX_BLOCK.replace_all(&addr, "$1 $2").into_owned();

    addr = patterns::COMMAS.replace_all(&addr, ", ").into_owned();
    addr.trim_matches(|c: char| c == ',' || c == '.' || c.is_whitespace())
        .to_string()
}

/// Splits a trailing house number (`12`, `12А`, `12-14`, `3/1`) off a cleaned street line.
pub fn split_number(line: &str) -> (String, Option<String>) {
    let Some(caps) = patterns::TRAILING_NUMBER.captures(line) else {
        return (line.to_string(), None);
    };
    let Some(number) = caps.get(1) else {
        return (line.to_string(), None);
    };
    let street = line[..number.start()]
        .trim_end_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string();
    (street, Some(number.as_str().to_string()))
}

pub fn clean_city(raw: &str) -> String {
    let mut city = collapse(raw);
    if city.is_empty() {
        return city;
    }
    let upper = city.to_uppercase();
    if let Some((_, alias)) = CITY_ALIASES.iter().find(|(from, _)| upper == *from) {
        return (*alias).to_string();
    }

    city = patterns::CITY_PREFIX.replace(&city, "").into_owned();
    city = patterns::CITY_SUFFIX.replace(&city, "").into_owned();
    city = collapse(&city);

    let letters: Vec<char> = city.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() > 2 && letters.iter().all(|c| c.is_uppercase()) {
        city = title_case(&city);
    }
    city
}

fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_alpha = false;
    for ch in value.chars() {
        if prev_alpha {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        prev_alpha = ch.is_alphabetic();
    }
    out
}

fn collapse(value: &str) -> String {
    patterns::SPACES.replace_all(value.trim(), " ").into_owned()
}
