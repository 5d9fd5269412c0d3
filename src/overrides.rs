use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

const KEY_SEPARATOR: &str = "||";

/// Operator-supplied coordinates for an address no provider resolves correctly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub display_name: String,
}

/// Overrides keyed by `"<address>||<city>"` or `"<address>||<city>||<region>"`.
#[derive(Debug, Clone, Default)]
pub struct ManualOverrides {
    entries: HashMap<String, ManualOverride>,
}

impl ManualOverrides {
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        let raw: HashMap<String, ManualOverride> = serde_json::from_str(&text)?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let parts = key.split(KEY_SEPARATOR).count();
            if !(2..=3).contains(&parts) {
                return Err(AppError::Parse(format!(
                    "override key `{key}` must be `address||city` or `address||city||region`"
                )));
            }
            if !(-90.0..=90.0).contains(&value.lat) || !(-180.0..=180.0).contains(&value.lng) {
                warn!(%key, lat = value.lat, lng = value.lng, "ignoring override with invalid coordinates");
                continue;
            }
            entries.insert(normalize_key(&key), value);
        }
        info!(path = %path.display(), count = entries.len(), "manual overrides loaded");
        Ok(Self { entries })
    }

    pub fn insert(&mut self, address: &str, city: &str, value: ManualOverride) {
        self.entries
            .insert(normalize_key(&compose(&[address, city])), value);
    }

    /// The region-qualified key wins over the plain one.
    pub fn find(&self, address: &str, city: &str, region: &str) -> Option<&ManualOverride> {
        self.entries
            .get(&normalize_key(&compose(&[address, city, region])))
            .or_else(|| self.entries.get(&normalize_key(&compose(&[address, city]))))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn compose(parts: &[&str]) -> String {
    parts.join(KEY_SEPARATOR)
}

fn normalize_key(key: &str) -> String {
    key.split(KEY_SEPARATOR)
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_two_and_three_part_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        fs::write(
            &path,
            r#"{
                "Стефан Стамболов 73||БУРГАС||Бургас": {"lat": 42.492, "lng": 27.470, "display_name": "ул. Стефан Стамболов 73, Бургас"},
                "Сливница 309||СОФИЯ": {"lat": 42.7144, "lng": 23.2753, "provider": "manual"}
            }"#,
        )
        .unwrap();

        let overrides = ManualOverrides::load(&path).unwrap();
        assert_eq!(overrides.len(), 2);
        let burgas = overrides
            .find("Стефан Стамболов 73", "БУРГАС", "Бургас")
            .unwrap();
        assert_eq!(burgas.lat, 42.492);
        assert!(overrides
            .find("Стефан Стамболов 73", "БУРГАС", "Ямбол")
            .is_none());
        let sofia = overrides
            .find("Сливница  309", "СОФИЯ", "София (столица)")
            .unwrap();
        assert_eq!(sofia.lng, 23.2753);
        assert!(sofia.display_name.is_empty());
    }

    #[test]
    fn rejects_malformed_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        fs::write(&path, r#"{"just an address": {"lat": 42.0, "lng": 23.0}}"#).unwrap();
        let err = ManualOverrides::load(&path).unwrap_err();
        assert!(err.to_string().contains("just an address"));
    }

    #[test]
    fn skips_out_of_range_coordinates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overrides.json");
        fs::write(&path, r#"{"a||b": {"lat": 420.0, "lng": 23.0}}"#).unwrap();
        assert!(ManualOverrides::load(&path).unwrap().is_empty());
    }
}
