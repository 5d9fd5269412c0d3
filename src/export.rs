use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};
use crate::pipeline::AnnotatedRecord;
use crate::scoring::{QualityScore, QualityTier};

const GOOGLE_MAPS_SEARCH: &str = "https://www.google.com/maps/search/";
const OSM_BASE: &str = "https://www.openstreetmap.org/";
const OSM_SEARCH: &str = "https://www.openstreetmap.org/search";

/// One row of the annotated output table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub name: String,
    pub region: String,
    pub municipality: String,
    pub settlement: String,
    pub address: String,
    pub manager: Option<String>,
    pub phone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub quality_score: Option<u8>,
    pub quality_tier: String,
    pub provider: Option<String>,
    pub display_name: Option<String>,
    pub strategy: Option<String>,
    pub street_number: Option<String>,
    pub street_name_clean: Option<String>,
    pub search_query: String,
    pub original_address: String,
    pub original_city: String,
}

impl From<&AnnotatedRecord> for OutputRow {
    fn from(entry: &AnnotatedRecord) -> Self {
        let record = &entry.record;
        let result = entry.result.as_ref();
        Self {
            name: record.name.clone(),
            region: record.region.clone(),
            municipality: record.municipality.clone(),
            settlement: record.settlement.clone(),
            address: record.address.clone(),
            manager: record.manager.clone(),
            phone: record.phone.clone(),
            latitude: result.map(|r| r.lat),
            longitude: result.map(|r| r.lng),
            quality_score: entry.score.map(|s| s.value()),
            quality_tier: entry.tier().as_str().to_string(),
            provider: result.map(|r| r.provider.clone()),
            display_name: result.map(|r| r.display_name.clone()),
            strategy: result.map(|r| r.strategy.as_str().to_string()),
            street_number: entry.address.street_number.clone(),
            street_name_clean: entry.address.street_name_clean.clone(),
            search_query: entry.address.search_query.clone(),
            original_address: record.address.clone(),
            original_city: record.settlement.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRow {
    pub row: usize,
    pub name: String,
    pub address: String,
    pub city: String,
    pub region: String,
    pub provider: Option<String>,
    pub quality_score: Option<u8>,
    pub quality_tier: String,
    pub google_maps_url: String,
    pub osm_url: String,
    pub note: String,
}

impl ReviewRow {
    fn from_record(entry: &AnnotatedRecord) -> AppResult<Self> {
        let record = &entry.record;
        let coordinates = entry.result.as_ref().map(|r| (r.lat, r.lng));
        let note = match coordinates {
            Some(_) => "verify the point against the building entrance",
            None => "no coordinates; locate the building and add addr:street/addr:housenumber",
        };
        Ok(Self {
            row: record.row,
            name: record.name.clone(),
            address: record.address.clone(),
            city: record.settlement.clone(),
            region: record.region.clone(),
            provider: entry.result.as_ref().map(|r| r.provider.clone()),
            quality_score: entry.score.map(|s| s.value()),
            quality_tier: entry.tier().as_str().to_string(),
            google_maps_url: google_maps_link(coordinates, &entry.address.search_query)?,
            osm_url: osm_link(coordinates, &entry.address.search_query)?,
            note: note.to_string(),
        })
    }
}

pub fn write_output<W: Write>(writer: W, records: &[AnnotatedRecord]) -> AppResult<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for entry in records {
        csv_writer.serialize(OutputRow::from(entry))?;
    }
    csv_writer.flush()?;
    Ok(())
}

pub fn write_output_file(path: &Path, records: &[AnnotatedRecord]) -> AppResult<()> {
    ensure_parent(path)?;
    write_output(File::create(path)?, records)
}

/// Writes the records that are missing or scored below 60; returns how many were written.
pub fn write_review<W: Write>(writer: W, records: &[AnnotatedRecord]) -> AppResult<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    let mut written = 0;
    for entry in records.iter().filter(|entry| entry.needs_review()) {
        csv_writer.serialize(ReviewRow::from_record(entry)?)?;
        written += 1;
    }
    csv_writer.flush()?;
    Ok(written)
}

pub fn write_review_file(path: &Path, records: &[AnnotatedRecord]) -> AppResult<usize> {
    ensure_parent(path)?;
    write_review(File::create(path)?, records)
}

fn ensure_parent(path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn google_maps_link(coordinates: Option<(f64, f64)>, query: &str) -> AppResult<String> {
    let query = match coordinates {
        Some((lat, lng)) => format!("{lat},{lng}"),
        None => query.to_string(),
    };
    let url = Url::parse_with_params(GOOGLE_MAPS_SEARCH, &[("api", "1"), ("query", query.as_str())])
        .map_err(|err| AppError::Parse(err.to_string()))?;
    Ok(url.to_string())
}

pub fn osm_link(coordinates: Option<(f64, f64)>, query: &str) -> AppResult<String> {
    let url = match coordinates {
        Some((lat, lng)) => {
            let mut url = Url::parse_with_params(
                OSM_BASE,
                &[("mlat", lat.to_string()), ("mlon", lng.to_string())],
            )
            .map_err(|err| AppError::Parse(err.to_string()))?;
            url.set_fragment(Some(&format!("map=19/{lat}/{lng}")));
            url
        }
        None => Url::parse_with_params(OSM_SEARCH, &[("query", query)])
            .map_err(|err| AppError::Parse(err.to_string()))?,
    };
    Ok(url.to_string())
}

/// Tier and provider breakdown of a finished output table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityReport {
    pub total: usize,
    pub by_tier: BTreeMap<QualityTier, usize>,
    pub by_provider: BTreeMap<String, usize>,
    pub by_strategy: BTreeMap<String, usize>,
    pub average_score: Option<f64>,
}

impl QualityReport {
    pub fn tier_count(&self, tier: QualityTier) -> usize {
        self.by_tier.get(&tier).copied().unwrap_or(0)
    }
}

impl fmt::Display for QualityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total records: {}", self.total)?;
        for tier in QualityTier::ALL {
            let count = self.tier_count(tier);
            let share = if self.total == 0 {
                0.0
            } else {
                count as f64 * 100.0 / self.total as f64
            };
            writeln!(
                f,
                "  {:<10} {:>7}  {:>5}  ({share:.1}%)",
                tier.as_str(),
                tier.range_label(),
                count
            )?;
        }
        if let Some(average) = self.average_score {
            writeln!(f, "Average score: {average:.1}")?;
        }
        writeln!(f, "Providers:")?;
        for (provider, count) in &self.by_provider {
            writeln!(f, "  {provider:<16} {count:>5}")?;
        }
        write!(f, "Strategies:")?;
        for (strategy, count) in &self.by_strategy {
            write!(f, "\n  {strategy:<16} {count:>5}")?;
        }
        Ok(())
    }
}

/// Reads an output table back. Tiers are recomputed from the score column.
pub fn read_report<R: Read>(reader: R) -> AppResult<QualityReport> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut report = QualityReport::default();
    let mut score_sum = 0_u64;
    let mut scored = 0_u64;
    for row in csv_reader.deserialize::<OutputRow>() {
        let row = row?;
        report.total += 1;
        let score = row.quality_score.map(QualityScore::new);
        *report.by_tier.entry(QualityTier::of(score)).or_default() += 1;
        if let Some(score) = score {
            score_sum += u64::from(score.value());
            scored += 1;
        }
        let provider = row.provider.unwrap_or_else(|| "none".to_string());
        *report.by_provider.entry(provider).or_default() += 1;
        let strategy = row.strategy.unwrap_or_else(|| "none".to_string());
        *report.by_strategy.entry(strategy).or_default() += 1;
    }
    if scored > 0 {
        report.average_score = Some(score_sum as f64 / scored as f64);
    }
    Ok(report)
}

pub fn read_report_file(path: &Path) -> AppResult<QualityReport> {
    read_report(File::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::registry::RegistryRecord;
    use crate::resolver::{GeocodeResult, ResolutionSource};
    use crate::scoring::{score, Strategy};

    fn annotated(address: &str, city: &str, hit: Option<(f64, f64, Strategy)>) -> AnnotatedRecord {
        let record = RegistryRecord {
            row: 7,
            name: "МБАЛ Тест".into(),
            region: "Варна".into(),
            municipality: "Варна".into(),
            settlement: city.into(),
            address: address.into(),
            manager: None,
            phone: Some("052 000 000".into()),
        };
        let normalized = normalize(address, city);
        let result = hit.map(|(lat, lng, strategy)| GeocodeResult {
            lat,
            lng,
            display_name: "Шипка 3, Варна".into(),
            provider: "nominatim".into(),
            strategy,
        });
        let quality = result
            .as_ref()
            .map(|r| score(r.strategy, &normalized, &r.display_name));
        AnnotatedRecord {
            source: if result.is_some() {
                ResolutionSource::Network
            } else {
                ResolutionSource::Unresolved
            },
            record,
            address: normalized,
            result,
            score: quality,
        }
    }

    #[test]
    fn output_round_trips_through_report() {
        let records = vec![
            annotated("ул. Шипка 3", "Варна", Some((43.2, 27.91, Strategy::Structured))),
            annotated("", "Варна", Some((43.21, 27.92, Strategy::CityFallback))),
            annotated("ул. Непозната", "Варна", None),
        ];
        let mut buffer = Vec::new();
        write_output(&mut buffer, &records).unwrap();

        let text = String::from_utf8(buffer.clone()).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.starts_with("name,region,municipality,settlement,address,manager,phone,latitude,longitude"));
        assert!(header.ends_with("search_query,original_address,original_city"));
        let missing = text.lines().nth(3).unwrap();
        assert!(missing.contains(",,,missing,"));

        let report = read_report(buffer.as_slice()).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.tier_count(QualityTier::Excellent), 1);
        assert_eq!(report.tier_count(QualityTier::Fair), 1);
        assert_eq!(report.tier_count(QualityTier::Missing), 1);
        assert_eq!(report.by_provider.get("nominatim"), Some(&2));
        assert_eq!(report.by_strategy.get("city_fallback"), Some(&1));
        assert!(report.to_string().contains("Average score"));
    }

    #[test]
    fn review_lists_low_and_missing_rows() {
        let records = vec![
            annotated("ул. Шипка 3", "Варна", Some((43.2, 27.91, Strategy::Structured))),
            annotated("", "Варна", Some((43.21, 27.92, Strategy::CityFallback))),
            annotated("ул. Непозната", "Варна", None),
        ];
        let mut buffer = Vec::new();
        let written = write_review(&mut buffer, &records).unwrap();
        assert_eq!(written, 2);
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("mlat=43.21"));
        assert!(text.contains("openstreetmap.org/search?query="));
        assert!(!text.contains("43.2,27.91"));
    }

    #[test]
    fn links_use_coordinates_when_present() {
        assert_eq!(
            google_maps_link(Some((42.5, 27.47)), "ignored").unwrap(),
            "https://www.google.com/maps/search/?api=1&query=42.5%2C27.47"
        );
        assert_eq!(
            osm_link(Some((42.5, 27.47)), "").unwrap(),
            "https://www.openstreetmap.org/?mlat=42.5&mlon=27.47#map=19/42.5/27.47"
        );
        let search = osm_link(None, "ул. Шипка, Варна").unwrap();
        assert!(search.starts_with("https://www.openstreetmap.org/search?query="));
        assert!(!search.contains(' '));
    }
}
