use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

/// Column slots of the registry table, with the header spellings accepted for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryColumn {
    Name,
    Region,
    Municipality,
    Settlement,
    Address,
    Manager,
    Phone,
}

impl RegistryColumn {
    const REQUIRED: [RegistryColumn; 5] = [
        RegistryColumn::Name,
        RegistryColumn::Region,
        RegistryColumn::Municipality,
        RegistryColumn::Settlement,
        RegistryColumn::Address,
    ];

    pub fn as_field(&self) -> &'static str {
        match self {
            RegistryColumn::Name => "name",
            RegistryColumn::Region => "region",
            RegistryColumn::Municipality => "municipality",
            RegistryColumn::Settlement => "settlement",
            RegistryColumn::Address => "address",
            RegistryColumn::Manager => "manager",
            RegistryColumn::Phone => "phone",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            RegistryColumn::Name => &["наименование", "name"],
            RegistryColumn::Region => &["област", "region", "oblast"],
            RegistryColumn::Municipality => &["община", "municipality"],
            RegistryColumn::Settlement => &["населено място", "settlement", "city"],
            RegistryColumn::Address => &["адрес", "address"],
            RegistryColumn::Manager => &["управител", "manager"],
            RegistryColumn::Phone => &["телефон", "phone"],
        }
    }

    fn matches(&self, header: &str) -> bool {
        let header = header.trim().trim_start_matches('\u{feff}').to_lowercase();
        self.aliases().iter().any(|alias| *alias == header)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// 1-based data row index in the source table.
    pub row: usize,
    pub name: String,
    pub region: String,
    pub municipality: String,
    pub settlement: String,
    pub address: String,
    pub manager: Option<String>,
    pub phone: Option<String>,
}

impl RegistryRecord {
    /// Stable identifier over the locating fields; manager and phone stay out of it.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.name,
            &self.region,
            &self.municipality,
            &self.settlement,
            &self.address,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        STANDARD_NO_PAD.encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryLoad {
    pub records: Vec<RegistryRecord>,
    pub skipped: Vec<SkippedRow>,
}

#[derive(Debug)]
struct ColumnMap {
    indices: Vec<(RegistryColumn, usize)>,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> AppResult<Self> {
        let all = [
            RegistryColumn::Name,
            RegistryColumn::Region,
            RegistryColumn::Municipality,
            RegistryColumn::Settlement,
            RegistryColumn::Address,
            RegistryColumn::Manager,
            RegistryColumn::Phone,
        ];
        let mut indices = Vec::new();
        for column in all {
            if let Some(idx) = headers.iter().position(|h| column.matches(h)) {
                indices.push((column, idx));
            }
        }

        let missing: Vec<&str> = RegistryColumn::REQUIRED
            .iter()
            .filter(|col| !indices.iter().any(|(c, _)| c == *col))
            .map(|col| col.as_field())
            .collect();
        if !missing.is_empty() {
            return Err(AppError::Config(format!(
                "input table is missing required columns: {}",
                missing.join(", ")
            )));
        }
        Ok(Self { indices })
    }

    fn index(&self, column: RegistryColumn) -> Option<usize> {
        self.indices
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, idx)| *idx)
    }

    fn required(
        &self,
        record: &csv::StringRecord,
        row: usize,
        column: RegistryColumn,
    ) -> AppResult<String> {
        self.index(column)
            .and_then(|idx| record.get(idx))
            .map(|value| value.trim().to_string())
            .ok_or(AppError::MalformedRecord {
                row,
                field: column.as_field(),
            })
    }

    fn optional(&self, record: &csv::StringRecord, column: RegistryColumn) -> Option<String> {
        self.index(column)
            .and_then(|idx| record.get(idx))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse_record(&self, record: &csv::StringRecord, row: usize) -> AppResult<RegistryRecord> {
        let name = self.required(record, row, RegistryColumn::Name)?;
        if name.is_empty() {
            return Err(AppError::MalformedRecord { row, field: "name" });
        }
        Ok(RegistryRecord {
            row,
            name,
            region: self.required(record, row, RegistryColumn::Region)?,
            municipality: self.required(record, row, RegistryColumn::Municipality)?,
            settlement: self.required(record, row, RegistryColumn::Settlement)?,
            address: self.required(record, row, RegistryColumn::Address)?,
            manager: self.optional(record, RegistryColumn::Manager),
            phone: self.optional(record, RegistryColumn::Phone),
        })
    }
}

/// Reads the registry table. Rows with missing required fields are skipped and reported,
/// a missing required column fails the whole load.
pub fn load_registry<R: Read>(reader: R) -> AppResult<RegistryLoad> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();
    let columns = ColumnMap::from_headers(&headers)?;

    let mut load = RegistryLoad::default();
    for (idx, result) in csv_reader.records().enumerate() {
        let row = idx + 1;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                warn!(row, ?err, "unreadable registry row");
                load.skipped.push(SkippedRow {
                    row,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if record.iter().all(|cell| cell.trim().is_empty()) {
            debug!(row, "skipping blank registry row");
            continue;
        }
        match columns.parse_record(&record, row) {
            Ok(parsed) => load.records.push(parsed),
            Err(err) => {
                warn!(row, %err, "skipping malformed registry row");
                load.skipped.push(SkippedRow {
                    row,
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(load)
}

pub fn load_registry_file(path: &Path) -> AppResult<RegistryLoad> {
    let file = File::open(path)?;
    load_registry(file)
}
