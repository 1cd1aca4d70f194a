use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{MANIFEST_KEY, validate_year};
use crate::error::IngestError;
use crate::object_store::{ObjectStore, upload_bytes};

pub const AIRPORT_COLUMN: &str = "ORIGIN";
pub const QUARTER_COLUMN: &str = "QUARTER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub generated_at: NaiveDate,
    pub key: String,
    pub years: Vec<YearCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearCounts {
    pub year: i32,
    pub total_rows: u64,
    pub airports: BTreeMap<String, AirportCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirportCounts {
    pub total: u64,
    pub quarters: BTreeMap<String, u64>,
}

impl Default for AirportCounts {
    fn default() -> Self {
        Self {
            total: 0,
            quarters: ["1", "2", "3", "4"]
                .into_iter()
                .map(|q| (q.to_string(), 0))
                .collect(),
        }
    }
}

impl AirportCounts {
    fn add(&mut self, quarter: &str, count: u64) {
        *self.quarters.entry(quarter.to_string()).or_insert(0) += count;
        self.total += count;
    }
}

/// Counts rows per airport and quarter in one curated CSV. Rows missing
/// either value, or with a quarter outside 1..=4, are ignored.
pub fn count_rows(
    csv_bytes: &[u8],
    source: &str,
) -> Result<BTreeMap<String, AirportCounts>, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_bytes);
    let headers = reader
        .headers()
        .map_err(|err| IngestError::Manifest(format!("{source}: {err}")))?
        .clone();
    let position = |name: &str| {
        headers.iter().position(|h| h == name).ok_or_else(|| {
            IngestError::Manifest(format!("missing '{name}' column in {source}"))
        })
    };
    let airport_index = position(AIRPORT_COLUMN)?;
    let quarter_index = position(QUARTER_COLUMN)?;

    let mut counts: BTreeMap<String, AirportCounts> = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|err| IngestError::Manifest(format!("{source}: {err}")))?;
        let airport = record.get(airport_index).map(str::trim).unwrap_or_default();
        let quarter = record
            .get(quarter_index)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .map(|q| q as i64);
        let Some(quarter @ 1..=4) = quarter else {
            continue;
        };
        if airport.is_empty() {
            continue;
        }
        counts
            .entry(airport.to_string())
            .or_default()
            .add(&quarter.to_string(), 1);
    }
    Ok(counts)
}

fn curated_csvs(
    store: &dyn ObjectStore,
    container: &str,
    year: i32,
) -> Result<Vec<String>, IngestError> {
    Ok(store
        .list(container, &format!("{year}/"))?
        .into_iter()
        .filter(|name| name.contains("/curated/") && name.ends_with(".csv"))
        .collect())
}

pub fn build_manifest(
    store: &dyn ObjectStore,
    container: &str,
    start: i32,
    end: i32,
    generated_at: NaiveDate,
) -> Result<Manifest, IngestError> {
    let start = validate_year(start)?;
    let end = validate_year(end)?;
    if start > end {
        return Err(IngestError::InvalidRange { start, end });
    }

    let mut years = Vec::new();
    for year in start..=end {
        let files = curated_csvs(store, container, year)?;
        if files.is_empty() {
            debug!(year, "no curated files; year omitted");
            continue;
        }

        let mut airports: BTreeMap<String, AirportCounts> = BTreeMap::new();
        let mut total_rows = 0;
        for name in &files {
            let bytes = store.get(container, name)?;
            for (airport, counts) in count_rows(&bytes, name)? {
                let entry = airports.entry(airport).or_default();
                for (quarter, count) in &counts.quarters {
                    entry.add(quarter, *count);
                }
                total_rows += counts.total;
            }
        }
        info!(year, files = files.len(), total_rows, "year counted");
        years.push(YearCounts {
            year,
            total_rows,
            airports,
        });
    }

    Ok(Manifest {
        generated_at,
        key: AIRPORT_COLUMN.to_string(),
        years,
    })
}

pub fn publish_manifest(
    store: &dyn ObjectStore,
    container: &str,
    start: i32,
    end: i32,
) -> Result<Manifest, IngestError> {
    let manifest = build_manifest(store, container, start, end, Utc::now().date_naive())?;
    let body = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| IngestError::Manifest(err.to_string()))?;
    upload_bytes(
        store,
        container,
        MANIFEST_KEY,
        &body,
        Some("application/json"),
        true,
    )?;
    info!(key = MANIFEST_KEY, years = manifest.years.len(), "manifest written");
    Ok(manifest)
}
