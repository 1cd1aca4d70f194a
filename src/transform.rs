use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::MetricColumn;
use crate::error::IngestError;
use crate::store::CURATED_SUFFIX;

pub fn curated_name(raw_name: &str) -> String {
    match raw_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}{CURATED_SUFFIX}.{ext}"),
        None => format!("{raw_name}{CURATED_SUFFIX}"),
    }
}

/// Copies `source` to `dest` adding one column per metric. Columns already
/// present in the header are recomputed in place.
pub fn add_metrics(
    source: &Utf8Path,
    dest: &Utf8Path,
    metrics: &[MetricColumn],
) -> Result<Utf8PathBuf, IngestError> {
    let fail = |message: String| IngestError::Transform {
        path: source.to_string(),
        message,
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(source.as_std_path())
        .map_err(|err| fail(err.to_string()))?;
    let mut writer =
        csv::Writer::from_path(dest.as_std_path()).map_err(|err| fail(err.to_string()))?;

    let mut header: Vec<String> = reader
        .headers()
        .map_err(|err| fail(err.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    let column = |name: &str, header: &[String]| header.iter().position(|h| h == name);

    let mut plan = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let target = match column(metric.name, &header) {
            Some(index) => index,
            None => {
                header.push(metric.name.to_string());
                header.len() - 1
            }
        };
        plan.push((
            target,
            column(metric.left, &header),
            column(metric.right, &header),
        ));
    }
    writer
        .write_record(&header)
        .map_err(|err| fail(err.to_string()))?;

    for record in reader.records() {
        let record = record.map_err(|err| fail(err.to_string()))?;
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        row.resize(header.len(), String::new());
        for &(target, left, right) in &plan {
            let value = cell(&record, left) * cell(&record, right);
            row[target] = format!("{}", value.round() as i64);
        }
        writer
            .write_record(&row)
            .map_err(|err| fail(err.to_string()))?;
    }
    writer.flush().map_err(|err| fail(err.to_string()))?;
    Ok(dest.to_path_buf())
}

fn cell(record: &csv::StringRecord, index: Option<usize>) -> f64 {
    index
        .and_then(|index| record.get(index))
        .map(parse_number)
        .unwrap_or(0.0)
}

/// Lenient numeric parse: trims, drops thousands separators, blank or
/// malformed values count as zero.
pub fn parse_number(raw: &str) -> f64 {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return 0.0;
    }
    cleaned.parse::<f64>().unwrap_or(0.0)
}
