pub mod csv_reader;

pub use csv_reader::parse_csv;

use serde::Serialize;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::error::{Result, ServiceError};
use crate::store::{validate_record, Record, Row, RowStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub source_name: String,
    pub rows_inserted: usize,
    pub message: String,
}

/// Store `records` as individual rows, or none of them.
///
/// Every record is validated before the first append, so a single bad
/// record rejects the batch with nothing written.
#[instrument(level = "info", skip(store, records), fields(records = records.len()))]
pub fn ingest_batch(store: &RowStore, source_name: &str, records: Vec<Record>) -> Result<Vec<Row>> {
    let validated = records
        .into_iter()
        .enumerate()
        .map(|(idx, record)| {
            validate_record(record).map_err(|e| match e {
                ServiceError::Validation(reason) => {
                    ServiceError::Validation(format!("record {}: {}", idx + 1, reason))
                }
                other => other,
            })
        })
        .collect::<Result<Vec<_>>>()
        .inspect_err(|e| warn!(source = source_name, "batch rejected: {}", e))?;

    validated
        .into_iter()
        .map(|fields| store.append_fields(source_name, fields))
        .collect()
}

/// Parse an uploaded CSV file and ingest all of its rows.
#[instrument(level = "info", skip(store, bytes), fields(bytes = bytes.len()))]
pub fn upload_csv(store: &RowStore, filename: &str, bytes: &[u8]) -> Result<UploadSummary> {
    if !filename.ends_with(".csv") {
        return Err(ServiceError::UnsupportedFile(
            "Invalid file type. Only CSV files are allowed.".into(),
        ));
    }
    let start = Instant::now();
    let records = parse_csv(bytes)?;
    let rows = ingest_batch(store, filename, records)?;
    info!(rows = rows.len(), elapsed = ?start.elapsed(), "csv stored");

    Ok(UploadSummary {
        source_name: filename.to_string(),
        rows_inserted: rows.len(),
        message: format!(
            "CSV file '{}' uploaded and {} rows stored successfully.",
            filename,
            rows.len()
        ),
    })
}
