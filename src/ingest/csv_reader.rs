use csv::ReaderBuilder;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{Result, ServiceError};
use crate::store::{FieldValue, Record};

/// Cell spellings read as "no value", the same set common dataframe
/// readers treat as NA.
const MISSING_MARKERS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Integer,
    Float,
    Text,
}

impl ColumnKind {
    fn of_cell(cell: &str) -> Self {
        if parse_bool(cell).is_some() {
            ColumnKind::Bool
        } else if cell.parse::<i64>().is_ok() {
            ColumnKind::Integer
        } else if cell.parse::<f64>().is_ok_and(f64::is_finite) {
            ColumnKind::Float
        } else {
            ColumnKind::Text
        }
    }

    /// Integers widen to floats; any other disagreement falls back to text.
    fn merge(self, other: Self) -> Self {
        use ColumnKind::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => Text,
        }
    }

    fn convert(self, cell: &str) -> FieldValue {
        let typed = match self {
            ColumnKind::Bool => parse_bool(cell).map(FieldValue::Bool),
            ColumnKind::Integer => cell.parse().ok().map(FieldValue::Integer),
            ColumnKind::Float => cell.parse().ok().map(FieldValue::Float),
            ColumnKind::Text => None,
        };
        typed.unwrap_or_else(|| FieldValue::Text(cell.to_string()))
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    if cell.eq_ignore_ascii_case("true") {
        Some(true)
    } else if cell.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Trim a raw cell; `None` if it spells a missing value.
fn clean_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if MISSING_MARKERS.contains(&trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Blank headers become `Unnamed: <idx>`; repeats get a `.1`, `.2`, ... suffix.
fn header_names<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.enumerate()
        .map(|(idx, name)| {
            let name = name.trim();
            let base = if name.is_empty() {
                format!("Unnamed: {}", idx)
            } else {
                name.to_string()
            };
            let count = seen.entry(base.clone()).or_insert(0);
            let unique = if *count == 0 {
                base
            } else {
                format!("{}.{}", base, count)
            };
            *count += 1;
            unique
        })
        .collect()
}

/// Parse a UTF-8 CSV document with a header row into typed records.
///
/// Column types are inferred from all non-missing cells of the column.
/// Missing cells are kept as `None` so validation can reject them.
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<Record>> {
    let text = std::str::from_utf8(bytes).map_err(|e| ServiceError::Decode(e.to_string()))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());
    let headers = rdr
        .headers()
        .map_err(|e| ServiceError::Parse(e.to_string()))?
        .clone();
    if headers.is_empty() {
        return Err(ServiceError::EmptyFile);
    }
    let headers = header_names(headers.iter());

    let mut cells: Vec<Vec<Option<String>>> = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        let record = result.map_err(|e| ServiceError::Parse(format!("record {}: {}", idx + 1, e)))?;
        cells.push(record.iter().map(clean_cell).collect());
    }
    if cells.is_empty() {
        return Err(ServiceError::EmptyFile);
    }

    let kinds: Vec<ColumnKind> = (0..headers.len())
        .map(|col| {
            cells
                .iter()
                .filter_map(|row| row[col].as_deref())
                .map(ColumnKind::of_cell)
                .reduce(ColumnKind::merge)
                .unwrap_or(ColumnKind::Text)
        })
        .collect();
    debug!(columns = headers.len(), rows = cells.len(), ?kinds, "parsed csv");

    Ok(cells
        .into_iter()
        .map(|row| {
            headers
                .iter()
                .zip(kinds.iter())
                .zip(row)
                .map(|((name, kind), cell)| (name.clone(), cell.map(|c| kind.convert(&c))))
                .collect()
        })
        .collect())
}
