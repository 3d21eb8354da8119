use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, Float64Array, StringArray, TimestampMicrosecondArray, UInt16Array, UInt64Array},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::Serialize;
use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use crate::store::table::{column, PartitionedTable, TableRow};

const LOGS_TABLE: &str = "logs";

/// One handled HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: f64,
}

impl TableRow for LogEntry {
    fn partition_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    fn schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            Field::new("id", ArrowDataType::UInt64, false),
            Field::new(
                "timestamp",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
            Field::new("method", ArrowDataType::Utf8, false),
            Field::new("path", ArrowDataType::Utf8, false),
            Field::new("status_code", ArrowDataType::UInt16, false),
            Field::new("response_time_ms", ArrowDataType::Float64, false),
        ])
    }

    fn to_arrays(&self) -> Result<Vec<ArrayRef>> {
        Ok(vec![
            Arc::new(UInt64Array::from(vec![self.id])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .timestamp
                .timestamp_micros()])),
            Arc::new(StringArray::from(vec![self.method.clone()])),
            Arc::new(StringArray::from(vec![self.path.clone()])),
            Arc::new(UInt16Array::from(vec![self.status_code])),
            Arc::new(Float64Array::from(vec![self.response_time_ms])),
        ])
    }

    fn file_key(&self) -> String {
        format!("log-{}", self.id)
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let ids = column::<UInt64Array>(batch, "id")?;
        let times = column::<TimestampMicrosecondArray>(batch, "timestamp")?;
        let methods = column::<StringArray>(batch, "method")?;
        let paths = column::<StringArray>(batch, "path")?;
        let statuses = column::<UInt16Array>(batch, "status_code")?;
        let elapsed = column::<Float64Array>(batch, "response_time_ms")?;

        (0..batch.num_rows())
            .map(|i| {
                Ok(LogEntry {
                    id: ids.value(i),
                    timestamp: DateTime::from_timestamp_micros(times.value(i))
                        .with_context(|| format!("log {} has an out-of-range timestamp", ids.value(i)))?,
                    method: methods.value(i).to_string(),
                    path: paths.value(i).to_string(),
                    status_code: statuses.value(i),
                    response_time_ms: elapsed.value(i),
                })
            })
            .collect()
    }
}

/// Append-only log of handled requests, newest first on read.
pub struct RequestLog {
    table: Option<Arc<PartitionedTable<LogEntry>>>,
    next_id: Mutex<u64>,
    entries: RwLock<Vec<LogEntry>>,
}

impl RequestLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let table = PartitionedTable::<LogEntry>::new(dir.as_ref(), LOGS_TABLE)?;
        let mut entries = table.load_all().context("loading request log")?;
        entries.sort_by_key(|e| e.id);
        entries.dedup_by_key(|e| e.id);
        let next_id = entries.last().map_or(1, |e| e.id + 1);
        Ok(Self {
            table: Some(Arc::new(table)),
            next_id: Mutex::new(next_id),
            entries: RwLock::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            table: None,
            next_id: Mutex::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn record(
        &self,
        method: &str,
        path: &str,
        status_code: u16,
        elapsed: Duration,
    ) -> Result<LogEntry> {
        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = LogEntry {
            id: *next_id,
            timestamp: Utc::now().trunc_subsecs(6),
            method: method.to_string(),
            path: path.to_string(),
            status_code,
            response_time_ms: elapsed.as_secs_f64() * 1000.0,
        };
        if let Some(table) = &self.table {
            table.append(&entry)?;
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        *next_id += 1;
        Ok(entry)
    }

    pub fn list_all(&self) -> Vec<LogEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().cloned().collect()
    }

    pub fn vacuum(&self) -> Result<usize> {
        match &self.table {
            Some(table) => table.vacuum(),
            None => Ok(0),
        }
    }

    pub fn start_vacuum_loop(&self, every: Duration) {
        if let Some(table) = &self.table {
            table.start_vacuum_loop(every);
        }
    }
}
