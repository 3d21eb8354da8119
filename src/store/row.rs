use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, StringArray, TimestampMicrosecondArray, UInt64Array},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::table::{column, TableRow};
use super::value::Fields;

/// One ingested record with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: u64,
    pub source_name: String,
    pub fields: Fields,
    pub ingested_at: DateTime<Utc>,
}

impl TableRow for Row {
    fn partition_date(&self) -> NaiveDate {
        self.ingested_at.date_naive()
    }

    fn schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            Field::new("id", ArrowDataType::UInt64, false),
            Field::new("source_name", ArrowDataType::Utf8, false),
            Field::new("row_data", ArrowDataType::Utf8, false),
            Field::new(
                "ingested_at",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ])
    }

    fn to_arrays(&self) -> Result<Vec<ArrayRef>> {
        let row_data = serde_json::to_string(&self.fields).context("encoding row_data")?;
        Ok(vec![
            Arc::new(UInt64Array::from(vec![self.id])),
            Arc::new(StringArray::from(vec![self.source_name.clone()])),
            Arc::new(StringArray::from(vec![row_data])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .ingested_at
                .timestamp_micros()])),
        ])
    }

    fn file_key(&self) -> String {
        format!("row-{}", self.id)
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        let ids = column::<UInt64Array>(batch, "id")?;
        let sources = column::<StringArray>(batch, "source_name")?;
        let data = column::<StringArray>(batch, "row_data")?;
        let times = column::<TimestampMicrosecondArray>(batch, "ingested_at")?;

        (0..batch.num_rows())
            .map(|i| {
                let id = ids.value(i);
                let fields: Fields = serde_json::from_str(data.value(i))
                    .with_context(|| format!("row {} has malformed row_data", id))?;
                let ingested_at = DateTime::from_timestamp_micros(times.value(i))
                    .with_context(|| format!("row {} has an out-of-range timestamp", id))?;
                Ok(Row {
                    id,
                    source_name: sources.value(i).to_string(),
                    fields,
                    ingested_at,
                })
            })
            .collect()
    }
}
