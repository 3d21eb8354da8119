pub mod row;
pub mod table;
pub mod value;

pub use row::Row;
pub use table::{PartitionedTable, TableRow};
pub use value::{FieldValue, Fields, Record};

use anyhow::Context;
use chrono::{SubsecRound, Utc};
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};
use tracing::{debug, info, instrument};

use crate::error::{Result, ServiceError};

const ROWS_TABLE: &str = "rows";

/// Append-only, schema-less store of uploaded rows.
///
/// `next_id` is held for the whole of id assignment *and* persistence, so
/// concurrent appends can never hand out the same id. The in-memory index is
/// behind its own lock and is only updated once the row file is durable;
/// readers never wait on disk I/O.
pub struct RowStore {
    table: Option<Arc<PartitionedTable<Row>>>,
    next_id: Mutex<u64>,
    rows: RwLock<BTreeMap<u64, Row>>,
}

impl RowStore {
    /// Open (or create) a durable store under `dir` and load every persisted row.
    #[instrument(level = "info", skip(dir), fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let table = PartitionedTable::<Row>::new(dir.as_ref(), ROWS_TABLE)?;
        let mut rows = BTreeMap::new();
        for row in table.load_all().context("loading stored rows")? {
            // a vacuum interrupted between rename and cleanup leaves duplicates
            rows.insert(row.id, row);
        }
        let next_id = rows.keys().next_back().map_or(1, |id| id + 1);
        info!(rows = rows.len(), next_id, "row store opened");

        Ok(Self {
            table: Some(Arc::new(table)),
            next_id: Mutex::new(next_id),
            rows: RwLock::new(rows),
        })
    }

    /// An isolated store that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self {
            table: None,
            next_id: Mutex::new(1),
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.table.is_some()
    }

    /// Validate `record` and append it as a new row.
    pub fn append(&self, source_name: &str, record: Record) -> Result<Row> {
        let fields = validate_record(record)?;
        self.append_fields(source_name, fields)
    }

    /// Append an already validated field map.
    #[instrument(level = "debug", skip(self, fields), fields(source = %source_name))]
    pub fn append_fields(&self, source_name: &str, fields: Fields) -> Result<Row> {
        if fields.is_empty() {
            return Err(ServiceError::Validation("record has no fields".into()));
        }

        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let row = Row {
            id: *next_id,
            source_name: source_name.to_string(),
            fields,
            // stored at µs precision; truncate now so reloads compare equal
            ingested_at: Utc::now().trunc_subsecs(6),
        };
        if let Some(table) = &self.table {
            table
                .append(&row)
                .with_context(|| format!("persisting row {}", row.id))?;
        }
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(row.id, row.clone());
        *next_id += 1;
        debug!(id = row.id, "row appended");
        Ok(row)
    }

    /// Every row, most recently ingested first.
    pub fn list_all(&self) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.ingested_at
                .cmp(&a.ingested_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        rows
    }

    pub fn get(&self, id: u64) -> Option<Row> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compact the on-disk partitions. A no-op for in-memory stores.
    pub fn vacuum(&self) -> Result<usize> {
        match &self.table {
            Some(table) => Ok(table.vacuum()?),
            None => Ok(0),
        }
    }

    pub fn start_vacuum_loop(&self, every: Duration) {
        if let Some(table) = &self.table {
            table.start_vacuum_loop(every);
        }
    }
}

/// Turn a parsed record into a stored field map, rejecting empty records and
/// missing values.
pub fn validate_record(record: Record) -> Result<Fields> {
    if record.is_empty() {
        return Err(ServiceError::Validation("record has no fields".into()));
    }
    record
        .into_iter()
        .map(|(name, value)| match value {
            Some(value) => Ok((name, value)),
            None => Err(ServiceError::Validation(format!(
                "field `{}` is missing a value",
                name
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use tempfile::tempdir;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    fn init_test_logging() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,dataquery::store=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    fn record(pairs: &[(&str, FieldValue)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Some(v.clone())))
            .collect()
    }

    fn apple() -> Record {
        record(&[
            ("item_name", "apple".into()),
            ("price", 1.5f64.into()),
            ("quantity", 10i64.into()),
        ])
    }

    #[test]
    fn test_append_and_get_round_trip() {
        let store = RowStore::in_memory();
        let row = store.append("fruit.csv", apple()).unwrap();

        let fetched = store.get(row.id).unwrap();
        assert_eq!(fetched, row);
        assert_eq!(fetched.source_name, "fruit.csv");
        assert_eq!(Some(fetched.fields), validate_record(apple()).ok());
        assert!(store.get(row.id + 1).is_none());
    }

    #[test]
    fn test_ids_are_sequential() {
        let store = RowStore::in_memory();
        let a = store.append("a.csv", apple()).unwrap();
        let b = store.append("a.csv", apple()).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn test_rejects_missing_and_empty() {
        let store = RowStore::in_memory();
        let mut missing = apple();
        missing.insert("stock".into(), None);

        assert!(matches!(
            store.append("a.csv", missing),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            store.append("a.csv", Record::new()),
            Err(ServiceError::Validation(_))
        ));
        assert!(store.is_empty());
        // a rejected append does not burn an id
        assert_eq!(store.append("a.csv", apple()).unwrap().id, 1);
    }

    #[test]
    fn test_list_all_newest_first() {
        let store = RowStore::in_memory();
        for _ in 0..5 {
            store.append("a.csv", apple()).unwrap();
        }
        let ids: Vec<u64> = store.list_all().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_concurrent_appends_get_unique_ids() {
        let store = Arc::new(RowStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| store.append("a.csv", apple()).unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 200);
        assert_eq!(store.len(), 200);
    }

    #[test]
    fn test_concurrent_durable_appends() {
        init_test_logging();
        let tmp = tempdir().unwrap();
        let store = Arc::new(RowStore::open(tmp.path()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..5)
                        .map(|_| store.append("a.csv", apple()).unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let ids: HashSet<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 20);

        let reopened = RowStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.len(), 20);
    }

    #[test]
    fn test_persistence_across_restarts() {
        init_test_logging();
        let tmp = tempdir().unwrap();
        let first = {
            let store = RowStore::open(tmp.path()).unwrap();
            let mut mixed = apple();
            mixed.insert("organic".into(), Some(true.into()));
            mixed.insert("warehouse".into(), Some("North".into()));
            store.append("fruit.csv", mixed).unwrap()
        };

        let store = RowStore::open(tmp.path()).unwrap();
        assert_eq!(store.get(first.id), Some(first.clone()));

        // ids continue after the highest persisted one
        let next = store.append("fruit.csv", apple()).unwrap();
        assert_eq!(next.id, first.id + 1);
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let tmp = tempdir().unwrap();
        let store = RowStore::open(tmp.path()).unwrap();
        store.append("a.csv", apple()).unwrap();

        let pattern = format!("{}/rows/**/*.tmp", tmp.path().display());
        assert_eq!(glob::glob(&pattern).unwrap().count(), 0);
        let pattern = format!("{}/rows/date=*/*.parquet", tmp.path().display());
        assert_eq!(glob::glob(&pattern).unwrap().count(), 1);
    }

    #[test]
    fn test_vacuum_preserves_rows() {
        init_test_logging();
        let tmp = tempdir().unwrap();
        let store = RowStore::open(tmp.path()).unwrap();
        for _ in 0..3 {
            store.append("a.csv", apple()).unwrap();
        }
        let before = store.list_all();

        assert_eq!(store.vacuum().unwrap(), 3);
        let pattern = format!("{}/rows/date=*/*.parquet", tmp.path().display());
        let files: Vec<_> = glob::glob(&pattern).unwrap().filter_map(|p| p.ok()).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].file_name().unwrap().to_string_lossy(),
            "consolidated.parquet"
        );

        // nothing left to merge
        assert_eq!(store.vacuum().unwrap(), 0);

        // rows appended after a vacuum are folded into the existing file
        store.append("b.csv", apple()).unwrap();
        assert_eq!(store.vacuum().unwrap(), 1);

        let reopened = RowStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.len(), 4);
        assert_eq!(&reopened.list_all()[1..], &before[..]);
    }

    #[test]
    fn test_in_memory_vacuum_is_noop() {
        let store = RowStore::in_memory();
        store.append("a.csv", apple()).unwrap();
        assert!(!store.is_durable());
        assert_eq!(store.vacuum().unwrap(), 0);
    }
}
