use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::error::{Result, ServiceError};
use crate::ingest::{self, UploadSummary};
use crate::requestlog::{LogEntry, RequestLog};
use crate::resolve::{resolve, QueryResult, Question};
use crate::store::{Record, Row, RowStore};

/// Entry points used by the request-handling layer.
#[derive(Clone)]
pub struct DataService {
    store: Arc<RowStore>,
    log: Arc<RequestLog>,
}

impl DataService {
    pub fn new(store: Arc<RowStore>, log: Arc<RequestLog>) -> Self {
        Self { store, log }
    }

    /// Fully in-memory service for tests and one-off tooling.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(RowStore::in_memory()), Arc::new(RequestLog::in_memory()))
    }

    pub fn upload_csv(&self, filename: &str, bytes: &[u8]) -> Result<UploadSummary> {
        ingest::upload_csv(&self.store, filename, bytes)
    }

    pub fn ingest(&self, source_name: &str, records: Vec<Record>) -> Result<Vec<Row>> {
        ingest::ingest_batch(&self.store, source_name, records)
    }

    /// Resolve a question against a snapshot of every stored row.
    pub fn ask(&self, question: &str) -> Result<QueryResult> {
        let question = Question::parse(question)?;
        let rows = self.store.list_all();
        let result = resolve(&question, &rows);
        debug!(
            rows = rows.len(),
            item = ?result.matched_item_key,
            attribute = ?result.matched_attribute,
            "question resolved"
        );
        Ok(result)
    }

    pub fn list(&self) -> Vec<Row> {
        self.store.list_all()
    }

    pub fn get(&self, id: u64) -> Result<Row> {
        self.store
            .get(id)
            .ok_or_else(|| ServiceError::NotFound("Item not found.".into()))
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.log.list_all()
    }

    /// Record a handled request. Failures are logged, never returned.
    pub fn record_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        if let Err(e) = self.log.record(method, path, status, elapsed) {
            warn!(method, path, "failed to record request: {:#}", e);
        }
    }

    pub fn start_vacuum_loops(&self, every: Duration) {
        self.store.start_vacuum_loop(every);
        self.log.start_vacuum_loop(every);
    }
}
