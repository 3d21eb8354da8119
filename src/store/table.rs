use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef},
    datatypes::Schema as ArrowSchema,
    record_batch::RecordBatch,
};
use chrono::{NaiveDate, Utc};
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use rayon::prelude::*;
use std::{
    fs::{self, File},
    io::BufWriter,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

const CONSOLIDATED: &str = "consolidated.parquet";

/// A record type that can be stored in a [`PartitionedTable`].
/// - Defines schema and column conversion for writes.
/// - Decodes whole batches back into records for loads.
pub trait TableRow: Sized {
    /// Partition date (UTC naive) for hive partitioning
    fn partition_date(&self) -> NaiveDate;
    /// Arrow schema for this row type
    fn schema() -> ArrowSchema;
    /// Convert this row into column arrays matching the schema
    fn to_arrays(&self) -> Result<Vec<ArrayRef>>;
    /// Stable key used in the on-disk file name
    fn file_key(&self) -> String;
    /// Decode every row of a batch read back from disk
    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>>;
}

/// Look up a column by name and downcast it to its concrete array type.
pub(crate) fn column<'a, A: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a A> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column `{}`", name))?
        .as_any()
        .downcast_ref::<A>()
        .with_context(|| format!("column `{}` has an unexpected type", name))
}

/// Generic hive-partitioned Parquet table: `<base>/<table>/date=YYYYMMDD/*.parquet`.
///
/// Every append is one small file written to a `.tmp` path and renamed into
/// place, so a half-written row is never picked up by a later load.
pub struct PartitionedTable<R: TableRow> {
    base_dir: PathBuf,
    table: String,
    schema: Arc<ArrowSchema>,
    vacuum_lock: Mutex<()>,
    _marker: PhantomData<R>,
}

impl<R: TableRow + Send + Sync + 'static> PartitionedTable<R> {
    /// Create the table directory if needed. Does *not* load anything.
    pub fn new(base_dir: impl Into<PathBuf>, table: &str) -> Result<Self> {
        let base_dir = base_dir.into();
        let table_dir = base_dir.join(table);
        fs::create_dir_all(&table_dir)
            .with_context(|| format!("could not create `{}`", table_dir.display()))?;

        Ok(Self {
            base_dir,
            table: table.to_string(),
            schema: Arc::new(R::schema()),
            vacuum_lock: Mutex::new(()),
            _marker: PhantomData,
        })
    }

    pub fn table_dir(&self) -> PathBuf {
        self.base_dir.join(&self.table)
    }

    fn data_files(&self) -> Result<Vec<PathBuf>> {
        let pattern = format!("{}/date=*/*.parquet", self.table_dir().display());
        let files = glob(&pattern)
            .with_context(|| format!("invalid glob pattern `{}`", pattern))?
            .filter_map(|p| p.ok())
            .collect();
        Ok(files)
    }

    /// Read every persisted row. Files are decoded in parallel; the order of
    /// the result is unspecified.
    pub fn load_all(&self) -> Result<Vec<R>> {
        let files = self.data_files()?;
        debug!(table = %self.table, files = files.len(), "loading table");
        let per_file = files
            .par_iter()
            .map(|path| read_file::<R>(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(per_file.into_iter().flatten().collect())
    }

    /// Persist one row as its own single-row Parquet file.
    pub fn append(&self, row: &R) -> Result<PathBuf> {
        let partition = format!("date={}", row.partition_date().format("%Y%m%d"));
        let dir = self.table_dir().join(partition);
        fs::create_dir_all(&dir).with_context(|| format!("could not create `{}`", dir.display()))?;

        let ts = Utc::now().timestamp_micros();
        let fname = format!("{}---{}.parquet", row.file_key(), ts);
        let tmp = dir.join(format!("{}.tmp", fname));
        let final_path = dir.join(&fname);

        let batch = RecordBatch::try_new(self.schema.clone(), row.to_arrays()?)
            .context("building single-row record batch")?;
        if let Err(err) = self.write_batches(&tmp, std::iter::once(Ok(batch))) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        fs::rename(&tmp, &final_path).with_context(|| {
            format!(
                "failed to rename `{}` to `{}`",
                tmp.display(),
                final_path.display()
            )
        })?;
        Ok(final_path)
    }

    fn write_batches(
        &self,
        path: &Path,
        batches: impl IntoIterator<Item = Result<RecordBatch>>,
    ) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("could not create `{}`", path.display()))?;
        let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)
            .context("creating ArrowWriter")?;
        for batch in batches {
            writer.write(&batch?).context("writing record batch")?;
        }
        let file = writer
            .into_inner()
            .context("finishing Parquet footer")?
            .into_inner()
            .map_err(|e| e.into_error())
            .context("flushing Parquet file")?;
        file.sync_all()
            .with_context(|| format!("syncing `{}`", path.display()))?;
        Ok(())
    }

    /// Merge each partition into one `consolidated.parquet` and delete the
    /// files that were merged. Returns how many files were folded in.
    pub fn vacuum(&self) -> Result<usize> {
        let _guard = self
            .vacuum_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut merged = 0;
        for part in fs::read_dir(self.table_dir())? {
            let part = part?;
            if !part.file_type()?.is_dir() {
                continue;
            }
            let dir = part.path();

            let files = glob(&format!("{}/*.parquet", dir.display()))?
                .filter_map(|p| p.ok())
                .collect::<Vec<_>>();
            let singles = files
                .iter()
                .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some(CONSOLIDATED))
                .count();
            if singles == 0 {
                continue;
            }

            let tmp = dir.join(format!("{}.tmp", CONSOLIDATED));
            let batches = files.iter().flat_map(|p| match read_batches(p) {
                Ok(batches) => batches.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            });
            self.write_batches(&tmp, batches)
                .with_context(|| format!("consolidating `{}`", dir.display()))?;
            fs::rename(&tmp, dir.join(CONSOLIDATED))?;

            for p in files {
                if p.file_name().and_then(|n| n.to_str()) != Some(CONSOLIDATED) {
                    fs::remove_file(&p)
                        .with_context(|| format!("failed to delete `{}`", p.display()))?;
                }
            }
            merged += singles;
        }
        if merged > 0 {
            info!(table = %self.table, merged, "vacuumed partitions");
        }
        Ok(merged)
    }

    /// Spawn a background vacuum loop.
    pub fn start_vacuum_loop(self: &Arc<Self>, every: Duration) {
        let tbl = Arc::clone(self);
        thread::spawn(move || loop {
            thread::sleep(every);
            if let Err(e) = tbl.vacuum() {
                warn!(table = %tbl.table, "vacuum error: {:#}", e);
            }
        });
    }
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("failed to read Parquet metadata of `{}`", path.display()))?
        .with_batch_size(1024)
        .build()?;
    reader
        .map(|batch| batch.with_context(|| format!("error reading batch from `{}`", path.display())))
        .collect()
}

fn read_file<R: TableRow>(path: &PathBuf) -> Result<Vec<R>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        rows.extend(R::from_batch(&batch).with_context(|| format!("decoding `{}`", path.display()))?);
    }
    Ok(rows)
}
