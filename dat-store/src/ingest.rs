//! Batched ingestion of records into a [`Store`].
//!
//! A pipeline reads records from an [`Input`], maps them onto the column set, groups
//! them into batches and commits every batch as one grouped write. Outcomes are
//! reported per record, in input order.

use std::{mem, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
    error::{PipelineError, StoreError},
    formats::{Input, InputFormat, RecordError, RowBuilder, ID_FIELD},
    revision::RevisionToken,
    store::{ColumnCatalog, CommitMode, PendingRow, PutOutcome, Store},
};

/// Default size of a batch in bytes of row content.
pub const DEFAULT_BATCH_BYTES: usize = 16 * 1024 * 1024;
/// Default time after which a partial batch is committed while the input is idle.
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_millis(100);
/// Capacity of the outcome channel of a spawned pipeline.
const OUTCOME_CHANNEL_CAP: usize = 1024;

/// Options of an ingestion pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// How batches are committed. By default overwrite mode is used for an empty store
    /// and merge mode otherwise.
    pub mode: Option<CommitMode>,
    /// Name of the field holding the row identity.
    pub primary: String,
    /// A batch is committed once its rows reach this many bytes.
    pub batch_bytes: usize,
    /// A partial batch is committed when no input arrives for this long.
    pub idle_flush: Duration,
    /// Columns of binary input, appended to the column set before the first frame.
    pub columns: Vec<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: None,
            primary: ID_FIELD.to_string(),
            batch_bytes: DEFAULT_BATCH_BYTES,
            idle_flush: DEFAULT_IDLE_FLUSH,
            columns: Vec::new(),
        }
    }
}

/// The result for a single input record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RowOutcome {
    /// The row was written with a new revision.
    Committed {
        /// Row identity.
        id: String,
        /// The new revision.
        rev: RevisionToken,
        /// Sequence number of the write.
        seq: u64,
    },
    /// The row content was already stored.
    Unchanged {
        /// Row identity.
        id: String,
        /// The current revision.
        rev: RevisionToken,
    },
    /// The record was not written.
    Failed {
        /// Row identity, if it could be determined.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// What went wrong.
        error: String,
    },
}

impl RowOutcome {
    /// Whether the record ended up in the store.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

impl From<PutOutcome> for RowOutcome {
    fn from(value: PutOutcome) -> Self {
        match value {
            PutOutcome::Written(entry) => Self::Committed {
                id: entry.id,
                rev: entry.rev,
                seq: entry.seq,
            },
            PutOutcome::Unchanged { id, rev } => Self::Unchanged { id, rev },
        }
    }
}

/// Totals of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Rows written with a new revision.
    pub written: u64,
    /// Rows whose content was already stored.
    pub unchanged: u64,
    /// Records that were not written.
    pub failed: u64,
    /// Batches committed.
    pub batches: u64,
}

impl IngestSummary {
    fn record(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Committed { .. } => self.written += 1,
            RowOutcome::Unchanged { .. } => self.unchanged += 1,
            RowOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PipelineState {
    /// Created, no record read yet.
    Open,
    /// Accumulating records into a batch.
    Batching,
    /// A batch is being written. No input is read meanwhile.
    Committing,
    /// The input ended, the last batch is being flushed.
    Draining,
    /// All batches are committed or the pipeline failed.
    Closed,
}

/// Position of a record in the current batch.
#[derive(Debug)]
enum Slot {
    Row,
    Failed(RecordError),
}

/// A single-use ingestion pipeline.
#[derive(Debug)]
pub struct Pipeline {
    store: Store,
    catalog: Arc<dyn ColumnCatalog>,
    options: PipelineOptions,
    state: PipelineState,
    mode: CommitMode,
    builder: RowBuilder,
    batch: Vec<PendingRow>,
    slots: Vec<Slot>,
    batch_size: usize,
    summary: IngestSummary,
}

impl Pipeline {
    /// Create a pipeline writing to `store`.
    pub fn new(store: Store, options: PipelineOptions) -> Self {
        let mode = options.mode.unwrap_or(match store.seq() {
            0 => CommitMode::Overwrite,
            _ => CommitMode::Merge,
        });
        let builder = RowBuilder::new(options.primary.clone(), Vec::new());
        Self {
            catalog: Arc::new(store.clone()),
            store,
            options,
            state: PipelineState::Open,
            mode,
            builder,
            batch: Vec::new(),
            slots: Vec::new(),
            batch_size: 0,
            summary: IngestSummary::default(),
        }
    }

    /// Keep the column set in `catalog` instead of the store.
    pub fn with_catalog(mut self, catalog: Arc<dyn ColumnCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// The commit mode of this pipeline.
    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// The current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run the pipeline to completion, sending one outcome per record to `outcomes`.
    ///
    /// Returns once the last batch is committed. A failed commit or column update stops
    /// the pipeline. The rows of a failed batch, or the record whose columns could not
    /// be declared, are reported as failed first.
    pub async fn run(
        mut self,
        mut input: Input,
        outcomes: mpsc::Sender<RowOutcome>,
    ) -> Result<IngestSummary, PipelineError> {
        let res = self.run_inner(&mut input, &outcomes).await;
        self.transition(PipelineState::Closed);
        match res {
            Ok(()) => {
                debug!(summary = ?self.summary, "ingestion finished");
                Ok(self.summary)
            }
            Err(err) => {
                warn!(summary = ?self.summary, "ingestion failed: {err}");
                Err(err)
            }
        }
    }

    async fn run_inner(
        &mut self,
        input: &mut Input,
        outcomes: &mpsc::Sender<RowOutcome>,
    ) -> Result<(), PipelineError> {
        let format = input.format();
        debug!(%format, mode = %self.mode, primary = %self.builder.primary(), "starting ingestion");
        if format == InputFormat::Binary && !self.options.columns.is_empty() {
            let declared = self.options.columns.clone();
            self.declare_columns(declared).await?;
        }
        let columns = blocking(&self.catalog, |catalog| catalog.columns()).await?;
        self.builder.set_columns(columns);
        if format == InputFormat::Binary {
            self.builder.resolve_framed_primary()?;
        }

        loop {
            let next = match self.slots.is_empty() {
                true => Some(input.next().await),
                false => tokio::time::timeout(self.options.idle_flush, input.next())
                    .await
                    .ok(),
            };
            let record = match next {
                // input idle, flush what we have
                None => {
                    trace!("input idle");
                    self.commit(outcomes).await?;
                    continue;
                }
                Some(None) => break,
                Some(Some(Err(err))) => {
                    self.commit(outcomes).await?;
                    return Err(err.into());
                }
                Some(Some(Ok(record))) => record,
            };
            self.transition(PipelineState::Batching);
            if format.discovers_columns() {
                let unseen = self.builder.unseen(record.field_names());
                if !unseen.is_empty() {
                    if let Err(err) = self.declare_columns(unseen).await {
                        self.commit(outcomes).await?;
                        self.report(
                            outcomes,
                            RowOutcome::Failed {
                                id: None,
                                error: err.to_string(),
                            },
                        )
                        .await;
                        return Err(err);
                    }
                }
            }
            match self.builder.build(record) {
                Ok(row) => {
                    self.batch_size += row.id.len() + row.value.len();
                    self.batch.push(row);
                    self.slots.push(Slot::Row);
                }
                Err(err) => {
                    trace!("record failed: {err}");
                    self.slots.push(Slot::Failed(err));
                }
            }
            if self.batch_size >= self.options.batch_bytes {
                self.commit(outcomes).await?;
            }
        }
        self.transition(PipelineState::Draining);
        self.commit(outcomes).await
    }

    /// Append columns and wait until they are persisted.
    async fn declare_columns(&mut self, names: Vec<String>) -> Result<(), PipelineError> {
        let columns = blocking(&self.catalog, move |catalog| {
            catalog.add_columns(&names)?;
            catalog.columns()
        })
        .await?;
        self.builder.set_columns(columns);
        Ok(())
    }

    /// Commit the current batch and report its outcomes in input order.
    async fn commit(&mut self, outcomes: &mpsc::Sender<RowOutcome>) -> Result<(), PipelineError> {
        if self.slots.is_empty() {
            return Ok(());
        }
        let state = self.state;
        self.transition(PipelineState::Committing);
        let rows = mem::take(&mut self.batch);
        let slots = mem::take(&mut self.slots);
        self.batch_size = 0;

        let mode = self.mode;
        let store = self.store.clone();
        let (rows, res) = tokio::task::spawn_blocking(move || {
            let res = match rows.is_empty() {
                true => Ok(Vec::new()),
                false => store.commit(&rows, mode),
            };
            (rows, res)
        })
        .await?;

        let metrics = self.store.metrics().clone();
        let (mut written, failure) = match res {
            Ok(written) => {
                if !rows.is_empty() {
                    metrics.batches_committed.inc();
                    self.summary.batches += 1;
                }
                debug!(rows = rows.len(), records = slots.len(), "batch committed");
                (written.into_iter(), None)
            }
            Err(err) => {
                metrics.batches_failed.inc();
                warn!(rows = rows.len(), "batch failed: {err}");
                (Vec::new().into_iter(), Some(err))
            }
        };
        let mut rows = rows.into_iter();
        for slot in slots {
            let outcome = match slot {
                Slot::Failed(err) => RowOutcome::Failed {
                    id: None,
                    error: err.to_string(),
                },
                Slot::Row => {
                    let row = rows.next().expect("one row per row slot");
                    match (&failure, written.next()) {
                        (None, Some(outcome)) => outcome.into(),
                        (Some(err), _) => RowOutcome::Failed {
                            id: Some(row.id),
                            error: err.to_string(),
                        },
                        (None, None) => unreachable!("one outcome per committed row"),
                    }
                }
            };
            self.report(outcomes, outcome).await;
        }

        match failure {
            Some(err) => Err(err.into()),
            None => {
                self.transition(state);
                Ok(())
            }
        }
    }

    async fn report(&mut self, outcomes: &mpsc::Sender<RowOutcome>, outcome: RowOutcome) {
        if !outcome.is_success() {
            self.store.metrics().rows_failed.inc();
        }
        self.summary.record(&outcome);
        // a dropped receiver only means nobody listens to outcomes
        outcomes.send(outcome).await.ok();
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            trace!(from = %self.state, to = %next, "pipeline state");
            self.state = next;
        }
    }
}

/// A pipeline running in the background.
#[derive(Debug)]
pub struct IngestHandle {
    outcomes: mpsc::Receiver<RowOutcome>,
    task: JoinHandle<Result<IngestSummary, PipelineError>>,
}

impl IngestHandle {
    /// The next outcome, or `None` once the pipeline finished.
    pub async fn next(&mut self) -> Option<RowOutcome> {
        self.outcomes.recv().await
    }

    /// Wait for the pipeline to finish, discarding outcomes not yet received.
    pub async fn finish(self) -> Result<IngestSummary, PipelineError> {
        drop(self.outcomes);
        self.task.await?
    }

    /// Receive all outcomes and wait for the pipeline to finish.
    pub async fn collect(mut self) -> Result<(Vec<RowOutcome>, IngestSummary), PipelineError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        let summary = self.task.await??;
        Ok((outcomes, summary))
    }
}

/// Ingest `input` into `store` on a background task.
pub fn spawn(store: Store, input: Input, options: PipelineOptions) -> IngestHandle {
    let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_CAP);
    let span = debug_span!("ingest", format = %input.format());
    let pipeline = Pipeline::new(store, options);
    let task = tokio::task::spawn(pipeline.run(input, tx).instrument(span));
    IngestHandle { outcomes: rx, task }
}

async fn blocking<T, F>(catalog: &Arc<dyn ColumnCatalog>, f: F) -> Result<T, PipelineError>
where
    F: FnOnce(&dyn ColumnCatalog) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let catalog = catalog.clone();
    Ok(tokio::task::spawn_blocking(move || f(catalog.as_ref())).await??)
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use bytes::Bytes;
    use futures_util::stream;
    use redb::{backends::InMemoryBackend, Database, StorageBackend};
    use serde_json::{json, Map, Value};
    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::codec;

    fn objects(values: Vec<Value>) -> Input {
        let maps: Vec<Map<String, Value>> = values
            .into_iter()
            .map(|value| match value {
                Value::Object(map) => map,
                _ => panic!("not an object"),
            })
            .collect();
        Input::objects(stream::iter(maps))
    }

    fn binary(rows: &[Bytes]) -> Input {
        let mut data = Vec::new();
        for row in rows {
            data.extend_from_slice(&(row.len() as u32).to_be_bytes());
            data.extend_from_slice(row);
        }
        Input::binary(std::io::Cursor::new(data))
    }

    #[tokio::test]
    #[traced_test]
    async fn csv_into_empty_store() -> TestResult {
        let store = Store::in_memory()?;
        let input = Input::csv(&b"name,age\nalice,30\n"[..], b',');
        let handle = spawn(store.clone(), input, Default::default());
        let (outcomes, summary) = handle.collect().await?;

        assert_eq!(outcomes.len(), 1);
        let RowOutcome::Committed { id, seq, .. } = &outcomes[0] else {
            panic!("expected a committed row, got {:?}", outcomes[0]);
        };
        assert_eq!(*seq, 1);
        assert_eq!(id.len(), 32);
        assert_eq!(store.columns()?, vec!["name", "age"]);
        assert_eq!(store.get(id)?.value, codec::encode(&["alice", "30"]));
        assert_eq!(
            summary,
            IngestSummary {
                written: 1,
                unchanged: 0,
                failed: 0,
                batches: 1
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn merge_writes_successor() -> TestResult {
        let store = Store::in_memory()?;
        let options = PipelineOptions {
            primary: "name".into(),
            ..Default::default()
        };
        let input = Input::csv(&b"name,age\nalice,30\nbob,41\n"[..], b',');
        let pipeline = Pipeline::new(store.clone(), options.clone());
        assert_eq!(pipeline.mode(), CommitMode::Overwrite);
        let (tx, _rx) = mpsc::channel(16);
        pipeline.run(input, tx).await?;
        let old = store.get("alice")?;

        let input = Input::csv(&b"name,age\nalice,31\nbob,41\n"[..], b',');
        let pipeline = Pipeline::new(store.clone(), options);
        assert_eq!(pipeline.mode(), CommitMode::Merge);
        let (tx, mut rx) = mpsc::channel(16);
        let summary = pipeline.run(input, tx).await?;
        assert_eq!(summary.written, 1);
        assert_eq!(summary.unchanged, 1);

        let RowOutcome::Committed { id, seq, rev } = rx.recv().await.expect("outcome") else {
            panic!("expected a committed row");
        };
        assert_eq!((id.as_str(), seq), ("alice", 3));
        assert!(matches!(rx.recv().await, Some(RowOutcome::Unchanged { .. })));

        let current = store.get("alice")?;
        assert_eq!(current.rev, rev);
        assert_eq!(current.value, codec::encode(&["alice", "31"]));
        // the old content is only reachable through the log
        assert_eq!(store.row_at("alice", &old.rev)?, Some(old.value));
        let snapshot = store.current_snapshot()?.collect::<Result<Vec<_>, _>>()?;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|row| row.rev != old.rev));
        Ok(())
    }

    #[tokio::test]
    async fn failures_keep_input_order() -> TestResult {
        let store = Store::in_memory()?;
        let data = b"{\"_id\":\"a\",\"v\":1}\nbroken\n{\"_id\":\"b\",\"v\":2}\n";
        let options = PipelineOptions {
            batch_bytes: 1,
            ..Default::default()
        };
        let (outcomes, summary) = spawn(store.clone(), Input::ndjson(&data[..]), options)
            .collect()
            .await?;
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(&outcomes[0], RowOutcome::Committed { id, .. } if id == "a"));
        assert!(matches!(&outcomes[1], RowOutcome::Failed { id: None, .. }));
        assert!(matches!(&outcomes[2], RowOutcome::Committed { id, .. } if id == "b"));
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.batches, 2);
        assert_eq!(store.seq(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn replay_is_a_noop() -> TestResult {
        let store = Store::in_memory()?;
        let rows = || {
            objects(vec![
                json!({"_id": "1", "name": "alice"}),
                json!({"_id": "2", "name": "bob", "email": "bob@example.com"}),
            ])
        };
        spawn(store.clone(), rows(), Default::default())
            .collect()
            .await?;
        assert_eq!(store.seq(), 2);
        assert_eq!(store.columns()?, vec!["name", "email"]);

        let options = PipelineOptions {
            mode: Some(CommitMode::Merge),
            ..Default::default()
        };
        let (_, summary) = spawn(store.clone(), rows(), options).collect().await?;
        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.written, 0);
        assert_eq!(store.seq(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn columns_grow_mid_stream() -> TestResult {
        let store = Store::in_memory()?;
        let input = objects(vec![
            json!({"_id": "1", "a": "x"}),
            json!({"_id": "2", "b": "y"}),
            json!({"_id": "3", "a": "z", "c": "w"}),
        ]);
        let (outcomes, _) = spawn(store.clone(), input, Default::default())
            .collect()
            .await?;
        assert!(outcomes.iter().all(RowOutcome::is_success));
        assert_eq!(store.columns()?, vec!["a", "b", "c"]);
        // rows written before a column was added keep their encoding
        assert_eq!(store.get("1")?.value, codec::encode(&["x"]));
        assert_eq!(store.get("2")?.value, codec::encode(&["", "y"]));
        assert_eq!(store.get("3")?.value, codec::encode(&["z", "", "w"]));
        Ok(())
    }

    #[tokio::test]
    async fn binary_primary_offset_is_stable() -> TestResult {
        let store = Store::in_memory()?;
        let options = PipelineOptions {
            primary: "key".into(),
            columns: vec!["v".into(), "key".into()],
            ..Default::default()
        };
        let input = binary(&[codec::encode(&["1", "k1"]), codec::encode(&["2", "k2"])]);
        let (outcomes, _) = spawn(store.clone(), input, options.clone()).collect().await?;
        assert!(outcomes.iter().all(RowOutcome::is_success));
        assert_eq!(store.get("k2")?.value, codec::encode(&["2", "k2"]));

        // another writer appends columns in between
        spawn(
            store.clone(),
            objects(vec![json!({"key": "k3", "extra": "e"})]),
            options.clone(),
        )
        .collect()
        .await?;
        assert_eq!(store.columns()?, vec!["v", "key", "extra"]);

        let input = binary(&[codec::encode(&["3", "k1", "more"])]);
        let (outcomes, _) = spawn(store.clone(), input, options).collect().await?;
        assert!(matches!(&outcomes[0], RowOutcome::Committed { id, .. } if id == "k1"));
        Ok(())
    }

    #[tokio::test]
    async fn binary_needs_a_known_primary() -> TestResult {
        let store = Store::in_memory()?;
        let options = PipelineOptions {
            primary: "key".into(),
            ..Default::default()
        };
        let res = spawn(store, binary(&[]), options).collect().await;
        assert!(matches!(res, Err(PipelineError::UnknownPrimary(_))));
        Ok(())
    }

    #[tokio::test]
    async fn idle_input_flushes_batch() -> TestResult {
        let store = Store::in_memory()?;
        let (tx, rx) = mpsc::channel::<Map<String, Value>>(4);
        let input = Input::objects(tokio_stream::wrappers::ReceiverStream::new(rx));
        let options = PipelineOptions {
            idle_flush: Duration::from_millis(10),
            ..Default::default()
        };
        let mut handle = spawn(store.clone(), input, options);
        let Value::Object(row) = json!({"_id": "live", "v": "1"}) else {
            unreachable!()
        };
        tx.send(row).await?;
        // committed while the input is still open
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.next()).await?;
        assert!(matches!(outcome, Some(RowOutcome::Committed { seq: 1, .. })));
        assert_eq!(store.get("live")?.value, codec::encode(&["1"]));
        drop(tx);
        let summary = handle.finish().await?;
        assert_eq!(summary.batches, 1);
        Ok(())
    }

    /// In-memory database storage whose syncs fail once `fail` is set.
    #[derive(Debug, Default)]
    struct FailingBackend {
        inner: InMemoryBackend,
        fail: Arc<AtomicBool>,
    }

    impl StorageBackend for FailingBackend {
        fn len(&self) -> Result<u64, io::Error> {
            StorageBackend::len(&self.inner)
        }

        fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, io::Error> {
            StorageBackend::read(&self.inner, offset, len)
        }

        fn set_len(&self, len: u64) -> Result<(), io::Error> {
            StorageBackend::set_len(&self.inner, len)
        }

        fn sync_data(&self, eventual: bool) -> Result<(), io::Error> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::other("disk on fire"));
            }
            StorageBackend::sync_data(&self.inner, eventual)
        }

        fn write(&self, offset: u64, data: &[u8]) -> Result<(), io::Error> {
            StorageBackend::write(&self.inner, offset, data)
        }
    }

    /// Column catalog that rejects column updates after `allowed` of them.
    #[derive(Debug)]
    struct FailingCatalog {
        store: Store,
        allowed: AtomicUsize,
    }

    impl ColumnCatalog for FailingCatalog {
        fn columns(&self) -> Result<Vec<String>, StoreError> {
            self.store.columns()
        }

        fn add_columns(&self, names: &[String]) -> Result<Vec<String>, StoreError> {
            let left = self.allowed.load(Ordering::SeqCst);
            if left == 0 {
                let err = io::Error::other("catalog unavailable");
                return Err(StoreError::SchemaUpdate(redb::Error::Io(err)));
            }
            self.allowed.store(left - 1, Ordering::SeqCst);
            self.store.add_columns(names)
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn lookup_failure_halts_pipeline() -> TestResult {
        let store = Store::in_memory()?;
        store.add_columns(&["v".into()])?;
        store.put("a", codec::encode(&["0"]), None)?;
        store.corrupt_current("a")?;

        let options = PipelineOptions {
            mode: Some(CommitMode::Merge),
            batch_bytes: 1,
            ..Default::default()
        };
        let input = objects(vec![
            json!({"_id": "c", "v": "1"}),
            json!({"_id": "a", "v": "2"}),
            json!({"_id": "d", "v": "3"}),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let res = Pipeline::new(store.clone(), options).run(input, tx).await;
        assert!(matches!(
            res,
            Err(PipelineError::Store(StoreError::BatchLookup { ref id, .. })) if id == "a"
        ));
        assert!(matches!(rx.recv().await, Some(RowOutcome::Committed { id, .. }) if id == "c"));
        assert!(matches!(
            rx.recv().await,
            Some(RowOutcome::Failed { id: Some(id), .. }) if id == "a"
        ));
        // nothing is read past the failed batch
        assert!(rx.recv().await.is_none());
        assert_eq!(store.get("c")?.value, codec::encode(&["1"]));
        assert!(store.get("d").unwrap_err().is_not_found());

        // every row of a failed batch is reported
        let options = PipelineOptions {
            mode: Some(CommitMode::Merge),
            ..Default::default()
        };
        let input = objects(vec![
            json!({"_id": "e", "v": "4"}),
            json!({"_id": "a", "v": "5"}),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let res = Pipeline::new(store.clone(), options).run(input, tx).await;
        assert!(matches!(res, Err(PipelineError::Store(StoreError::BatchLookup { .. }))));
        let mut failed = Vec::new();
        while let Some(outcome) = rx.recv().await {
            let RowOutcome::Failed { id, .. } = outcome else {
                panic!("expected a failed row, got {outcome:?}");
            };
            failed.push(id);
        }
        assert_eq!(failed, vec![Some("e".to_string()), Some("a".to_string())]);
        assert!(store.get("e").unwrap_err().is_not_found());
        assert_eq!(store.seq(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn storage_failure_halts_pipeline() -> TestResult {
        let backend = FailingBackend::default();
        let fail = backend.fail.clone();
        let store = Store::open(Database::builder().create_with_backend(backend)?)?;
        store.add_columns(&["v".into()])?;
        fail.store(true, Ordering::SeqCst);

        let options = PipelineOptions {
            mode: Some(CommitMode::Overwrite),
            ..Default::default()
        };
        let input = objects(vec![json!({"_id": "a", "v": "1"})]);
        let (outcomes, res) = {
            let (tx, mut rx) = mpsc::channel(16);
            let res = Pipeline::new(store.clone(), options).run(input, tx).await;
            let mut outcomes = Vec::new();
            while let Some(outcome) = rx.recv().await {
                outcomes.push(outcome);
            }
            (outcomes, res)
        };
        assert!(matches!(res, Err(PipelineError::Store(StoreError::Storage(_)))));
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], RowOutcome::Failed { id: Some(id), .. } if id == "a"));
        assert_eq!(store.seq(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn schema_failure_reports_the_record() -> TestResult {
        let store = Store::in_memory()?;
        let catalog = Arc::new(FailingCatalog {
            store: store.clone(),
            allowed: AtomicUsize::new(1),
        });
        let input = objects(vec![
            json!({"_id": "a", "x": "1"}),
            json!({"_id": "b", "y": "2"}),
            json!({"_id": "c", "x": "3"}),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let res = Pipeline::new(store.clone(), Default::default())
            .with_catalog(catalog)
            .run(input, tx)
            .await;
        assert!(matches!(res, Err(PipelineError::Store(StoreError::SchemaUpdate(_)))));
        // the batch before the failing record is committed
        assert!(matches!(rx.recv().await, Some(RowOutcome::Committed { id, .. }) if id == "a"));
        assert!(matches!(rx.recv().await, Some(RowOutcome::Failed { id: None, .. })));
        assert!(rx.recv().await.is_none());
        assert_eq!(store.columns()?, vec!["x"]);
        assert!(store.get("c").unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn outcomes_serialize_with_status() -> TestResult {
        let rev = RevisionToken::initial(b"x");
        let committed = RowOutcome::Committed {
            id: "a".into(),
            rev,
            seq: 3,
        };
        assert_eq!(
            serde_json::to_value(&committed)?,
            json!({"status": "committed", "id": "a", "rev": rev.to_string(), "seq": 3})
        );
        let failed = RowOutcome::Failed {
            id: None,
            error: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&failed)?,
            json!({"status": "failed", "error": "boom"})
        );
        Ok(())
    }
}
