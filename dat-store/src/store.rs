//! Revisioned row storage.
//!
//! Every content changing write appends a [`SequenceEntry`] to the sequence log and
//! stores the row content under `(id, rev)`. The current index maps each id to its
//! latest revision and is updated in the same transaction, so it always equals the
//! projection of the log onto the greatest `seq` per id.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    ops::Bound,
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use bytes::Bytes;
use data_encoding::HEXLOWER;
use futures_util::Stream;
use genawaiter::sync::{Co, Gen};
use redb::{backends::InMemoryBackend, Database, ReadTransaction, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub use self::backup::backup_codec;
use self::tables::{Tables, COLUMNS_TABLE, CURRENT_TABLE, ROWS_TABLE, SEQUENCES_TABLE};
use crate::{error::StoreError, metrics::Metrics, revision::RevisionToken};

mod backup;
mod tables;

/// Number of entries read from the database at a time by lazy readers.
const PAGE_SIZE: usize = 256;

/// A stored row at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Row identity, unique per store.
    pub id: String,
    /// Revision of this content.
    pub rev: RevisionToken,
    /// Encoded row content, see [`crate::codec`].
    pub value: Bytes,
}

/// One accepted mutation in the sequence log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    /// Position in the log.
    pub seq: u64,
    /// The row that changed.
    pub id: String,
    /// Its new revision.
    pub rev: RevisionToken,
}

/// Result of writing one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The row got a new revision and sequence number.
    Written(SequenceEntry),
    /// The content equals the stored content. Nothing was written.
    Unchanged {
        /// Row identity.
        id: String,
        /// The current, unchanged revision.
        rev: RevisionToken,
    },
}

impl PutOutcome {
    /// Row identity.
    pub fn id(&self) -> &str {
        match self {
            Self::Written(entry) => &entry.id,
            Self::Unchanged { id, .. } => id,
        }
    }

    /// The row's revision after the write.
    pub fn rev(&self) -> &RevisionToken {
        match self {
            Self::Written(entry) => &entry.rev,
            Self::Unchanged { rev, .. } => rev,
        }
    }

    /// The sequence number consumed by the write, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Written(entry) => Some(entry.seq),
            Self::Unchanged { .. } => None,
        }
    }
}

/// How a batch is written.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommitMode {
    /// Every row is written as a fresh insert without looking at stored rows.
    Overwrite,
    /// Rows are compared with their stored revision. Unchanged rows are skipped,
    /// changed rows get a successor revision.
    #[default]
    Merge,
}

/// A row waiting to be committed.
#[derive(Debug, Clone)]
pub struct PendingRow {
    /// Row identity.
    pub id: String,
    /// Encoded content.
    pub value: Bytes,
    /// The revision the writer believes is current, if known.
    pub expected: Option<RevisionToken>,
    /// Set for rows replicated from another store, whose revision is kept as is.
    pub adopted: Option<Adopted>,
}

/// Provenance of a replicated row.
///
/// An adopted row is stored under the revision it has at its origin. Entries at or
/// below the greatest origin `seq` already adopted for the id are replays and leave the
/// row untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adopted {
    /// Identifies the source store, e.g. the URL of its feed.
    pub origin: Arc<str>,
    /// Sequence number of the entry at the origin.
    pub seq: u64,
    /// Revision of the entry at the origin.
    pub rev: RevisionToken,
}

/// Upper end of a [`Store::sequence_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    /// Stop after this sequence number, or at the current head if that is lower.
    Until(u64),
    /// Never stop: wait for new entries once the head is reached.
    Open,
}

/// Summary of a [`Store::compact`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Superseded sequence entries that were removed.
    pub entries_removed: usize,
    /// Historic row contents that were removed.
    pub rows_removed: usize,
}

/// Access to the ordered column set of a dataset.
///
/// The column set only grows: names are appended once and never removed or reordered.
pub trait ColumnCatalog: fmt::Debug + Send + Sync + 'static {
    /// The known columns, in order.
    fn columns(&self) -> Result<Vec<String>, StoreError>;

    /// Durably append the names that are not yet known. Returns the appended names.
    ///
    /// Must not return before the new columns are persisted.
    fn add_columns(&self, names: &[String]) -> Result<Vec<String>, StoreError>;
}

/// Generate a process-wide unique row identity.
pub fn generate_id() -> String {
    HEXLOWER.encode(&rand::random::<[u8; 16]>())
}

/// Handle to a revisioned row store.
///
/// Cloning the handle is cheap. The database is closed when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    #[debug("Database")]
    db: Database,
    head: watch::Sender<u64>,
    closed: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Store {
    /// Open or create a store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!("loading store database from {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database directory at {}",
                    path.to_string_lossy()
                )
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open store database")?;
        Ok(Self::open(db)?)
    }

    /// Create an in-memory store.
    pub fn in_memory() -> anyhow::Result<Self> {
        debug!("using in-memory store database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Ok(Self::open(db)?)
    }

    /// Wrap an opened database, creating the tables if needed.
    pub fn open(db: Database) -> Result<Self, StoreError> {
        let write_tx = db.begin_write()?;
        {
            let _tables = Tables::new(&write_tx)?;
            let _table = write_tx.open_table(COLUMNS_TABLE)?;
        }
        write_tx.commit()?;
        let head = {
            let read_tx = db.begin_read()?;
            let sequences = read_tx.open_table(SEQUENCES_TABLE)?;
            let last = sequences.last()?;
            last.map(|(seq, _)| seq.value()).unwrap_or(0)
        };
        debug!(head, "store opened");
        let (head, _) = watch::channel(head);
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                head,
                closed: CancellationToken::new(),
                metrics: Default::default(),
            }),
        })
    }

    /// The metrics of this store.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// The greatest sequence number assigned so far, `0` for an empty store.
    pub fn seq(&self) -> u64 {
        *self.inner.head.borrow()
    }

    /// Release all live readers. Open [`Store::sequence_range`] streams end.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Whether [`Store::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Write a single row in merge mode.
    ///
    /// Identical content is a no-op; changed content gets a successor revision and the
    /// next sequence number.
    pub fn put(
        &self,
        id: impl Into<String>,
        value: impl Into<Bytes>,
        expected: Option<RevisionToken>,
    ) -> Result<PutOutcome, StoreError> {
        let row = PendingRow {
            id: id.into(),
            value: value.into(),
            expected,
            adopted: None,
        };
        let mut outcomes = self.commit(std::slice::from_ref(&row), CommitMode::Merge)?;
        Ok(outcomes.pop().expect("one outcome per row"))
    }

    /// Write a batch of rows in one atomic grouped write.
    ///
    /// Returns one outcome per row, in order. In merge mode, and for adopted rows in any
    /// mode, a failure to read the stored rows aborts the whole batch with
    /// [`StoreError::BatchLookup`]. Any failure leaves the store as it was before the call.
    pub fn commit(
        &self,
        rows: &[PendingRow],
        mode: CommitMode,
    ) -> Result<Vec<PutOutcome>, StoreError> {
        let write_tx = self.inner.db.begin_write()?;
        let mut outcomes = Vec::with_capacity(rows.len());
        let mut recorded = 0u64;
        let (start, head) = {
            let mut tables = Tables::new(&write_tx)?;
            let start = match tables.sequences.last()? {
                Some((seq, _)) => seq.value(),
                None => 0,
            };
            let mut head = start;
            for row in rows {
                if let Some(adopted) = &row.adopted {
                    let key = (&*adopted.origin, row.id.as_str());
                    let (current, seen) = adopted_state(&tables, key)
                        .map_err(|err| batch_lookup(&row.id, err))?;
                    if seen.is_none_or(|seen| seen < adopted.seq) {
                        tables.origins.insert(key, adopted.seq)?;
                        recorded += 1;
                    }
                    let replayed = seen.is_some_and(|seen| seen >= adopted.seq);
                    match current {
                        Some(rev) if rev == adopted.rev || replayed => {
                            trace!(id = %row.id, %rev, origin_seq = adopted.seq, "already adopted");
                            outcomes.push(PutOutcome::Unchanged {
                                id: row.id.clone(),
                                rev,
                            });
                            continue;
                        }
                        _ => {}
                    }
                    head += 1;
                    insert_revision(&mut tables, head, &row.id, &adopted.rev, &row.value)?;
                    outcomes.push(PutOutcome::Written(SequenceEntry {
                        seq: head,
                        id: row.id.clone(),
                        rev: adopted.rev,
                    }));
                    continue;
                }
                let prior = match mode {
                    CommitMode::Overwrite => None,
                    CommitMode::Merge => {
                        lookup(&tables, &row.id).map_err(|err| batch_lookup(&row.id, err))?
                    }
                };
                let rev = match prior {
                    Some((rev, value)) if value[..] == row.value[..] => {
                        trace!(id = %row.id, %rev, "unchanged");
                        outcomes.push(PutOutcome::Unchanged {
                            id: row.id.clone(),
                            rev,
                        });
                        continue;
                    }
                    Some((rev, _)) => {
                        if let Some(expected) = row.expected.filter(|expected| *expected != rev) {
                            debug!(id = %row.id, %expected, current = %rev, "stale expected revision, writing successor of current");
                        }
                        rev.successor(&row.value)
                    }
                    None => RevisionToken::initial(&row.value),
                };
                head += 1;
                insert_revision(&mut tables, head, &row.id, &rev, &row.value)?;
                outcomes.push(PutOutcome::Written(SequenceEntry {
                    seq: head,
                    id: row.id.clone(),
                    rev,
                }));
            }
            (start, head)
        };
        let written = head - start;
        if written == 0 && recorded == 0 {
            write_tx.abort()?;
        } else {
            write_tx.commit()?;
            if written > 0 {
                self.inner.head.send_replace(head);
            }
        }
        trace!(%mode, rows = rows.len(), written, head, "batch committed");
        self.inner.metrics.rows_written.inc_by(written);
        self.inner
            .metrics
            .rows_unchanged
            .inc_by(rows.len() as u64 - written);
        Ok(outcomes)
    }

    /// The latest revision of a row.
    pub fn get(&self, id: &str) -> Result<Row, StoreError> {
        let read_tx = self.inner.db.begin_read()?;
        let current = read_tx.open_table(CURRENT_TABLE)?;
        let Some(entry) = current.get(id)? else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let (rev, _seq) = entry.value();
        let rev = parse_rev(rev)?;
        let rows = read_tx.open_table(ROWS_TABLE)?;
        let value = read_value(&rows, id, &rev)?
            .ok_or_else(|| StoreError::Corrupt(format!("missing content for {id}@{rev}")))?;
        Ok(Row {
            id: id.to_string(),
            rev,
            value,
        })
    }

    /// The content of a row at a specific revision, if it is still stored.
    ///
    /// Superseded revisions are available until the next [`Store::compact`].
    pub fn row_at(&self, id: &str, rev: &RevisionToken) -> Result<Option<Bytes>, StoreError> {
        let read_tx = self.inner.db.begin_read()?;
        let rows = read_tx.open_table(ROWS_TABLE)?;
        read_value(&rows, id, rev)
    }

    /// Lazily iterate the sequence log from `since` (exclusive) up to `until` (inclusive)
    /// or the current head.
    pub fn sequences(&self, since: u64, until: Option<u64>) -> SequenceIter {
        SequenceIter {
            store: self.clone(),
            cursor: since,
            until,
            page: VecDeque::new(),
            done: false,
        }
    }

    /// Stream the sequence log from `since` (exclusive), in ascending order.
    ///
    /// With [`RangeEnd::Open`] the stream does not end at the head of the log but waits
    /// for new commits, until it is dropped or the store is closed. Any entry's `seq` can
    /// be used as `since` to resume.
    pub fn sequence_range(
        &self,
        since: u64,
        end: RangeEnd,
    ) -> impl Stream<Item = Result<SequenceEntry, StoreError>> + Send + 'static + use<> {
        let store = self.clone();
        Gen::new(|co| async move {
            if let Err(err) = store.sequence_range_impl(since, end, &co).await {
                co.yield_(Err(err)).await;
            }
        })
    }

    async fn sequence_range_impl(
        self,
        mut cursor: u64,
        end: RangeEnd,
        co: &Co<Result<SequenceEntry, StoreError>>,
    ) -> Result<(), StoreError> {
        let until = match end {
            RangeEnd::Until(until) => Some(until),
            RangeEnd::Open => None,
        };
        let mut head = self.inner.head.subscribe();
        loop {
            let known_head = *head.borrow_and_update();
            let page = match known_head > cursor {
                true => {
                    let store = self.clone();
                    tokio::task::spawn_blocking(move || {
                        store.sequence_page(cursor, until, PAGE_SIZE)
                    })
                    .await??
                }
                false => Vec::new(),
            };
            let full = page.len() == PAGE_SIZE;
            for entry in page {
                cursor = entry.seq;
                co.yield_(Ok(entry)).await;
            }
            if full {
                continue;
            }
            if end != RangeEnd::Open {
                return Ok(());
            }
            trace!(cursor, "waiting for new entries");
            tokio::select! {
                res = head.changed() => {
                    if res.is_err() {
                        return Ok(());
                    }
                }
                _ = self.inner.closed.cancelled() => {
                    debug!(cursor, "store closed, ending live range");
                    return Ok(());
                }
            }
        }
    }

    fn sequence_page(
        &self,
        since: u64,
        until: Option<u64>,
        limit: usize,
    ) -> Result<Vec<SequenceEntry>, StoreError> {
        let start = match since.checked_add(1) {
            Some(start) => start,
            None => return Ok(Vec::new()),
        };
        let end = match until {
            Some(until) if until < start => return Ok(Vec::new()),
            Some(until) => Bound::Included(until),
            None => Bound::Unbounded,
        };
        let read_tx = self.inner.db.begin_read()?;
        let sequences = read_tx.open_table(SEQUENCES_TABLE)?;
        let mut page = Vec::new();
        for item in sequences.range::<u64>((Bound::Included(start), end))?.take(limit) {
            let (seq, entry) = item?;
            let (id, rev) = entry.value();
            page.push(SequenceEntry {
                seq: seq.value(),
                id: id.to_string(),
                rev: parse_rev(rev)?,
            });
        }
        Ok(page)
    }

    /// Lazily iterate the current index: one entry per id with its latest revision.
    ///
    /// The iterator reads from a single snapshot of the database, taken when this is called.
    pub fn current_snapshot(&self) -> Result<SnapshotIter, StoreError> {
        Ok(SnapshotIter {
            read_tx: self.inner.db.begin_read()?,
            cursor: None,
            page: VecDeque::new(),
            done: false,
        })
    }

    /// Remove sequence entries that are superseded by a later entry for the same id,
    /// together with the content of their revisions.
    ///
    /// Afterwards the log holds exactly one entry per id and history is gone. Consumers
    /// of the change feed must have read past the compacted range.
    pub fn compact(&self) -> Result<CompactionReport, StoreError> {
        let write_tx = self.inner.db.begin_write()?;
        let mut report = CompactionReport::default();
        {
            let mut tables = Tables::new(&write_tx)?;
            let mut superseded = Vec::new();
            for item in tables.sequences.iter()? {
                let (seq, entry) = item?;
                let seq = seq.value();
                let (id, rev) = entry.value();
                let Some(current) = tables.current.get(id)? else {
                    continue;
                };
                let (current_rev, current_seq) = current.value();
                if current_seq != seq {
                    superseded.push((seq, id.to_string(), rev.to_string(), rev == current_rev));
                }
            }
            for (seq, id, rev, is_current_rev) in superseded {
                tables.sequences.remove(seq)?;
                report.entries_removed += 1;
                if !is_current_rev && tables.rows.remove((id.as_str(), rev.as_str()))?.is_some() {
                    report.rows_removed += 1;
                }
            }
        }
        if report.entries_removed == 0 {
            write_tx.abort()?;
        } else {
            write_tx.commit()?;
        }
        info!(
            entries_removed = report.entries_removed,
            rows_removed = report.rows_removed,
            "compaction finished"
        );
        self.inner
            .metrics
            .compaction_entries_removed
            .inc_by(report.entries_removed as u64);
        Ok(report)
    }

    /// Point the current index of `id` at an unparseable revision.
    #[cfg(test)]
    pub(crate) fn corrupt_current(&self, id: &str) -> Result<(), StoreError> {
        let write_tx = self.inner.db.begin_write()?;
        {
            let mut current = write_tx.open_table(CURRENT_TABLE)?;
            current.insert(id, ("not-a-revision", 0))?;
        }
        write_tx.commit()?;
        Ok(())
    }
}

impl ColumnCatalog for Store {
    fn columns(&self) -> Result<Vec<String>, StoreError> {
        let read_tx = self.inner.db.begin_read()?;
        let table = read_tx.open_table(COLUMNS_TABLE)?;
        let mut columns = Vec::new();
        for item in table.iter()? {
            let (_, name) = item?;
            columns.push(name.value().to_string());
        }
        Ok(columns)
    }

    fn add_columns(&self, names: &[String]) -> Result<Vec<String>, StoreError> {
        let append = || -> Result<Vec<String>, redb::Error> {
            let write_tx = self.inner.db.begin_write()?;
            let mut added = Vec::new();
            {
                let mut table = write_tx.open_table(COLUMNS_TABLE)?;
                let mut known = HashSet::new();
                let mut next = 0u64;
                for item in table.iter()? {
                    let (pos, name) = item?;
                    known.insert(name.value().to_string());
                    next = pos.value() + 1;
                }
                for name in names {
                    if known.insert(name.clone()) {
                        table.insert(next, name.as_str())?;
                        next += 1;
                        added.push(name.clone());
                    }
                }
            }
            if added.is_empty() {
                write_tx.abort()?;
            } else {
                write_tx.commit()?;
            }
            Ok(added)
        };
        let added = append().map_err(StoreError::SchemaUpdate)?;
        if !added.is_empty() {
            debug!(?added, "columns added");
            self.inner.metrics.columns_added.inc_by(added.len() as u64);
        }
        Ok(added)
    }
}

/// Lazy, finite iterator over the sequence log. See [`Store::sequences`].
#[derive(Debug)]
pub struct SequenceIter {
    store: Store,
    cursor: u64,
    until: Option<u64>,
    page: VecDeque<SequenceEntry>,
    done: bool,
}

impl Iterator for SequenceIter {
    type Item = Result<SequenceEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            match self.store.sequence_page(self.cursor, self.until, PAGE_SIZE) {
                Ok(page) => {
                    self.done = page.len() < PAGE_SIZE;
                    self.page = page.into();
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        let entry = self.page.pop_front()?;
        self.cursor = entry.seq;
        Some(Ok(entry))
    }
}

/// Lazy iterator over the current index. See [`Store::current_snapshot`].
#[derive(derive_more::Debug)]
pub struct SnapshotIter {
    #[debug("ReadTransaction")]
    read_tx: ReadTransaction,
    cursor: Option<String>,
    page: VecDeque<Row>,
    done: bool,
}

impl SnapshotIter {
    fn fill(&mut self) -> Result<(), StoreError> {
        let current = self.read_tx.open_table(CURRENT_TABLE)?;
        let rows = self.read_tx.open_table(ROWS_TABLE)?;
        let mut keys = Vec::new();
        {
            let lower = match &self.cursor {
                Some(cursor) => Bound::Excluded(cursor.as_str()),
                None => Bound::Unbounded,
            };
            for item in current.range::<&str>((lower, Bound::Unbounded))?.take(PAGE_SIZE) {
                let (id, entry) = item?;
                let (rev, _seq) = entry.value();
                keys.push((id.value().to_string(), parse_rev(rev)?));
            }
        }
        self.done = keys.len() < PAGE_SIZE;
        for (id, rev) in keys {
            let value = read_value(&rows, &id, &rev)?
                .ok_or_else(|| StoreError::Corrupt(format!("missing content for {id}@{rev}")))?;
            self.cursor = Some(id.clone());
            self.page.push_back(Row { id, rev, value });
        }
        Ok(())
    }
}

impl Iterator for SnapshotIter {
    type Item = Result<Row, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            if let Err(err) = self.fill() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

fn current_rev(tables: &Tables, id: &str) -> Result<Option<RevisionToken>, StoreError> {
    let Some(entry) = tables.current.get(id)? else {
        return Ok(None);
    };
    let (rev, _seq) = entry.value();
    Ok(Some(parse_rev(rev)?))
}

fn lookup(tables: &Tables, id: &str) -> Result<Option<(RevisionToken, Bytes)>, StoreError> {
    let Some(rev) = current_rev(tables, id)? else {
        return Ok(None);
    };
    let value = read_value(&tables.rows, id, &rev)?
        .ok_or_else(|| StoreError::Corrupt(format!("missing content for {id}@{rev}")))?;
    Ok(Some((rev, value)))
}

/// Current revision of an adopted row and the greatest origin seq recorded for it.
fn adopted_state(
    tables: &Tables,
    (origin, id): (&str, &str),
) -> Result<(Option<RevisionToken>, Option<u64>), StoreError> {
    let current = current_rev(tables, id)?;
    let seen = tables.origins.get((origin, id))?.map(|seq| seq.value());
    Ok((current, seen))
}

fn batch_lookup(id: &str, source: StoreError) -> StoreError {
    StoreError::BatchLookup {
        id: id.to_string(),
        source: Box::new(source),
    }
}

fn insert_revision(
    tables: &mut Tables,
    seq: u64,
    id: &str,
    rev: &RevisionToken,
    value: &[u8],
) -> Result<(), StoreError> {
    let rev = rev.to_string();
    tables.sequences.insert(seq, (id, rev.as_str()))?;
    tables.rows.insert((id, rev.as_str()), value)?;
    tables.current.insert(id, (rev.as_str(), seq))?;
    Ok(())
}

fn read_value(
    rows: &impl ReadableTable<(&'static str, &'static str), &'static [u8]>,
    id: &str,
    rev: &RevisionToken,
) -> Result<Option<Bytes>, StoreError> {
    let rev = rev.to_string();
    let value = rows.get((id, rev.as_str()))?;
    Ok(value.map(|value| Bytes::copy_from_slice(value.value())))
}

fn parse_rev(rev: &str) -> Result<RevisionToken, StoreError> {
    rev.parse()
        .map_err(|err| StoreError::Corrupt(format!("{err}")))
}
