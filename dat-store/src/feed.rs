//! The change feed and pull replication.
//!
//! The producer side turns the sequence log of a [`Store`] into a stream of
//! [`FeedEntry`]s, optionally with row content inline. The consumer side reads such
//! a feed from a remote over HTTP and replays the stored bytes into a local store.
//! Replicated rows keep the revision they have at the remote, and the greatest remote
//! `seq` applied per row is recorded, so replaying a feed does not change the local
//! store.

use std::{io, pin::pin, sync::Arc};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use data_encoding::BASE64;
use futures_util::{Stream, StreamExt, TryStreamExt};
use genawaiter::sync::Gen;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    io::StreamReader,
    sync::CancellationToken,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    codec,
    error::StoreError,
    formats::{self, Input, Record, ID_FIELD},
    ingest::{self, IngestSummary, PipelineOptions, RowOutcome},
    revision::RevisionToken,
    store::{Adopted, ColumnCatalog, CommitMode, RangeEnd, SequenceEntry, Store},
};

/// Maximum length of a single feed line.
const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;
/// Capacity of the channel between the feed reader and the pipeline.
const PULL_CHANNEL_CAP: usize = 256;

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Position in the sequence log, the resume cursor.
    pub seq: u64,
    /// The row that changed.
    pub id: String,
    /// Its new revision.
    pub rev: RevisionToken,
    /// The row content at this revision, if requested and still stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Map<String, Value>>,
    /// The stored bytes of the row at this revision, base64 encoded, if requested and
    /// still stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// One row of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Row identity.
    pub id: String,
    /// The latest revision.
    pub rev: RevisionToken,
    /// The row content.
    pub value: Map<String, Value>,
}

/// What part of the change feed to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedOptions {
    /// Only entries after this sequence number are returned.
    pub since: u64,
    /// Include the row content.
    pub data: bool,
    /// Include the stored bytes of the row, as used by [`pull`].
    pub raw: bool,
    /// Keep waiting for new entries once the head of the log is reached.
    pub live: bool,
    /// Stop after this sequence number.
    pub until: Option<u64>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            since: 0,
            data: false,
            raw: false,
            live: true,
            until: None,
        }
    }
}

/// Decodes stored rows into JSON objects, reloading the column set when a row has
/// more fields than known columns.
#[derive(Debug, Clone)]
pub struct RowDecoder {
    store: Store,
    columns: Vec<String>,
}

impl RowDecoder {
    /// Create a decoder. Columns are loaded lazily.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            columns: Vec::new(),
        }
    }

    /// Decode a stored row.
    pub fn decode(&mut self, value: &Bytes) -> Result<Map<String, Value>, StoreError> {
        let count = codec::field_count(value).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        if count > self.columns.len() {
            self.columns = self.store.columns()?;
        }
        formats::decode_object(value, &self.columns)
            .map_err(|err| StoreError::Corrupt(err.to_string()))
    }
}

/// Stream the change feed of `store`.
///
/// Entries come in ascending `seq` order. Without `until` and with `live` set the stream
/// stays open and yields new entries as they are committed.
pub fn changes(
    store: &Store,
    options: FeedOptions,
) -> impl Stream<Item = Result<FeedEntry, StoreError>> + Send + 'static + use<> {
    let end = match (options.until, options.live) {
        (Some(until), _) => RangeEnd::Until(until),
        (None, true) => RangeEnd::Open,
        (None, false) => RangeEnd::Until(store.seq()),
    };
    debug!(since = options.since, ?end, data = options.data, raw = options.raw, "feed subscription");
    store.metrics().feed_subscriptions.inc();
    let store = store.clone();
    Gen::new(|co| async move {
        let mut entries = pin!(store.sequence_range(options.since, end));
        let mut decoder = options.data.then(|| RowDecoder::new(store.clone()));
        while let Some(entry) = entries.next().await {
            let entry = match entry {
                Ok(entry) if options.data || options.raw => {
                    // row reads go to the blocking pool, the decoder travels along
                    let store = store.clone();
                    let mut taken = decoder.take();
                    let loaded = tokio::task::spawn_blocking(move || {
                        let res = with_content(&store, entry, taken.as_mut(), options.raw);
                        (taken, res)
                    })
                    .await;
                    match loaded {
                        Ok((returned, res)) => {
                            decoder = returned;
                            res
                        }
                        Err(err) => Err(err.into()),
                    }
                }
                Ok(entry) => Ok(FeedEntry {
                    seq: entry.seq,
                    id: entry.id,
                    rev: entry.rev,
                    value: None,
                    raw: None,
                }),
                Err(err) => Err(err),
            };
            let failed = entry.is_err();
            if !failed {
                store.metrics().feed_entries_sent.inc();
            }
            co.yield_(entry).await;
            if failed {
                break;
            }
        }
    })
}

fn with_content(
    store: &Store,
    entry: SequenceEntry,
    decoder: Option<&mut RowDecoder>,
    raw: bool,
) -> Result<FeedEntry, StoreError> {
    // None once removed by a concurrent compaction
    let stored = store.row_at(&entry.id, &entry.rev)?;
    let value = match (decoder, &stored) {
        (Some(decoder), Some(stored)) => Some(decoder.decode(stored)?),
        _ => None,
    };
    Ok(FeedEntry {
        seq: entry.seq,
        id: entry.id,
        rev: entry.rev,
        value,
        raw: stored.filter(|_| raw).map(|stored| BASE64.encode(&stored)),
    })
}

/// Stream the current index of `store`: one row per id, at its latest revision.
///
/// The rows are read from a single point in time snapshot on the blocking pool.
pub fn snapshot(
    store: &Store,
) -> impl Stream<Item = Result<SnapshotRow, StoreError>> + Send + 'static + use<> {
    let (tx, rx) = mpsc::channel(64);
    let store = store.clone();
    tokio::task::spawn_blocking(move || {
        let rows = match store.current_snapshot() {
            Ok(rows) => rows,
            Err(err) => {
                tx.blocking_send(Err(err)).ok();
                return;
            }
        };
        let mut decoder = RowDecoder::new(store);
        for row in rows {
            let row = row.and_then(|row| {
                let value = decoder.decode(&row.value)?;
                Ok(SnapshotRow {
                    id: row.id,
                    rev: row.rev,
                    value,
                })
            });
            // stop reading once the receiver is gone
            if tx.blocking_send(row).is_err() {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Options for [`pull`].
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Resume after this remote sequence number.
    pub since: u64,
    /// Keep following the remote feed instead of stopping at its current head.
    pub live: bool,
    /// Options of the local pipeline. The commit mode is always merge.
    pub pipeline: PipelineOptions,
    /// Stops reading the remote feed. Entries already received are still applied.
    pub cancel: CancellationToken,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            since: 0,
            live: false,
            pipeline: PipelineOptions::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of a [`pull`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    /// The last remote sequence number received. Use as `since` to resume.
    pub last_seq: u64,
    /// Feed entries received.
    pub received: u64,
    /// Entries that were already applied before.
    pub skipped: u64,
    /// Whether the pull was cancelled before the remote feed ended.
    pub interrupted: bool,
    /// Totals of the local pipeline.
    pub ingest: IngestSummary,
}

/// Replicate the change feed at `url` into `store`.
///
/// `url` points to the remote feed, e.g. `http://host:8080/_changes`, and also names the
/// origin whose progress is recorded per row. The remote column set is synced before
/// any row is ingested and must be a prefix of the local one, so stored bytes decode
/// the same on both sides. Cancelling [`PullOptions::cancel`] stops reading and returns
/// the cursor of the last entry handed to the local pipeline.
pub async fn pull(store: &Store, url: Url, options: PullOptions) -> Result<PullSummary> {
    let client = reqwest::Client::new();
    let origin: Arc<str> = url.as_str().into();
    let columns_url = url.join("_columns")?;
    let mut remote = RemoteColumns::new(client.clone(), columns_url, store.clone());
    remote.sync().await?;

    let mut feed_url = url.clone();
    feed_url
        .query_pairs_mut()
        .append_pair("since", &options.since.to_string())
        .append_pair("raw", "true")
        .append_pair("live", &options.live.to_string());
    info!(url = %feed_url, "pulling changes");
    let response = client
        .get(feed_url)
        .send()
        .await
        .context("failed to connect to remote feed")?
        .error_for_status()?;
    let body = StreamReader::new(Box::pin(
        response.bytes_stream().map_err(io::Error::other),
    ));
    let mut lines = FramedRead::new(body, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    let (tx, rx) = mpsc::channel(PULL_CHANNEL_CAP);
    let pipeline_options = PipelineOptions {
        mode: Some(CommitMode::Merge),
        primary: ID_FIELD.to_string(),
        ..options.pipeline
    };
    let handle = ingest::spawn(
        store.clone(),
        Input::replicated(ReceiverStream::new(rx)),
        pipeline_options,
    );

    let metrics = store.metrics().clone();
    let cancel = options.cancel.clone();
    let read_feed = async move {
        let mut last_seq = options.since;
        let mut received = 0u64;
        let mut interrupted = false;
        loop {
            let line = tokio::select! {
                line = lines.next() => line,
                _ = cancel.cancelled() => {
                    debug!(last_seq, "pull cancelled");
                    interrupted = true;
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            let line = line.with_context(|| format!("feed interrupted after seq {last_seq}"))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: FeedEntry = serde_json::from_str(&line)
                .with_context(|| format!("invalid feed entry after seq {last_seq}"))?;
            trace!(seq = entry.seq, id = %entry.id, "received entry");
            received += 1;
            metrics.pull_entries_received.inc();
            let Some(raw) = entry.raw else {
                warn!(seq = entry.seq, id = %entry.id, "entry without content, skipping");
                last_seq = entry.seq;
                continue;
            };
            let value = Bytes::from(
                BASE64
                    .decode(raw.as_bytes())
                    .with_context(|| format!("invalid row content at seq {}", entry.seq))?,
            );
            // a malformed row is reported by the pipeline
            if let Ok(count) = codec::field_count(&value) {
                remote.ensure(count).await?;
            }
            let record = Record::Replicated {
                id: entry.id,
                value,
                adopted: Adopted {
                    origin: origin.clone(),
                    seq: entry.seq,
                    rev: entry.rev,
                },
            };
            if tx.send(Ok(record)).await.is_err() {
                break;
            }
            last_seq = entry.seq;
        }
        anyhow::Ok((last_seq, received, interrupted))
    };
    let (fed, collected) = tokio::join!(read_feed, handle.collect());
    let (outcomes, ingest) = collected?;
    for outcome in &outcomes {
        if let RowOutcome::Failed { id, error } = outcome {
            warn!(?id, "failed to apply entry: {error}");
        }
    }
    let (last_seq, received, interrupted) = fed?;
    let summary = PullSummary {
        last_seq,
        received,
        skipped: ingest.unchanged,
        interrupted,
        ingest,
    };
    info!(?summary, "pull finished");
    Ok(summary)
}

/// The column set of the remote, mirrored into the local store.
#[derive(Debug)]
struct RemoteColumns {
    client: reqwest::Client,
    url: Url,
    store: Store,
    columns: Vec<String>,
}

impl RemoteColumns {
    fn new(client: reqwest::Client, url: Url, store: Store) -> Self {
        Self {
            client,
            url,
            store,
            columns: Vec::new(),
        }
    }

    /// Fetch the remote columns and append them locally, in remote order.
    ///
    /// Fails if the local column set does not start with the remote one.
    async fn sync(&mut self) -> Result<()> {
        let columns: Vec<String> = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("failed to read remote columns")?;
        let store = self.store.clone();
        let names = columns.clone();
        let (added, local) = tokio::task::spawn_blocking(move || {
            let added = store.add_columns(&names)?;
            anyhow::Ok((added, store.columns()?))
        })
        .await??;
        if !local.starts_with(&columns) {
            bail!("local columns {local:?} do not start with the remote columns {columns:?}");
        }
        debug!(?added, "synced remote columns");
        self.columns = columns;
        Ok(())
    }

    /// Sync again if a row has more fields than known remote columns.
    async fn ensure(&mut self, fields: usize) -> Result<()> {
        if fields > self.columns.len() {
            self.sync().await?;
        }
        Ok(())
    }
}
