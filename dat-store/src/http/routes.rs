//! Request handlers.

use axum::{
    body::{Body, Bytes},
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    BoxError, Json,
};
use bytes::BytesMut;
use futures_util::{Stream, StreamExt, TryStreamExt};
use genawaiter::sync::Gen;
use http::{header::CONTENT_TYPE, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::{codec::Encoder, io::StreamReader};
use tracing::debug;

use super::error::{AppError, AppResult};
use crate::{
    feed::{self, FeedOptions, RowDecoder, SnapshotRow},
    formats::{Input, InputFormat, ID_FIELD},
    ingest::{self, PipelineOptions},
    state::AppState,
    store::{backup_codec, ColumnCatalog, CommitMode},
};

const NDJSON: &str = "application/x-ndjson";

/// GET handler for the change feed.
pub async fn changes(
    State(state): State<AppState>,
    query: Result<Query<FeedOptions>, QueryRejection>,
) -> AppResult<Response> {
    let Query(options) = query?;
    Ok(ndjson_response(feed::changes(&state.store, options)))
}

/// GET handler for the current rows.
pub async fn snapshot(State(state): State<AppState>) -> Response {
    ndjson_response(feed::snapshot(&state.store))
}

/// GET handler for the column set.
pub async fn columns(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    let store = state.store.clone();
    let columns = tokio::task::spawn_blocking(move || store.columns()).await??;
    Ok(Json(columns))
}

/// GET handler for a single row at its latest revision.
pub async fn get_row(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
) -> AppResult<Json<SnapshotRow>> {
    let Path(id) = id?;
    let store = state.store.clone();
    let row = tokio::task::spawn_blocking(move || {
        let row = store.get(&id)?;
        let value = RowDecoder::new(store).decode(&row.value)?;
        Ok::<_, crate::error::StoreError>(SnapshotRow {
            id: row.id,
            rev: row.rev,
            value,
        })
    })
    .await??;
    Ok(Json(row))
}

/// GET handler streaming a point in time dump of the database.
///
/// The body is a sequence of frames with a 4 byte big endian length prefix.
pub async fn backup(State(state): State<AppState>) -> Response {
    let (tx, rx) = mpsc::channel(64);
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || {
        let mut codec = backup_codec();
        let res = store.backup(|frame| {
            let mut buf = BytesMut::with_capacity(frame.len() + 4);
            if let Err(err) = codec.encode(frame, &mut buf) {
                tx.blocking_send(Err(BoxError::from(err))).ok();
                return false;
            }
            tx.blocking_send(Ok(buf.freeze())).is_ok()
        });
        if let Err(err) = res {
            tx.blocking_send(Err(BoxError::from(err))).ok();
        }
    });
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Query of the bulk endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkQuery {
    /// Input format: `csv`, `tsv`, `ndjson` or `binary`.
    #[serde(default = "default_format")]
    pub format: String,
    /// Name of the primary key field.
    pub primary: Option<String>,
    /// Commit mode, by default chosen by whether the store is empty.
    pub mode: Option<CommitMode>,
    /// Field separator of delimited text.
    pub delimiter: Option<char>,
    /// Declared columns of binary input, comma separated.
    pub columns: Option<String>,
}

fn default_format() -> String {
    "ndjson".to_string()
}

/// POST handler streaming the request body through an ingestion pipeline.
///
/// Responds with one outcome per input record, followed by a final `done` or `error` line.
pub async fn bulk(
    State(state): State<AppState>,
    query: Result<Query<BulkQuery>, QueryRejection>,
    body: Body,
) -> AppResult<Response> {
    let Query(query) = query?;
    let mut format: InputFormat = query.format.parse()?;
    if let (InputFormat::Csv { .. }, Some(delimiter)) = (format, query.delimiter) {
        let delimiter = u8::try_from(delimiter).map_err(|_| {
            AppError::new(StatusCode::BAD_REQUEST, Some("delimiter must be a single byte"))
        })?;
        format = InputFormat::Csv { delimiter };
    }
    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let input = Input::from_reader(format, reader)?;
    let options = PipelineOptions {
        mode: query.mode,
        primary: query.primary.unwrap_or_else(|| ID_FIELD.to_string()),
        columns: query
            .columns
            .map(|columns| columns.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        ..Default::default()
    };
    debug!(%format, mode = ?options.mode, "bulk request");
    let mut handle = ingest::spawn(state.store.clone(), input, options);
    let outcomes = Gen::new(|co| async move {
        while let Some(outcome) = handle.next().await {
            co.yield_(ndjson_line(&outcome)).await;
        }
        let last = match handle.finish().await {
            Ok(summary) => json!({"status": "done", "summary": summary}),
            Err(err) => json!({"status": "error", "error": err.to_string()}),
        };
        co.yield_(ndjson_line(&last)).await;
    });
    Ok(ndjson_body(outcomes))
}

fn ndjson_response<T, E>(items: impl Stream<Item = Result<T, E>> + Send + 'static) -> Response
where
    T: Serialize,
    E: Into<BoxError>,
{
    ndjson_body(items.map(|item| item.map_err(Into::into).and_then(|item| ndjson_line(&item))))
}

fn ndjson_body(lines: impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, NDJSON)],
        Body::from_stream(lines),
    )
        .into_response()
}

fn ndjson_line<T: Serialize>(item: &T) -> Result<Bytes, BoxError> {
    let mut line = serde_json::to_vec(item)?;
    line.push(b'\n');
    Ok(line.into())
}
