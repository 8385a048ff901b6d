//! Input formats and their normalization into canonical rows.
//!
//! Every input is turned into a stream of [`Record`]s. A [`RowBuilder`] then maps
//! records onto the column set of the store and extracts the primary key, yielding
//! a [`PendingRow`] ready to be committed.

use std::{collections::HashMap, io, str::FromStr, sync::Arc};

use bytes::Bytes;
use futures_util::{
    future,
    stream::{BoxStream, Stream, StreamExt},
};
use genawaiter::sync::Gen;
use serde_json::{Map, Value};
use tokio::io::AsyncRead;
use tokio_util::{
    codec::{FramedRead, LengthDelimitedCodec, LinesCodec, LinesCodecError},
    io::ReaderStream,
};

use crate::{
    codec::{self, CodecError},
    error::PipelineError,
    store::{generate_id, Adopted, PendingRow},
};

/// Reserved field carrying the row identity. Never a column.
pub const ID_FIELD: &str = "_id";
/// Reserved field carrying the revision. Ignored on input, never a column.
pub const REV_FIELD: &str = "_rev";

/// Upper bound for a single line of newline delimited input.
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;
/// Upper bound for a single frame of binary input.
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Whether `name` is reserved and can not be used as a column.
pub fn is_reserved(name: &str) -> bool {
    name == ID_FIELD || name == REV_FIELD
}

/// The closed set of supported input encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum InputFormat {
    /// Delimited text, the first record is the header.
    Csv {
        /// Field separator, usually `,` or `\t`.
        delimiter: u8,
    },
    /// One JSON object per line.
    Ndjson,
    /// In-memory JSON objects.
    Objects,
    /// Length prefixed frames, each holding an already encoded row.
    Binary,
    /// Encoded rows replicated from another store, with their origin revision.
    Feed,
}

impl InputFormat {
    /// Comma separated values.
    pub const CSV: Self = Self::Csv { delimiter: b',' };
    /// Tab separated values.
    pub const TSV: Self = Self::Csv { delimiter: b'\t' };

    /// Whether records of this format declare their field names.
    pub fn discovers_columns(&self) -> bool {
        !matches!(self, Self::Binary | Self::Feed)
    }
}

impl FromStr for InputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csv" => Ok(Self::CSV),
            "tsv" => Ok(Self::TSV),
            "ndjson" | "json" => Ok(Self::Ndjson),
            "objects" => Ok(Self::Objects),
            "binary" => Ok(Self::Binary),
            _ => Err(PipelineError::UnknownFormat(s.to_string())),
        }
    }
}

/// One decoded unit of input, before it is mapped onto the column set.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Cells in the order of the header.
    Positional {
        /// Field names from the header record, shared by all records of the input.
        header: Arc<[String]>,
        /// Cell contents.
        cells: Vec<Bytes>,
    },
    /// Fields looked up by name.
    Named(Map<String, Value>),
    /// An encoded row, see [`crate::codec`].
    Framed(Bytes),
    /// An encoded row as stored by another store. Kept byte for byte.
    Replicated {
        /// Row identity at the origin.
        id: String,
        /// Encoded row content.
        value: Bytes,
        /// Where the row comes from and its revision there.
        adopted: Adopted,
    },
    /// Input that could not be decoded. Reported as a failed row.
    Malformed(String),
}

impl Record {
    /// The field names this record refers to, excluding reserved fields.
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            Self::Positional { header, .. } => header
                .iter()
                .map(String::as_str)
                .filter(|name| !is_reserved(name))
                .collect(),
            Self::Named(fields) => fields
                .keys()
                .map(String::as_str)
                .filter(|name| !is_reserved(name))
                .collect(),
            Self::Framed(_) | Self::Replicated { .. } | Self::Malformed(_) => Vec::new(),
        }
    }
}

/// A source of records in one [`InputFormat`].
#[derive(derive_more::Debug)]
pub struct Input {
    format: InputFormat,
    #[debug("Stream")]
    records: BoxStream<'static, io::Result<Record>>,
}

impl Input {
    /// Delimited text with a header record.
    pub fn csv<R>(reader: R, delimiter: u8) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            format: InputFormat::Csv { delimiter },
            records: csv_records(reader, delimiter).boxed(),
        }
    }

    /// Newline delimited JSON objects. Blank lines are skipped.
    pub fn ndjson<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let records = lines.filter_map(|line| {
            future::ready(match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(Ok(parse_object(&line))),
                Err(LinesCodecError::MaxLineLengthExceeded) => Some(Ok(Record::Malformed(
                    format!("line exceeds {MAX_LINE_LENGTH} bytes"),
                ))),
                Err(LinesCodecError::Io(err)) => Some(Err(err)),
            })
        });
        Self {
            format: InputFormat::Ndjson,
            records: records.boxed(),
        }
    }

    /// In-memory JSON objects.
    pub fn objects<S>(objects: S) -> Self
    where
        S: Stream<Item = Map<String, Value>> + Send + 'static,
    {
        Self {
            format: InputFormat::Objects,
            records: objects.map(|fields| Ok(Record::Named(fields))).boxed(),
        }
    }

    /// Frames with a 4 byte big endian length prefix, each holding an encoded row.
    pub fn binary<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        let records = FramedRead::new(reader, codec).map(|frame| frame.map(|frame| Record::Framed(frame.freeze())));
        Self {
            format: InputFormat::Binary,
            records: records.boxed(),
        }
    }

    /// Rows read from the change feed of another store.
    ///
    /// Every item must be a [`Record::Replicated`] or a [`Record::Malformed`].
    pub fn replicated<S>(records: S) -> Self
    where
        S: Stream<Item = io::Result<Record>> + Send + 'static,
    {
        Self {
            format: InputFormat::Feed,
            records: records.boxed(),
        }
    }

    /// Select the adapter for a byte oriented format.
    pub fn from_reader<R>(format: InputFormat, reader: R) -> Result<Self, PipelineError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        match format {
            InputFormat::Csv { delimiter } => Ok(Self::csv(reader, delimiter)),
            InputFormat::Ndjson => Ok(Self::ndjson(reader)),
            InputFormat::Binary => Ok(Self::binary(reader)),
            InputFormat::Objects => Err(PipelineError::Format {
                format,
                reason: "in-memory objects can not be read from bytes".to_string(),
            }),
            InputFormat::Feed => Err(PipelineError::Format {
                format,
                reason: "replicated rows are only produced by pull".to_string(),
            }),
        }
    }

    /// The format of this input.
    pub fn format(&self) -> InputFormat {
        self.format
    }

    /// The next record, or `None` at the end of the input.
    pub async fn next(&mut self) -> Option<io::Result<Record>> {
        self.records.next().await
    }
}

fn parse_object(line: &str) -> Record {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(fields)) => Record::Named(fields),
        Ok(other) => Record::Malformed(format!("expected a JSON object, got {other}")),
        Err(err) => Record::Malformed(format!("invalid JSON: {err}")),
    }
}

fn csv_records<R>(reader: R, delimiter: u8) -> impl Stream<Item = io::Result<Record>> + Send
where
    R: AsyncRead + Send + Unpin + 'static,
{
    Gen::new(|co| async move {
        let mut chunks = ReaderStream::new(reader);
        let mut decoder = CsvDecoder::new(delimiter);
        let mut header: Option<Arc<[String]>> = None;
        let mut parsed = Vec::new();
        loop {
            let chunk = match chunks.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    co.yield_(Err(err)).await;
                    return;
                }
                None => Bytes::new(),
            };
            let ended = decoder.decode(&chunk, &mut parsed);
            for cells in parsed.drain(..) {
                match header.clone() {
                    Some(header) => co.yield_(Ok(Record::Positional { header, cells })).await,
                    None => {
                        header = Some(
                            cells
                                .iter()
                                .map(|cell| String::from_utf8_lossy(cell).trim().to_string())
                                .collect(),
                        )
                    }
                }
            }
            if ended {
                return;
            }
        }
    })
}

/// Incremental delimited text parser. Records may span chunk boundaries.
#[derive(derive_more::Debug)]
struct CsvDecoder {
    #[debug("csv_core::Reader")]
    reader: csv_core::Reader,
    output: Vec<u8>,
    ends: Vec<usize>,
    out_len: usize,
    ends_len: usize,
}

impl CsvDecoder {
    fn new(delimiter: u8) -> Self {
        Self {
            reader: csv_core::ReaderBuilder::new().delimiter(delimiter).build(),
            output: vec![0; 1024],
            ends: vec![0; 16],
            out_len: 0,
            ends_len: 0,
        }
    }

    /// Parse `input`, appending complete records to `records`.
    ///
    /// An empty `input` marks the end of the data. Returns true once the end was reached.
    fn decode(&mut self, mut input: &[u8], records: &mut Vec<Vec<Bytes>>) -> bool {
        use csv_core::ReadRecordResult;

        let eof = input.is_empty();
        loop {
            let (res, n_in, n_out, n_ends) = self.reader.read_record(
                input,
                &mut self.output[self.out_len..],
                &mut self.ends[self.ends_len..],
            );
            input = &input[n_in..];
            self.out_len += n_out;
            self.ends_len += n_ends;
            match res {
                ReadRecordResult::InputEmpty => return eof,
                ReadRecordResult::OutputFull => {
                    let len = self.output.len() * 2;
                    self.output.resize(len, 0);
                }
                ReadRecordResult::OutputEndsFull => {
                    let len = self.ends.len() * 2;
                    self.ends.resize(len, 0);
                }
                ReadRecordResult::Record => {
                    let mut cells = Vec::with_capacity(self.ends_len);
                    let mut start = 0;
                    for &end in &self.ends[..self.ends_len] {
                        cells.push(Bytes::copy_from_slice(&self.output[start..end]));
                        start = end;
                    }
                    records.push(cells);
                    self.out_len = 0;
                    self.ends_len = 0;
                }
                ReadRecordResult::End => return true,
            }
        }
    }
}

/// Why a single record could not be turned into a row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// The input could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),
    /// The record has no value for the primary key.
    #[error("missing primary key {0:?}")]
    MissingPrimary(String),
    /// The primary key value is not valid UTF-8.
    #[error("primary key {0:?} is not valid UTF-8")]
    InvalidPrimary(String),
    /// A field was not declared as a column before the record was built.
    #[error("undeclared column {0:?}")]
    UndeclaredColumn(String),
    /// A binary frame is not a well formed row.
    #[error("invalid row encoding: {0}")]
    Encoding(#[from] CodecError),
}

/// Maps records onto the column set and extracts their primary key.
#[derive(Debug, Clone)]
pub struct RowBuilder {
    primary: String,
    columns: Vec<String>,
    positions: HashMap<String, usize>,
    framed_primary: Option<usize>,
}

impl RowBuilder {
    /// Create a builder for the given primary key and current column set.
    pub fn new(primary: impl Into<String>, columns: Vec<String>) -> Self {
        let mut this = Self {
            primary: primary.into(),
            columns: Vec::new(),
            positions: HashMap::new(),
            framed_primary: None,
        };
        this.set_columns(columns);
        this
    }

    /// The primary key name.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// The column set records are mapped onto.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Replace the column set with a newer one.
    ///
    /// The column set only grows, so positions resolved earlier stay valid.
    pub fn set_columns(&mut self, columns: Vec<String>) {
        self.positions = columns
            .iter()
            .enumerate()
            .map(|(pos, name)| (name.clone(), pos))
            .collect();
        self.columns = columns;
    }

    /// Names in `names` that are not yet columns, in order of first appearance.
    pub fn unseen<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut unseen: Vec<String> = Vec::new();
        for name in names {
            if !self.positions.contains_key(name) && !unseen.iter().any(|n| n == name) {
                unseen.push(name.to_string());
            }
        }
        unseen
    }

    /// Resolve the field index of the primary key within framed rows.
    ///
    /// Must be called once the declared columns are known. With the reserved identity
    /// field as primary key, identities are generated instead.
    pub fn resolve_framed_primary(&mut self) -> Result<(), PipelineError> {
        if self.primary == ID_FIELD {
            self.framed_primary = None;
            return Ok(());
        }
        let pos = self
            .positions
            .get(&self.primary)
            .copied()
            .ok_or_else(|| PipelineError::UnknownPrimary(self.primary.clone()))?;
        self.framed_primary = Some(pos);
        Ok(())
    }

    /// Turn a record into a row ready to be committed.
    pub fn build(&self, record: Record) -> Result<PendingRow, RecordError> {
        match record {
            Record::Positional { header, cells } => self.build_positional(&header, cells),
            Record::Named(fields) => self.build_named(fields),
            Record::Framed(frame) => self.build_framed(frame),
            Record::Replicated { id, value, adopted } => {
                codec::validate(&value)?;
                Ok(PendingRow {
                    id,
                    value,
                    expected: None,
                    adopted: Some(adopted),
                })
            }
            Record::Malformed(reason) => Err(RecordError::Malformed(reason)),
        }
    }

    fn build_positional(&self, header: &[String], cells: Vec<Bytes>) -> Result<PendingRow, RecordError> {
        if cells.len() > header.len() {
            return Err(RecordError::Malformed(format!(
                "record has {} cells, header has {}",
                cells.len(),
                header.len()
            )));
        }
        let mut id = None;
        let mut fields = vec![Bytes::new(); self.columns.len()];
        for (name, cell) in header.iter().zip(cells) {
            if *name == self.primary {
                if !cell.is_empty() {
                    let key = String::from_utf8(cell.to_vec())
                        .map_err(|_| RecordError::InvalidPrimary(name.clone()))?;
                    id = Some(key);
                }
                if *name == ID_FIELD {
                    continue;
                }
            }
            if is_reserved(name) {
                continue;
            }
            let pos = self
                .positions
                .get(name)
                .ok_or_else(|| RecordError::UndeclaredColumn(name.clone()))?;
            fields[*pos] = cell;
        }
        Ok(PendingRow {
            id: self.identity(id)?,
            value: encode_trimmed(fields),
            expected: None,
            adopted: None,
        })
    }

    fn build_named(&self, record: Map<String, Value>) -> Result<PendingRow, RecordError> {
        let id = match record.get(&self.primary) {
            None | Some(Value::Null) => None,
            Some(Value::String(key)) if key.is_empty() => None,
            Some(Value::String(key)) => Some(key.clone()),
            Some(other) => Some(other.to_string()),
        };
        let mut fields = vec![Bytes::new(); self.columns.len()];
        for (name, value) in &record {
            if is_reserved(name) {
                continue;
            }
            let pos = self
                .positions
                .get(name)
                .ok_or_else(|| RecordError::UndeclaredColumn(name.clone()))?;
            fields[*pos] = encode_cell(value);
        }
        Ok(PendingRow {
            id: self.identity(id)?,
            value: encode_trimmed(fields),
            expected: None,
            adopted: None,
        })
    }

    fn build_framed(&self, frame: Bytes) -> Result<PendingRow, RecordError> {
        let fields = codec::decode(&frame)?;
        let id = match self.framed_primary.and_then(|pos| fields.get(pos)) {
            None => None,
            Some(key) if key.is_empty() => None,
            Some(key) => Some(
                std::str::from_utf8(key)
                    .map_err(|_| RecordError::InvalidPrimary(self.primary.clone()))?
                    .to_string(),
            ),
        };
        // same normal form as rows built from text
        let value = match fields.last() {
            Some(last) if last.is_empty() => encode_trimmed(fields),
            _ => frame,
        };
        Ok(PendingRow {
            id: self.identity(id)?,
            value,
            expected: None,
            adopted: None,
        })
    }

    fn identity(&self, key: Option<String>) -> Result<String, RecordError> {
        match key {
            Some(key) => Ok(key),
            None if self.primary == ID_FIELD => Ok(generate_id()),
            None => Err(RecordError::MissingPrimary(self.primary.clone())),
        }
    }
}

/// The stored form of a JSON value.
///
/// Strings are stored as their bytes, `null` as an empty cell, anything else as JSON text.
pub fn encode_cell(value: &Value) -> Bytes {
    match value {
        Value::Null => Bytes::new(),
        Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
        other => Bytes::from(other.to_string()),
    }
}

/// Encode fields, dropping trailing empty cells so that appending columns does not
/// change the encoding of existing rows.
fn encode_trimmed(mut fields: Vec<Bytes>) -> Bytes {
    while fields.last().is_some_and(|field| field.is_empty()) {
        fields.pop();
    }
    codec::encode(&fields)
}

/// Decode a stored row into a JSON object using the column set.
///
/// Empty cells are omitted. Cells beyond the known columns are keyed by position.
pub fn decode_object(value: &Bytes, columns: &[String]) -> Result<Map<String, Value>, CodecError> {
    let fields = codec::decode(value)?;
    let mut object = Map::new();
    for (pos, field) in fields.into_iter().enumerate() {
        if field.is_empty() {
            continue;
        }
        let name = match columns.get(pos) {
            Some(name) => name.clone(),
            None => pos.to_string(),
        };
        let text = String::from_utf8_lossy(&field).into_owned();
        object.insert(name, Value::String(text));
    }
    Ok(object)
}
