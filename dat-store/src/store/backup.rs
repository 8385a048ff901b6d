//! Point in time dumps of the whole database.
//!
//! A dump is a sequence of frames, one per table entry, each an encoded row (see
//! [`crate::codec`]) whose first field names the table. All frames are read from a
//! single read transaction.

use bytes::Bytes;
use redb::ReadableTable;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::{debug, info};

use super::{
    tables::{Tables, COLUMNS_TABLE, CURRENT_TABLE, ORIGINS_TABLE, ROWS_TABLE, SEQUENCES_TABLE},
    ColumnCatalog, Store,
};
use crate::{codec, error::StoreError};

const COLUMNS: &[u8] = b"columns";
const SEQUENCES: &[u8] = b"sequences";
const ROWS: &[u8] = b"rows";
const CURRENT: &[u8] = b"current";
const ORIGINS: &[u8] = b"origins";

/// Upper bound for a single frame of a dump.
const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Framing of dumps on the wire and on disk: a 4 byte big endian length prefix per frame.
pub fn backup_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

impl Store {
    /// Dump every table entry, calling `emit` with one frame per entry.
    ///
    /// Stops early if `emit` returns `false`. Returns the number of frames emitted.
    pub fn backup(&self, mut emit: impl FnMut(Bytes) -> bool) -> Result<u64, StoreError> {
        let read_tx = self.inner.db.begin_read()?;
        let mut frames = 0u64;
        let mut send = |fields: &[&[u8]]| {
            frames += 1;
            emit(codec::encode(fields))
        };

        for item in read_tx.open_table(COLUMNS_TABLE)?.iter()? {
            let (pos, name) = item?;
            let pos = pos.value().to_string();
            if !send(&[COLUMNS, pos.as_bytes(), name.value().as_bytes()]) {
                return Ok(frames);
            }
        }
        for item in read_tx.open_table(SEQUENCES_TABLE)?.iter()? {
            let (seq, entry) = item?;
            let seq = seq.value().to_string();
            let (id, rev) = entry.value();
            if !send(&[SEQUENCES, seq.as_bytes(), id.as_bytes(), rev.as_bytes()]) {
                return Ok(frames);
            }
        }
        for item in read_tx.open_table(ROWS_TABLE)?.iter()? {
            let (key, value) = item?;
            let (id, rev) = key.value();
            if !send(&[ROWS, id.as_bytes(), rev.as_bytes(), value.value()]) {
                return Ok(frames);
            }
        }
        for item in read_tx.open_table(CURRENT_TABLE)?.iter()? {
            let (id, entry) = item?;
            let (rev, seq) = entry.value();
            let seq = seq.to_string();
            if !send(&[CURRENT, id.value().as_bytes(), rev.as_bytes(), seq.as_bytes()]) {
                return Ok(frames);
            }
        }
        for item in read_tx.open_table(ORIGINS_TABLE)?.iter()? {
            let (key, seq) = item?;
            let (origin, id) = key.value();
            let seq = seq.value().to_string();
            if !send(&[ORIGINS, origin.as_bytes(), id.as_bytes(), seq.as_bytes()]) {
                return Ok(frames);
            }
        }
        debug!(frames, "backup written");
        Ok(frames)
    }

    /// Load a dump produced by [`Store::backup`] into this store, which must be empty.
    ///
    /// All frames are written in one transaction. Returns the number of frames applied.
    pub fn restore(&self, frames: impl IntoIterator<Item = Bytes>) -> Result<u64, StoreError> {
        if self.seq() != 0 || !self.columns()?.is_empty() {
            return Err(StoreError::NotEmpty);
        }
        let write_tx = self.inner.db.begin_write()?;
        let mut applied = 0u64;
        let mut head = 0u64;
        {
            let mut tables = Tables::new(&write_tx)?;
            let mut columns = write_tx.open_table(COLUMNS_TABLE)?;
            for frame in frames {
                let fields = codec::decode(&frame).map_err(|err| StoreError::Corrupt(err.to_string()))?;
                match fields.first().map(|table| &table[..]) {
                    Some(COLUMNS) => {
                        columns.insert(number(&fields, 1)?, text(&fields, 2)?)?;
                    }
                    Some(SEQUENCES) => {
                        let seq = number(&fields, 1)?;
                        tables.sequences.insert(seq, (text(&fields, 2)?, text(&fields, 3)?))?;
                        head = head.max(seq);
                    }
                    Some(ROWS) => {
                        let value = fields
                            .get(3)
                            .ok_or_else(|| StoreError::Corrupt("backup row lacks content".to_string()))?;
                        tables.rows.insert((text(&fields, 1)?, text(&fields, 2)?), &value[..])?;
                    }
                    Some(CURRENT) => {
                        tables
                            .current
                            .insert(text(&fields, 1)?, (text(&fields, 2)?, number(&fields, 3)?))?;
                    }
                    Some(ORIGINS) => {
                        tables
                            .origins
                            .insert((text(&fields, 1)?, text(&fields, 2)?), number(&fields, 3)?)?;
                    }
                    _ => return Err(StoreError::Corrupt("unknown backup frame".to_string())),
                }
                applied += 1;
            }
        }
        write_tx.commit()?;
        self.inner.head.send_replace(head);
        info!(frames = applied, head, "backup restored");
        Ok(applied)
    }
}

fn text(fields: &[Bytes], index: usize) -> Result<&str, StoreError> {
    let field = fields
        .get(index)
        .ok_or_else(|| StoreError::Corrupt(format!("backup frame lacks field {index}")))?;
    std::str::from_utf8(field)
        .map_err(|_| StoreError::Corrupt(format!("backup field {index} is not UTF-8")))
}

fn number(fields: &[Bytes], index: usize) -> Result<u64, StoreError> {
    text(fields, index)?
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("backup field {index} is not a number")))
}
