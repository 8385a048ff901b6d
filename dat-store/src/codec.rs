//! Length-prefixed row framing.
//!
//! A row is stored as a field count, a table of end offsets and the
//! concatenated field payloads:
//!
//! ```text
//! | count: u32 | end_0: u32 | .. | end_{n-1}: u32 | payload_0 | .. | payload_{n-1} |
//! ```
//!
//! All integers are big endian. Offsets are relative to the start of the payload
//! section, which allows slicing out field `n` without decoding the others.

use bytes::{BufMut, Bytes, BytesMut};

const LEN_SIZE: usize = 4;

/// Errors from decoding a framed row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The row ends before its header says it should.
    #[error("row is truncated: need {expected} bytes, have {actual}")]
    Truncated {
        /// Number of bytes required.
        expected: usize,
        /// Number of bytes present.
        actual: usize,
    },
    /// An entry of the offset table points outside of the payload.
    #[error("field {index} has invalid bounds {start}..{end}")]
    InvalidOffset {
        /// Index of the offending field.
        index: usize,
        /// Start offset within the payload.
        start: usize,
        /// End offset within the payload.
        end: usize,
    },
}

/// Encode a sequence of fields into a single row.
pub fn encode<F: AsRef<[u8]>>(fields: &[F]) -> Bytes {
    let payload_len: usize = fields.iter().map(|f| f.as_ref().len()).sum();
    let mut buf = BytesMut::with_capacity(LEN_SIZE * (fields.len() + 1) + payload_len);
    buf.put_u32(fields.len() as u32);
    let mut end = 0u32;
    for field in fields {
        end += field.as_ref().len() as u32;
        buf.put_u32(end);
    }
    for field in fields {
        buf.put_slice(field.as_ref());
    }
    buf.freeze()
}

/// Number of fields in an encoded row.
pub fn field_count(row: &[u8]) -> Result<usize, CodecError> {
    layout(row).map(|(count, _)| count)
}

/// Extract field `index` without decoding the preceding fields.
///
/// Returns `Ok(None)` if the row has fewer than `index + 1` fields.
pub fn field_at(row: &[u8], index: usize) -> Result<Option<&[u8]>, CodecError> {
    let (count, payload) = layout(row)?;
    if index >= count {
        return Ok(None);
    }
    let (start, end) = bounds(row, index)?;
    let (abs_start, abs_end) = (payload + start, payload + end);
    if start > end || abs_end > row.len() {
        return Err(CodecError::InvalidOffset { index, start, end });
    }
    Ok(Some(&row[abs_start..abs_end]))
}

/// Decode all fields of a row. The returned fields share the row's buffer.
pub fn decode(row: &Bytes) -> Result<Vec<Bytes>, CodecError> {
    let (count, payload) = layout(row)?;
    let mut fields = Vec::with_capacity(count);
    let mut prev_end = 0;
    for index in 0..count {
        let end = read_u32(row, LEN_SIZE * (index + 1))?;
        if end < prev_end || payload + end > row.len() {
            return Err(CodecError::InvalidOffset {
                index,
                start: prev_end,
                end,
            });
        }
        fields.push(row.slice(payload + prev_end..payload + end));
        prev_end = end;
    }
    Ok(fields)
}

/// Check that `row` is a well formed encoding. Returns the number of fields.
pub fn validate(row: &Bytes) -> Result<usize, CodecError> {
    decode(row).map(|fields| fields.len())
}

fn layout(row: &[u8]) -> Result<(usize, usize), CodecError> {
    let count = read_u32(row, 0)?;
    let payload = count
        .checked_add(1)
        .and_then(|n| n.checked_mul(LEN_SIZE))
        .unwrap_or(usize::MAX);
    if row.len() < payload {
        return Err(CodecError::Truncated {
            expected: payload,
            actual: row.len(),
        });
    }
    Ok((count, payload))
}

fn bounds(row: &[u8], index: usize) -> Result<(usize, usize), CodecError> {
    let start = match index {
        0 => 0,
        _ => read_u32(row, LEN_SIZE * index)?,
    };
    let end = read_u32(row, LEN_SIZE * (index + 1))?;
    Ok((start, end))
}

fn read_u32(buf: &[u8], at: usize) -> Result<usize, CodecError> {
    match buf.get(at..at + LEN_SIZE) {
        Some(b) => Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize),
        None => Err(CodecError::Truncated {
            expected: at + LEN_SIZE,
            actual: buf.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_row() {
        let row = encode::<&[u8]>(&[]);
        assert_eq!(row.len(), LEN_SIZE);
        assert_eq!(field_count(&row).unwrap(), 0);
        assert_eq!(field_at(&row, 0).unwrap(), None);
        assert!(decode(&row).unwrap().is_empty());
    }

    #[test]
    fn positional_access() {
        let row = encode(&["alice", "", "30"]);
        assert_eq!(field_count(&row).unwrap(), 3);
        assert_eq!(field_at(&row, 0).unwrap(), Some(&b"alice"[..]));
        assert_eq!(field_at(&row, 1).unwrap(), Some(&b""[..]));
        assert_eq!(field_at(&row, 2).unwrap(), Some(&b"30"[..]));
        assert_eq!(field_at(&row, 3).unwrap(), None);
    }

    #[test]
    fn truncated_rows_are_rejected() {
        let row = encode(&["alice", "30"]);
        assert!(matches!(
            field_count(&row[..2]),
            Err(CodecError::Truncated { .. })
        ));
        // header intact, payload cut short
        let cut = row.slice(..row.len() - 1);
        assert!(matches!(
            field_at(&cut, 1),
            Err(CodecError::InvalidOffset { index: 1, .. })
        ));
        assert!(validate(&cut).is_err());
        assert_eq!(validate(&row).unwrap(), 2);
    }

    #[test]
    fn huge_count_does_not_overflow() {
        let row = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            field_count(&row),
            Err(CodecError::Truncated { .. })
        ));
    }

    proptest! {
        #[test]
        fn field_at_agrees_with_decode(fields in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..16)) {
            let row = encode(&fields);
            let decoded = decode(&row).unwrap();
            prop_assert_eq!(decoded.len(), fields.len());
            for (i, field) in fields.iter().enumerate() {
                prop_assert_eq!(field_at(&row, i).unwrap(), Some(&field[..]));
                prop_assert_eq!(&decoded[i][..], &field[..]);
            }
        }
    }
}
