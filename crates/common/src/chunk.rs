//! Row chunk and overflow envelope framing.
//!
//! A [`Chunk`] payload is a sequence of length-prefixed rows:
//! `u32 little-endian length` followed by the serialized row bytes.
//! A [`ContinueEnvelope`] wraps one chunk for the overflow sink and is what
//! credit accounting measures.

use serde::{Deserialize, Serialize};

use crate::error::{DqrError, Result};

const ROW_LEN_BYTES: usize = 4;
const ENVELOPE_KIND_CONTINUE: u8 = 1;
const ENVELOPE_HEADER_BYTES: usize = 1 + 8 + 4;

/// One unit of row data delivered by an upstream compute task.
///
/// Immutable once built; moved into whichever consumer takes it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Chunk {
    payload: Vec<u8>,
}

impl Chunk {
    /// Frame already-serialized rows into one chunk.
    pub fn from_rows<I, R>(rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let mut payload = Vec::new();
        for row in rows {
            let row = row.as_ref();
            payload.extend_from_slice(&(row.len() as u32).to_le_bytes());
            payload.extend_from_slice(row);
        }
        Self { payload }
    }

    /// Wrap a raw framed payload without validating it.
    ///
    /// Malformed framing surfaces later as a [`DqrError::Serialization`]
    /// when rows are iterated.
    #[must_use]
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Raw framed payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.payload.len()
    }

    /// Iterate serialized rows in order.
    #[must_use]
    pub fn rows(&self) -> RowFrames<'_> {
        RowFrames {
            buf: &self.payload,
            pos: 0,
        }
    }
}

/// Iterator over the length-prefixed rows of a chunk payload.
#[derive(Debug)]
pub struct RowFrames<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for RowFrames<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        if rest.len() < ROW_LEN_BYTES {
            self.pos = self.buf.len();
            return Some(Err(DqrError::Serialization(format!(
                "truncated row length prefix at offset {}",
                self.buf.len() - rest.len()
            ))));
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let end = ROW_LEN_BYTES + len;
        if rest.len() < end {
            let offset = self.pos;
            self.pos = self.buf.len();
            return Some(Err(DqrError::Serialization(format!(
                "row at offset {offset} declares {len} bytes but only {} remain",
                rest.len() - ROW_LEN_BYTES
            ))));
        }
        self.pos += end;
        Some(Ok(&rest[ROW_LEN_BYTES..end]))
    }
}

/// "Continue" message carrying one spilled chunk to the overflow sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinueEnvelope {
    /// Position of this chunk in the spilled stream, starting at 0.
    pub seq: u64,
    /// Spilled chunk.
    pub chunk: Chunk,
}

impl ContinueEnvelope {
    /// Serialized size; the unit of overflow credit accounting.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        (ENVELOPE_HEADER_BYTES + self.chunk.byte_size()) as u64
    }

    /// Append the binary encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(ENVELOPE_HEADER_BYTES + self.chunk.byte_size());
        out.push(ENVELOPE_KIND_CONTINUE);
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&(self.chunk.byte_size() as u32).to_le_bytes());
        out.extend_from_slice(self.chunk.payload());
    }

    /// Decode one envelope from the front of `buf`.
    ///
    /// Returns the envelope and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < ENVELOPE_HEADER_BYTES {
            return Err(DqrError::Serialization(format!(
                "envelope header needs {ENVELOPE_HEADER_BYTES} bytes, got {}",
                buf.len()
            )));
        }
        if buf[0] != ENVELOPE_KIND_CONTINUE {
            return Err(DqrError::Serialization(format!(
                "unknown envelope kind {}",
                buf[0]
            )));
        }
        let mut seq = [0_u8; 8];
        seq.copy_from_slice(&buf[1..9]);
        let mut len = [0_u8; 4];
        len.copy_from_slice(&buf[9..13]);
        let len = u32::from_le_bytes(len) as usize;
        let end = ENVELOPE_HEADER_BYTES + len;
        if buf.len() < end {
            return Err(DqrError::Serialization(format!(
                "envelope payload needs {len} bytes, got {}",
                buf.len() - ENVELOPE_HEADER_BYTES
            )));
        }
        Ok((
            Self {
                seq: u64::from_le_bytes(seq),
                chunk: Chunk::from_payload(buf[ENVELOPE_HEADER_BYTES..end].to_vec()),
            },
            end,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_yielded_in_order() {
        let chunk = Chunk::from_rows(["a", "bb", ""]);
        let rows = chunk
            .rows()
            .collect::<Result<Vec<_>>>()
            .expect("rows");
        assert_eq!(rows, vec![b"a".as_slice(), b"bb".as_slice(), b"".as_slice()]);
        assert_eq!(chunk.byte_size(), 3 * 4 + 3);
    }

    #[test]
    fn truncated_frame_is_a_serialization_error() {
        let mut payload = Chunk::from_rows(["abc"]).payload().to_vec();
        payload.pop();
        let chunk = Chunk::from_payload(payload);
        let mut rows = chunk.rows();
        assert!(matches!(rows.next(), Some(Err(DqrError::Serialization(_)))));
        assert!(rows.next().is_none());
    }

    #[test]
    fn envelope_len_counts_header_and_payload() {
        let env = ContinueEnvelope {
            seq: 7,
            chunk: Chunk::from_rows(["xyz"]),
        };
        let mut buf = Vec::new();
        env.encode_into(&mut buf);
        assert_eq!(buf.len() as u64, env.encoded_len());

        let (decoded, used) = ContinueEnvelope::decode(&buf).expect("decode");
        assert_eq!(used, buf.len());
        assert_eq!(decoded, env);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let buf = [9_u8; 16];
        assert!(ContinueEnvelope::decode(&buf).is_err());
    }
}
