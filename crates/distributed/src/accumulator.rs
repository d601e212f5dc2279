//! In-memory result payload with row/byte limits.
//!
//! Responsibilities:
//! - convert chunks into serialized rows through a [`RowSerializer`];
//! - append rows while both limits hold;
//! - stop at the first row that would break a limit and stay full afterwards.
//!
//! Conversion errors leave the payload exactly as it was before the chunk.

use dqr_common::{Chunk, DqrError, ResultLimits, Result};
use serde::{Deserialize, Serialize};

/// Column names and result type of the rows being aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSchema {
    pub result_type: String,
    pub columns: Vec<String>,
}

impl ResultSchema {
    /// Serialized descriptor carried by the overflow handshake.
    pub fn to_descriptor(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| DqrError::Serialization(format!("schema descriptor encode failed: {e}")))
    }
}

/// Converts chunks into serialized rows.
pub trait RowSerializer: Send {
    /// Feed the rows of `chunk` to `accept` in order.
    ///
    /// Stops as soon as `accept` returns `false`; returns `true` only when
    /// every row was accepted.
    fn write_rows(&self, chunk: &Chunk, accept: &mut dyn FnMut(&[u8]) -> bool) -> Result<bool>;

    fn schema(&self) -> &ResultSchema;
}

/// Serializer for chunks carrying length-prefixed rows.
#[derive(Debug, Clone)]
pub struct FramedRowSerializer {
    schema: ResultSchema,
}

impl FramedRowSerializer {
    pub fn new(schema: ResultSchema) -> Self {
        Self { schema }
    }
}

impl RowSerializer for FramedRowSerializer {
    fn write_rows(&self, chunk: &Chunk, accept: &mut dyn FnMut(&[u8]) -> bool) -> Result<bool> {
        for row in chunk.rows() {
            if !accept(row?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn schema(&self) -> &ResultSchema {
        &self.schema
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Rows,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    Full(LimitKind),
}

/// Payload position that can be restored with [`ResultAccumulator::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadMark {
    rows: usize,
    bytes: u64,
}

impl PayloadMark {
    pub fn rows(&self) -> u64 {
        self.rows as u64
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultPayload {
    rows: Vec<Vec<u8>>,
    bytes: u64,
}

impl ResultPayload {
    pub fn rows(&self) -> &[Vec<u8>] {
        &self.rows
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn into_rows(self) -> Vec<Vec<u8>> {
        self.rows
    }
}

#[derive(Debug)]
pub struct ResultAccumulator {
    limits: ResultLimits,
    payload: ResultPayload,
    full: Option<LimitKind>,
}

impl ResultAccumulator {
    pub fn new(limits: ResultLimits) -> Self {
        Self {
            limits,
            payload: ResultPayload::default(),
            full: None,
        }
    }

    pub fn limits(&self) -> ResultLimits {
        self.limits
    }

    /// Limit that stopped accumulation, if any.
    pub fn full_reason(&self) -> Option<LimitKind> {
        self.full
    }

    pub fn is_full(&self) -> bool {
        self.full.is_some()
    }

    pub fn payload(&self) -> &ResultPayload {
        &self.payload
    }

    /// Append the rows of `chunk` while both limits hold.
    pub fn offer(&mut self, chunk: &Chunk, serializer: &dyn RowSerializer) -> Result<Offer> {
        if let Some(reason) = self.full {
            return Ok(Offer::Full(reason));
        }

        let mark = self.mark();
        let limits = self.limits;
        let payload = &mut self.payload;
        let mut exceeded = None;
        let written = serializer.write_rows(chunk, &mut |row: &[u8]| {
            if limits
                .max_rows
                .is_some_and(|max| payload.row_count() + 1 > max)
            {
                exceeded = Some(LimitKind::Rows);
                return false;
            }
            if payload.bytes + row.len() as u64 > limits.max_bytes {
                exceeded = Some(LimitKind::Bytes);
                return false;
            }
            payload.bytes += row.len() as u64;
            payload.rows.push(row.to_vec());
            true
        });

        match written {
            Ok(true) => Ok(Offer::Accepted),
            Ok(false) => {
                let reason = exceeded.ok_or_else(|| {
                    self.rollback(mark);
                    DqrError::Serialization(
                        "row serializer stopped without a capacity rejection".to_string(),
                    )
                })?;
                self.full = Some(reason);
                Ok(Offer::Full(reason))
            }
            Err(e) => {
                self.rollback(mark);
                Err(e)
            }
        }
    }

    pub fn mark(&self) -> PayloadMark {
        PayloadMark {
            rows: self.payload.rows.len(),
            bytes: self.payload.bytes,
        }
    }

    /// Drop rows appended after `mark`.
    pub fn rollback(&mut self, mark: PayloadMark) {
        self.payload.rows.truncate(mark.rows);
        self.payload.bytes = mark.bytes;
    }

    /// Take the payload, leaving an empty one behind.
    pub fn take_payload(&mut self) -> ResultPayload {
        std::mem::take(&mut self.payload)
    }
}
