//! File-backed storage for result chunks spilled past the in-memory payload
//! limits.
//!
//! The writer appends each received [`dqr_common::ContinueEnvelope`] to one
//! data file per sink and counts received envelope bytes, which is the
//! running total a sink reports back for credit accounting. On finish it
//! writes a JSON index next to the data file.

pub mod layout;
pub mod reader;
pub mod writer;

pub use layout::*;
pub use reader::OverflowReader;
pub use writer::OverflowWriter;

pub(crate) const DATA_MAGIC: &[u8; 4] = b"DQRO";
pub(crate) const DATA_VERSION: u32 = 1;
pub(crate) const DATA_HEADER_LEN: usize = 8;
