use std::fs;
use std::path::PathBuf;

use dqr_common::{Chunk, ContinueEnvelope, DqrError, Result};

use crate::layout::{OverflowIndex, overflow_data_path, overflow_index_path};
use crate::{DATA_HEADER_LEN, DATA_MAGIC, DATA_VERSION};

pub struct OverflowReader {
    root_dir: PathBuf,
}

impl OverflowReader {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn read_index(&self, trace_id: &str, writer_id: u64) -> Result<OverflowIndex> {
        let bytes = fs::read(
            self.root_dir
                .join(overflow_index_path(trace_id, writer_id)),
        )?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DqrError::Execution(format!("overflow index decode failed: {e}")))
    }

    /// Read every spilled chunk in the order it was received.
    pub fn read_chunks(&self, trace_id: &str, writer_id: u64) -> Result<Vec<Chunk>> {
        let bytes = fs::read(self.root_dir.join(overflow_data_path(trace_id, writer_id)))?;
        decode_data_file(&bytes)
    }
}

fn decode_data_file(bytes: &[u8]) -> Result<Vec<Chunk>> {
    if bytes.len() < DATA_HEADER_LEN || &bytes[0..4] != DATA_MAGIC {
        return Err(DqrError::Execution(
            "invalid overflow data file magic".to_string(),
        ));
    }
    let mut version = [0_u8; 4];
    version.copy_from_slice(&bytes[4..8]);
    let version = u32::from_le_bytes(version);
    if version != DATA_VERSION {
        return Err(DqrError::Execution(format!(
            "unsupported overflow data file version {version}"
        )));
    }

    let mut chunks = Vec::new();
    let mut pos = DATA_HEADER_LEN;
    while pos < bytes.len() {
        let (env, used) = ContinueEnvelope::decode(&bytes[pos..])?;
        if env.seq != chunks.len() as u64 {
            return Err(DqrError::Execution(format!(
                "overflow data file out of order: expected seq {}, found {}",
                chunks.len(),
                env.seq
            )));
        }
        chunks.push(env.chunk);
        pos += used;
    }
    Ok(chunks)
}
