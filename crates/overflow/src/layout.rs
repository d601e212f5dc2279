use serde::{Deserialize, Serialize};

pub fn overflow_dir(trace_id: &str) -> String {
    format!("overflow/{trace_id}")
}

pub fn overflow_data_path(trace_id: &str, writer_id: u64) -> String {
    format!("{}/overflow_{writer_id}.bin", overflow_dir(trace_id))
}

pub fn overflow_index_path(trace_id: &str, writer_id: u64) -> String {
    format!("{}/overflow_{writer_id}.index.json", overflow_dir(trace_id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowIndex {
    pub trace_id: String,
    pub writer_id: u64,
    /// Result schema descriptor as received in the overflow handshake.
    pub schema: String,
    pub file: String,
    pub chunks: u64,
    /// Total envelope bytes received, as acknowledged to the coordinator.
    pub bytes: u64,
}
