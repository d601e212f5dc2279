use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use dqr_common::{ContinueEnvelope, DqrError, Result};
use tracing::debug;

use crate::layout::{OverflowIndex, overflow_data_path, overflow_dir, overflow_index_path};
use crate::{DATA_MAGIC, DATA_VERSION};

pub struct OverflowWriter {
    root_dir: PathBuf,
    trace_id: String,
    writer_id: u64,
    schema: String,
    out: Option<BufWriter<File>>,
    bytes_received: u64,
    chunks: u64,
}

impl OverflowWriter {
    /// Create the data file for one sink and write its header.
    pub fn create(
        root_dir: impl Into<PathBuf>,
        trace_id: &str,
        writer_id: u64,
        schema: String,
    ) -> Result<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(root_dir.join(overflow_dir(trace_id)))?;

        let path = root_dir.join(overflow_data_path(trace_id, writer_id));
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(DATA_MAGIC)?;
        out.write_all(&DATA_VERSION.to_le_bytes())?;
        debug!(
            trace_id,
            writer_id,
            path = %path.display(),
            operator = "OverflowWriter",
            "overflow file created"
        );

        Ok(Self {
            root_dir,
            trace_id: trace_id.to_string(),
            writer_id,
            schema,
            out: Some(out),
            bytes_received: 0,
            chunks: 0,
        })
    }

    /// Append one envelope. Envelopes must arrive in `seq` order.
    pub fn append(&mut self, envelope: &ContinueEnvelope) -> Result<()> {
        if envelope.seq != self.chunks {
            return Err(DqrError::Sink(format!(
                "out-of-order overflow chunk: expected seq {}, got {}",
                self.chunks, envelope.seq
            )));
        }
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| DqrError::Sink("overflow writer already finished".to_string()))?;

        let mut buf = Vec::new();
        envelope.encode_into(&mut buf);
        out.write_all(&buf)?;

        self.bytes_received += envelope.encoded_len();
        self.chunks += 1;
        Ok(())
    }

    /// Running total of envelope bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn is_finished(&self) -> bool {
        self.out.is_none()
    }

    /// Flush the data file and publish its index.
    pub fn finish(&mut self) -> Result<OverflowIndex> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| DqrError::Sink("overflow writer already finished".to_string()))?;
        out.flush()?;
        out.get_ref().sync_all()?;

        let index = OverflowIndex {
            trace_id: self.trace_id.clone(),
            writer_id: self.writer_id,
            schema: self.schema.clone(),
            file: overflow_data_path(&self.trace_id, self.writer_id),
            chunks: self.chunks,
            bytes: self.bytes_received,
        };
        let json = serde_json::to_vec_pretty(&index)
            .map_err(|e| DqrError::Sink(format!("overflow index encode failed: {e}")))?;
        fs::write(
            self.root_dir
                .join(overflow_index_path(&self.trace_id, self.writer_id)),
            json,
        )?;
        debug!(
            trace_id = %self.trace_id,
            writer_id = self.writer_id,
            chunks = self.chunks,
            bytes = self.bytes_received,
            operator = "OverflowWriter",
            "overflow file finished"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use dqr_common::{Chunk, ContinueEnvelope};

    use crate::reader::OverflowReader;

    use super::OverflowWriter;

    fn temp_overflow_root() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("dqr_overflow_test_{nanos}"))
    }

    #[test]
    fn writes_chunks_and_index_then_reads_them_back_in_order() {
        let root = temp_overflow_root();
        let mut writer =
            OverflowWriter::create(&root, "q1", 3, "{\"columns\":[\"v\"]}".to_string())
                .expect("create");

        let chunks = vec![
            Chunk::from_rows(["r1", "r2"]),
            Chunk::from_rows(["r3"]),
            Chunk::from_rows(Vec::<&[u8]>::new()),
        ];
        let mut expected_bytes = 0;
        for (seq, chunk) in chunks.iter().enumerate() {
            let env = ContinueEnvelope {
                seq: seq as u64,
                chunk: chunk.clone(),
            };
            expected_bytes += env.encoded_len();
            writer.append(&env).expect("append");
        }
        assert_eq!(writer.bytes_received(), expected_bytes);

        let index = writer.finish().expect("finish");
        assert_eq!(index.chunks, 3);
        assert_eq!(index.bytes, expected_bytes);
        assert!(writer.is_finished());

        let reader = OverflowReader::new(&root);
        assert_eq!(reader.read_index("q1", 3).expect("index"), index);
        assert_eq!(reader.read_chunks("q1", 3).expect("chunks"), chunks);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn rejects_out_of_order_and_post_finish_appends() {
        let root = temp_overflow_root();
        let mut writer = OverflowWriter::create(&root, "q2", 1, String::new()).expect("create");
        let env = ContinueEnvelope {
            seq: 1,
            chunk: Chunk::from_rows(["x"]),
        };
        assert!(writer.append(&env).is_err());

        writer.finish().expect("finish");
        let env = ContinueEnvelope {
            seq: 0,
            chunk: Chunk::from_rows(["x"]),
        };
        assert!(writer.append(&env).is_err());
        assert!(writer.finish().is_err());

        let _ = std::fs::remove_dir_all(root);
    }
}
