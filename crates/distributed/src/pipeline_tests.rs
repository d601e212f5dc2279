use super::*;
use crate::accumulator::{FramedRowSerializer, ResultSchema};
use crate::coordinator::{ResultCoordinator, ResultCoordinatorConfig};
use crate::messages::{FinalResponse, QueryResponse};
use crate::runtime::spawn_result_coordinator;
use dqr_common::{Chunk, ResultLimits};
use dqr_overflow::OverflowReader;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn unique_path(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}"))
}

fn row_chunk(fill: u8) -> Chunk {
    Chunk::from_rows([vec![fill; 40]])
}

struct Pipeline {
    router: ActorRouter,
    owner: ActorId,
    owner_mailbox: Mailbox,
    upstream: ActorId,
    coordinator: ActorHandle,
    events: ActorHandle,
}

fn start_pipeline(
    root: &Path,
    trace: &str,
    limits: ResultLimits,
    spill: bool,
    window: u64,
) -> Pipeline {
    let router = ActorRouter::new();
    let (owner, owner_mailbox) = router.register();
    let (upstream, _) = router.register();
    let events = spawn_execution_events(&router, root, TraceId::from(trace));
    let (id, mailbox) = router.register();
    let coordinator = ResultCoordinator::new(
        ResultCoordinatorConfig {
            trace_id: TraceId::from(trace),
            owner,
            execution_events: Some(events.id),
            discard: false,
            limits,
            full_result_write_enabled: spill,
            overflow_window_bytes: window,
        },
        Box::new(FramedRowSerializer::new(ResultSchema {
            result_type: "List<Struct<v:String>>".to_string(),
            columns: vec!["v".to_string()],
        })),
    );
    let coordinator = spawn_result_coordinator(&router, id, mailbox, coordinator);
    Pipeline {
        router,
        owner,
        owner_mailbox,
        upstream,
        coordinator,
        events,
    }
}

impl Pipeline {
    fn send_chunks(&self, fills: &[u8]) {
        for fill in fills {
            self.router.send(
                self.upstream,
                self.coordinator.id,
                Message::Data(row_chunk(*fill)),
            );
        }
        self.router
            .send(self.upstream, self.coordinator.id, Message::DataEnd);
    }

    /// Play the owner: answer the first completion or failure with the
    /// upstream completion signal and wait for the final response.
    async fn await_final(mut self) -> (Vec<FailureNotice>, FinalResponse) {
        let mut failures = Vec::new();
        let mut completion_sent = false;
        let response = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let envelope = self.owner_mailbox.recv().await.expect("owner mailbox");
                match envelope.message {
                    Message::FinalResponse(response) => break response,
                    Message::Failure(notice) => failures.push(notice),
                    Message::GraphFinished => {}
                    other => panic!("unexpected owner message {other:?}"),
                }
                if !completion_sent {
                    self.router.send(
                        self.owner,
                        self.coordinator.id,
                        Message::QueryResponse(QueryResponse::default()),
                    );
                    completion_sent = true;
                }
            }
        })
        .await
        .expect("final response in time");

        self.router
            .send(self.owner, self.events.id, Message::Poison);
        self.coordinator.join.await.expect("coordinator task");
        self.events.join.await.expect("events task");
        (failures, response)
    }
}

#[tokio::test]
async fn spilled_rows_reach_overflow_file_in_order() {
    let root = unique_path("dqr_spill");
    // 57-byte envelopes against a 60-byte window force credit refreshes
    let pipeline = start_pipeline(
        &root,
        "q-spill",
        ResultLimits {
            max_bytes: 100,
            max_rows: None,
        },
        true,
        60,
    );
    pipeline.send_chunks(b"abcde");
    let (failures, response) = pipeline.await_final().await;

    assert!(failures.is_empty(), "unexpected failures: {failures:?}");
    assert!(!response.truncated);
    assert_eq!(response.rows, vec![vec![b'a'; 40], vec![b'b'; 40]]);
    assert!(response.counters.overflow_status_requests >= 1);
    let writer = response.overflow_writer.expect("overflow writer");

    let reader = OverflowReader::new(&root);
    let chunks = reader.read_chunks("q-spill", writer.0).expect("read chunks");
    let rows: Vec<Vec<u8>> = chunks
        .iter()
        .map(|c| c.rows().next().expect("row").expect("frame").to_vec())
        .collect();
    assert_eq!(rows, vec![vec![b'c'; 40], vec![b'd'; 40], vec![b'e'; 40]]);

    let index = reader.read_index("q-spill", writer.0).expect("index");
    assert_eq!(index.chunks, 3);
    assert_eq!(index.bytes, 3 * 57);
    assert_eq!(index.bytes, response.counters.overflow_bytes_sent);
    assert!(index.schema.contains("\"columns\":[\"v\"]"));

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn truncation_needs_no_overflow_storage() {
    let root = unique_path("dqr_trunc");
    let pipeline = start_pipeline(
        &root,
        "q-trunc",
        ResultLimits {
            max_bytes: 100,
            max_rows: None,
        },
        false,
        1024,
    );
    pipeline.send_chunks(b"abc");
    let (failures, response) = pipeline.await_final().await;

    assert!(failures.is_empty());
    assert!(response.truncated);
    assert_eq!(response.rows.len(), 2);
    assert_eq!(response.overflow_writer, None);
    assert!(!root.exists());
}

#[tokio::test]
async fn unusable_overflow_root_reports_fallback_failure() {
    let root = unique_path("dqr_blocked");
    std::fs::write(&root, b"not a directory").expect("write blocker");
    let pipeline = start_pipeline(
        &root,
        "q-blocked",
        ResultLimits {
            max_bytes: 50,
            max_rows: None,
        },
        true,
        1024,
    );
    pipeline.send_chunks(b"abc");
    let (failures, response) = pipeline.await_final().await;

    assert_eq!(failures.len(), 1);
    assert!(failures[0].needs_fallback);
    assert!(failures[0].issues[0].message.contains("failed to start overflow writer"));
    assert!(response.truncated);
    assert_eq!(response.rows, vec![vec![b'a'; 40]]);

    let _ = std::fs::remove_file(&root);
}
