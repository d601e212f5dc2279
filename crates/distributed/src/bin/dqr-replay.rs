use std::env;

use dqr_common::{Chunk, Issue, ResultConfig, TraceId};
use dqr_distributed::{
    ActorRouter, FramedRowSerializer, Message, QueryResponse, ResultCoordinator,
    ResultCoordinatorConfig, ResultCounters, ResultSchema, spawn_execution_events,
    spawn_result_coordinator,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[derive(Serialize)]
struct ReplaySummary {
    trace_id: String,
    rows: usize,
    truncated: bool,
    issues: Vec<Issue>,
    overflow_writer: Option<u64>,
    overflow_root: String,
    counters: ResultCounters,
}

fn synthetic_chunk(index: u64, rows: u64, row_bytes: u64) -> Chunk {
    Chunk::from_rows((0..rows).map(|r| {
        let mut row = format!("{index}:{r}:").into_bytes();
        row.resize(row_bytes.max(row.len() as u64) as usize, b'.');
        row
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ResultConfig::from_env()?;
    config.validate()?;
    let trace_id = TraceId(env_or_default("DQR_TRACE_ID", "replay-1"));
    let chunks = env_u64_or_default("DQR_REPLAY_CHUNKS", 64);
    let rows_per_chunk = env_u64_or_default("DQR_REPLAY_ROWS_PER_CHUNK", 128);
    let row_bytes = env_u64_or_default("DQR_REPLAY_ROW_BYTES", 64);

    let router = ActorRouter::new();
    let (owner, mut owner_mailbox) = router.register();
    let (upstream, _upstream_mailbox) = router.register();
    let events = spawn_execution_events(&router, config.overflow_root.clone(), trace_id.clone());

    let (coordinator_id, mailbox) = router.register();
    let serializer = FramedRowSerializer::new(ResultSchema {
        result_type: "List<Struct<payload:String>>".to_string(),
        columns: vec!["payload".to_string()],
    });
    let coordinator = ResultCoordinator::new(
        ResultCoordinatorConfig::from_result_config(
            trace_id.clone(),
            owner,
            Some(events.id),
            false,
            &config,
        ),
        Box::new(serializer),
    );
    let coordinator = spawn_result_coordinator(&router, coordinator_id, mailbox, coordinator);

    info!(
        trace_id = %trace_id,
        chunks,
        rows_per_chunk,
        row_bytes,
        spill = config.enable_full_result_write,
        "replay started"
    );
    for index in 0..chunks {
        let chunk = synthetic_chunk(index, rows_per_chunk, row_bytes);
        router.send(upstream, coordinator_id, Message::Data(chunk));
    }
    router.send(upstream, coordinator_id, Message::DataEnd);

    let mut completion_sent = false;
    let response = loop {
        let Some(envelope) = owner_mailbox.recv().await else {
            return Err("owner mailbox closed before the final response".into());
        };
        match envelope.message {
            Message::GraphFinished | Message::Failure(_) if completion_sent => {}
            Message::GraphFinished => {
                router.send(
                    owner,
                    coordinator_id,
                    Message::QueryResponse(QueryResponse::default()),
                );
                completion_sent = true;
            }
            Message::Failure(notice) => {
                for issue in &notice.issues {
                    warn!(trace_id = %trace_id, "{issue}");
                }
                router.send(
                    owner,
                    coordinator_id,
                    Message::QueryResponse(QueryResponse::default()),
                );
                completion_sent = true;
            }
            Message::FinalResponse(response) => break response,
            other => warn!(kind = other.kind(), "owner: unexpected message"),
        }
    };

    router.send(owner, events.id, Message::Poison);
    coordinator.join.await?;
    events.join.await?;

    let summary = ReplaySummary {
        trace_id: trace_id.to_string(),
        rows: response.rows.len(),
        truncated: response.truncated,
        issues: response.issues,
        overflow_writer: response.overflow_writer.map(|w| w.0),
        overflow_root: config.overflow_root.display().to_string(),
        counters: response.counters,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
