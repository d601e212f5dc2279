//! Execution-events actor and the file-backed overflow sink actor.
//!
//! The execution-events actor answers "start overflow" requests by creating an
//! [`OverflowWriter`] and spawning a sink actor around it. The sink actor
//! appends spilled chunks, reports the running byte total on request, writes
//! its index on finish, and acknowledges termination to the coordinator that
//! started it.

use std::path::{Path, PathBuf};

use dqr_common::{ActorId, ContinueEnvelope, Issue, IssueCode, TraceId};
use dqr_overflow::OverflowWriter;
use tracing::{debug, error, info, warn};

use crate::messages::{FailureNotice, Message, SinkStatus};
use crate::runtime::{ActorHandle, ActorRouter, Mailbox};

/// Spawn the actor that starts overflow sinks for `trace_id` under `root`.
pub fn spawn_execution_events(
    router: &ActorRouter,
    root: impl Into<PathBuf>,
    trace_id: TraceId,
) -> ActorHandle {
    let router = router.clone();
    let root = root.into();
    let (id, mut mailbox) = router.register();
    let join = tokio::spawn(async move {
        while let Some(envelope) = mailbox.recv().await {
            match envelope.message {
                Message::FullResultStart { schema } => {
                    let reply =
                        start_overflow_sink(&router, &root, &trace_id, envelope.sender, schema);
                    router.send(id, envelope.sender, Message::FullResultSync(reply));
                }
                Message::Poison => break,
                other => {
                    debug!(
                        trace_id = %trace_id,
                        sender = %envelope.sender,
                        kind = other.kind(),
                        "execution events: ignoring message"
                    );
                }
            }
        }
        router.deregister(id);
    });
    ActorHandle { id, join }
}

fn start_overflow_sink(
    router: &ActorRouter,
    root: &Path,
    trace_id: &TraceId,
    coordinator: ActorId,
    schema: String,
) -> Result<ActorId, String> {
    let (writer_id, mailbox) = router.register();
    match OverflowWriter::create(root, trace_id.as_str(), writer_id.0, schema) {
        Ok(writer) => {
            info!(
                trace_id = %trace_id,
                writer = %writer_id,
                coordinator = %coordinator,
                "overflow sink started"
            );
            spawn_overflow_sink(router, writer_id, mailbox, writer, coordinator);
            Ok(writer_id)
        }
        Err(e) => {
            router.deregister(writer_id);
            error!(trace_id = %trace_id, error = %e, "overflow sink start failed");
            Err(format!("failed to start overflow writer: {e}"))
        }
    }
}

struct OverflowSink {
    writer: OverflowWriter,
    // first storage failure; reported on every later status and finish
    failure: Option<String>,
}

impl OverflowSink {
    fn on_continue(&mut self, envelope: &ContinueEnvelope) {
        if self.failure.is_some() {
            return;
        }
        if let Err(e) = self.writer.append(envelope) {
            warn!(seq = envelope.seq, error = %e, "overflow append failed");
            self.failure = Some(e.to_string());
        }
    }

    fn status(&self) -> SinkStatus {
        SinkStatus {
            bytes_received: self.writer.bytes_received(),
            error_message: self.failure.clone(),
        }
    }

    fn on_finish(&mut self) -> FailureNotice {
        let failure = match self.failure.clone() {
            Some(message) => Some(message),
            None => match self.writer.finish() {
                Ok(index) => {
                    info!(
                        trace_id = %index.trace_id,
                        writer = index.writer_id,
                        chunks = index.chunks,
                        bytes = index.bytes,
                        "overflow sink finished"
                    );
                    None
                }
                Err(e) => Some(e.to_string()),
            },
        };
        FailureNotice {
            issues: failure
                .map(|message| vec![Issue::error(IssueCode::GatewayError, message)])
                .unwrap_or_default(),
            retriable: false,
            needs_fallback: false,
            counters: None,
        }
    }
}

/// Run one overflow sink until it is stopped.
pub fn spawn_overflow_sink(
    router: &ActorRouter,
    id: ActorId,
    mut mailbox: Mailbox,
    writer: OverflowWriter,
    coordinator: ActorId,
) -> ActorHandle {
    let router = router.clone();
    let join = tokio::spawn(async move {
        let mut sink = OverflowSink {
            writer,
            failure: None,
        };
        while let Some(envelope) = mailbox.recv().await {
            match envelope.message {
                Message::Continue(chunk) => sink.on_continue(&chunk),
                Message::StatusRequest => {
                    router.send(id, envelope.sender, Message::StatusResponse(sink.status()));
                }
                Message::Finish => {
                    let notice = sink.on_finish();
                    router.send(id, envelope.sender, Message::Failure(notice));
                }
                Message::Poison => break,
                other => {
                    debug!(writer = %id, kind = other.kind(), "overflow sink: ignoring message");
                }
            }
        }
        router.deregister(id);
        router.send(id, coordinator, Message::Gone);
        debug!(writer = %id, "overflow sink stopped");
    });
    ActorHandle { id, join }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
