//! Result coordinator state machine.
//!
//! Responsibilities:
//! - route incoming chunks to the in-memory payload or to the overflow sink;
//! - pick truncation or spilling at the first limit violation and keep it;
//! - report mid-stream faults to the owner as failure notices;
//! - on the upstream completion signal, stop the sink, wait for every
//!   dependent to terminate and emit exactly one final response.
//!
//! Lifecycle: `Running -> ShuttingDown -> Finished`. All state is mutated
//! from [`ResultCoordinator::handle`], one message at a time; nothing blocks.

use std::sync::Arc;

use dqr_common::metrics::global_metrics;
use dqr_common::{
    ActorId, Chunk, DqrError, FailureInjector, Issue, IssueCode, IssueLog, ResultConfig,
    ResultLimits, TraceId, global_failure_injector,
};
use tracing::{debug, error, info, warn};

use crate::accumulator::{LimitKind, Offer, ResultAccumulator, RowSerializer};
use crate::barrier::ShutdownBarrier;
use crate::messages::{
    FailureNotice, FinalResponse, Message, Outbox, QueryResponse, ResultCounters, SinkStatus,
    Undelivered,
};
use crate::spiller::{FinishRoute, OverflowSpiller, SpillState};

/// Fault point reached before each chunk is converted into rows.
pub const FAIL_ON_RESPONSE_WRITE: &str = "result_coordinator_fail_on_response_write";

#[derive(Debug, Clone)]
/// Per-query coordinator configuration.
pub struct ResultCoordinatorConfig {
    pub trace_id: TraceId,
    /// Receives failure notices, `GraphFinished` and the final response.
    pub owner: ActorId,
    /// Channel that starts overflow sinks and answers their handshake.
    pub execution_events: Option<ActorId>,
    /// Drop every chunk; only completion and shutdown run.
    pub discard: bool,
    pub limits: ResultLimits,
    /// Spill to an overflow sink instead of truncating.
    pub full_result_write_enabled: bool,
    /// Unacknowledged bytes allowed in flight to the sink.
    pub overflow_window_bytes: u64,
}

impl ResultCoordinatorConfig {
    pub fn from_result_config(
        trace_id: TraceId,
        owner: ActorId,
        execution_events: Option<ActorId>,
        discard: bool,
        config: &ResultConfig,
    ) -> Self {
        Self {
            trace_id,
            owner,
            execution_events,
            discard,
            limits: config.limits(),
            full_result_write_enabled: config.enable_full_result_write,
            overflow_window_bytes: config.overflow_window_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    ShuttingDown,
    Finished,
}

pub struct ResultCoordinator {
    config: ResultCoordinatorConfig,
    serializer: Box<dyn RowSerializer>,
    failures: Arc<FailureInjector>,
    state: CoordinatorState,
    accumulator: ResultAccumulator,
    spiller: OverflowSpiller,
    barrier: ShutdownBarrier,
    issues: IssueLog,
    truncated: bool,
    // set after a conversion failure; later chunks are dropped
    halted: bool,
    finish_called: bool,
    graph_finished_sent: bool,
    finalized: bool,
    overflow_writer: Option<ActorId>,
    chunks_received: u64,
    dropped_chunks: u64,
    failure_reports: u64,
}

impl ResultCoordinator {
    pub fn new(config: ResultCoordinatorConfig, serializer: Box<dyn RowSerializer>) -> Self {
        let spiller = OverflowSpiller::new(
            config.trace_id.as_str(),
            config.overflow_window_bytes,
        );
        Self {
            accumulator: ResultAccumulator::new(config.limits),
            spiller,
            config,
            serializer,
            failures: global_failure_injector(),
            state: CoordinatorState::Running,
            barrier: ShutdownBarrier::new(),
            issues: IssueLog::new(),
            truncated: false,
            halted: false,
            finish_called: false,
            graph_finished_sent: false,
            finalized: false,
            overflow_writer: None,
            chunks_received: 0,
            dropped_chunks: 0,
            failure_reports: 0,
        }
    }

    /// Use `failures` instead of the process-wide injector.
    pub fn with_failure_injector(mut self, failures: Arc<FailureInjector>) -> Self {
        self.failures = failures;
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == CoordinatorState::Finished
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn issues(&self) -> &IssueLog {
        &self.issues
    }

    /// Dependents that still have to acknowledge termination.
    pub fn pending_dependents(&self) -> usize {
        self.barrier.len()
    }

    pub fn counters(&self) -> ResultCounters {
        let credit = self.spiller.credit();
        ResultCounters {
            chunks_received: self.chunks_received,
            payload_rows: self.accumulator.payload().row_count(),
            payload_bytes: self.accumulator.payload().bytes(),
            overflow_chunks: self.spiller.sent_chunks(),
            overflow_bytes_sent: credit.sent_bytes(),
            overflow_bytes_acked: credit.acked_bytes(),
            overflow_status_requests: self.spiller.status_requests(),
            dropped_chunks: self.dropped_chunks + self.spiller.dropped_chunks(),
            failures: self.failure_reports,
        }
    }

    /// Process one inbound message from `sender`.
    pub fn handle(&mut self, sender: ActorId, message: Message, out: &mut dyn Outbox) {
        match self.state {
            CoordinatorState::Running => self.handle_running(sender, message, out),
            CoordinatorState::ShuttingDown => self.handle_shutting_down(sender, message, out),
            CoordinatorState::Finished => {
                if let Message::Data(_) = message {
                    panic!(
                        "result coordinator for {} received a chunk after its final response",
                        self.config.trace_id
                    );
                }
                debug!(
                    trace_id = %self.config.trace_id,
                    sender = %sender,
                    kind = message.kind(),
                    "ignoring message after final response"
                );
            }
        }
    }

    fn handle_running(&mut self, sender: ActorId, message: Message, out: &mut dyn Outbox) {
        match message {
            Message::Data(chunk) => self.on_chunk(chunk, out),
            Message::DataEnd => {
                if self.finish_called {
                    debug!(trace_id = %self.config.trace_id, "data end after finish, ignored");
                } else {
                    self.finish(out);
                }
            }
            Message::QueryResponse(response) => self.on_query_response(response, out),
            Message::FullResultSync(reply) => self.on_handshake(reply, out),
            Message::StatusResponse(status) => self.on_sink_status(status, out),
            Message::Failure(notice) => self.on_sink_reply(sender, notice, out),
            Message::Gone => self.on_gone_while_running(sender, out),
            Message::Undelivered(undelivered) => self.on_undelivered(undelivered, out),
            Message::Poison => {
                debug!(
                    trace_id = %self.config.trace_id,
                    "stop request ignored; the coordinator exits after its final response"
                );
            }
            other => {
                warn!(
                    trace_id = %self.config.trace_id,
                    sender = %sender,
                    kind = other.kind(),
                    operator = "ResultCoordinator",
                    "unexpected message while running"
                );
            }
        }
    }

    fn handle_shutting_down(&mut self, sender: ActorId, message: Message, out: &mut dyn Outbox) {
        match message {
            Message::Gone => {
                if self.barrier.ack(sender) {
                    info!(
                        trace_id = %self.config.trace_id,
                        dependent = %sender,
                        remaining = self.barrier.len(),
                        "dependent terminated"
                    );
                }
            }
            Message::FullResultSync(Ok(writer)) => {
                // handshake finished after shutdown began; stop the new sink
                self.barrier.spawned(writer);
                self.overflow_writer = Some(writer);
                out.send(writer, Message::Poison);
            }
            Message::FullResultSync(Err(message)) => {
                self.barrier.spawn_failed();
                self.absorb_error(IssueCode::GatewayNeedFallbackError, message);
            }
            Message::Failure(notice) => {
                if !notice.issues.is_empty() && Some(sender) == self.overflow_writer {
                    self.spiller.on_sink_failure();
                }
                self.issues.extend(notice.issues);
            }
            Message::StatusResponse(SinkStatus {
                error_message: Some(message),
                ..
            }) => {
                self.spiller.on_sink_failure();
                self.absorb_error(IssueCode::GatewayError, message);
            }
            Message::Undelivered(undelivered) => {
                // a dependent that cannot receive the stop signal is gone already
                if undelivered.message_kind == "Poison" {
                    self.barrier.ack(undelivered.from);
                } else if Some(undelivered.from) == self.overflow_writer {
                    self.spiller.on_undeliverable(undelivered.message_kind);
                }
                self.absorb_error(IssueCode::GatewayNeedFallbackError, undelivered.describe());
            }
            other => {
                debug!(
                    trace_id = %self.config.trace_id,
                    sender = %sender,
                    kind = other.kind(),
                    "ignoring message while shutting down"
                );
            }
        }
        self.try_finalize(out);
    }

    fn on_chunk(&mut self, chunk: Chunk, out: &mut dyn Outbox) {
        self.chunks_received += 1;
        global_metrics().inc_chunks_in(self.config.trace_id.as_str());

        if self.config.discard {
            return;
        }
        if self.halted {
            debug!(trace_id = %self.config.trace_id, "dropping chunk after conversion failure");
            self.dropped_chunks += 1;
            return;
        }
        if self.spiller.is_active() {
            self.spiller.push(chunk, out);
            return;
        }
        if self.accumulator.is_full() {
            self.dropped_chunks += 1;
            return;
        }

        if let Err(e) = self.failures.reach(FAIL_ON_RESPONSE_WRITE) {
            self.halted = true;
            self.dropped_chunks += 1;
            self.report_error(e, false, true, out);
            return;
        }

        let mark = self.accumulator.mark();
        match self.accumulator.offer(&chunk, self.serializer.as_ref()) {
            Ok(Offer::Accepted) => self.record_payload_growth(mark.rows(), mark.bytes()),
            Ok(Offer::Full(reason)) => {
                if self.config.full_result_write_enabled {
                    // relocate the triggering chunk whole
                    self.accumulator.rollback(mark);
                    self.start_spill(chunk, out);
                } else {
                    self.record_payload_growth(mark.rows(), mark.bytes());
                    self.truncate(reason, out);
                }
            }
            Err(e) => {
                self.halted = true;
                self.dropped_chunks += 1;
                self.report_error(e, false, true, out);
            }
        }
    }

    fn record_payload_growth(&self, rows_before: u64, bytes_before: u64) {
        let payload = self.accumulator.payload();
        global_metrics().record_payload_rows(
            self.config.trace_id.as_str(),
            payload.row_count() - rows_before,
            payload.bytes() - bytes_before,
        );
    }

    fn truncate(&mut self, reason: LimitKind, out: &mut dyn Outbox) {
        let limits = self.accumulator.limits();
        let (label, message) = match reason {
            LimitKind::Rows => (
                "rows",
                format!("Rows limit reached: {}", limits.max_rows.unwrap_or_default()),
            ),
            LimitKind::Bytes => (
                "bytes",
                format!("Size limit reached: {} bytes", limits.max_bytes),
            ),
        };
        warn!(
            trace_id = %self.config.trace_id,
            operator = "ResultCoordinator",
            rows = self.accumulator.payload().row_count(),
            "{message}"
        );
        self.truncated = true;
        self.issues.push(Issue::warning(message));
        global_metrics().inc_truncations(self.config.trace_id.as_str(), label);
        self.finish(out);
    }

    fn start_spill(&mut self, chunk: Chunk, out: &mut dyn Outbox) {
        let schema = match self.serializer.schema().to_descriptor() {
            Ok(schema) => schema,
            Err(e) => {
                self.halted = true;
                self.dropped_chunks += 1;
                self.report_error(e, false, true, out);
                return;
            }
        };
        match self
            .spiller
            .activate(self.config.execution_events, schema, chunk, out)
        {
            Ok(()) => self.barrier.expect_spawn(),
            Err(e) => self.report_error(e, false, true, out),
        }
    }

    fn on_handshake(&mut self, reply: Result<ActorId, String>, out: &mut dyn Outbox) {
        if self.spiller.state() != SpillState::AwaitingHandshake {
            warn!(
                trace_id = %self.config.trace_id,
                state = ?self.spiller.state(),
                "overflow handshake without a pending request"
            );
            return;
        }
        match self.spiller.on_handshake(reply, out) {
            Ok(writer) => {
                self.barrier.spawned(writer);
                self.overflow_writer = Some(writer);
            }
            Err(e) => {
                self.barrier.spawn_failed();
                self.report_error(e, false, true, out);
            }
        }
    }

    fn on_sink_status(&mut self, status: SinkStatus, out: &mut dyn Outbox) {
        if let Err(e) = self.spiller.on_status(status, out) {
            self.report_error(e, false, false, out);
        }
    }

    /// Reply of the sink to `Finish`, or an error it reports on its own.
    fn on_sink_reply(&mut self, sender: ActorId, notice: FailureNotice, out: &mut dyn Outbox) {
        if Some(sender) != self.overflow_writer {
            warn!(
                trace_id = %self.config.trace_id,
                sender = %sender,
                "failure notice from unknown sender"
            );
        }
        if notice.issues.is_empty() {
            if self.finish_called && !self.graph_finished_sent {
                self.send_graph_finished(out);
            }
            return;
        }
        error!(
            trace_id = %self.config.trace_id,
            sender = %sender,
            issues = notice.issues.len(),
            "overflow sink reported failure"
        );
        if Some(sender) == self.overflow_writer {
            self.spiller.on_sink_failure();
        }
        self.issues.extend(notice.issues.iter().cloned());
        self.failure_reports += 1;
        out.send(self.config.owner, Message::Failure(notice));
    }

    fn on_gone_while_running(&mut self, sender: ActorId, out: &mut dyn Outbox) {
        self.barrier.ack(sender);
        if self.spiller.writer() != Some(sender) {
            debug!(trace_id = %self.config.trace_id, sender = %sender, "termination ack");
            return;
        }
        // a failed sink was reported when it failed
        let already_failed = self.spiller.sink_failed();
        let lost = self.spiller.on_sink_gone();
        if !already_failed && (!self.graph_finished_sent || lost > 0) {
            self.report_error(
                DqrError::Sink(format!(
                    "overflow writer {sender} terminated before the full result was written"
                )),
                false,
                true,
                out,
            );
        }
    }

    fn on_undelivered(&mut self, undelivered: Undelivered, out: &mut dyn Outbox) {
        let message = undelivered.describe();
        warn!(trace_id = %self.config.trace_id, "{message}");
        if self.spiller.writer() == Some(undelivered.from) {
            self.spiller.on_undeliverable(undelivered.message_kind);
        }
        self.report_error(DqrError::Delivery(message), true, true, out);
    }

    fn on_query_response(&mut self, response: QueryResponse, out: &mut dyn Outbox) {
        self.issues.extend(response.issues);
        if let Some(writer) = self.spiller.stop(out) {
            self.barrier.add(writer);
        }
        self.state = CoordinatorState::ShuttingDown;
        info!(
            trace_id = %self.config.trace_id,
            operator = "ResultCoordinator",
            dependents = self.barrier.len(),
            "shutting down"
        );
        self.try_finalize(out);
    }

    /// Mark the data stream complete. Runs at most once.
    fn finish(&mut self, out: &mut dyn Outbox) {
        assert!(
            !self.finish_called,
            "result coordinator for {} finished twice",
            self.config.trace_id
        );
        self.finish_called = true;
        match self.spiller.request_finish(out) {
            FinishRoute::ViaSink => {
                debug!(trace_id = %self.config.trace_id, "finish routed through overflow sink");
            }
            FinishRoute::NoSink => self.send_graph_finished(out),
        }
    }

    fn send_graph_finished(&mut self, out: &mut dyn Outbox) {
        self.graph_finished_sent = true;
        out.send(self.config.owner, Message::GraphFinished);
    }

    /// Record a fault and tell the owner about it while still running.
    fn report_error(
        &mut self,
        err: DqrError,
        retriable: bool,
        needs_fallback: bool,
        out: &mut dyn Outbox,
    ) {
        let code = if needs_fallback {
            IssueCode::GatewayNeedFallbackError
        } else {
            IssueCode::GatewayError
        };
        error!(
            trace_id = %self.config.trace_id,
            operator = "ResultCoordinator",
            retriable,
            needs_fallback,
            error = %err,
            "result coordinator error"
        );
        let issue = Issue::error(code, err.to_string());
        self.issues.push(issue.clone());
        self.failure_reports += 1;
        global_metrics().inc_failures(self.config.trace_id.as_str(), &code.as_u32().to_string());
        if self.state != CoordinatorState::Running {
            return;
        }
        let notice = FailureNotice {
            issues: vec![issue],
            retriable,
            needs_fallback,
            counters: Some(self.counters()),
        };
        out.send(self.config.owner, Message::Failure(notice));
    }

    fn absorb_error(&mut self, code: IssueCode, message: String) {
        warn!(
            trace_id = %self.config.trace_id,
            "error during shutdown: {message}"
        );
        self.issues.push(Issue::error(code, message));
        self.failure_reports += 1;
        global_metrics().inc_failures(self.config.trace_id.as_str(), &code.as_u32().to_string());
    }

    fn try_finalize(&mut self, out: &mut dyn Outbox) {
        if self.state != CoordinatorState::ShuttingDown {
            return;
        }
        if !self.barrier.is_empty() {
            debug!(
                trace_id = %self.config.trace_id,
                pending = self.barrier.len(),
                "waiting for dependents"
            );
            return;
        }
        self.finalize(out);
    }

    fn finalize(&mut self, out: &mut dyn Outbox) {
        assert!(
            !self.finalized,
            "result coordinator for {} finalized twice",
            self.config.trace_id
        );
        self.finalized = true;

        if self.spiller.lost_data() {
            self.truncated = true;
        }
        let counters = self.counters();
        let response = FinalResponse {
            rows: self.accumulator.take_payload().into_rows(),
            issues: std::mem::take(&mut self.issues).into_vec(),
            truncated: self.truncated,
            overflow_writer: self.overflow_writer,
            counters,
        };
        info!(
            trace_id = %self.config.trace_id,
            operator = "ResultCoordinator",
            rows = response.rows.len(),
            issues = response.issues.len(),
            truncated = response.truncated,
            "sending final response"
        );
        out.send(self.config.owner, Message::FinalResponse(response));
        global_metrics().inc_final_responses(self.config.trace_id.as_str());
        self.state = CoordinatorState::Finished;
    }
}
