//! Credit-gated streaming of overflow chunks to an external sink.
//!
//! Lifecycle: `Inactive -> AwaitingHandshake -> Streaming -> Closed`, with
//! `Failed` reachable from the handshake and `SinkFailed` from a streaming
//! sink that reported an error or became unreachable. Activation happens at
//! most once.
//!
//! Chunks are queued in arrival order and leave the queue only while the
//! credit window allows. When credit runs out a single status request is
//! issued; its reply re-enters [`OverflowSpiller::drain`] from the top, so
//! the send loop resumes without recursion.

use std::collections::VecDeque;

use dqr_common::metrics::global_metrics;
use dqr_common::{ActorId, Chunk, ContinueEnvelope, DqrError, Result};
use tracing::{debug, info, warn};

use crate::credit::CreditTracker;
use crate::messages::{Message, Outbox, SinkStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillState {
    Inactive,
    AwaitingHandshake,
    Streaming(ActorId),
    /// The sink exists but lost data; it still has to be stopped.
    SinkFailed(ActorId),
    Failed,
    Closed,
}

/// How a finish request reaches the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishRoute {
    /// The sink answers once it has everything; its reply completes finish.
    ViaSink,
    /// No usable sink; the caller completes finish itself.
    NoSink,
}

#[derive(Debug)]
pub struct OverflowSpiller {
    trace_id: String,
    state: SpillState,
    backlog: VecDeque<Chunk>,
    credit: CreditTracker,
    next_seq: u64,
    status_pending: bool,
    status_requests: u64,
    finish_requested: bool,
    finish_sent: bool,
    dropped_chunks: u64,
    sink_failed: bool,
}

impl OverflowSpiller {
    pub fn new(trace_id: impl Into<String>, window_bytes: u64) -> Self {
        Self {
            trace_id: trace_id.into(),
            state: SpillState::Inactive,
            backlog: VecDeque::new(),
            credit: CreditTracker::new(window_bytes),
            next_seq: 0,
            status_pending: false,
            status_requests: 0,
            finish_requested: false,
            finish_sent: false,
            dropped_chunks: 0,
            sink_failed: false,
        }
    }

    pub fn state(&self) -> SpillState {
        self.state
    }

    /// Whether spilling was ever activated.
    pub fn is_active(&self) -> bool {
        self.state != SpillState::Inactive
    }

    pub fn writer(&self) -> Option<ActorId> {
        match self.state {
            SpillState::Streaming(w) | SpillState::SinkFailed(w) => Some(w),
            _ => None,
        }
    }

    pub fn credit(&self) -> &CreditTracker {
        &self.credit
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn sent_chunks(&self) -> u64 {
        self.next_seq
    }

    pub fn status_requests(&self) -> u64 {
        self.status_requests
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }

    pub fn finish_requested(&self) -> bool {
        self.finish_requested
    }

    /// Whether any spilled chunk never reached the sink or was not stored.
    pub fn lost_data(&self) -> bool {
        self.sink_failed || self.dropped_chunks > 0 || !self.backlog.is_empty()
    }

    pub fn sink_failed(&self) -> bool {
        self.sink_failed
    }

    /// Start spilling with `first` as the head of the overflow stream.
    ///
    /// Emits the "start overflow" event to `execution_events` and waits for
    /// the handshake reply.
    pub fn activate(
        &mut self,
        execution_events: Option<ActorId>,
        schema: String,
        first: Chunk,
        out: &mut dyn Outbox,
    ) -> Result<()> {
        assert_eq!(
            self.state,
            SpillState::Inactive,
            "overflow spiller activated twice"
        );
        self.backlog.push_back(first);

        let Some(events) = execution_events else {
            self.fail();
            return Err(DqrError::Sink(
                "no execution-event sink configured to start an overflow writer".to_string(),
            ));
        };
        info!(
            trace_id = %self.trace_id,
            operator = "OverflowSpiller",
            "full result overflow starting"
        );
        out.send(events, Message::FullResultStart { schema });
        self.state = SpillState::AwaitingHandshake;
        Ok(())
    }

    /// Apply the handshake reply; on success start draining the backlog.
    pub fn on_handshake(
        &mut self,
        reply: std::result::Result<ActorId, String>,
        out: &mut dyn Outbox,
    ) -> Result<ActorId> {
        if self.state != SpillState::AwaitingHandshake {
            return Err(DqrError::Sink(format!(
                "unexpected overflow handshake in state {:?}",
                self.state
            )));
        }
        match reply {
            Ok(writer) => {
                info!(
                    trace_id = %self.trace_id,
                    writer = %writer,
                    backlog = self.backlog.len(),
                    operator = "OverflowSpiller",
                    "overflow writer started"
                );
                self.state = SpillState::Streaming(writer);
                self.drain(out);
                Ok(writer)
            }
            Err(message) => {
                self.fail();
                Err(DqrError::Sink(message))
            }
        }
    }

    /// Queue `chunk` behind everything already spilled.
    pub fn push(&mut self, chunk: Chunk, out: &mut dyn Outbox) {
        match self.state {
            SpillState::AwaitingHandshake => self.backlog.push_back(chunk),
            SpillState::Streaming(_) => {
                self.backlog.push_back(chunk);
                self.drain(out);
            }
            SpillState::SinkFailed(_) | SpillState::Failed | SpillState::Closed => {
                debug!(
                    trace_id = %self.trace_id,
                    state = ?self.state,
                    "dropping chunk, overflow sink unavailable"
                );
                self.dropped_chunks += 1;
            }
            SpillState::Inactive => panic!("chunk routed to an inactive overflow spiller"),
        }
    }

    /// Send queued chunks while credit allows.
    pub fn drain(&mut self, out: &mut dyn Outbox) {
        let SpillState::Streaming(writer) = self.state else {
            return;
        };
        while self.credit.can_send() {
            let Some(chunk) = self.backlog.pop_front() else {
                break;
            };
            let envelope = ContinueEnvelope {
                seq: self.next_seq,
                chunk,
            };
            let bytes = envelope.encoded_len();
            out.send(writer, Message::Continue(envelope));
            self.next_seq += 1;
            self.credit.record_send(bytes);
            global_metrics().record_overflow_send(&self.trace_id, bytes, self.credit.in_flight());
        }

        if self.backlog.is_empty() {
            if self.finish_requested && !self.finish_sent {
                debug!(trace_id = %self.trace_id, writer = %writer, "sending finish to overflow writer");
                out.send(writer, Message::Finish);
                self.finish_sent = true;
            }
            return;
        }

        // sink is overloaded; resume from the status reply
        self.request_status(writer, out);
    }

    fn request_status(&mut self, writer: ActorId, out: &mut dyn Outbox) {
        if self.status_pending {
            return;
        }
        debug!(
            trace_id = %self.trace_id,
            sent_kb = self.credit.sent_bytes() as f64 / 1024.0,
            acked_kb = self.credit.acked_bytes() as f64 / 1024.0,
            diff_kb = self.credit.in_flight() as f64 / 1024.0,
            "overflow status refresh: before"
        );
        out.send(writer, Message::StatusRequest);
        self.status_pending = true;
        self.status_requests += 1;
        global_metrics().inc_overflow_status_requests(&self.trace_id);
    }

    /// Apply a status reply and resume draining.
    ///
    /// A sink-reported error is returned and draining is not resumed.
    pub fn on_status(&mut self, status: SinkStatus, out: &mut dyn Outbox) -> Result<()> {
        if !self.status_pending {
            warn!(trace_id = %self.trace_id, "unsolicited overflow status reply");
        }
        self.status_pending = false;
        self.credit.record_ack(status.bytes_received);
        global_metrics().set_overflow_inflight(&self.trace_id, self.credit.in_flight());
        debug!(
            trace_id = %self.trace_id,
            sent_kb = self.credit.sent_bytes() as f64 / 1024.0,
            acked_kb = self.credit.acked_bytes() as f64 / 1024.0,
            diff_kb = self.credit.in_flight() as f64 / 1024.0,
            "overflow status refresh: after"
        );
        if let Some(message) = status.error_message {
            self.on_sink_failure();
            return Err(DqrError::Sink(message));
        }
        self.drain(out);
        Ok(())
    }

    /// Ask the sink to finish once everything queued has been sent.
    pub fn request_finish(&mut self, out: &mut dyn Outbox) -> FinishRoute {
        match self.state {
            SpillState::Streaming(_) => {
                self.finish_requested = true;
                self.drain(out);
                FinishRoute::ViaSink
            }
            SpillState::AwaitingHandshake => {
                self.finish_requested = true;
                FinishRoute::ViaSink
            }
            SpillState::Inactive
            | SpillState::SinkFailed(_)
            | SpillState::Failed
            | SpillState::Closed => FinishRoute::NoSink,
        }
    }

    /// The sink reported that it could not store spilled data.
    ///
    /// Queued chunks are dropped and later chunks are not sent.
    pub fn on_sink_failure(&mut self) {
        self.sink_failed = true;
        self.dropped_chunks += self.backlog.len() as u64;
        self.backlog.clear();
        self.status_pending = false;
        if let SpillState::Streaming(writer) = self.state {
            warn!(trace_id = %self.trace_id, writer = %writer, "overflow sink failed");
            self.state = SpillState::SinkFailed(writer);
        }
    }

    /// A message to the sink could not be delivered. An envelope already
    /// counted as sent is lost with it.
    pub fn on_undeliverable(&mut self, message_kind: &str) {
        if message_kind == "Continue" {
            self.dropped_chunks += 1;
        }
        self.on_sink_failure();
    }

    /// The sink terminated on its own. Returns the number of chunks lost.
    pub fn on_sink_gone(&mut self) -> usize {
        let lost = self.backlog.len();
        self.dropped_chunks += lost as u64;
        self.backlog.clear();
        self.state = SpillState::Closed;
        lost
    }

    /// Stop spilling. A streaming sink is sent the stop signal and returned.
    ///
    /// A handshake still in flight is abandoned; the caller stops that sink
    /// once its identity arrives.
    pub fn stop(&mut self, out: &mut dyn Outbox) -> Option<ActorId> {
        let writer = self.writer();
        if let Some(writer) = writer {
            out.send(writer, Message::Poison);
        }
        if matches!(
            self.state,
            SpillState::Streaming(_) | SpillState::SinkFailed(_) | SpillState::AwaitingHandshake
        ) {
            self.dropped_chunks += self.backlog.len() as u64;
            self.backlog.clear();
            self.state = SpillState::Closed;
        }
        writer
    }

    fn fail(&mut self) {
        self.dropped_chunks += self.backlog.len() as u64;
        self.backlog.clear();
        self.state = SpillState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sent(Vec<(ActorId, Message)>);

    impl Outbox for Sent {
        fn send(&mut self, to: ActorId, message: Message) {
            self.0.push((to, message));
        }
    }

    const EVENTS: ActorId = ActorId(2);
    const WRITER: ActorId = ActorId(3);

    fn chunk(n: usize) -> Chunk {
        Chunk::from_rows([vec![b'r'; n]])
    }

    fn streaming(window: u64, out: &mut Sent) -> OverflowSpiller {
        let mut s = OverflowSpiller::new("t", window);
        s.activate(Some(EVENTS), "{}".to_string(), chunk(40), out)
            .expect("activate");
        s.on_handshake(Ok(WRITER), out).expect("handshake");
        s
    }

    fn continue_seqs(out: &Sent) -> Vec<u64> {
        out.0
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Continue(e) => Some(e.seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn buffers_until_handshake_then_drains_in_order() {
        let mut out = Sent::default();
        let mut s = OverflowSpiller::new("t", 1024);
        s.activate(Some(EVENTS), "{}".to_string(), chunk(1), &mut out)
            .expect("activate");
        assert_eq!(
            out.0[0],
            (
                EVENTS,
                Message::FullResultStart {
                    schema: "{}".to_string()
                }
            )
        );
        s.push(chunk(2), &mut out);
        assert_eq!(s.backlog_len(), 2);
        assert!(continue_seqs(&out).is_empty());

        assert_eq!(s.on_handshake(Ok(WRITER), &mut out).expect("ok"), WRITER);
        assert_eq!(continue_seqs(&out), vec![0, 1]);
        assert_eq!(s.backlog_len(), 0);
        assert_eq!(s.writer(), Some(WRITER));
    }

    #[test]
    fn exhausted_credit_requests_status_once_and_resumes_on_reply() {
        let mut out = Sent::default();
        // 4 + 40 row bytes + 13 header = 57 bytes per envelope
        let mut s = streaming(100, &mut out);
        s.push(chunk(40), &mut out);
        s.push(chunk(40), &mut out);
        s.push(chunk(40), &mut out);
        assert_eq!(continue_seqs(&out), vec![0, 1]);
        assert!(s.credit().in_flight() > s.credit().window_bytes());
        let status_requests = out
            .0
            .iter()
            .filter(|(_, m)| *m == Message::StatusRequest)
            .count();
        assert_eq!(status_requests, 1);
        assert_eq!(s.status_requests(), 1);
        assert_eq!(s.backlog_len(), 2);

        s.on_status(
            SinkStatus {
                bytes_received: 114,
                error_message: None,
            },
            &mut out,
        )
        .expect("status");
        assert_eq!(continue_seqs(&out), vec![0, 1, 2, 3]);
        assert_eq!(s.backlog_len(), 0);
    }

    #[test]
    fn status_error_stops_draining() {
        let mut out = Sent::default();
        let mut s = streaming(10, &mut out);
        s.push(chunk(40), &mut out);
        let err = s
            .on_status(
                SinkStatus {
                    bytes_received: 57,
                    error_message: Some("disk full".to_string()),
                },
                &mut out,
            )
            .expect_err("sink error");
        assert!(err.to_string().contains("disk full"));
        assert_eq!(continue_seqs(&out), vec![0]);
        assert!(s.lost_data());
        assert_eq!(s.state(), SpillState::SinkFailed(WRITER));

        // later chunks are dropped without new status requests
        let sent_before = out.0.len();
        s.push(chunk(40), &mut out);
        s.push(chunk(40), &mut out);
        assert_eq!(out.0.len(), sent_before);
        assert_eq!(s.status_requests(), 1);
        assert_eq!(s.dropped_chunks(), 3);
        assert_eq!(s.request_finish(&mut out), FinishRoute::NoSink);

        // the failed sink is still stopped
        assert_eq!(s.stop(&mut out), Some(WRITER));
        assert_eq!(*out.0.last().expect("message"), (WRITER, Message::Poison));
    }

    #[test]
    fn undeliverable_envelope_counts_as_lost() {
        let mut out = Sent::default();
        let mut s = streaming(1024, &mut out);
        assert!(!s.lost_data());
        s.on_undeliverable("Continue");
        assert!(s.lost_data());
        assert!(s.sink_failed());
        assert_eq!(s.dropped_chunks(), 1);
        assert_eq!(s.writer(), Some(WRITER));
    }

    #[test]
    fn finish_waits_for_backlog() {
        let mut out = Sent::default();
        let mut s = streaming(10, &mut out);
        s.push(chunk(40), &mut out);
        assert_eq!(s.request_finish(&mut out), FinishRoute::ViaSink);
        assert!(!out.0.iter().any(|(_, m)| *m == Message::Finish));

        s.on_status(
            SinkStatus {
                bytes_received: 57,
                error_message: None,
            },
            &mut out,
        )
        .expect("status");
        let last = out.0.last().expect("message");
        assert_eq!(*last, (WRITER, Message::Finish));
    }

    #[test]
    fn handshake_failure_drops_backlog() {
        let mut out = Sent::default();
        let mut s = OverflowSpiller::new("t", 1024);
        s.activate(Some(EVENTS), "{}".to_string(), chunk(1), &mut out)
            .expect("activate");
        assert!(s.on_handshake(Err("no quota".to_string()), &mut out).is_err());
        assert_eq!(s.state(), SpillState::Failed);
        s.push(chunk(1), &mut out);
        assert_eq!(s.dropped_chunks(), 2);
        assert_eq!(s.request_finish(&mut out), FinishRoute::NoSink);
    }

    #[test]
    fn activation_without_event_sink_fails() {
        let mut out = Sent::default();
        let mut s = OverflowSpiller::new("t", 1024);
        assert!(s.activate(None, "{}".to_string(), chunk(1), &mut out).is_err());
        assert!(out.0.is_empty());
        assert!(s.lost_data());
    }

    #[test]
    fn stop_poisons_streaming_writer() {
        let mut out = Sent::default();
        let mut s = streaming(1024, &mut out);
        assert_eq!(s.stop(&mut out), Some(WRITER));
        assert_eq!(*out.0.last().expect("message"), (WRITER, Message::Poison));
        assert_eq!(s.state(), SpillState::Closed);
        assert_eq!(s.stop(&mut out), None);
    }

    #[test]
    fn stop_during_handshake_abandons_backlog() {
        let mut out = Sent::default();
        let mut s = OverflowSpiller::new("t", 1024);
        s.activate(Some(EVENTS), "{}".to_string(), chunk(1), &mut out)
            .expect("activate");
        assert_eq!(s.stop(&mut out), None);
        assert_eq!(s.state(), SpillState::Closed);
        assert_eq!(s.dropped_chunks(), 1);
        assert!(s.on_handshake(Ok(WRITER), &mut out).is_err());
    }
}
