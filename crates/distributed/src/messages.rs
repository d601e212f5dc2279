//! Messages exchanged between the result coordinator and its collaborators.
//!
//! Every actor in the runtime speaks [`Message`]; each actor handles the
//! subset addressed to its role and logs the rest.

use dqr_common::{ActorId, Chunk, ContinueEnvelope, Issue};
use serde::{Deserialize, Serialize};

/// Destination side of message sending, as seen from one actor.
///
/// The sending actor's own identity is implied by the implementation.
pub trait Outbox {
    fn send(&mut self, to: ActorId, message: Message);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Upstream task -> coordinator: one chunk of result rows.
    Data(Chunk),
    /// Upstream task -> coordinator: no more chunks will follow.
    DataEnd,
    /// Owner -> coordinator: upstream completion signal; starts shutdown.
    QueryResponse(QueryResponse),
    /// Coordinator -> execution events: start an overflow sink for this schema.
    FullResultStart { schema: String },
    /// Execution events -> coordinator: overflow sink handshake outcome.
    FullResultSync(Result<ActorId, String>),
    /// Coordinator -> sink: one spilled chunk.
    Continue(ContinueEnvelope),
    /// Coordinator -> sink: all spilled chunks were sent.
    Finish,
    /// Coordinator -> sink: report acknowledged bytes.
    StatusRequest,
    /// Sink -> coordinator: reply to [`Message::StatusRequest`].
    StatusResponse(SinkStatus),
    /// Failure report. Coordinator -> owner for mid-stream faults; sink ->
    /// coordinator as the reply to [`Message::Finish`] (empty issues on success)
    /// or as a late error.
    Failure(FailureNotice),
    /// Coordinator -> owner: all result data has been placed.
    GraphFinished,
    /// Coordinator -> owner: the single final response.
    FinalResponse(FinalResponse),
    /// Stop request.
    Poison,
    /// Termination acknowledgment.
    Gone,
    /// Runtime -> sender: a message could not be delivered.
    Undelivered(Undelivered),
}

impl Message {
    /// Short type tag used in logs and delivery-failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "Data",
            Self::DataEnd => "DataEnd",
            Self::QueryResponse(_) => "QueryResponse",
            Self::FullResultStart { .. } => "FullResultStart",
            Self::FullResultSync(_) => "FullResultSync",
            Self::Continue(_) => "Continue",
            Self::Finish => "Finish",
            Self::StatusRequest => "StatusRequest",
            Self::StatusResponse(_) => "StatusResponse",
            Self::Failure(_) => "Failure",
            Self::GraphFinished => "GraphFinished",
            Self::FinalResponse(_) => "FinalResponse",
            Self::Poison => "Poison",
            Self::Gone => "Gone",
            Self::Undelivered(_) => "Undelivered",
        }
    }

    /// Whether a failed delivery is reported back to the sender.
    ///
    /// Owner-bound reports and acknowledgments are not bounced; a dead owner
    /// would otherwise turn each bounce into a new failure report.
    pub fn bounces_when_undelivered(&self) -> bool {
        !matches!(
            self,
            Self::Failure(_)
                | Self::GraphFinished
                | Self::FinalResponse(_)
                | Self::Gone
                | Self::Undelivered(_)
        )
    }
}

/// Upstream completion signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Issues raised upstream, merged ahead of the coordinator's own issues.
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStatus {
    /// Running total of envelope bytes the sink has received.
    pub bytes_received: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub issues: Vec<Issue>,
    pub retriable: bool,
    pub needs_fallback: bool,
    pub counters: Option<ResultCounters>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Undelivered {
    /// Actor the message could not reach.
    pub from: ActorId,
    /// Actor that sent it and receives this report.
    pub to: ActorId,
    pub reason: String,
    pub message_kind: &'static str,
}

impl Undelivered {
    pub fn describe(&self) -> String {
        format!(
            "Undelivered from {} to {} reason: {} sourceType: {}",
            self.from, self.to, self.reason, self.message_kind
        )
    }
}

/// Coordinator counters attached to failure notices and the final response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounters {
    pub chunks_received: u64,
    pub payload_rows: u64,
    pub payload_bytes: u64,
    pub overflow_chunks: u64,
    pub overflow_bytes_sent: u64,
    pub overflow_bytes_acked: u64,
    pub overflow_status_requests: u64,
    pub dropped_chunks: u64,
    pub failures: u64,
}

/// The single response delivered to the query owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResponse {
    /// Serialized rows kept in memory, in arrival order.
    pub rows: Vec<Vec<u8>>,
    pub issues: Vec<Issue>,
    /// `true` whenever result rows were dropped.
    pub truncated: bool,
    /// Overflow sink that received the rows not kept in `rows`, if any.
    pub overflow_writer: Option<ActorId>,
    pub counters: ResultCounters,
}
