//! Result aggregation for distributed query execution.
//!
//! Architecture role:
//! - [`coordinator`] collects result chunks from upstream tasks into one
//!   bounded payload and emits the single final response to the query owner
//! - [`spiller`] streams chunks that do not fit to an overflow sink under
//!   byte-credit flow control ([`credit`])
//! - [`barrier`] holds the final response until every spawned dependent has
//!   terminated
//! - [`runtime`] and [`sink`] host these pieces as tokio actors
//!
//! Key modules:
//! - [`accumulator`]
//! - [`barrier`]
//! - [`coordinator`]
//! - [`credit`]
//! - [`messages`]
//! - [`runtime`]
//! - [`sink`]
//! - [`spiller`]

pub mod accumulator;
pub mod barrier;
pub mod coordinator;
pub mod credit;
pub mod messages;
pub mod runtime;
pub mod sink;
pub mod spiller;
#[cfg(test)]
pub(crate) mod testing;

pub use accumulator::{
    FramedRowSerializer, LimitKind, Offer, ResultAccumulator, ResultPayload, ResultSchema,
    RowSerializer,
};
pub use barrier::ShutdownBarrier;
pub use coordinator::{
    CoordinatorState, FAIL_ON_RESPONSE_WRITE, ResultCoordinator, ResultCoordinatorConfig,
};
pub use credit::CreditTracker;
pub use messages::{
    FailureNotice, FinalResponse, Message, Outbox, QueryResponse, ResultCounters, SinkStatus,
    Undelivered,
};
pub use runtime::{ActorHandle, ActorRouter, Envelope, Mailbox, spawn_result_coordinator};
pub use sink::{spawn_execution_events, spawn_overflow_sink};
pub use spiller::{FinishRoute, OverflowSpiller, SpillState};
