use thiserror::Error;

/// Canonical DQR error taxonomy used across crates.
///
/// Classification guidance:
/// - [`DqrError::InvalidConfig`]: limits/env/path contract violations
/// - [`DqrError::Serialization`]: row conversion failures, including injected faults
/// - [`DqrError::Sink`]: overflow sink handshake or storage failures
/// - [`DqrError::Delivery`]: messages the runtime could not hand to a mailbox
/// - [`DqrError::Execution`]: other runtime failures after setup succeeded
/// - [`DqrError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum DqrError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - zero byte limit or zero credit window
    /// - unparsable `DQR_*` environment values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Chunk-to-row conversion failures.
    ///
    /// Examples:
    /// - truncated row frame inside a chunk payload
    /// - a failure-injection point firing on the response write path
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Overflow sink failures.
    ///
    /// Examples:
    /// - sink could not be started (handshake refused)
    /// - overflow file write/finish failed
    #[error("overflow sink error: {0}")]
    Sink(String),

    /// Message delivery failures reported by the actor runtime.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Runtime failures not covered by the more specific variants.
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard DQR result alias.
pub type Result<T> = std::result::Result<T, DqrError>;
