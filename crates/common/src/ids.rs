//! Typed identifiers shared across coordinator/runtime components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mailbox address of one actor registered with the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[actor:{}]", self.0)
    }
}

/// Query trace identifier used to correlate logs, metrics and overflow files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(
    /// Raw trace id value.
    pub String,
);

impl TraceId {
    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TraceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
