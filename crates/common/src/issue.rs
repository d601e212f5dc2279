//! Structured diagnostics attached to a query's outcome.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Issue severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Info,
}

/// Machine-readable issue code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueCode {
    /// No specific code; used for limit warnings.
    Default,
    /// Gateway-side failure; the query may not be re-run elsewhere.
    GatewayError,
    /// Gateway-side failure; the caller should fall back to another engine.
    GatewayNeedFallbackError,
}

impl IssueCode {
    /// Stable numeric code as exposed to callers.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Default => 0,
            Self::GatewayError => 6001,
            Self::GatewayNeedFallbackError => 6002,
        }
    }
}

/// One `(severity, code, message)` diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub code: IssueCode,
    pub message: String,
}

impl Issue {
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code: IssueCode::Default,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} (code {}): {}",
            self.severity,
            self.code.as_u32(),
            self.message
        )
    }
}

/// Append-only, ordered issue collection. Duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueLog {
    issues: Vec<Issue>,
}

impl IssueLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    pub fn extend<I>(&mut self, issues: I)
    where
        I: IntoIterator<Item = Issue>,
    {
        self.issues.extend(issues);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.issues.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Issue] {
        &self.issues
    }

    /// Most severe entry, if any.
    #[must_use]
    pub fn worst_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).min()
    }

    /// Consume the log into its entries, preserving insertion order.
    #[must_use]
    pub fn into_vec(self) -> Vec<Issue> {
        self.issues
    }
}
