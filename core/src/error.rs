//! Error types exposed by the coherence core
//!
//! Mirrors the error table of the design: every recoverable condition the
//! fault engine, messaging ring, or replica pool can hit is a named variant
//! here rather than a string or a panic.

use std::fmt;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the coherence core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "coherence errors must be handled, not silently discarded"]
pub enum CoreError {
    /// Handle/ring/replica allocation failed after retry. Caller retries
    /// after a short sleep.
    OutOfResources { resource: &'static str },
    /// No transport ops vector registered. The fault engine treats this as
    /// a no-op for remote effect; the local path still completes.
    TransportUnavailable,
    /// A peer refused the transaction. Converted to `RetryFault` at the
    /// `on_local_fault` boundary.
    Nacked,
    /// Another writer raced, or the wait station collapsed. The caller must
    /// re-drive the fault from scratch after a brief sleep.
    RetryFault,
    /// Message type out of range or header malformed.
    InvalidMessage { reason: &'static str },
    /// The action table hit the invalid cell {REPLICATED, NEEDWRITE,
    /// MODIFIED, SHARED}. Logged, best-effort ACKed, handle cleaned up.
    InvariantViolation { detail: &'static str },
    /// The requested page, handle, or station does not exist.
    NotFound { what: &'static str },
    /// Addressed node is out of range for the configured node count.
    InvalidNode { node: u32 },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfResources { resource } => {
                write!(f, "out of resources: {resource}")
            }
            Self::TransportUnavailable => write!(f, "no transport registered"),
            Self::Nacked => write!(f, "peer nacked the transaction"),
            Self::RetryFault => write!(f, "caller must re-drive the fault"),
            Self::InvalidMessage { reason } => write!(f, "invalid message: {reason}"),
            Self::InvariantViolation { detail } => {
                write!(f, "action table invariant violated: {detail}")
            }
            Self::NotFound { what } => write!(f, "not found: {what}"),
            Self::InvalidNode { node } => write!(f, "invalid node id: {node}"),
        }
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_informative() {
        let e = CoreError::OutOfResources {
            resource: "fault handle",
        };
        assert_eq!(e.to_string(), "out of resources: fault handle");
    }

    #[test]
    fn retry_fault_is_distinct_from_nacked() {
        assert_ne!(CoreError::RetryFault, CoreError::Nacked);
    }
}
