//! Client-facing error taxonomy.

use crate::wire::Fault;
use thiserror::Error;

/// Errors surfaced by [crate::client::Client::call].
///
/// The set is closed so callers can pattern-match on kind rather than message
/// content. Entity-level faults cross the wire unchanged; the client is the
/// only layer that turns a kind into a retry decision, and once retries are
/// exhausted the original kind is returned as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The request parameter exceeds the entity's configured ceiling. Callers
    /// must change the input; retrying is useless.
    #[error("input too large")]
    InputTooLarge,

    /// A double-checked computation disagreed with its cross-check. Signals a
    /// correctness bug and is never retried.
    #[error("verification mismatch")]
    VerificationMismatch,

    /// A transient compute fault; safe to retry.
    #[error("transient compute fault")]
    Transient,

    /// The contacted runner no longer owns the entity's shard. Retried
    /// transparently after invalidating the routing cache.
    #[error("runner does not own entity's shard")]
    NotOwner,

    /// The entity's shard has no owner (e.g. no runner has completed
    /// admission yet). Retried transparently.
    #[error("shard unassigned")]
    Unassigned,

    /// The attempt exceeded the per-attempt timeout. The request may still
    /// execute server-side; its response is discarded.
    #[error("request timed out")]
    Timeout,

    /// Catastrophic wrapper for anything that escapes the classification
    /// above (dial failures, stream errors, malformed frames).
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Whether the client may retry after this error.
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::InputTooLarge | Self::VerificationMismatch)
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::InputTooLarge => Self::InputTooLarge,
            Fault::VerificationMismatch => Self::VerificationMismatch,
            Fault::Transient => Self::Transient,
            Fault::Internal(message) => Self::Unavailable(message),
        }
    }
}
