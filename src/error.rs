//! Error types.

use thiserror::Error;

use crate::coordinator::Phase;
use crate::replica::RequestId;

/// Invalid per-request or coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The replication factor must be at least 1.
    #[error("replication factor must be at least 1")]
    ZeroReplication,
    /// A quorum resolved outside `1..=n`.
    #[error("quorum {quorum} is out of range for n_val {n_val}")]
    QuorumOutOfRange {
        /// Resolved quorum size.
        quorum: usize,
        /// Replication factor it was resolved against.
        n_val: usize,
    },
    /// A deadline of zero would fail every request.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Why a coordinator could not produce a normal answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// The request options were rejected.
    #[error("invalid request options: {0}")]
    Config(#[from] ConfigError),
    /// The directory returned fewer replicas than the quorum requires.
    #[error("request {request_id}: {available} replicas available, quorum needs {required}")]
    InsufficientReplicas {
        /// The failed request.
        request_id: RequestId,
        /// Replicas the directory returned.
        available: usize,
        /// Quorum size.
        required: usize,
    },
    /// The coordinator received an event it does not handle in its current
    /// phase and terminated.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    /// The coordinator task panicked or stopped before answering.
    #[error("coordinator for request {0} terminated without replying")]
    Crashed(RequestId),
    /// The reply of this request was already awaited once.
    #[error("reply for request {0} was already taken")]
    ReplyTaken(RequestId),
}

/// An event arrived in a phase that does not handle it.
///
/// State machines return this instead of guessing; the runtime terminates the
/// offending coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request {request_id}: unexpected {event} in phase {phase:?}")]
pub struct ProtocolViolation {
    /// Request whose coordinator received the event.
    pub request_id: RequestId,
    /// Phase the coordinator was in.
    pub phase: Phase,
    /// Short description of the event.
    pub event: &'static str,
}

/// Failure to encode or decode an object envelope.
#[cfg(feature = "serde")]
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input is too short to hold an envelope header.
    #[error("envelope too short: {0} bytes")]
    Truncated(usize),
    /// The first byte is not the object magic byte.
    #[error("bad magic byte 0x{0:02X}")]
    BadMagic(u8),
    /// The envelope was written by a newer format.
    #[error("unsupported object format version {0}")]
    UnsupportedVersion(u8),
    /// postcard rejected the payload.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
}
