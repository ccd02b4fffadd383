//! Per-request quorum coordinators.
//!
//! A coordinator owns one client request from creation to termination. The
//! protocol lives in two pure state machines, [`ReadFsm`] and [`WriteFsm`]:
//! each transition consumes one [`Event`] and returns the effects to perform
//! (dispatching to replicas, answering the client, repairing replicas). The
//! [`runtime`] module drives them as tokio tasks, one per request, feeding
//! replica replies and timer expiries through a single mailbox.
//!
//! ```text
//! Execute -> Waiting -> Completing -> Finalize -> Terminated
//!               |                        ^
//!               +------------------------+   (all N replied at quorum)
//!               |
//!               +--> Terminated              (primary deadline)
//! ```

mod read;
pub mod runtime;
mod write;

pub use read::{ReadEffect, ReadFsm, ReadReply, ReadRequest, ReplyStats};
pub use write::{WriteEffect, WriteFailure, WriteFsm, WriteReply, WriteRequest};

use crate::replica::ReplicaReply;

/// Lifecycle phase of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Created; the replica set has not been contacted yet.
    Execute,
    /// Collecting replies until the quorum is reached.
    Waiting,
    /// Client answered; collecting the remaining replies.
    Completing,
    /// All replies in (or completion deadline passed); deciding repairs.
    Finalize,
    /// Done. No further events are accepted.
    Terminated,
}

/// The two deadlines a request runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Deadline {
    /// Quorum must be reached before this fires, or the client gets a timeout.
    Primary,
    /// Cuts off straggler collection. Never produces a second client reply.
    Completion,
}

/// Input to a coordinator state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<R> {
    /// A replica answered.
    Reply(ReplicaReply<R>),
    /// A deadline expired.
    Timeout(Deadline),
}

impl<R> Event<R> {
    fn describe(&self) -> &'static str {
        match self {
            Self::Reply(_) => "replica reply",
            Self::Timeout(Deadline::Primary) => "primary deadline",
            Self::Timeout(Deadline::Completion) => "completion deadline",
        }
    }
}
