use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use super::{Deadline, Event, Phase};
use crate::context::VersionVector;
use crate::error::{CoordinatorError, ProtocolViolation};
use crate::object::Value;
use crate::replica::{Location, RequestId, WriteResult};

/// Everything a write coordinator needs to know about its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest<V> {
    /// Correlates replica replies.
    pub request_id: RequestId,
    /// Key being written.
    pub key: String,
    /// New value, or [`Value::Tombstone`] for a delete.
    pub value: Value<V>,
    /// Context the client observed on its last read of `key`.
    pub context: VersionVector,
    /// Resolved write quorum W, counted in acknowledgements.
    pub w: usize,
}

/// Why a write could not reach its quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteFailure {
    /// Enough replicas refused the write that W acks are impossible.
    TooManyFailures {
        /// Acknowledgements received.
        acks: usize,
        /// Refusals received.
        nacks: usize,
        /// Acknowledgements required.
        required: usize,
    },
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyFailures { acks, nacks, required } => write!(
                f,
                "too many failures: {acks} acks, {nacks} nacks, {required} acks required"
            ),
        }
    }
}

/// The single answer a write client receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteReply {
    /// W replicas acknowledged.
    Ok,
    /// W was not reached before the primary deadline.
    Timeout,
    /// W can no longer be reached.
    Error(WriteFailure),
}

/// Work the runtime performs on behalf of a [`WriteFsm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteEffect<V> {
    /// Send the write to each location.
    Dispatch {
        /// Replica set.
        locations: Vec<Location>,
        /// Value to write.
        value: Value<V>,
        /// Client context the replicas derive the new dot from.
        context: VersionVector,
    },
    /// Answer the client.
    Reply(WriteReply),
}

/// Quorum write state machine.
///
/// Mirrors [`ReadFsm`](super::ReadFsm) with one difference in accounting:
/// only acknowledgements count toward W, while every reply counts toward the
/// N total that ends straggler collection. There is no repair step.
#[derive(Debug, Clone)]
pub struct WriteFsm<V> {
    request: WriteRequest<V>,
    phase: Phase,
    replicas: Vec<Location>,
    replies: BTreeMap<Location, WriteResult>,
    replied: bool,
}

impl<V: Clone> WriteFsm<V> {
    /// Create a coordinator in [`Phase::Execute`].
    pub fn new(request: WriteRequest<V>) -> Self {
        Self {
            request,
            phase: Phase::Execute,
            replicas: Vec::new(),
            replies: BTreeMap::new(),
            replied: false,
        }
    }

    /// The request being coordinated.
    #[must_use]
    pub fn request(&self) -> &WriteRequest<V> {
        &self.request
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns `true` once no further events are accepted.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Returns `true` once the client has been answered.
    #[must_use]
    pub fn has_replied(&self) -> bool {
        self.replied
    }

    /// Acknowledgements received so far.
    #[must_use]
    pub fn acks(&self) -> usize {
        self.replies
            .values()
            .filter(|r| matches!(r, WriteResult::Ack))
            .count()
    }

    /// Replies of any kind received so far.
    #[must_use]
    pub fn replies_received(&self) -> usize {
        self.replies.len()
    }

    /// Contact the replica set and start waiting.
    pub fn execute(&mut self, replicas: Vec<Location>) -> Result<Vec<WriteEffect<V>>, CoordinatorError> {
        if self.phase != Phase::Execute {
            return Err(self.violation("execute").into());
        }
        if replicas.len() < self.request.w {
            self.phase = Phase::Terminated;
            return Err(CoordinatorError::InsufficientReplicas {
                request_id: self.request.request_id,
                available: replicas.len(),
                required: self.request.w,
            });
        }
        self.replicas = replicas.clone();
        self.phase = Phase::Waiting;
        Ok(vec![WriteEffect::Dispatch {
            locations: replicas,
            value: self.request.value.clone(),
            context: self.request.context.clone(),
        }])
    }

    /// Advance the state machine by one event.
    pub fn handle(&mut self, event: Event<WriteResult>) -> Result<Vec<WriteEffect<V>>, ProtocolViolation> {
        match (self.phase, event) {
            (Phase::Waiting | Phase::Completing, Event::Reply(reply)) => {
                if reply.request_id != self.request.request_id {
                    debug!(
                        expected = %self.request.request_id,
                        got = %reply.request_id,
                        "dropping reply for another request"
                    );
                    return Ok(Vec::new());
                }
                if !self.replicas.contains(&reply.location) {
                    warn!(location = %reply.location, "dropping reply from outside the replica set");
                    return Ok(Vec::new());
                }
                if let WriteResult::Nack(reason) = &reply.result {
                    debug!(location = %reply.location, %reason, "replica refused write");
                }
                self.replies.insert(reply.location, reply.result);
                Ok(self.after_reply())
            }
            (Phase::Waiting, Event::Timeout(Deadline::Primary)) => {
                warn!(
                    acks = self.acks(),
                    w = self.request.w,
                    "write quorum not reached before deadline"
                );
                self.replied = true;
                self.phase = Phase::Terminated;
                Ok(vec![WriteEffect::Reply(WriteReply::Timeout)])
            }
            (Phase::Completing, Event::Timeout(Deadline::Completion)) => {
                debug!(
                    received = self.replies.len(),
                    n = self.replicas.len(),
                    "completion deadline passed"
                );
                self.phase = Phase::Terminated;
                Ok(Vec::new())
            }
            (_, event) => {
                let violation = self.violation(event.describe());
                self.phase = Phase::Terminated;
                Err(violation)
            }
        }
    }

    fn after_reply(&mut self) -> Vec<WriteEffect<V>> {
        let received = self.replies.len();
        let n = self.replicas.len();
        let acks = self.acks();
        let nacks = received - acks;
        let mut effects = Vec::new();

        if self.phase == Phase::Waiting {
            if acks >= self.request.w {
                effects.push(WriteEffect::Reply(WriteReply::Ok));
            } else if nacks > n - self.request.w {
                let failure = WriteFailure::TooManyFailures {
                    acks,
                    nacks,
                    required: self.request.w,
                };
                warn!(%failure, "write quorum unreachable");
                effects.push(WriteEffect::Reply(WriteReply::Error(failure)));
            } else {
                return effects;
            }
            self.replied = true;
            self.phase = Phase::Completing;
        }

        if received == n {
            // Finalize has nothing to repair on the write path.
            debug!(acks, nacks, "write finalized");
            self.phase = Phase::Terminated;
        }
        effects
    }

    fn violation(&self, event: &'static str) -> ProtocolViolation {
        ProtocolViolation {
            request_id: self.request.request_id,
            phase: self.phase,
            event,
        }
    }
}
