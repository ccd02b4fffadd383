use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::{Deadline, Event, Phase};
use crate::context::VersionVector;
use crate::error::{CoordinatorError, ProtocolViolation};
use crate::object::CausalObject;
use crate::replica::{Location, ReadResult, RequestId};
use crate::Crdt;

/// Everything a read coordinator needs to know about its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Correlates replica replies.
    pub request_id: RequestId,
    /// Key being read.
    pub key: String,
    /// Resolved read quorum R.
    pub r: usize,
    /// Repair stale replicas after answering.
    pub read_repair: bool,
    /// Answer with values, or only acknowledge.
    pub return_value: bool,
}

/// The single answer a read client receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadReply<V> {
    /// Visible values (tombstones excluded) and the merged context.
    Ok {
        /// Sorted, deduplicated sibling values.
        values: Vec<V>,
        /// Context to pass to the next write.
        context: VersionVector,
    },
    /// No visible value. The context is still returned so a subsequent write
    /// supersedes any tombstones.
    NotFound {
        /// Context to pass to the next write.
        context: VersionVector,
    },
    /// The quorum answered; values were not requested.
    Acknowledged,
    /// The quorum was not reached before the primary deadline.
    Timeout,
}

/// Work the runtime performs on behalf of a [`ReadFsm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEffect<V> {
    /// Send a read to each location.
    Dispatch(Vec<Location>),
    /// Answer the client.
    Reply(ReadReply<V>),
    /// Fire-and-forget write of the merged object to a stale replica.
    Repair {
        /// Stale replica.
        location: Location,
        /// Merged object to write.
        object: CausalObject<V>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    Found,
    NotFound,
    Error,
}

/// Reply counts by kind, for logging at finalize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyStats {
    /// Replicas that returned an object.
    pub found: usize,
    /// Replicas that did not hold the key.
    pub not_found: usize,
    /// Replicas that failed the read.
    pub errors: usize,
}

/// Quorum read state machine.
///
/// Not-found and error replies count toward R and contribute the identity
/// object to the merge. The client is answered exactly once, at the moment
/// the R-th distinct replica replies or when the primary deadline passes.
#[derive(Debug, Clone)]
pub struct ReadFsm<V> {
    request: ReadRequest,
    phase: Phase,
    replicas: Vec<Location>,
    /// location -> (object it contributed, what kind of reply it was)
    replies: BTreeMap<Location, (CausalObject<V>, ReplyKind)>,
    replied: bool,
    repairs: Vec<Location>,
}

impl<V: Clone + Ord> ReadFsm<V> {
    /// Create a coordinator in [`Phase::Execute`].
    pub fn new(request: ReadRequest) -> Self {
        Self {
            request,
            phase: Phase::Execute,
            replicas: Vec::new(),
            replies: BTreeMap::new(),
            replied: false,
            repairs: Vec::new(),
        }
    }

    /// The request being coordinated.
    #[must_use]
    pub fn request(&self) -> &ReadRequest {
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

    /// Number of distinct replicas that have replied.
    #[must_use]
    pub fn replies_received(&self) -> usize {
        self.replies.len()
    }

    /// Replicas scheduled for repair at finalize.
    #[must_use]
    pub fn repairs(&self) -> &[Location] {
        &self.repairs
    }

    /// Reply counts by kind.
    #[must_use]
    pub fn stats(&self) -> ReplyStats {
        let mut stats = ReplyStats::default();
        for (_, kind) in self.replies.values() {
            match kind {
                ReplyKind::Found => stats.found += 1,
                ReplyKind::NotFound => stats.not_found += 1,
                ReplyKind::Error => stats.errors += 1,
            }
        }
        stats
    }

    /// Merge of every reply received so far.
    #[must_use]
    pub fn merged(&self) -> CausalObject<V> {
        CausalObject::merge_all(self.replies.values().map(|(obj, _)| obj))
    }

    /// Contact the replica set and start waiting.
    ///
    /// Fails if the set is smaller than R, since the quorum could never be
    /// reached.
    pub fn execute(&mut self, replicas: Vec<Location>) -> Result<Vec<ReadEffect<V>>, CoordinatorError> {
        if self.phase != Phase::Execute {
            return Err(self.violation("execute").into());
        }
        if replicas.len() < self.request.r {
            self.phase = Phase::Terminated;
            return Err(CoordinatorError::InsufficientReplicas {
                request_id: self.request.request_id,
                available: replicas.len(),
                required: self.request.r,
            });
        }
        self.replicas = replicas.clone();
        self.phase = Phase::Waiting;
        Ok(vec![ReadEffect::Dispatch(replicas)])
    }

    /// Advance the state machine by one event.
    pub fn handle(&mut self, event: Event<ReadResult<V>>) -> Result<Vec<ReadEffect<V>>, ProtocolViolation> {
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
                self.record(reply.location, reply.result);
                Ok(self.after_reply())
            }
            (Phase::Waiting, Event::Timeout(Deadline::Primary)) => {
                warn!(
                    received = self.replies.len(),
                    r = self.request.r,
                    "read quorum not reached before deadline"
                );
                self.replied = true;
                self.phase = Phase::Terminated;
                Ok(vec![ReadEffect::Reply(ReadReply::Timeout)])
            }
            (Phase::Completing, Event::Timeout(Deadline::Completion)) => {
                debug!(
                    received = self.replies.len(),
                    n = self.replicas.len(),
                    "completion deadline passed, finalizing with partial replies"
                );
                Ok(self.finalize())
            }
            (_, event) => {
                let violation = self.violation(event.describe());
                self.phase = Phase::Terminated;
                Err(violation)
            }
        }
    }

    fn record(&mut self, location: Location, result: ReadResult<V>) {
        let kind = match &result {
            ReadResult::Found(_) => ReplyKind::Found,
            ReadResult::NotFound => ReplyKind::NotFound,
            ReadResult::Error(reason) => {
                debug!(%location, %reason, "replica read failed");
                ReplyKind::Error
            }
        };
        debug!(%location, ?kind, "recorded read reply");
        self.replies.insert(location, (result.into_object(), kind));
    }

    fn after_reply(&mut self) -> Vec<ReadEffect<V>> {
        let received = self.replies.len();
        let all_in = received == self.replicas.len();

        match self.phase {
            Phase::Waiting if received >= self.request.r => {
                let mut effects = vec![ReadEffect::Reply(self.client_reply())];
                self.replied = true;
                if all_in {
                    effects.extend(self.finalize());
                } else {
                    self.phase = Phase::Completing;
                }
                effects
            }
            Phase::Completing if all_in => self.finalize(),
            _ => Vec::new(),
        }
    }

    fn client_reply(&self) -> ReadReply<V> {
        if !self.request.return_value {
            return ReadReply::Acknowledged;
        }
        let merged = self.merged();
        let values: Vec<V> = merged.values().into_iter().cloned().collect();
        let context = merged.context().clone();
        if values.is_empty() {
            ReadReply::NotFound { context }
        } else {
            ReadReply::Ok { values, context }
        }
    }

    fn finalize(&mut self) -> Vec<ReadEffect<V>> {
        self.phase = Phase::Finalize;
        let mut effects = Vec::new();

        if self.request.read_repair {
            let merged = self.merged();
            for (location, (obj, _)) in &self.replies {
                if *obj != merged {
                    self.repairs.push(location.clone());
                    effects.push(ReadEffect::Repair {
                        location: location.clone(),
                        object: merged.clone(),
                    });
                }
            }
        }

        let stats = self.stats();
        debug!(
            found = stats.found,
            not_found = stats.not_found,
            errors = stats.errors,
            repairs = self.repairs.len(),
            "read finalized"
        );
        self.phase = Phase::Terminated;
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
