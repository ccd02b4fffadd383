//! Interfaces to the collaborators a coordinator consumes.
//!
//! The coordinator does not know how replica sets are computed or how
//! replicas store objects. It asks a [`ReplicaDirectory`] where a key lives,
//! fans requests out through a [`ReplicaService`], and receives the answers
//! as [`ReplicaReply`] messages through the [`ReplySender`] it handed out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::context::VersionVector;
use crate::object::{CausalObject, Value};

/// Identifies one client operation for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestId(u64);

impl RequestId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Hands out request ids that are never reused within a process.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    /// Start counting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Address of one replica of a key (a partition on a node).
///
/// The location name doubles as the actor id in causal contexts: writes
/// accepted by a replica are tagged with its location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location(String);

impl Location {
    /// Create a location from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The location name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Location {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Location {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Outcome of a read at one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<V> {
    /// The replica holds the key.
    Found(CausalObject<V>),
    /// The replica has never seen the key.
    NotFound,
    /// The replica could not serve the read.
    Error(String),
}

impl<V: Clone + Ord> ReadResult<V> {
    /// The object this reply contributes to a merge. Not-found and error
    /// replies contribute the identity object.
    pub fn into_object(self) -> CausalObject<V> {
        match self {
            Self::Found(obj) => obj,
            Self::NotFound | Self::Error(_) => CausalObject::new(),
        }
    }
}

/// Outcome of a write at one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// The replica applied the write.
    Ack,
    /// The replica refused or failed the write.
    Nack(String),
}

/// An asynchronous reply from a replica, tagged with the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaReply<R> {
    /// Request the reply belongs to.
    pub request_id: RequestId,
    /// Replica that produced it.
    pub location: Location,
    /// What happened.
    pub result: R,
}

/// Return address handed to a replica together with a request.
///
/// Sending never blocks. Once the coordinator has terminated, sends are
/// silently dropped.
#[derive(Debug)]
pub struct ReplySender<R> {
    request_id: RequestId,
    tx: mpsc::UnboundedSender<ReplicaReply<R>>,
}

impl<R> Clone for ReplySender<R> {
    fn clone(&self) -> Self {
        Self {
            request_id: self.request_id,
            tx: self.tx.clone(),
        }
    }
}

impl<R> ReplySender<R> {
    /// Wrap the sending half of a coordinator mailbox.
    pub fn new(request_id: RequestId, tx: mpsc::UnboundedSender<ReplicaReply<R>>) -> Self {
        Self { request_id, tx }
    }

    /// The request this sender answers.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Deliver `result` from `location`. Returns `false` if the coordinator
    /// is gone.
    pub fn send(&self, location: Location, result: R) -> bool {
        self.tx
            .send(ReplicaReply {
                request_id: self.request_id,
                location,
                result,
            })
            .is_ok()
    }
}

/// Maps a key to the ordered list of its replica locations.
///
/// Must be deterministic for the duration of a request.
pub trait ReplicaDirectory: Send + Sync + 'static {
    /// Preference list for `key`, most preferred first.
    fn resolve_replicas(&self, key: &str) -> Vec<Location>;
}

/// Executes reads and writes at replicas on behalf of coordinators.
///
/// Every method is fire-and-forget: implementations must return promptly and
/// answer later through the given [`ReplySender`], or never if the replica is
/// unreachable.
pub trait ReplicaService<V>: Send + Sync + 'static {
    /// Read `key` at `location`.
    fn read(&self, location: &Location, key: &str, reply_to: ReplySender<ReadResult<V>>);

    /// Write `value` for `key` at `location`. `context` is the causal context
    /// the client last observed; the replica derives the new dot from it.
    fn write(
        &self,
        location: &Location,
        key: &str,
        value: Value<V>,
        context: VersionVector,
        reply_to: ReplySender<WriteResult>,
    );

    /// Merge `object` into the replica's copy of `key`. No reply.
    fn repair(&self, location: &Location, key: &str, object: CausalObject<V>);
}
