//! # quorum-kit
//!
//! Dynamo-style quorum coordination over a causal multi-value object model.
//!
//! Every key lives on N replicas. A client read or write is handled by a
//! short-lived coordinator that fans the request out, answers the client as
//! soon as a quorum of replicas replied, and keeps collecting the remaining
//! replies in the background to repair stale replicas.
//!
//! Replica answers are reconciled with [`CausalObject::merge`](Crdt::merge),
//! which is commutative, associative and idempotent: the answer never depends
//! on the order replies arrive in, on duplicates, or on which coordinator
//! computed it.
//!
//! ## Quick Start
//!
//! ```
//! use quorum_kit::prelude::*;
//!
//! // Two replicas accept concurrent writes.
//! let mut a = CausalObject::new();
//! a.apply_write("n1", Value::Live("x"), &VersionVector::new());
//!
//! let mut b = CausalObject::new();
//! b.apply_write("n2", Value::Live("y"), &VersionVector::new());
//!
//! // A coordinator merges what it reads: both values survive as siblings.
//! let merged = a.merged(&b);
//! assert_eq!(merged.values(), vec![&"x", &"y"]);
//! assert_eq!(merged.context().get("n1"), 1);
//! assert_eq!(merged.context().get("n2"), 1);
//! ```
//!
//! ## Modules
//!
//! - [`context`] - dots and version vectors
//! - [`object`] - [`CausalObject`], values and tombstones
//! - [`coordinator`] - read and write state machines and their tokio runtime
//! - [`replica`] - the directory and replica service a coordinator consumes
//! - [`config`] - quorum sizes, deadlines and flags
//! - [`memory`] - an in-process replica cluster for tests and simulation

#![warn(missing_docs)]

mod crdt;
pub mod object;

#[cfg(feature = "serde")]
pub mod codec;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod prelude;
pub mod replica;

pub use config::{CoordinatorConfig, Quorum, ReadOptions, WriteOptions};
pub use context::{Dot, VersionVector};
pub use coordinator::runtime::{Coordinator, RequestHandle};
pub use coordinator::{ReadReply, WriteFailure, WriteReply};
pub use crdt::Crdt;
pub use error::{ConfigError, CoordinatorError, ProtocolViolation};
pub use memory::MemoryCluster;
pub use object::{CausalObject, Value};
