//! Convenient re-exports for common usage.
//!
//! ```
//! use quorum_kit::prelude::*;
//! ```

pub use crate::config::{CoordinatorConfig, Quorum, ReadOptions, WriteOptions};
pub use crate::context::{Dot, VersionVector};
pub use crate::coordinator::runtime::{Coordinator, RequestHandle};
pub use crate::coordinator::{ReadReply, WriteReply};
pub use crate::error::CoordinatorError;
pub use crate::memory::{Behavior, MemoryCluster};
pub use crate::object::{CausalObject, Value};
pub use crate::replica::{Location, ReplicaDirectory, ReplicaService};
pub use crate::Crdt;
