//! In-process replica cluster for tests and simulation.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::context::VersionVector;
use crate::object::{CausalObject, Value};
use crate::replica::{
    Location, ReadResult, ReplicaDirectory, ReplicaService, ReplySender, WriteResult,
};
use crate::Crdt;

/// How a simulated replica responds to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Serve every request immediately.
    #[default]
    Healthy,
    /// Drop every request without replying (crashed or partitioned node).
    Unreachable,
    /// Reply to reads with an error and to writes with a nack.
    Failing,
    /// Serve requests, but deliver replies after the given delay.
    Delayed(Duration),
}

enum Command<V> {
    Read {
        key: String,
        reply_to: ReplySender<ReadResult<V>>,
    },
    Write {
        key: String,
        value: Value<V>,
        context: VersionVector,
        reply_to: ReplySender<WriteResult>,
    },
    Repair {
        key: String,
        object: CausalObject<V>,
    },
    Inspect {
        key: String,
        respond: oneshot::Sender<Option<CausalObject<V>>>,
    },
    SetBehavior(Behavior),
}

struct ClusterInner<V> {
    order: Vec<Location>,
    nodes: BTreeMap<Location, mpsc::UnboundedSender<Command<V>>>,
    n_val: usize,
}

/// An in-process cluster of replica actors.
///
/// Acts as both [`ReplicaDirectory`] and [`ReplicaService`]. Every node is a
/// tokio task owning its own object map and processing commands in arrival
/// order. A write is applied with the node's location as the actor, a repair
/// is merged into the stored object. Node behavior can be changed at runtime
/// to simulate crashes, failures and slow replicas.
///
/// Cloning is cheap; clones address the same nodes.
///
/// # Example
///
/// ```
/// use quorum_kit::memory::MemoryCluster;
/// use quorum_kit::replica::ReplicaDirectory;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cluster = MemoryCluster::<u32>::new(5, 3);
/// let replicas = cluster.resolve_replicas("user/42");
/// assert_eq!(replicas.len(), 3);
/// assert_eq!(replicas, cluster.resolve_replicas("user/42"));
/// # }
/// ```
pub struct MemoryCluster<V> {
    inner: Arc<ClusterInner<V>>,
}

impl<V> Clone for MemoryCluster<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Ord + Send + 'static> MemoryCluster<V> {
    /// Spawn `nodes` replica actors named `node-0`, `node-1`, ... and place
    /// every key on `n_val` consecutive nodes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(nodes: usize, n_val: usize) -> Self {
        let order: Vec<Location> = (0..nodes).map(|i| Location::new(format!("node-{i}"))).collect();
        let n_val = n_val.min(order.len());
        let nodes = order
            .iter()
            .map(|location| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_node(location.clone(), rx));
                (location.clone(), tx)
            })
            .collect();

        Self {
            inner: Arc::new(ClusterInner {
                order,
                nodes,
                n_val,
            }),
        }
    }
}

impl<V> MemoryCluster<V> {
    /// Every node, in ring order.
    #[must_use]
    pub fn locations(&self) -> &[Location] {
        &self.inner.order
    }

    /// Change how `location` responds from now on. Returns `false` for an
    /// unknown location.
    pub fn set_behavior(&self, location: &Location, behavior: Behavior) -> bool {
        self.send(location, Command::SetBehavior(behavior))
    }

    /// The object `location` currently stores for `key`.
    ///
    /// Answered in order with the node's other commands, so every request
    /// sent to the node before this call has been applied.
    pub async fn object_at(&self, location: &Location, key: &str) -> Option<CausalObject<V>> {
        let (respond, rx) = oneshot::channel();
        let sent = self.send(
            location,
            Command::Inspect {
                key: key.to_string(),
                respond,
            },
        );
        if !sent {
            return None;
        }
        rx.await.ok().flatten()
    }

    fn send(&self, location: &Location, command: Command<V>) -> bool {
        match self.inner.nodes.get(location) {
            Some(tx) => tx.send(command).is_ok(),
            None => {
                debug!(%location, "no such node");
                false
            }
        }
    }
}

impl<V: Send + 'static> ReplicaDirectory for MemoryCluster<V> {
    fn resolve_replicas(&self, key: &str) -> Vec<Location> {
        let order = &self.inner.order;
        if order.is_empty() {
            return Vec::new();
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let start = (hasher.finish() % order.len() as u64) as usize;
        (0..self.inner.n_val)
            .map(|i| order[(start + i) % order.len()].clone())
            .collect()
    }
}

impl<V: Clone + Ord + Send + Sync + 'static> ReplicaService<V> for MemoryCluster<V> {
    fn read(&self, location: &Location, key: &str, reply_to: ReplySender<ReadResult<V>>) {
        self.send(
            location,
            Command::Read {
                key: key.to_string(),
                reply_to,
            },
        );
    }

    fn write(
        &self,
        location: &Location,
        key: &str,
        value: Value<V>,
        context: VersionVector,
        reply_to: ReplySender<WriteResult>,
    ) {
        self.send(
            location,
            Command::Write {
                key: key.to_string(),
                value,
                context,
                reply_to,
            },
        );
    }

    fn repair(&self, location: &Location, key: &str, object: CausalObject<V>) {
        self.send(
            location,
            Command::Repair {
                key: key.to_string(),
                object,
            },
        );
    }
}

fn respond<R: Send + 'static>(behavior: Behavior, reply_to: ReplySender<R>, location: Location, result: R) {
    match behavior {
        Behavior::Delayed(delay) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                reply_to.send(location, result);
            });
        }
        _ => {
            reply_to.send(location, result);
        }
    }
}

async fn run_node<V: Clone + Ord + Send + 'static>(
    location: Location,
    mut commands: mpsc::UnboundedReceiver<Command<V>>,
) {
    let mut objects: BTreeMap<String, CausalObject<V>> = BTreeMap::new();
    let mut behavior = Behavior::Healthy;

    while let Some(command) = commands.recv().await {
        match command {
            Command::SetBehavior(next) => {
                debug!(%location, ?next, "behavior changed");
                behavior = next;
            }
            Command::Inspect { key, respond } => {
                let _ = respond.send(objects.get(&key).cloned());
            }
            _ if behavior == Behavior::Unreachable => {}
            Command::Read { key, reply_to } => {
                let result = match (behavior, objects.get(&key)) {
                    (Behavior::Failing, _) => ReadResult::Error("simulated failure".into()),
                    (_, Some(obj)) => ReadResult::Found(obj.clone()),
                    (_, None) => ReadResult::NotFound,
                };
                respond(behavior, reply_to, location.clone(), result);
            }
            Command::Write {
                key,
                value,
                context,
                reply_to,
            } => {
                let result = if behavior == Behavior::Failing {
                    WriteResult::Nack("simulated failure".into())
                } else {
                    let obj = objects.entry(key).or_default();
                    let dot = obj.apply_write(location.as_str(), value, &context);
                    debug!(%location, %dot, "applied write");
                    WriteResult::Ack
                };
                respond(behavior, reply_to, location.clone(), result);
            }
            Command::Repair { key, object } => {
                if behavior != Behavior::Failing {
                    objects.entry(key).or_default().merge(&object);
                    debug!(%location, "applied repair");
                }
            }
        }
    }
}
