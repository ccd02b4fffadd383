//! Tokio driver for the coordinator state machines.
//!
//! Each request runs as its own task with a private mailbox. Replica replies
//! and deadline expiries are turned into [`Event`]s and fed to the state
//! machine one at a time, so no locking is needed. A supervising task watches
//! every coordinator: a panic or protocol violation ends that request only
//! and surfaces to its client as an error.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, Instrument};

use super::{
    Deadline, Event, Phase, ReadEffect, ReadFsm, ReadReply, ReadRequest, WriteEffect, WriteFsm,
    WriteReply, WriteRequest,
};
use crate::config::{CoordinatorConfig, ReadOptions, WriteOptions};
use crate::context::VersionVector;
use crate::error::{ConfigError, CoordinatorError};
use crate::object::Value;
use crate::replica::{
    Location, ReadResult, ReplicaDirectory, ReplicaReply, ReplicaService, ReplySender, RequestId,
    RequestIdGenerator, WriteResult,
};

/// Client side of an in-flight request.
///
/// The reply arrives once; the coordinator task may keep running afterwards
/// to collect stragglers and repair replicas.
#[derive(Debug)]
pub struct RequestHandle<T> {
    request_id: RequestId,
    reply: Option<oneshot::Receiver<T>>,
    task: JoinHandle<Result<(), CoordinatorError>>,
}

impl<T> RequestHandle<T> {
    /// The id the coordinator tags replica traffic with.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the client reply.
    pub async fn reply(&mut self) -> Result<T, CoordinatorError> {
        let rx = self
            .reply
            .take()
            .ok_or(CoordinatorError::ReplyTaken(self.request_id))?;
        rx.await.map_err(|_| CoordinatorError::Crashed(self.request_id))
    }

    /// Wait until the coordinator has terminated, repairs included.
    pub async fn finished(self) -> Result<(), CoordinatorError> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::Crashed(self.request_id)),
        }
    }
}

struct Shared<D, S> {
    directory: D,
    service: S,
    config: CoordinatorConfig,
    ids: RequestIdGenerator,
}

/// Entry point for client operations: creates one supervised coordinator per
/// request.
///
/// # Example
///
/// ```
/// use quorum_kit::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), CoordinatorError> {
/// let cluster = MemoryCluster::<String>::new(5, 3);
/// let coordinator = Coordinator::new(cluster.clone(), cluster, CoordinatorConfig::default())?;
///
/// let ctx = VersionVector::new();
/// assert_eq!(coordinator.put("k", "v".to_string(), ctx).await?, WriteReply::Ok);
///
/// match coordinator.get("k").await? {
///     ReadReply::Ok { values, .. } => assert_eq!(values, vec!["v".to_string()]),
///     other => panic!("unexpected {other:?}"),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<V, D, S> {
    shared: Arc<Shared<D, S>>,
    _value: PhantomData<fn() -> V>,
}

impl<V, D, S> Clone for Coordinator<V, D, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _value: PhantomData,
        }
    }
}

impl<V, D, S> Coordinator<V, D, S>
where
    V: Clone + Ord + Debug + Send + Sync + 'static,
    D: ReplicaDirectory,
    S: ReplicaService<V>,
{
    /// Create a coordinator family over a directory and a replica service.
    pub fn new(directory: D, service: S, config: CoordinatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                directory,
                service,
                config,
                ids: RequestIdGenerator::new(),
            }),
            _value: PhantomData,
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// The replica directory.
    #[must_use]
    pub fn directory(&self) -> &D {
        &self.shared.directory
    }

    /// The replica service.
    #[must_use]
    pub fn service(&self) -> &S {
        &self.shared.service
    }

    fn replicas(&self, key: &str) -> Vec<Location> {
        let mut replicas = self.shared.directory.resolve_replicas(key);
        replicas.truncate(self.shared.config.n_val);
        replicas
    }

    /// Read `key` with the default options.
    pub async fn get(&self, key: &str) -> Result<ReadReply<V>, CoordinatorError> {
        self.get_with(key, self.shared.config.read.clone()).await
    }

    /// Read `key` with explicit options.
    pub async fn get_with(&self, key: &str, options: ReadOptions) -> Result<ReadReply<V>, CoordinatorError> {
        self.spawn_read(key, options)?.reply().await
    }

    /// Write `value` for `key`, superseding what `context` observed.
    pub async fn put(&self, key: &str, value: V, context: VersionVector) -> Result<WriteReply, CoordinatorError> {
        self.put_with(key, value, context, self.shared.config.write.clone())
            .await
    }

    /// Write with explicit options.
    pub async fn put_with(
        &self,
        key: &str,
        value: V,
        context: VersionVector,
        options: WriteOptions,
    ) -> Result<WriteReply, CoordinatorError> {
        self.spawn_write(key, Value::Live(value), context, options)?
            .reply()
            .await
    }

    /// Delete `key` by writing a tombstone that supersedes `context`.
    pub async fn delete(&self, key: &str, context: VersionVector) -> Result<WriteReply, CoordinatorError> {
        self.spawn_write(key, Value::Tombstone, context, self.shared.config.write.clone())?
            .reply()
            .await
    }

    /// Start a read coordinator and return its handle without waiting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_read(&self, key: &str, options: ReadOptions) -> Result<RequestHandle<ReadReply<V>>, CoordinatorError> {
        let r = options.validate(self.shared.config.n_val)?;
        let request_id = self.shared.ids.next_id();
        let mut fsm = ReadFsm::new(ReadRequest {
            request_id,
            key: key.to_string(),
            r,
            read_repair: options.read_repair,
            return_value: options.return_value,
        });
        let effects = fsm.execute(self.replicas(key))?;

        let (tx, mailbox) = mpsc::unbounded_channel();
        let (client, reply) = oneshot::channel();
        let driver = ReadDriver {
            shared: Arc::clone(&self.shared),
            key: key.to_string(),
            fsm,
            mailbox,
            reply_to: ReplySender::new(request_id, tx),
            client: Some(client),
            options,
        };
        let span = info_span!("read", %request_id, key);
        let task = supervise(request_id, "read", driver.run(effects).instrument(span));

        Ok(RequestHandle {
            request_id,
            reply: Some(reply),
            task,
        })
    }

    /// Start a write coordinator and return its handle without waiting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_write(
        &self,
        key: &str,
        value: Value<V>,
        context: VersionVector,
        options: WriteOptions,
    ) -> Result<RequestHandle<WriteReply>, CoordinatorError> {
        let w = options.validate(self.shared.config.n_val)?;
        let request_id = self.shared.ids.next_id();
        let op = if value.is_tombstone() { "delete" } else { "put" };
        let mut fsm = WriteFsm::new(WriteRequest {
            request_id,
            key: key.to_string(),
            value,
            context,
            w,
        });
        let effects = fsm.execute(self.replicas(key))?;

        let (tx, mailbox) = mpsc::unbounded_channel();
        let (client, reply) = oneshot::channel();
        let driver = WriteDriver {
            shared: Arc::clone(&self.shared),
            key: key.to_string(),
            fsm,
            mailbox,
            reply_to: ReplySender::new(request_id, tx),
            client: Some(client),
            options,
        };
        let span = info_span!("write", %request_id, key, op);
        let task = supervise(request_id, op, driver.run(effects).instrument(span));

        Ok(RequestHandle {
            request_id,
            reply: Some(reply),
            task,
        })
    }
}

/// Run `coordinator` in its own task and contain its failure.
fn supervise<F>(request_id: RequestId, op: &'static str, coordinator: F) -> JoinHandle<Result<(), CoordinatorError>>
where
    F: Future<Output = Result<(), CoordinatorError>> + Send + 'static,
{
    let worker = tokio::spawn(coordinator);
    tokio::spawn(async move {
        match worker.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(%request_id, op, error = %e, "coordinator terminated abnormally");
                Err(e)
            }
            Err(e) => {
                error!(%request_id, op, panicked = e.is_panic(), "coordinator task died");
                Err(CoordinatorError::Crashed(request_id))
            }
        }
    })
}

/// Pick the deadline that applies in `phase`. The completion deadline starts
/// counting the first time it is asked for.
fn deadline_for(
    phase: Phase,
    primary: Instant,
    completion: &mut Option<Instant>,
    completion_after: std::time::Duration,
) -> Option<(Instant, Deadline)> {
    match phase {
        Phase::Waiting => Some((primary, Deadline::Primary)),
        Phase::Completing => {
            let at = *completion.get_or_insert_with(|| Instant::now() + completion_after);
            Some((at, Deadline::Completion))
        }
        Phase::Execute | Phase::Finalize | Phase::Terminated => None,
    }
}

/// Receive the next event: a reply if one is queued, otherwise whichever of
/// a reply or the deadline comes first.
async fn next_event<R>(
    mailbox: &mut mpsc::UnboundedReceiver<ReplicaReply<R>>,
    at: Instant,
    deadline: Deadline,
) -> Event<R> {
    tokio::select! {
        biased;
        Some(reply) = mailbox.recv() => Event::Reply(reply),
        () = sleep_until(at) => Event::Timeout(deadline),
    }
}

struct ReadDriver<V, D, S> {
    shared: Arc<Shared<D, S>>,
    key: String,
    fsm: ReadFsm<V>,
    mailbox: mpsc::UnboundedReceiver<ReplicaReply<ReadResult<V>>>,
    /// Keeps the mailbox open until termination.
    reply_to: ReplySender<ReadResult<V>>,
    client: Option<oneshot::Sender<ReadReply<V>>>,
    options: ReadOptions,
}

impl<V, D, S> ReadDriver<V, D, S>
where
    V: Clone + Ord + Debug + Send + Sync + 'static,
    D: ReplicaDirectory,
    S: ReplicaService<V>,
{
    async fn run(mut self, effects: Vec<ReadEffect<V>>) -> Result<(), CoordinatorError> {
        self.apply(effects);
        let primary = Instant::now() + self.options.timeout;
        let mut completion = None;

        while let Some((at, deadline)) =
            deadline_for(self.fsm.phase(), primary, &mut completion, self.options.repair_timeout)
        {
            let event = next_event(&mut self.mailbox, at, deadline).await;
            let effects = self.fsm.handle(event)?;
            self.apply(effects);
        }
        Ok(())
    }

    fn apply(&mut self, effects: Vec<ReadEffect<V>>) {
        for effect in effects {
            match effect {
                ReadEffect::Dispatch(locations) => {
                    debug!(replicas = locations.len(), "dispatching reads");
                    for location in &locations {
                        self.shared
                            .service
                            .read(location, &self.key, self.reply_to.clone());
                    }
                }
                ReadEffect::Reply(reply) => {
                    if let Some(client) = self.client.take() {
                        info!(outcome = read_outcome(&reply), "answering client");
                        if client.send(reply).is_err() {
                            debug!("client stopped waiting");
                        }
                    }
                }
                ReadEffect::Repair { location, object } => {
                    info!(%location, "repairing stale replica");
                    self.shared.service.repair(&location, &self.key, object);
                }
            }
        }
    }
}

fn read_outcome<V>(reply: &ReadReply<V>) -> &'static str {
    match reply {
        ReadReply::Ok { .. } => "ok",
        ReadReply::NotFound { .. } => "not_found",
        ReadReply::Acknowledged => "acknowledged",
        ReadReply::Timeout => "timeout",
    }
}

struct WriteDriver<V, D, S> {
    shared: Arc<Shared<D, S>>,
    key: String,
    fsm: WriteFsm<V>,
    mailbox: mpsc::UnboundedReceiver<ReplicaReply<WriteResult>>,
    /// Keeps the mailbox open until termination.
    reply_to: ReplySender<WriteResult>,
    client: Option<oneshot::Sender<WriteReply>>,
    options: WriteOptions,
}

impl<V, D, S> WriteDriver<V, D, S>
where
    V: Clone + Ord + Debug + Send + Sync + 'static,
    D: ReplicaDirectory,
    S: ReplicaService<V>,
{
    async fn run(mut self, effects: Vec<WriteEffect<V>>) -> Result<(), CoordinatorError> {
        self.apply(effects);
        let primary = Instant::now() + self.options.timeout;
        let mut completion = None;

        while let Some((at, deadline)) = deadline_for(
            self.fsm.phase(),
            primary,
            &mut completion,
            self.options.completion_timeout,
        ) {
            let event = next_event(&mut self.mailbox, at, deadline).await;
            let effects = self.fsm.handle(event)?;
            self.apply(effects);
        }
        Ok(())
    }

    fn apply(&mut self, effects: Vec<WriteEffect<V>>) {
        for effect in effects {
            match effect {
                WriteEffect::Dispatch {
                    locations,
                    value,
                    context,
                } => {
                    debug!(replicas = locations.len(), "dispatching writes");
                    for location in &locations {
                        self.shared.service.write(
                            location,
                            &self.key,
                            value.clone(),
                            context.clone(),
                            self.reply_to.clone(),
                        );
                    }
                }
                WriteEffect::Reply(reply) => {
                    if let Some(client) = self.client.take() {
                        info!(?reply, "answering client");
                        if client.send(reply).is_err() {
                            debug!("client stopped waiting");
                        }
                    }
                }
            }
        }
    }
}
