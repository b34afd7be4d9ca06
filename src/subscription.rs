//! Per-connection subscription registry.
//!
//! Every active subscription owns exactly one streaming task. The task pulls
//! the container's log stream through the demultiplexer and forwards records
//! to the connection's outbound queue until it is cancelled, the stream ends,
//! or the queue is closed.
//!
//! The registry lock is never held across runtime calls or channel sends.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::StreamExt;
use tokio::{
    sync::{Mutex, mpsc::Sender},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    demux::demux,
    protocol::ServerMessage,
    runtime::{ContainerRuntime, RuntimeError},
};

pub type EventSender = Sender<ServerMessage>;

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("subscription limit reached ({0})")]
    LimitReached(usize),
    #[error("connection is closing")]
    Closed,
    #[error("failed to inspect container: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscribed {
    Started,
    AlreadyActive,
}

struct Subscription {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Subscription>,
    // Includes tasks that were unsubscribed but are still winding down.
    tasks: JoinSet<()>,
    closed: bool,
}

impl Registry {
    fn reap_finished(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                log::error!("Streaming task failed: {e}");
            }
        }
    }
}

pub struct SubscriptionManager {
    runtime: Arc<dyn ContainerRuntime>,
    events: EventSender,
    max_subscriptions: usize,
    connection: CancellationToken,
    registry: Arc<Mutex<Registry>>,
    next_generation: AtomicU64,
}

impl SubscriptionManager {
    /// `connection` is the parent of every subscription's token: cancelling
    /// it stops all streaming tasks of this manager.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: EventSender,
        max_subscriptions: usize,
        connection: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            events,
            max_subscriptions,
            connection,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_generation: AtomicU64::new(0),
        }
    }

    fn admit(
        &self,
        registry: &Registry,
        container_id: &str,
    ) -> Result<Option<Subscribed>, SubscribeError> {
        if registry.closed {
            return Err(SubscribeError::Closed);
        }
        if registry.active.contains_key(container_id) {
            return Ok(Some(Subscribed::AlreadyActive));
        }
        if registry.active.len() >= self.max_subscriptions {
            return Err(SubscribeError::LimitReached(self.max_subscriptions));
        }
        Ok(None)
    }

    /// Starts streaming `container_id`. Subscribing to a container that is
    /// already streaming on this connection is a no-op.
    pub async fn subscribe(&self, container_id: &str) -> Result<Subscribed, SubscribeError> {
        {
            let registry = self.registry.lock().await;
            if let Some(subscribed) = self.admit(&registry, container_id)? {
                return Ok(subscribed);
            }
        }

        if !self.runtime.exists(container_id).await? {
            return Err(SubscribeError::NotFound(container_id.to_string()));
        }

        let mut registry = self.registry.lock().await;
        // Someone may have registered the container while the lock was released
        if let Some(subscribed) = self.admit(&registry, container_id)? {
            return Ok(subscribed);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.connection.child_token();

        registry.active.insert(
            container_id.to_string(),
            Subscription {
                generation,
                cancel: cancel.clone(),
            },
        );

        let task = StreamTask {
            container_id: container_id.to_string(),
            generation,
            cancel,
            runtime: Arc::clone(&self.runtime),
            events: self.events.clone(),
            registry: Arc::clone(&self.registry),
        };
        registry.tasks.spawn(task.run());
        registry.reap_finished();

        log::info!("Subscribed to logs of container {container_id}");
        Ok(Subscribed::Started)
    }

    /// Cancels the subscription without waiting for its task to exit.
    /// Returns false when there was nothing to cancel.
    pub async fn unsubscribe(&self, container_id: &str) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.active.remove(container_id) {
            Some(subscription) => {
                subscription.cancel.cancel();
                log::info!("Unsubscribed from logs of container {container_id}");
                true
            }
            None => false,
        }
    }

    /// Cancels every subscription and waits for all streaming tasks to exit.
    /// Later subscribe calls fail with [`SubscribeError::Closed`].
    pub async fn close_all(&self) {
        let mut tasks = {
            let mut registry = self.registry.lock().await;
            registry.closed = true;
            for (_, subscription) in registry.active.drain() {
                subscription.cancel.cancel();
            }
            std::mem::take(&mut registry.tasks)
        };

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                log::error!("Streaming task failed: {e}");
            }
        }
    }

    /// Container ids with an active subscription, sorted.
    pub async fn active(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut ids: Vec<_> = registry.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.active.len()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Cancelled,
    Finished,
    Disconnected,
}

struct StreamTask {
    container_id: String,
    generation: u64,
    cancel: CancellationToken,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventSender,
    registry: Arc<Mutex<Registry>>,
}

impl StreamTask {
    async fn run(self) {
        match self.forward().await {
            Ok(StreamEnd::Cancelled) => {
                log::debug!("Log stream of container {} cancelled", self.container_id);
            }
            Ok(StreamEnd::Finished) => {
                log::info!("Log stream of container {} ended", self.container_id);
            }
            Ok(StreamEnd::Disconnected) => {
                log::debug!(
                    "Outbound queue closed, stopping log stream of container {}",
                    self.container_id
                );
            }
            Err(e) => {
                log::warn!("Log stream of container {} failed: {e}", self.container_id);
            }
        }
        self.release().await;
    }

    async fn forward(&self) -> Result<StreamEnd, RuntimeError> {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            opened = self.runtime.open_log_stream(&self.container_id) => opened,
        };

        let source = match opened {
            Ok(source) => source,
            Err(e) => {
                // Best effort, the client is not guaranteed to see this
                let _ = self
                    .events
                    .try_send(ServerMessage::error(format!("failed to get logs: {e}")));
                return Err(e);
            }
        };

        let mut records = std::pin::pin!(demux(self.container_id.as_str(), source));

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = records.next() => next,
            };

            let record = match next {
                Some(record) => record?,
                None => return Ok(StreamEnd::Finished),
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                sent = self.events.send(record.into()) => {
                    if sent.is_err() {
                        return Ok(StreamEnd::Disconnected);
                    }
                }
            }
        }
    }

    /// Drops the registry entry if it still belongs to this task.
    async fn release(&self) {
        let mut registry = self.registry.lock().await;
        if registry
            .active
            .get(&self.container_id)
            .is_some_and(|subscription| subscription.generation == self.generation)
        {
            registry.active.remove(&self.container_id);
        }
    }
}
