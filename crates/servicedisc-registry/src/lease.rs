//! Lease-based registry backend
//!
//! Descriptors live in one shared document inside a [`SnapshotStore`]. Each
//! descriptor carries an `expire_at` lease that the owning connection keeps
//! pushing forward; a descriptor whose owner died stops being renewed and is
//! treated as dead once the lease passes.
//!
//! # Concurrency
//!
//! Every change is a read-modify-write guarded by the document's ETag. A lost
//! race re-reads and retries, up to `max_write_attempts` times, before the
//! operation fails with `RegistryUnavailable`.
//!
//! # Background work
//!
//! - one renewal task, ticking every `lease_duration / 2`
//! - one listener task per subscribed queue, handling one message at a time
//!
//! A listener stops as soon as its queue has no handlers left, leaving
//! further messages to other connections. All tasks hang off the
//! connection's [`CancellationToken`]; [`RegistryConnection::shutdown`]
//! cancels and joins them.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use servicedisc_common::protocol::{RegistrySnapshot, Result, ServiceDescriptor, ServiceDiscError};
use servicedisc_common::queue_name;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{MessageHandler, RegistryConnection};
use crate::store::{QueueStore, SnapshotStore, StoreError, WriteCondition};
use crate::subscribers::{Delivery, Subscribers, SubscriptionId};

/// Lease backend configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Validity of a registration; renewal runs every half of it
    ///
    /// Default: 2 minutes
    pub lease_duration: Duration,
    /// Conditional write attempts before giving up
    ///
    /// Default: 100
    pub max_write_attempts: usize,
    /// Pause of a queue listener after finding its queue empty
    ///
    /// Default: 10 seconds
    pub message_poll_delay: Duration,
    /// Time-to-live of published messages
    ///
    /// Default: 60 seconds
    pub message_ttl: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(120),
            max_write_attempts: 100,
            message_poll_delay: Duration::from_secs(10),
            message_ttl: Duration::from_secs(60),
        }
    }
}

impl LeaseConfig {
    pub fn renew_interval(&self) -> Duration {
        self.lease_duration / 2
    }
}

struct Listener {
    subscribers: Arc<Subscribers>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct LeaseState {
    snapshots: Arc<dyn SnapshotStore>,
    queues: Arc<dyn QueueStore>,
    config: LeaseConfig,
    /// Descriptors registered through this connection
    owned: DashMap<Uuid, ServiceDescriptor>,
    /// Serializes this connection's own writes so a renewal cannot
    /// resurrect a descriptor unregistered while it was in flight
    writes: tokio::sync::Mutex<()>,
}

impl LeaseState {
    fn lease_deadline(&self) -> chrono::DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        Utc::now() + lease
    }

    async fn read_snapshot(&self) -> Result<Option<(RegistrySnapshot, String)>> {
        let stored = self.snapshots.read().await.map_err(store_unavailable)?;
        match stored {
            Some((document, etag)) => {
                let snapshot = serde_json::from_str(&document).map_err(|e| {
                    ServiceDiscError::RegistryUnavailable(format!("corrupt registry document: {}", e))
                })?;
                Ok(Some((snapshot, etag)))
            }
            None => Ok(None),
        }
    }

    /// Applies `change` under optimistic concurrency.
    ///
    /// `change` returns whether it modified the snapshot; unchanged snapshots
    /// are not written back.
    async fn modify<F>(&self, mut change: F) -> Result<RegistrySnapshot>
    where
        F: FnMut(&mut RegistrySnapshot) -> Result<bool> + Send,
    {
        for attempt in 1..=self.config.max_write_attempts {
            let (mut snapshot, condition) = match self.read_snapshot().await? {
                Some((snapshot, etag)) => (snapshot, WriteCondition::IfMatch(etag)),
                None => (RegistrySnapshot::default(), WriteCondition::IfNotExists),
            };

            if !change(&mut snapshot)? {
                return Ok(snapshot);
            }

            let document = serde_json::to_string(&snapshot)?;
            match self.snapshots.write(document, condition).await {
                Ok(_) => return Ok(snapshot),
                Err(StoreError::PreconditionFailed) => {
                    debug!("Registry write lost a race (attempt {}), retrying", attempt);
                }
                Err(e) => return Err(store_unavailable(e)),
            }
        }

        Err(ServiceDiscError::RegistryUnavailable(format!(
            "gave up after {} conflicting writes",
            self.config.max_write_attempts
        )))
    }

    async fn initialize(&self) -> Result<()> {
        if self.read_snapshot().await?.is_none() {
            let document = serde_json::to_string(&RegistrySnapshot::default())?;
            match self.snapshots.write(document, WriteCondition::IfNotExists).await {
                // someone else created it first
                Ok(_) | Err(StoreError::PreconditionFailed) => {}
                Err(e) => return Err(store_unavailable(e)),
            }
            return Ok(());
        }

        let now = Utc::now();
        let snapshot = self
            .modify(|snapshot| Ok(!snapshot.remove_expired(now).is_empty()))
            .await?;
        debug!("Registry loaded with {} live services", snapshot.len());
        Ok(())
    }

    async fn renew(&self) -> Result<()> {
        let _guard = self.writes.lock().await;
        if self.owned.is_empty() {
            return Ok(());
        }
        let expire_at = self.lease_deadline();
        let owned: Vec<ServiceDescriptor> = self.owned.iter().map(|e| e.value().clone()).collect();

        self.modify(|snapshot| {
            for descriptor in &owned {
                let mut renewed = descriptor.clone();
                renewed.expire_at = Some(expire_at);
                snapshot.upsert(renewed);
            }
            Ok(true)
        })
        .await?;

        for mut entry in self.owned.iter_mut() {
            entry.value_mut().expire_at = Some(expire_at);
        }
        debug!("Renewed {} leases until {}", owned.len(), expire_at);
        Ok(())
    }
}

fn store_unavailable(err: StoreError) -> ServiceDiscError {
    ServiceDiscError::RegistryUnavailable(err.to_string())
}

/// Registry connection backed by a conditional-write document store and a
/// queue store.
pub struct LeaseConnection {
    state: Arc<LeaseState>,
    listeners: DashMap<String, Listener>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LeaseConnection {
    /// Connects with default configuration.
    pub async fn connect(
        snapshots: Arc<dyn SnapshotStore>,
        queues: Arc<dyn QueueStore>,
    ) -> Result<Self> {
        Self::with_config(snapshots, queues, LeaseConfig::default()).await
    }

    /// Connects and starts lease renewal.
    ///
    /// Creates the registry document if it does not exist yet, otherwise
    /// removes every descriptor whose lease already ran out.
    pub async fn with_config(
        snapshots: Arc<dyn SnapshotStore>,
        queues: Arc<dyn QueueStore>,
        config: LeaseConfig,
    ) -> Result<Self> {
        if config.lease_duration.is_zero() || config.max_write_attempts == 0 {
            return Err(ServiceDiscError::Config(
                "lease duration and write attempts must be non-zero".to_string(),
            ));
        }

        let state = Arc::new(LeaseState {
            snapshots,
            queues,
            config,
            owned: DashMap::new(),
            writes: tokio::sync::Mutex::new(()),
        });
        state.initialize().await?;

        let connection = Self {
            state,
            listeners: DashMap::new(),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        let renewal = connection.spawn_renewal();
        connection.tasks.lock().push(renewal);

        info!(
            "Lease registry connected (lease {:?}, renew every {:?})",
            connection.state.config.lease_duration,
            connection.state.config.renew_interval()
        );
        Ok(connection)
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.state.config
    }

    /// Ids of the descriptors this connection keeps alive.
    pub fn owned_ids(&self) -> Vec<Uuid> {
        self.state.owned.iter().map(|e| *e.key()).collect()
    }

    fn spawn_renewal(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let period = state.config.renew_interval();
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = state.renew() => {
                        if let Err(e) = result {
                            warn!("Lease renewal failed: {}", e);
                        }
                    }
                }
            }
            debug!("Lease renewal stopped");
        })
    }

    /// Number of queues this connection is currently polling.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn spawn_listener(&self, queue: String, subscribers: Arc<Subscribers>) -> Listener {
        let state = self.state.clone();
        let token = self.token.child_token();
        let handlers = subscribers.clone();
        let listener_token = token.clone();

        let task = tokio::spawn(async move {
            let token = listener_token;
            let delay = state.config.message_poll_delay;
            loop {
                if token.is_cancelled() {
                    break;
                }
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    received = state.queues.receive(&queue) => received,
                };

                match received {
                    Ok(Some(message)) => {
                        let targets = handlers.targets();
                        if targets.is_empty() {
                            // left to reappear for another consumer
                            break;
                        }
                        for handler in targets {
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = handler(message.body.clone()) => {}
                            }
                        }
                        if let Err(e) = state.queues.delete(&queue, message.receipt).await {
                            warn!("Failed to delete message from {}: {}", queue, e);
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        error!("Receiving from queue {} failed: {}", queue, e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            debug!("Listener for queue {} stopped", queue);
        });

        Listener {
            subscribers,
            token,
            task,
        }
    }

    fn attach(&self, topic: &str, delivery: Delivery, handler: MessageHandler) -> Result<SubscriptionId> {
        if self.token.is_cancelled() {
            return Err(ServiceDiscError::RegistryUnavailable(
                "connection is shut down".to_string(),
            ));
        }
        let queue = queue_name(topic);
        match self.listeners.entry(queue.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().subscribers.add(delivery, handler)),
            Entry::Vacant(slot) => {
                let subscribers = Arc::new(Subscribers::new());
                let id = subscribers.add(delivery, handler);
                debug!("Listening on queue {}", queue);
                slot.insert(self.spawn_listener(queue, subscribers));
                Ok(id)
            }
        }
    }
}

#[async_trait]
impl RegistryConnection for LeaseConnection {
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<ServiceDescriptor> {
        let _guard = self.state.writes.lock().await;
        let mut stored = descriptor;
        self.state
            .modify(|snapshot| {
                if snapshot.contains(&stored.id) {
                    return Err(ServiceDiscError::Conflict(stored.id));
                }
                stored.expire_at = Some(self.state.lease_deadline());
                snapshot.upsert(stored.clone());
                Ok(true)
            })
            .await?;

        self.state.owned.insert(stored.id, stored.clone());
        info!("Registered {} until {:?}", stored, stored.expire_at);
        Ok(stored)
    }

    async fn unregister(&self, id: Uuid) -> Result<()> {
        let _guard = self.state.writes.lock().await;
        self.state.owned.remove(&id);
        self.state
            .modify(|snapshot| Ok(snapshot.remove(&id)))
            .await?;
        debug!("Unregistered service {}", id);
        Ok(())
    }

    async fn list_snapshot(&self) -> Result<RegistrySnapshot> {
        Ok(self
            .state
            .read_snapshot()
            .await?
            .map(|(snapshot, _)| snapshot)
            .unwrap_or_default())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let queue = queue_name(topic);
        self.state
            .queues
            .send(&queue, payload, self.state.config.message_ttl)
            .await
            .map_err(store_unavailable)
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        self.attach(topic, Delivery::Broadcast, handler)
    }

    async fn consume(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        self.attach(topic, Delivery::Compete, handler)
    }

    async fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) -> Result<()> {
        let queue = queue_name(topic);
        if let Entry::Occupied(entry) = self.listeners.entry(queue.clone()) {
            entry.get().subscribers.remove(subscription);
            if entry.get().subscribers.is_empty() {
                let listener = entry.remove();
                listener.token.cancel();
                debug!("Stopped listening on queue {}", queue);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        let mut tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let queues: Vec<String> = self.listeners.iter().map(|entry| entry.key().clone()).collect();
        for queue in queues {
            if let Some((_, listener)) = self.listeners.remove(&queue) {
                tasks.push(listener.task);
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Registry background task ended abnormally: {}", e);
            }
        }
        info!("Lease registry connection shut down");
        Ok(())
    }
}

impl Drop for LeaseConnection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
