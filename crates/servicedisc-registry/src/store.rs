//! Storage seams for lease-based registries.
//!
//! [`SnapshotStore`] holds the single registry document and supports
//! conditional writes; [`QueueStore`] offers named queues with at-least-once
//! delivery. The in-memory implementations below honour the same contract
//! and can be shared between several connections to model several
//! processes talking to one account.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque version tag of the stored document.
pub type ETag = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Succeeds only if the document still carries this tag
    IfMatch(ETag),
    /// Succeeds only if no document exists yet
    IfNotExists,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Write precondition not met")]
    PreconditionFailed,

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Current document and its tag, `None` if nothing was written yet.
    async fn read(&self) -> StoreResult<Option<(String, ETag)>>;

    /// Replaces the document if `condition` holds and returns the new tag.
    async fn write(&self, document: String, condition: WriteCondition) -> StoreResult<ETag>;
}

/// A received queue message, hidden from other receivers until deleted or
/// until its visibility timeout elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    pub receipt: Uuid,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn send(&self, queue: &str, body: String, ttl: Duration) -> StoreResult<()>;

    /// Next visible message of `queue`, if any.
    async fn receive(&self, queue: &str) -> StoreResult<Option<QueueMessage>>;

    async fn delete(&self, queue: &str, receipt: Uuid) -> StoreResult<()>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    document: Mutex<Option<(String, ETag)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn read(&self) -> StoreResult<Option<(String, ETag)>> {
        Ok(self.document.lock().clone())
    }

    async fn write(&self, document: String, condition: WriteCondition) -> StoreResult<ETag> {
        let mut current = self.document.lock();
        let allowed = match (&condition, current.as_ref()) {
            (WriteCondition::IfNotExists, None) => true,
            (WriteCondition::IfMatch(expected), Some((_, tag))) => expected == tag,
            _ => false,
        };
        if !allowed {
            return Err(StoreError::PreconditionFailed);
        }
        let tag = Uuid::new_v4().to_string();
        *current = Some((document, tag.clone()));
        Ok(tag)
    }
}

#[derive(Debug)]
struct StoredMessage {
    body: String,
    expires_at: Instant,
    visible_at: Instant,
    receipt: Option<Uuid>,
}

/// Queue store kept in memory.
#[derive(Debug)]
pub struct MemoryQueueStore {
    queues: DashMap<String, VecDeque<StoredMessage>>,
    visibility_timeout: Duration,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            visibility_timeout,
        }
    }

    /// Messages currently stored in `queue`, including invisible ones.
    pub fn depth(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn send(&self, queue: &str, body: String, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                body,
                expires_at: now + ttl,
                visible_at: now,
                receipt: None,
            });
        Ok(())
    }

    async fn receive(&self, queue: &str) -> StoreResult<Option<QueueMessage>> {
        let now = Instant::now();
        let mut entry = match self.queues.get_mut(queue) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry.retain(|m| m.expires_at > now);

        let visibility_timeout = self.visibility_timeout;
        Ok(entry.iter_mut().find(|m| m.visible_at <= now).map(|message| {
            let receipt = Uuid::new_v4();
            message.receipt = Some(receipt);
            message.visible_at = now + visibility_timeout;
            QueueMessage {
                body: message.body.clone(),
                receipt,
            }
        }))
    }

    async fn delete(&self, queue: &str, receipt: Uuid) -> StoreResult<()> {
        if let Some(mut entry) = self.queues.get_mut(queue) {
            entry.retain(|m| m.receipt != Some(receipt));
        }
        Ok(())
    }
}
