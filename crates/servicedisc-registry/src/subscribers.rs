//! Handler bookkeeping shared by the registry backends.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::connection::MessageHandler;

/// Identifies one handler added through `subscribe` or `consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a handler shares the payloads of its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Receives every payload
    Broadcast,
    /// Receives its turn of the payloads; each payload reaches one consumer
    Compete,
}

/// Handlers attached to one topic.
#[derive(Default)]
pub struct Subscribers {
    broadcast: RwLock<Vec<(SubscriptionId, MessageHandler)>>,
    consumers: RwLock<Vec<(SubscriptionId, MessageHandler)>>,
    cursor: AtomicUsize,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delivery: Delivery, handler: MessageHandler) -> SubscriptionId {
        let id = SubscriptionId::new();
        match delivery {
            Delivery::Broadcast => self.broadcast.write().push((id, handler)),
            Delivery::Compete => self.consumers.write().push((id, handler)),
        }
        id
    }

    /// Removes `id`; returns whether it was attached here.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        for list in [&self.broadcast, &self.consumers] {
            let mut handlers = list.write();
            if let Some(index) = handlers.iter().position(|(existing, _)| *existing == id) {
                handlers.remove(index);
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.broadcast.read().is_empty() && self.consumers.read().is_empty()
    }

    /// Handlers that should see the next payload: every broadcast handler
    /// plus one consumer, taken in rotation.
    pub fn targets(&self) -> Vec<MessageHandler> {
        let mut targets: Vec<MessageHandler> = self.broadcast.read().iter().map(|(_, h)| h.clone()).collect();
        let consumers = self.consumers.read();
        if !consumers.is_empty() {
            let turn = self.cursor.fetch_add(1, Ordering::Relaxed) % consumers.len();
            targets.push(consumers[turn].1.clone());
        }
        targets
    }
}
