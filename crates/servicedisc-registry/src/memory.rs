//! In-process registry backend.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use servicedisc_common::protocol::{RegistrySnapshot, Result, ServiceDescriptor, ServiceDiscError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::{MessageHandler, RegistryConnection};
use crate::subscribers::{Delivery, Subscribers, SubscriptionId};

struct Topic {
    sender: mpsc::UnboundedSender<String>,
    subscribers: Arc<Subscribers>,
    worker: JoinHandle<()>,
}

/// Registry kept in memory, shared by everything holding the same instance.
///
/// Each topic gets one delivery task, so payloads on a topic reach its
/// handlers one after another while different topics progress
/// independently. Payloads published on a topic without handlers are
/// dropped, and a topic whose last handler unsubscribed is torn down.
pub struct InMemoryConnection {
    services: DashMap<Uuid, ServiceDescriptor>,
    topics: DashMap<String, Topic>,
    token: CancellationToken,
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            topics: DashMap::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of topics that currently have a delivery task.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn spawn_topic(&self, topic: &str) -> Topic {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let subscribers = Arc::new(Subscribers::new());
        let worker_subscribers = subscribers.clone();
        let token = self.token.clone();
        let name = topic.to_string();

        let worker = tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = token.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(payload) => payload,
                        None => break,
                    },
                };
                for handler in worker_subscribers.targets() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = handler(payload.clone()) => {}
                    }
                }
            }
            debug!("Delivery task for topic {} stopped", name);
        });

        Topic {
            sender,
            subscribers,
            worker,
        }
    }

    fn attach(&self, topic: &str, delivery: Delivery, handler: MessageHandler) -> Result<SubscriptionId> {
        if self.token.is_cancelled() {
            return Err(ServiceDiscError::RegistryUnavailable(
                "connection is shut down".to_string(),
            ));
        }
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| self.spawn_topic(topic));
        Ok(entry.subscribers.add(delivery, handler))
    }
}

impl Default for InMemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryConnection for InMemoryConnection {
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<ServiceDescriptor> {
        match self.services.entry(descriptor.id) {
            Entry::Occupied(_) => Err(ServiceDiscError::Conflict(descriptor.id)),
            Entry::Vacant(slot) => {
                slot.insert(descriptor.clone());
                debug!("Registered {}", descriptor);
                Ok(descriptor)
            }
        }
    }

    async fn unregister(&self, id: Uuid) -> Result<()> {
        if self.services.remove(&id).is_some() {
            debug!("Unregistered service {}", id);
        }
        Ok(())
    }

    async fn list_snapshot(&self) -> Result<RegistrySnapshot> {
        Ok(self.services.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        match self.topics.get(topic) {
            Some(entry) => {
                // a closed channel means shutdown already ran
                let _ = entry.sender.send(payload);
            }
            None => debug!("No subscribers on topic {}, dropping payload", topic),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        self.attach(topic, Delivery::Broadcast, handler)
    }

    async fn consume(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        self.attach(topic, Delivery::Compete, handler)
    }

    async fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) -> Result<()> {
        if let Entry::Occupied(entry) = self.topics.entry(topic.to_string()) {
            entry.get().subscribers.remove(subscription);
            if entry.get().subscribers.is_empty() {
                // dropping the sender lets the worker drain and stop
                entry.remove();
                debug!("Topic {} has no subscribers left", topic);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.token.cancel();
        let names: Vec<String> = self.topics.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            if let Some((_, topic)) = self.topics.remove(&name) {
                let _ = topic.worker.await;
            }
        }
        info!("In-memory registry connection shut down");
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::message_handler;
    use servicedisc_common::protocol::HostKind;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn descriptor(interface: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(interface, None, HostKind::Http, "http://localhost:5000/")
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let connection = InMemoryConnection::new();
        let a = connection.register(descriptor("demo.A")).await.unwrap();
        let b = connection.register(descriptor("demo.B")).await.unwrap();

        let snapshot = connection.list_snapshot().await.unwrap();
        let ids: HashSet<Uuid> = snapshot.iter().map(|d| d.id).collect();
        assert_eq!(ids, HashSet::from([a.id, b.id]));
    }

    #[tokio::test]
    async fn test_unregister_removes_only_that_id() {
        let connection = InMemoryConnection::new();
        let a = connection.register(descriptor("demo.A")).await.unwrap();
        let b = connection.register(descriptor("demo.A")).await.unwrap();

        connection.unregister(a.id).await.unwrap();
        let snapshot = connection.list_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains(&b.id));

        // absent ids are a no-op
        connection.unregister(a.id).await.unwrap();
        connection.unregister(Uuid::new_v4()).await.unwrap();
        assert_eq!(connection.service_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts() {
        let connection = InMemoryConnection::new();
        let a = connection.register(descriptor("demo.A")).await.unwrap();
        match connection.register(a.clone()).await {
            Err(ServiceDiscError::Conflict(id)) => assert_eq!(id, a.id),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations() {
        let connection = Arc::new(InMemoryConnection::new());
        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let connection = connection.clone();
                tokio::spawn(async move { connection.register(descriptor("demo.A")).await })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in futures::future::join_all(tasks).await {
            ids.insert(task.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 100);
        assert_eq!(connection.list_snapshot().await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_in_order() {
        let connection = InMemoryConnection::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for subscriber in 0..2 {
            let tx = tx.clone();
            connection
                .subscribe(
                    "demo.Message",
                    message_handler(move |payload| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send((subscriber, payload));
                        }
                    }),
                )
                .await
                .unwrap();
        }

        connection.publish("demo.Message", "one".into()).await.unwrap();
        connection.publish("demo.Message", "two".into()).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            received,
            vec![
                (0, "one".to_string()),
                (1, "one".to_string()),
                (0, "two".to_string()),
                (1, "two".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_consumers_share_payloads() {
        let connection = InMemoryConnection::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for consumer in 0..2 {
            let tx = tx.clone();
            connection
                .consume(
                    "demo-qsh",
                    message_handler(move |payload| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send((consumer, payload));
                        }
                    }),
                )
                .await
                .unwrap();
        }

        for n in 0..4 {
            connection.publish("demo-qsh", n.to_string()).await.unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "each payload goes to one consumer");

        let payloads: HashSet<String> = received.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(payloads.len(), 4);
        assert_eq!(received.iter().filter(|(c, _)| *c == 0).count(), 2);
        assert_eq!(received.iter().filter(|(c, _)| *c == 1).count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let connection = InMemoryConnection::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler = message_handler(move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let first = connection.consume("topic", handler.clone()).await.unwrap();
        let second = connection.subscribe("topic", handler).await.unwrap();
        connection.unsubscribe("topic", first).await.unwrap();
        assert_eq!(connection.topic_count(), 1);

        connection.publish("topic", "one".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        connection.unsubscribe("topic", second).await.unwrap();
        assert_eq!(connection.topic_count(), 0);
        connection.publish("topic", "two".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // unknown ids are ignored
        connection.unsubscribe("topic", second).await.unwrap();
        connection.unsubscribe("elsewhere", SubscriptionId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let connection = InMemoryConnection::new();
        connection.publish("nobody", "lost".into()).await.unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        connection
            .subscribe(
                "nobody",
                message_handler(move |_| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let connection = InMemoryConnection::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        connection
            .subscribe(
                "topic",
                message_handler(move |_| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await
            .unwrap();

        connection.shutdown().await.unwrap();
        connection.publish("topic", "late".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(connection
            .subscribe("topic", message_handler(|_| async {}))
            .await
            .is_err());
    }
}
