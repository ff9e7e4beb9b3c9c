use async_trait::async_trait;
use futures::future::BoxFuture;
use servicedisc_common::protocol::{RegistrySnapshot, Result, ServiceDescriptor};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::subscribers::SubscriptionId;

/// Callback invoked with every payload published on a subscribed topic.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Connection to a service registry.
///
/// Backends store [`ServiceDescriptor`]s and offer a fire-and-forget pub/sub
/// primitive. Every method may be called concurrently.
#[async_trait]
pub trait RegistryConnection: Send + Sync {
    /// Stores `descriptor` and returns the stored copy.
    ///
    /// Lease backends stamp `expire_at` and keep renewing it until the
    /// descriptor is unregistered or the connection shuts down.
    /// Fails with `Conflict` if the id is already present.
    async fn register(&self, descriptor: ServiceDescriptor) -> Result<ServiceDescriptor>;

    /// Removes the descriptor with `id`. Absent ids are not an error.
    async fn unregister(&self, id: Uuid) -> Result<()>;

    /// Every stored descriptor, including ones whose lease already ran out.
    async fn list_snapshot(&self) -> Result<RegistrySnapshot>;

    /// Publishes an encoded payload on `topic`.
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Adds `handler` to the subscribers of `topic`. Every subscriber sees
    /// every payload.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId>;

    /// Adds `handler` as a competing consumer of `topic`. Each payload reaches
    /// one of the topic's consumers, in rotation, besides every subscriber.
    async fn consume(&self, topic: &str, handler: MessageHandler) -> Result<SubscriptionId>;

    /// Detaches a handler added by `subscribe` or `consume`. Unknown ids are a
    /// no-op. Once a topic has no handlers left this connection stops taking
    /// payloads from it.
    async fn unsubscribe(&self, topic: &str, subscription: SubscriptionId) -> Result<()>;

    /// Stops background work. No handler or renewal runs after this returns.
    async fn shutdown(&self) -> Result<()>;
}
