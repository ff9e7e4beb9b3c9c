//! Discovery client facade
//!
//! [`DiscoveryClient`] ties a registry connection to transport hosts and
//! transport clients:
//!
//! - [`host`](DiscoveryClient::host) starts a host for a service and registers
//!   its descriptor
//! - [`resolve`](DiscoveryClient::resolve) reads the registry and returns a
//!   [`ServiceProxy`] over every matching instance
//! - [`send`](DiscoveryClient::send) and
//!   [`subscribe_messages`](DiscoveryClient::subscribe_messages) carry typed
//!   messages over the registry's pub/sub
//!
//! # Example
//!
//! ```ignore
//! let connection = ConnectionSettings::parse("ProviderName=InMemory")?.connect().await?;
//! let client = DiscoveryClient::new(connection);
//!
//! client.host(Arc::new(Calculator), None).await?;
//! let proxy = client.resolve(ServiceQuery::of::<Calculator>()).await?;
//! ```

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use servicedisc_common::codec::ValueCodec;
use servicedisc_common::dispatch::{HostedService, ServiceInterface};
use servicedisc_common::protocol::error::{Result, ServiceDiscError};
use servicedisc_common::protocol::{HostKind, ServiceDescriptor};
use servicedisc_registry::{message_handler, RegistryConnection, SubscriptionId};
use servicedisc_server::{HostConfig, HttpHost, QueueHost, TransportHost};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::candidates::CandidateSet;
use crate::dispatcher::{CallDispatcher, ClientMap, DispatchConfig};
use crate::http_client::HttpServiceClient;
use crate::proxy::ServiceProxy;
use crate::queue_client::{QueueClientConfig, QueueServiceClient};

/// Configuration for a [`DiscoveryClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub dispatch: DispatchConfig,
    pub queue: QueueClientConfig,
    /// Listener settings for HTTP hosts
    ///
    /// Default: [`HostConfig::from_env`]
    pub host: HostConfig,
    /// Transport used by [`DiscoveryClient::host`]
    ///
    /// Default: HTTP
    pub host_kind: HostKind,
    pub codec: Arc<ValueCodec>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            queue: QueueClientConfig::default(),
            host: HostConfig::from_env(),
            host_kind: HostKind::Http,
            codec: Arc::new(ValueCodec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    Any,
    Id(Uuid),
    Name(String),
}

/// Which registered instances a resolution should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceQuery {
    interface: String,
    selector: Selector,
}

impl ServiceQuery {
    /// Every instance of `interface`.
    pub fn by_type(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            selector: Selector::Any,
        }
    }

    pub fn by_id(interface: impl Into<String>, id: Uuid) -> Self {
        Self {
            interface: interface.into(),
            selector: Selector::Id(id),
        }
    }

    /// Instances of `interface` registered under `name`. Unnamed instances never match.
    pub fn by_name(interface: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            selector: Selector::Name(name.into()),
        }
    }

    /// Every instance of the interface `S` implements.
    pub fn of<S: ServiceInterface>() -> Self {
        Self::by_type(S::INTERFACE)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn matches(&self, descriptor: &ServiceDescriptor) -> bool {
        if descriptor.interface_type != self.interface {
            return false;
        }
        match &self.selector {
            Selector::Any => true,
            Selector::Id(id) => descriptor.id == *id,
            Selector::Name(name) => descriptor.name.as_deref() == Some(name.as_str()),
        }
    }
}

pub struct DiscoveryClient {
    connection: Arc<dyn RegistryConnection>,
    config: ClientConfig,
    clients: Arc<ClientMap>,
    hosts: DashMap<Uuid, Arc<dyn TransportHost>>,
}

impl DiscoveryClient {
    pub fn new(connection: Arc<dyn RegistryConnection>) -> Self {
        Self::with_config(connection, ClientConfig::default())
    }

    pub fn with_config(connection: Arc<dyn RegistryConnection>, config: ClientConfig) -> Self {
        let mut clients: ClientMap = HashMap::new();
        clients.insert(HostKind::Http, Arc::new(HttpServiceClient::new()));
        clients.insert(
            HostKind::Queue,
            Arc::new(QueueServiceClient::new(
                connection.clone(),
                config.codec.clone(),
                config.queue.clone(),
            )),
        );

        Self {
            connection,
            config,
            clients: Arc::new(clients),
            hosts: DashMap::new(),
        }
    }

    pub fn connection(&self) -> &Arc<dyn RegistryConnection> {
        &self.connection
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of hosts started by this client and not yet unregistered.
    pub fn hosted_count(&self) -> usize {
        self.hosts.len()
    }

    /// Hosts `service` on the configured transport and registers it.
    pub async fn host<S: ServiceInterface>(&self, service: Arc<S>, name: Option<&str>) -> Result<ServiceDescriptor> {
        self.host_with(service, name, self.config.host_kind).await
    }

    /// Hosts `service` on `kind` and registers it.
    pub async fn host_with<S: ServiceInterface>(
        &self,
        service: Arc<S>,
        name: Option<&str>,
        kind: HostKind,
    ) -> Result<ServiceDescriptor> {
        let hosted: Arc<dyn HostedService> = service;
        let codec = self.config.codec.clone();
        let host: Arc<dyn TransportHost> = match kind {
            HostKind::Http => Arc::new(HttpHost::start(hosted, codec, &self.config.host).await?),
            HostKind::Queue => Arc::new(QueueHost::start(hosted, codec, self.connection.clone()).await?),
            HostKind::Unknown => {
                return Err(ServiceDiscError::Config(
                    "cannot host a service on an unknown transport".to_string(),
                ))
            }
        };

        let descriptor = ServiceDescriptor::new(S::INTERFACE, name, kind, host.address());
        match self.connection.register(descriptor).await {
            Ok(stored) => {
                info!("{} hosted on {}", stored.interface_type, stored.address);
                self.hosts.insert(stored.id, host);
                Ok(stored)
            }
            Err(e) => {
                host.close().await;
                Err(e)
            }
        }
    }

    /// Removes `descriptor` from the registry and closes its host if this client started it.
    pub async fn unregister(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        self.connection.unregister(descriptor.id).await?;
        if let Some((_, host)) = self.hosts.remove(&descriptor.id) {
            host.close().await;
        }
        Ok(())
    }

    /// Resolves the instances matching `query`.
    ///
    /// Returns `None` when the registry holds no match.
    pub async fn resolve(&self, query: ServiceQuery) -> Result<Option<ServiceProxy>> {
        let snapshot = self.connection.list_snapshot().await?;
        let matching: Vec<ServiceDescriptor> = snapshot.into_iter().filter(|d| query.matches(d)).collect();
        if matching.is_empty() {
            return Ok(None);
        }

        let candidates = CandidateSet::with_observer(matching, expired_instance_reaper(self.connection.clone()));
        let dispatcher = CallDispatcher::new(candidates, self.clients.clone(), self.config.dispatch.clone());
        Ok(Some(ServiceProxy::new(
            query.interface,
            dispatcher,
            self.config.codec.clone(),
        )))
    }

    /// Publishes `message` on the topic named after its type.
    pub async fn send<M: Serialize + Any>(&self, message: &M) -> Result<()> {
        let payload = self.config.codec.encode(message)?;
        self.connection.publish(type_name::<M>(), payload).await
    }

    /// Calls `handler` with every `M` sent through any client on the same registry.
    ///
    /// Payloads that fail to decode are logged and skipped.
    pub async fn subscribe_messages<M, F, Fut>(&self, handler: F) -> Result<SubscriptionId>
    where
        M: DeserializeOwned + Any + Send,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let codec = self.config.codec.clone();
        let handler = Arc::new(handler);
        self.connection
            .subscribe(
                type_name::<M>(),
                message_handler(move |payload| {
                    let codec = codec.clone();
                    let handler = handler.clone();
                    async move {
                        match codec.decode::<M>(&payload) {
                            Ok(message) => handler(message).await,
                            Err(e) => warn!("Dropping undecodable {} message: {}", type_name::<M>(), e),
                        }
                    }
                }),
            )
            .await
    }

    /// Detaches a handler added by [`subscribe_messages`](Self::subscribe_messages).
    pub async fn unsubscribe_messages<M: Any>(&self, subscription: SubscriptionId) -> Result<()> {
        self.connection.unsubscribe(type_name::<M>(), subscription).await
    }

    /// Closes every host this client started, then shuts the connection down.
    pub async fn shutdown(&self) -> Result<()> {
        let hosts: Vec<Arc<dyn TransportHost>> = self.hosts.iter().map(|entry| entry.value().clone()).collect();
        self.hosts.clear();
        for host in hosts {
            host.close().await;
        }
        self.connection.shutdown().await
    }
}

/// Eviction observer that unregisters instances whose lease already ran out.
fn expired_instance_reaper(connection: Arc<dyn RegistryConnection>) -> impl Fn(&ServiceDescriptor) + Send + Sync + 'static {
    move |descriptor: &ServiceDescriptor| {
        if !descriptor.is_expired() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to unregister expired instance {}", descriptor.id);
            return;
        };
        info!("Unregistering expired instance {}", descriptor);
        let connection = connection.clone();
        let id = descriptor.id;
        runtime.spawn(async move {
            if let Err(e) = connection.unregister(id).await {
                warn!("Failed to unregister expired instance {}: {}", id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_by_name_skips_unnamed() {
        let named = ServiceDescriptor::new("tests.Echo", Some("primary"), HostKind::Http, "http://a/");
        let unnamed = ServiceDescriptor::new("tests.Echo", None, HostKind::Http, "http://b/");
        let other = ServiceDescriptor::new("tests.Other", Some("primary"), HostKind::Http, "http://c/");

        let query = ServiceQuery::by_name("tests.Echo", "primary");
        assert!(query.matches(&named));
        assert!(!query.matches(&unnamed));
        assert!(!query.matches(&other));

        assert!(!ServiceQuery::by_name("tests.Echo", "").matches(&unnamed));
    }

    #[test]
    fn test_query_by_id_and_type() {
        let a = ServiceDescriptor::new("tests.Echo", None, HostKind::Queue, "echo-qsh");
        let b = ServiceDescriptor::new("tests.Echo", None, HostKind::Queue, "echo-qsh");

        assert!(ServiceQuery::by_type("tests.Echo").matches(&a));
        assert!(ServiceQuery::by_id("tests.Echo", a.id).matches(&a));
        assert!(!ServiceQuery::by_id("tests.Echo", a.id).matches(&b));
        assert!(!ServiceQuery::by_id("tests.Other", a.id).matches(&a));
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.host_kind, HostKind::Http);
        assert_eq!(config.dispatch.retry_factor, 2);
    }
}
