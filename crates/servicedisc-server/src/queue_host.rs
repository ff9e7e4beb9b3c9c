//! Queue transport host
//!
//! Listens on the queue derived from the service's interface name
//! (`host_queue_name`), invokes the requested method for each
//! [`RequestEnvelope`] and publishes a [`ResponseEnvelope`] on the caller's
//! reply queue. Hosts of one interface are competing consumers of that
//! queue, so each request runs on exactly one instance. The registry
//! connection delivers one message at a time per queue.

use async_trait::async_trait;
use servicedisc_common::codec::ValueCodec;
use servicedisc_common::dispatch::HostedService;
use servicedisc_common::protocol::{
    HostKind, RequestEnvelope, ResponseEnvelope, Result, ServiceDiscError,
};
use servicedisc_common::queue_name::host_queue_name;
use servicedisc_registry::{message_handler, RegistryConnection, SubscriptionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::invoker::ServiceInvoker;
use crate::TransportHost;

pub struct QueueHost {
    interface: &'static str,
    address: String,
    closed: Arc<AtomicBool>,
    connection: Weak<dyn RegistryConnection>,
    subscription: SubscriptionId,
}

impl QueueHost {
    /// Joins the consumers of the service's inbound queue on `connection`.
    pub async fn start(
        service: Arc<dyn HostedService>,
        codec: Arc<ValueCodec>,
        connection: Arc<dyn RegistryConnection>,
    ) -> Result<Self> {
        let interface = service.interface();
        let address = host_queue_name(interface);
        let closed = Arc::new(AtomicBool::new(false));

        let invoker = Arc::new(ServiceInvoker::new(service, codec));
        // the connection owns this handler, so hold it weakly
        let replies: Weak<dyn RegistryConnection> = Arc::downgrade(&connection);
        let handler_closed = closed.clone();
        let subscription = connection
            .consume(
                &address,
                message_handler(move |payload| {
                    let invoker = invoker.clone();
                    let replies = replies.clone();
                    let closed = handler_closed.clone();
                    async move {
                        if closed.load(Ordering::Acquire) {
                            return;
                        }
                        let Some((client_id, response)) = handle_request(&invoker, &payload).await else {
                            return;
                        };
                        let Some(connection) = replies.upgrade() else {
                            return;
                        };
                        if let Err(e) = send_response(&invoker, connection.as_ref(), &client_id, &response).await {
                            warn!("Failed to reply to {}: {}", client_id, e);
                        }
                    }
                }),
            )
            .await?;

        info!("Hosting {} over queue {}", interface, address);
        Ok(Self {
            interface,
            address,
            closed,
            connection: Arc::downgrade(&connection),
            subscription,
        })
    }
}

async fn handle_request(invoker: &ServiceInvoker, payload: &str) -> Option<(String, ResponseEnvelope)> {
    let request: RequestEnvelope = match invoker.codec().decode(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping malformed queue request: {}", e);
            return None;
        }
    };
    debug!("Queue request {} for {}", request.message_id, request.method_name);

    let result = match invoker.service().method(&request.method_name) {
        Some(method) if method.uses_streams() => Err(ServiceDiscError::UnsupportedSignature(format!(
            "{} uses byte streams, which the queue transport does not carry",
            method.name
        ))),
        _ => invoker
            .invoke(
                &request.method_name,
                |name| request.parameters.get(name).cloned(),
                None,
            )
            .await
            .and_then(|output| output.into_encoded()),
    };

    let response = match result {
        Ok(encoded) => ResponseEnvelope::success(request.message_id, encoded),
        Err(e) => {
            debug!("Queue request {} failed: {}", request.message_id, e);
            ResponseEnvelope::failure(request.message_id, e.to_string())
        }
    };
    Some((request.client_id.to_string(), response))
}

async fn send_response(
    invoker: &ServiceInvoker,
    connection: &dyn RegistryConnection,
    client_id: &str,
    response: &ResponseEnvelope,
) -> Result<()> {
    let payload = invoker.codec().encode(response)?;
    connection.publish(client_id, payload).await
}

#[async_trait]
impl TransportHost for QueueHost {
    fn kind(&self) -> HostKind {
        HostKind::Queue
    }

    fn interface(&self) -> &'static str {
        self.interface
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(connection) = self.connection.upgrade() {
            if let Err(e) = connection.unsubscribe(&self.address, self.subscription).await {
                warn!("Failed to leave queue {}: {}", self.address, e);
            }
        }
        info!("Closed queue host for {} on {}", self.interface, self.address);
    }
}
