//! Queue transport client
//!
//! Publishes a [`RequestEnvelope`] to the descriptor's address (the host
//! queue) and waits for the matching [`ResponseEnvelope`] on a reply queue
//! named after the client id.
//!
//! # Correlation
//!
//! Every client owns one [`ResponseQueue`], subscribed lazily on the first
//! call and shared by all calls made through the client. Waiters register a
//! oneshot sender under their message id; the subscription handler completes
//! it when the reply arrives. A waiter that gives up removes its entry, so a
//! late reply is dropped instead of leaking.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use servicedisc_common::codec::ValueCodec;
use servicedisc_common::dispatch::{Argument, CallOutput, MethodSignature};
use servicedisc_common::protocol::error::{Result, ServiceDiscError};
use servicedisc_common::protocol::{RequestEnvelope, ResponseEnvelope, ServiceDescriptor};
use servicedisc_registry::{message_handler, RegistryConnection};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ServiceClient;

/// Configuration for queue calls.
#[derive(Debug, Clone)]
pub struct QueueClientConfig {
    /// How often a waiting call checks for its reply
    ///
    /// Default: 100ms
    pub poll_interval: Duration,
    /// How long a call waits for its reply
    ///
    /// Default: 60s
    pub response_timeout: Duration,
}

impl Default for QueueClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            response_timeout: Duration::from_secs(60),
        }
    }
}

/// Reply queue of one client and its pending correlation entries.
pub struct ResponseQueue {
    client_id: Uuid,
    pending: DashMap<Uuid, oneshot::Sender<ResponseEnvelope>>,
}

impl ResponseQueue {
    /// Creates a reply queue with a fresh client id and subscribes it on `connection`.
    pub async fn subscribe(
        connection: &dyn RegistryConnection,
        codec: Arc<ValueCodec>,
    ) -> Result<Arc<Self>> {
        let queue = Arc::new(Self {
            client_id: Uuid::new_v4(),
            pending: DashMap::new(),
        });

        let weak = Arc::downgrade(&queue);
        connection
            .subscribe(
                &queue.client_id.to_string(),
                message_handler(move |payload| {
                    let weak = weak.clone();
                    let codec = codec.clone();
                    async move {
                        if let Some(queue) = weak.upgrade() {
                            queue.deliver(&codec, &payload);
                        }
                    }
                }),
            )
            .await?;

        debug!("Subscribed reply queue {}", queue.client_id);
        Ok(queue)
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Registers a waiter for `message_id`.
    pub fn track(self: &Arc<Self>, message_id: Uuid) -> Result<PendingResponse> {
        let (sender, receiver) = oneshot::channel();
        match self.pending.entry(message_id) {
            Entry::Occupied(_) => {
                return Err(ServiceDiscError::Transport(format!(
                    "message {} is already awaiting a reply",
                    message_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(sender);
            }
        }
        Ok(PendingResponse {
            queue: self.clone(),
            message_id,
            receiver,
        })
    }

    fn deliver(&self, codec: &ValueCodec, payload: &str) {
        let response: ResponseEnvelope = match codec.decode(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping malformed reply on {}: {}", self.client_id, e);
                return;
            }
        };

        match self.pending.remove(&response.message_id) {
            Some((_, sender)) => {
                let _ = sender.send(response);
            }
            None => debug!("No waiter for reply {}", response.message_id),
        }
    }
}

/// A registered waiter. Dropping it removes the correlation entry.
pub struct PendingResponse {
    queue: Arc<ResponseQueue>,
    message_id: Uuid,
    receiver: oneshot::Receiver<ResponseEnvelope>,
}

impl PendingResponse {
    /// Polls for the reply every `poll_interval`, giving up after `timeout`.
    pub async fn wait(mut self, poll_interval: Duration, timeout: Duration) -> Result<ResponseEnvelope> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.receiver.try_recv() {
                Ok(response) => return Ok(response),
                Err(TryRecvError::Closed) => {
                    return Err(ServiceDiscError::Transport(format!(
                        "reply queue for message {} closed",
                        self.message_id
                    )))
                }
                Err(TryRecvError::Empty) => {}
            }
            if Instant::now() >= deadline {
                return Err(ServiceDiscError::Timeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.queue.pending.remove(&self.message_id);
    }
}

pub struct QueueServiceClient {
    connection: Arc<dyn RegistryConnection>,
    codec: Arc<ValueCodec>,
    config: QueueClientConfig,
    responses: OnceCell<Arc<ResponseQueue>>,
}

impl QueueServiceClient {
    pub fn new(connection: Arc<dyn RegistryConnection>, codec: Arc<ValueCodec>, config: QueueClientConfig) -> Self {
        Self {
            connection,
            codec,
            config,
            responses: OnceCell::new(),
        }
    }

    /// The reply queue, subscribed on first use.
    pub async fn responses(&self) -> Result<&Arc<ResponseQueue>> {
        self.responses
            .get_or_try_init(|| ResponseQueue::subscribe(self.connection.as_ref(), self.codec.clone()))
            .await
    }
}

#[async_trait]
impl ServiceClient for QueueServiceClient {
    async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &'static MethodSignature,
        args: &[Argument],
    ) -> Result<CallOutput> {
        if method.uses_streams() || args.iter().any(Argument::is_stream) {
            return Err(ServiceDiscError::UnsupportedSignature(format!(
                "{} uses byte streams, which the queue transport does not carry",
                method.name
            )));
        }

        let responses = self.responses().await?;
        let parameters: BTreeMap<String, String> = method
            .params
            .iter()
            .zip(args)
            .filter_map(|(param, arg)| match arg {
                Argument::Value(Some(text)) => Some((param.name.to_string(), text.clone())),
                _ => None,
            })
            .collect();

        let request = RequestEnvelope::new(method.name, parameters, responses.client_id());
        let pending = responses.track(request.message_id)?;

        debug!("Publishing {} ({}) to {}", method.name, request.message_id, descriptor.address);
        self.connection
            .publish(&descriptor.address, self.codec.encode(&request)?)
            .await?;

        let response = pending
            .wait(self.config.poll_interval, self.config.response_timeout)
            .await?;
        Ok(match response.into_result()? {
            Some(text) => CallOutput::Encoded(text),
            None => CallOutput::None,
        })
    }
}
