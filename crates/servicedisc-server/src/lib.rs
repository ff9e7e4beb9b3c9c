//! servicedisc transport hosts
//!
//! A transport host exposes one hosted service on a wire protocol and
//! reports the address that goes into the service's descriptor.
//!
//! # Hosts
//!
//! - [`HttpHost`]: `GET`/`POST /{method}` over HTTP, address `http://{host}:{port}/`
//! - [`QueueHost`]: request/response envelopes over registry queues, address
//!   is the host queue name
//!
//! Both decode parameters with the shared [`ValueCodec`] through a
//! [`ServiceInvoker`], so a service behaves the same on either transport.
//!
//! [`ValueCodec`]: servicedisc_common::codec::ValueCodec

use async_trait::async_trait;
use servicedisc_common::protocol::HostKind;

pub mod config;
pub mod http_host;
pub mod http_router;
pub mod invoker;
pub mod queue_host;

pub use config::HostConfig;
pub use http_host::HttpHost;
pub use invoker::ServiceInvoker;
pub use queue_host::QueueHost;

/// A running transport host.
#[async_trait]
pub trait TransportHost: Send + Sync {
    fn kind(&self) -> HostKind;

    /// Interface name of the hosted service
    fn interface(&self) -> &'static str;

    /// Address published in the service's descriptor
    fn address(&self) -> &str;

    /// Stops accepting calls. Idempotent.
    async fn close(&self);
}
