//! servicedisc client
//!
//! Resolves services from a registry and calls them with failover.
//!
//! # Architecture
//!
//! ```text
//! DiscoveryClient --resolve--> ServiceProxy --> CallDispatcher --> CandidateSet
//!                                                     |
//!                                     +---------------+---------------+
//!                                     |                               |
//!                              HttpServiceClient              QueueServiceClient
//!                                     |                               |
//!                                 HttpHost                   registry pub/sub --> QueueHost
//! ```
//!
//! The dispatcher owns the retry policy; transport clients make exactly one
//! attempt against the descriptor they are given.

use async_trait::async_trait;
use servicedisc_common::dispatch::{Argument, CallOutput, MethodSignature};
use servicedisc_common::protocol::{Result, ServiceDescriptor};

pub mod candidates;
pub mod discovery;
pub mod dispatcher;
pub mod http_client;
pub mod proxy;
pub mod queue_client;

pub use candidates::CandidateSet;
pub use discovery::{ClientConfig, DiscoveryClient, ServiceQuery};
pub use dispatcher::{CallDispatcher, DispatchConfig};
pub use http_client::HttpServiceClient;
pub use proxy::ServiceProxy;
pub use queue_client::{QueueClientConfig, QueueServiceClient};

/// One transport's way of calling a service instance.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Calls `method` on the instance described by `descriptor`.
    ///
    /// `args` line up with `method.params`.
    async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &'static MethodSignature,
        args: &[Argument],
    ) -> Result<CallOutput>;
}
