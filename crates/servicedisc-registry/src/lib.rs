//! servicedisc registry connections
//!
//! A registry connection stores service descriptors and carries
//! fire-and-forget messages between processes.
//!
//! # Backends
//!
//! - [`InMemoryConnection`]: everything lives in the process; useful for
//!   tests and single-process deployments
//! - [`LeaseConnection`]: descriptors are kept in a shared document with
//!   optimistic concurrency and renewed leases; messages go through named
//!   queues with at-least-once delivery
//!
//! # Example
//!
//! ```no_run
//! use servicedisc_common::protocol::{HostKind, ServiceDescriptor};
//! use servicedisc_registry::{InMemoryConnection, RegistryConnection};
//!
//! # #[tokio::main]
//! # async fn main() -> servicedisc_common::Result<()> {
//! let connection = InMemoryConnection::new();
//! let descriptor = ServiceDescriptor::new("demo.Echo", None, HostKind::Http, "http://localhost:5000/");
//! connection.register(descriptor).await?;
//! assert_eq!(connection.list_snapshot().await?.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod lease;
pub mod memory;
pub mod store;
pub mod subscribers;

pub use config::{ConnectionSettings, Provider};
pub use connection::{message_handler, MessageHandler, RegistryConnection};
pub use lease::{LeaseConfig, LeaseConnection};
pub use memory::InMemoryConnection;
pub use store::{
    MemoryQueueStore, MemorySnapshotStore, QueueMessage, QueueStore, SnapshotStore, StoreError,
    WriteCondition,
};
pub use subscribers::{Delivery, SubscriptionId};
