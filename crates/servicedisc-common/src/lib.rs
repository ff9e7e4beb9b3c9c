//! servicedisc common types
//!
//! Shared building blocks for the servicedisc service-discovery and RPC
//! layer: the registry data model, the error taxonomy, the value codec used by
//! every transport, queue naming, and the explicit dispatch contract hosted
//! services implement.
//!
//! # Overview
//!
//! Services register a [`ServiceDescriptor`] in a shared registry. Clients
//! resolve live descriptors by interface type (optionally by name or id) and
//! call them over HTTP or over a message queue. Both transports encode values
//! with the same [`ValueCodec`].
//!
//! # Components
//!
//! - [`protocol`] - descriptors, snapshots, queue envelopes, errors
//! - [`codec`] - two-tier value encoding (primitive table, then JSON)
//! - [`dispatch`] - method signatures and the service interface traits
//! - [`queue_name`] - queue name derivation from type names
//! - [`stream`] - byte streams for stream-typed parameters and results

pub mod codec;
pub mod dispatch;
pub mod protocol;
pub mod queue_name;
pub mod stream;

pub use codec::ValueCodec;
pub use dispatch::{
    Argument, ArgValue, CallArgs, CallOutput, HostedService, MethodSignature, ParamKind, ParamSpec,
    ReturnKind, ServiceInterface,
};
pub use protocol::*;
pub use queue_name::{host_queue_name, queue_name};
pub use stream::ByteStream;
