pub mod descriptor;
pub mod envelopes;
pub mod error;


pub use descriptor::{normalize_name, HostKind, RegistrySnapshot, ServiceDescriptor};
pub use envelopes::{RequestEnvelope, ResponseEnvelope};
pub use error::{Result, ServiceDiscError};
