use thiserror::Error;
use uuid::Uuid;

/// Error type shared by every servicedisc crate.
///
/// The first group of variants is what callers of a resolved service proxy
/// observe; transient transport failures are absorbed by the call dispatcher
/// and only surface wrapped in `ServiceUnavailable` or `RetriesExhausted`.
#[derive(Error, Debug)]
pub enum ServiceDiscError {
    #[error("No live service instance available{}", describe_last(.last))]
    ServiceUnavailable {
        #[source]
        last: Option<Box<ServiceDiscError>>,
    },

    #[error("All {attempts} call attempts failed, last error: {last}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        last: Box<ServiceDiscError>,
    },

    #[error("Call deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unsupported method signature: {0}")]
    UnsupportedSignature(String),

    #[error("Registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Service id {0} is already registered")]
    Conflict(Uuid),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Remote invocation failed: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_last(last: &Option<Box<ServiceDiscError>>) -> String {
    match last {
        Some(err) => format!(", last error: {}", err),
        None => String::new(),
    }
}

impl ServiceDiscError {
    /// `ServiceUnavailable` without a preceding failure.
    pub fn unavailable() -> Self {
        ServiceDiscError::ServiceUnavailable { last: None }
    }

    /// `ServiceUnavailable` wrapping the failure that emptied the candidates.
    pub fn unavailable_after(last: ServiceDiscError) -> Self {
        ServiceDiscError::ServiceUnavailable {
            last: Some(Box::new(last)),
        }
    }

    /// Whether the call dispatcher should try another candidate after this error.
    ///
    /// Signature and codec problems are deterministic, so retrying them on a
    /// different instance cannot succeed.
    pub fn is_candidate_failure(&self) -> bool {
        !matches!(
            self,
            ServiceDiscError::UnsupportedSignature(_)
                | ServiceDiscError::Decode(_)
                | ServiceDiscError::DeadlineExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ServiceDiscError>;
