use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::protocol::error::{Result, ServiceDiscError};

/// Request published to a queue host's inbound queue.
///
/// `parameters` maps parameter names to codec-encoded values. Parameters
/// whose argument was null are left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub method_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Reply queue of the caller
    pub client_id: Uuid,
    pub message_id: Uuid,
}

impl RequestEnvelope {
    pub fn new(
        method_name: impl Into<String>,
        parameters: BTreeMap<String, String>,
        client_id: Uuid,
    ) -> Self {
        Self {
            method_name: method_name.into(),
            parameters,
            client_id,
            message_id: Uuid::new_v4(),
        }
    }
}

/// Reply published to the caller's reply queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(message_id: Uuid, result: Option<String>) -> Self {
        Self {
            message_id,
            result,
            error: None,
        }
    }

    pub fn failure(message_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            message_id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Converts the reply into the encoded result or a `Remote` error.
    pub fn into_result(self) -> Result<Option<String>> {
        match self.error {
            Some(message) => Err(ServiceDiscError::Remote(message)),
            None => Ok(self.result),
        }
    }
}
