//! Connection-string configuration.
//!
//! A connection string is a `;`-separated list of `Key=Value` pairs and must
//! contain `ProviderName`. When the argument holds no `=` at all it is read
//! as the name of an environment variable containing the string.
//!
//! ```
//! use servicedisc_registry::config::{ConnectionSettings, Provider};
//!
//! let settings = ConnectionSettings::parse("ProviderName=Lease;LeaseSeconds=30").unwrap();
//! assert_eq!(settings.provider, Provider::Lease);
//! assert_eq!(settings.lease_config().unwrap().lease_duration.as_secs(), 30);
//! ```

use servicedisc_common::protocol::{Result, ServiceDiscError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::RegistryConnection;
use crate::lease::{LeaseConfig, LeaseConnection};
use crate::memory::InMemoryConnection;
use crate::store::{QueueStore, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    InMemory,
    Lease,
}

impl Provider {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "inmemory" | "inmemoryconnection" => Some(Provider::InMemory),
            "lease" | "leaseconnection" => Some(Provider::Lease),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub provider: Provider,
    /// Remaining pairs, keys lowercased
    pub options: BTreeMap<String, String>,
}

impl ConnectionSettings {
    /// Parses a connection string, or the environment variable it names.
    pub fn parse(name_or_string: &str) -> Result<Self> {
        if name_or_string.trim().is_empty() {
            return Err(ServiceDiscError::Config(
                "connection string name is empty".to_string(),
            ));
        }

        let text = if name_or_string.contains('=') {
            name_or_string.to_string()
        } else {
            std::env::var(name_or_string).map_err(|_| {
                ServiceDiscError::Config(format!("connection string not found: {}", name_or_string))
            })?
        };

        let mut provider = None;
        let mut options = BTreeMap::new();
        for pair in text.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if key == "providername" {
                provider = Some(Provider::from_name(value).ok_or_else(|| {
                    ServiceDiscError::Config(format!("provider {} not found", value))
                })?);
            } else {
                options.insert(key, value.to_string());
            }
        }

        let provider = provider.ok_or_else(|| {
            ServiceDiscError::Config(format!(
                "ProviderName not found in connection string: {}",
                name_or_string
            ))
        })?;
        Ok(Self { provider, options })
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    fn number(&self, key: &str) -> Result<Option<u64>> {
        self.option(key)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| ServiceDiscError::Config(format!("{}={}: {}", key, v, e)))
            })
            .transpose()
    }

    /// Lease configuration with any `LeaseSeconds`, `PollingDelayMs` or
    /// `MaxWriteAttempts` overrides applied.
    pub fn lease_config(&self) -> Result<LeaseConfig> {
        let mut config = LeaseConfig::default();
        if let Some(secs) = self.number("LeaseSeconds")? {
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(ms) = self.number("PollingDelayMs")? {
            config.message_poll_delay = Duration::from_millis(ms);
        }
        if let Some(n) = self.number("MaxWriteAttempts")? {
            config.max_write_attempts = n as usize;
        }
        Ok(config)
    }

    /// Opens a connection for providers that need no external storage.
    pub async fn connect(&self) -> Result<Arc<dyn RegistryConnection>> {
        match self.provider {
            Provider::InMemory => Ok(Arc::new(InMemoryConnection::new())),
            Provider::Lease => Err(ServiceDiscError::Config(
                "the Lease provider needs storage, use connect_with_stores".to_string(),
            )),
        }
    }

    /// Opens a connection, handing `snapshots` and `queues` to lease providers.
    pub async fn connect_with_stores(
        &self,
        snapshots: Arc<dyn SnapshotStore>,
        queues: Arc<dyn QueueStore>,
    ) -> Result<Arc<dyn RegistryConnection>> {
        match self.provider {
            Provider::InMemory => self.connect().await,
            Provider::Lease => {
                let connection =
                    LeaseConnection::with_config(snapshots, queues, self.lease_config()?).await?;
                Ok(Arc::new(connection))
            }
        }
    }
}
