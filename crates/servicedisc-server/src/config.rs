use servicedisc_common::protocol::{Result, ServiceDiscError};
use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::time::Duration;
use tracing::warn;

pub const PORT_ENV: &str = "SERVICEDISC_PORT";
pub const LOCAL_PORT_ENV: &str = "SERVICEDISC_LOCALPORT";
pub const EXTERNAL_PORT_ENV: &str = "SERVICEDISC_EXTERNALPORT";
pub const HOSTNAME_ENV: &str = "SERVICEDISC_HOSTNAME";

/// HTTP host binding and address publication.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Interface the listener binds to
    ///
    /// Default: 0.0.0.0
    pub bind_address: IpAddr,
    /// Fixed local port, bound once without retry. `Some(0)` lets the OS pick.
    ///
    /// Default: None (random port from `port_range`)
    pub local_port: Option<u16>,
    /// Host name written into the published address
    ///
    /// Default: "localhost"
    pub published_host: String,
    /// Port written into the published address, if it differs from the bound port
    pub published_port: Option<u16>,
    /// Range random ports are drawn from
    ///
    /// Default: 5000..6000
    pub port_range: Range<u16>,
    /// Extra random ports tried after a bind conflict
    ///
    /// Default: 10
    pub bind_retries: usize,
    /// Grace period for in-flight requests when the host closes
    ///
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: None,
            published_host: "localhost".to_string(),
            published_port: None,
            port_range: 5000..6000,
            bind_retries: 10,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl HostConfig {
    /// Binds and publishes on 127.0.0.1 only.
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            published_host: Ipv4Addr::LOCALHOST.to_string(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `SERVICEDISC_*` environment variables.
    ///
    /// - local port: `SERVICEDISC_LOCALPORT`, else `SERVICEDISC_PORT`
    /// - published port: `SERVICEDISC_EXTERNALPORT`, else `SERVICEDISC_PORT`
    /// - published host: `SERVICEDISC_HOSTNAME`
    ///
    /// Unparsable ports are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = |primary: &str| -> Option<u16> {
            let (name, text) = lookup(primary)
                .map(|v| (primary, v))
                .or_else(|| lookup(PORT_ENV).map(|v| (PORT_ENV, v)))?;
            match text.trim().parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not a port number", name, text);
                    None
                }
            }
        };

        let mut config = Self::default();
        config.local_port = port(LOCAL_PORT_ENV);
        config.published_port = port(EXTERNAL_PORT_ENV);
        if let Some(host) = lookup(HOSTNAME_ENV).filter(|h| !h.trim().is_empty()) {
            config.published_host = host.trim().to_string();
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_port.is_none() && self.port_range.is_empty() {
            return Err(ServiceDiscError::Config(format!(
                "empty port range {:?}",
                self.port_range
            )));
        }
        Ok(())
    }

    /// Published address for a listener bound to `bound_port`.
    pub fn published_address(&self, bound_port: u16) -> String {
        format!(
            "http://{}:{}/",
            self.published_host,
            self.published_port.unwrap_or(bound_port)
        )
    }
}
