//! HTTP transport host
//!
//! Serves one hosted service over HTTP with axum and publishes the address
//! `http://{host}:{port}/` for its descriptor.
//!
//! # Port selection
//!
//! - a fixed `local_port` is bound exactly once; a failure is returned to the
//!   caller (`Some(0)` asks the OS for a free port)
//! - otherwise a random port from `port_range` is tried, with up to
//!   `bind_retries` more random ports after address-in-use errors

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use servicedisc_common::codec::ValueCodec;
use servicedisc_common::dispatch::HostedService;
use servicedisc_common::protocol::{HostKind, Result, ServiceDiscError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HostConfig;
use crate::http_router::service_router;
use crate::invoker::ServiceInvoker;
use crate::TransportHost;

pub struct HttpHost {
    interface: &'static str,
    address: String,
    local_addr: SocketAddr,
    shutdown_timeout: Duration,
    token: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl HttpHost {
    /// Binds a listener per `config` and starts serving `service`.
    pub async fn start(
        service: Arc<dyn HostedService>,
        codec: Arc<ValueCodec>,
        config: &HostConfig,
    ) -> Result<Self> {
        config.validate()?;
        for method in service.methods() {
            method.validate()?;
        }

        let listener = bind_listener(config).await?;
        let local_addr = listener.local_addr()?;
        let address = config.published_address(local_addr.port());
        let interface = service.interface();

        let app = service_router(Arc::new(ServiceInvoker::new(service, codec)));
        let token = CancellationToken::new();
        let shutdown = token.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("HTTP host for {} stopped with error: {}", interface, e);
            }
        });

        info!("Hosting {} over HTTP on {} as {}", interface, local_addr, address);

        Ok(Self {
            interface,
            address,
            local_addr,
            shutdown_timeout: config.shutdown_timeout,
            token,
            server: Mutex::new(Some(server)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
impl TransportHost for HttpHost {
    fn kind(&self) -> HostKind {
        HostKind::Http
    }

    fn interface(&self) -> &'static str {
        self.interface
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn close(&self) {
        self.token.cancel();
        let server = self.server.lock().take();
        if let Some(mut server) = server {
            if tokio::time::timeout(self.shutdown_timeout, &mut server).await.is_err() {
                warn!(
                    "HTTP host for {} did not drain within {:?}, aborting",
                    self.interface, self.shutdown_timeout
                );
                server.abort();
            }
            info!("Closed HTTP host for {} on {}", self.interface, self.local_addr);
        }
    }
}

impl Drop for HttpHost {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn bind_listener(config: &HostConfig) -> Result<TcpListener> {
    if let Some(port) = config.local_port {
        return TcpListener::bind((config.bind_address, port))
            .await
            .map_err(ServiceDiscError::Io);
    }

    let mut last_error = None;
    for attempt in 0..=config.bind_retries {
        let port = rand::thread_rng().gen_range(config.port_range.clone());
        match TcpListener::bind((config.bind_address, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!("Port {} in use (attempt {}), trying another", port, attempt + 1);
                last_error = Some(e);
            }
            Err(e) => return Err(ServiceDiscError::Io(e)),
        }
    }

    Err(ServiceDiscError::Io(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrInUse, "no port could be bound")
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_port_zero_binds_any_free_port() {
        let config = HostConfig {
            local_port: Some(0),
            ..HostConfig::loopback()
        };
        let listener = bind_listener(&config).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_random_port_within_range() {
        let listener = bind_listener(&HostConfig::loopback()).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!((5000..6000).contains(&port), "port {} out of range", port);
    }

    #[tokio::test]
    async fn test_fixed_port_conflict_is_an_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = HostConfig {
            local_port: Some(taken.local_addr().unwrap().port()),
            ..HostConfig::loopback()
        };
        assert!(matches!(
            bind_listener(&config).await,
            Err(ServiceDiscError::Io(e)) if e.kind() == io::ErrorKind::AddrInUse
        ));
    }

    #[tokio::test]
    async fn test_random_ports_exhausted() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = HostConfig {
            port_range: port..port + 1,
            bind_retries: 2,
            ..HostConfig::loopback()
        };
        assert!(matches!(bind_listener(&config).await, Err(ServiceDiscError::Io(_))));
    }
}
