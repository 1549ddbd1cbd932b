//! Daemon mode for the roster service
//!
//! Serves the REST API and runs the periodic liveness tracker side by side.
//! Both stop when the shutdown channel flips to true.

pub mod routes;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::Result;
use crate::registry::PeerRegistry;

use routes::{build_router, AppState};

/// Default HTTP port for the REST API
pub const DEFAULT_HTTP_PORT: u16 = 5001;

/// HTTP server plus background tracker over one registry
pub struct DaemonService {
    registry: PeerRegistry,
    addr: SocketAddr,
}

impl DaemonService {
    pub fn new(registry: PeerRegistry, addr: SocketAddr) -> Self {
        Self { registry, addr }
    }

    /// Run until `shutdown` becomes true. In-flight requests are allowed to
    /// finish; the tracker stops between cycles.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("REST API listening on http://{}", listener.local_addr()?);

        let tracker = {
            let registry = self.registry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.run_tracker(shutdown).await })
        };

        let app = build_router(AppState {
            registry: self.registry.clone(),
        });

        let mut server_shutdown = shutdown;
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *server_shutdown.borrow() {
                        break;
                    }
                    if server_shutdown.changed().await.is_err() {
                        break;
                    }
                }
                tracing::info!("Shutdown signal received, draining HTTP connections");
            })
            .await;

        if let Err(e) = tracker.await {
            tracing::error!("Liveness tracker task failed: {}", e);
        }

        served?;
        tracing::info!("Daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::ReachabilityProbe;
    use crate::provision::X25519KeyGenerator;
    use crate::Settings;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct Unreachable;

    #[async_trait]
    impl ReachabilityProbe for Unreachable {
        async fn is_reachable(&self, _address: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        std::fs::write(&settings.config_path, "[Interface]\nListenPort = 51820\n").unwrap();
        let registry = PeerRegistry::open(
            settings,
            Arc::new(X25519KeyGenerator),
            Arc::new(Unreachable),
        )
        .await
        .unwrap();

        let daemon = DaemonService::new(registry, "127.0.0.1:0".parse().unwrap());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { daemon.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
