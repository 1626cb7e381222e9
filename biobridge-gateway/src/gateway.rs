//! Device listener and connection registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use biobridge_core::{EnrollmentView, GatewayStatus};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::client::UpstreamClient;
use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionError, ConnectionHandle, ConnectionId};
use crate::orchestrator::Orchestrator;
use crate::session::SessionManager;
use crate::sink::RecordSink;
use crate::upstream::EnrollmentApi;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("no such connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct Inner {
    config: GatewayConfig,
    sessions: SessionManager,
    orchestrator: Orchestrator,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    next_id: AtomicU64,
}

/// Shared gateway handle. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

impl Gateway {
    pub fn new(config: GatewayConfig, api: Arc<dyn EnrollmentApi>, sink: Arc<dyn RecordSink>) -> Self {
        let sessions = SessionManager::new(Arc::clone(&api), config.session.clone());
        let client = UpstreamClient::new(api, sessions.clone(), config.request_timeout);
        let orchestrator = Orchestrator::new(client, sink, config.capture_quality);

        Self {
            inner: Arc::new(Inner {
                config,
                sessions,
                orchestrator,
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Accept device connections until `shutdown` fires.
    ///
    /// Each connection runs in its own task and is removed from the registry
    /// when it ends.
    pub async fn serve(&self, listener: TcpListener, shutdown: &broadcast::Sender<()>) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "Device listener bound");

        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer, shutdown.subscribe()),
                        Err(e) => {
                            tracing::warn!(error = %e, "TCP accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received, stopping device accept loop");
                    break;
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr, shutdown: broadcast::Receiver<()>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (connection, handle) = Connection::new(
            id,
            peer.to_string(),
            stream,
            self.inner.orchestrator.clone(),
            self.inner.config.max_payload,
            self.inner.config.idle_timeout,
        );
        self.inner.connections.insert(id, handle);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = connection.run(shutdown).await {
                tracing::warn!(conn = id, error = %e, "Device connection error");
            }
            inner.connections.remove(&id);
            tracing::debug!(conn = id, "Connection state discarded");
        });
    }

    /// Read-only snapshot of the gateway.
    pub fn status(&self) -> GatewayStatus {
        let mut connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        connections.sort_by_key(|c| c.id);

        GatewayStatus {
            listen_addr: self.inner.config.listen_addr.to_string(),
            connected_clients: connections.len(),
            session: self.inner.sessions.health(),
            connections,
        }
    }

    /// Start an enrollment on a live connection, as if its device had asked.
    pub async fn start_enrollment(
        &self,
        connection_id: ConnectionId,
        display_name: &str,
        external_id: &str,
    ) -> Result<EnrollmentView, GatewayError> {
        // Clone out of the map so no shard lock is held across the await.
        let handle = self
            .inner
            .connections
            .get(&connection_id)
            .map(|entry| entry.value().clone())
            .ok_or(GatewayError::UnknownConnection(connection_id))?;

        Ok(handle
            .start_enrollment(display_name.to_string(), external_id.to_string())
            .await?)
    }
}
