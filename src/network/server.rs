//! WebSocket Object Server
//!
//! Accepts connections, opens an acceptor session for each and exports a
//! fresh [`WorldRoot`] as that session's root. Every connection shares the
//! server's registry and value store.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, instrument, warn};

use crate::core::context::RemotePeer;
use crate::core::ident::short_session;
use crate::core::registry::Registry;
use crate::network::auth::AuthConfig;
use crate::network::driver::{pump_outbound, run_session, websocket_frames};
use crate::network::session::{SessionConfig, SessionManager};
use crate::objects::WorldRoot;
use crate::store::{MemoryStore, ValueStore};

/// How long a closing connection may take to flush its last frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum live objects across all connections.
    pub registry_capacity: usize,
    /// Nested call depth limit per inbound call.
    pub max_call_depth: usize,
    /// Server version string.
    pub version: String,
    /// Token validation for incoming sessions.
    pub auth: AuthConfig,
    /// Interval between sweeps of closed sessions.
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            registry_capacity: crate::DEFAULT_REGISTRY_CAPACITY,
            max_call_depth: crate::DEFAULT_MAX_CALL_DEPTH,
            version: crate::VERSION.to_string(),
            auth: AuthConfig::default(),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `OBNET_BIND`, `OBNET_MAX_CONNECTIONS`,
    /// `OBNET_REGISTRY_CAPACITY` and the `AUTH_*` variables.
    pub fn from_env() -> Result<Self, ServerError> {
        let mut config = Self {
            auth: AuthConfig::from_env(),
            ..Default::default()
        };

        if let Ok(bind) = std::env::var("OBNET_BIND") {
            config.bind_addr = bind
                .parse()
                .map_err(|e| ServerError::Config(format!("OBNET_BIND={}: {}", bind, e)))?;
        }
        if let Some(n) = env_usize("OBNET_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(n) = env_usize("OBNET_REGISTRY_CAPACITY")? {
            config.registry_capacity = n;
        }

        Ok(config)
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.registry_capacity == 0 {
            return Err(ServerError::Config("registry capacity must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max connections must be positive".into()));
        }
        if self.max_call_depth == 0 {
            return Err(ServerError::Config("max call depth must be positive".into()));
        }
        Ok(())
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            name: "obnet-server".to_string(),
            version: self.version.clone(),
            max_call_depth: self.max_call_depth,
            auth: self.auth.clone(),
            ..Default::default()
        }
    }
}

fn env_usize(key: &str) -> Result<Option<usize>, ServerError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ServerError::Config(format!("{}={}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// The object server.
pub struct ObjectServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    store: Arc<dyn ValueStore>,
    sessions: Arc<SessionManager>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ObjectServer {
    /// Server with an in-memory store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Server persisting accounts through `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn ValueStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            registry: Arc::new(Registry::new(config.registry_capacity)),
            config,
            store,
            sessions: Arc::new(SessionManager::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        self.config.validate()?;
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until [`shutdown`](Self::shutdown).
    #[instrument(skip_all)]
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("Object server listening on {}", listener.local_addr()?);

        let cleanup_sessions = self.sessions.clone();
        let cleanup_every = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = interval(cleanup_every);
            loop {
                interval.tick().await;
                let removed = cleanup_sessions.cleanup().await;
                if removed > 0 {
                    debug!("Swept {} closed session(s)", removed);
                }
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Acquire) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();

        let adopted = self.sessions.close_all("server shutting down").await;
        let retired = self.registry.shutdown();
        info!(
            "Server stopped: {} session object(s), {} total retired",
            adopted.len(),
            retired.len()
        );

        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let store = self.store.clone();
        let sessions = self.sessions.clone();
        let connections = self.connections.clone();
        let session_config = self.config.session_config();

        connections.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    connections.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };

            let (ws_sender, ws_receiver) = ws_stream.split();
            let (session, outbound) = sessions.create(registry.clone(), session_config).await;
            let mut writer = tokio::spawn(pump_outbound(outbound, ws_sender));
            debug!("Connection {} is session {}", addr, short_session(&session.id()));

            match registry.register(Box::new(WorldRoot::new(store))) {
                Ok(root) => {
                    session.adopt(root);
                    if let Err(e) = session.set_local_root(root) {
                        warn!("Root for {} vanished: {}", addr, e);
                    }
                    run_session(session.clone(), websocket_frames(ws_receiver)).await;
                }
                Err(e) => {
                    warn!("Rejecting {}: {}", addr, e);
                    session.close(&e.to_string());
                }
            }

            if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
            sessions.remove(&session.id()).await;
            connections.fetch_sub(1, Ordering::AcqRel);
            info!("Connection {} closed", addr);
        });
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Tracked sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.registry_capacity, crate::DEFAULT_REGISTRY_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = ServerConfig {
            registry_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let server = ObjectServer::new(config);

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.session_count().await, 0);
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let server = Arc::new(ObjectServer::new(config));
        let listener = server.bind().await.unwrap();

        let running = server.clone();
        let handle = tokio::spawn(async move { running.run_with_listener(listener).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(server.registry().is_empty());
    }
}
