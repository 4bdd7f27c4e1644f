//! WebSocket Object Client
//!
//! Opens an initiator session to an [`ObjectServer`](super::server::ObjectServer),
//! exports a [`ClientRoot`] so the server can push notifications, and
//! exposes the server's root once the handshake completes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{info, warn};

use crate::core::context::RemotePeer;
use crate::core::error::CallError;
use crate::core::ident::{short_session, ObjectAddr};
use crate::core::obref::ObRef;
use crate::core::registry::{Registry, RegistryError};
use crate::core::value::Value;
use crate::network::driver::{pump_outbound, run_session, websocket_frames};
use crate::network::session::{Session, SessionConfig, SessionError, SessionState};
use crate::objects::ClientRoot;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name sent in `Hello`.
    pub name: String,
    /// Bearer token for servers that require one.
    pub token: Option<String>,
    /// Capacity of the client's own registry.
    pub registry_capacity: usize,
    /// Nested call depth limit for calls the server makes on us.
    pub max_call_depth: usize,
    /// How long to wait for the session to become active.
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "obnet-client".to_string(),
            token: None,
            registry_capacity: 64,
            max_call_depth: crate::DEFAULT_MAX_CALL_DEPTH,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport connection failed.
    #[error("connect failed: {0}")]
    Connect(#[from] WsError),

    /// Local registry refused the client root.
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    /// Session setup failed.
    #[error("session: {0}")]
    Session(#[from] SessionError),

    /// Server closed the session during the handshake.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// No handshake within the configured timeout.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

/// A connected client.
pub struct ObjectClient {
    session: Arc<Session>,
    registry: Arc<Registry>,
    inbox: Arc<Mutex<Vec<String>>>,
    driver: JoinHandle<Vec<ObjectAddr>>,
    writer: JoinHandle<()>,
}

impl ObjectClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8080`) and complete the handshake.
    pub async fn connect(url: &str, config: ClientConfig) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let registry = Arc::new(Registry::new(config.registry_capacity));
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let root = registry.register(Box::new(ClientRoot::new(inbox.clone())))?;

        let session_config = SessionConfig {
            max_call_depth: config.max_call_depth,
            ..SessionConfig::initiator(config.name.clone())
        };
        let id = uuid::Uuid::new_v4().into_bytes();
        let (session, outbound) = Session::new(id, registry.clone(), session_config);
        session.adopt(root);
        session.set_local_root(root)?;

        let writer = tokio::spawn(pump_outbound(outbound, ws_sender));
        let driver = tokio::spawn(run_session(session.clone(), websocket_frames(ws_receiver)));

        session.initiate(config.token)?;

        match tokio::time::timeout(config.handshake_timeout, session.wait_for(SessionState::Active)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let reason = session
                    .close_reason()
                    .unwrap_or_else(|| "connection closed".to_string());
                warn!("Connection to {} rejected: {}", url, reason);
                return Err(ClientError::Rejected(reason));
            }
            Err(_) => {
                session.close("handshake timeout");
                return Err(ClientError::HandshakeTimeout(config.handshake_timeout));
            }
        }

        info!("Connected to {} as session {}", url, short_session(&session.id()));

        Ok(Self {
            session,
            registry,
            inbox,
            driver,
            writer,
        })
    }

    /// The server's root object, unless it has been retired.
    pub fn server_root(&self) -> Option<ObRef> {
        self.session.remote_root()
    }

    /// Call `method` on `target`.
    pub async fn call(&self, target: &ObRef, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.session.call(target, method, args).await
    }

    /// Notifications the server has pushed so far.
    pub fn notifications(&self) -> Vec<String> {
        self.inbox.lock().clone()
    }

    /// Underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Client-side registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Say goodbye and wait for the connection to wind down.
    pub async fn close(self) {
        self.session.close("client closing");

        if tokio::time::timeout(Duration::from_secs(1), self.writer).await.is_err() {
            warn!("Outbound pump did not finish");
        }
        if let Ok(Ok(retired)) = tokio::time::timeout(Duration::from_secs(1), self.driver).await {
            info!("Client closed, retired {} object(s)", retired.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::{issue_test_token, AuthConfig};
    use crate::network::server::{ObjectServer, ServerConfig};
    use std::net::SocketAddr;

    async fn start_server(config: ServerConfig) -> (Arc<ObjectServer>, String) {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..config
        };
        let server = Arc::new(ObjectServer::new(config));
        let listener = server.bind().await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let running = server.clone();
        tokio::spawn(async move { running.run_with_listener(listener).await });
        (server, url)
    }

    #[tokio::test]
    async fn test_login_over_websocket() {
        let (server, url) = start_server(ServerConfig::default()).await;
        let client = ObjectClient::connect(&url, ClientConfig::default()).await.unwrap();
        let root = client.server_root().unwrap();

        assert_eq!(client.call(&root, "ping", vec![]).await, Ok(Value::from("pong")));
        assert_eq!(client.call(&root, "get_type", vec![]).await, Ok(Value::from("world_root")));

        let account = client.call(&root, "login", vec!["alice".into()]).await.unwrap();
        let account = account.as_obref().unwrap().clone();
        assert!(!account.is_local());
        assert_eq!(client.notifications(), vec!["welcome, alice".to_string()]);
        assert_eq!(client.call(&account, "name", vec![]).await, Ok(Value::from("alice")));

        client
            .call(&account, "set", vec!["colour".into(), "green".into()])
            .await
            .unwrap();
        assert_eq!(
            client.call(&account, "get", vec!["colour".into()]).await,
            Ok(Value::from("green"))
        );

        client.call(&root, "logout", vec![account.clone().into()]).await.unwrap();
        assert_eq!(
            client.call(&account, "name", vec![]).await,
            Err(CallError::ObjectGone(account.addr()))
        );

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_retires_server_objects() {
        let (server, url) = start_server(ServerConfig::default()).await;
        let client = ObjectClient::connect(&url, ClientConfig::default()).await.unwrap();
        let root = client.server_root().unwrap();
        client.call(&root, "login", vec!["dave".into()]).await.unwrap();
        assert_eq!(server.registry().len(), 2);

        client.close().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !server.registry().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.registry().is_empty());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_full_registry_rejects_connection() {
        let (server, url) = start_server(ServerConfig {
            registry_capacity: 1,
            ..Default::default()
        })
        .await;

        let first = ObjectClient::connect(&url, ClientConfig::default()).await.unwrap();
        let second = ObjectClient::connect(&url, ClientConfig::default()).await;
        assert!(matches!(second, Err(ClientError::Rejected(_))));

        first.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_token_checked_by_server() {
        let secret = "client-test-secret-0123456789";
        let (server, url) = start_server(ServerConfig {
            auth: AuthConfig::with_secret(secret),
            ..Default::default()
        })
        .await;

        let anonymous = ObjectClient::connect(&url, ClientConfig::default()).await;
        assert!(matches!(anonymous, Err(ClientError::Rejected(_))));

        let config = ClientConfig {
            token: Some(issue_test_token("erin", secret, 60).unwrap()),
            ..Default::default()
        };
        let client = ObjectClient::connect(&url, config).await.unwrap();
        assert_eq!(client.session().principal().as_deref(), Some("erin"));

        client.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_shutdown_closes_client() {
        let (server, url) = start_server(ServerConfig::default()).await;
        let client = ObjectClient::connect(&url, ClientConfig::default()).await.unwrap();
        let root = client.server_root().unwrap();

        server.shutdown();

        tokio::time::timeout(Duration::from_secs(5), client.session().wait_for(SessionState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.call(&root, "ping", vec![]).await, Err(CallError::SessionClosed));
        assert!(client.session().close_reason().unwrap().contains("shutting down"));
    }
}
