//! Peer Session Management
//!
//! One [`Session`] per connection. The session owns the visibility boundary
//! between the local registry and one peer: only addresses in its exposed
//! set may be invoked by that peer, and only objects it has been granted
//! may be invoked on the peer's side.
//!
//! ```text
//!  Connecting ──hello/ack──▶ Authenticated ──bootstrap──▶ Active
//!       │                         │                         │
//!       └─────────────────────────┴──────────▶ Closing ──▶ Closed
//! ```
//!
//! The session never touches the transport. Every outgoing message goes to
//! its outbound channel; the driver pumps that channel to the wire and feeds
//! decoded inbound messages back through [`Session::dispatch`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, info, warn};

use crate::core::context::{ArgSet, CallContext, RemotePeer};
use crate::core::error::CallError;
use crate::core::ident::{short_session, CallId, ObjectAddr, SessionId};
use crate::core::obref::{Location, ObRef};
use crate::core::registry::{ObjectCell, Registry, Resolution, Ticket};
use crate::core::value::Value;
use crate::network::auth::{authenticate, AuthConfig};
use crate::network::protocol::{DmcMessage, MethodCall, RefOwner, WireRef, WireValue};
use crate::PROTOCOL_VERSION;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted the connection (server side).
    Acceptor,
    /// Opened the connection (client side).
    Initiator,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Transport up, handshake pending.
    Connecting,
    /// Handshake done, roots being exchanged.
    Authenticated,
    /// Peer root received; calls flow both ways.
    Active,
    /// Teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Whether calls may be issued or admitted.
    pub fn is_open(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Active)
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Authenticated, Active)
                | (Connecting | Authenticated | Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Acceptor or initiator.
    pub role: Role,
    /// Display name sent in `Hello`.
    pub name: String,
    /// Software version announced to the peer.
    pub version: String,
    /// Nested call depth limit per inbound call.
    pub max_call_depth: usize,
    /// Token validation (acceptor only).
    pub auth: AuthConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: Role::Acceptor,
            name: "obnet".to_string(),
            version: crate::VERSION.to_string(),
            max_call_depth: crate::DEFAULT_MAX_CALL_DEPTH,
            auth: AuthConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Initiator config announcing `name`.
    pub fn initiator(name: impl Into<String>) -> Self {
        Self {
            role: Role::Initiator,
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Proof that an address was granted to a session's peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Granted address.
    pub addr: ObjectAddr,
    /// Session it was granted on.
    pub session: SessionId,
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation not valid in the current state.
    #[error("invalid in state {0:?}")]
    InvalidState(SessionState),

    /// Peer failed authentication.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer speaks another protocol version.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Local version.
        ours: u32,
        /// Peer version.
        theirs: u32,
    },

    /// Address is not live in the local registry.
    #[error("object {0} not registered")]
    ObjectNotRegistered(ObjectAddr),

    /// Peer broke the protocol; the session has been closed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Session is closed.
    #[error("session closed")]
    Closed,
}

// =============================================================================
// CALL ADMISSION
// =============================================================================

/// An inbound call that passed admission and holds its place in its
/// target's queue.
pub struct PreparedCall {
    call_id: CallId,
    target: ObjectAddr,
    method: String,
    args: ArgSet,
    ticket: Ticket,
}

impl PreparedCall {
    /// Call id to answer.
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Target address.
    pub fn target(&self) -> ObjectAddr {
        self.target
    }

    /// Method selector.
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Outcome of [`Session::admit`].
pub enum Admission {
    /// Ready to execute.
    Ready(PreparedCall),
    /// Refused; the fault has already been sent.
    Rejected,
}

struct PendingCall {
    target: ObjectAddr,
    reply: oneshot::Sender<Result<Value, CallError>>,
}

struct SessionInner {
    state: SessionState,
    /// Local addresses the peer may invoke.
    exposed: BTreeSet<ObjectAddr>,
    /// Exposed local addresses since retired.
    retired: BTreeSet<ObjectAddr>,
    /// Peer addresses the peer reported retired.
    peer_gone: BTreeSet<ObjectAddr>,
    pending: BTreeMap<CallId, PendingCall>,
    local_root: Option<ObjectAddr>,
    remote_root: Option<ObjectAddr>,
    /// Local objects unregistered when the session ends.
    adopted: Vec<ObjectAddr>,
    principal: Option<String>,
    peer_name: Option<String>,
    close_reason: Option<String>,
}

// =============================================================================
// SESSION
// =============================================================================

/// One peer connection.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    registry: Arc<Registry>,
    inner: Mutex<SessionInner>,
    outbound: mpsc::UnboundedSender<DmcMessage>,
    next_call_id: AtomicU64,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    /// Create a session and the receiver of its outgoing messages.
    pub fn new(
        id: SessionId,
        registry: Arc<Registry>,
        config: SessionConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DmcMessage>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Connecting);

        let session = Arc::new(Self {
            id,
            config,
            registry,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                exposed: BTreeSet::new(),
                retired: BTreeSet::new(),
                peer_gone: BTreeSet::new(),
                pending: BTreeMap::new(),
                local_root: None,
                remote_root: None,
                adopted: Vec::new(),
                principal: None,
                peer_name: None,
                close_reason: None,
            }),
            outbound,
            next_call_id: AtomicU64::new(1),
            state_tx,
        });

        (session, outbound_rx)
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Connection role.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Local registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Authenticated subject, if any.
    pub fn principal(&self) -> Option<String> {
        self.inner.lock().principal.clone()
    }

    /// Name the peer announced.
    pub fn peer_name(&self) -> Option<String> {
        self.inner.lock().peer_name.clone()
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.lock().close_reason.clone()
    }

    /// Outbound calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Wait until the session reaches `target`, failing if it closes first.
    pub async fn wait_for(&self, target: SessionState) -> Result<(), SessionError> {
        let mut rx = self.watch_state();
        loop {
            let state = *rx.borrow_and_update();
            if state == target {
                return Ok(());
            }
            if state >= SessionState::Closing && target < SessionState::Closing {
                return Err(SessionError::Closed);
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    fn set_state(&self, inner: &mut SessionInner, next: SessionState) -> bool {
        if !inner.state.can_become(next) {
            return false;
        }

        debug!("Session {} {:?} -> {:?}", short_session(&self.id), inner.state, next);
        inner.state = next;
        self.state_tx.send_replace(next);
        true
    }

    fn send(&self, msg: DmcMessage) -> Result<(), SessionError> {
        self.outbound.send(msg).map_err(|_| SessionError::Closed)
    }

    // =========================================================================
    // ROOTS AND GRANTS
    // =========================================================================

    /// Object exported to the peer during bootstrap.
    pub fn set_local_root(&self, addr: ObjectAddr) -> Result<(), SessionError> {
        if !self.registry.contains(addr) {
            return Err(SessionError::ObjectNotRegistered(addr));
        }
        self.inner.lock().local_root = Some(addr);
        Ok(())
    }

    /// Local root, if set.
    pub fn local_root(&self) -> Option<ObjectAddr> {
        self.inner.lock().local_root
    }

    /// Make a live local object invocable by the peer.
    pub fn grant(&self, addr: ObjectAddr) -> Result<Capability, SessionError> {
        self.expose(addr).map_err(|err| match err {
            CallError::SessionClosed => SessionError::Closed,
            _ => SessionError::ObjectNotRegistered(addr),
        })?;

        Ok(Capability { addr, session: self.id })
    }

    /// Withdraw a grant. Returns whether it was granted.
    ///
    /// The peer is told the object is gone, and later calls on it fault
    /// with `ObjectGone`.
    pub fn revoke(&self, addr: ObjectAddr) -> bool {
        let revoked = {
            let mut inner = self.inner.lock();
            let revoked = inner.exposed.remove(&addr);
            if revoked {
                inner.retired.insert(addr);
            }
            revoked
        };

        if revoked {
            debug!("Revoked {} from {}", addr, short_session(&self.id));
            let _ = self.send(DmcMessage::ObjectGone { target: addr });
        }
        revoked
    }

    /// Whether the peer may invoke `addr`.
    pub fn is_exposed(&self, addr: ObjectAddr) -> bool {
        self.inner.lock().exposed.contains(&addr)
    }

    /// Every granted address.
    pub fn exposed(&self) -> Vec<ObjectAddr> {
        self.inner.lock().exposed.iter().copied().collect()
    }

    fn expose(&self, addr: ObjectAddr) -> Result<(), CallError> {
        match self.registry.resolve(addr) {
            Ok(Resolution::Live(_)) => {}
            Ok(Resolution::Gone) => return Err(CallError::ObjectGone(addr)),
            Err(err) => return Err(err.at(addr)),
        }

        let mut inner = self.inner.lock();
        if inner.state >= SessionState::Closing {
            return Err(CallError::SessionClosed);
        }
        inner.retired.remove(&addr);
        if inner.exposed.insert(addr) {
            debug!("Granted {} to {}", addr, short_session(&self.id));
        }
        Ok(())
    }

    // =========================================================================
    // MARSHALING
    // =========================================================================

    fn export_value(&self, value: &Value) -> Result<WireValue, CallError> {
        Ok(match value {
            Value::Nil => WireValue::Nil,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(x) => WireValue::Float(*x),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Blob(b) => WireValue::Blob(b.clone()),
            Value::Obref(r) if r.is_null() => WireValue::Obref(WireRef::exported(ObjectAddr::NULL)),
            Value::Obref(r) => match r.location() {
                Location::Local => {
                    self.expose(r.addr())?;
                    WireValue::Obref(WireRef::exported(r.addr()))
                }
                Location::Remote(session) if session == self.id => {
                    WireValue::Obref(WireRef::returned(r.addr()))
                }
                Location::Remote(_) => return Err(CallError::ObjectNotRegistered(r.addr())),
            },
        })
    }

    fn import_value(&self, wire: WireValue) -> Result<Value, CallError> {
        Ok(match wire {
            WireValue::Nil => Value::Nil,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(x) => Value::Float(x),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Blob(b) => Value::Blob(b),
            WireValue::Obref(WireRef { addr, .. }) if addr.is_null() => Value::Obref(ObRef::null()),
            WireValue::Obref(WireRef { addr, owner: RefOwner::Sender }) => {
                // A reference the peer sends again has been granted again.
                self.inner.lock().peer_gone.remove(&addr);
                Value::Obref(ObRef::remote(self.id, addr))
            }
            WireValue::Obref(WireRef { addr, owner: RefOwner::Receiver }) => {
                if !self.is_exposed(addr) {
                    return Err(CallError::ObjectNotRegistered(addr));
                }
                Value::Obref(ObRef::local(&self.registry, addr))
            }
        })
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    /// Open the handshake (initiator only).
    pub fn initiate(&self, token: Option<String>) -> Result<(), SessionError> {
        if self.config.role != Role::Initiator {
            return Err(SessionError::InvalidState(self.state()));
        }
        let state = self.state();
        if state != SessionState::Connecting {
            return Err(SessionError::InvalidState(state));
        }

        self.send(DmcMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_version: self.config.version.clone(),
            name: self.config.name.clone(),
            token,
        })
    }

    fn on_hello(
        &self,
        protocol_version: u32,
        client_version: String,
        name: String,
        token: Option<String>,
    ) -> Result<(), SessionError> {
        if self.config.role != Role::Acceptor {
            return self.violation("hello received by initiator");
        }
        if self.state() != SessionState::Connecting {
            return self.violation("duplicate hello");
        }

        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Session {} speaks protocol {}, expected {}",
                short_session(&self.id), protocol_version, PROTOCOL_VERSION
            );
            self.shutdown(&format!("unsupported protocol version {}", protocol_version), true);
            return Err(SessionError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: protocol_version,
            });
        }

        let principal = match authenticate(token.as_deref(), &self.config.auth) {
            Ok(claims) => claims.map(|c| c.sub),
            Err(e) => {
                warn!("Session {} rejected: {}", short_session(&self.id), e);
                self.shutdown(&format!("authentication failed: {}", e), true);
                return Err(SessionError::HandshakeFailed(e.to_string()));
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.principal = principal.clone();
            inner.peer_name = Some(name.clone());
        }

        info!(
            "Session {} hello from {} (client {}, principal {:?})",
            short_session(&self.id), name, client_version, principal
        );

        self.send(DmcMessage::HelloAck {
            session_id: hex::encode(self.id),
            server_version: self.config.version.clone(),
            principal,
        })?;
        self.authenticated()
    }

    fn on_hello_ack(
        &self,
        session_id: String,
        server_version: String,
        principal: Option<String>,
    ) -> Result<(), SessionError> {
        if self.config.role != Role::Initiator {
            return self.violation("hello_ack received by acceptor");
        }
        if self.state() != SessionState::Connecting {
            return self.violation("unexpected hello_ack");
        }

        info!(
            "Session {} accepted by server {} as {}",
            short_session(&self.id), server_version, session_id
        );
        {
            let mut inner = self.inner.lock();
            inner.principal = principal;
            inner.peer_name = Some(format!("server {}", server_version));
        }
        self.authenticated()
    }

    /// Move to `Authenticated` and export the local root.
    fn authenticated(&self) -> Result<(), SessionError> {
        let root = {
            let mut inner = self.inner.lock();
            if !self.set_state(&mut inner, SessionState::Authenticated) {
                return Err(SessionError::InvalidState(inner.state));
            }
            inner.local_root
        };

        let root = match root {
            Some(addr) => match self.expose(addr) {
                Ok(()) => Some(WireRef::exported(addr)),
                Err(e) => {
                    warn!("Session {} root {} unavailable: {}", short_session(&self.id), addr, e);
                    None
                }
            },
            None => None,
        };

        self.send(DmcMessage::Bootstrap { root })
    }

    fn on_bootstrap(&self, root: Option<WireRef>) -> Result<(), SessionError> {
        let remote_root = match root {
            None => None,
            Some(WireRef { addr, owner: RefOwner::Sender }) => Some(addr),
            Some(_) => return self.violation("bootstrap root must be owned by its sender"),
        };

        let mut inner = self.inner.lock();
        if inner.state != SessionState::Authenticated {
            drop(inner);
            return self.violation("bootstrap before authentication");
        }
        inner.remote_root = remote_root;
        self.set_state(&mut inner, SessionState::Active);
        info!("Session {} active (peer root {:?})", short_session(&self.id), remote_root);
        Ok(())
    }

    fn violation(&self, detail: &str) -> Result<(), SessionError> {
        warn!("Session {} protocol violation: {}", short_session(&self.id), detail);
        self.shutdown(&format!("protocol violation: {}", detail), true);
        Err(SessionError::ProtocolViolation(detail.to_string()))
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Handle one inbound message, sending any reply it produces.
    ///
    /// Calls are admitted and executed inline; the driver splits those
    /// phases so that replies to nested calls are never queued behind the
    /// call waiting for them.
    pub async fn dispatch(self: &Arc<Self>, msg: DmcMessage) -> Result<(), SessionError> {
        match msg {
            DmcMessage::Hello { protocol_version, client_version, name, token } => {
                self.on_hello(protocol_version, client_version, name, token)
            }
            DmcMessage::HelloAck { session_id, server_version, principal } => {
                self.on_hello_ack(session_id, server_version, principal)
            }
            DmcMessage::Bootstrap { root } => self.on_bootstrap(root),
            DmcMessage::Call(call) => match self.admit(call).await {
                Admission::Ready(prepared) => self.execute(prepared).await,
                Admission::Rejected => Ok(()),
            },
            DmcMessage::Result { call_id, value } => {
                if let Some(pending) = self.take_pending(call_id) {
                    let _ = pending.reply.send(self.import_value(value));
                }
                Ok(())
            }
            DmcMessage::Fault { call_id, fault } => {
                if let Some(pending) = self.take_pending(call_id) {
                    let _ = pending.reply.send(Err(fault.into_error(pending.target)));
                }
                Ok(())
            }
            DmcMessage::ObjectGone { target } => {
                let mut inner = self.inner.lock();
                inner.peer_gone.insert(target);
                if inner.remote_root == Some(target) {
                    inner.remote_root = None;
                }
                debug!("Session {} peer object {} gone", short_session(&self.id), target);
                Ok(())
            }
            DmcMessage::Goodbye { reason } => {
                info!("Session {} peer said goodbye: {}", short_session(&self.id), reason);
                self.shutdown(&reason, false);
                Ok(())
            }
        }
    }

    fn take_pending(&self, call_id: CallId) -> Option<PendingCall> {
        let pending = self.inner.lock().pending.remove(&call_id);
        if pending.is_none() {
            warn!("Session {} reply for unknown call {}", short_session(&self.id), call_id);
        }
        pending
    }

    /// Check and resolve the target of an inbound call, then queue on it.
    ///
    /// Must be called in arrival order. Only the queue position is taken
    /// here; waiting for the calls ahead happens in [`Session::execute`].
    pub async fn admit(&self, call: MethodCall) -> Admission {
        let MethodCall { call_id, target, method, args } = call;

        match self.prepare(target, args) {
            Ok((cell, args)) => {
                let ticket = cell.enqueue().await;
                Admission::Ready(PreparedCall { call_id, target, method, args, ticket })
            }
            Err(err) => {
                debug!("Session {} rejected call {} on {}: {}", short_session(&self.id), call_id, target, err);
                let _ = self.send(DmcMessage::fault(call_id, &err));
                Admission::Rejected
            }
        }
    }

    fn prepare(
        &self,
        target: ObjectAddr,
        args: Vec<WireValue>,
    ) -> Result<(Arc<ObjectCell>, ArgSet), CallError> {
        if !self.state().is_open() {
            return Err(CallError::SessionClosed);
        }
        {
            let inner = self.inner.lock();
            if inner.retired.contains(&target) {
                return Err(CallError::ObjectGone(target));
            }
            if !inner.exposed.contains(&target) {
                return Err(CallError::ObjectNotRegistered(target));
            }
        }

        let cell = match self.registry.resolve(target) {
            Ok(Resolution::Live(cell)) => cell,
            Ok(Resolution::Gone) => {
                let mut inner = self.inner.lock();
                inner.exposed.remove(&target);
                inner.retired.insert(target);
                return Err(CallError::ObjectGone(target));
            }
            Err(err) => return Err(err.at(target)),
        };

        let args = args
            .into_iter()
            .map(|wire| self.import_value(wire))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((cell, ArgSet::new(args)))
    }

    /// Wait for an admitted call's turn, run it and send its outcome.
    ///
    /// A call that leaves the context stack unbalanced is answered with a
    /// fault and then closes the session.
    pub async fn execute(self: &Arc<Self>, prepared: PreparedCall) -> Result<(), SessionError> {
        let PreparedCall { call_id, target, method, args, ticket } = prepared;
        let mut guard = ticket.redeem().await;
        let peer: Arc<dyn RemotePeer> = self.clone();
        let mut ctx = CallContext::with_peer(self.registry.clone(), peer, self.config.max_call_depth);

        let result = match ctx.stack_mut().push_context(args) {
            Ok(_) => {
                let result = guard.invoke(&method, &mut ctx).await;
                match ctx.stack_mut().pop_context() {
                    Err(err) => Err(err),
                    Ok(_) if !ctx.stack().is_empty() => {
                        Err(CallError::UnbalancedContext { depth: ctx.stack().depth() })
                    }
                    Ok(_) => result,
                }
            }
            Err(err) => Err(err),
        };
        drop(guard);

        let reply = match result {
            Ok(value) => match self.export_value(&value) {
                Ok(value) => DmcMessage::Result { call_id, value },
                Err(err) => DmcMessage::fault(call_id, &err),
            },
            Err(err) if err.is_integrity_violation() => {
                let _ = self.send(DmcMessage::fault(call_id, &err));
                return self.violation(&format!("call {} {}.{}: {}", call_id, target, method, err));
            }
            Err(err) => {
                debug!("Call {} {}.{} failed: {}", call_id, target, method, err);
                DmcMessage::fault(call_id, &err)
            }
        };

        self.send(reply)
    }

    /// Issue a call through a fresh context bound to this session.
    pub async fn call(self: &Arc<Self>, target: &ObRef, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let peer: Arc<dyn RemotePeer> = self.clone();
        let mut ctx = CallContext::with_peer(self.registry.clone(), peer, self.config.max_call_depth);
        target.call(&mut ctx, method, args).await
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// A local object was retired; tell the peer if it could see it.
    pub fn notify_removed(&self, addr: ObjectAddr) {
        let was_exposed = {
            let mut inner = self.inner.lock();
            inner.adopted.retain(|a| *a != addr);
            if inner.local_root == Some(addr) {
                inner.local_root = None;
            }
            let was_exposed = inner.exposed.remove(&addr);
            if was_exposed {
                inner.retired.insert(addr);
            }
            was_exposed
        };

        if was_exposed {
            debug!("Session {} object {} gone", short_session(&self.id), addr);
            let _ = self.send(DmcMessage::ObjectGone { target: addr });
        }
    }

    /// Re-check every grant against the registry after missed notifications.
    pub fn resync_exposed(&self) {
        let stale: Vec<ObjectAddr> = self
            .exposed()
            .into_iter()
            .filter(|addr| !self.registry.contains(*addr))
            .collect();

        for addr in stale {
            self.notify_removed(addr);
        }
    }

    /// Close the session, sending `Goodbye`.
    ///
    /// Returns the adopted objects, which the caller should unregister.
    /// Later calls return whatever was adopted since.
    pub fn close(&self, reason: &str) -> Vec<ObjectAddr> {
        self.shutdown(reason, true);
        std::mem::take(&mut self.inner.lock().adopted)
    }

    fn shutdown(&self, reason: &str, notify_peer: bool) {
        let pending = {
            let mut inner = self.inner.lock();
            if !self.set_state(&mut inner, SessionState::Closing) {
                return;
            }
            inner.exposed.clear();
            inner.close_reason = Some(reason.to_string());
            std::mem::take(&mut inner.pending)
        };

        info!("Session {} closing: {}", short_session(&self.id), reason);
        for (_, call) in pending {
            let _ = call.reply.send(Err(CallError::SessionClosed));
        }
        if notify_peer {
            let _ = self.send(DmcMessage::Goodbye { reason: reason.to_string() });
        }

        let mut inner = self.inner.lock();
        self.set_state(&mut inner, SessionState::Closed);
    }
}

#[async_trait]
impl RemotePeer for Session {
    fn session_id(&self) -> SessionId {
        self.id
    }

    async fn call_remote(
        &self,
        target: ObjectAddr,
        method: &str,
        args: &ArgSet,
    ) -> Result<Value, CallError> {
        let wire_args = args
            .iter()
            .map(|value| self.export_value(value))
            .collect::<Result<Vec<_>, _>>()?;

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_open() {
                return Err(CallError::SessionClosed);
            }
            if inner.peer_gone.contains(&target) {
                return Err(CallError::ObjectGone(target));
            }
            inner.pending.insert(call_id, PendingCall { target, reply: reply_tx });
        }

        let call = MethodCall {
            call_id,
            target,
            method: method.to_string(),
            args: wire_args,
        };
        if self.send(DmcMessage::Call(call)).is_err() {
            self.inner.lock().pending.remove(&call_id);
            return Err(CallError::SessionClosed);
        }

        reply_rx.await.unwrap_or(Err(CallError::SessionClosed))
    }

    fn remote_root(&self) -> Option<ObRef> {
        self.inner.lock().remote_root.map(|addr| ObRef::remote(self.id, addr))
    }

    fn adopt(&self, addr: ObjectAddr) {
        let mut inner = self.inner.lock();
        if !inner.adopted.contains(&addr) {
            inner.adopted.push(addr);
        }
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Manages all live sessions of a host.
pub struct SessionManager {
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create and track a session with a fresh id.
    pub async fn create(
        &self,
        registry: Arc<Registry>,
        config: SessionConfig,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<DmcMessage>) {
        let id = uuid::Uuid::new_v4().into_bytes();
        let (session, outbound) = Session::new(id, registry, config);

        let mut sessions = self.sessions.write().await;
        sessions.insert(id, session.clone());

        (session, outbound)
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Stop tracking a session.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id)
    }

    /// Tracked session count.
    pub async fn count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    /// Drop closed sessions. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.state() != SessionState::Closed);
        before - sessions.len()
    }

    /// Close every session, returning all adopted objects.
    pub async fn close_all(&self, reason: &str) -> Vec<ObjectAddr> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .flat_map(|session| session.close(reason))
            .collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
