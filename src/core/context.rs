//! Call Context Stack
//!
//! LIFO stack of call frames. A frame is pushed for every invocation (local
//! or remote) and popped on return; a handler that pops without a matching
//! push is a protocol-integrity fault, not a user error.
//!
//! [`CallContext`] bundles the stack with the registry, the session seam and
//! the chain of objects currently executing, and is what object handlers
//! receive.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::CallError;
use super::ident::{ObjectAddr, SessionId};
use super::obref::{Location, ObRef};
use super::registry::Registry;
use super::value::{Value, ValueType};

// =============================================================================
// ARGUMENT SET
// =============================================================================

/// Ordered arguments of one call frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgSet {
    values: Vec<Value>,
}

impl ArgSet {
    /// Frame holding `values`.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Frame with no arguments.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check for no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over arguments in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// Argument at `index`.
    pub fn get(&self, index: usize) -> Result<&Value, CallError> {
        self.values.get(index).ok_or(CallError::ArgumentMissing { index })
    }

    /// Integer argument.
    pub fn int(&self, index: usize) -> Result<i64, CallError> {
        let value = self.get(index)?;
        value.as_int().ok_or_else(|| mismatch(index, ValueType::Int, value))
    }

    /// Float argument.
    pub fn float(&self, index: usize) -> Result<f64, CallError> {
        let value = self.get(index)?;
        value.as_float().ok_or_else(|| mismatch(index, ValueType::Float, value))
    }

    /// Boolean argument.
    pub fn bool(&self, index: usize) -> Result<bool, CallError> {
        let value = self.get(index)?;
        value.as_bool().ok_or_else(|| mismatch(index, ValueType::Bool, value))
    }

    /// String argument.
    pub fn string(&self, index: usize) -> Result<&str, CallError> {
        let value = self.get(index)?;
        value.as_str().ok_or_else(|| mismatch(index, ValueType::String, value))
    }

    /// Blob argument.
    pub fn blob(&self, index: usize) -> Result<&[u8], CallError> {
        let value = self.get(index)?;
        value.as_blob().ok_or_else(|| mismatch(index, ValueType::Blob, value))
    }

    /// Object reference argument.
    pub fn obref(&self, index: usize) -> Result<&ObRef, CallError> {
        let value = self.get(index)?;
        value.as_obref().ok_or_else(|| mismatch(index, ValueType::Obref, value))
    }

    /// Consume into the argument values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

fn mismatch(index: usize, expected: ValueType, found: &Value) -> CallError {
    CallError::ArgumentType { index, expected, found: found.value_type() }
}

impl From<Vec<Value>> for ArgSet {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

// =============================================================================
// CONTEXT MANAGER
// =============================================================================

/// Handle to a pushed frame, valid only while that frame is on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    serial: u64,
}

impl FrameHandle {
    /// Arguments of this frame, if it is still the top of the stack.
    pub fn args<'a>(&self, stack: &'a ContextManager) -> Result<&'a ArgSet, CallError> {
        match stack.frames.last() {
            Some((serial, args)) if *serial == self.serial => Ok(args),
            _ => Err(CallError::FrameInactive),
        }
    }
}

/// LIFO stack of active call frames.
#[derive(Debug)]
pub struct ContextManager {
    frames: Vec<(u64, ArgSet)>,
    max_depth: usize,
    next_serial: u64,
}

impl ContextManager {
    /// Empty stack with a depth limit.
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
            next_serial: 0,
        }
    }

    /// Push a frame.
    pub fn push_context(&mut self, args: ArgSet) -> Result<FrameHandle, CallError> {
        if self.frames.len() >= self.max_depth {
            return Err(CallError::CallDepthExceeded { limit: self.max_depth });
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        self.frames.push((serial, args));
        Ok(FrameHandle { serial })
    }

    /// Pop the top frame.
    pub fn pop_context(&mut self) -> Result<ArgSet, CallError> {
        self.frames
            .pop()
            .map(|(_, args)| args)
            .ok_or(CallError::ArgumentStackEmpty)
    }

    /// Top frame.
    pub fn current(&self) -> Option<&ArgSet> {
        self.frames.last().map(|(_, args)| args)
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Check for no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Depth limit.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub(crate) fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_CALL_DEPTH)
    }
}

// =============================================================================
// REMOTE PEER SEAM
// =============================================================================

/// The session a context forwards remote calls through.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Session id that remote refs through this peer carry.
    fn session_id(&self) -> SessionId;

    /// Send a call to the peer and wait for its outcome.
    async fn call_remote(
        &self,
        target: ObjectAddr,
        method: &str,
        args: &ArgSet,
    ) -> Result<Value, CallError>;

    /// Root object the peer exported, once bootstrapped.
    fn remote_root(&self) -> Option<ObRef>;

    /// Tie a local object's lifetime to the session.
    fn adopt(&self, addr: ObjectAddr);
}

// =============================================================================
// CALL CONTEXT
// =============================================================================

/// Everything a handler can reach while executing.
pub struct CallContext {
    stack: ContextManager,
    registry: Arc<Registry>,
    peer: Option<Arc<dyn RemotePeer>>,
    active: Vec<ObjectAddr>,
}

impl CallContext {
    /// Context without a peer; remote refs fail with `SessionClosed`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            stack: ContextManager::default(),
            registry,
            peer: None,
            active: Vec::new(),
        }
    }

    /// Context bound to a session.
    pub fn with_peer(registry: Arc<Registry>, peer: Arc<dyn RemotePeer>, max_depth: usize) -> Self {
        Self {
            stack: ContextManager::new(max_depth),
            registry,
            peer: Some(peer),
            active: Vec::new(),
        }
    }

    /// Arguments of the executing call.
    pub fn args(&self) -> Result<&ArgSet, CallError> {
        self.stack.current().ok_or(CallError::ArgumentStackEmpty)
    }

    /// Argument `index` of the executing call.
    pub fn arg(&self, index: usize) -> Result<&Value, CallError> {
        self.args()?.get(index)
    }

    /// The frame stack.
    pub fn stack(&self) -> &ContextManager {
        &self.stack
    }

    /// Mutable frame stack.
    pub fn stack_mut(&mut self) -> &mut ContextManager {
        &mut self.stack
    }

    /// Local registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Session seam, if any.
    pub fn peer(&self) -> Option<&Arc<dyn RemotePeer>> {
        self.peer.as_ref()
    }

    /// Objects currently executing in this chain, outermost first.
    pub fn active_chain(&self) -> &[ObjectAddr] {
        &self.active
    }

    pub(crate) fn enter(&mut self, addr: ObjectAddr) {
        self.active.push(addr);
    }

    pub(crate) fn leave(&mut self, addr: ObjectAddr) {
        if let Some(pos) = self.active.iter().rposition(|a| *a == addr) {
            self.active.remove(pos);
        }
    }

    /// Invoke `method` on `target` with `args` as a new frame.
    ///
    /// The frame is popped before returning. If the callee left the stack
    /// unbalanced the stack is restored and the call fails with an
    /// integrity error.
    pub async fn call(
        &mut self,
        target: &ObRef,
        method: &str,
        args: ArgSet,
    ) -> Result<Value, CallError> {
        if target.is_null() {
            return Err(CallError::ObjectNull);
        }

        let base = self.stack.depth();
        self.stack.push_context(args)?;

        let result = self.dispatch(target, method).await;

        let expected = base + 1;
        let depth = self.stack.depth();
        if depth != expected {
            self.stack.truncate(base);
            return Err(if depth > expected {
                CallError::UnbalancedContext { depth: depth - expected }
            } else {
                CallError::ArgumentStackEmpty
            });
        }

        self.stack.pop_context()?;
        result
    }

    async fn dispatch(&mut self, target: &ObRef, method: &str) -> Result<Value, CallError> {
        let addr = target.addr();

        match target.location() {
            Location::Local => {
                if self.active.contains(&addr) {
                    return Err(CallError::ReentrantCall(addr));
                }
                let cell = target.resolve_local(&self.registry)?;
                cell.invoke(method, self).await
            }
            Location::Remote(session) => {
                let peer = self.peer.clone().ok_or(CallError::SessionClosed)?;
                if peer.session_id() != session {
                    return Err(CallError::ObjectNotRegistered(addr));
                }
                let args = self.args()?;
                peer.call_remote(addr, method, args).await
            }
        }
    }
}
