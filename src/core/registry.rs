//! Object Registry
//!
//! Bounded, process-wide arena of locally exposed objects.
//!
//! ```text
//! slots:  [ #1@0 Account ][ #2@3  (free) ][ #3@1 WorldRoot ] ...
//!                              ^ generation bumped on every reclaim
//! ```
//!
//! The registry is the sole owner of every object. Everything else holds an
//! [`ObjectAddr`] (slot id + generation) and goes through [`Registry::resolve`],
//! so a stale address is a checked outcome rather than a dangling handle.
//!
//! A single lock guards the slot array: a resolve racing an unregister sees
//! either the live generation or the bumped one, never a torn slot. Calls
//! into one object are serialized by that object's own async mutex, so
//! unrelated objects run in parallel.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::context::CallContext;
use super::error::CallError;
use super::ident::{Generation, ObjectAddr, ObjectId};
use super::object::{find_method, MethodInfo, RemoteObject};
use super::value::Value;

/// Buffered removal notifications per subscriber before it lags.
const REMOVAL_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// ERRORS
// =============================================================================

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Registration attempted at capacity.
    #[error("registry full: exceeded {capacity} maximum objects")]
    RegistryFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// Id or address was never issued, or the slot is already free.
    #[error("object {0} not registered")]
    ObjectNotRegistered(ObjectId),

    /// The null id was used.
    #[error("null object id")]
    ObjectNull,
}

impl RegistryError {
    /// Convert to a call error about `addr`.
    pub fn at(self, addr: ObjectAddr) -> CallError {
        match self {
            RegistryError::RegistryFull { capacity } => CallError::RegistryFull { capacity },
            RegistryError::ObjectNotRegistered(_) => CallError::ObjectNotRegistered(addr),
            RegistryError::ObjectNull => CallError::ObjectNull,
        }
    }
}

impl From<RegistryError> for CallError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ObjectNotRegistered(id) => {
                CallError::ObjectNotRegistered(ObjectAddr::new(id, Generation::default()))
            }
            other => other.at(ObjectAddr::NULL),
        }
    }
}

// =============================================================================
// OBJECT CELL
// =============================================================================

/// Registry-owned wrapper around one object.
pub struct ObjectCell {
    addr: ObjectAddr,
    type_name: &'static str,
    methods: &'static [MethodInfo],
    object: Arc<AsyncMutex<Box<dyn RemoteObject>>>,
    retired: AtomicBool,
}

impl ObjectCell {
    fn new(addr: ObjectAddr, object: Box<dyn RemoteObject>) -> Self {
        Self {
            addr,
            type_name: object.type_name(),
            methods: object.methods(),
            object: Arc::new(AsyncMutex::new(object)),
            retired: AtomicBool::new(false),
        }
    }

    /// Address this cell was registered under.
    pub fn addr(&self) -> ObjectAddr {
        self.addr
    }

    /// Object type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Object method table.
    pub fn methods(&self) -> &'static [MethodInfo] {
        self.methods
    }

    /// Whether the slot has been reclaimed.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Wait for exclusive access to the object.
    pub async fn acquire(&self) -> ObjectGuard {
        ObjectGuard {
            addr: self.addr,
            methods: self.methods,
            object: self.object.clone().lock_owned().await,
        }
    }

    /// Join this object's call queue without waiting for the calls ahead.
    ///
    /// Tickets are served in the order they were taken, so taking them in
    /// arrival order keeps calls to one object in arrival order while calls
    /// to other objects go ahead independently.
    pub async fn enqueue(self: &Arc<Self>) -> Ticket {
        let cell = self.clone();
        let mut wait: BoxFuture<'static, ObjectGuard> = Box::pin(async move { cell.acquire().await });

        // The first poll places the waiter in the mutex queue.
        match futures_util::poll!(&mut wait) {
            Poll::Ready(guard) => Ticket::Ready(guard),
            Poll::Pending => Ticket::Queued(wait),
        }
    }

    /// Acquire and invoke in one step.
    pub async fn invoke(&self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        let mut guard = self.acquire().await;
        guard.invoke(method, ctx).await
    }
}

impl std::fmt::Debug for ObjectCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCell")
            .field("addr", &self.addr)
            .field("type_name", &self.type_name)
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// A place in one object's call queue. See [`ObjectCell::enqueue`].
pub enum Ticket {
    /// The object was free; access is already held.
    Ready(ObjectGuard),
    /// Waiting behind earlier calls.
    Queued(BoxFuture<'static, ObjectGuard>),
}

impl Ticket {
    /// Wait for this ticket's turn.
    pub async fn redeem(self) -> ObjectGuard {
        match self {
            Ticket::Ready(guard) => guard,
            Ticket::Queued(wait) => wait.await,
        }
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ticket::Ready(guard) => f.debug_tuple("Ready").field(&guard.addr).finish(),
            Ticket::Queued(_) => f.write_str("Queued"),
        }
    }
}

/// Exclusive access to one object, held for the duration of a call.
pub struct ObjectGuard {
    addr: ObjectAddr,
    methods: &'static [MethodInfo],
    object: OwnedMutexGuard<Box<dyn RemoteObject>>,
}

impl ObjectGuard {
    /// Address of the guarded object.
    pub fn addr(&self) -> ObjectAddr {
        self.addr
    }

    /// Check `method` and the top frame against the method table, then run it.
    pub async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        let info = find_method(self.methods, method).ok_or_else(|| {
            CallError::MethodNotImplemented { method: method.to_string() }
        })?;
        info.check_args(ctx.args()?)?;

        ctx.enter(self.addr);
        let result = self.object.invoke(method, ctx).await;
        ctx.leave(self.addr);
        result
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Outcome of resolving an address.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The address is current.
    Live(Arc<ObjectCell>),
    /// The slot was reclaimed after the address was issued.
    Gone,
}

impl Resolution {
    /// Live cell, or `ObjectGone` for `addr`.
    pub fn live(self, addr: ObjectAddr) -> Result<Arc<ObjectCell>, CallError> {
        match self {
            Resolution::Live(cell) => Ok(cell),
            Resolution::Gone => Err(CallError::ObjectGone(addr)),
        }
    }

    /// Check for `Gone`.
    pub fn is_gone(&self) -> bool {
        matches!(self, Resolution::Gone)
    }
}

struct Slot {
    generation: Generation,
    cell: Option<Arc<ObjectCell>>,
    /// Every generation has been issued; the slot is never reused.
    exhausted: bool,
}

struct RegistryInner {
    slots: Vec<Slot>,
    /// Vacant slot indices; the lowest is reused first.
    free: BTreeSet<usize>,
    live: usize,
}

/// Bounded table of locally exposed objects.
pub struct Registry {
    capacity: usize,
    inner: Mutex<RegistryInner>,
    removed_tx: broadcast::Sender<ObjectAddr>,
}

impl Registry {
    /// Create a registry holding at most `capacity` live objects.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "registry capacity must be positive");
        let (removed_tx, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);

        Self {
            capacity,
            inner: Mutex::new(RegistryInner {
                slots: Vec::new(),
                free: BTreeSet::new(),
                live: 0,
            }),
            removed_tx,
        }
    }

    /// Register an object in the lowest free slot.
    pub fn register(&self, object: Box<dyn RemoteObject>) -> Result<ObjectAddr, RegistryError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.live >= self.capacity {
            return Err(RegistryError::RegistryFull { capacity: self.capacity });
        }

        let index = match inner.free.pop_first() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: Generation::default(),
                    cell: None,
                    exhausted: false,
                });
                inner.slots.len() - 1
            }
        };

        let slot = &mut inner.slots[index];
        let addr = ObjectAddr::new(ObjectId::from_slot(index), slot.generation);
        let cell = ObjectCell::new(addr, object);
        debug!("Registered {} as {}", cell.type_name, addr);
        slot.cell = Some(Arc::new(cell));
        inner.live += 1;

        Ok(addr)
    }

    /// Reclaim a slot, invalidating every outstanding address to it.
    ///
    /// Returns the retired address. Calls already holding the object finish
    /// normally; only new resolutions fail.
    pub fn unregister(&self, id: ObjectId) -> Result<ObjectAddr, RegistryError> {
        let index = id.slot_index().ok_or(RegistryError::ObjectNull)?;

        let cell = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let slot = inner
                .slots
                .get_mut(index)
                .ok_or(RegistryError::ObjectNotRegistered(id))?;
            let cell = slot.cell.take().ok_or(RegistryError::ObjectNotRegistered(id))?;

            match slot.generation.next() {
                Some(next) => {
                    slot.generation = next;
                    inner.free.insert(index);
                }
                None => {
                    warn!("Slot {} ran out of generations, retiring it", index);
                    slot.exhausted = true;
                }
            }
            cell.retired.store(true, Ordering::Release);
            inner.live -= 1;
            cell
        };

        let addr = cell.addr;
        debug!("Unregistered {} ({})", addr, cell.type_name);
        drop(cell);

        // No subscribers is fine.
        let _ = self.removed_tx.send(addr);
        Ok(addr)
    }

    /// Resolve an address with a generation check.
    pub fn resolve(&self, addr: ObjectAddr) -> Result<Resolution, RegistryError> {
        let index = addr.id.slot_index().ok_or(RegistryError::ObjectNull)?;

        let inner = self.inner.lock();
        let slot = inner
            .slots
            .get(index)
            .ok_or(RegistryError::ObjectNotRegistered(addr.id))?;

        match &slot.cell {
            Some(cell) if slot.generation == addr.generation => Ok(Resolution::Live(cell.clone())),
            _ if addr.generation < slot.generation || slot.exhausted => Ok(Resolution::Gone),
            _ => Err(RegistryError::ObjectNotRegistered(addr.id)),
        }
    }

    /// Whether `addr` currently resolves to a live object.
    pub fn contains(&self, addr: ObjectAddr) -> bool {
        matches!(self.resolve(addr), Ok(Resolution::Live(_)))
    }

    /// Current address of a live id.
    pub fn current_addr(&self, id: ObjectId) -> Option<ObjectAddr> {
        let index = id.slot_index()?;
        let inner = self.inner.lock();
        inner.slots.get(index)?.cell.as_ref().map(|cell| cell.addr)
    }

    /// Addresses of every live object, in slot order.
    pub fn live_addrs(&self) -> Vec<ObjectAddr> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter_map(|slot| slot.cell.as_ref().map(|cell| cell.addr))
            .collect()
    }

    /// Subscribe to retired addresses.
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectAddr> {
        self.removed_tx.subscribe()
    }

    /// Retire every live object, notifying subscribers of each.
    pub fn shutdown(&self) -> Vec<ObjectAddr> {
        let ids: Vec<ObjectId> = self.live_addrs().into_iter().map(|addr| addr.id).collect();
        ids.into_iter()
            .filter_map(|id| self.unregister(id).ok())
            .collect()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    /// Check for no live objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the next registration would fail.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(crate::DEFAULT_REGISTRY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::ArgSet;
    use crate::testing::Probe;
    use proptest::prelude::*;

    fn probe() -> Box<dyn RemoteObject> {
        Box::new(Probe::new())
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = Registry::new(4);
        let addr = registry.register(probe()).unwrap();

        assert_eq!(addr.id, ObjectId(1));
        assert_eq!(registry.len(), 1);

        match registry.resolve(addr).unwrap() {
            Resolution::Live(cell) => {
                assert_eq!(cell.addr(), addr);
                assert_eq!(cell.type_name(), "probe");
            }
            Resolution::Gone => panic!("fresh address resolved as gone"),
        }
    }

    #[test]
    fn test_lowest_free_slot_reused() {
        let registry = Registry::new(4);
        let a = registry.register(probe()).unwrap();
        let b = registry.register(probe()).unwrap();
        let c = registry.register(probe()).unwrap();

        registry.unregister(b.id).unwrap();
        registry.unregister(a.id).unwrap();

        let d = registry.register(probe()).unwrap();
        assert_eq!(d.id, a.id);
        assert_ne!(d.generation, a.generation);

        let e = registry.register(probe()).unwrap();
        assert_eq!(e.id, b.id);
        assert!(registry.contains(c));
    }

    #[test]
    fn test_unregister_makes_address_gone() {
        let registry = Registry::new(2);
        let old = registry.register(probe()).unwrap();
        registry.unregister(old.id).unwrap();

        assert!(registry.resolve(old).unwrap().is_gone());

        let fresh = registry.register(probe()).unwrap();
        assert_eq!(fresh.id, old.id);
        assert_ne!(fresh.generation, old.generation);
        assert!(registry.resolve(old).unwrap().is_gone());
        assert!(registry.contains(fresh));
    }

    #[test]
    fn test_unregister_free_slot_fails() {
        let registry = Registry::new(2);
        let addr = registry.register(probe()).unwrap();
        registry.unregister(addr.id).unwrap();

        assert_eq!(
            registry.unregister(addr.id),
            Err(RegistryError::ObjectNotRegistered(addr.id))
        );
        assert_eq!(
            registry.unregister(ObjectId(99)),
            Err(RegistryError::ObjectNotRegistered(ObjectId(99)))
        );
        assert_eq!(registry.unregister(ObjectId::NULL), Err(RegistryError::ObjectNull));
    }

    #[test]
    fn test_resolve_never_issued() {
        let registry = Registry::new(2);
        let addr = registry.register(probe()).unwrap();

        let future_generation = ObjectAddr::new(addr.id, Generation(addr.generation.0 + 1));
        assert!(matches!(
            registry.resolve(future_generation),
            Err(RegistryError::ObjectNotRegistered(_))
        ));
        assert!(matches!(
            registry.resolve(ObjectAddr::new(ObjectId(7), Generation(0))),
            Err(RegistryError::ObjectNotRegistered(_))
        ));
        assert!(matches!(registry.resolve(ObjectAddr::NULL), Err(RegistryError::ObjectNull)));
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let registry = Registry::new(2);
        let first = registry.register(probe()).unwrap();
        registry.unregister(first.id).unwrap();
        registry.inner.lock().slots[0].generation = Generation(u32::MAX);

        let last = registry.register(probe()).unwrap();
        assert_eq!(last, ObjectAddr::new(first.id, Generation(u32::MAX)));
        registry.unregister(last.id).unwrap();

        assert!(registry.resolve(last).unwrap().is_gone());
        assert!(registry.resolve(first).unwrap().is_gone());

        let next = registry.register(probe()).unwrap();
        assert_ne!(next.id, last.id);
        assert!(registry.resolve(last).unwrap().is_gone());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_rejected() {
        let _ = Registry::new(0);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let capacity = 5;
        let registry = Registry::new(capacity);
        let addrs: Vec<_> = (0..capacity).map(|_| registry.register(probe()).unwrap()).collect();

        assert!(registry.is_full());
        assert_eq!(
            registry.register(probe()),
            Err(RegistryError::RegistryFull { capacity })
        );

        for addr in addrs {
            assert!(registry.contains(addr));
        }
    }

    #[test]
    fn test_removal_notifications() {
        let registry = Registry::new(4);
        let mut removed = registry.subscribe();
        let a = registry.register(probe()).unwrap();
        let b = registry.register(probe()).unwrap();

        registry.unregister(a.id).unwrap();
        assert_eq!(removed.try_recv().unwrap(), a);

        let retired = registry.shutdown();
        assert_eq!(retired, vec![b]);
        assert_eq!(removed.try_recv().unwrap(), b);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_guard_survives_unregister() {
        let registry = Arc::new(Registry::new(2));
        let addr = registry.register(probe()).unwrap();
        let cell = registry.resolve(addr).unwrap().live(addr).unwrap();

        let mut guard = cell.acquire().await;
        registry.unregister(addr.id).unwrap();
        assert!(cell.is_retired());

        let mut ctx = CallContext::new(registry.clone());
        ctx.stack_mut().push_context(ArgSet::empty()).unwrap();
        let result = guard.invoke("ping", &mut ctx).await;
        assert_eq!(result, Ok(Value::from("pong")));

        assert!(registry.resolve(addr).unwrap().is_gone());
    }

    #[tokio::test]
    async fn test_unknown_method_rejected_before_invoke() {
        let registry = Arc::new(Registry::new(2));
        let probe = Probe::new();
        let stats = probe.stats();
        let addr = registry.register(Box::new(probe)).unwrap();
        let cell = registry.resolve(addr).unwrap().live(addr).unwrap();

        let mut ctx = CallContext::new(registry.clone());
        ctx.stack_mut().push_context(ArgSet::empty()).unwrap();
        let result = cell.invoke("fly", &mut ctx).await;

        assert_eq!(result, Err(CallError::MethodNotImplemented { method: "fly".into() }));
        assert_eq!(stats.calls(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Unregister(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            2 => Just(Op::Register),
            1 => (0usize..16).prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn prop_capacity_and_generations(capacity in 1usize..8, ops in prop::collection::vec(op_strategy(), 1..64)) {
            let registry = Registry::new(capacity);
            let mut live: Vec<ObjectAddr> = Vec::new();
            let mut retired: Vec<ObjectAddr> = Vec::new();

            for op in ops {
                match op {
                    Op::Register => {
                        let result = registry.register(probe());
                        if live.len() >= capacity {
                            prop_assert_eq!(result, Err(RegistryError::RegistryFull { capacity }));
                        } else {
                            live.push(result.unwrap());
                        }
                    }
                    Op::Unregister(pick) => {
                        if live.is_empty() {
                            continue;
                        }
                        let addr = live.remove(pick % live.len());
                        prop_assert_eq!(registry.unregister(addr.id), Ok(addr));
                        retired.push(addr);
                    }
                }

                prop_assert!(registry.len() <= capacity);
                prop_assert_eq!(registry.len(), live.len());
            }

            for addr in &live {
                prop_assert!(registry.contains(*addr));
            }
            for addr in &retired {
                prop_assert!(registry.resolve(*addr).unwrap().is_gone());
            }
        }
    }
}
