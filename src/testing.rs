//! Test fixtures: instrumented objects and an in-process session pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Barrier, Notify};

use crate::core::context::{ArgSet, CallContext, RemotePeer};
use crate::core::error::CallError;
use crate::core::ident::ObjectAddr;
use crate::core::object::{MethodInfo, RemoteObject};
use crate::core::obref::ObRef;
use crate::core::registry::Registry;
use crate::core::value::{Value, ValueType};
use crate::network::driver::{channel_frames, run_session};
use crate::network::protocol::DmcMessage;
use crate::network::session::{Session, SessionConfig, SessionState};

const PROBE_METHODS: &[MethodInfo] = &[
    MethodInfo::new("get_type", &[]),
    MethodInfo::new("ping", &[]),
    MethodInfo::new("echo", &[ValueType::String]),
    MethodInfo::new("pop_frame", &[]),
    MethodInfo::new("leak_frame", &[]),
    MethodInfo::new("sleep", &[ValueType::Int]),
    MethodInfo::new("meet", &[]),
];

/// Counters shared between a [`Probe`] and the test holding it.
#[derive(Debug, Default)]
pub(crate) struct ProbeStats {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ProbeStats {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Object that counts its invocations and misbehaves on request.
pub(crate) struct Probe {
    stats: Arc<ProbeStats>,
    barrier: Option<Arc<Barrier>>,
}

impl Probe {
    pub(crate) fn new() -> Self {
        Self { stats: Arc::default(), barrier: None }
    }

    /// Probe whose `meet` waits on `barrier`.
    pub(crate) fn with_barrier(barrier: Arc<Barrier>) -> Self {
        Self { stats: Arc::default(), barrier: Some(barrier) }
    }

    pub(crate) fn stats(&self) -> Arc<ProbeStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl RemoteObject for Probe {
    fn type_name(&self) -> &'static str {
        "probe"
    }

    fn methods(&self) -> &'static [MethodInfo] {
        PROBE_METHODS
    }

    async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);

        match method {
            "get_type" => Ok(Value::from(self.type_name())),
            "ping" => Ok(Value::from("pong")),
            "echo" => Ok(ctx.arg(0)?.clone()),
            "pop_frame" => {
                ctx.stack_mut().pop_context()?;
                Ok(Value::Nil)
            }
            "leak_frame" => {
                ctx.stack_mut().push_context(ArgSet::empty())?;
                Ok(Value::Nil)
            }
            "sleep" => {
                let ms = ctx.args()?.int(0)?.max(0) as u64;
                let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Nil)
            }
            "meet" => {
                if let Some(barrier) = &self.barrier {
                    barrier.wait().await;
                }
                Ok(Value::Nil)
            }
            other => Err(CallError::MethodNotImplemented { method: other.to_string() }),
        }
    }
}

const RELAY_METHODS: &[MethodInfo] = &[
    MethodInfo::new("get_type", &[]),
    MethodInfo::new("forward", &[ValueType::Obref, ValueType::String]),
];

/// Object that calls `method` on whatever reference it is handed.
pub(crate) struct Relay;

#[async_trait]
impl RemoteObject for Relay {
    fn type_name(&self) -> &'static str {
        "relay"
    }

    fn methods(&self) -> &'static [MethodInfo] {
        RELAY_METHODS
    }

    async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        match method {
            "get_type" => Ok(Value::from(self.type_name())),
            "forward" => {
                let args = ctx.args()?;
                let target = args.obref(0)?.clone();
                let method = args.string(1)?.to_string();
                target.call(ctx, &method, vec![]).await
            }
            other => Err(CallError::MethodNotImplemented { method: other.to_string() }),
        }
    }
}

const BOUNCE_METHODS: &[MethodInfo] = &[
    MethodInfo::new("get_type", &[]),
    MethodInfo::new("bounce", &[]),
];

/// Object whose `bounce` waits for a release, then pings `target`.
pub(crate) struct Bounce {
    target: ObRef,
    release: Arc<Notify>,
}

impl Bounce {
    pub(crate) fn new(target: ObRef, release: Arc<Notify>) -> Self {
        Self { target, release }
    }
}

#[async_trait]
impl RemoteObject for Bounce {
    fn type_name(&self) -> &'static str {
        "bounce"
    }

    fn methods(&self) -> &'static [MethodInfo] {
        BOUNCE_METHODS
    }

    async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        match method {
            "get_type" => Ok(Value::from(self.type_name())),
            "bounce" => {
                self.release.notified().await;
                self.target.call(ctx, "ping", vec![]).await
            }
            other => Err(CallError::MethodNotImplemented { method: other.to_string() }),
        }
    }
}

/// Two active sessions wired back to back over channels.
pub(crate) struct Pair {
    pub server: Arc<Session>,
    pub client: Arc<Session>,
    pub server_registry: Arc<Registry>,
    pub client_registry: Arc<Registry>,
    pub client_root: ObjectAddr,
}

pub(crate) async fn loopback(server_root: Box<dyn RemoteObject>, client_root: Box<dyn RemoteObject>) -> Pair {
    let server_registry = Arc::new(Registry::new(16));
    let client_registry = Arc::new(Registry::new(16));
    let server_root = server_registry.register(server_root).unwrap();
    let client_root = client_registry.register(client_root).unwrap();

    let (server, server_out) = Session::new([0xa0; 16], server_registry.clone(), SessionConfig::default());
    let (client, client_out) =
        Session::new([0xb0; 16], client_registry.clone(), SessionConfig::initiator("loopback"));
    server.set_local_root(server_root).unwrap();
    client.set_local_root(client_root).unwrap();

    tokio::spawn(run_session(server.clone(), channel_frames(client_out)));
    tokio::spawn(run_session(client.clone(), channel_frames(server_out)));

    client.initiate(None).unwrap();
    for session in [&client, &server] {
        tokio::time::timeout(Duration::from_secs(5), session.wait_for(SessionState::Active))
            .await
            .unwrap()
            .unwrap();
    }

    Pair { server, client, server_registry, client_registry, client_root }
}

pub(crate) async fn next_message(rx: &mut mpsc::UnboundedReceiver<DmcMessage>) -> DmcMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no message within 5s")
        .expect("outbound channel closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_calls_to_one_object_are_serialized() {
        let probe = Probe::new();
        let stats = probe.stats();
        let pair = loopback(Box::new(probe), Box::new(Probe::new())).await;
        let root = pair.client.remote_root().unwrap();

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let client = pair.client.clone();
                let root = root.clone();
                tokio::spawn(async move { client.call(&root, "sleep", vec![Value::Int(20)]).await })
            })
            .collect();
        for call in calls {
            assert_eq!(call.await.unwrap(), Ok(Value::Nil));
        }

        assert_eq!(stats.calls(), 4);
        assert_eq!(stats.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_distinct_objects_run_in_parallel() {
        let barrier = Arc::new(Barrier::new(2));
        let pair = loopback(Box::new(Probe::new()), Box::new(Probe::new())).await;
        let a = pair.server_registry.register(Box::new(Probe::with_barrier(barrier.clone()))).unwrap();
        let b = pair.server_registry.register(Box::new(Probe::with_barrier(barrier))).unwrap();
        pair.server.grant(a).unwrap();
        pair.server.grant(b).unwrap();

        let meet = |addr| {
            let client = pair.client.clone();
            let target = ObRef::remote(client.id(), addr);
            tokio::spawn(async move { client.call(&target, "meet", vec![]).await })
        };
        let (first, second) = (meet(a), meet(b));

        // Both calls must be inside their handlers at once for either to return.
        let results = tokio::time::timeout(Duration::from_secs(5), async {
            (first.await.unwrap(), second.await.unwrap())
        })
        .await
        .unwrap();
        assert_eq!(results, (Ok(Value::Nil), Ok(Value::Nil)));
    }

    #[tokio::test]
    async fn test_busy_object_does_not_hold_up_others() {
        let pair = loopback(Box::new(Probe::new()), Box::new(Probe::new())).await;
        let busy = pair.client.remote_root().unwrap();
        let idle = pair.server_registry.register(Box::new(Probe::new())).unwrap();
        pair.server.grant(idle).unwrap();
        let idle = ObRef::remote(pair.client.id(), idle);

        let sleepers: Vec<_> = (0..2)
            .map(|_| {
                let client = pair.client.clone();
                let busy = busy.clone();
                tokio::spawn(async move { client.call(&busy, "sleep", vec![Value::Int(400)]).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        assert_eq!(pair.client.call(&idle, "ping", vec![]).await, Ok(Value::from("pong")));
        assert!(started.elapsed() < Duration::from_millis(200), "ping took {:?}", started.elapsed());

        for sleeper in sleepers {
            assert_eq!(sleeper.await.unwrap(), Ok(Value::Nil));
        }
    }

    #[tokio::test]
    async fn test_queued_call_does_not_block_callback() {
        let pair = loopback(Box::new(Relay), Box::new(Probe::new())).await;
        let relay = pair.client.remote_root().unwrap();
        let pinged = pair.server_registry.register(Box::new(Probe::new())).unwrap();
        pair.server.grant(pinged).unwrap();

        let release = Arc::new(Notify::new());
        let bounce = Bounce::new(ObRef::remote(pair.client.id(), pinged), release.clone());
        let bounce = pair.client_registry.register(Box::new(bounce)).unwrap();
        let bounce = ObRef::local(&pair.client_registry, bounce);

        // relay.forward -> client bounce -> server ping, while a second
        // relay call waits for the first to finish.
        let client = pair.client.clone();
        let target = relay.clone();
        let chain = tokio::spawn(async move {
            client.call(&target, "forward", vec![bounce.into(), "bounce".into()]).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = pair.client.clone();
        let queued = tokio::spawn(async move { client.call(&relay, "get_type", vec![]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        let results = tokio::time::timeout(Duration::from_secs(5), async {
            (chain.await.unwrap(), queued.await.unwrap())
        })
        .await
        .unwrap();
        assert_eq!(results, (Ok(Value::from("pong")), Ok(Value::from("relay"))));
    }
}
