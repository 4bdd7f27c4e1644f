//! Registry hot paths: resolving addresses and cycling slots.

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use obnet::{CallContext, CallError, MethodInfo, ObRef, Registry, RemoteObject, Value};

const METHODS: &[MethodInfo] = &[MethodInfo::new("ping", &[])];

struct Nop;

#[async_trait]
impl RemoteObject for Nop {
    fn type_name(&self) -> &'static str {
        "nop"
    }

    fn methods(&self) -> &'static [MethodInfo] {
        METHODS
    }

    async fn invoke(&mut self, _method: &str, _ctx: &mut CallContext) -> Result<Value, CallError> {
        Ok(Value::Nil)
    }
}

fn filled(capacity: usize) -> (Registry, Vec<obnet::ObjectAddr>) {
    let registry = Registry::new(capacity);
    let addrs = (0..capacity)
        .map(|_| registry.register(Box::new(Nop)).unwrap())
        .collect();
    (registry, addrs)
}

fn bench_resolve(c: &mut Criterion) {
    let (registry, mut addrs) = filled(1000);
    addrs.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));

    c.bench_function("resolve_live", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % addrs.len();
            black_box(registry.resolve(addrs[i]).unwrap());
        })
    });

    let stale = addrs[0];
    registry.unregister(stale.id).unwrap();
    registry.register(Box::new(Nop)).unwrap();
    c.bench_function("resolve_gone", |b| b.iter(|| black_box(registry.resolve(stale).unwrap())));
}

fn bench_register_cycle(c: &mut Criterion) {
    c.bench_function("register_unregister", |b| {
        b.iter_batched(
            || filled(256),
            |(registry, addrs)| {
                for addr in addrs.iter().step_by(2) {
                    registry.unregister(addr.id).unwrap();
                }
                for _ in addrs.iter().step_by(2) {
                    registry.register(Box::new(Nop)).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_local_call(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let registry = Arc::new(Registry::new(4));
    let addr = registry.register(Box::new(Nop)).unwrap();
    let target = ObRef::local(&registry, addr);

    c.bench_function("local_call", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut ctx = CallContext::new(registry.clone());
                black_box(target.call(&mut ctx, "ping", vec![]).await.unwrap());
            })
        })
    });
}

criterion_group!(benches, bench_resolve, bench_register_cycle, bench_local_call);
criterion_main!(benches);
