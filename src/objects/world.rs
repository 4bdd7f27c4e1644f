//! World Root
//!
//! The object the server exports to every connection during bootstrap.
//! Selector 0 is `get_type` and 1 is `login`; diagnostics come after.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::account::Account;
use crate::core::context::CallContext;
use crate::core::error::CallError;
use crate::core::object::{MethodInfo, RemoteObject};
use crate::core::obref::ObRef;
use crate::core::value::{Value, ValueType};
use crate::store::ValueStore;

const METHODS: &[MethodInfo] = &[
    MethodInfo::new("get_type", &[]),
    MethodInfo::new("login", &[ValueType::String]),
    MethodInfo::new("logout", &[ValueType::Obref]),
    MethodInfo::new("ping", &[]),
    MethodInfo::new("echo", &[ValueType::String]),
    MethodInfo::new("object_count", &[]),
];

/// Per-connection server root.
pub struct WorldRoot {
    store: Arc<dyn ValueStore>,
}

impl WorldRoot {
    /// Root whose accounts persist through `store`.
    pub fn new(store: Arc<dyn ValueStore>) -> Self {
        Self { store }
    }

    async fn login(&mut self, ctx: &mut CallContext) -> Result<Value, CallError> {
        let name = ctx.args()?.string(0)?.to_string();
        let account = Account::new(&name, self.store.clone());
        let account_id = account.id();
        let addr = ctx.registry().register(Box::new(account))?;
        info!("Login {} as {} (account {})", name, addr, account_id);

        if let Some(peer) = ctx.peer().cloned() {
            peer.adopt(addr);

            if let Some(client_root) = peer.remote_root() {
                let greeting = format!("welcome, {}", name);
                if let Err(e) = client_root.call(ctx, "notify", vec![greeting.into()]).await {
                    warn!("Greeting {} failed: {}", name, e);
                }
            }
        }

        Ok(Value::Obref(ObRef::local(ctx.registry(), addr)))
    }

    fn logout(&mut self, ctx: &mut CallContext) -> Result<Value, CallError> {
        let target = ctx.args()?.obref(0)?.clone();
        let cell = target.resolve_local(ctx.registry())?;
        if cell.type_name() != "account" {
            return Err(CallError::ObjectNotRegistered(target.addr()));
        }

        ctx.registry().unregister(target.addr().id)?;
        info!("Logout {}", target.addr());
        Ok(Value::Nil)
    }
}

#[async_trait]
impl RemoteObject for WorldRoot {
    fn type_name(&self) -> &'static str {
        "world_root"
    }

    fn methods(&self) -> &'static [MethodInfo] {
        METHODS
    }

    async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        match method {
            "get_type" => Ok(Value::from(self.type_name())),
            "login" => self.login(ctx).await,
            "logout" => self.logout(ctx),
            "ping" => Ok(Value::from("pong")),
            "echo" => Ok(ctx.arg(0)?.clone()),
            "object_count" => Ok(Value::Int(ctx.registry().len() as i64)),
            other => Err(CallError::MethodNotImplemented { method: other.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::Registry;
    use crate::store::MemoryStore;

    fn world(registry: &Registry) -> ObRef {
        let store: Arc<dyn ValueStore> = Arc::new(MemoryStore::new());
        let addr = registry.register(Box::new(WorldRoot::new(store))).unwrap();
        ObRef::local(registry, addr)
    }

    #[tokio::test]
    async fn test_login_returns_live_account() {
        let registry = Arc::new(Registry::new(8));
        let root = world(&registry);
        let mut ctx = CallContext::new(registry.clone());

        let account = root.call(&mut ctx, "login", vec!["alice".into()]).await.unwrap();
        let account = account.as_obref().unwrap().clone();

        assert_eq!(account.call(&mut ctx, "name", vec![]).await, Ok(Value::from("alice")));
        assert_eq!(root.call(&mut ctx, "object_count", vec![]).await, Ok(Value::Int(2)));
    }

    #[tokio::test]
    async fn test_logout_retires_account() {
        let registry = Arc::new(Registry::new(8));
        let root = world(&registry);
        let mut ctx = CallContext::new(registry.clone());

        let account = root.call(&mut ctx, "login", vec!["bob".into()]).await.unwrap();
        let account = account.as_obref().unwrap().clone();
        root.call(&mut ctx, "logout", vec![account.clone().into()]).await.unwrap();

        assert_eq!(
            account.call(&mut ctx, "name", vec![]).await,
            Err(CallError::ObjectGone(account.addr()))
        );
        assert_eq!(
            root.call(&mut ctx, "logout", vec![root.clone().into()]).await,
            Err(CallError::ObjectNotRegistered(root.addr()))
        );
    }

    #[tokio::test]
    async fn test_login_when_registry_full() {
        let registry = Arc::new(Registry::new(1));
        let root = world(&registry);
        let mut ctx = CallContext::new(registry.clone());

        let result = root.call(&mut ctx, "login", vec!["carol".into()]).await;
        assert_eq!(result, Err(CallError::RegistryFull { capacity: 1 }));
    }
}
