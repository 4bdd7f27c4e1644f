//! Account Object
//!
//! Per-login object handed to a client by `WorldRoot::login`. Its state
//! lives in the value store under the account's id, so a later login with
//! the same name sees the same values.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::context::CallContext;
use crate::core::error::CallError;
use crate::core::object::{MethodInfo, RemoteObject};
use crate::core::value::{Value, ValueType};
use crate::store::{StoredValue, ValueStore};

/// Stable account identifier derived from a login subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 16]);

impl AccountId {
    /// Hash `subject` into an id.
    pub fn derive(subject: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"obnet-account:");
        hasher.update(subject.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    /// Full hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

const METHODS: &[MethodInfo] = &[
    MethodInfo::new("get_type", &[]),
    MethodInfo::new("name", &[]),
    MethodInfo::new("account_id", &[]),
    MethodInfo::new("get", &[ValueType::String]),
    MethodInfo::new("set", &[ValueType::String, ValueType::String]),
    MethodInfo::new("incr", &[ValueType::String]),
];

/// A logged-in account.
pub struct Account {
    id: AccountId,
    name: String,
    store: Arc<dyn ValueStore>,
}

impl Account {
    /// Account for `name`, persisting through `store`.
    pub fn new(name: impl Into<String>, store: Arc<dyn ValueStore>) -> Self {
        let name = name.into();
        Self { id: AccountId::derive(&name), name, store }
    }

    /// Account id.
    pub fn id(&self) -> AccountId {
        self.id
    }

    fn key(&self, field: &str) -> String {
        format!("account/{}/{}", self.id.to_hex(), field)
    }
}

#[async_trait]
impl RemoteObject for Account {
    fn type_name(&self) -> &'static str {
        "account"
    }

    fn methods(&self) -> &'static [MethodInfo] {
        METHODS
    }

    async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        match method {
            "get_type" => Ok(Value::from(self.type_name())),
            "name" => Ok(Value::from(self.name.as_str())),
            "account_id" => Ok(Value::from(self.id.to_hex())),
            "get" => {
                let key = self.key(ctx.args()?.string(0)?);
                Ok(match self.store.get(&key).await? {
                    Some(StoredValue::Int(i)) => Value::Int(i),
                    Some(StoredValue::Float(x)) => Value::Float(x),
                    Some(StoredValue::Text(s)) => Value::Str(s),
                    Some(StoredValue::Blob(b)) => Value::Blob(b),
                    None => Value::Nil,
                })
            }
            "set" => {
                let args = ctx.args()?;
                let key = self.key(args.string(0)?);
                let value = StoredValue::Text(args.string(1)?.to_string());
                self.store.put(&key, value).await?;
                Ok(Value::Nil)
            }
            "incr" => {
                let key = self.key(ctx.args()?.string(0)?);
                let next = match self.store.get(&key).await? {
                    Some(stored) => stored.expect_int()? + 1,
                    None => 1,
                };
                self.store.put(&key, StoredValue::Int(next)).await?;
                debug!("Account {} {} = {}", self.id, key, next);
                Ok(Value::Int(next))
            }
            other => Err(CallError::MethodNotImplemented { method: other.to_string() }),
        }
    }
}
