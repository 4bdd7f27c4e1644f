//! Client-side root object, exported to the server during bootstrap.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::core::context::CallContext;
use crate::core::error::CallError;
use crate::core::object::{MethodInfo, RemoteObject};
use crate::core::value::{Value, ValueType};

const METHODS: &[MethodInfo] = &[
    MethodInfo::new("get_type", &[]),
    MethodInfo::new("notify", &[ValueType::String]),
];

/// Receives server notifications.
pub struct ClientRoot {
    inbox: Arc<Mutex<Vec<String>>>,
}

impl ClientRoot {
    /// Root collecting notifications into `inbox`.
    pub fn new(inbox: Arc<Mutex<Vec<String>>>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl RemoteObject for ClientRoot {
    fn type_name(&self) -> &'static str {
        "client_root"
    }

    fn methods(&self) -> &'static [MethodInfo] {
        METHODS
    }

    async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError> {
        match method {
            "get_type" => Ok(Value::from(self.type_name())),
            "notify" => {
                let text = ctx.args()?.string(0)?.to_string();
                info!("Server says: {}", text);
                self.inbox.lock().push(text);
                Ok(Value::Nil)
            }
            other => Err(CallError::MethodNotImplemented { method: other.to_string() }),
        }
    }
}
