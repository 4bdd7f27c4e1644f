//! Remotely Invocable Objects
//!
//! The capability every exposable object implements: an enumerable method
//! table plus a dispatch entry point. Concrete variants live outside the
//! core (see `crate::objects`).

use async_trait::async_trait;

use super::context::{ArgSet, CallContext};
use super::error::CallError;
use super::value::{Value, ValueType};

/// One entry of an object's method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method selector.
    pub name: &'static str,
    /// Declared parameter kinds, in order.
    pub params: &'static [ValueType],
}

impl MethodInfo {
    /// Declare a method.
    pub const fn new(name: &'static str, params: &'static [ValueType]) -> Self {
        Self { name, params }
    }

    /// Check an argument set against the declared parameters.
    pub fn check_args(&self, args: &ArgSet) -> Result<(), CallError> {
        if args.len() != self.params.len() {
            return Err(CallError::ArgumentCount {
                expected: self.params.len(),
                found: args.len(),
            });
        }

        for (index, (expected, value)) in self.params.iter().zip(args.iter()).enumerate() {
            let found = value.value_type();
            if found != *expected {
                return Err(CallError::ArgumentType { index, expected: *expected, found });
            }
        }

        Ok(())
    }
}

/// Find a selector in a method table.
pub fn find_method<'a>(methods: &'a [MethodInfo], name: &str) -> Option<&'a MethodInfo> {
    methods.iter().find(|m| m.name == name)
}

/// An object that can be invoked through the registry.
///
/// The registry checks the selector and argument kinds against
/// [`methods`](RemoteObject::methods) before calling
/// [`invoke`](RemoteObject::invoke), so implementations only see calls to
/// methods they declared, with correctly typed arguments on top of the
/// context stack.
#[async_trait]
pub trait RemoteObject: Send + 'static {
    /// Type name reported by `get_type`.
    fn type_name(&self) -> &'static str;

    /// Callable methods.
    fn methods(&self) -> &'static [MethodInfo];

    /// Execute `method` with the arguments in `ctx`'s top frame.
    async fn invoke(&mut self, method: &str, ctx: &mut CallContext) -> Result<Value, CallError>;
}
