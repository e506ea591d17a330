//! Handler registry: the named operations one side exposes to its peer.
//!
//! Operations are declared as types implementing [`Operation`], fixing the
//! wire name and the argument/result types. Handlers are registered against
//! those types, so a handler's signature is checked when it is registered.
//! Dispatch is still a lookup by name, since that is all the wire carries.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{self, BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::bridge::protocol::Failure;

/// Name reserved for the liveness probe, answered by the bridge itself.
pub const PING: &str = "ping";

/// A statically declared remote operation.
///
/// `Args` is a tuple; it travels as the positional argument list.
pub trait Operation: Send + Sync + 'static {
    const NAME: &'static str;
    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("handler `{0}` is already registered")]
    Duplicate(&'static str),
    #[error("`{0}` is reserved by the bridge")]
    Reserved(&'static str),
}

/// Turn a tuple of arguments into the positional list sent on the wire.
pub fn encode_args<A: Serialize>(args: &A) -> Result<Vec<Value>, serde_json::Error> {
    Ok(match serde_json::to_value(args)? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    })
}

pub fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A, serde_json::Error> {
    if args.is_empty() {
        serde_json::from_value(Value::Null)
    } else {
        serde_json::from_value(Value::Array(args))
    }
}

pub(crate) type HandlerFuture = BoxFuture<'static, Result<Value, Failure>>;

pub(crate) trait ErasedHandler: Send + Sync {
    fn invoke(&self, args: Vec<Value>) -> HandlerFuture;
}

struct TypedHandler<O, F> {
    f: F,
    _op: PhantomData<fn() -> O>,
}

impl<O, F, Fut> ErasedHandler for TypedHandler<O, F>
where
    O: Operation,
    F: Fn(O::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O::Output>> + Send + 'static,
{
    fn invoke(&self, args: Vec<Value>) -> HandlerFuture {
        let args = match decode_args::<O::Args>(args) {
            Ok(args) => args,
            Err(e) => return Box::pin(future::ready(Err(Failure::invalid_arguments(e.to_string())))),
        };
        let pending = (self.f)(args);
        Box::pin(async move {
            let output = pending.await.map_err(|e| Failure::from_error(&e))?;
            serde_json::to_value(output)
                .map_err(|e| Failure::handler_threw(format!("failed to encode result: {e}")))
        })
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O, F, Fut>(&self, f: F) -> Result<(), RegistryError>
    where
        O: Operation,
        F: Fn(O::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O::Output>> + Send + 'static,
    {
        if O::NAME == PING {
            return Err(RegistryError::Reserved(O::NAME));
        }
        match self.handlers.entry(O::NAME) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(O::NAME)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(TypedHandler::<O, F> {
                    f,
                    _op: PhantomData,
                }));
                tracing::trace!(operation = O::NAME, "Registered handler");
                Ok(())
            }
        }
    }

    /// Register a handler invoked with a shared context.
    pub fn register_with<O, C, F, Fut>(&self, context: Arc<C>, f: F) -> Result<(), RegistryError>
    where
        O: Operation,
        C: Send + Sync + 'static,
        F: Fn(Arc<C>, O::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O::Output>> + Send + 'static,
    {
        self.register::<O, _, _>(move |args| f(Arc::clone(&context), args))
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<O, F, Fut>(self, f: F) -> Result<Self, RegistryError>
    where
        O: Operation,
        F: Fn(O::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O::Output>> + Send + 'static,
    {
        self.register::<O, F, Fut>(f)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered operation names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.iter().map(|e| *e.key()).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(name).map(|e| Arc::clone(e.value()))
    }
}
