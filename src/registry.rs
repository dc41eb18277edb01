//! Named-computation registry.
//!
//! Remote execution never ships closures: a `CALL` or `DO` carries the
//! *name* of a computation plus argument values, and every process runs
//! only computations it has registered. This keeps the set of remotely
//! executable operations explicit and auditable, and sidesteps the
//! unsoundness of serializing arbitrary closures.
//!
//! A computation receives a [`TaskCtx`] — through which it can issue
//! nested `remote_call`/`fetch` without blocking the event loop — and
//! returns a future of `Result<Value, Fault>`. Synchronous functions
//! register through [`ComputationRegistry::register_fn`], which wraps
//! them in a ready future.

use crate::runtime::TaskCtx;
use crate::value::{Fault, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// Name of a computation that can be executed on behalf of a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComputationName(String);

impl ComputationName {
    /// Creates a new computation name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the computation name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComputationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ComputationName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ComputationName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// The future a computation returns.
///
/// Not `Send`: the whole runtime is single-threaded and task futures
/// never leave the event-loop thread.
pub type ComputationFuture = Pin<Box<dyn Future<Output = Result<Value, Fault>>>>;

/// A registered computation.
pub type Computation = Rc<dyn Fn(TaskCtx, Vec<Value>) -> ComputationFuture>;

/// Registry of the computations this process will run for its peers.
#[derive(Default)]
pub struct ComputationRegistry {
    map: HashMap<ComputationName, Computation>,
}

impl ComputationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async computation under `name`.
    ///
    /// Re-registering a name replaces the previous computation.
    pub fn register<F, Fut>(&mut self, name: impl Into<ComputationName>, f: F)
    where
        F: Fn(TaskCtx, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Value, Fault>> + 'static,
    {
        self.map.insert(
            name.into(),
            Rc::new(move |ctx, args| -> ComputationFuture { Box::pin(f(ctx, args)) }),
        );
    }

    /// Registers a synchronous function under `name`.
    ///
    /// The function body runs inside the task turn, so a panic in it is
    /// caught and delivered as a fault like any other thunk failure.
    pub fn register_fn<F>(&mut self, name: impl Into<ComputationName>, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, Fault> + 'static,
    {
        let f = Rc::new(f);
        self.map.insert(
            name.into(),
            Rc::new(move |_ctx, args| -> ComputationFuture {
                let f = Rc::clone(&f);
                Box::pin(async move { f(args) })
            }),
        );
    }

    /// Looks up a computation by name.
    #[must_use]
    pub fn get(&self, name: &ComputationName) -> Option<Computation> {
        self.map.get(name).cloned()
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &ComputationName) -> bool {
        self.map.contains_key(name)
    }

    /// Number of registered computations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no computations are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for ComputationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationRegistry")
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcId;

    #[test]
    fn register_and_lookup() {
        let mut reg = ComputationRegistry::new();
        assert!(reg.is_empty());
        reg.register_fn("double", |args| {
            let n = args[0].as_int().unwrap_or(0);
            Ok(Value::Int(n * 2))
        });
        assert!(reg.contains(&"double".into()));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&"missing".into()).is_none());
    }

    #[test]
    fn reregistering_replaces() {
        let mut reg = ComputationRegistry::new();
        reg.register_fn("op", |_| Ok(Value::Int(1)));
        reg.register_fn("op", |_| Ok(Value::Int(2)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn register_fn_wraps_failures() {
        let mut reg = ComputationRegistry::new();
        reg.register_fn("fails", |_| {
            Err(Fault::new(ProcId::new(0), "fails", "expected failure"))
        });
        assert!(reg.contains(&"fails".into()));
    }
}
