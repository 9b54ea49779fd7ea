//! Scoped key-value context for workflow runs.
//!
//! A run reads and writes through the [`ContextManager`], which layers a
//! stack of transactional scopes over a caller-supplied base store. See
//! [`manager`] for the commit/rollback algebra.

pub mod manager;

pub use manager::{ContextManager, ScopeId};

use std::fmt;

use serde_json::{Map, Value};

/// Errors from scope lifecycle misuse.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContextError {
    /// Scopes must close in LIFO order.
    #[error("scope closed out of order: {0}")]
    ScopeOrder(String),
    /// Commit or rollback with no open scope.
    #[error("no open scope to {0}")]
    NoOpenScope(&'static str),
}

/// Base storage a context manager layers its scopes over.
///
/// The in-memory implementation below is the default; callers may supply
/// their own (for example a view over an embedding application's state).
pub trait ContextStore: fmt::Debug + Send {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    /// Returns whether the key was present.
    fn delete(&mut self, key: &str) -> bool;
    fn merge(&mut self, values: Map<String, Value>);
    fn snapshot(&self) -> Map<String, Value>;
}

/// Plain in-memory base store.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    values: Map<String, Value>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl ContextStore for MemoryContext {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn delete(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    fn merge(&mut self, values: Map<String, Value>) {
        for (key, value) in values {
            self.values.insert(key, value);
        }
    }

    fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }
}
