//! Layered context with transactional scopes, deletion tombstones, and TTL
//! entries.
//!
//! Reads walk the scope stack top-down: a tombstone answers "deleted"
//! (shadowing everything below), a value hit wins, and the base store is the
//! final fallback. Every level owns a TTL map of absolute expiry times
//! applied on read: an expired entry is removed, key and TTL both, before
//! the read answers.
//!
//! Commit folds a scope's writes and deletes into its parent level;
//! rollback discards them. Scopes close strictly LIFO.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use super::{ContextError, ContextStore, MemoryContext};
use crate::runtime::{Clock, SystemClock};

/// Identifier of one pushed scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

#[derive(Debug)]
struct ScopeEntry {
    id: ScopeId,
    label: Option<String>,
    values: Map<String, Value>,
    deletes: BTreeSet<String>,
    ttl: HashMap<String, u64>,
}

/// Layered scoped store over a base [`ContextStore`].
#[derive(Debug)]
pub struct ContextManager {
    base: Box<dyn ContextStore>,
    base_ttl: HashMap<String, u64>,
    scopes: Vec<ScopeEntry>,
    clock: Arc<dyn Clock>,
    next_scope_id: u64,
}

impl ContextManager {
    pub fn new(base: Box<dyn ContextStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base,
            base_ttl: HashMap::new(),
            scopes: Vec::new(),
            clock,
            next_scope_id: 0,
        }
    }

    /// Manager over a fresh in-memory base.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryContext::new()), Arc::new(SystemClock::new()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Depth of the open scope stack.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Layered read honoring tombstones and TTL expiry.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = self.clock.now_ms();
        for index in (0..self.scopes.len()).rev() {
            let scope = &mut self.scopes[index];
            if scope.deletes.contains(key) {
                return None;
            }
            if let Some(expires_at) = scope.ttl.get(key).copied() {
                if now >= expires_at {
                    scope.values.remove(key);
                    scope.ttl.remove(key);
                    continue;
                }
            }
            if let Some(value) = scope.values.get(key) {
                return Some(value.clone());
            }
        }
        if let Some(expires_at) = self.base_ttl.get(key).copied() {
            if now >= expires_at {
                self.base.delete(key);
                self.base_ttl.remove(key);
                return None;
            }
        }
        self.base.get(key)
    }

    /// Write to the top scope, or the base when no scope is open.
    pub fn set(&mut self, key: &str, value: Value) {
        self.set_with_ttl(key, value, None);
    }

    /// Write with an optional time-to-live.
    pub fn set_with_ttl(&mut self, key: &str, value: Value, ttl_ms: Option<u64>) {
        let expires_at = ttl_ms.map(|ttl| self.clock.now_ms().saturating_add(ttl));
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.deletes.remove(key);
                scope.values.insert(key.to_string(), value);
                match expires_at {
                    Some(expires_at) => {
                        scope.ttl.insert(key.to_string(), expires_at);
                    }
                    None => {
                        scope.ttl.remove(key);
                    }
                }
            }
            None => {
                self.base.set(key, value);
                match expires_at {
                    Some(expires_at) => {
                        self.base_ttl.insert(key.to_string(), expires_at);
                    }
                    None => {
                        self.base_ttl.remove(key);
                    }
                }
            }
        }
    }

    /// Delete a key. Inside a scope this records a tombstone that shadows
    /// lower levels until the scope closes.
    pub fn delete(&mut self, key: &str) {
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.values.remove(key);
                scope.ttl.remove(key);
                scope.deletes.insert(key.to_string());
            }
            None => {
                self.base.delete(key);
                self.base_ttl.remove(key);
            }
        }
    }

    /// Remove a key from the top scope only, without a tombstone. Lower
    /// levels become readable again; nothing propagates on commit.
    pub(crate) fn unset_local(&mut self, key: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.values.remove(key);
            scope.ttl.remove(key);
            scope.deletes.remove(key);
        }
    }

    /// Set every entry of the map at the current level.
    pub fn merge(&mut self, values: Map<String, Value>) {
        for (key, value) in values {
            self.set(&key, value);
        }
    }

    /// Effective view: base (minus expired entries) with every open scope's
    /// writes and tombstones applied bottom-up.
    pub fn snapshot(&mut self) -> Map<String, Value> {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .base_ttl
            .iter()
            .filter(|(_, expires_at)| now >= **expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.base.delete(&key);
            self.base_ttl.remove(&key);
        }

        let mut view = self.base.snapshot();
        for scope in &self.scopes {
            for (key, value) in &scope.values {
                if scope
                    .ttl
                    .get(key)
                    .map(|expires_at| now >= *expires_at)
                    .unwrap_or(false)
                {
                    continue;
                }
                view.insert(key.clone(), value.clone());
            }
            for key in &scope.deletes {
                view.remove(key);
            }
        }
        view
    }

    /// Open a transactional scope.
    pub fn push_scope(&mut self, label: Option<&str>) -> ScopeId {
        self.next_scope_id += 1;
        let id = ScopeId(self.next_scope_id);
        self.scopes.push(ScopeEntry {
            id,
            label: label.map(str::to_string),
            values: Map::new(),
            deletes: BTreeSet::new(),
            ttl: HashMap::new(),
        });
        id
    }

    fn take_top(&mut self, id: ScopeId, action: &'static str) -> Result<ScopeEntry, ContextError> {
        let Some(top) = self.scopes.pop() else {
            return Err(ContextError::NoOpenScope(action));
        };
        if top.id != id {
            let message = format!(
                "{action} requested for scope {id:?} while {:?} ({}) is on top",
                top.id,
                top.label.as_deref().unwrap_or("unlabelled"),
            );
            warn!("{message}");
            self.scopes.push(top);
            return Err(ContextError::ScopeOrder(message));
        }
        Ok(top)
    }

    /// Fold the scope's writes and deletes into its parent level.
    pub fn commit_scope(&mut self, id: ScopeId) -> Result<(), ContextError> {
        let scope = self.take_top(id, "commit")?;
        match self.scopes.last_mut() {
            Some(parent) => {
                for (key, value) in scope.values {
                    parent.deletes.remove(&key);
                    match scope.ttl.get(&key).copied() {
                        Some(expires_at) => {
                            parent.ttl.insert(key.clone(), expires_at);
                        }
                        None => {
                            parent.ttl.remove(&key);
                        }
                    }
                    parent.values.insert(key, value);
                }
                for key in scope.deletes {
                    parent.values.remove(&key);
                    parent.ttl.remove(&key);
                    parent.deletes.insert(key);
                }
            }
            None => {
                for (key, value) in scope.values {
                    self.base.set(&key, value);
                    match scope.ttl.get(&key).copied() {
                        Some(expires_at) => {
                            self.base_ttl.insert(key.clone(), expires_at);
                        }
                        None => {
                            self.base_ttl.remove(&key);
                        }
                    }
                }
                for key in scope.deletes {
                    self.base.delete(&key);
                    self.base_ttl.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Discard the scope's writes and deletes.
    pub fn rollback_scope(&mut self, id: ScopeId) -> Result<(), ContextError> {
        self.take_top(id, "rollback")?;
        Ok(())
    }

    /// Run `f` inside a fresh scope: commit on `Ok`, roll back on `Err`.
    pub fn with_scope<T, E>(
        &mut self,
        label: Option<&str>,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<ContextError>,
    {
        let id = self.push_scope(label);
        match f(self) {
            Ok(value) => {
                self.commit_scope(id)?;
                Ok(value)
            }
            Err(err) => {
                self.rollback_scope(id)?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;
    use serde_json::json;

    fn manager_with_clock() -> (ContextManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let manager =
            ContextManager::new(Box::new(MemoryContext::new()), clock.clone() as Arc<dyn Clock>);
        (manager, clock)
    }

    #[test]
    fn base_reads_and_writes_without_scopes() {
        let (mut manager, _clock) = manager_with_clock();
        manager.set("user", json!("ada"));
        assert_eq!(manager.get("user"), Some(json!("ada")));
        manager.delete("user");
        assert_eq!(manager.get("user"), None);
    }

    #[test]
    fn scope_reads_shadow_base_and_tombstones_shadow_values() {
        let (mut manager, _clock) = manager_with_clock();
        manager.set("color", json!("red"));
        let scope = manager.push_scope(Some("branch"));
        assert_eq!(manager.get("color"), Some(json!("red")));

        manager.set("color", json!("blue"));
        assert_eq!(manager.get("color"), Some(json!("blue")));

        manager.delete("color");
        // tombstone hides the base value even though the base still has it
        assert_eq!(manager.get("color"), None);

        manager.rollback_scope(scope).expect("rollback");
        assert_eq!(manager.get("color"), Some(json!("red")));
    }

    #[test]
    fn commit_folds_values_and_deletes_into_base() {
        let (mut manager, _clock) = manager_with_clock();
        manager.set("keep", json!(1));
        manager.set("drop", json!(2));

        let scope = manager.push_scope(None);
        manager.set("added", json!(3));
        manager.delete("drop");
        manager.commit_scope(scope).expect("commit");

        assert_eq!(manager.get("keep"), Some(json!(1)));
        assert_eq!(manager.get("added"), Some(json!(3)));
        assert_eq!(manager.get("drop"), None);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn rollback_restores_the_parent_read_set_exactly() {
        let (mut manager, _clock) = manager_with_clock();
        manager.set("a", json!(1));
        manager.set("b", json!(2));
        let before = manager.snapshot();

        let scope = manager.push_scope(Some("txn"));
        manager.set("a", json!(99));
        manager.set("c", json!(3));
        manager.delete("b");
        manager.rollback_scope(scope).expect("rollback");

        assert_eq!(manager.snapshot(), before);
    }

    #[test]
    fn nested_commit_folds_into_parent_scope_not_base() {
        let (mut manager, _clock) = manager_with_clock();
        let outer = manager.push_scope(Some("outer"));
        let inner = manager.push_scope(Some("inner"));
        manager.set("x", json!("inner"));
        manager.commit_scope(inner).expect("commit inner");

        // the base is untouched until the outer scope commits
        assert_eq!(manager.get("x"), Some(json!("inner")));
        manager.rollback_scope(outer).expect("rollback outer");
        assert_eq!(manager.get("x"), None);
    }

    #[test]
    fn lifo_violation_is_an_error() {
        let (mut manager, _clock) = manager_with_clock();
        let first = manager.push_scope(Some("first"));
        let _second = manager.push_scope(Some("second"));
        let err = manager.commit_scope(first).expect_err("out of order");
        assert!(matches!(err, ContextError::ScopeOrder(_)));
        assert_eq!(manager.depth(), 2);
    }

    #[test]
    fn commit_without_scope_is_an_error() {
        let (mut manager, _clock) = manager_with_clock();
        let ghost = ScopeId(42);
        let err = manager.commit_scope(ghost).expect_err("no scope");
        assert!(matches!(err, ContextError::NoOpenScope("commit")));
    }

    #[test]
    fn ttl_expires_on_read_and_in_snapshots() {
        let (mut manager, clock) = manager_with_clock();
        manager.set_with_ttl("flash", json!("now"), Some(100));
        assert_eq!(manager.get("flash"), Some(json!("now")));

        clock.advance(99);
        assert_eq!(manager.get("flash"), Some(json!("now")));

        clock.advance(1);
        assert_eq!(manager.get("flash"), None);
        assert!(!manager.snapshot().contains_key("flash"));
    }

    #[test]
    fn scope_ttl_survives_commit() {
        let (mut manager, clock) = manager_with_clock();
        let scope = manager.push_scope(None);
        manager.set_with_ttl("session.step", json!("b"), Some(50));
        manager.commit_scope(scope).expect("commit");

        assert_eq!(manager.get("session.step"), Some(json!("b")));
        clock.advance(50);
        assert_eq!(manager.get("session.step"), None);
    }

    #[test]
    fn with_scope_commits_on_ok_and_rolls_back_on_err() {
        let (mut manager, _clock) = manager_with_clock();
        let ok: Result<(), ContextError> = manager.with_scope(Some("ok"), |ctx| {
            ctx.set("committed", json!(true));
            Ok(())
        });
        assert!(ok.is_ok());
        assert_eq!(manager.get("committed"), Some(json!(true)));

        let err: Result<(), ContextError> = manager.with_scope(Some("bad"), |ctx| {
            ctx.set("discarded", json!(true));
            Err(ContextError::NoOpenScope("test"))
        });
        assert!(err.is_err());
        assert_eq!(manager.get("discarded"), None);
    }

    #[test]
    fn unset_local_removes_without_tombstone() {
        let (mut manager, _clock) = manager_with_clock();
        manager.set("item", json!("base"));
        let scope = manager.push_scope(None);
        manager.set("item", json!("scoped"));
        manager.unset_local("item");
        // no tombstone: the base value shows through again
        assert_eq!(manager.get("item"), Some(json!("base")));
        manager.commit_scope(scope).expect("commit");
        assert_eq!(manager.get("item"), Some(json!("base")));
    }
}
