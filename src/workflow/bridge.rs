//! Resolver bridge: the workflow side of the selector resolver.
//!
//! Caches resolutions per `(run, workflow, step, attempt)` so a step's
//! condition probes and handler lookups within one attempt share a single
//! backend round-trip. Translates backend failures into structured step
//! errors and checks the cancellation signal on both sides of the resolve.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StepError;
use crate::selector::{ResolveResult, SelectorResolver};

/// Cache coordinates of one bridge lookup.
pub struct BridgeRequest<'a> {
    pub run_id: &'a str,
    pub workflow_id: &'a str,
    /// Step id, or `kind+key` for steps without one.
    pub step_key: String,
    pub attempt: u32,
    pub logical_key: &'a str,
    pub signal: &'a CancellationToken,
}

impl BridgeRequest<'_> {
    fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.run_id, self.workflow_id, self.step_key, self.attempt, self.logical_key
        )
    }
}

/// Per-run caching layer over the shared [`SelectorResolver`].
#[derive(Debug)]
pub struct ResolverBridge {
    resolver: Arc<SelectorResolver>,
    cache: Mutex<HashMap<String, ResolveResult>>,
}

impl ResolverBridge {
    pub fn new(resolver: Arc<SelectorResolver>) -> Self {
        Self {
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<SelectorResolver> {
        &self.resolver
    }

    /// Resolve through the cache. Misses hit the backend; backend failures
    /// become `resolver-miss` step errors; cancellation is checked before
    /// and after the lookup.
    pub async fn resolve(&self, request: BridgeRequest<'_>) -> Result<ResolveResult, StepError> {
        if request.signal.is_cancelled() {
            return Err(StepError::cancelled("resolve aborted before lookup")
                .with_key(request.logical_key));
        }

        let cache_key = request.cache_key();
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&cache_key)
            .cloned()
        {
            debug!(
                key = request.logical_key,
                attempt = request.attempt,
                "resolver bridge cache hit"
            );
            return Ok(hit);
        }

        let result = self
            .resolver
            .resolve(request.logical_key, None)
            .await
            .map_err(|err| {
                StepError::resolver_miss(format!(
                    "selector backend failed for '{}': {err}",
                    request.logical_key
                ))
                .with_key(request.logical_key)
                .with_cause(err.to_string())
            })?;

        if request.signal.is_cancelled() {
            return Err(StepError::cancelled("resolve aborted during lookup")
                .with_key(request.logical_key));
        }

        match (&result.element, &result.entry) {
            (Some(_), entry) => {
                info!(
                    key = request.logical_key,
                    strategy = result.resolved_by.as_deref().unwrap_or("?"),
                    stability = entry.as_ref().and_then(|e| e.stability_score),
                    attempts = result.attempts.len(),
                    "resolved step target"
                );
            }
            (None, _) => {
                warn!(
                    key = request.logical_key,
                    attempts = result.attempts.len(),
                    "step target did not resolve"
                );
            }
        }

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key, result.clone());
        Ok(result)
    }

    /// Evict every cached resolution belonging to a run.
    pub fn clear(&self, run_id: &str) {
        let prefix = format!("{run_id}:");
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|key, _| !key.starts_with(&prefix));
    }

    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{SelectorEntry, SelectorMap, SelectorTry};
    use crate::testing::{FakeDom, FakeElement};

    fn bridge_over(dom: &Arc<FakeDom>) -> ResolverBridge {
        let map = Arc::new(SelectorMap::new().with_entry(
            "cta",
            SelectorEntry::new(vec![SelectorTry::css(".cta")]).with_stability_score(0.9),
        ));
        ResolverBridge::new(Arc::new(SelectorResolver::new(map, dom.backend())))
    }

    fn request<'a>(signal: &'a CancellationToken, attempt: u32) -> BridgeRequest<'a> {
        BridgeRequest {
            run_id: "run-1",
            workflow_id: "wf",
            step_key: "click+cta".into(),
            attempt,
            logical_key: "cta",
            signal,
        }
    }

    #[tokio::test]
    async fn caches_per_attempt_and_clears_per_run() {
        let dom = Arc::new(FakeDom::new());
        dom.stub_css(".cta", vec![FakeElement::new("button").handle()]);
        let bridge = bridge_over(&dom);
        let signal = CancellationToken::new();

        let first = bridge.resolve(request(&signal, 1)).await.expect("resolve");
        assert!(first.element.is_some());
        assert_eq!(dom.query_count(".cta"), 1);

        // same attempt: served from cache
        bridge.resolve(request(&signal, 1)).await.expect("resolve");
        assert_eq!(dom.query_count(".cta"), 1);

        // new attempt: fresh lookup
        bridge.resolve(request(&signal, 2)).await.expect("resolve");
        assert_eq!(dom.query_count(".cta"), 2);
        assert_eq!(bridge.cached_len(), 2);

        bridge.clear("run-1");
        assert_eq!(bridge.cached_len(), 0);
    }

    #[tokio::test]
    async fn cancellation_beats_the_cache() {
        let dom = Arc::new(FakeDom::new());
        dom.stub_css(".cta", vec![FakeElement::new("button").handle()]);
        let bridge = bridge_over(&dom);
        let signal = CancellationToken::new();
        signal.cancel();

        let err = bridge
            .resolve(request(&signal, 1))
            .await
            .expect_err("cancelled");
        assert!(err.is_cancellation());
        assert_eq!(dom.query_count(".cta"), 0);
    }
}
