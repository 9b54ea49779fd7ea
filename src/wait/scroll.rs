//! Scroll-based recovery for list targets that render lazily.
//!
//! Wired into the wait scheduler as a [`ScheduleIntegration`]: after a miss
//! it advances a scroll container to reveal more candidates and asks the
//! scheduler to re-resolve within the same poll iteration, bounded by an
//! attempt budget derived from the presence threshold.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::dom::{DomElement, ElementHandle};
use crate::runtime::Sleeper;
use crate::selector::{ResolveResult, SelectorResolver};

/// Settle delay after each scroll advance.
pub const SCROLL_SETTLE_DELAY_MS: u64 = 50;

/// Smallest scroll advance, in pixels.
pub const SCROLL_MIN_STEP_PX: f64 = 40.0;

/// What the scheduler should do after consulting an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationVerdict {
    /// Proceed with the normal success/miss handling.
    Continue,
    /// Re-enter the resolve phase of the same poll iteration.
    Retry,
}

/// Scheduler state shared with an integration.
pub struct IntegrationContext<'a> {
    /// Result of the current resolve phase; `None` before the first resolve
    /// of the iteration.
    pub resolve_result: Option<&'a ResolveResult>,
    pub poll_count: u32,
    pub elapsed_ms: u64,
}

/// Hook into the wait scheduler's resolve phase.
#[async_trait]
pub trait ScheduleIntegration: Send {
    async fn before_resolve(&mut self, _cx: &IntegrationContext<'_>) {}

    async fn after_resolve(&mut self, _cx: &IntegrationContext<'_>) -> IntegrationVerdict {
        IntegrationVerdict::Continue
    }
}

/// Attempt budget: `min(24, max(6, presence_threshold · 3))`.
pub fn scroll_attempt_budget(presence_threshold: u32) -> u32 {
    (presence_threshold.saturating_mul(3)).clamp(6, 24)
}

/// Advances a named scroll container on every miss.
pub struct ScrollRecovery {
    resolver: Arc<SelectorResolver>,
    sleeper: Arc<dyn Sleeper>,
    scroller_key: String,
    attempt_cap: u32,
    attempts: u32,
    container: Option<ElementHandle>,
}

impl ScrollRecovery {
    pub fn new(
        resolver: Arc<SelectorResolver>,
        sleeper: Arc<dyn Sleeper>,
        scroller_key: impl Into<String>,
        presence_threshold: u32,
    ) -> Self {
        Self {
            resolver,
            sleeper,
            scroller_key: scroller_key.into(),
            attempt_cap: scroll_attempt_budget(presence_threshold),
            attempts: 0,
            container: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[async_trait]
impl ScheduleIntegration for ScrollRecovery {
    async fn before_resolve(&mut self, _cx: &IntegrationContext<'_>) {
        if self
            .container
            .as_ref()
            .map(|container| !container.is_connected())
            .unwrap_or(false)
        {
            self.container = None;
        }
        if self.container.is_none() {
            match self.resolver.resolve(&self.scroller_key, None).await {
                Ok(result) => self.container = result.element,
                Err(err) => {
                    debug!(scroller_key = %self.scroller_key, error = %err, "scroll container lookup failed");
                }
            }
        }
    }

    async fn after_resolve(&mut self, cx: &IntegrationContext<'_>) -> IntegrationVerdict {
        let found = cx
            .resolve_result
            .map(|result| result.element.is_some())
            .unwrap_or(false);
        if found {
            self.attempts = 0;
            return IntegrationVerdict::Continue;
        }
        if self.attempts >= self.attempt_cap {
            return IntegrationVerdict::Continue;
        }
        let Some(container) = self.container.clone() else {
            return IntegrationVerdict::Continue;
        };
        let state = match container.scroll_state().await {
            Ok(state) => state,
            Err(err) => {
                debug!(scroller_key = %self.scroller_key, error = %err, "scroll state read failed");
                return IntegrationVerdict::Continue;
            }
        };
        if !state.is_scrollable() || state.top >= state.max_top() {
            return IntegrationVerdict::Continue;
        }

        let step = (state.client_height * 0.75).floor().max(SCROLL_MIN_STEP_PX);
        let next_top = (state.top + step).min(state.max_top());
        if let Err(err) = container.scroll_to(next_top).await {
            debug!(scroller_key = %self.scroller_key, error = %err, "scroll advance failed");
            return IntegrationVerdict::Continue;
        }
        self.attempts += 1;
        debug!(
            scroller_key = %self.scroller_key,
            attempt = self.attempts,
            top = next_top,
            "scrolled container to reveal more candidates"
        );
        self.sleeper
            .sleep(Duration::from_millis(SCROLL_SETTLE_DELAY_MS))
            .await;
        IntegrationVerdict::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::ScrollState;
    use crate::selector::{SelectorEntry, SelectorMap, SelectorTry};
    use crate::testing::{FakeDom, FakeElement};

    #[test]
    fn attempt_budget_is_clamped() {
        assert_eq!(scroll_attempt_budget(0), 6);
        assert_eq!(scroll_attempt_budget(1), 6);
        assert_eq!(scroll_attempt_budget(3), 9);
        assert_eq!(scroll_attempt_budget(100), 24);
    }

    fn recovery(dom: &Arc<FakeDom>) -> ScrollRecovery {
        let map = Arc::new(SelectorMap::new().with_entry(
            "list.scroller",
            SelectorEntry::new(vec![SelectorTry::css(".scroller")]),
        ));
        let resolver = Arc::new(SelectorResolver::new(map, dom.backend()));
        ScrollRecovery::new(
            resolver,
            Arc::new(crate::runtime::TokioSleeper),
            "list.scroller",
            2,
        )
    }

    #[tokio::test]
    async fn advances_scrollable_container_on_miss_and_requests_retry() {
        let dom = Arc::new(FakeDom::new());
        let scroller = FakeElement::new("div");
        scroller.set_scroll_state(ScrollState {
            top: 0.0,
            scroll_height: 1_000.0,
            client_height: 200.0,
        });
        dom.stub_css(".scroller", vec![scroller.handle()]);

        let mut recovery = recovery(&dom);
        let miss = ResolveResult::for_key("list.item");
        let cx = IntegrationContext {
            resolve_result: Some(&miss),
            poll_count: 1,
            elapsed_ms: 10,
        };
        recovery.before_resolve(&cx).await;
        let verdict = recovery.after_resolve(&cx).await;
        assert_eq!(verdict, IntegrationVerdict::Retry);
        assert_eq!(recovery.attempts(), 1);
        // 75% of client height = 150px
        assert_eq!(scroller.scroll_top(), 150.0);
    }

    #[tokio::test]
    async fn stops_at_bottom_and_resets_on_hit() {
        let dom = Arc::new(FakeDom::new());
        let scroller = FakeElement::new("div");
        scroller.set_scroll_state(ScrollState {
            top: 800.0,
            scroll_height: 1_000.0,
            client_height: 200.0,
        });
        dom.stub_css(".scroller", vec![scroller.handle()]);

        let mut recovery = recovery(&dom);
        let miss = ResolveResult::for_key("list.item");
        let cx = IntegrationContext {
            resolve_result: Some(&miss),
            poll_count: 1,
            elapsed_ms: 10,
        };
        recovery.before_resolve(&cx).await;
        // already at max top: nothing to reveal
        assert_eq!(recovery.after_resolve(&cx).await, IntegrationVerdict::Continue);

        let mut hit = ResolveResult::for_key("list.item");
        hit.element = Some(FakeElement::new("li").handle());
        let cx_hit = IntegrationContext {
            resolve_result: Some(&hit),
            poll_count: 2,
            elapsed_ms: 20,
        };
        assert_eq!(
            recovery.after_resolve(&cx_hit).await,
            IntegrationVerdict::Continue
        );
        assert_eq!(recovery.attempts(), 0);
    }

    #[tokio::test]
    async fn attempt_cap_halts_retries() {
        let dom = Arc::new(FakeDom::new());
        let scroller = FakeElement::new("div");
        scroller.set_scroll_state(ScrollState {
            top: 0.0,
            scroll_height: 100_000.0,
            client_height: 100.0,
        });
        dom.stub_css(".scroller", vec![scroller.handle()]);

        let mut recovery = recovery(&dom);
        let miss = ResolveResult::for_key("list.item");
        let cx = IntegrationContext {
            resolve_result: Some(&miss),
            poll_count: 1,
            elapsed_ms: 0,
        };
        recovery.before_resolve(&cx).await;
        let budget = scroll_attempt_budget(2);
        for _ in 0..budget {
            assert_eq!(recovery.after_resolve(&cx).await, IntegrationVerdict::Retry);
        }
        assert_eq!(recovery.after_resolve(&cx).await, IntegrationVerdict::Continue);
        assert_eq!(recovery.attempts(), budget);
    }
}
