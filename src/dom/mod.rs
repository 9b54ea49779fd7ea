//! Backend seam for the live UI tree.
//!
//! The schedulers are generic over [`DomBackend`] (queries, viewport,
//! mutation observation) and [`DomElement`] (per-node reads and actions), so
//! the same cores run against a real browser bridge, a remote driver, or the
//! in-memory fake from [`crate::testing`].
//!
//! Mutation observation is subscription-based: `observe` hands back a
//! [`MutationSubscription`] whose batches arrive over a channel. Every
//! subscription registers with the process-wide [`ObserverManager`] so a
//! teardown can release observers leaked by abandoned waits.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Shared handle to a backend element.
pub type ElementHandle = Arc<dyn DomElement>;

/// Failures surfaced by a backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DomError {
    /// The element is no longer attached to the tree.
    #[error("element is detached: {0}")]
    Detached(String),
    /// The selector engine rejected or failed the query.
    #[error("query failed: {0}")]
    Query(String),
    /// Transport or driver failure.
    #[error("backend failure: {0}")]
    Backend(String),
    /// The backend cannot perform this operation at all.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Resolved CSS properties relevant to visibility checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedStyle {
    pub display: String,
    pub visibility: String,
    pub opacity: f64,
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            display: "block".to_string(),
            visibility: "visible".to_string(),
            opacity: 1.0,
        }
    }
}

/// Border box of an element, in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f64 {
        (self.width.max(0.0)) * (self.height.max(0.0))
    }

    /// Fraction of this box inside the viewport rect, in `[0, 1]`. Zero-area
    /// boxes intersect nothing.
    pub fn intersection_ratio(&self, viewport: &Viewport) -> f64 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        let left = self.x.max(0.0);
        let top = self.y.max(0.0);
        let right = (self.x + self.width).min(viewport.width);
        let bottom = (self.y + self.height).min(viewport.height);
        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        (overlap / area).clamp(0.0, 1.0)
    }
}

/// Viewport dimensions, when the backend knows them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Scroll geometry of a container element.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScrollState {
    pub top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollState {
    pub fn max_top(&self) -> f64 {
        (self.scroll_height - self.client_height).max(0.0)
    }

    pub fn is_scrollable(&self) -> bool {
        self.scroll_height > self.client_height + 1.0
    }
}

/// One node of the UI tree.
///
/// `is_connected` is synchronous: it is the staleness bit consulted on every
/// poll, and backends keep it current on the handle. Everything else may
/// round-trip to the backend and is async.
#[async_trait]
pub trait DomElement: fmt::Debug + Send + Sync {
    /// Identity of the underlying node; two handles to the same node share
    /// an id.
    fn handle_id(&self) -> u64;

    /// Whether the node is still attached to its tree.
    fn is_connected(&self) -> bool;

    /// Short human-readable descriptor for logs (tag, id, …).
    fn describe(&self) -> String;

    async fn text_content(&self) -> Result<String, DomError>;

    async fn computed_style(&self) -> Result<ComputedStyle, DomError>;

    async fn bounding_box(&self) -> Result<BoundingBox, DomError>;

    async fn scroll_state(&self) -> Result<ScrollState, DomError>;

    async fn scroll_to(&self, top: f64) -> Result<(), DomError>;

    async fn click(&self) -> Result<(), DomError>;

    async fn set_value(&self, value: &str) -> Result<(), DomError>;
}

/// What a mutation subscription watches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObserveOptions {
    pub attributes: bool,
    pub child_list: bool,
    pub character_data: bool,
    pub subtree: bool,
}

impl ObserveOptions {
    /// Watch everything; the default observe config.
    pub fn all() -> Self {
        Self {
            attributes: true,
            child_list: true,
            character_data: true,
            subtree: true,
        }
    }
}

/// Subtree a subscription is scoped to.
#[derive(Debug, Clone)]
pub enum ObserveTarget {
    /// The whole document.
    Document,
    /// Specific subtree roots.
    Elements(Vec<ElementHandle>),
}

/// Kind of a single observed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    Attributes,
    ChildList,
    CharacterData,
}

/// One observed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub kind: MutationKind,
    /// Node name of the mutated target (`div`, `#text`, …).
    pub target_name: String,
    /// Attribute name for [`MutationKind::Attributes`] records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_name: Option<String>,
}

impl MutationRecord {
    pub fn attributes(target_name: impl Into<String>, attribute_name: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::Attributes,
            target_name: target_name.into(),
            attribute_name: Some(attribute_name.into()),
        }
    }

    pub fn child_list(target_name: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target_name: target_name.into(),
            attribute_name: None,
        }
    }

    pub fn character_data(target_name: impl Into<String>) -> Self {
        Self {
            kind: MutationKind::CharacterData,
            target_name: target_name.into(),
            attribute_name: None,
        }
    }
}

/// Mutations delivered together in one observer callback.
pub type MutationBatch = Vec<MutationRecord>;

/// Liveness flag shared between a subscription and its producer.
#[derive(Debug, Default)]
pub struct ObserverState {
    disconnected: AtomicBool,
}

impl ObserverState {
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Producer half of a mutation channel, held by the backend.
#[derive(Debug, Clone)]
pub struct MutationFeed {
    sender: mpsc::UnboundedSender<MutationBatch>,
    state: Arc<ObserverState>,
}

impl MutationFeed {
    /// Deliver a batch; returns `false` once the subscription disconnected.
    pub fn send(&self, batch: MutationBatch) -> bool {
        if self.state.is_disconnected() {
            return false;
        }
        self.sender.send(batch).is_ok()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.is_disconnected()
    }
}

/// Consumer half of a mutation channel, owned by one idle-gate invocation.
/// Dropping it disconnects the observer.
#[derive(Debug)]
pub struct MutationSubscription {
    receiver: mpsc::UnboundedReceiver<MutationBatch>,
    state: Arc<ObserverState>,
}

impl MutationSubscription {
    /// Create a subscription plus its feeding half, registered with the
    /// process-wide observer manager.
    pub fn channel() -> (MutationFeed, MutationSubscription) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(ObserverState::default());
        observer_manager().track(&state);
        (
            MutationFeed {
                sender,
                state: state.clone(),
            },
            MutationSubscription { receiver, state },
        )
    }

    /// Next batch, or `None` once the feed is gone or disconnected.
    pub async fn next_batch(&mut self) -> Option<MutationBatch> {
        if self.state.is_disconnected() {
            return None;
        }
        self.receiver.recv().await
    }

    pub fn disconnect(&self) {
        self.state.disconnect();
    }
}

impl Drop for MutationSubscription {
    fn drop(&mut self) {
        self.state.disconnect();
    }
}

/// Process-wide registry of live mutation observers.
///
/// Orchestrators call [`ObserverManager::cleanup`] after a teardown so waits
/// abandoned mid-flight cannot keep observers attached.
#[derive(Debug, Default)]
pub struct ObserverManager {
    active: Mutex<Vec<Weak<ObserverState>>>,
}

impl ObserverManager {
    pub fn track(&self, state: &Arc<ObserverState>) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.retain(|weak| weak.strong_count() > 0);
        active.push(Arc::downgrade(state));
    }

    /// Disconnect every tracked observer; returns how many were still live.
    pub fn cleanup(&self) -> usize {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        for weak in active.drain(..) {
            if let Some(state) = weak.upgrade() {
                if !state.is_disconnected() {
                    state.disconnect();
                    released += 1;
                }
            }
        }
        released
    }

    /// Number of tracked observers that are still connected.
    pub fn active_count(&self) -> usize {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.retain(|weak| weak.strong_count() > 0);
        active
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|state| !state.is_disconnected())
            .count()
    }
}

/// The process-wide observer manager.
pub fn observer_manager() -> &'static ObserverManager {
    static MANAGER: OnceLock<ObserverManager> = OnceLock::new();
    MANAGER.get_or_init(ObserverManager::default)
}

/// A live UI tree.
#[async_trait]
pub trait DomBackend: fmt::Debug + Send + Sync {
    /// All elements matching a CSS selector under the scope (document when
    /// `None`), in tree order.
    async fn query_selector_all(
        &self,
        scope: Option<&ElementHandle>,
        css: &str,
    ) -> Result<Vec<ElementHandle>, DomError>;

    /// Elements matching an XPath expression under the scope, in document
    /// order.
    async fn evaluate_xpath(
        &self,
        scope: Option<&ElementHandle>,
        expression: &str,
    ) -> Result<Vec<ElementHandle>, DomError>;

    /// Element with the given id, restricted to the scope's subtree.
    async fn element_by_id(
        &self,
        scope: Option<&ElementHandle>,
        id: &str,
    ) -> Result<Option<ElementHandle>, DomError>;

    /// Current page URL.
    async fn current_url(&self) -> Result<String, DomError>;

    /// Viewport dimensions, when known.
    fn viewport(&self) -> Option<Viewport>;

    /// Start observing mutations under the target. `Ok(None)` means the
    /// backend cannot observe at all; callers degrade to timer-only waits.
    fn observe(
        &self,
        target: &ObserveTarget,
        options: &ObserveOptions,
    ) -> Result<Option<MutationSubscription>, DomError>;

    /// First element matching a CSS selector under the scope.
    async fn query_selector(
        &self,
        scope: Option<&ElementHandle>,
        css: &str,
    ) -> Result<Option<ElementHandle>, DomError> {
        Ok(self
            .query_selector_all(scope, css)
            .await?
            .into_iter()
            .next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_intersection_ratio() {
        let viewport = Viewport {
            width: 100.0,
            height: 100.0,
        };
        let inside = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        assert_eq!(inside.intersection_ratio(&viewport), 1.0);

        let half_out = BoundingBox::new(90.0, 0.0, 20.0, 10.0);
        assert!((half_out.intersection_ratio(&viewport) - 0.5).abs() < 1e-9);

        let outside = BoundingBox::new(200.0, 200.0, 10.0, 10.0);
        assert_eq!(outside.intersection_ratio(&viewport), 0.0);

        let empty = BoundingBox::default();
        assert_eq!(empty.intersection_ratio(&viewport), 0.0);
    }

    #[test]
    fn scroll_state_geometry() {
        let state = ScrollState {
            top: 0.0,
            scroll_height: 500.0,
            client_height: 200.0,
        };
        assert!(state.is_scrollable());
        assert_eq!(state.max_top(), 300.0);

        let flat = ScrollState {
            top: 0.0,
            scroll_height: 200.0,
            client_height: 200.0,
        };
        assert!(!flat.is_scrollable());
    }

    #[tokio::test]
    async fn subscription_channel_lifecycle() {
        let (feed, mut subscription) = MutationSubscription::channel();
        assert!(feed.send(vec![MutationRecord::child_list("div")]));
        let batch = subscription.next_batch().await.expect("one batch");
        assert_eq!(batch.len(), 1);

        subscription.disconnect();
        assert!(!feed.send(vec![MutationRecord::child_list("div")]));
        assert!(subscription.next_batch().await.is_none());

        // cleanup releases observers that were never explicitly disconnected
        let (leaked_feed, _leaked) = MutationSubscription::channel();
        observer_manager().cleanup();
        assert!(leaked_feed.is_disconnected());
    }
}
