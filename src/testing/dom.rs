//! Scriptable in-memory UI tree.
//!
//! Selectors are stubbed by their literal query string: the resolver builds
//! `[role="…"]`-style CSS and `descendant-or-self::…` XPath strings, so
//! stubs address exactly what a test expects the scheduler to ask for.
//! Responses can be fixed or per-call sequences (the last response
//! repeats), which models trees that change between polls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::dom::{
    BoundingBox, ComputedStyle, DomBackend, DomElement, DomError, ElementHandle, MutationFeed,
    MutationRecord, MutationSubscription, ObserveOptions, ObserveTarget, ScrollState, Viewport,
};

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct ElementState {
    connected: bool,
    text_script: Vec<String>,
    text_cursor: usize,
    style: ComputedStyle,
    bounding_box: BoundingBox,
    scroll: ScrollState,
    clicks: u32,
    typed: Vec<String>,
    scroll_calls: Vec<f64>,
}

impl Default for ElementState {
    fn default() -> Self {
        Self {
            connected: true,
            text_script: Vec::new(),
            text_cursor: 0,
            style: ComputedStyle::default(),
            bounding_box: BoundingBox::new(0.0, 0.0, 100.0, 20.0),
            scroll: ScrollState::default(),
            clicks: 0,
            typed: Vec::new(),
            scroll_calls: Vec::new(),
        }
    }
}

/// One scriptable element.
#[derive(Debug)]
pub struct FakeElement {
    id: u64,
    name: String,
    state: Mutex<ElementState>,
}

impl FakeElement {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ELEMENT_ID.fetch_add(1, Ordering::SeqCst),
            name: name.into(),
            state: Mutex::new(ElementState::default()),
        })
    }

    /// Type-erased handle for backend responses.
    pub fn handle(self: &Arc<Self>) -> ElementHandle {
        self.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ElementState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn set_text(&self, text: impl Into<String>) {
        let mut state = self.lock();
        state.text_script = vec![text.into()];
        state.text_cursor = 0;
    }

    /// Answer successive `text_content` reads with successive values; the
    /// last value repeats.
    pub fn set_text_sequence<I, S>(&self, texts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock();
        state.text_script = texts.into_iter().map(Into::into).collect();
        state.text_cursor = 0;
    }

    pub fn set_style(&self, style: ComputedStyle) {
        self.lock().style = style;
    }

    pub fn set_bounding_box(&self, bounding_box: BoundingBox) {
        self.lock().bounding_box = bounding_box;
    }

    pub fn set_scroll_state(&self, scroll: ScrollState) {
        self.lock().scroll = scroll;
    }

    pub fn clicks(&self) -> u32 {
        self.lock().clicks
    }

    pub fn typed(&self) -> Vec<String> {
        self.lock().typed.clone()
    }

    pub fn scroll_top(&self) -> f64 {
        self.lock().scroll.top
    }

    pub fn scroll_calls(&self) -> Vec<f64> {
        self.lock().scroll_calls.clone()
    }
}

#[async_trait]
impl DomElement for FakeElement {
    fn handle_id(&self) -> u64 {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn describe(&self) -> String {
        format!("<{}#{}>", self.name, self.id)
    }

    async fn text_content(&self) -> Result<String, DomError> {
        let mut state = self.lock();
        if state.text_script.is_empty() {
            return Ok(String::new());
        }
        let index = state.text_cursor.min(state.text_script.len() - 1);
        state.text_cursor += 1;
        Ok(state.text_script[index].clone())
    }

    async fn computed_style(&self) -> Result<ComputedStyle, DomError> {
        Ok(self.lock().style.clone())
    }

    async fn bounding_box(&self) -> Result<BoundingBox, DomError> {
        Ok(self.lock().bounding_box)
    }

    async fn scroll_state(&self) -> Result<ScrollState, DomError> {
        Ok(self.lock().scroll)
    }

    async fn scroll_to(&self, top: f64) -> Result<(), DomError> {
        let mut state = self.lock();
        let max_top = state.scroll.max_top();
        state.scroll.top = top.clamp(0.0, max_top);
        state.scroll_calls.push(top);
        Ok(())
    }

    async fn click(&self) -> Result<(), DomError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(DomError::Detached(format!("<{}#{}>", self.name, self.id)));
        }
        state.clicks += 1;
        Ok(())
    }

    async fn set_value(&self, value: &str) -> Result<(), DomError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(DomError::Detached(format!("<{}#{}>", self.name, self.id)));
        }
        state.typed.push(value.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ResponseScript {
    responses: Vec<Vec<ElementHandle>>,
    cursor: usize,
}

impl ResponseScript {
    fn fixed(elements: Vec<ElementHandle>) -> Self {
        Self {
            responses: vec![elements],
            cursor: 0,
        }
    }

    fn sequence(responses: Vec<Vec<ElementHandle>>) -> Self {
        Self {
            responses,
            cursor: 0,
        }
    }

    fn next(&mut self) -> Vec<ElementHandle> {
        if self.responses.is_empty() {
            return Vec::new();
        }
        let index = self.cursor.min(self.responses.len() - 1);
        self.cursor += 1;
        self.responses[index].clone()
    }
}

#[derive(Debug, Default)]
struct DomState {
    css: HashMap<String, ResponseScript>,
    xpath: HashMap<String, ResponseScript>,
    ids: HashMap<String, ResponseScript>,
}

/// Scriptable backend for the schedulers.
#[derive(Debug)]
pub struct FakeDom {
    state: Mutex<DomState>,
    viewport: Mutex<Option<Viewport>>,
    url: Mutex<String>,
    observation_supported: AtomicBool,
    feeds: Mutex<Vec<MutationFeed>>,
    query_counts: Mutex<HashMap<String, u32>>,
}

impl Default for FakeDom {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDom {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DomState::default()),
            viewport: Mutex::new(None),
            url: Mutex::new("about:blank".to_string()),
            observation_supported: AtomicBool::new(true),
            feeds: Mutex::new(Vec::new()),
            query_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Type-erased handle for resolver construction.
    pub fn backend(self: &Arc<Self>) -> Arc<dyn DomBackend> {
        self.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stub_css(&self, selector: impl Into<String>, elements: Vec<ElementHandle>) {
        self.state()
            .css
            .insert(selector.into(), ResponseScript::fixed(elements));
    }

    /// Per-call responses; the last repeats.
    pub fn stub_css_sequence(
        &self,
        selector: impl Into<String>,
        responses: Vec<Vec<ElementHandle>>,
    ) {
        self.state()
            .css
            .insert(selector.into(), ResponseScript::sequence(responses));
    }

    pub fn stub_xpath(&self, expression: impl Into<String>, elements: Vec<ElementHandle>) {
        self.state()
            .xpath
            .insert(expression.into(), ResponseScript::fixed(elements));
    }

    pub fn stub_xpath_sequence(
        &self,
        expression: impl Into<String>,
        responses: Vec<Vec<ElementHandle>>,
    ) {
        self.state()
            .xpath
            .insert(expression.into(), ResponseScript::sequence(responses));
    }

    pub fn stub_id(&self, id: impl Into<String>, element: ElementHandle) {
        self.state()
            .ids
            .insert(id.into(), ResponseScript::fixed(vec![element]));
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        *self.viewport.lock().unwrap_or_else(|e| e.into_inner()) = Some(viewport);
    }

    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.lock().unwrap_or_else(|e| e.into_inner()) = url.into();
    }

    pub fn set_observation_supported(&self, supported: bool) {
        self.observation_supported
            .store(supported, Ordering::SeqCst);
    }

    /// Deliver a mutation batch to every live subscription.
    pub fn emit_mutations(&self, records: Vec<MutationRecord>) {
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        feeds.retain(|feed| !feed.is_disconnected());
        for feed in feeds.iter() {
            feed.send(records.clone());
        }
    }

    /// How often a query string was asked for.
    pub fn query_count(&self, query: &str) -> u32 {
        self.query_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(query)
            .copied()
            .unwrap_or(0)
    }

    fn count_query(&self, query: &str) {
        *self
            .query_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(query.to_string())
            .or_insert(0) += 1;
    }
}

#[async_trait]
impl DomBackend for FakeDom {
    async fn query_selector_all(
        &self,
        _scope: Option<&ElementHandle>,
        css: &str,
    ) -> Result<Vec<ElementHandle>, DomError> {
        self.count_query(css);
        Ok(self
            .state()
            .css
            .get_mut(css)
            .map(ResponseScript::next)
            .unwrap_or_default())
    }

    async fn evaluate_xpath(
        &self,
        _scope: Option<&ElementHandle>,
        expression: &str,
    ) -> Result<Vec<ElementHandle>, DomError> {
        self.count_query(expression);
        Ok(self
            .state()
            .xpath
            .get_mut(expression)
            .map(ResponseScript::next)
            .unwrap_or_default())
    }

    async fn element_by_id(
        &self,
        _scope: Option<&ElementHandle>,
        id: &str,
    ) -> Result<Option<ElementHandle>, DomError> {
        self.count_query(id);
        Ok(self
            .state()
            .ids
            .get_mut(id)
            .map(ResponseScript::next)
            .unwrap_or_default()
            .into_iter()
            .next())
    }

    async fn current_url(&self) -> Result<String, DomError> {
        Ok(self.url.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn viewport(&self) -> Option<Viewport> {
        *self.viewport.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observe(
        &self,
        _target: &ObserveTarget,
        _options: &ObserveOptions,
    ) -> Result<Option<MutationSubscription>, DomError> {
        if !self.observation_supported.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let (feed, subscription) = MutationSubscription::channel();
        self.feeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(feed);
        Ok(Some(subscription))
    }
}
