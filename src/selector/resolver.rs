//! Ordered-strategy resolution of logical keys against a backend.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ResolveAttempt, ResolveResult, ResolvedScope, SelectorMap, SelectorTry};
use crate::dom::{DomBackend, DomElement, DomError, ElementHandle};

/// Resolves logical keys by walking an entry's tries in declared order under
/// the entry's scope. Shared across runs; the map is immutable while runs
/// are in flight.
#[derive(Debug, Clone)]
pub struct SelectorResolver {
    map: Arc<SelectorMap>,
    dom: Arc<dyn DomBackend>,
}

impl SelectorResolver {
    pub fn new(map: Arc<SelectorMap>, dom: Arc<dyn DomBackend>) -> Self {
        Self { map, dom }
    }

    pub fn map(&self) -> &SelectorMap {
        &self.map
    }

    pub fn backend(&self) -> &Arc<dyn DomBackend> {
        &self.dom
    }

    /// Resolve a logical key to at most one element under `root` (document
    /// when `None`). The first successful try wins; every try is recorded as
    /// an attempt.
    pub async fn resolve(
        &self,
        key: &str,
        root: Option<&ElementHandle>,
    ) -> Result<ResolveResult, DomError> {
        let mut result = ResolveResult::for_key(key);
        let Some(entry) = self.map.get(key) else {
            warn!(key, "selector map has no entry for logical key");
            return Ok(result);
        };
        result.entry = Some(entry.clone());

        let mut scope_root: Option<ElementHandle> = root.cloned();
        if let Some(scope_key) = &entry.scope_key {
            let scope_result = Box::pin(self.resolve(scope_key, root)).await?;
            match scope_result.element {
                Some(scope_element) => {
                    result.scope = Some(ResolvedScope {
                        key: scope_key.clone(),
                        root: scope_element.clone(),
                    });
                    scope_root = Some(scope_element);
                }
                None => {
                    warn!(key, scope_key, "scope did not resolve; key cannot match");
                    return Ok(result);
                }
            }
        }

        for selector_try in &entry.tries {
            let matches = self.run_try(selector_try, scope_root.as_ref()).await?;
            let strategy = selector_try.strategy();
            result.attempts.push(ResolveAttempt {
                strategy: strategy.to_string(),
                success: !matches.is_empty(),
                elements: matches.len(),
            });
            if let Some(element) = matches.into_iter().next() {
                debug!(key, strategy, element = %element.describe(), "resolved logical key");
                result.element = Some(element);
                result.resolved_by = Some(strategy.to_string());
                return Ok(result);
            }
        }

        warn!(key, tried = result.attempts.len(), "no selector strategy matched");
        Ok(result)
    }

    async fn run_try(
        &self,
        selector_try: &SelectorTry,
        scope: Option<&ElementHandle>,
    ) -> Result<Vec<ElementHandle>, DomError> {
        match selector_try {
            SelectorTry::Role { role, aria_label } => {
                let css = match aria_label {
                    Some(label) => format!(
                        "[role={}][aria-label={}]",
                        css_string(role),
                        css_string(label)
                    ),
                    None => format!("[role={}]", css_string(role)),
                };
                self.dom.query_selector_all(scope, &css).await
            }
            SelectorTry::Name { name } => {
                let css = format!("[name={}]", css_string(name));
                self.dom.query_selector_all(scope, &css).await
            }
            SelectorTry::Label { label } => {
                let css = format!("[aria-label={}]", css_string(label));
                self.dom.query_selector_all(scope, &css).await
            }
            SelectorTry::TestId { test_id } => {
                let css = format!("[data-testid={}]", css_string(test_id));
                self.dom.query_selector_all(scope, &css).await
            }
            SelectorTry::Text { text, exact } => {
                self.dom
                    .evaluate_xpath(scope, &text_xpath(text, *exact))
                    .await
            }
            SelectorTry::DataAttr { name, value } => {
                let css = match value {
                    Some(value) => format!("[{name}={}]", css_string(value)),
                    None => format!("[{name}]"),
                };
                self.dom.query_selector_all(scope, &css).await
            }
            SelectorTry::Id { id } => Ok(self
                .dom
                .element_by_id(scope, id)
                .await?
                .into_iter()
                .collect()),
            SelectorTry::Css { css } => self.dom.query_selector_all(scope, css).await,
            SelectorTry::Xpath { xpath } => self.dom.evaluate_xpath(scope, xpath).await,
        }
    }
}

/// XPath for the `text` strategy: exact node-text equality or substring
/// containment over the subtree.
pub fn text_xpath(text: &str, exact: bool) -> String {
    let literal = xpath_literal(text);
    if exact {
        format!("descendant-or-self::*[text()={literal}]")
    } else {
        format!("descendant-or-self::*[contains(text(), {literal})]")
    }
}

/// Quote a string as an XPath literal, falling back to `concat(…)` when both
/// quote characters appear.
fn xpath_literal(text: &str) -> String {
    if !text.contains('"') {
        format!("\"{text}\"")
    } else if !text.contains('\'') {
        format!("'{text}'")
    } else {
        let parts: Vec<String> = text
            .split('"')
            .map(|part| format!("\"{part}\""))
            .collect();
        format!("concat({})", parts.join(", '\"', "))
    }
}

/// Quote a string for use inside a CSS attribute selector.
fn css_string(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SelectorEntry;
    use crate::testing::{FakeDom, FakeElement};

    fn map_with(key: &str, entry: SelectorEntry) -> Arc<SelectorMap> {
        Arc::new(SelectorMap::new().with_entry(key, entry))
    }

    #[tokio::test]
    async fn first_successful_try_wins_and_attempts_are_recorded() {
        let dom = Arc::new(FakeDom::new());
        let button = FakeElement::new("button");
        dom.stub_css("[data-testid=\"go\"]", vec![button.handle()]);

        let map = map_with(
            "cta",
            SelectorEntry::new(vec![
                SelectorTry::role("button"),
                SelectorTry::test_id("go"),
                SelectorTry::css(".go"),
            ]),
        );
        let resolver = SelectorResolver::new(map, dom.backend());

        let result = resolver.resolve("cta", None).await.expect("resolve");
        assert_eq!(result.resolved_by.as_deref(), Some("testId"));
        assert_eq!(result.attempts.len(), 2);
        assert!(!result.attempts[0].success);
        assert!(result.attempts[1].success);
        assert_eq!(result.strategy_types(), vec!["role", "testId"]);
    }

    #[tokio::test]
    async fn scope_miss_short_circuits_the_entry() {
        let dom = Arc::new(FakeDom::new());
        let map = Arc::new(
            SelectorMap::new()
                .with_entry(
                    "panel.item",
                    SelectorEntry::new(vec![SelectorTry::css(".item")]).with_scope_key("panel"),
                )
                .with_entry("panel", SelectorEntry::new(vec![SelectorTry::css(".panel")])),
        );
        let resolver = SelectorResolver::new(map, dom.backend());

        let result = resolver.resolve("panel.item", None).await.expect("resolve");
        assert!(result.element.is_none());
        assert!(result.scope.is_none());
        assert!(result.attempts.is_empty());
    }

    #[tokio::test]
    async fn scope_is_resolved_first_and_reported() {
        let dom = Arc::new(FakeDom::new());
        let panel = FakeElement::new("section");
        let item = FakeElement::new("li");
        dom.stub_css(".panel", vec![panel.handle()]);
        dom.stub_css(".item", vec![item.handle()]);

        let map = Arc::new(
            SelectorMap::new()
                .with_entry(
                    "panel.item",
                    SelectorEntry::new(vec![SelectorTry::css(".item")]).with_scope_key("panel"),
                )
                .with_entry("panel", SelectorEntry::new(vec![SelectorTry::css(".panel")])),
        );
        let resolver = SelectorResolver::new(map, dom.backend());

        let result = resolver.resolve("panel.item", None).await.expect("resolve");
        let scope = result.scope.expect("scope recorded");
        assert_eq!(scope.key, "panel");
        assert_eq!(scope.root.handle_id(), panel.handle_id());
        assert_eq!(
            result.element.expect("item found").handle_id(),
            item.handle_id()
        );
    }

    #[tokio::test]
    async fn unknown_key_is_a_clean_miss() {
        let dom = Arc::new(FakeDom::new());
        let resolver = SelectorResolver::new(Arc::new(SelectorMap::new()), dom.backend());
        let result = resolver.resolve("ghost", None).await.expect("resolve");
        assert!(result.element.is_none());
        assert!(result.entry.is_none());
    }

    #[test]
    fn text_xpath_escapes_literals() {
        assert_eq!(
            text_xpath("Ready", true),
            "descendant-or-self::*[text()=\"Ready\"]"
        );
        assert_eq!(
            text_xpath("it's", false),
            "descendant-or-self::*[contains(text(), \"it's\")]"
        );
        assert_eq!(
            text_xpath("say \"hi\"", false),
            "descendant-or-self::*[contains(text(), 'say \"hi\"')]"
        );
        assert!(text_xpath("both \" and '", true).starts_with("descendant-or-self::*[text()=concat("));
    }
}
