//! Selector maps: logical keys resolved through ordered fallback strategies.
//!
//! A [`SelectorMap`] names every UI node the automation touches by a stable
//! logical key. Each entry lists its [`SelectorTry`] strategies in canonical
//! priority order (semantic identifiers before structural ones) and the
//! [`SelectorResolver`] walks them until one matches.

mod resolver;
mod validate;

pub use resolver::{SelectorResolver, text_xpath};
pub use validate::{SelectorMapError, ValidationIssue, parse_selector_map, validate_selector_map};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::dom::ElementHandle;

/// One attempt strategy for locating a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SelectorTry {
    /// `[role="…"]`, optionally narrowed by `[aria-label="…"]`.
    #[serde(rename_all = "camelCase")]
    Role {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aria_label: Option<String>,
    },
    /// `[name="…"]`.
    Name { name: String },
    /// `[aria-label="…"]`.
    Label { label: String },
    /// `[data-testid="…"]`.
    #[serde(rename_all = "camelCase")]
    TestId { test_id: String },
    /// Exact or substring text match via XPath.
    Text {
        text: String,
        #[serde(default)]
        exact: bool,
    },
    /// `[name]` or `[name="value"]`.
    DataAttr {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Element-by-id lookup scoped to the entry's subtree.
    Id { id: String },
    /// Raw CSS selector.
    Css { css: String },
    /// Raw XPath expression.
    Xpath { xpath: String },
}

impl SelectorTry {
    pub fn role(role: impl Into<String>) -> Self {
        Self::Role {
            role: role.into(),
            aria_label: None,
        }
    }

    pub fn role_labelled(role: impl Into<String>, aria_label: impl Into<String>) -> Self {
        Self::Role {
            role: role.into(),
            aria_label: Some(aria_label.into()),
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self::Name { name: name.into() }
    }

    pub fn label(label: impl Into<String>) -> Self {
        Self::Label {
            label: label.into(),
        }
    }

    pub fn test_id(test_id: impl Into<String>) -> Self {
        Self::TestId {
            test_id: test_id.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            exact: false,
        }
    }

    pub fn exact_text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            exact: true,
        }
    }

    pub fn data_attr(name: impl Into<String>, value: Option<String>) -> Self {
        Self::DataAttr {
            name: name.into(),
            value,
        }
    }

    pub fn id(id: impl Into<String>) -> Self {
        Self::Id { id: id.into() }
    }

    pub fn css(css: impl Into<String>) -> Self {
        Self::Css { css: css.into() }
    }

    pub fn xpath(xpath: impl Into<String>) -> Self {
        Self::Xpath {
            xpath: xpath.into(),
        }
    }

    /// Canonical priority: lower values are more semantic and must come
    /// first within an entry.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Role { .. } => 0,
            Self::Name { .. } => 1,
            Self::Label { .. } => 2,
            Self::TestId { .. } => 3,
            Self::Text { .. } => 4,
            Self::DataAttr { .. } => 5,
            Self::Id { .. } => 6,
            Self::Css { .. } => 7,
            Self::Xpath { .. } => 8,
        }
    }

    /// Wire name of the strategy, as carried in attempts and history.
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Role { .. } => "role",
            Self::Name { .. } => "name",
            Self::Label { .. } => "label",
            Self::TestId { .. } => "testId",
            Self::Text { .. } => "text",
            Self::DataAttr { .. } => "dataAttr",
            Self::Id { .. } => "id",
            Self::Css { .. } => "css",
            Self::Xpath { .. } => "xpath",
        }
    }

    /// Field name and value of the strategy's required parameter.
    pub(crate) fn required_param(&self) -> (&'static str, &str) {
        match self {
            Self::Role { role, .. } => ("role", role),
            Self::Name { name } => ("name", name),
            Self::Label { label } => ("label", label),
            Self::TestId { test_id } => ("testId", test_id),
            Self::Text { text, .. } => ("text", text),
            Self::DataAttr { name, .. } => ("name", name),
            Self::Id { id } => ("id", id),
            Self::Css { css } => ("css", css),
            Self::Xpath { xpath } => ("xpath", xpath),
        }
    }
}

/// A named node of the selector map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Logical key of the entry this one resolves under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Authoring-time confidence in the entry, `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability_score: Option<f64>,
    pub tries: Vec<SelectorTry>,
}

impl SelectorEntry {
    pub fn new(tries: Vec<SelectorTry>) -> Self {
        Self {
            description: None,
            scope_key: None,
            tags: Vec::new(),
            stability_score: None,
            tries,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_scope_key(mut self, scope_key: impl Into<String>) -> Self {
        self.scope_key = Some(scope_key.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_stability_score(mut self, score: f64) -> Self {
        self.stability_score = Some(score);
        self
    }
}

/// Logical key → entry mapping, immutable while runs are in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectorMap {
    entries: BTreeMap<String, SelectorEntry>,
}

impl SelectorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON selector map. Parse failures surface as a
    /// single root-level issue.
    pub fn parse(json: &str) -> Result<Self, SelectorMapError> {
        parse_selector_map(json)
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: SelectorEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn with_entry(mut self, key: impl Into<String>, entry: SelectorEntry) -> Self {
        self.insert(key, entry);
        self
    }

    pub fn get(&self, key: &str) -> Option<&SelectorEntry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SelectorEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One strategy attempt during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveAttempt {
    pub strategy: String,
    pub success: bool,
    /// Matching element count for the strategy.
    pub elements: usize,
}

/// Scope a resolution happened under.
#[derive(Debug, Clone)]
pub struct ResolvedScope {
    pub key: String,
    pub root: ElementHandle,
}

/// Outcome of resolving a logical key (or a raw fallback selector).
#[derive(Debug, Clone, Default)]
pub struct ResolveResult {
    pub key: Option<String>,
    pub element: Option<ElementHandle>,
    pub attempts: Vec<ResolveAttempt>,
    /// Strategy of the winning try.
    pub resolved_by: Option<String>,
    pub scope: Option<ResolvedScope>,
    pub entry: Option<SelectorEntry>,
}

impl ResolveResult {
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Result for a wait that resolves without a logical key.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Strategy names tried so far, in order.
    pub fn strategy_types(&self) -> Vec<String> {
        self.attempts
            .iter()
            .map(|attempt| attempt.strategy.clone())
            .collect()
    }

    /// Sanitizer-ready summary for telemetry payloads.
    pub fn summary_payload(&self) -> Value {
        json!({
            "key": self.key,
            "resolvedBy": self.resolved_by,
            "found": self.element.is_some(),
            "attempts": self.attempts,
            "scopeKey": self.scope.as_ref().map(|scope| scope.key.clone()),
        })
    }
}
