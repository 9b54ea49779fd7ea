//! Wait predicates: pure evaluators of one polled element.
//!
//! A predicate looks at the element the resolver produced and answers
//! `satisfied` / `stale` plus a snapshot for telemetry. Predicates never
//! drive the poll loop; the scheduler owns timing, escalation, and retries.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::idle::IdleSnapshot;
use crate::dom::{DomElement, DomError, ElementHandle, Viewport};
use crate::error::WaitError;
use crate::selector::ResolveResult;

/// Replacement for text values in sanitized snapshots.
pub const TEXT_MASK: &str = "[***masked***]";

/// How expected text is compared against the element's normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextMode {
    Exact,
    #[default]
    Contains,
    Regex,
}

/// Snapshot of one text predicate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSnapshot {
    pub mode: TextMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub normalized_value: String,
    pub matches: bool,
}

/// Which side of visibility a wait is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityTarget {
    Visible,
    Hidden,
}

/// Thresholds for the visibility predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisibilityOptions {
    pub target: VisibilityTarget,
    /// Require `display != none`.
    pub require_displayed: bool,
    /// Require a positive viewport intersection when the viewport is known.
    pub require_in_viewport: bool,
    pub min_opacity: Option<f64>,
    pub min_intersection_ratio: Option<f64>,
    pub min_bounding_box_area: Option<f64>,
}

impl Default for VisibilityOptions {
    fn default() -> Self {
        Self {
            target: VisibilityTarget::Visible,
            require_displayed: true,
            require_in_viewport: false,
            min_opacity: None,
            min_intersection_ratio: None,
            min_bounding_box_area: None,
        }
    }
}

impl VisibilityOptions {
    pub fn visible() -> Self {
        Self::default()
    }

    pub fn hidden() -> Self {
        Self {
            target: VisibilityTarget::Hidden,
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: VisibilityTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_min_opacity(mut self, min_opacity: f64) -> Self {
        self.min_opacity = Some(min_opacity);
        self
    }

    pub fn with_min_intersection_ratio(mut self, ratio: f64) -> Self {
        self.min_intersection_ratio = Some(ratio);
        self
    }

    pub fn with_min_bounding_box_area(mut self, area: f64) -> Self {
        self.min_bounding_box_area = Some(area);
        self
    }

    pub fn in_viewport(mut self) -> Self {
        self.require_in_viewport = true;
        self
    }
}

/// Snapshot of one visibility predicate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilitySnapshot {
    pub target: VisibilityTarget,
    pub connected: bool,
    pub displayed: bool,
    pub css_visible: bool,
    pub opacity: f64,
    pub area: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersection_ratio: Option<f64>,
    pub visible: bool,
}

/// Merged snapshot carried in results, errors, and telemetry. Subfields are
/// disjoint: each predicate owns its own slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitPredicateSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<VisibilitySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle: Option<IdleSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_recoveries: Option<u32>,
}

impl WaitPredicateSnapshot {
    /// Overlay another snapshot: fields the other snapshot set win.
    pub fn merge_from(&mut self, other: &WaitPredicateSnapshot) {
        if other.text.is_some() {
            self.text = other.text.clone();
        }
        if other.visibility.is_some() {
            self.visibility = other.visibility.clone();
        }
        if other.idle.is_some() {
            self.idle = other.idle.clone();
        }
        if other.stale_recoveries.is_some() {
            self.stale_recoveries = other.stale_recoveries;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.visibility.is_none()
            && self.idle.is_none()
            && self.stale_recoveries.is_none()
    }
}

/// Everything a predicate may look at for one poll.
pub struct PredicateContext<'a> {
    pub element: &'a ElementHandle,
    pub resolve_result: &'a ResolveResult,
    pub poll_count: u32,
    pub elapsed_ms: u64,
    pub signal: &'a CancellationToken,
}

/// Verdict of one predicate evaluation.
#[derive(Debug, Clone, Default)]
pub struct PredicateVerdict {
    pub satisfied: bool,
    pub stale: bool,
    pub snapshot: Option<WaitPredicateSnapshot>,
}

impl PredicateVerdict {
    pub fn satisfied(snapshot: Option<WaitPredicateSnapshot>) -> Self {
        Self {
            satisfied: true,
            stale: false,
            snapshot,
        }
    }

    pub fn unsatisfied(snapshot: Option<WaitPredicateSnapshot>) -> Self {
        Self {
            satisfied: false,
            stale: false,
            snapshot,
        }
    }

    pub fn stale() -> Self {
        Self {
            satisfied: false,
            stale: true,
            snapshot: None,
        }
    }
}

/// A composable wait predicate.
#[async_trait]
pub trait WaitPredicate: Send + Sync {
    async fn evaluate(&self, cx: PredicateContext<'_>) -> Result<PredicateVerdict, DomError>;
}

/// Configuration of the text predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPredicateConfig {
    pub mode: TextMode,
    pub expected: Option<String>,
    pub pattern: Option<String>,
    pub sanitize: bool,
}

/// Matches the element's whitespace-normalized text.
#[derive(Debug)]
pub struct TextPredicate {
    config: TextPredicateConfig,
    regex: Option<Regex>,
}

impl TextPredicate {
    pub fn new(config: TextPredicateConfig) -> Result<Self, WaitError> {
        let regex = match config.mode {
            TextMode::Regex => {
                let compiled = match (&config.pattern, &config.expected) {
                    (Some(pattern), _) => Regex::new(pattern),
                    // no pattern: fall back to a case-insensitive literal match
                    (None, Some(expected)) => {
                        Regex::new(&format!("(?i){}", regex::escape(expected)))
                    }
                    (None, None) => {
                        return Err(WaitError::invalid_options(
                            "regex text mode requires a pattern or expected text",
                        ));
                    }
                };
                Some(compiled.map_err(|err| {
                    WaitError::invalid_options(format!("invalid text pattern: {err}"))
                })?)
            }
            _ => None,
        };
        Ok(Self { config, regex })
    }

    /// Collapse whitespace runs and trim.
    pub fn normalize(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn matches(&self, normalized: &str) -> bool {
        match self.config.mode {
            TextMode::Exact => {
                let expected = self.config.expected.as_deref().unwrap_or_default();
                normalized == Self::normalize(expected)
            }
            TextMode::Contains => {
                let expected = self.config.expected.as_deref().unwrap_or_default();
                normalized.contains(&Self::normalize(expected))
            }
            TextMode::Regex => self
                .regex
                .as_ref()
                .map(|regex| regex.is_match(normalized))
                .unwrap_or(false),
        }
    }

    fn snapshot(&self, normalized: String, matches: bool) -> TextSnapshot {
        if self.config.sanitize {
            TextSnapshot {
                mode: self.config.mode,
                expected: self.config.expected.as_ref().map(|_| TEXT_MASK.to_string()),
                // the pattern may embed expected fragments, drop it entirely
                pattern: None,
                normalized_value: TEXT_MASK.to_string(),
                matches,
            }
        } else {
            TextSnapshot {
                mode: self.config.mode,
                expected: self.config.expected.clone(),
                pattern: self.config.pattern.clone(),
                normalized_value: normalized,
                matches,
            }
        }
    }
}

#[async_trait]
impl WaitPredicate for TextPredicate {
    async fn evaluate(&self, cx: PredicateContext<'_>) -> Result<PredicateVerdict, DomError> {
        if !cx.element.is_connected() {
            return Ok(PredicateVerdict::stale());
        }
        let raw = match cx.element.text_content().await {
            Ok(raw) => raw,
            Err(DomError::Detached(_)) => return Ok(PredicateVerdict::stale()),
            Err(err) => return Err(err),
        };
        let normalized = Self::normalize(&raw);
        let matches = self.matches(&normalized);
        let snapshot = WaitPredicateSnapshot {
            text: Some(self.snapshot(normalized, matches)),
            ..WaitPredicateSnapshot::default()
        };
        Ok(if matches {
            PredicateVerdict::satisfied(Some(snapshot))
        } else {
            PredicateVerdict::unsatisfied(Some(snapshot))
        })
    }
}

/// Checks displayedness, opacity, box area, and viewport intersection.
#[derive(Debug)]
pub struct VisibilityPredicate {
    options: VisibilityOptions,
    viewport: Option<Viewport>,
}

impl VisibilityPredicate {
    pub fn new(options: VisibilityOptions, viewport: Option<Viewport>) -> Self {
        Self { options, viewport }
    }
}

#[async_trait]
impl WaitPredicate for VisibilityPredicate {
    async fn evaluate(&self, cx: PredicateContext<'_>) -> Result<PredicateVerdict, DomError> {
        if !cx.element.is_connected() {
            return Ok(PredicateVerdict::stale());
        }
        let style = match cx.element.computed_style().await {
            Ok(style) => style,
            Err(DomError::Detached(_)) => return Ok(PredicateVerdict::stale()),
            Err(err) => return Err(err),
        };
        let bounding_box = match cx.element.bounding_box().await {
            Ok(bounding_box) => bounding_box,
            Err(DomError::Detached(_)) => return Ok(PredicateVerdict::stale()),
            Err(err) => return Err(err),
        };

        let displayed = style.display != "none";
        let css_visible = !matches!(style.visibility.as_str(), "hidden" | "collapse");
        let opacity_ok = match self.options.min_opacity {
            Some(threshold) => style.opacity >= threshold,
            None => style.opacity > 0.0,
        };
        let area = bounding_box.area();
        let area_ok = match self.options.min_bounding_box_area {
            Some(threshold) => area >= threshold,
            None => area > 0.0,
        };
        let intersection_ratio = self
            .viewport
            .as_ref()
            .map(|viewport| bounding_box.intersection_ratio(viewport));
        let ratio_ok = match (self.options.min_intersection_ratio, intersection_ratio) {
            (Some(threshold), Some(ratio)) => ratio >= threshold,
            // viewport unknown: the threshold cannot be evaluated, let it pass
            (Some(_), None) => true,
            (None, _) => true,
        };
        let in_viewport_ok = if self.options.require_in_viewport {
            intersection_ratio.map(|ratio| ratio > 0.0).unwrap_or(true)
        } else {
            true
        };

        let visible = (!self.options.require_displayed || displayed)
            && css_visible
            && opacity_ok
            && area_ok
            && ratio_ok
            && in_viewport_ok;
        let satisfied = match self.options.target {
            VisibilityTarget::Visible => visible,
            VisibilityTarget::Hidden => !visible,
        };

        let snapshot = WaitPredicateSnapshot {
            visibility: Some(VisibilitySnapshot {
                target: self.options.target,
                connected: true,
                displayed,
                css_visible,
                opacity: style.opacity,
                area,
                intersection_ratio,
                visible,
            }),
            ..WaitPredicateSnapshot::default()
        };
        Ok(if satisfied {
            PredicateVerdict::satisfied(Some(snapshot))
        } else {
            PredicateVerdict::unsatisfied(Some(snapshot))
        })
    }
}

/// Runs every part per poll: `satisfied` is the conjunction, `stale` the
/// disjunction, snapshots merge field-wise.
pub struct CompositePredicate {
    parts: Vec<Box<dyn WaitPredicate>>,
}

impl CompositePredicate {
    pub fn new(parts: Vec<Box<dyn WaitPredicate>>) -> Self {
        Self { parts }
    }
}

#[async_trait]
impl WaitPredicate for CompositePredicate {
    async fn evaluate(&self, cx: PredicateContext<'_>) -> Result<PredicateVerdict, DomError> {
        let mut satisfied = true;
        let mut stale = false;
        let mut snapshot = WaitPredicateSnapshot::default();
        for part in &self.parts {
            let verdict = part
                .evaluate(PredicateContext {
                    element: cx.element,
                    resolve_result: cx.resolve_result,
                    poll_count: cx.poll_count,
                    elapsed_ms: cx.elapsed_ms,
                    signal: cx.signal,
                })
                .await?;
            satisfied &= verdict.satisfied;
            stale |= verdict.stale;
            if let Some(part_snapshot) = &verdict.snapshot {
                snapshot.merge_from(part_snapshot);
            }
        }
        Ok(PredicateVerdict {
            satisfied,
            stale,
            snapshot: (!snapshot.is_empty()).then_some(snapshot),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{BoundingBox, ComputedStyle};
    use crate::testing::FakeElement;

    fn context<'a>(
        element: &'a ElementHandle,
        resolve_result: &'a ResolveResult,
        signal: &'a CancellationToken,
    ) -> PredicateContext<'a> {
        PredicateContext {
            element,
            resolve_result,
            poll_count: 1,
            elapsed_ms: 0,
            signal,
        }
    }

    fn text_predicate(mode: TextMode, expected: &str, sanitize: bool) -> TextPredicate {
        TextPredicate::new(TextPredicateConfig {
            mode,
            expected: Some(expected.to_string()),
            pattern: None,
            sanitize,
        })
        .expect("valid predicate")
    }

    #[tokio::test]
    async fn text_predicate_normalizes_whitespace() {
        let element = FakeElement::new("div");
        element.set_text("  Ready   to\n  go ");
        let handle = element.handle();
        let resolve = ResolveResult::anonymous();
        let signal = CancellationToken::new();

        let predicate = text_predicate(TextMode::Exact, "Ready to go", false);
        let verdict = predicate
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(verdict.satisfied);
        let snapshot = verdict.snapshot.expect("snapshot").text.expect("text");
        assert_eq!(snapshot.normalized_value, "Ready to go");
    }

    #[tokio::test]
    async fn text_predicate_masks_when_sanitizing() {
        let element = FakeElement::new("div");
        element.set_text("Ready");
        let handle = element.handle();
        let resolve = ResolveResult::anonymous();
        let signal = CancellationToken::new();

        let predicate = text_predicate(TextMode::Exact, "Ready", true);
        let verdict = predicate
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        let snapshot = verdict.snapshot.expect("snapshot").text.expect("text");
        assert_eq!(snapshot.expected.as_deref(), Some(TEXT_MASK));
        assert_eq!(snapshot.normalized_value, TEXT_MASK);
        assert!(snapshot.pattern.is_none());
        assert!(snapshot.matches);
    }

    #[tokio::test]
    async fn regex_mode_without_pattern_falls_back_to_case_insensitive() {
        let element = FakeElement::new("div");
        element.set_text("READY");
        let handle = element.handle();
        let resolve = ResolveResult::anonymous();
        let signal = CancellationToken::new();

        let predicate = text_predicate(TextMode::Regex, "ready", false);
        let verdict = predicate
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(verdict.satisfied);
    }

    #[tokio::test]
    async fn disconnected_element_is_stale_not_failed() {
        let element = FakeElement::new("div");
        element.set_text("Ready");
        element.set_connected(false);
        let handle = element.handle();
        let resolve = ResolveResult::anonymous();
        let signal = CancellationToken::new();

        let predicate = text_predicate(TextMode::Exact, "Ready", false);
        let verdict = predicate
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(verdict.stale);
        assert!(!verdict.satisfied);
    }

    #[tokio::test]
    async fn visibility_predicate_tracks_display_and_area() {
        let element = FakeElement::new("div");
        element.set_bounding_box(BoundingBox::new(0.0, 0.0, 100.0, 40.0));
        let handle = element.handle();
        let resolve = ResolveResult::anonymous();
        let signal = CancellationToken::new();

        let visible = VisibilityPredicate::new(VisibilityOptions::visible(), None);
        let verdict = visible
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(verdict.satisfied);

        element.set_style(ComputedStyle {
            display: "none".into(),
            ..ComputedStyle::default()
        });
        let verdict = visible
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(!verdict.satisfied);

        let hidden = VisibilityPredicate::new(VisibilityOptions::hidden(), None);
        let verdict = hidden
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(verdict.satisfied);
        let snapshot = verdict.snapshot.expect("snapshot").visibility.expect("vis");
        assert!(!snapshot.visible);
        assert!(!snapshot.displayed);
    }

    #[tokio::test]
    async fn visibility_predicate_honors_intersection_threshold() {
        let element = FakeElement::new("div");
        // half of the box hangs below a 100px-tall viewport
        element.set_bounding_box(BoundingBox::new(0.0, 50.0, 100.0, 100.0));
        let handle = element.handle();
        let resolve = ResolveResult::anonymous();
        let signal = CancellationToken::new();
        let viewport = Viewport {
            width: 200.0,
            height: 100.0,
        };

        let strict = VisibilityPredicate::new(
            VisibilityOptions::visible().with_min_intersection_ratio(0.9),
            Some(viewport),
        );
        let verdict = strict
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(!verdict.satisfied);

        let lenient = VisibilityPredicate::new(
            VisibilityOptions::visible().with_min_intersection_ratio(0.4),
            Some(viewport),
        );
        let verdict = lenient
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(verdict.satisfied);
    }

    #[tokio::test]
    async fn composite_merges_verdicts_and_snapshots() {
        let element = FakeElement::new("div");
        element.set_text("Ready");
        element.set_bounding_box(BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        let handle = element.handle();
        let resolve = ResolveResult::anonymous();
        let signal = CancellationToken::new();

        let composite = CompositePredicate::new(vec![
            Box::new(text_predicate(TextMode::Exact, "Ready", false)),
            Box::new(VisibilityPredicate::new(VisibilityOptions::visible(), None)),
        ]);
        let verdict = composite
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(verdict.satisfied);
        let snapshot = verdict.snapshot.expect("snapshot");
        assert!(snapshot.text.is_some());
        assert!(snapshot.visibility.is_some());

        let failing = CompositePredicate::new(vec![
            Box::new(text_predicate(TextMode::Exact, "Other", false)),
            Box::new(VisibilityPredicate::new(VisibilityOptions::visible(), None)),
        ]);
        let verdict = failing
            .evaluate(context(&handle, &resolve, &signal))
            .await
            .expect("evaluate");
        assert!(!verdict.satisfied);
    }
}
