//! Declarative conditions for `if` branches.
//!
//! Context conditions read through the manager; probe conditions (`exists`,
//! `textContains`) resolve through the bridge with synthetic probe requests
//! and swallow resolution failures to `false`. Cancellation is never
//! swallowed. `matches(expression)` is a reserved extension point: it warns
//! and evaluates to `false` until an expression language is defined.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::bridge::{BridgeRequest, ResolverBridge};
use crate::context::ContextManager;
use crate::dom::{DomBackend, DomElement};
use crate::error::StepError;
use crate::wait::TextPredicate;

/// A composable branch condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    CtxEquals {
        key: String,
        value: Value,
    },
    CtxNotEquals {
        key: String,
        value: Value,
    },
    CtxDefined {
        key: String,
    },
    CtxMissing {
        key: String,
    },
    /// The logical key currently resolves to an element.
    Exists {
        key: String,
    },
    NotExists {
        key: String,
    },
    /// The resolved element's normalized text contains (or equals) a value.
    TextContains {
        key: String,
        text: String,
        #[serde(default)]
        exact: bool,
    },
    UrlIncludes {
        value: String,
    },
    AllOf {
        conditions: Vec<Condition>,
    },
    AnyOf {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
    /// Reserved: warns and evaluates to `false`.
    Matches {
        expression: String,
    },
}

impl Condition {
    pub fn ctx_equals(key: impl Into<String>, value: Value) -> Self {
        Self::CtxEquals {
            key: key.into(),
            value,
        }
    }

    pub fn ctx_not_equals(key: impl Into<String>, value: Value) -> Self {
        Self::CtxNotEquals {
            key: key.into(),
            value,
        }
    }

    pub fn ctx_defined(key: impl Into<String>) -> Self {
        Self::CtxDefined { key: key.into() }
    }

    pub fn ctx_missing(key: impl Into<String>) -> Self {
        Self::CtxMissing { key: key.into() }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    pub fn not_exists(key: impl Into<String>) -> Self {
        Self::NotExists { key: key.into() }
    }

    pub fn text_contains(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self::TextContains {
            key: key.into(),
            text: text.into(),
            exact: false,
        }
    }

    pub fn url_includes(value: impl Into<String>) -> Self {
        Self::UrlIncludes {
            value: value.into(),
        }
    }

    pub fn all_of(conditions: Vec<Condition>) -> Self {
        Self::AllOf { conditions }
    }

    pub fn any_of(conditions: Vec<Condition>) -> Self {
        Self::AnyOf { conditions }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }
}

/// Collaborators a condition may consult.
pub(crate) struct ConditionScope<'a> {
    pub context: &'a mut ContextManager,
    pub bridge: &'a ResolverBridge,
    pub dom: &'a std::sync::Arc<dyn DomBackend>,
    pub run_id: &'a str,
    pub workflow_id: &'a str,
    pub attempt: u32,
    pub signal: &'a CancellationToken,
}

/// Evaluate a condition tree. Only cancellation propagates as an error.
pub(crate) fn evaluate<'a>(
    condition: &'a Condition,
    scope: &'a mut ConditionScope<'_>,
) -> BoxFuture<'a, Result<bool, StepError>> {
    Box::pin(async move {
        if scope.signal.is_cancelled() {
            return Err(StepError::cancelled("condition evaluation aborted"));
        }
        match condition {
            Condition::CtxEquals { key, value } => {
                Ok(scope.context.get(key).as_ref() == Some(value))
            }
            Condition::CtxNotEquals { key, value } => {
                Ok(scope.context.get(key).as_ref() != Some(value))
            }
            Condition::CtxDefined { key } => Ok(scope.context.get(key).is_some()),
            Condition::CtxMissing { key } => Ok(scope.context.get(key).is_none()),
            Condition::Exists { key } => probe_exists(scope, key).await,
            Condition::NotExists { key } => Ok(!probe_exists(scope, key).await?),
            Condition::TextContains { key, text, exact } => {
                probe_text(scope, key, text, *exact).await
            }
            Condition::UrlIncludes { value } => match scope.dom.current_url().await {
                Ok(url) => Ok(url.contains(value.as_str())),
                Err(err) => {
                    warn!(error = %err, "urlIncludes could not read the current URL");
                    Ok(false)
                }
            },
            Condition::AllOf { conditions } => {
                for inner in conditions {
                    if !evaluate(inner, scope).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::AnyOf { conditions } => {
                for inner in conditions {
                    if evaluate(inner, scope).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => Ok(!evaluate(condition, scope).await?),
            Condition::Matches { expression } => {
                warn!(expression, "matches() conditions are not implemented; evaluating to false");
                Ok(false)
            }
        }
    })
}

async fn probe_resolve(
    scope: &mut ConditionScope<'_>,
    key: &str,
    probe: &str,
) -> Result<Option<crate::selector::ResolveResult>, StepError> {
    let request = BridgeRequest {
        run_id: scope.run_id,
        workflow_id: scope.workflow_id,
        step_key: format!("probe:{probe}:{key}"),
        attempt: scope.attempt,
        logical_key: key,
        signal: scope.signal,
    };
    match scope.bridge.resolve(request).await {
        Ok(result) => Ok(Some(result)),
        Err(err) if err.is_cancellation() => Err(err),
        Err(_) => Ok(None),
    }
}

async fn probe_exists(scope: &mut ConditionScope<'_>, key: &str) -> Result<bool, StepError> {
    Ok(probe_resolve(scope, key, "exists")
        .await?
        .map(|result| result.element.is_some())
        .unwrap_or(false))
}

async fn probe_text(
    scope: &mut ConditionScope<'_>,
    key: &str,
    text: &str,
    exact: bool,
) -> Result<bool, StepError> {
    let Some(result) = probe_resolve(scope, key, "textContains").await? else {
        return Ok(false);
    };
    let Some(element) = result.element else {
        return Ok(false);
    };
    match element.text_content().await {
        Ok(raw) => {
            let normalized = TextPredicate::normalize(&raw);
            let needle = TextPredicate::normalize(text);
            Ok(if exact {
                normalized == needle
            } else {
                normalized.contains(&needle)
            })
        }
        Err(err) => {
            warn!(key, error = %err, "textContains could not read element text");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conditions_round_trip_through_json() {
        let condition = Condition::all_of(vec![
            Condition::ctx_equals("user.plan", json!("pro")),
            Condition::any_of(vec![
                Condition::exists("banner.dismiss"),
                Condition::not(Condition::url_includes("/onboarding")),
            ]),
            Condition::text_contains("cart.total", "$"),
        ]);
        let value = serde_json::to_value(&condition).expect("serialize");
        assert_eq!(value["type"], json!("allOf"));
        assert_eq!(value["conditions"][2]["type"], json!("textContains"));
        let back: Condition = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, condition);
    }
}
