//! Selector map validation.
//!
//! Validation is structural and total: the whole map is walked, every
//! problem is collected as a `{path, message}` issue, and any issue fails
//! the load. Validation never mutates the map, so it is idempotent.

use super::{SelectorMap, SelectorTry};

/// One validation problem, addressed by a JSON-path-like string.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A selector map that failed validation, with every issue found.
#[derive(Debug, Clone, thiserror::Error)]
#[error("selector map validation failed with {} issue(s)", issues.len())]
pub struct SelectorMapError {
    pub issues: Vec<ValidationIssue>,
}

impl SelectorMapError {
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }
}

/// Validate an in-memory selector map against the entry invariants:
/// non-empty keys, non-empty `tries`, non-empty strategy parameters,
/// resolvable non-self `scopeKey` references, and canonical try ordering.
pub fn validate_selector_map(map: &SelectorMap) -> Result<(), SelectorMapError> {
    let mut issues = Vec::new();

    for (key, entry) in map.iter() {
        let entry_path = format!("$.{key}");
        if key.trim().is_empty() {
            issues.push(ValidationIssue::new(
                "$",
                "logical keys must be non-empty strings",
            ));
        }

        if entry.tries.is_empty() {
            issues.push(ValidationIssue::new(
                format!("{entry_path}.tries"),
                "entry must declare at least one strategy",
            ));
        }

        if let Some(scope_key) = &entry.scope_key {
            let scope_path = format!("{entry_path}.scopeKey");
            if scope_key == key {
                issues.push(ValidationIssue::new(
                    scope_path,
                    "scopeKey must not reference the entry itself",
                ));
            } else if !map.contains_key(scope_key) {
                issues.push(ValidationIssue::new(
                    scope_path,
                    format!("scopeKey references unknown entry '{scope_key}'"),
                ));
            }
        }

        let mut previous: Option<&SelectorTry> = None;
        for (index, current) in entry.tries.iter().enumerate() {
            let try_path = format!("{entry_path}.tries[{index}]");
            let (param, value) = current.required_param();
            if value.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("{try_path}.{param}"),
                    format!("strategy '{}' requires a non-empty {param}", current.strategy()),
                ));
            }
            if let Some(prev) = previous {
                if current.priority() < prev.priority() {
                    issues.push(ValidationIssue::new(
                        try_path,
                        format!(
                            "strategy '{}' must not follow '{}' (canonical order is semantic before structural)",
                            current.strategy(),
                            prev.strategy()
                        ),
                    ));
                }
            }
            previous = Some(current);
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(SelectorMapError { issues })
    }
}

/// Parse a JSON selector map and validate it. JSON-level failures (bad
/// syntax, unknown strategy types, wrong shapes) are reported as a single
/// root-level issue.
pub fn parse_selector_map(json: &str) -> Result<SelectorMap, SelectorMapError> {
    let map: SelectorMap = serde_json::from_str(json).map_err(|err| SelectorMapError {
        issues: vec![ValidationIssue::new(
            "$",
            format!("invalid selector map JSON: {err}"),
        )],
    })?;
    validate_selector_map(&map)?;
    Ok(map)
}
