//! Structural masking of sensitive payload fields.
//!
//! Matching is on the **key** name, not the value: any field whose key
//! matches the sensitive pattern has its value replaced before a payload
//! reaches an observer. Callers that embed secrets under benign keys are
//! outside the contract; a custom [`SanitizeRule`] can widen or narrow the
//! replacement for matching fields.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Mask for short strings, numbers, and null.
pub const MASK_SHORT: &str = "****";
/// Mask for everything else.
pub const MASK_LONG: &str = "********";

fn sensitive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new("(?i)password|secret|token|auth|cookie|session|key")
            .expect("sensitive-key pattern is a valid regex")
    })
}

/// Whether a payload key names sensitive material.
pub fn is_sensitive_key(key: &str) -> bool {
    sensitive_pattern().is_match(key)
}

/// Caller-supplied replacement for sensitive fields.
pub trait SanitizeRule: Send + Sync {
    /// Replacement for a matching field, or `None` to fall back to the
    /// default mask.
    fn mask(&self, key: &str, value: &Value) -> Option<Value>;
}

impl<F> SanitizeRule for F
where
    F: Fn(&str, &Value) -> Option<Value> + Send + Sync,
{
    fn mask(&self, key: &str, value: &Value) -> Option<Value> {
        self(key, value)
    }
}

/// Default replacement: `****` for nullish, numeric, and ≤4-char string
/// values; `********` otherwise.
pub fn default_mask(value: &Value) -> Value {
    match value {
        Value::Null | Value::Number(_) => Value::String(MASK_SHORT.to_string()),
        Value::String(s) if s.chars().count() <= 4 => Value::String(MASK_SHORT.to_string()),
        _ => Value::String(MASK_LONG.to_string()),
    }
}

/// Recursively mask sensitive fields through objects and arrays.
pub fn sanitize_value(value: &Value, custom: Option<&dyn SanitizeRule>) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, entry) in map {
                let replacement = if is_sensitive_key(key) {
                    custom
                        .and_then(|rule| rule.mask(key, entry))
                        .unwrap_or_else(|| default_mask(entry))
                } else {
                    sanitize_value(entry, custom)
                };
                out.insert(key.clone(), replacement);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, custom))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_sensitive_keys_by_length() {
        let payload = json!({
            "password": "secret123",
            "pin": "1234",
            "apiToken": 42,
            "sessionId": null,
            "note": "visible",
        });
        let masked = sanitize_value(&payload, None);
        assert_eq!(masked["password"], json!(MASK_LONG));
        // "pin" does not match the pattern and stays intact
        assert_eq!(masked["pin"], json!("1234"));
        assert_eq!(masked["apiToken"], json!(MASK_SHORT));
        assert_eq!(masked["sessionId"], json!(MASK_SHORT));
        assert_eq!(masked["note"], json!("visible"));
    }

    #[test]
    fn recurses_through_arrays_and_objects() {
        let payload = json!({
            "steps": [
                { "authHeader": "Bearer abcdef", "label": "login" },
                { "nested": { "cookieJar": ["a", "b"] } },
            ]
        });
        let masked = sanitize_value(&payload, None);
        assert_eq!(masked["steps"][0]["authHeader"], json!(MASK_LONG));
        assert_eq!(masked["steps"][0]["label"], json!("login"));
        assert_eq!(masked["steps"][1]["nested"]["cookieJar"], json!(MASK_LONG));
    }

    #[test]
    fn custom_rule_overrides_default_for_matching_fields() {
        let rule = |key: &str, _value: &Value| {
            (key == "password").then(|| Value::String("<redacted>".into()))
        };
        let payload = json!({ "password": "hunter2!", "apiKey": "hunter2!" });
        let masked = sanitize_value(&payload, Some(&rule));
        assert_eq!(masked["password"], json!("<redacted>"));
        assert_eq!(masked["apiKey"], json!(MASK_LONG));
    }

    #[test]
    fn key_pattern_is_case_insensitive() {
        for key in ["Password", "AUTH_TOKEN", "Set-Cookie", "publicKey"] {
            assert!(is_sensitive_key(key), "{key} should match");
        }
        assert!(!is_sensitive_key("label"));
    }
}
