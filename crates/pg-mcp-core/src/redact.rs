//! Secret redaction pass (§9 Design Notes: secret handling).
//!
//! Applied to audit events and error `details` maps before they leave the
//! orchestrator. Field names matching any pattern (case-insensitively,
//! as a substring) have their value replaced with `***`.

/// Default sensitive-field name fragments.
pub const DEFAULT_PATTERNS: &[&str] =
    &["password", "secret", "token", "api_key", "auth", "credential", "private_key"];

/// Whether `field_name` matches any of `patterns` (case-insensitive substring match).
#[must_use]
pub fn is_sensitive_field(field_name: &str, patterns: &[&str]) -> bool {
    let lower = field_name.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Redact sensitive values within a JSON object, recursing into nested
/// objects and arrays. Non-object/array scalars are left untouched.
#[must_use]
pub fn redact_json(value: serde_json::Value, patterns: &[&str]) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if is_sensitive_field(&k, patterns) {
                        (k, Value::String("***".to_string()))
                    } else {
                        (k, redact_json(v, patterns))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| redact_json(v, patterns)).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_matching_fields_case_insensitively() {
        let value = json!({"Password": "hunter2", "username": "alice"});
        let redacted = redact_json(value, DEFAULT_PATTERNS);
        assert_eq!(redacted["Password"], "***");
        assert_eq!(redacted["username"], "alice");
    }

    #[test]
    fn recurses_into_nested_objects() {
        let value = json!({"connection": {"api_key": "sk-123", "host": "db"}});
        let redacted = redact_json(value, DEFAULT_PATTERNS);
        assert_eq!(redacted["connection"]["api_key"], "***");
        assert_eq!(redacted["connection"]["host"], "db");
    }
}
