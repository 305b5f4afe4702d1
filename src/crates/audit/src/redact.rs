//! Metadata redaction.

/// Replacement value for sensitive fields.
pub const REDACTION_SENTINEL: &str = "[REDACTED]";

/// Key fragments that mark a field as sensitive, matched case-insensitively.
const SENSITIVE_KEYS: [&str; 4] = ["password", "token", "secret", "api_key"];

/// Whether a metadata key names a sensitive field.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| lowered.contains(needle))
}

/// Walk a metadata value and replace every sensitive field with the
/// sentinel. Idempotent: redacting twice equals redacting once.
pub fn redact(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if is_sensitive_key(key) {
                    redacted.insert(key.clone(), serde_json::Value::String(REDACTION_SENTINEL.to_string()));
                } else {
                    redacted.insert(key.clone(), redact(inner));
                }
            }
            serde_json::Value::Object(redacted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_and_nested_keys_redacted() {
        let metadata = json!({
            "api_key": "sk-xyz",
            "nested": {"password": "p"},
            "note": "ok",
        });
        let redacted = redact(&metadata);

        assert_eq!(redacted["api_key"], REDACTION_SENTINEL);
        assert_eq!(redacted["nested"]["password"], REDACTION_SENTINEL);
        assert_eq!(redacted["note"], "ok");
    }

    #[test]
    fn test_case_insensitive_and_compound_keys() {
        let metadata = json!({
            "API_KEY": "x",
            "Access_Token": "y",
            "client_secret": "z",
        });
        let redacted = redact(&metadata);

        assert_eq!(redacted["API_KEY"], REDACTION_SENTINEL);
        assert_eq!(redacted["Access_Token"], REDACTION_SENTINEL);
        assert_eq!(redacted["client_secret"], REDACTION_SENTINEL);
    }

    #[test]
    fn test_arrays_are_walked() {
        let metadata = json!({"items": [{"token": "t"}, {"note": "n"}]});
        let redacted = redact(&metadata);

        assert_eq!(redacted["items"][0]["token"], REDACTION_SENTINEL);
        assert_eq!(redacted["items"][1]["note"], "n");
    }

    #[test]
    fn test_redact_is_idempotent() {
        let metadata = json!({"api_key": "sk-xyz", "nested": {"password": "p", "d": [1, 2]}});
        let once = redact(&metadata);
        let twice = redact(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(redact(&json!(42)), json!(42));
        assert_eq!(redact(&json!("text")), json!("text"));
        assert_eq!(redact(&json!(null)), json!(null));
    }
}
