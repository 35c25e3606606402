//! Audit emission helpers

use serde_json::Value;
use tracing::warn;

use mcplexer_storage::entities::AuditRecord;
use mcplexer_storage::Store;

/// Keys whose values are elided from audited parameters
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["token", "secret", "password", "key", "authorization", "credential"];

/// Longest string value kept verbatim in an audit record
const MAX_AUDITED_STRING: usize = 256;

/// Insert an audit record, logging rather than failing the call path
pub async fn emit(store: &dyn Store, record: AuditRecord) {
    if let Err(e) = store.insert_audit(&record).await {
        warn!(tool = %record.tool_name, error = %e, "failed to write audit record");
    }
}

/// Clone `params` with secret-looking values elided and long strings
/// truncated.
pub fn redact_params(params: &Value) -> Value {
    match params {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let lowered = key.to_lowercase();
                    if SENSITIVE_KEY_FRAGMENTS.iter().any(|fragment| lowered.contains(fragment)) {
                        (key.clone(), Value::String("[redacted]".to_string()))
                    } else {
                        (key.clone(), redact_params(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_params).collect()),
        Value::String(s) if s.len() > MAX_AUDITED_STRING => {
            let cut = (0..=MAX_AUDITED_STRING)
                .rev()
                .find(|i| s.is_char_boundary(*i))
                .unwrap_or(0);
            Value::String(format!("{}… ({} bytes)", &s[..cut], s.len()))
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secret_keys_are_elided_recursively() {
        let params = json!({
            "repo": "octo/repo",
            "api_token": "sk-12345",
            "nested": {"Authorization": "Bearer x", "path": "/tmp"}
        });
        let redacted = redact_params(&params);
        assert_eq!(redacted["repo"], json!("octo/repo"));
        assert_eq!(redacted["api_token"], json!("[redacted]"));
        assert_eq!(redacted["nested"]["Authorization"], json!("[redacted]"));
        assert_eq!(redacted["nested"]["path"], json!("/tmp"));
    }

    #[test]
    fn long_strings_truncate() {
        let long = "x".repeat(1000);
        let redacted = redact_params(&json!({ "content": long }));
        let audited = redacted["content"].as_str().unwrap();
        assert!(audited.len() < 400);
        assert!(audited.contains("1000 bytes"));
    }
}
