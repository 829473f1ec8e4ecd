//! Log-field redaction. Applied before structured payloads reach the
//! logger or the live event bus.

use std::sync::LazyLock;

use regex::Regex;

pub const CENSOR: &str = "[REDACTED]";

/// Field names that must never be logged in the clear. Matching is
/// case-insensitive and ignores `_`/`-` so `api_key` matches `apiKey`.
const SENSITIVE_KEYS: [&str; 7] = [
    "password",
    "token",
    "apikey",
    "authorization",
    "cookie",
    "encrypteddata",
    "serviceaccountjson",
];

static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").unwrap());

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    SENSITIVE_KEYS.contains(&normalized.as_str())
}

/// Recursively mask sensitive fields in a JSON payload.
pub fn redact_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *v = serde_json::Value::String(CENSOR.to_string());
                } else {
                    redact_value(v);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        _ => {}
    }
}

/// Strip inline bearer tokens from a free-text message. Field-level
/// redaction covers structured payloads; this catches tokens that leak
/// into error strings from HTTP clients.
pub fn redact_message(message: &str) -> String {
    BEARER_RE
        .replace_all(message, format!("Bearer {CENSOR}"))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_masks_listed_fields() {
        let mut v = json!({
            "password": "hunter2",
            "token": "abc",
            "apiKey": "xyz",
            "authorization": "Bearer abc",
            "cookie": "session=1",
            "encryptedData": "deadbeef",
            "serviceAccountJson": "{\"private_key\":\"...\"}",
            "url": "https://example.com"
        });
        redact_value(&mut v);
        for key in [
            "password",
            "token",
            "apiKey",
            "authorization",
            "cookie",
            "encryptedData",
            "serviceAccountJson",
        ] {
            assert_eq!(v[key], CENSOR, "field {key} must be censored");
        }
        assert_eq!(v["url"], "https://example.com");
    }

    #[test]
    fn test_masks_nested_and_snake_case() {
        let mut v = json!({
            "request": { "headers": { "Authorization": "Bearer tok" } },
            "credentials": [ { "api_key": "k1" }, { "service_account_json": "{}" } ]
        });
        redact_value(&mut v);
        assert_eq!(v["request"]["headers"]["Authorization"], CENSOR);
        assert_eq!(v["credentials"][0]["api_key"], CENSOR);
        assert_eq!(v["credentials"][1]["service_account_json"], CENSOR);
    }

    #[test]
    fn test_original_value_never_survives() {
        let mut v = json!({ "outer": { "password": "s3cr3t" } });
        redact_value(&mut v);
        assert!(!v.to_string().contains("s3cr3t"));
    }

    #[test]
    fn test_message_bearer_stripped() {
        let msg = "request failed: Authorization: Bearer ya29.a0AfH6SMB-xyz status 401";
        let redacted = redact_message(msg);
        assert!(!redacted.contains("ya29"));
        assert!(redacted.contains(CENSOR));
    }
}
