//! Credential masking for payloads written to debug logs.

use serde_json::Value;

const SECRET_KEYS: [&str; 2] = ["password", "uuid"];

/// Copy of `value` with every string under a `password` or `uuid` key cropped.
pub fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let masked = match inner {
                        Value::String(s) if SECRET_KEYS.contains(&key.as_str()) => {
                            Value::String(crop(s))
                        }
                        other => mask_secrets(other),
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}

fn crop(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
