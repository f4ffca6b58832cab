//! Lenient deserializers for chain query payloads.
//!
//! Cosmos-style REST gateways encode 64-bit integers as decimal strings while
//! the chain's own `/v1` endpoints emit JSON numbers. These helpers accept
//! either form.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Read an unsigned integer from a JSON number or decimal string.
pub fn u64_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a signed integer from a JSON number or decimal string.
pub fn i64_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Render a scalar JSON value as a string (numbers keep their decimal form).
pub fn string_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `deserialize_with` adapter for required `u64` fields.
pub fn flexible_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    u64_from_value(&value)
        .ok_or_else(|| D::Error::custom(format!("expected unsigned integer, got {}", value)))
}

/// `deserialize_with` adapter for optional `u64` fields; `null` maps to `None`.
pub fn flexible_opt_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    u64_from_value(&value)
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("expected unsigned integer, got {}", value)))
}

/// `deserialize_with` adapter for required `i64` fields.
pub fn flexible_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    i64_from_value(&value)
        .ok_or_else(|| D::Error::custom(format!("expected integer, got {}", value)))
}

/// `deserialize_with` adapter for optional `i64` fields; `null` maps to `None`.
pub fn flexible_opt_i64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    i64_from_value(&value)
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("expected integer, got {}", value)))
}

/// `deserialize_with` adapter for string fields that may arrive as numbers.
pub fn flexible_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(String::new());
    }
    string_from_value(&value)
        .ok_or_else(|| D::Error::custom(format!("expected string or number, got {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "flexible_u64")]
        height: u64,
        #[serde(default, deserialize_with = "flexible_opt_i64")]
        weight: Option<i64>,
        #[serde(default, deserialize_with = "flexible_string")]
        port: String,
    }

    #[test]
    fn test_accepts_numbers_and_strings() {
        let a: Sample =
            serde_json::from_value(json!({"height": "1025320", "weight": 7, "port": 8080}))
                .unwrap();
        assert_eq!(a.height, 1_025_320);
        assert_eq!(a.weight, Some(7));
        assert_eq!(a.port, "8080");

        let b: Sample = serde_json::from_value(json!({"height": 12, "weight": null})).unwrap();
        assert_eq!(b.height, 12);
        assert_eq!(b.weight, None);
        assert_eq!(b.port, "");
    }

    #[test]
    fn test_rejects_garbage() {
        let r: Result<Sample, _> = serde_json::from_value(json!({"height": "abc"}));
        assert!(r.is_err());
    }
}
