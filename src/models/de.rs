//! Lenient deserializers for exchange and provider payloads.
//!
//! Binance-style APIs send decimals as strings ("0.001"), and language models
//! mix strings, floats and nulls freely.

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn value_to_f64<E: Error>(value: Value) -> Result<Option<f64>, E> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| E::custom("number out of range")),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                trimmed.parse::<f64>().map(Some).map_err(E::custom)
            }
        }
        other => Err(E::custom(format!("expected number, got {}", other))),
    }
}

/// Number or numeric string; null and "" become 0.0
pub fn f64_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_f64::<D::Error>(value)?.unwrap_or(0.0))
}

/// Optional price where null, missing, zero or negative all mean "not set"
pub fn positive_f64_opt<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<f64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_f64::<D::Error>(value)?.filter(|v| v.is_finite() && *v > 0.0))
}

/// Integer that may arrive as float or string ("20", 20.0)
pub fn u32_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let number = value_to_f64::<D::Error>(value)?.unwrap_or(0.0);
    if !number.is_finite() {
        return Err(D::Error::custom("non-finite integer"));
    }
    Ok(number.max(0.0).min(u32::MAX as f64).round() as u32)
}

/// Identifier that may arrive as a JSON number or string
pub fn string_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!("expected string, got {}", other))),
    }
}

/// Boolean that may arrive as "true"/"false"
pub fn bool_lenient<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) => Ok(s.eq_ignore_ascii_case("true")),
        Value::Null => Ok(false),
        other => Err(D::Error::custom(format!("expected bool, got {}", other))),
    }
}
