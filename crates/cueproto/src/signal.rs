//! Typed signal values and the coercion boundary.
//!
//! Signals arrive from deployables as untyped JSON. The server's ingest
//! boundary coerces each raw value against the declared catalog so that
//! everything downstream (the rules engine in particular) works on typed
//! values instead of re-checking JSON shapes per comparison.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Declared type of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Bool,
    Number,
    String,
    Vector2,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalType::Bool => "bool",
            SignalType::Number => "number",
            SignalType::String => "string",
            SignalType::Vector2 => "vector2",
        };
        write!(f, "{}", name)
    }
}

/// A typed signal value.
///
/// Serializes as `{"type": "number", "value": 1.5}` which is the wire shape
/// the catalog, events, and persisted documents all share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SignalValue {
    Bool(bool),
    Number(f64),
    String(String),
    Vector2([f64; 2]),
}

/// Coercion failures reject the whole ingest request.
#[derive(Debug, Error)]
pub enum CoerceError {
    #[error("expected {expected}")]
    Mismatch { expected: SignalType },
}

impl SignalValue {
    /// Declared type of this value.
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::Bool(_) => SignalType::Bool,
            SignalValue::Number(_) => SignalType::Number,
            SignalValue::String(_) => SignalType::String,
            SignalValue::Vector2(_) => SignalType::Vector2,
        }
    }

    /// Coerce a raw JSON value against a declared type.
    ///
    /// Numbers accept any JSON number (integers widen to f64). Everything
    /// else is strict; a mismatch rejects the whole request upstream.
    pub fn coerce(expected: SignalType, raw: &Value) -> Result<Self, CoerceError> {
        let mismatch = || CoerceError::Mismatch { expected };
        match expected {
            SignalType::Bool => raw.as_bool().map(SignalValue::Bool).ok_or_else(mismatch),
            SignalType::Number => raw.as_f64().map(SignalValue::Number).ok_or_else(mismatch),
            SignalType::String => raw
                .as_str()
                .map(|s| SignalValue::String(s.to_string()))
                .ok_or_else(mismatch),
            SignalType::Vector2 => as_vector2(raw).map(SignalValue::Vector2).ok_or_else(mismatch),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            SignalValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_vector2(&self) -> Option<[f64; 2]> {
        match self {
            SignalValue::Vector2(v) => Some(*v),
            _ => None,
        }
    }
}

/// A named, typed signal slot in a logic document's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
}

/// Interpret a raw JSON value as a two-component vector.
pub fn as_vector2(raw: &Value) -> Option<[f64; 2]> {
    let items = raw.as_array()?;
    if items.len() != 2 {
        return None;
    }
    Some([items[0].as_f64()?, items[1].as_f64()?])
}

/// Best-effort type inference for signals with no declared catalog entry.
///
/// Used as the last fallback at the ingest boundary so a deployable that
/// never declared its signals can still drive state-only setups.
pub fn infer_signal_type(raw: &Value) -> Option<SignalType> {
    match raw {
        Value::Bool(_) => Some(SignalType::Bool),
        Value::Number(_) => Some(SignalType::Number),
        Value::String(_) => Some(SignalType::String),
        Value::Array(_) => as_vector2(raw).map(|_| SignalType::Vector2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_bool() {
        let v = SignalValue::coerce(SignalType::Bool, &json!(true)).unwrap();
        assert_eq!(v, SignalValue::Bool(true));
        assert!(SignalValue::coerce(SignalType::Bool, &json!(1)).is_err());
        assert!(SignalValue::coerce(SignalType::Bool, &json!("true")).is_err());
    }

    #[test]
    fn test_coerce_number_widens_integers() {
        let v = SignalValue::coerce(SignalType::Number, &json!(3)).unwrap();
        assert_eq!(v, SignalValue::Number(3.0));
        let v = SignalValue::coerce(SignalType::Number, &json!(2.5)).unwrap();
        assert_eq!(v, SignalValue::Number(2.5));
        assert!(SignalValue::coerce(SignalType::Number, &json!("3")).is_err());
    }

    #[test]
    fn test_coerce_string() {
        let v = SignalValue::coerce(SignalType::String, &json!("go")).unwrap();
        assert_eq!(v, SignalValue::String("go".to_string()));
        assert!(SignalValue::coerce(SignalType::String, &json!(false)).is_err());
    }

    #[test]
    fn test_coerce_vector2() {
        let v = SignalValue::coerce(SignalType::Vector2, &json!([1, 2.5])).unwrap();
        assert_eq!(v, SignalValue::Vector2([1.0, 2.5]));
        assert!(SignalValue::coerce(SignalType::Vector2, &json!([1])).is_err());
        assert!(SignalValue::coerce(SignalType::Vector2, &json!([1, "a"])).is_err());
        assert!(SignalValue::coerce(SignalType::Vector2, &json!(7)).is_err());
    }

    #[test]
    fn test_wire_shape_round_trip() {
        let v = SignalValue::Vector2([0.5, 1.0]);
        let text = serde_json::to_string(&v).unwrap();
        assert_eq!(text, r#"{"type":"vector2","value":[0.5,1.0]}"#);
        let back: SignalValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_infer_signal_type() {
        assert_eq!(infer_signal_type(&json!(true)), Some(SignalType::Bool));
        assert_eq!(infer_signal_type(&json!(1.0)), Some(SignalType::Number));
        assert_eq!(infer_signal_type(&json!("x")), Some(SignalType::String));
        assert_eq!(infer_signal_type(&json!([1, 2])), Some(SignalType::Vector2));
        assert_eq!(infer_signal_type(&json!([1, 2, 3])), None);
        assert_eq!(infer_signal_type(&json!(null)), None);
    }
}
