//! Structured wire values.
//!
//! `func_params` and `result` are schema-less. On the wire they travel as
//! [`WireValue`] — the closed set null / bool / number / string / list / map.
//! Conversion walks nested structures in both directions; nothing is lost for
//! values drawn from that set, and unknown shapes inside nested maps simply
//! pass through as their closest wire form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// The generic structured value carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
}

impl Default for WireValue {
    fn default() -> Self {
        Self::Null
    }
}

impl From<&Value> for WireValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from).collect()),
            Value::Object(fields) => Self::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<WireValue> for Value {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Number(n) => Value::Number(n),
            WireValue::String(s) => Value::String(s),
            WireValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            WireValue::Map(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_nested_structures() {
        let original = json!({
            "n": 10,
            "ratio": 2.5,
            "label": "shard-0",
            "flags": [true, false, null],
            "config": {"key1": "value1", "key2": 42}
        });
        let wire = WireValue::from(&original);
        let back: Value = wire.into();
        assert_eq!(back, original);
    }

    #[test]
    fn integers_survive_exactly() {
        let original = json!({"big": u64::MAX, "neg": i64::MIN});
        let back: Value = WireValue::from(&original).into();
        assert_eq!(back, original);
    }

    #[test]
    fn json_encoding_is_transparent() {
        // A WireValue serializes to the same JSON as the value it wraps, so
        // peers that only know plain JSON interoperate.
        let original = json!({"list": [1, {"inner": "x"}], "unknown_key": 7});
        let wire = WireValue::from(&original);
        assert_eq!(serde_json::to_string(&wire).unwrap(), original.to_string());

        let reparsed: WireValue = serde_json::from_str(&original.to_string()).unwrap();
        assert_eq!(reparsed, wire);
    }
}
