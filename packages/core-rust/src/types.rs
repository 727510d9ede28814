use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dynamic argument and result value carried by RPC envelopes.
///
/// Supports all JSON-compatible types plus binary data. Handlers receive
/// their bound arguments as an ordered `Vec<Value>` and return a `Value`.
///
/// Serializes to `MsgPack` via `rmp-serde` on the RPC transport and converts
/// to and from `serde_json::Value` at the HTTP gateway.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// Absent or explicit null.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit IEEE 754 float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Object with deterministic key order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Looks up an object field by name, ignoring ASCII case.
    ///
    /// An exact match wins over a case-insensitive one. Returns `None` for
    /// non-map values.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        let Value::Map(map) = self else {
            return None;
        };
        map.get(name).or_else(|| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }

    /// Renders the value as a cache-key fragment.
    ///
    /// Scalars render as their display form, arrays as comma-joined scalar
    /// renderings. `Null`, binary data and maps have no fragment form.
    #[must_use]
    pub fn to_key_fragment(&self) -> Option<String> {
        match self {
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().filter_map(Value::to_key_fragment).collect();
                Some(parts.join(","))
            }
            Value::Null | Value::Bytes(_) | Value::Map(_) => None,
        }
    }

    /// Converts to a JSON value for the HTTP gateway.
    ///
    /// Binary data becomes an array of byte values; non-finite floats become null.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
            }
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn field_lookup_ignores_case() {
        let value = Value::from(json!({ "OrderId": 7, "name": "x" }));
        assert_eq!(value.field("orderid"), Some(&Value::Int(7)));
        assert_eq!(value.field("NAME"), Some(&Value::String("x".to_string())));
        assert_eq!(value.field("missing"), None);
    }

    #[test]
    fn field_lookup_prefers_exact_match() {
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), Value::Int(1));
        map.insert("ID".to_string(), Value::Int(2));
        let value = Value::Map(map);
        assert_eq!(value.field("ID"), Some(&Value::Int(2)));
    }

    #[test]
    fn field_on_scalar_is_none() {
        assert_eq!(Value::Int(3).field("x"), None);
    }

    #[test]
    fn key_fragments_for_scalars_and_arrays() {
        assert_eq!(Value::Int(42).to_key_fragment().as_deref(), Some("42"));
        assert_eq!(Value::Bool(true).to_key_fragment().as_deref(), Some("true"));
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::from("b")]).to_key_fragment().as_deref(),
            Some("1,b")
        );
        assert_eq!(Value::Null.to_key_fragment(), None);
    }

    #[test]
    fn json_conversion_roundtrip() {
        let original = json!({ "a": [1, 2.5, "s", null, true], "b": { "c": -3 } });
        let value = Value::from(original.clone());
        assert_eq!(value.to_json(), original);
    }

    #[test]
    fn msgpack_roundtrip_preserves_bytes() {
        let value = Value::Array(vec![Value::Bytes(vec![1, 2, 3]), Value::Float(0.5)]);
        let bytes = rmp_serde::to_vec_named(&value).expect("serialize");
        let decoded: Value = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(decoded, value);
    }
}
