//! Failure values that survive the wire.
//!
//! JSON has no native error type, so failures are carried as a single-key
//! wrapper object `{"$error": {name, message, stack?, cause?}}`. Decoding
//! that exact shape reconstructs the failure with all four fields intact.
//! User data that happens to collide with the wrapper key is escaped under
//! `"$literal"` so the tag stays unambiguous.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

const ERROR_KEY: &str = "$error";
const LITERAL_KEY: &str = "$literal";

/// A failure value as it crosses the process boundary.
///
/// Round trip invariant: `decode(encode(f)) == f` for name, message, stack
/// and the full cause chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Box<Cause>>,
}

impl Fault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn caused_by(mut self, cause: Fault) -> Self {
        self.cause = Some(Box::new(Cause::Fault(cause)));
        self
    }

    pub fn caused_by_value(mut self, value: Value) -> Self {
        self.cause = Some(Box::new(Cause::Value(Payload(value))));
        self
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.cause.as_deref() {
            Some(Cause::Fault(fault)) => Some(fault),
            _ => None,
        }
    }
}

/// The cause of a [`Fault`]: either another fault (chains round-trip
/// losslessly) or an arbitrary structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cause {
    Fault(Fault),
    Value(Payload),
}

#[derive(Serialize)]
struct WrapperRef<'a> {
    #[serde(rename = "$error")]
    error: InnerRef<'a>,
}

#[derive(Serialize)]
struct InnerRef<'a> {
    name: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<&'a Cause>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Wrapper {
    #[serde(rename = "$error")]
    error: Inner,
}

#[derive(Deserialize)]
struct Inner {
    name: String,
    message: String,
    #[serde(default)]
    stack: Option<String>,
    #[serde(default)]
    cause: Option<Box<Cause>>,
}

impl Serialize for Fault {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WrapperRef {
            error: InnerRef {
                name: &self.name,
                message: &self.message,
                stack: self.stack.as_deref(),
                cause: self.cause.as_deref(),
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fault {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Wrapper { error } = Wrapper::deserialize(deserializer)?;
        Ok(Self {
            name: error.name,
            message: error.message,
            stack: error.stack,
            cause: error.cause,
        })
    }
}

/// Arbitrary structured data in a protocol argument position.
///
/// Serialization escapes any nested user object that collides with the
/// `$error`/`$literal` wrapper keys; deserialization undoes the escape, so
/// pathological payloads round-trip unchanged and are never mistaken for a
/// [`Fault`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(pub Value);

impl Payload {
    pub fn null() -> Self {
        Self(Value::Null)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        escape(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self(unescape(value)))
    }
}

fn collides(map: &serde_json::Map<String, Value>) -> bool {
    map.len() == 1 && (map.contains_key(ERROR_KEY) || map.contains_key(LITERAL_KEY))
}

fn escape(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let escaped: serde_json::Map<String, Value> = map
                .iter()
                .map(|(key, inner)| (key.clone(), escape(inner)))
                .collect();
            if collides(map) {
                let mut wrapper = serde_json::Map::with_capacity(1);
                wrapper.insert(LITERAL_KEY.to_string(), Value::Object(escaped));
                Value::Object(wrapper)
            } else {
                Value::Object(escaped)
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(escape).collect()),
        other => other.clone(),
    }
}

fn unescape(value: Value) -> Value {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key(LITERAL_KEY) => {
            // An escape wrapper: unwrap one layer, then only recurse into the
            // children so the wrapped single-key object is kept verbatim.
            match map.into_iter().next().map(|(_, inner)| inner) {
                Some(Value::Object(inner)) => Value::Object(
                    inner
                        .into_iter()
                        .map(|(key, child)| (key, unescape(child)))
                        .collect(),
                ),
                Some(other) => other,
                None => Value::Null,
            }
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, child)| (key, unescape(child)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(unescape).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fault_roundtrips() {
        let fault = Fault::new("TypeError", "x is not a function")
            .with_stack("at main (index.js:1:1)");
        let encoded = serde_json::to_string(&fault).unwrap();
        let decoded: Fault = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, fault);
    }

    #[test]
    fn fault_wire_shape() {
        let fault = Fault::new("Error", "boom");
        let value = serde_json::to_value(&fault).unwrap();
        assert_eq!(value, json!({"$error": {"name": "Error", "message": "boom"}}));
    }

    #[test]
    fn fault_cause_chain_roundtrips() {
        let root = Fault::new("ConnectError", "connection refused");
        let fault = Fault::new("Error", "handshake failed").caused_by(root.clone());
        let encoded = serde_json::to_string(&fault).unwrap();
        let decoded: Fault = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, fault);
        match decoded.cause.as_deref() {
            Some(Cause::Fault(inner)) => assert_eq!(*inner, root),
            other => panic!("expected fault cause, got {:?}", other),
        }
    }

    #[test]
    fn fault_value_cause_roundtrips() {
        let fault =
            Fault::new("Error", "bad input").caused_by_value(json!({"field": "port", "got": -1}));
        let encoded = serde_json::to_string(&fault).unwrap();
        let decoded: Fault = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, fault);
    }

    #[test]
    fn fault_rejects_extra_keys() {
        let result: Result<Fault, _> = serde_json::from_value(json!({
            "$error": {"name": "Error", "message": "boom"},
            "extra": true,
        }));
        assert!(result.is_err());
    }

    #[test]
    fn fault_source_walks_cause_chain() {
        let fault = Fault::new("Error", "outer").caused_by(Fault::new("Inner", "root"));
        let source = std::error::Error::source(&fault).unwrap();
        assert_eq!(source.to_string(), "Inner: root");
    }

    #[test]
    fn payload_roundtrips_plain_values() {
        for value in [
            json!(null),
            json!(42),
            json!("text"),
            json!([1, 2, 3]),
            json!({"nested": {"deep": [true, false]}}),
        ] {
            let payload = Payload(value.clone());
            let encoded = serde_json::to_string(&payload).unwrap();
            let decoded: Payload = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded.0, value);
        }
    }

    #[test]
    fn colliding_payload_roundtrips_unchanged() {
        // A legitimate user object shaped exactly like the error wrapper must
        // come back as data, not as a failure value.
        let value = json!({"$error": {"name": "NotAnError", "message": "just data"}});
        let payload = Payload(value.clone());
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            encoded,
            json!({"$literal": {"$error": {"name": "NotAnError", "message": "just data"}}})
        );
        let decoded: Payload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.0, value);
    }

    #[test]
    fn literal_key_payload_roundtrips_unchanged() {
        let value = json!({"$literal": {"anything": 1}});
        let payload = Payload(value.clone());
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: Payload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.0, value);
    }

    #[test]
    fn nested_collision_roundtrips() {
        let value = json!({
            "results": [{"$error": "not really"}, {"ok": true}],
            "meta": {"$literal": [1, 2]},
        });
        let payload = Payload(value.clone());
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: Payload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.0, value);
    }

    #[test]
    fn cause_prefers_fault_over_value() {
        let encoded = json!({"$error": {"name": "Inner", "message": "root"}});
        let cause: Cause = serde_json::from_value(encoded).unwrap();
        assert!(matches!(cause, Cause::Fault(_)));
    }
}
