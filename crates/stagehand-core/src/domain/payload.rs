//! Payload: the open key/value document a task carries between stages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::EngineError;

/// Human-readable cause written by `set_stage_failed`.
pub const REASON_KEY: &str = "reason";

/// Set by `Engine::request_cancel`; workflows poll it between stages.
pub const CANCEL_KEY: &str = "cancel_requested";

/// Terminal payload of a child, copied into the parent before its continuation.
pub const CHILD_RESULT_KEY: &str = "child_result";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// `null` becomes an empty payload; anything other than an object is rejected.
    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(EngineError::Payload(format!(
                "payload must be a JSON object, got {other}"
            ))),
        }
    }

    /// Shorthand for a failure payload carrying only a reason.
    pub fn reason(reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self::new().with(REASON_KEY, reason)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Keys in `other` overwrite keys in `self`.
    pub fn merge(&mut self, other: Payload) {
        self.0.extend(other.0);
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.get_str(REASON_KEY)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.get_bool(CANCEL_KEY, false)
    }

    /// Decode into a workflow's parameter struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| EngineError::Payload(format!("decode: {e}")))
    }

    /// Encode a serializable value under `key`.
    pub fn insert_serialized<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), EngineError> {
        let value =
            serde_json::to_value(value).map_err(|e| EngineError::Payload(format!("encode: {e}")))?;
        self.0.insert(key.into(), value);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_accepts_object_and_null() {
        let p = Payload::from_value(json!({"replace_tags": true})).unwrap();
        assert!(p.get_bool("replace_tags", false));
        assert!(Payload::from_value(Value::Null).unwrap().is_empty());
        assert!(Payload::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn merge_overwrites_existing_keys() {
        let mut p = Payload::new().with("a", 1).with("b", 1);
        p.merge(Payload::new().with("b", 2).with("c", 3));
        assert_eq!(p.to_value(), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn decode_into_params() {
        #[derive(Deserialize)]
        struct Params {
            policy_id: String,
            #[serde(default)]
            force: bool,
        }
        let p = Payload::new().with("policy_id", "sp-1");
        let params: Params = p.decode().unwrap();
        assert_eq!(params.policy_id, "sp-1");
        assert!(!params.force);
    }

    #[test]
    fn reason_and_cancel_helpers() {
        let p = Payload::reason("boom").with(CANCEL_KEY, true);
        assert_eq!(p.failure_reason(), Some("boom"));
        assert!(p.is_cancel_requested());
    }
}
