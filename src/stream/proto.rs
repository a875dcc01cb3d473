use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Push notification delivered by the portal notification stream.
///
/// Only `type` is required. Every other field is kept verbatim in `fields`
/// and never interpreted by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl NotificationEvent {
    /// Creates an event with the given type and no extra fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, replacing any previous value under the same key.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Parses a raw frame payload.
    ///
    /// Returns `None` for anything that is not a JSON object carrying a string
    /// `type` field. Callers treat that as a frame to drop, not as an error.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    /// Returns the event type discriminator.
    pub fn event_type(&self) -> &str {
        &self.kind
    }

    /// Returns an additional field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Converts the event back into a JSON object.
    pub fn to_value(&self) -> Value {
        let mut object = serde_json::Map::with_capacity(self.fields.len() + 1);
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}
