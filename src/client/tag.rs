//! Key/value tags attached to requests and messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A named string attribute. Order is preserved and duplicate names are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name
    pub name: String,
    /// Tag value
    pub value: String,
}

impl Tag {
    /// Create a tag from anything string-like.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse a single `{"name": .., "value": ..}` object, accepting capitalised keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let name = obj.get("name").or_else(|| obj.get("Name"))?;
        let value = obj.get("value").or_else(|| obj.get("Value"))?;
        Some(Self {
            name: scalar_to_string(name)?,
            value: scalar_to_string(value)?,
        })
    }

    /// Parse a tag array, skipping entries that are not tag objects.
    pub fn list_from_value(value: &Value) -> Vec<Self> {
        value
            .as_array()
            .map(|items| items.iter().filter_map(Tag::from_value).collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Serialise tags into the JSON array handed to out-of-band submitters.
pub fn tags_to_json(tags: &[Tag]) -> String {
    let items: Vec<Value> = tags
        .iter()
        .map(|tag| serde_json::json!({ "name": tag.name, "value": tag.value }))
        .collect();
    Value::Array(items).to_string()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
