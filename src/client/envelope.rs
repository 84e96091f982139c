//! Response envelopes returned by compute units.
//!
//! Parsing is lenient in the same way the compute endpoints are: keys may be
//! capitalised (`Messages`) or not (`messages`), numbers may arrive as strings,
//! and `Error` may be a structured value. Anything the envelope does not model
//! stays reachable through [`ResponseEnvelope::payload`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ValidationFailure;
use super::tag::Tag;

/// A message emitted by a process while handling a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message tags in transmission order
    pub tags: Vec<Tag>,
    /// Message data; `None` when the field is absent or null
    pub data: Option<String>,
    /// Anchor, if present
    pub anchor: Option<String>,
    /// Target process or wallet
    pub target: Option<String>,
}

impl Message {
    /// Parse a single message object.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        Self {
            tags: field(obj, "Tags").map(Tag::list_from_value).unwrap_or_default(),
            data: field(obj, "Data").and_then(text_of),
            anchor: field(obj, "Anchor").and_then(text_of),
            target: field(obj, "Target").and_then(text_of),
        }
    }

    /// First value of the named tag.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.name == name)
            .map(|tag| tag.value.as_str())
    }

    /// Every value of the named tag, in order.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.name == name)
            .map(|tag| tag.value.as_str())
    }
}

/// Textual output of an evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    /// Output data (stringified when structured)
    pub data: Option<String>,
    /// Whether the output was produced by `print`
    pub is_print: bool,
    /// Prompt string reported by the process
    pub prompt: Option<String>,
}

impl Output {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(obj) => Self {
                data: field(obj, "data").and_then(text_of),
                is_print: field(obj, "print")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                prompt: field(obj, "prompt").and_then(text_of),
            },
            other => Self {
                data: text_of(other),
                ..Self::default()
            },
        }
    }
}

/// Structured result of executing a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Messages emitted by the process
    pub messages: Vec<Message>,
    /// Assignment ids
    pub assignments: Vec<String>,
    /// Spawned process ids (or stringified spawn records)
    pub spawns: Vec<String>,
    /// Evaluation output
    pub output: Output,
    /// Process error, if any
    pub error: Option<String>,
    /// Gas consumed
    pub gas_used: i64,
    #[serde(skip)]
    payload: Value,
}

impl ResponseEnvelope {
    /// Parse an envelope from a raw JSON body.
    pub fn from_json(body: &str) -> Result<Self, ValidationFailure> {
        let value: Value = serde_json::from_str(body)
            .map_err(|err| ValidationFailure::Malformed(err.to_string()))?;
        Ok(Self::from_value(value))
    }

    /// Build an envelope from already-parsed JSON. Non-object values yield an
    /// empty envelope whose payload is the value itself.
    pub fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self {
                payload: value,
                ..Self::default()
            };
        };

        let messages = field(obj, "Messages")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(Message::from_value).collect())
            .unwrap_or_default();
        let assignments = field(obj, "Assignments")
            .map(string_list)
            .unwrap_or_default();
        let spawns = field(obj, "Spawns").map(string_list).unwrap_or_default();
        let output = field(obj, "Output")
            .map(Output::from_value)
            .unwrap_or_default();
        let error = field(obj, "Error").and_then(text_of);
        let gas_used = field(obj, "GasUsed").and_then(as_i64).unwrap_or(0);

        Self {
            messages,
            assignments,
            spawns,
            output,
            error,
            gas_used,
            payload: value,
        }
    }

    /// True when the process reported no error.
    pub fn is_successful(&self) -> bool {
        self.error.as_deref().is_none_or(str::is_empty)
    }

    /// Message at `index`, if present.
    pub fn target_message(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    /// The JSON value this envelope was parsed from.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Which envelope checks run before a response counts as a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Reject when `Messages` is empty
    pub require_messages: bool,
    /// Reject when there is no message at `target_message_index`
    pub require_target_message: bool,
    /// Reject when the target message has null data
    pub require_target_data: bool,
    /// Reject when `Error` is non-empty
    pub reject_process_error: bool,
    /// Reject out-of-band results completed under a different wallet
    pub check_identity: bool,
    /// Index of the message the caller cares about
    pub target_message_index: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            require_messages: true,
            require_target_message: true,
            require_target_data: true,
            reject_process_error: true,
            check_identity: true,
            target_message_index: 0,
        }
    }
}

impl ValidationPolicy {
    /// Accept any parsed body; only identity is still checked.
    pub fn lenient() -> Self {
        Self {
            require_messages: false,
            require_target_message: false,
            require_target_data: false,
            reject_process_error: false,
            check_identity: true,
            target_message_index: 0,
        }
    }

    /// Run the enabled checks in order, reporting the first failure.
    pub fn check(&self, envelope: &ResponseEnvelope) -> Result<(), ValidationFailure> {
        let count = envelope.messages.len();
        if self.require_messages && count == 0 {
            return Err(ValidationFailure::MissingMessages);
        }

        let index = self.target_message_index;
        if self.require_target_message && count <= index {
            return Err(ValidationFailure::MissingTargetMessage { index, count });
        }

        if self.require_target_data {
            if let Some(message) = envelope.messages.get(index) {
                if message.data.is_none() {
                    return Err(ValidationFailure::TargetMessageNoData(index));
                }
            }
        }

        if self.reject_process_error {
            if let Some(error) = envelope.error.as_deref().filter(|e| !e.is_empty()) {
                return Err(ValidationFailure::ProcessError(error.to_string()));
            }
        }

        Ok(())
    }
}

/// Look up `name` exactly, then case-insensitively.
pub(crate) fn field<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    obj.get(name).or_else(|| {
        obj.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(text_of).collect())
        .unwrap_or_default()
}
