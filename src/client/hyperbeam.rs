//! HyperBEAM compute-path URLs and response unwrapping.
//!
//! URL grammar:
//!
//! ```text
//! <base>/<pid>~process@1.0/<mode>[/cache]/<path>[?accept=application/json&accept-bundle=true]
//! <base>/<pid>~process@1.0/<mode>/~<device>[&module=<id>][&<k>=<v>...]/<method>[?accept=...]
//! ```
//!
//! `<mode>` is `now`, `compute={slot}` or `compute`. Everything here is pure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const PROCESS_DEVICE: &str = "process@1.0";
const SERIALIZE_SUFFIX: &str = "?accept=application/json&accept-bundle=true";

/// HyperBEAM endpoint settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperBeamConfig {
    /// Node base URL
    pub base_url: String,
    /// Device used for dynamic method calls
    pub device: String,
}

impl Default for HyperBeamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://forward.computer".to_string(),
            device: "lua@5.3a".to_string(),
        }
    }
}

/// Evaluation mode selected for a compute path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    /// Live evaluation (`now`)
    Now,
    /// Cached state at a given slot (`compute={slot}`)
    Slot(u64),
    /// Latest cached state (`compute`)
    Latest,
}

impl ComputeMode {
    /// `now` wins over `slot`; without either the latest cached state is used.
    pub fn select(now: bool, slot: Option<u64>) -> Self {
        match (now, slot) {
            (true, _) => ComputeMode::Now,
            (false, Some(slot)) => ComputeMode::Slot(slot),
            (false, None) => ComputeMode::Latest,
        }
    }

    fn segment(&self) -> String {
        match self {
            ComputeMode::Now => "now".to_string(),
            ComputeMode::Slot(slot) => format!("compute={slot}"),
            ComputeMode::Latest => "compute".to_string(),
        }
    }
}

/// What a compute-path request reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeQuery {
    /// Read a cached path exposed by the process
    Static {
        /// Path under the process (e.g. `info`)
        cache_path: String,
        /// Insert the `/cache` segment
        add_cache_prefix: bool,
        /// Live evaluation
        now: bool,
        /// Slot to read at
        slot: Option<u64>,
        /// Ask for structured JSON
        serialize: bool,
    },
    /// Invoke a method on the process module
    Dynamic {
        /// Method name terminating the path
        method: String,
        /// Ordered parameters
        params: Vec<(String, String)>,
        /// Module selector
        module_id: Option<String>,
        /// Live evaluation
        now: bool,
        /// Slot to evaluate at
        slot: Option<u64>,
        /// Ask for structured JSON
        serialize: bool,
    },
}

impl ComputeQuery {
    /// Static cached read with default flags (`compute`, `/cache`, serialized).
    pub fn cached(path: impl Into<String>) -> Self {
        ComputeQuery::Static {
            cache_path: path.into(),
            add_cache_prefix: true,
            now: false,
            slot: None,
            serialize: true,
        }
    }

    /// Dynamic live call with default flags (`now`, serialized).
    pub fn call(method: impl Into<String>) -> Self {
        ComputeQuery::Dynamic {
            method: method.into(),
            params: Vec::new(),
            module_id: None,
            now: true,
            slot: None,
            serialize: true,
        }
    }
}

/// Builds compute-path URLs against one node.
#[derive(Debug, Clone)]
pub struct PathBuilder {
    base_url: String,
    device: String,
}

impl PathBuilder {
    /// Builder for the configured node.
    pub fn new(config: &HyperBeamConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            device: config.device.trim_start_matches('~').to_string(),
        }
    }

    /// URL for reading a cached process path.
    pub fn static_path(
        &self,
        pid: &str,
        cache_path: &str,
        mode: ComputeMode,
        add_cache_prefix: bool,
        serialize: bool,
    ) -> String {
        let mut url = self.process_root(pid, mode);
        if add_cache_prefix {
            url.push_str("/cache");
        }
        url.push('/');
        url.push_str(cache_path.trim_start_matches('/'));
        if serialize {
            url.push_str(SERIALIZE_SUFFIX);
        }
        url
    }

    /// URL for invoking `method` with ordered, percent-encoded parameters.
    pub fn dynamic_path(
        &self,
        pid: &str,
        method: &str,
        params: &[(String, String)],
        mode: ComputeMode,
        module_id: Option<&str>,
        serialize: bool,
    ) -> String {
        let mut url = self.process_root(pid, mode);
        url.push_str("/~");
        url.push_str(&self.device);
        if let Some(module) = module_id.filter(|m| !m.is_empty()) {
            url.push_str("&module=");
            url.push_str(&encode_component(module));
        }
        for (key, value) in params {
            url.push('&');
            url.push_str(&encode_component(key));
            url.push('=');
            url.push_str(&encode_component(value));
        }
        url.push('/');
        url.push_str(method.trim_start_matches('/'));
        if serialize {
            url.push_str(SERIALIZE_SUFFIX);
        }
        url
    }

    /// URL for a [`ComputeQuery`].
    pub fn build(&self, pid: &str, query: &ComputeQuery) -> String {
        match query {
            ComputeQuery::Static {
                cache_path,
                add_cache_prefix,
                now,
                slot,
                serialize,
            } => self.static_path(
                pid,
                cache_path,
                ComputeMode::select(*now, *slot),
                *add_cache_prefix,
                *serialize,
            ),
            ComputeQuery::Dynamic {
                method,
                params,
                module_id,
                now,
                slot,
                serialize,
            } => self.dynamic_path(
                pid,
                method,
                params,
                ComputeMode::select(*now, *slot),
                module_id.as_deref(),
                *serialize,
            ),
        }
    }

    fn process_root(&self, pid: &str, mode: ComputeMode) -> String {
        format!(
            "{}/{}~{}/{}",
            self.base_url,
            pid,
            PROCESS_DEVICE,
            mode.segment()
        )
    }
}

/// Percent-encode a path/tag component (spaces become `%20`).
pub fn encode_component(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Peel the `body` layers of a compute response.
///
/// Older nodes wrap the payload once (`{"body": <payload>}`); newer ones nest
/// a JSON-encoded body inside `{"body": {"json": {"body": "<payload>"}}}`.
/// Each layer may be a JSON string or an already-parsed value. When an
/// expected key is missing the structure reached so far is returned.
pub fn unwrap_body(outer: Value) -> Value {
    let Some(first) = peel(&outer) else {
        return outer;
    };

    // Only the `json` wrapper marks a second layer; any other `body` key
    // belongs to the payload.
    match first.get("json").filter(|json| json.is_object()) {
        Some(json) => peel(json).unwrap_or_else(|| json.clone()),
        None => first,
    }
}

/// Parse a raw compute response body and unwrap it.
pub fn unwrap_body_str(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => unwrap_body(value),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn peel(value: &Value) -> Option<Value> {
    let body = value.as_object()?.get("body")?;
    Some(parse_lenient(body))
}

fn parse_lenient(value: &Value) -> Value {
    match value {
        Value::String(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
        other => other.clone(),
    }
}
