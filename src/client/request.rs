//! Logical requests and their identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::envelope::ValidationPolicy;
use super::hyperbeam::ComputeQuery;
use super::identity::WalletKind;
use super::tag::Tag;

/// AO process identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    /// Create a process id from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for an empty or whitespace-only id
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Links an outbound request to its eventual out-of-band result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Create a new random correlation id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id (e.g. one echoed by a callback)
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a request reaches the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Stateless HTTP evaluation
    DryRun,
    /// Signed submission completed through an out-of-band callback
    Message,
    /// Out-of-band submission versioned for the compute protocol
    ComputeMessage,
    /// HyperBEAM compute-path GET
    ComputePath(ComputeQuery),
}

impl Transport {
    /// Whether completion arrives through the slot registry
    pub fn is_out_of_band(&self) -> bool {
        matches!(self, Transport::Message | Transport::ComputeMessage)
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Transport::DryRun => "dry_run",
            Transport::Message => "message",
            Transport::ComputeMessage => "compute_message",
            Transport::ComputePath(_) => "compute_path",
        }
    }
}

/// One logical request. Built once, then only read.
#[derive(Debug, Clone)]
pub struct Request {
    process_id: ProcessId,
    tags: Vec<Tag>,
    data: Option<String>,
    transport: Transport,
    wallet: WalletKind,
    use_main_wallet: bool,
    correlation_id: CorrelationId,
    resend_on_failure: Option<bool>,
    validation: Option<ValidationPolicy>,
}

impl Request {
    /// Start a request for `process_id` over `transport`.
    pub fn new(process_id: impl Into<String>, transport: Transport) -> Self {
        Self {
            process_id: ProcessId::new(process_id),
            tags: Vec::new(),
            data: None,
            transport,
            wallet: WalletKind::Default,
            use_main_wallet: false,
            correlation_id: CorrelationId::new(),
            resend_on_failure: None,
            validation: None,
        }
    }

    /// Dry-run request
    pub fn dry_run(process_id: impl Into<String>) -> Self {
        Self::new(process_id, Transport::DryRun)
    }

    /// Signed message request
    pub fn message(process_id: impl Into<String>) -> Self {
        Self::new(process_id, Transport::Message)
    }

    /// Signed compute-protocol message request
    pub fn compute_message(process_id: impl Into<String>) -> Self {
        Self::new(process_id, Transport::ComputeMessage)
    }

    /// HyperBEAM compute-path read
    pub fn compute_path(process_id: impl Into<String>, query: ComputeQuery) -> Self {
        Self::new(process_id, Transport::ComputePath(query))
    }

    /// Append a tag (duplicates are kept).
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag::new(name, value));
        self
    }

    /// Append several tags.
    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Attach a payload.
    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Select the wallet kind.
    pub fn wallet(mut self, kind: WalletKind) -> Self {
        self.wallet = kind;
        self
    }

    /// Sign with the main wallet even when a session key exists.
    pub fn use_main_wallet(mut self, use_main: bool) -> Self {
        self.use_main_wallet = use_main;
        self
    }

    /// Override the handler's resend-on-failure setting.
    pub fn resend_on_failure(mut self, resend: bool) -> Self {
        self.resend_on_failure = Some(resend);
        self
    }

    /// Override the handler's validation policy.
    pub fn validation(mut self, policy: ValidationPolicy) -> Self {
        self.validation = Some(policy);
        self
    }

    /// Same request with every `name` tag replaced by a single `name=value`.
    pub fn with_tag_replaced(&self, name: &str, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.tags.retain(|tag| tag.name != name);
        next.tags.push(Tag::new(name, value));
        next
    }

    /// Same request under a fresh correlation id.
    pub fn reissue(&self) -> Self {
        let mut next = self.clone();
        next.correlation_id = CorrelationId::new();
        next
    }

    /// Target process
    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    /// Tags in order
    pub fn tag_list(&self) -> &[Tag] {
        &self.tags
    }

    /// Payload
    pub fn payload(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Transport
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Wallet kind
    pub fn wallet_kind(&self) -> WalletKind {
        self.wallet
    }

    /// Whether to bypass the session key
    pub fn uses_main_wallet(&self) -> bool {
        self.use_main_wallet
    }

    /// Logical correlation id
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Per-request resend override
    pub fn resend_override(&self) -> Option<bool> {
        self.resend_on_failure
    }

    /// Per-request validation override
    pub fn validation_override(&self) -> Option<&ValidationPolicy> {
        self.validation.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_tag_order() {
        let request = Request::dry_run("pid")
            .tag("Action", "List")
            .tag("Action", "Again")
            .data("payload");

        let names: Vec<_> = request.tag_list().iter().map(|t| t.value.as_str()).collect();
        assert_eq!(names, vec!["List", "Again"]);
        assert_eq!(request.payload(), Some("payload"));
        assert_eq!(request.transport(), &Transport::DryRun);
    }

    #[test]
    fn test_tag_replacement_and_reissue() {
        let request = Request::message("pid").tag("Page", "1").tag("Action", "List");
        let next = request.with_tag_replaced("Page", "2");
        assert_eq!(next.tag_list().len(), 2);
        assert_eq!(next.tag_list()[1], Tag::new("Page", "2"));
        assert_eq!(next.correlation_id(), request.correlation_id());

        let reissued = next.reissue();
        assert_ne!(reissued.correlation_id(), next.correlation_id());
    }

    #[test]
    fn test_blank_process_id() {
        assert!(ProcessId::new("  ").is_blank());
        assert!(!ProcessId::new("abc").is_blank());
    }
}
