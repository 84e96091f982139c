//! Error types for the courier client
//!
//! Domain errors use thiserror. `DispatchError` is the taxonomy every
//! terminal callback reports; `ClientError` covers construction, parsing and
//! persistence failures outside the dispatch loop.

use std::io;
use thiserror::Error;

use super::envelope::ResponseEnvelope;

/// Top-level client error
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A request completed with a terminal failure
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] Failure),

    /// GraphQL fallback failed
    #[error("GraphQL error: {0}")]
    GraphQl(#[from] GraphQlError),

    /// JSON (de)serialisation error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote returned an unexpected or malformed payload
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failures raised while moving bytes to or from an endpoint
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Endpoint answered with a non-2xx status
    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Connection, TLS, timeout or body read failure
    #[error("request to {url} failed: {detail}")]
    Network {
        /// Requested URL
        url: String,
        /// Error details
        detail: String,
    },

    /// The out-of-band submitter refused or failed the submission
    #[error("submission failed: {0}")]
    Submission(String),

    /// No out-of-band result arrived before the configured deadline
    #[error("no result for correlation id {0} before the callback deadline")]
    CallbackTimeout(String),

    /// The pending slot was replaced or dropped before completion
    #[error("pending slot for correlation id {0} was retired before completion")]
    SlotRetired(String),
}

/// Reasons a received envelope is rejected by the validation policy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    /// `Messages` is empty or absent
    #[error("missing messages")]
    MissingMessages,

    /// Fewer messages than the configured target index requires
    #[error("missing target message {index} (response has {count})")]
    MissingTargetMessage {
        /// Expected message index
        index: usize,
        /// Number of messages received
        count: usize,
    },

    /// The target message carries no `Data`
    #[error("target message {0} has no data")]
    TargetMessageNoData(usize),

    /// The process reported an error
    #[error("process error: {0}")]
    ProcessError(String),

    /// Body could not be parsed as a response envelope
    #[error("malformed body: {0}")]
    Malformed(String),
}

/// Classification of a failed dispatch
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// HTTP non-2xx, network exception or submitter failure
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Response shape rejected by the validation policy
    #[error("validation failure: {0}")]
    Validation(#[from] ValidationFailure),

    /// The wallet that completed an out-of-band request is not the one that issued it
    #[error("identity mismatch mid-flight (issued by {issued}, now {current})")]
    IdentityMismatch {
        /// Address that issued the request
        issued: String,
        /// Address active when the result arrived
        current: String,
    },

    /// The cancellation scope was triggered
    #[error("request cancelled")]
    Cancelled,

    /// Missing wallet, empty process id, missing submitter
    #[error("configuration failure: {0}")]
    Configuration(String),

    /// Dropped by the queue (overflow or clear) before dispatch
    #[error("request was not processed: {0}")]
    NotProcessed(String),

    /// Replaced by a newer page request before dispatch
    #[error("request superseded by a newer request")]
    Superseded,
}

/// GraphQL fallback failures
#[derive(Debug, Clone, Error)]
pub enum GraphQlError {
    /// No endpoints are configured
    #[error("no GraphQL endpoints configured")]
    NoEndpoints,

    /// Every endpoint failed on every round
    #[error("all GraphQL endpoints failed after {rounds} round(s): {last}")]
    Exhausted {
        /// Rounds over the endpoint list
        rounds: u32,
        /// Last error observed
        last: String,
    },

    /// The caller cancelled the query
    #[error("GraphQL query cancelled")]
    Cancelled,

    /// The response was not the expected shape
    #[error("unexpected GraphQL response: {0}")]
    Shape(String),
}

impl DispatchError {
    /// Whether the retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Transport(_)
                | DispatchError::Validation(_)
                | DispatchError::IdentityMismatch { .. }
        )
    }

    /// Whether the failure was caused by cancellation rather than the network.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled | DispatchError::Superseded)
    }
}

/// Terminal failure handed to a request's callback.
#[derive(Debug, Clone, Error)]
#[error("{error} after {attempts} attempt(s)")]
pub struct Failure {
    /// Why the request failed
    pub error: DispatchError,
    /// Last envelope received, if any attempt produced one
    pub envelope: Option<ResponseEnvelope>,
    /// Number of attempts made (0 when rejected before dispatch)
    pub attempts: u32,
}

impl Failure {
    /// Failure that never reached the network.
    pub fn before_dispatch(error: DispatchError) -> Self {
        Self {
            error,
            envelope: None,
            attempts: 0,
        }
    }
}

/// Outcome of one logical request: the envelope or a terminal failure.
pub type Completion = std::result::Result<ResponseEnvelope, Failure>;

/// Result type using ClientError
pub type Result<T> = std::result::Result<T, ClientError>;
