//! Transport seams: HTTP and the out-of-band submitter.
//!
//! The dispatcher only talks to these traits. [`ReqwestTransport`] is the
//! production HTTP client; tests substitute scripted implementations.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;

use super::error::TransportError;
use super::identity::WalletKind;
use super::request::{CorrelationId, ProcessId};

const MAX_ERROR_BODY: usize = 512;

/// Status and body of an HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl HttpResponse {
    /// Response with the given status and body
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into a [`TransportError::Status`].
    pub fn error_for_status(self, url: &str) -> Result<Self, TransportError> {
        if self.is_success() {
            return Ok(self);
        }
        let mut body = self.body;
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(TransportError::Status {
            url: url.to_string(),
            status: self.status,
            body,
        })
    }
}

/// Minimal HTTP surface used by the dispatcher and GraphQL client.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST a JSON body.
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError>;

    /// GET a URL.
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// `reqwest`-backed [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Client with an optional whole-request timeout.
    pub fn new(timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = Client::builder().default_headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn finish(
        url: &str,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<HttpResponse, TransportError> {
        let response = response.map_err(|err| network(url, err))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| network(url, err))?;
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await;
        Self::finish(url, response).await
    }

    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let response = self.client.get(url).send().await;
        Self::finish(url, response).await
    }
}

fn network(url: &str, err: reqwest::Error) -> TransportError {
    TransportError::Network {
        url: url.to_string(),
        detail: err.to_string(),
    }
}

/// Which protocol generation an out-of-band submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitProtocol {
    /// Legacy message protocol
    Message,
    /// Compute-path protocol
    Compute,
}

/// Everything an out-of-band submitter needs to sign and send a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Target process
    pub process_id: ProcessId,
    /// Payload (empty string when absent)
    pub data: String,
    /// Tags as a JSON array of `{name, value}`
    pub tags_json: String,
    /// Id the submitter must echo back through `on_result`
    pub correlation_id: CorrelationId,
    /// Object the host should route the result to
    pub callback_target: String,
    /// Method the host should invoke with the result
    pub callback_method: String,
    /// Bypass the session key
    pub use_main_wallet: bool,
    /// Wallet selector
    pub wallet: WalletKind,
    /// Protocol generation
    pub protocol: SubmitProtocol,
}

/// Signs and submits messages; results come back via
/// [`RequestHandler::on_result`](super::handler::RequestHandler::on_result).
///
/// Implementations must deliver exactly one result per correlation id or the
/// pending slot stays open until cancelled or timed out.
#[async_trait]
pub trait Submitter: Send + Sync {
    /// Hand the submission to the signer.
    async fn submit(&self, submission: Submission) -> Result<(), TransportError>;
}
