#![allow(dead_code)]

use async_trait::async_trait;
use courier::client::error::TransportError;
use courier::client::{HttpResponse, HttpTransport, Submission, Submitter};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One request seen by [`FakeHttp`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: &'static str,
    pub url: String,
    pub body: Option<Value>,
    pub at: Instant,
}

impl RecordedCall {
    /// Value of the first request tag named `name` in a dry-run body.
    pub fn tag(&self, name: &str) -> Option<String> {
        self.body
            .as_ref()?
            .get("Tags")?
            .as_array()?
            .iter()
            .find(|tag| tag["name"] == name)
            .and_then(|tag| tag["value"].as_str())
            .map(str::to_string)
    }
}

/// Scripted reply.
pub struct Reply {
    pub delay: Duration,
    pub result: Result<HttpResponse, TransportError>,
}

impl Reply {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(HttpResponse::new(status, body)),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Responder = Box<dyn Fn(&RecordedCall) -> Reply + Send + Sync>;

/// In-memory transport: scripted replies first, then the responder.
pub struct FakeHttp {
    script: Mutex<VecDeque<Reply>>,
    responder: Responder,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeHttp {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&RecordedCall) -> Reply + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always answers 200 with `body`.
    pub fn always(body: &'static str) -> Self {
        Self::new(move |_| Reply::ok(body))
    }

    pub fn push(self, reply: Reply) -> Self {
        self.script.lock().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    async fn answer(&self, call: RecordedCall) -> Result<HttpResponse, TransportError> {
        let reply = {
            let scripted = self.script.lock().pop_front();
            scripted.unwrap_or_else(|| (self.responder)(&call))
        };
        self.calls.lock().push(call);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.result
    }
}

#[async_trait]
impl HttpTransport for FakeHttp {
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        self.answer(RecordedCall {
            method: "POST",
            url: url.to_string(),
            body: Some(body.clone()),
            at: Instant::now(),
        })
        .await
    }

    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.answer(RecordedCall {
            method: "GET",
            url: url.to_string(),
            body: None,
            at: Instant::now(),
        })
        .await
    }
}

/// Submitter that forwards every submission to a channel.
pub struct ChannelSubmitter {
    sender: mpsc::UnboundedSender<Submission>,
}

impl ChannelSubmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Submission>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Submitter for ChannelSubmitter {
    async fn submit(&self, submission: Submission) -> Result<(), TransportError> {
        self.sender
            .send(submission)
            .map_err(|_| TransportError::Submission("receiver dropped".to_string()))
    }
}

/// Assert `actual` is `expected_secs` after `start`, within a millisecond tick.
pub fn assert_at(start: Instant, actual: Instant, expected_secs: f64) {
    let elapsed = actual.duration_since(start).as_secs_f64();
    assert!(
        (elapsed - expected_secs).abs() < 0.01,
        "expected call at {expected_secs}s, got {elapsed}s"
    );
}

/// `http` as the trait object the client layers take.
pub fn transport(http: &Arc<FakeHttp>) -> Arc<dyn HttpTransport> {
    Arc::clone(http) as Arc<dyn HttpTransport>
}

pub const OK_BODY: &str = r#"{"Messages":[{"Data":"ok"}]}"#;
