//! Request dispatcher.
//!
//! [`RequestHandler`] turns one logical [`Request`] into one [`Completion`].
//! It resolves the signing identity, picks the transport, validates every
//! envelope it receives and retries retryable failures on the shared backoff
//! schedule. Callback-style dispatches run as tasks tracked by the handler so
//! [`RequestHandler::force_stop_and_reset`] and [`RequestHandler::shutdown`]
//! can reach them.
//!
//! Cancellation never aborts a task. Tasks observe the handler scope (and an
//! optional caller token) and report [`DispatchError::Cancelled`], so every
//! callback still fires exactly once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::envelope::{ResponseEnvelope, ValidationPolicy};
use super::error::{Completion, DispatchError, Failure, TransportError};
use super::hyperbeam::{HyperBeamConfig, PathBuilder, unwrap_body_str};
use super::identity::IdentityProvider;
use super::request::{CorrelationId, Request, Transport};
use super::retry::{Backoff, RetryState, secs};
use super::slots::SlotRegistry;
use super::tag::tags_to_json;
use super::transport::{HttpTransport, SubmitProtocol, Submission, Submitter};

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Dry-run endpoint prefix; the process id is appended
    pub dry_run_url: String,

    /// Retry retryable failures
    pub resend_on_failure: bool,

    /// Backoff schedule in seconds
    pub resend_delays_secs: Vec<f64>,

    /// Walk the schedule on consecutive failures (otherwise reuse the first delay)
    pub increase_resend_delay: bool,

    /// Failure streak length that triggers a refresh signal; `None` disables it
    pub refresh_after_secs: Option<f64>,

    /// Upper bound on attempts per request; `None` retries until success or cancel
    pub max_attempts: Option<u32>,

    /// Deadline for out-of-band results; `None` waits indefinitely
    pub callback_timeout_secs: Option<f64>,

    /// Callback routing for legacy messages
    pub message_callback: CallbackRoute,

    /// Callback routing for compute-protocol messages
    pub compute_callback: CallbackRoute,

    /// Default validation policy
    pub validation: ValidationPolicy,

    /// HyperBEAM node used for compute-path requests
    pub hyperbeam: HyperBeamConfig,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            dry_run_url: "https://cu.ao-testnet.xyz/dry-run?process-id=".to_string(),
            resend_on_failure: true,
            resend_delays_secs: vec![2.0, 5.0, 10.0, 30.0],
            increase_resend_delay: true,
            refresh_after_secs: Some(600.0),
            max_attempts: None,
            callback_timeout_secs: None,
            message_callback: CallbackRoute::new("RequestHandler", "OnMessageResult"),
            compute_callback: CallbackRoute::new("RequestHandler", "OnComputeMessageResult"),
            validation: ValidationPolicy::default(),
            hyperbeam: HyperBeamConfig::default(),
        }
    }
}

impl HandlerConfig {
    /// Backoff schedule derived from the configured delays
    pub fn backoff(&self) -> Backoff {
        Backoff::from_secs(&self.resend_delays_secs, self.increase_resend_delay)
    }
}

/// Where the host routes an out-of-band result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRoute {
    /// Receiving object
    pub target: String,
    /// Receiving method
    pub method: String,
}

impl CallbackRoute {
    /// Route to `target.method`
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
        }
    }
}

/// Emitted when failures have persisted past the refresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSignal {
    /// Length of the failure streak when the signal fired
    pub failing_for: Duration,
}

/// Identity captured on the first attempt and reused by every retry.
#[derive(Debug, Clone)]
struct IssuedIdentity {
    address: String,
}

struct AttemptError {
    error: DispatchError,
    envelope: Option<ResponseEnvelope>,
}

impl AttemptError {
    fn new(error: impl Into<DispatchError>) -> Self {
        Self {
            error: error.into(),
            envelope: None,
        }
    }

    fn with_envelope(error: impl Into<DispatchError>, envelope: ResponseEnvelope) -> Self {
        Self {
            error: error.into(),
            envelope: Some(envelope),
        }
    }
}

type AttemptResult = std::result::Result<ResponseEnvelope, AttemptError>;

/// Dispatches requests over the configured transports.
pub struct RequestHandler {
    config: HandlerConfig,
    backoff: Backoff,
    identity: Arc<dyn IdentityProvider>,
    http: Arc<dyn HttpTransport>,
    submitter: Option<Arc<dyn Submitter>>,
    paths: PathBuilder,
    slots: SlotRegistry,
    retry: Mutex<RetryState>,
    scope: Mutex<CancellationToken>,
    tasks: TaskTracker,
    refresh: broadcast::Sender<RefreshSignal>,
}

impl RequestHandler {
    /// Create a handler without an out-of-band submitter.
    pub fn new(
        config: HandlerConfig,
        identity: Arc<dyn IdentityProvider>,
        http: Arc<dyn HttpTransport>,
    ) -> Self {
        let (refresh, _) = broadcast::channel(8);
        Self {
            backoff: config.backoff(),
            paths: PathBuilder::new(&config.hyperbeam),
            config,
            identity,
            http,
            submitter: None,
            slots: SlotRegistry::new(),
            retry: Mutex::new(RetryState::new()),
            scope: Mutex::new(CancellationToken::new()),
            tasks: TaskTracker::new(),
            refresh,
        }
    }

    /// Attach the signer used by `Message`/`ComputeMessage` requests.
    pub fn with_submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Path builder bound to the configured HyperBEAM node
    pub fn paths(&self) -> &PathBuilder {
        &self.paths
    }

    /// Subscribe to circuit-breaker refresh signals.
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<RefreshSignal> {
        self.refresh.subscribe()
    }

    /// Number of out-of-band requests awaiting a result
    pub fn pending_results(&self) -> usize {
        self.slots.len()
    }

    /// Number of callback dispatches still running
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Current backoff index of the shared retry state
    pub fn retry_index(&self) -> usize {
        self.retry.lock().index()
    }

    /// Dispatch in the background and deliver the completion to `callback`.
    ///
    /// Returns immediately; `callback` runs exactly once.
    pub fn dispatch<F>(
        self: &Arc<Self>,
        request: Request,
        cancel: Option<CancellationToken>,
        callback: F,
    ) where
        F: FnOnce(Completion) + Send + 'static,
    {
        let handler = Arc::clone(self);
        self.tasks.spawn(async move {
            let completion = handler.send(request, cancel).await;
            callback(completion);
        });
    }

    /// Dispatch and wait for the final completion across all retries.
    pub async fn send(&self, request: Request, cancel: Option<CancellationToken>) -> Completion {
        let scope = self.scope.lock().child_token();
        let cancel = cancel.unwrap_or_default();

        if request.process_id().is_blank() {
            return Err(Failure::before_dispatch(DispatchError::Configuration(
                "empty process id".to_string(),
            )));
        }

        let issued = match self.resolve_identity(&request) {
            Ok(issued) => issued,
            Err(err) => return Err(Failure::before_dispatch(err)),
        };

        let resend = request
            .resend_override()
            .unwrap_or(self.config.resend_on_failure);
        let policy = request
            .validation_override()
            .cloned()
            .unwrap_or_else(|| self.config.validation.clone());

        let correlation_id = request.correlation_id().clone();
        let mut attempts: u32 = 0;
        let mut last_envelope: Option<ResponseEnvelope> = None;

        loop {
            attempts += 1;
            debug!(
                correlation_id = %correlation_id,
                transport = request.transport().name(),
                process_id = %request.process_id(),
                attempt = attempts,
                "dispatching request"
            );

            let outcome = tokio::select! {
                biased;
                _ = scope.cancelled() => Err(AttemptError::new(DispatchError::Cancelled)),
                _ = cancel.cancelled() => Err(AttemptError::new(DispatchError::Cancelled)),
                outcome = self.attempt(&request, &issued, &policy) => outcome,
            };

            let failure = match outcome {
                Ok(envelope) => {
                    self.retry.lock().record_success();
                    return Ok(envelope);
                }
                Err(failure) => failure,
            };

            if failure.envelope.is_some() {
                last_envelope = failure.envelope;
            }
            let error = failure.error;

            let exhausted = self
                .config
                .max_attempts
                .is_some_and(|max| attempts >= max);
            if !error.is_retryable() || !resend || exhausted {
                if !error.is_cancelled() {
                    warn!(
                        correlation_id = %correlation_id,
                        attempts,
                        error = %error,
                        "request failed"
                    );
                }
                return Err(Failure {
                    error,
                    envelope: last_envelope,
                    attempts,
                });
            }

            let decision = self.retry.lock().record_failure(
                &self.backoff,
                self.config.refresh_after_secs.map(secs),
                Instant::now(),
            );

            if let DispatchError::IdentityMismatch { issued, current } = &error {
                warn!(
                    correlation_id = %correlation_id,
                    issued = %issued,
                    current = %current,
                    "wallet changed while request was in flight; retrying under the issuing identity"
                );
            }
            warn!(
                correlation_id = %correlation_id,
                attempt = attempts,
                delay_ms = decision.delay.as_millis() as u64,
                error = %error,
                "request failed, scheduling retry"
            );

            if decision.refresh {
                error!(
                    failing_for_secs = decision.streak.as_secs(),
                    "failure streak exceeded refresh window"
                );
                let _ = self.refresh.send(RefreshSignal {
                    failing_for: decision.streak,
                });
            }

            let cancelled = tokio::select! {
                biased;
                _ = scope.cancelled() => true,
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(decision.delay) => false,
            };
            if cancelled {
                return Err(Failure {
                    error: DispatchError::Cancelled,
                    envelope: last_envelope,
                    attempts,
                });
            }
        }
    }

    /// Deliver an out-of-band result. Returns `false` when no slot is waiting.
    pub fn on_result(&self, correlation_id: &CorrelationId, raw_json: impl Into<String>) -> bool {
        let delivered = self.slots.try_complete(correlation_id, raw_json);
        if !delivered {
            warn!(correlation_id = %correlation_id, "result arrived with no pending request");
        }
        delivered
    }

    /// Cancel all outstanding work, drop pending slots and reset retry state.
    ///
    /// Safe to call repeatedly; new requests afterwards run under a fresh scope.
    pub fn force_stop_and_reset(&self) {
        {
            let mut scope = self.scope.lock();
            scope.cancel();
            *scope = CancellationToken::new();
        }
        let dropped = self.slots.clear();
        self.retry.lock().record_success();
        debug!(dropped_slots = dropped, "request handler reset");
    }

    /// Cancel outstanding work and wait for every callback dispatch to finish.
    pub async fn shutdown(&self) {
        self.force_stop_and_reset();
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn resolve_identity(&self, request: &Request) -> Result<IssuedIdentity, DispatchError> {
        let kind = request.wallet_kind();
        let wallet = self.identity.wallet(kind).ok_or_else(|| {
            DispatchError::Configuration(format!("no wallet connected for {kind}"))
        })?;
        Ok(IssuedIdentity {
            address: wallet
                .effective_address(request.uses_main_wallet())
                .to_string(),
        })
    }

    async fn attempt(
        &self,
        request: &Request,
        issued: &IssuedIdentity,
        policy: &ValidationPolicy,
    ) -> AttemptResult {
        match request.transport() {
            Transport::DryRun => self.attempt_dry_run(request, issued, policy).await,
            Transport::Message => {
                self.attempt_out_of_band(request, issued, policy, SubmitProtocol::Message)
                    .await
            }
            Transport::ComputeMessage => {
                self.attempt_out_of_band(request, issued, policy, SubmitProtocol::Compute)
                    .await
            }
            Transport::ComputePath(query) => {
                let url = self.paths.build(request.process_id().as_str(), query);
                self.attempt_compute_path(&url, policy).await
            }
        }
    }

    async fn attempt_dry_run(
        &self,
        request: &Request,
        issued: &IssuedIdentity,
        policy: &ValidationPolicy,
    ) -> AttemptResult {
        let url = format!("{}{}", self.config.dry_run_url, request.process_id());
        let body = dry_run_body(request, &issued.address);

        let response = self
            .http
            .post_json(&url, &body)
            .await
            .and_then(|response| response.error_for_status(&url))
            .map_err(AttemptError::new)?;

        let envelope = ResponseEnvelope::from_json(&response.body).map_err(AttemptError::new)?;
        validated(envelope, policy)
    }

    async fn attempt_compute_path(&self, url: &str, policy: &ValidationPolicy) -> AttemptResult {
        let response = self
            .http
            .get(url)
            .await
            .and_then(|response| response.error_for_status(url))
            .map_err(AttemptError::new)?;

        let envelope = ResponseEnvelope::from_value(unwrap_body_str(&response.body));
        validated(envelope, policy)
    }

    async fn attempt_out_of_band(
        &self,
        request: &Request,
        issued: &IssuedIdentity,
        policy: &ValidationPolicy,
        protocol: SubmitProtocol,
    ) -> AttemptResult {
        let submitter = self.submitter.as_ref().ok_or_else(|| {
            AttemptError::new(DispatchError::Configuration(
                "no out-of-band submitter configured".to_string(),
            ))
        })?;

        let route = match protocol {
            SubmitProtocol::Message => &self.config.message_callback,
            SubmitProtocol::Compute => &self.config.compute_callback,
        };
        let correlation_id = request.correlation_id().clone();
        let (_guard, receiver) = self.slots.create(correlation_id.clone(), issued.address.clone());

        submitter
            .submit(Submission {
                process_id: request.process_id().clone(),
                data: request.payload().unwrap_or_default().to_string(),
                tags_json: tags_to_json(request.tag_list()),
                correlation_id: correlation_id.clone(),
                callback_target: route.target.clone(),
                callback_method: route.method.clone(),
                use_main_wallet: request.uses_main_wallet(),
                wallet: request.wallet_kind(),
                protocol,
            })
            .await
            .map_err(AttemptError::new)?;

        let received = match self.config.callback_timeout_secs.map(secs) {
            Some(deadline) => match tokio::time::timeout(deadline, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(AttemptError::new(TransportError::CallbackTimeout(
                        correlation_id.to_string(),
                    )));
                }
            },
            None => receiver.await,
        };
        let completion = received.map_err(|_| {
            AttemptError::new(TransportError::SlotRetired(correlation_id.to_string()))
        })?;

        let envelope = ResponseEnvelope::from_json(&completion.raw_json).map_err(AttemptError::new)?;

        if policy.check_identity {
            let current = self
                .identity
                .wallet(request.wallet_kind())
                .map(|wallet| {
                    wallet
                        .effective_address(request.uses_main_wallet())
                        .to_string()
                })
                .unwrap_or_default();
            if current != completion.issued_by {
                return Err(AttemptError::with_envelope(
                    DispatchError::IdentityMismatch {
                        issued: completion.issued_by,
                        current,
                    },
                    envelope,
                ));
            }
        }

        validated(envelope, policy)
    }
}

fn validated(envelope: ResponseEnvelope, policy: &ValidationPolicy) -> AttemptResult {
    match policy.check(&envelope) {
        Ok(()) => Ok(envelope),
        Err(failure) => Err(AttemptError::with_envelope(failure, envelope)),
    }
}

/// JSON body for the dry-run endpoint.
pub fn dry_run_body(request: &Request, owner: &str) -> Value {
    let tags: Vec<Value> = request
        .tag_list()
        .iter()
        .map(|tag| json!({ "name": tag.name, "value": tag.value }))
        .collect();

    let mut body = json!({
        "Id": request.correlation_id().as_str(),
        "Target": request.process_id().as_str(),
        "Owner": owner,
        "Tags": tags,
    });
    if let Some(data) = request.payload() {
        body["Data"] = Value::String(data.to_string());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::request::Request;

    #[test]
    fn test_dry_run_body_shape() {
        let request = Request::dry_run("proc").tag("Action", "Info").data("hi");
        let body = dry_run_body(&request, "owner-addr");

        assert_eq!(body["Target"], "proc");
        assert_eq!(body["Owner"], "owner-addr");
        assert_eq!(body["Data"], "hi");
        assert_eq!(body["Id"], request.correlation_id().as_str());
        assert_eq!(body["Tags"][0]["name"], "Action");
        assert_eq!(body["Tags"][0]["value"], "Info");
    }

    #[test]
    fn test_dry_run_body_omits_missing_data() {
        let body = dry_run_body(&Request::dry_run("proc"), "owner");
        assert!(body.get("Data").is_none());
    }

    #[test]
    fn test_default_backoff() {
        let backoff = HandlerConfig::default().backoff();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(30));
    }
}
