//! Request dispatch for AO processes
//!
//! The [`Courier`] facade wires the layers together: a [`RequestHandler`]
//! that executes and retries single requests, a [`RequestQueue`] that rate
//! limits bursts, a [`PeriodicDriver`] and a [`Paginator`] on top of the
//! queue, and a [`GraphQlClient`] for read-only transaction discovery.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// Submodules
pub mod config;
pub mod envelope;
pub mod error;
pub mod graphql;
pub mod handler;
pub mod hyperbeam;
pub mod identity;
pub mod paginator;
pub mod periodic;
pub mod queue;
pub mod request;
pub mod retry;
pub mod slots;
pub mod tag;
pub mod transport;

pub use envelope::{Message, Output, ResponseEnvelope, ValidationPolicy};
pub use error::{
    ClientError, Completion, DispatchError, Failure, GraphQlError, Result, TransportError,
    ValidationFailure,
};
pub use graphql::{GraphQlClient, GraphQlConfig, TransactionNode, TransactionQuery};
pub use handler::{CallbackRoute, HandlerConfig, RefreshSignal, RequestHandler};
pub use hyperbeam::{ComputeMode, ComputeQuery, HyperBeamConfig, PathBuilder};
pub use identity::{IdentityProvider, StaticIdentity, WalletInfo, WalletKind};
pub use paginator::{PageInfo, PageResult, PaginationStatus, Paginator, PaginatorConfig};
pub use periodic::PeriodicDriver;
pub use queue::{EnqueueOutcome, OverflowPolicy, QueueConfig, RequestQueue};
pub use request::{CorrelationId, ProcessId, Request, Transport};
pub use tag::Tag;
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, Submission, Submitter};

/// Environment variable overriding the dry-run endpoint prefix
pub const ENV_DRY_RUN_URL: &str = "COURIER_DRY_RUN_URL";
/// Environment variable overriding the HyperBEAM node URL
pub const ENV_HYPERBEAM_URL: &str = "COURIER_HYPERBEAM_URL";
/// Environment variable overriding the GraphQL endpoints (comma separated)
pub const ENV_GRAPHQL_ENDPOINTS: &str = "COURIER_GRAPHQL_ENDPOINTS";
/// Environment variable overriding the resend delays (comma separated seconds)
pub const ENV_RESEND_DELAYS: &str = "COURIER_RESEND_DELAYS";

/// Configuration for every layer of the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Dispatcher settings (including the HyperBEAM node)
    pub handler: HandlerConfig,

    /// Queue and rate-limit settings
    pub queue: QueueConfig,

    /// Pagination settings
    pub paginator: PaginatorConfig,

    /// GraphQL fallback settings
    pub graphql: GraphQlConfig,

    /// Whole-request HTTP timeout in seconds for the reqwest transport
    pub http_timeout_secs: Option<f64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handler: HandlerConfig::default(),
            queue: QueueConfig::default(),
            paginator: PaginatorConfig::default(),
            graphql: GraphQlConfig::default(),
            http_timeout_secs: Some(30.0),
        }
    }
}

impl ClientConfig {
    /// Apply `COURIER_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Blank values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(url) = get(ENV_DRY_RUN_URL) {
            self.handler.dry_run_url = url;
        }
        if let Some(url) = get(ENV_HYPERBEAM_URL) {
            self.handler.hyperbeam.base_url = url;
        }
        if let Some(endpoints) = get(ENV_GRAPHQL_ENDPOINTS) {
            let endpoints: Vec<String> = split_list(&endpoints).map(str::to_string).collect();
            if !endpoints.is_empty() {
                self.graphql.endpoints = endpoints;
            }
        }
        if let Some(delays) = get(ENV_RESEND_DELAYS) {
            let parsed: Option<Vec<f64>> = split_list(&delays).map(|d| d.parse().ok()).collect();
            match parsed {
                Some(delays) if !delays.is_empty() => self.handler.resend_delays_secs = delays,
                _ => debug!(value = %delays, "ignoring unparsable {}", ENV_RESEND_DELAYS),
            }
        }
        self
    }

    /// HTTP timeout as a duration
    pub fn http_timeout(&self) -> Option<Duration> {
        self.http_timeout_secs.map(retry::secs)
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// All client layers wired over one handler.
pub struct Courier {
    config: ClientConfig,
    handler: Arc<RequestHandler>,
    queue: RequestQueue,
    periodic: PeriodicDriver,
    paginator: Paginator,
    graphql: GraphQlClient,
}

impl Courier {
    /// Build every layer over `http`. Must be called inside a tokio runtime.
    pub fn new(
        config: ClientConfig,
        identity: Arc<dyn IdentityProvider>,
        http: Arc<dyn HttpTransport>,
    ) -> Self {
        let handler = RequestHandler::new(config.handler.clone(), identity, Arc::clone(&http));
        Self::with_handler(config, Arc::new(handler), http)
    }

    /// Build the upper layers over an existing handler, e.g. one with a submitter attached.
    pub fn with_handler(
        config: ClientConfig,
        handler: Arc<RequestHandler>,
        http: Arc<dyn HttpTransport>,
    ) -> Self {
        let queue = RequestQueue::new(Arc::clone(&handler), config.queue.clone());
        let periodic = PeriodicDriver::new(queue.clone());
        let paginator = Paginator::new(queue.clone(), config.paginator.clone());
        let graphql = GraphQlClient::new(config.graphql.clone(), http);
        Self {
            config,
            handler,
            queue,
            periodic,
            paginator,
            graphql,
        }
    }

    /// Build over the reqwest transport.
    pub fn connect(config: ClientConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        let http = ReqwestTransport::new(config.http_timeout())
            .map_err(|err| ClientError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self::new(config, identity, Arc::new(http)))
    }

    /// Configuration in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Dispatcher
    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Rate-limited queue
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Periodic driver
    pub fn periodic(&self) -> &PeriodicDriver {
        &self.periodic
    }

    /// Paginator
    pub fn paginator(&self) -> &Paginator {
        &self.paginator
    }

    /// GraphQL fallback
    pub fn graphql(&self) -> &GraphQlClient {
        &self.graphql
    }

    /// Send one request directly through the handler and wait for it.
    pub async fn send(&self, request: Request) -> Completion {
        self.handler.send(request, None).await
    }

    /// Stop the periodic loop, reset pagination and cancel queued and in-flight work.
    pub async fn force_stop_and_reset(&self) {
        self.periodic.stop().await;
        self.paginator.reset_pagination();
        self.queue.force_stop_and_reset();
        self.handler.force_stop_and_reset();
    }

    /// Stop everything and wait for outstanding callbacks.
    pub async fn shutdown(&self) {
        self.periodic.stop().await;
        self.paginator.reset_pagination();
        self.queue.shutdown().await;
        self.handler.shutdown().await;
    }
}
