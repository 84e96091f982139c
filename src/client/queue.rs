//! Bounded request queue with rate limiting.
//!
//! A background loop drains the queue FIFO through the [`RequestHandler`],
//! keeping at most `max_concurrent_requests` dispatches in flight and spacing
//! dispatch *starts* by `request_interval`. Slow requests therefore do not
//! push back the next start once a concurrency slot frees up.
//!
//! All queue work runs under one cancellation scope. `force_stop_and_reset`
//! cancels it and installs a fresh one, so work enqueued afterwards runs
//! normally. In-flight bookkeeping is tagged with an epoch so late
//! completions from before a reset do not disturb the new counters.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::error::{Completion, DispatchError, Failure};
use super::handler::RequestHandler;
use super::request::Request;
use super::retry::{deadline, secs};

/// Callback invoked once with a queued request's completion.
pub type QueueCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// What happens when a request arrives at a full queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the newcomer
    #[default]
    DropNewest,
    /// Evict the oldest pending request and accept the newcomer
    EvictOldest,
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum pending (not yet dispatched) requests
    pub max_queue_size: usize,
    /// Maximum dispatches in flight
    pub max_concurrent_requests: usize,
    /// Minimum spacing between dispatch starts, in seconds
    pub request_interval_secs: f64,
    /// Overflow behaviour
    pub overflow: OverflowPolicy,
    /// Fail dropped requests through their callback
    pub callback_if_not_processed: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_concurrent_requests: 1,
            request_interval_secs: 1.0,
            overflow: OverflowPolicy::DropNewest,
            callback_if_not_processed: true,
        }
    }
}

impl QueueConfig {
    /// Spacing between dispatch starts
    pub fn request_interval(&self) -> Duration {
        secs(self.request_interval_secs)
    }
}

/// Result of [`RequestQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted under this id
    Queued(u64),
    /// Accepted under `id` after evicting the oldest pending request
    Evicted {
        /// Id of the accepted request
        id: u64,
        /// Id of the evicted request
        evicted: u64,
    },
    /// Rejected because the queue is full
    Rejected,
}

impl EnqueueOutcome {
    /// Id of the accepted request, if any
    pub fn id(&self) -> Option<u64> {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Evicted { id, .. } => Some(*id),
            EnqueueOutcome::Rejected => None,
        }
    }
}

/// A request waiting for dispatch.
pub struct PendingRequest {
    /// Queue-local id
    pub id: u64,
    /// The request
    pub request: Request,
    /// When it was accepted
    pub enqueued_at: DateTime<Utc>,
    callback: QueueCallback,
}

impl PendingRequest {
    fn fail(self, error: DispatchError) {
        (self.callback)(Err(Failure::before_dispatch(error)));
    }
}

struct QueueState {
    pending: VecDeque<PendingRequest>,
    in_flight: usize,
    last_dispatch: Option<Instant>,
    next_id: u64,
    epoch: u64,
    scope: CancellationToken,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
}

struct QueueInner {
    config: QueueConfig,
    interval: Duration,
    handler: Arc<RequestHandler>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum NextStep {
    Dispatch {
        item: PendingRequest,
        scope: CancellationToken,
        epoch: u64,
    },
    WaitUntil(Instant),
    Idle,
}

/// Handle to a rate-limited request queue. Clones share the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    /// Start a queue draining into `handler`. Must be called inside a tokio runtime.
    pub fn new(handler: Arc<RequestHandler>, config: QueueConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: 0,
                last_dispatch: None,
                next_id: 1,
                epoch: 0,
                scope: CancellationToken::new(),
            }),
            wake: Notify::new(),
        });
        let shutdown = CancellationToken::new();
        let inner = Arc::new(QueueInner {
            interval: config.request_interval(),
            config,
            handler,
            shared: Arc::clone(&shared),
            shutdown: shutdown.clone(),
            tasks: TaskTracker::new(),
        });

        tokio::spawn(run_queue(Arc::downgrade(&inner), shared, shutdown));
        Self { inner }
    }

    /// Accept `request` unless the queue is full, in which case the overflow
    /// policy decides who is dropped.
    pub fn enqueue<F>(&self, request: Request, callback: F) -> EnqueueOutcome
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let max = self.inner.config.max_queue_size;
        let (outcome, dropped) = {
            let mut state = self.inner.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let item = PendingRequest {
                id,
                request,
                enqueued_at: Utc::now(),
                callback: Box::new(callback),
            };

            if state.pending.len() < max {
                state.pending.push_back(item);
                (EnqueueOutcome::Queued(id), None)
            } else {
                match self.inner.config.overflow {
                    OverflowPolicy::EvictOldest if max > 0 => {
                        let evicted = state.pending.pop_front();
                        state.pending.push_back(item);
                        let outcome = EnqueueOutcome::Evicted {
                            id,
                            evicted: evicted.as_ref().map_or(0, |e| e.id),
                        };
                        (outcome, evicted)
                    }
                    _ => (EnqueueOutcome::Rejected, Some(item)),
                }
            }
        };

        if let Some(dropped) = dropped {
            warn!(
                request_id = dropped.id,
                max_queue_size = max,
                policy = ?self.inner.config.overflow,
                "queue full, dropping request"
            );
            if self.inner.config.callback_if_not_processed {
                dropped.fail(DispatchError::NotProcessed("queue full".to_string()));
            }
        }

        if outcome.id().is_some() {
            self.inner.shared.wake.notify_one();
        }
        outcome
    }

    /// Drop every pending request, failing each through its callback.
    pub fn clear_queue(&self) -> usize {
        let drained: Vec<_> = self.inner.shared.state.lock().pending.drain(..).collect();
        let count = drained.len();
        for item in drained {
            item.fail(DispatchError::NotProcessed("queue cleared".to_string()));
        }
        if count > 0 {
            debug!(cleared = count, "queue cleared");
        }
        count
    }

    /// Remove one pending request; its callback reports [`DispatchError::Superseded`].
    pub fn remove_pending(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.inner.shared.state.lock();
            state
                .pending
                .iter()
                .position(|item| item.id == id)
                .and_then(|index| state.pending.remove(index))
        };
        match removed {
            Some(item) => {
                item.fail(DispatchError::Superseded);
                true
            }
            None => false,
        }
    }

    /// Cancel in-flight work, clear the queue and reset counters. Idempotent.
    pub fn force_stop_and_reset(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.shared.state.lock();
            state.scope.cancel();
            state.scope = CancellationToken::new();
            state.in_flight = 0;
            state.last_dispatch = None;
            state.epoch += 1;
            state.pending.drain(..).collect()
        };
        for item in drained {
            item.fail(DispatchError::Cancelled);
        }
        self.inner.shared.wake.notify_one();
    }

    /// Stop the drain loop and wait for in-flight dispatches to report.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.force_stop_and_reset();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Pending (not yet dispatched) requests
    pub fn len(&self) -> usize {
        self.inner.shared.state.lock().pending.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.shared.state.lock().in_flight
    }

    /// Start time of the most recent dispatch
    pub fn last_dispatch(&self) -> Option<Instant> {
        self.inner.shared.state.lock().last_dispatch
    }

    /// Earliest instant the next dispatch may start
    pub fn next_dispatch_at(&self) -> Option<Instant> {
        self.last_dispatch().map(|last| deadline(last, self.inner.interval))
    }

    /// Configuration in use
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Handler requests are dispatched through
    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.inner.handler
    }
}

impl QueueInner {
    fn next_step(&self, now: Instant) -> NextStep {
        let mut state = self.shared.state.lock();
        if state.pending.is_empty() {
            return NextStep::Idle;
        }
        if state.in_flight >= self.config.max_concurrent_requests.max(1) {
            return NextStep::Idle;
        }
        if let Some(last) = state.last_dispatch {
            let ready_at = deadline(last, self.interval);
            if ready_at > now {
                return NextStep::WaitUntil(ready_at);
            }
        }

        let Some(item) = state.pending.pop_front() else {
            return NextStep::Idle;
        };
        state.in_flight += 1;
        state.last_dispatch = Some(now);
        NextStep::Dispatch {
            item,
            scope: state.scope.child_token(),
            epoch: state.epoch,
        }
    }

    fn spawn_dispatch(&self, item: PendingRequest, scope: CancellationToken, epoch: u64) {
        let handler = Arc::clone(&self.handler);
        let shared = Arc::clone(&self.shared);
        debug!(
            request_id = item.id,
            correlation_id = %item.request.correlation_id(),
            waited_ms = (Utc::now() - item.enqueued_at).num_milliseconds(),
            "dequeued request"
        );

        self.tasks.spawn(async move {
            let PendingRequest {
                request, callback, ..
            } = item;
            let completion = handler.send(request, Some(scope)).await;
            {
                let mut state = shared.state.lock();
                if state.epoch == epoch {
                    state.in_flight = state.in_flight.saturating_sub(1);
                }
            }
            shared.wake.notify_one();
            callback(completion);
        });
    }
}

async fn run_queue(inner: Weak<QueueInner>, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let step = {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match inner.next_step(Instant::now()) {
                NextStep::Dispatch { item, scope, epoch } => {
                    inner.spawn_dispatch(item, scope, epoch);
                    continue;
                }
                other => other,
            }
        };

        match step {
            NextStep::WaitUntil(deadline) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            _ => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
            }
        }
    }
    debug!("request queue loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_outcome_ids() {
        assert_eq!(EnqueueOutcome::Queued(3).id(), Some(3));
        assert_eq!(EnqueueOutcome::Evicted { id: 4, evicted: 1 }.id(), Some(4));
        assert_eq!(EnqueueOutcome::Rejected.id(), None);
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(QueueConfig::default().request_interval(), Duration::from_secs(1));
    }
}
