//! Re-issues one logical request on a fixed cadence through a queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::Completion;
use super::queue::RequestQueue;
use super::request::Request;
use super::retry::deadline;

/// Callback shared by every tick of a periodic request.
pub type PeriodicCallback = Arc<dyn Fn(Completion) + Send + Sync + 'static>;

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives at most one periodic request at a time.
pub struct PeriodicDriver {
    queue: RequestQueue,
    running: Mutex<Option<RunningLoop>>,
}

impl PeriodicDriver {
    /// Driver that enqueues through `queue`.
    pub fn new(queue: RequestQueue) -> Self {
        Self {
            queue,
            running: Mutex::new(None),
        }
    }

    /// Start issuing `request` every `interval`, replacing any running loop.
    ///
    /// The previous loop is fully stopped before the new one starts. The first
    /// tick fires immediately; later ticks wait for both the interval and the
    /// queue's own rate-limit window.
    pub async fn set_periodic_request<F>(&self, request: Request, interval: Duration, callback: F)
    where
        F: Fn(Completion) + Send + Sync + 'static,
    {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            stop_loop(previous).await;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_periodic(
            self.queue.clone(),
            request,
            interval,
            Arc::new(callback),
            cancel.clone(),
        ));
        *running = Some(RunningLoop { cancel, handle });
    }

    /// Stop the running loop, if any.
    pub async fn stop(&self) {
        if let Some(previous) = self.running.lock().await.take() {
            stop_loop(previous).await;
        }
    }

    /// Whether a loop is currently installed
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }
}

async fn stop_loop(running: RunningLoop) {
    running.cancel.cancel();
    let _ = running.handle.await;
    debug!("periodic loop stopped");
}

async fn run_periodic(
    queue: RequestQueue,
    request: Request,
    interval: Duration,
    callback: PeriodicCallback,
    cancel: CancellationToken,
) {
    info!(
        process_id = %request.process_id(),
        interval_ms = interval.as_millis() as u64,
        "periodic request started"
    );

    let mut next_tick = Instant::now();
    'ticks: loop {
        // Wait out both our own interval and the queue's rate-limit window.
        loop {
            let ready_at = match queue.next_dispatch_at() {
                Some(queue_ready) if queue_ready > next_tick => queue_ready,
                _ => next_tick,
            };
            if ready_at <= Instant::now() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'ticks,
                _ = tokio::time::sleep_until(ready_at) => {}
            }
        }
        if cancel.is_cancelled() {
            break;
        }

        let tick = request.reissue();
        let callback = Arc::clone(&callback);
        let outcome = queue.enqueue(tick, move |completion| callback(completion));
        debug!(?outcome, "periodic request enqueued");

        next_tick = deadline(Instant::now(), interval);
    }
}
