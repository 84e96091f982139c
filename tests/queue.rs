mod common;

use common::{FakeHttp, OK_BODY, Reply, assert_at, transport};
use courier::client::{
    Completion, DispatchError, EnqueueOutcome, HandlerConfig, OverflowPolicy, PeriodicDriver,
    QueueConfig, Request, RequestHandler, RequestQueue, StaticIdentity, WalletInfo,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn queue(http: &Arc<FakeHttp>, config: QueueConfig) -> RequestQueue {
    let identity = Arc::new(StaticIdentity::with_default(WalletInfo::new("alice")));
    let handler = RequestHandler::new(
        HandlerConfig {
            resend_delays_secs: vec![1.0],
            refresh_after_secs: None,
            ..HandlerConfig::default()
        },
        identity,
        transport(http),
    );
    RequestQueue::new(Arc::new(handler), config)
}

fn queue_config(max: usize, concurrent: usize, interval: f64) -> QueueConfig {
    QueueConfig {
        max_queue_size: max,
        max_concurrent_requests: concurrent,
        request_interval_secs: interval,
        ..QueueConfig::default()
    }
}

fn collector() -> (
    impl Fn(&'static str) -> Box<dyn FnOnce(Completion) + Send>,
    mpsc::UnboundedReceiver<(&'static str, Completion)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let make = move |label: &'static str| {
        let tx = tx.clone();
        Box::new(move |completion: Completion| {
            let _ = tx.send((label, completion));
        }) as Box<dyn FnOnce(Completion) + Send>
    };
    (make, rx)
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_newest_and_reports_it() {
    let http = Arc::new(FakeHttp::always(OK_BODY));
    let queue = queue(&http, queue_config(2, 1, 1.0));
    let (callback, mut results) = collector();

    assert!(matches!(
        queue.enqueue(Request::dry_run("p"), callback("a")),
        EnqueueOutcome::Queued(_)
    ));
    assert!(matches!(
        queue.enqueue(Request::dry_run("p"), callback("b")),
        EnqueueOutcome::Queued(_)
    ));
    assert_eq!(
        queue.enqueue(Request::dry_run("p"), callback("c")),
        EnqueueOutcome::Rejected
    );
    assert_eq!(queue.len(), 2);

    let (label, completion) = results.recv().await.expect("dropped callback");
    assert_eq!(label, "c");
    let failure = completion.expect_err("not processed");
    assert!(matches!(failure.error, DispatchError::NotProcessed(_)));

    let mut processed = Vec::new();
    for _ in 0..2 {
        let (label, completion) = results.recv().await.expect("processed");
        completion.expect("success");
        processed.push(label);
    }
    assert_eq!(processed, vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn full_queue_evicts_oldest_when_configured() {
    let http = Arc::new(FakeHttp::always(OK_BODY));
    let config = QueueConfig {
        overflow: OverflowPolicy::EvictOldest,
        ..queue_config(2, 1, 1.0)
    };
    let queue = queue(&http, config);
    let (callback, mut results) = collector();

    let first = queue.enqueue(Request::dry_run("p"), callback("a")).id();
    queue.enqueue(Request::dry_run("p"), callback("b"));
    let outcome = queue.enqueue(Request::dry_run("p"), callback("c"));

    match outcome {
        EnqueueOutcome::Evicted { evicted, .. } => assert_eq!(Some(evicted), first),
        other => panic!("expected eviction, got {other:?}"),
    }
    assert_eq!(queue.len(), 2);

    let (label, completion) = results.recv().await.expect("evicted callback");
    assert_eq!(label, "a");
    assert!(matches!(
        completion.expect_err("evicted").error,
        DispatchError::NotProcessed(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn dispatch_starts_are_spaced_by_interval() {
    let http = Arc::new(FakeHttp::always(OK_BODY));
    let queue = queue(&http, queue_config(10, 1, 1.0));
    let (callback, mut results) = collector();

    let start = Instant::now();
    for label in ["a", "b", "c"] {
        queue.enqueue(Request::dry_run("p"), callback(label));
    }
    for _ in 0..3 {
        results.recv().await.expect("result").1.expect("success");
    }

    let calls = http.calls();
    for (call, expected) in calls.iter().zip([0.0, 1.0, 2.0]) {
        assert_at(start, call.at, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_holds_back_dispatch_until_a_slot_frees() {
    let http = Arc::new(FakeHttp::new(|_| {
        Reply::ok(OK_BODY).after(Duration::from_secs(5))
    }));
    let queue = queue(&http, queue_config(10, 2, 1.0));
    let (callback, mut results) = collector();

    let start = Instant::now();
    for label in ["a", "b", "c"] {
        queue.enqueue(Request::dry_run("p"), callback(label));
    }
    for _ in 0..3 {
        results.recv().await.expect("result").1.expect("success");
    }

    let calls = http.calls();
    assert_eq!(calls.len(), 3);
    assert_at(start, calls[0].at, 0.0);
    assert_at(start, calls[1].at, 1.0);
    assert_at(start, calls[2].at, 5.0);
}

#[tokio::test(start_paused = true)]
async fn force_stop_and_reset_then_enqueue_runs_normally() {
    let http = Arc::new(
        FakeHttp::always(OK_BODY).push(Reply::ok(OK_BODY).after(Duration::from_secs(30))),
    );
    let queue = queue(&http, queue_config(10, 1, 1.0));
    let (callback, mut results) = collector();

    queue.enqueue(Request::dry_run("p"), callback("in-flight"));
    queue.enqueue(Request::dry_run("p"), callback("pending"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(queue.in_flight(), 1);

    queue.force_stop_and_reset();
    assert!(queue.is_empty());
    assert_eq!(queue.in_flight(), 0);

    let mut cancelled = Vec::new();
    for _ in 0..2 {
        let (label, completion) = results.recv().await.expect("cancelled callback");
        assert!(matches!(
            completion.expect_err("cancelled").error,
            DispatchError::Cancelled
        ));
        cancelled.push(label);
    }
    cancelled.sort();
    assert_eq!(cancelled, vec!["in-flight", "pending"]);

    queue.enqueue(Request::dry_run("p"), callback("after"));
    let (label, completion) = results.recv().await.expect("fresh callback");
    assert_eq!(label, "after");
    completion.expect("processed after reset");
}

#[tokio::test(start_paused = true)]
async fn clear_and_remove_pending_fail_through_callbacks() {
    let http = Arc::new(FakeHttp::always(OK_BODY));
    let queue = queue(&http, queue_config(10, 1, 1.0));
    let (callback, mut results) = collector();

    let a = queue.enqueue(Request::dry_run("p"), callback("a")).id().expect("id");
    queue.enqueue(Request::dry_run("p"), callback("b"));
    queue.enqueue(Request::dry_run("p"), callback("c"));

    assert!(queue.remove_pending(a));
    assert!(!queue.remove_pending(a));
    assert_eq!(queue.clear_queue(), 2);

    let (label, completion) = results.recv().await.expect("removed");
    assert_eq!(label, "a");
    assert!(matches!(
        completion.expect_err("superseded").error,
        DispatchError::Superseded
    ));
    for _ in 0..2 {
        let (_, completion) = results.recv().await.expect("cleared");
        assert!(matches!(
            completion.expect_err("cleared").error,
            DispatchError::NotProcessed(_)
        ));
    }
    assert_eq!(http.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn periodic_request_ticks_until_stopped() {
    let http = Arc::new(FakeHttp::always(OK_BODY));
    let queue = queue(&http, queue_config(10, 1, 1.0));
    let driver = PeriodicDriver::new(queue.clone());
    let ticks = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&ticks);
    driver
        .set_periodic_request(
            Request::dry_run("p").tag("Action", "Balance"),
            Duration::from_secs(2),
            move |completion| seen.lock().push(completion.is_ok()),
        )
        .await;
    assert!(driver.is_running().await);

    tokio::time::sleep(Duration::from_secs(5)).await;
    driver.stop().await;
    assert!(!driver.is_running().await);
    assert_eq!(*ticks.lock(), vec![true, true, true]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(ticks.lock().len(), 3);

    let calls = http.calls();
    let ids: Vec<_> = calls
        .iter()
        .map(|call| call.body.as_ref().expect("body")["Id"].clone())
        .collect();
    assert_ne!(ids[0], ids[1], "each tick is a fresh request");
}

#[tokio::test(start_paused = true)]
async fn periodic_request_respects_queue_spacing() {
    let http = Arc::new(FakeHttp::always(OK_BODY));
    let queue = queue(&http, queue_config(10, 1, 2.0));
    let driver = PeriodicDriver::new(queue.clone());

    let start = Instant::now();
    driver
        .set_periodic_request(Request::dry_run("p"), Duration::from_millis(500), |_| {})
        .await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    driver.stop().await;

    let calls = http.calls();
    assert_eq!(calls.len(), 3);
    for (call, expected) in calls.iter().zip([0.0, 2.0, 4.0]) {
        assert_at(start, call.at, expected);
    }
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn replacing_periodic_request_stops_the_previous_loop() {
    let http = Arc::new(FakeHttp::always(OK_BODY));
    let queue = queue(&http, queue_config(10, 1, 0.0));
    let driver = PeriodicDriver::new(queue);

    driver
        .set_periodic_request(Request::dry_run("first"), Duration::from_secs(1), |_| {})
        .await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    driver
        .set_periodic_request(Request::dry_run("second"), Duration::from_secs(1), |_| {})
        .await;
    tokio::time::sleep(Duration::from_millis(2500)).await;
    driver.stop().await;

    let calls = http.calls();
    let first: Vec<_> = calls.iter().filter(|c| c.url.ends_with("first")).collect();
    let second: Vec<_> = calls.iter().filter(|c| c.url.ends_with("second")).collect();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 3);
}
