mod common;

use common::{FakeHttp, Reply, assert_at, transport};
use courier::client::{GraphQlClient, GraphQlConfig, GraphQlError, TransactionQuery};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const NODES: &str = r#"{"data":{"transactions":{"edges":[
    {"node":{"id":"tx-1","recipient":"proc-1","tags":[{"name":"Action","value":"Credit-Notice"}]}}
]}}}"#;

fn config(rounds: u32) -> GraphQlConfig {
    GraphQlConfig {
        endpoints: vec!["http://primary/graphql".into(), "http://backup/graphql".into()],
        round_delays_secs: vec![3.0],
        max_rounds: rounds,
    }
}

#[tokio::test(start_paused = true)]
async fn falls_back_to_next_endpoint() {
    let http = Arc::new(FakeHttp::always(NODES).push(Reply::status(502, "bad gateway")));
    let client = GraphQlClient::new(config(2), transport(&http));

    let query = TransactionQuery::new()
        .recipient("proc-1")
        .tag("Action", ["Credit-Notice"])
        .first(1);
    let nodes = client.transactions(&query, None).await.expect("nodes");

    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, "tx-1");
    assert_eq!(nodes[0].tag("Action"), Some("Credit-Notice"));

    let urls: Vec<_> = http.calls().into_iter().map(|c| c.url).collect();
    assert_eq!(urls, vec!["http://primary/graphql", "http://backup/graphql"]);
    let body = http.calls()[1].body.clone().expect("body");
    assert!(body["query"].as_str().expect("query").contains("recipients"));
}

#[tokio::test(start_paused = true)]
async fn graphql_errors_count_as_endpoint_failure() {
    let http = Arc::new(
        FakeHttp::always(NODES).push(Reply::ok(r#"{"errors":[{"message":"timeout"}]}"#)),
    );
    let client = GraphQlClient::new(config(1), transport(&http));

    let data = client.query("query { x }", None).await.expect("backup answers");
    assert!(data.get("transactions").is_some());
    assert_eq!(http.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_rounds_back_off_then_fail() {
    let http = Arc::new(FakeHttp::new(|_| Reply::status(500, "down")));
    let client = GraphQlClient::new(config(2), transport(&http));

    let start = Instant::now();
    let err = client.query("query { x }", None).await.expect_err("all down");
    assert!(matches!(err, GraphQlError::Exhausted { rounds: 2, .. }));

    let calls = http.calls();
    assert_eq!(calls.len(), 4);
    assert_at(start, calls[1].at, 0.0);
    assert_at(start, calls[2].at, 3.0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_between_rounds() {
    let http = Arc::new(FakeHttp::new(|_| Reply::status(500, "down")));
    let client = GraphQlClient::new(config(5), transport(&http));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = client.query("query { x }", Some(cancel)).await.expect_err("cancelled");
    assert!(matches!(err, GraphQlError::Cancelled));
    assert_eq!(http.call_count(), 2);
}

#[tokio::test]
async fn no_endpoints_is_an_error() {
    let http = Arc::new(FakeHttp::always(NODES));
    let client = GraphQlClient::new(
        GraphQlConfig {
            endpoints: Vec::new(),
            ..config(1)
        },
        transport(&http),
    );
    assert!(matches!(
        client.query("query { x }", None).await,
        Err(GraphQlError::NoEndpoints)
    ));
}
