use courier::client::{
    ClientConfig, ComputeQuery, Courier, DispatchError, Request, StaticIdentity, TransportError,
    ValidationPolicy, WalletInfo,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn courier(server: &MockServer) -> Courier {
    let mut config = ClientConfig::default();
    config.handler.dry_run_url = format!("{}/dry-run?process-id=", server.uri());
    config.handler.hyperbeam.base_url = server.uri();
    config.handler.max_attempts = Some(1);
    let identity = Arc::new(StaticIdentity::with_default(WalletInfo::new("alice")));
    Courier::connect(config, identity).expect("client")
}

#[tokio::test]
async fn dry_run_round_trip_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dry-run"))
        .and(query_param("process-id", "proc-1"))
        .and(body_partial_json(json!({
            "Target": "proc-1",
            "Owner": "alice",
            "Tags": [{"name": "Action", "value": "Ping"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Messages": [{"Data": "pong", "Tags": [{"name": "Action", "value": "Pong"}]}],
            "Output": {"data": "", "print": false},
            "GasUsed": 12
        })))
        .expect(1)
        .mount(&server)
        .await;

    let courier = courier(&server);
    let envelope = courier
        .send(Request::dry_run("proc-1").tag("Action", "Ping"))
        .await
        .expect("dry run");

    assert_eq!(envelope.messages[0].data.as_deref(), Some("pong"));
    assert_eq!(envelope.messages[0].tag("Action"), Some("Pong"));
    assert_eq!(envelope.gas_used, 12);
}

#[tokio::test]
async fn http_error_status_is_a_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/dry-run"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let failure = courier(&server)
        .send(Request::dry_run("proc-1"))
        .await
        .expect_err("503");
    match failure.error {
        DispatchError::Transport(TransportError::Status { status, body, .. }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "busy");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn compute_path_unwraps_nested_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/proc-1~process@1.0/compute/cache/info"))
        .and(query_param("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "body": {"json": {"body": "{\"Output\":{\"data\":\"x\"}}"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let envelope = courier(&server)
        .send(
            Request::compute_path("proc-1", ComputeQuery::cached("info"))
                .validation(ValidationPolicy::lenient()),
        )
        .await
        .expect("compute path");
    assert_eq!(envelope.output.data.as_deref(), Some("x"));
}
