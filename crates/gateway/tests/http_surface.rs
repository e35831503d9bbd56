//! Gateway surface exercised through `tower::ServiceExt::oneshot` with a
//! scripted fabric peer standing in for the broker and the services behind it.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use fabric::{decode_line, encode_line, Message, RpcClient, Subprocess};
use gateway::{build_router, build_state, GatewayConfig};

struct TestGateway {
    router: Router,
    seen: Arc<Mutex<Vec<String>>>,
}

async fn run_peer(reader: DuplexStream, mut writer: DuplexStream, seen: Arc<Mutex<Vec<String>>>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let msg = decode_line(line.trim_end()).unwrap();
        seen.lock().unwrap().push(msg.id.clone());
        let reply = match (msg.target.as_str(), msg.id.as_str()) {
            ("nope", _) => {
                let mut reply = Message::error_reply(&msg, "unknown target: nope");
                reply.source = "broker".to_string();
                reply
            }
            (_, "RPCListCVEs") => Message::success_reply(
                &msg,
                Some(json!({"cves": ["CVE-2021-44228"], "total": 1})),
            ),
            (_, "RPCEcho") => Message::success_reply(&msg, msg.payload.clone()),
            (_, "RPCSlowEcho") => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Message::success_reply(&msg, msg.payload.clone())
            }
            (_, "RPCBlackhole") => continue,
            _ => Message::error_reply(&msg, format!("unknown method: {}", msg.id)),
        };
        let line = encode_line(&reply).unwrap();
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn gateway_with_config(config: GatewayConfig) -> TestGateway {
    let (peer_writes, proc_reads) = duplex(64 * 1024);
    let (proc_writes, peer_reads) = duplex(64 * 1024);
    let subprocess = Arc::new(Subprocess::with_io(
        "v2access",
        Box::new(proc_reads),
        Box::new(proc_writes),
    ));
    let rpc = Arc::new(RpcClient::new(subprocess).with_timeout(config.rpc_timeout()));
    {
        let rpc = rpc.clone();
        let token = CancellationToken::new();
        tokio::spawn(async move { rpc.run(token).await });
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(run_peer(peer_reads, peer_writes, seen.clone()));

    TestGateway {
        router: build_router(build_state(rpc, config)),
        seen,
    }
}

fn test_gateway() -> TestGateway {
    gateway_with_config(GatewayConfig::default())
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn post_json(
    router: &Router,
    uri: &str,
    body: Value,
    forwarded_for: Option<&str>,
) -> (StatusCode, HeaderMap, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(ip) = forwarded_for {
        request = request.header("x-forwarded-for", ip);
    }
    let response = router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, headers, value)
}

#[tokio::test]
async fn health_probe_is_plain_ok() {
    let gw = test_gateway();
    let (status, body) = get(&gw.router, "/restful/health").await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!({"status": "ok"}));
}

#[tokio::test]
async fn path_endpoint_wraps_rpc_reply_in_envelope() {
    let gw = test_gateway();
    let (status, _, body) = post_json(
        &gw.router,
        "/restful/rpc/cve/list",
        json!({"offset": 0, "limit": 10}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retcode"], 0);
    assert_eq!(body["message"], "success");
    assert_eq!(body["payload"]["total"], 1);
    assert_eq!(body["payload"]["cves"][0], "CVE-2021-44228");
}

#[tokio::test]
async fn unknown_path_mapping_is_a_404_envelope() {
    let gw = test_gateway();
    let (status, _, body) =
        post_json(&gw.router, "/restful/rpc/cve/bogus", json!({}), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["retcode"], 404);
    assert_eq!(body["payload"], Value::Null);
}

#[tokio::test]
async fn generic_endpoint_requires_a_method() {
    let gw = test_gateway();
    let (status, _, body) = post_json(&gw.router, "/restful/rpc", json!({}), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retcode"], 400);
    assert!(body["message"].as_str().unwrap().contains("Invalid request"));
    assert_eq!(body["payload"], Value::Null);
}

#[tokio::test]
async fn malformed_body_is_a_400_envelope() {
    let gw = test_gateway();
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/restful/rpc")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["retcode"], 400);
}

#[tokio::test]
async fn unknown_target_error_reply_keeps_http_200() {
    let gw = test_gateway();
    let (status, _, body) = post_json(
        &gw.router,
        "/restful/rpc",
        json!({"method": "RPCAnything", "target": "nope"}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["retcode"], 0);
    assert!(body["message"].as_str().unwrap().contains("unknown target"));
    assert_eq!(body["payload"], Value::Null);
}

#[tokio::test]
async fn generic_endpoint_defaults_the_target_to_the_broker() {
    let gw = test_gateway();
    let (status, _, body) = post_json(
        &gw.router,
        "/restful/rpc",
        json!({"method": "RPCEcho", "params": {"ping": true}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retcode"], 0);
    assert_eq!(body["payload"]["ping"], true);
}

#[tokio::test]
async fn rpc_timeout_surfaces_as_nonzero_retcode() {
    let mut config = GatewayConfig::default();
    config.rpc_timeout_secs = 1;
    let gw = gateway_with_config(config);

    let (status, _, body) = post_json(
        &gw.router,
        "/restful/rpc",
        json!({"method": "RPCBlackhole", "target": "local"}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["retcode"], 0);
    assert!(body["message"].as_str().unwrap().contains("timeout"));
}

#[tokio::test]
async fn rate_limit_denies_the_third_burst_request() {
    let mut config = GatewayConfig::default();
    config.rate_limit.max_tokens = 2;
    config.rate_limit.refill_interval_secs = 1;
    let gw = gateway_with_config(config);

    for _ in 0..2 {
        let (status, _, body) = post_json(
            &gw.router,
            "/restful/rpc/cve/list",
            json!({"offset": 0}),
            Some("198.51.100.9"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retcode"], 0);
    }

    let (status, headers, body) = post_json(
        &gw.router,
        "/restful/rpc/cve/list",
        json!({"offset": 0}),
        Some("198.51.100.9"),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["retcode"], 429);
    assert_eq!(body["message"], "Rate limit exceeded. Please retry later.");
    assert_eq!(headers.get("Retry-After").unwrap(), "1");
    assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "2");

    // A different client is unaffected.
    let (status, _, _) = post_json(
        &gw.router,
        "/restful/rpc/cve/list",
        json!({"offset": 0}),
        Some("203.0.113.5"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_bypasses_the_rate_limiter() {
    let mut config = GatewayConfig::default();
    config.rate_limit.max_tokens = 1;
    let gw = gateway_with_config(config);

    for _ in 0..5 {
        let (status, _) = get(&gw.router, "/restful/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn spa_fallback_serves_index_for_deep_paths_but_not_api() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "INDEX").unwrap();

    let mut config = GatewayConfig::default();
    config.static_dir = Some(dir.path().to_path_buf());
    let gw = gateway_with_config(config);

    let (status, body) = get(&gw.router, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"INDEX");

    let (status, body) = get(&gw.router, "/some/deep/path").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"INDEX");

    let (status, _) = get(&gw.router, "/restful/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn dropped_http_request_does_not_cancel_the_rpc() {
    let gw = test_gateway();

    let request = Request::builder()
        .method("POST")
        .uri("/restful/rpc")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"method": "RPCSlowEcho", "target": "local", "params": {"n": 1}}).to_string(),
        ))
        .unwrap();

    // Poll the response future just long enough for the request to go out,
    // then drop it the way hyper does when the client disconnects.
    let response = gw.router.clone().oneshot(request);
    let _ = tokio::time::timeout(Duration::from_millis(20), response).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        gw.seen.lock().unwrap().iter().any(|m| m == "RPCSlowEcho"),
        "rpc never reached the fabric"
    );

    // The fabric stays healthy for the next caller.
    let (status, _, body) = post_json(
        &gw.router,
        "/restful/rpc",
        json!({"method": "RPCEcho", "target": "local", "params": {"n": 2}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retcode"], 0);
    assert_eq!(body["payload"]["n"], 2);
}
