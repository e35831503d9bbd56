//! End-to-end client flows over in-memory pipes: a scripted peer plays the
//! role of the broker-plus-remote-service side of the link.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;

use fabric::{decode_line, encode_line, FabricError, Message, RpcClient, Subprocess};

struct Harness {
    client: Arc<RpcClient>,
    token: CancellationToken,
    peer_reads: BufReader<DuplexStream>,
    peer_writes: DuplexStream,
}

fn harness(timeout: Duration) -> Harness {
    let (peer_writes, proc_reads) = duplex(16 * 1024);
    let (proc_writes, peer_reads) = duplex(16 * 1024);
    let subprocess = Arc::new(Subprocess::with_io(
        "v2access",
        Box::new(proc_reads),
        Box::new(proc_writes),
    ));
    let client = Arc::new(RpcClient::new(subprocess).with_timeout(timeout));
    let token = CancellationToken::new();
    {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move { client.run(token).await });
    }
    Harness {
        client,
        token,
        peer_reads: BufReader::new(peer_reads),
        peer_writes,
    }
}

async fn read_request(reader: &mut BufReader<DuplexStream>) -> Message {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    decode_line(line.trim_end()).unwrap()
}

async fn write_message(writer: &mut DuplexStream, msg: &Message) {
    let line = encode_line(msg).unwrap();
    writer.write_all(line.as_bytes()).await.unwrap();
}

#[tokio::test]
async fn request_reply_round_trip() {
    let mut h = harness(Duration::from_secs(5));

    let call = {
        let client = h.client.clone();
        let token = h.token.clone();
        tokio::spawn(async move {
            client
                .invoke_rpc_with_target(&token, "local", "RPCListCVEs", &json!({"offset": 0}))
                .await
        })
    };

    let request = read_request(&mut h.peer_reads).await;
    assert_eq!(request.id, "RPCListCVEs");
    assert_eq!(request.source, "v2access");
    assert_eq!(request.target, "local");
    assert!(!request.correlation_id.is_empty());

    let reply = Message::success_reply(&request, Some(json!({"cves": [], "total": 0})));
    write_message(&mut h.peer_writes, &reply).await;

    let got = call.await.unwrap().unwrap();
    assert!(got.is_error().is_none());
    assert_eq!(got.payload.unwrap()["total"], 0);
}

#[tokio::test]
async fn correlation_ids_are_unique_across_calls() {
    let mut h = harness(Duration::from_secs(5));

    let mut seen = std::collections::HashSet::new();
    for _ in 0..16 {
        let call = {
            let client = h.client.clone();
            let token = h.token.clone();
            tokio::spawn(async move {
                client
                    .invoke_rpc_with_target(&token, "local", "RPCPing", &json!({}))
                    .await
            })
        };
        let request = read_request(&mut h.peer_reads).await;
        assert!(
            seen.insert(request.correlation_id.clone()),
            "correlation id reused: {}",
            request.correlation_id
        );
        write_message(&mut h.peer_writes, &Message::success_reply(&request, None)).await;
        call.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn timeout_returns_error_and_clears_waiter() {
    let mut h = harness(Duration::from_millis(50));

    let started = std::time::Instant::now();
    let result = h
        .client
        .invoke_rpc_with_target(&h.token, "local", "RPCNeverReplies", &json!({}))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(FabricError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(150), "took {elapsed:?}");

    // The request did go out; the waiter must be gone regardless.
    let request = read_request(&mut h.peer_reads).await;
    assert_eq!(request.id, "RPCNeverReplies");
}

#[tokio::test]
async fn late_and_duplicate_replies_are_dropped() {
    let mut h = harness(Duration::from_secs(5));

    let call = {
        let client = h.client.clone();
        let token = h.token.clone();
        tokio::spawn(async move {
            client
                .invoke_rpc_with_target(&token, "local", "RPCGetCWE", &json!({"id": "CWE-79"}))
                .await
        })
    };

    let request = read_request(&mut h.peer_reads).await;
    let first = Message::success_reply(&request, Some(json!({"id": "CWE-79"})));
    let duplicate = Message::error_reply(&request, "should never be seen");
    write_message(&mut h.peer_writes, &first).await;
    write_message(&mut h.peer_writes, &duplicate).await;

    let got = call.await.unwrap().unwrap();
    assert!(got.is_error().is_none(), "duplicate overtook first reply");

    // A reply for a finished correlation must not disturb later calls.
    let call = {
        let client = h.client.clone();
        let token = h.token.clone();
        tokio::spawn(async move {
            client
                .invoke_rpc_with_target(&token, "local", "RPCPing", &json!({}))
                .await
        })
    };
    let request = read_request(&mut h.peer_reads).await;
    write_message(&mut h.peer_writes, &Message::success_reply(&request, None)).await;
    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_wins_over_pending_reply() {
    let mut h = harness(Duration::from_secs(30));

    let call_token = CancellationToken::new();
    let call = {
        let client = h.client.clone();
        let token = call_token.clone();
        tokio::spawn(async move {
            client
                .invoke_rpc_with_target(&token, "local", "RPCSlowQuery", &json!({}))
                .await
        })
    };

    let _request = read_request(&mut h.peer_reads).await;
    call_token.cancel();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(FabricError::Cancelled)));
}

#[tokio::test]
async fn error_reply_surfaces_as_message_not_err() {
    let mut h = harness(Duration::from_secs(5));

    let call = {
        let client = h.client.clone();
        let token = h.token.clone();
        tokio::spawn(async move {
            client
                .invoke_rpc_with_target(&token, "remote", "RPCFetchCVEs", &json!({"page": 1}))
                .await
        })
    };

    let request = read_request(&mut h.peer_reads).await;
    write_message(
        &mut h.peer_writes,
        &Message::error_reply(&request, "NVD_RATE_LIMITED: retry after 30s"),
    )
    .await;

    let got = call.await.unwrap().unwrap();
    assert_eq!(got.is_error(), Some("NVD_RATE_LIMITED: retry after 30s"));
}
