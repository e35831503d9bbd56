//! Correlated request/response on top of [`Subprocess`].
//!
//! Every process that initiates RPCs embeds one [`RpcClient`]. Replies are
//! matched to callers through a waiter map keyed by correlation ID; each
//! waiter is a oneshot channel, so delivery is at most once by construction.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    broker::BROKER_ID,
    message::{self, Message},
    subprocess::Subprocess,
    FabricError,
};

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

type Waiters = Arc<StdMutex<HashMap<String, oneshot::Sender<Message>>>>;

/// RPC initiator bound to one subprocess runtime.
pub struct RpcClient {
    subprocess: Arc<Subprocess>,
    waiters: Waiters,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(subprocess: Arc<Subprocess>) -> Self {
        Self {
            subprocess,
            waiters: Arc::new(StdMutex::new(HashMap::new())),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Overrides the per-call reply timeout (default 30 s). The timeout is
    /// enforced even when the caller's token never fires.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn subprocess(&self) -> &Arc<Subprocess> {
        &self.subprocess
    }

    /// Installs the reply dispatcher and drives the underlying runtime until
    /// cancellation or EOF.
    pub async fn run(&self, token: CancellationToken) -> Result<(), FabricError> {
        let waiters = self.waiters.clone();
        self.subprocess.set_response_hook(Arc::new(move |msg| {
            let sender = waiters
                .lock()
                .expect("waiter map poisoned")
                .remove(&msg.correlation_id);
            match sender {
                // A dropped receiver (timed-out caller) is fine; the entry is
                // already gone either way.
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => debug!(
                    correlation_id = %msg.correlation_id,
                    "no waiter for reply; dropping"
                ),
            }
        }));
        self.subprocess.run(token).await
    }

    /// Sends `method` to `target` and waits for the correlated reply.
    ///
    /// ERROR replies are returned as messages, not as `Err`; callers classify
    /// with [`Message::is_error`]. `Err` is reserved for marshal failures,
    /// write failures, cancellation, and timeout — and in every one of those
    /// paths the waiter entry is removed before returning.
    pub async fn invoke_rpc_with_target<P: Serialize>(
        &self,
        token: &CancellationToken,
        target: &str,
        method: &str,
        params: &P,
    ) -> Result<Message, FabricError> {
        let payload = message::marshal_payload(params)?;
        let correlation_id = Uuid::new_v4().to_string();

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter map poisoned")
            .insert(correlation_id.clone(), tx);

        let mut request = Message::request(method, self.subprocess.id(), target, Some(payload));
        request.correlation_id = correlation_id.clone();

        if let Err(err) = self.subprocess.send(&request).await {
            self.remove_waiter(&correlation_id);
            return Err(err);
        }

        let outcome = tokio::select! {
            reply = rx => reply.map_err(|_| FabricError::ChannelClosed),
            _ = token.cancelled() => Err(FabricError::Cancelled),
            _ = tokio::time::sleep(self.timeout) => Err(FabricError::Timeout(self.timeout)),
        };
        self.remove_waiter(&correlation_id);
        outcome
    }

    /// Sugar for requests addressed to the broker itself.
    pub async fn invoke_rpc<P: Serialize>(
        &self,
        token: &CancellationToken,
        method: &str,
        params: &P,
    ) -> Result<Message, FabricError> {
        self.invoke_rpc_with_target(token, BROKER_ID, method, params)
            .await
    }

    fn remove_waiter(&self, correlation_id: &str) {
        self.waiters
            .lock()
            .expect("waiter map poisoned")
            .remove(correlation_id);
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.lock().expect("waiter map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    struct SilentPeer {
        client: Arc<RpcClient>,
        token: CancellationToken,
        // Held so the pipes stay open; the peer simply never answers.
        _to_client: tokio::io::DuplexStream,
        _from_client: tokio::io::DuplexStream,
    }

    fn client_with_silent_peer(timeout: Duration) -> SilentPeer {
        let (to_client, proc_reads) = duplex(4096);
        let (proc_writes, from_client) = duplex(4096);
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
        SilentPeer {
            client,
            token,
            _to_client: to_client,
            _from_client: from_client,
        }
    }

    #[tokio::test]
    async fn waiter_is_removed_on_timeout() {
        let peer = client_with_silent_peer(Duration::from_millis(20));
        let result = peer
            .client
            .invoke_rpc_with_target(&peer.token, "local", "RPCNeverReplies", &json!({}))
            .await;
        assert!(matches!(result, Err(FabricError::Timeout(_))));
        assert_eq!(peer.client.waiter_count(), 0);
    }

    #[tokio::test]
    async fn waiter_is_removed_on_cancellation() {
        let peer = client_with_silent_peer(Duration::from_secs(30));
        let call_token = CancellationToken::new();
        call_token.cancel();
        let result = peer
            .client
            .invoke_rpc_with_target(&call_token, "local", "RPCSlowQuery", &json!({}))
            .await;
        assert!(matches!(result, Err(FabricError::Cancelled)));
        assert_eq!(peer.client.waiter_count(), 0);
    }

    #[tokio::test]
    async fn waiter_is_removed_on_send_failure() {
        // A closed write side makes send fail after the waiter registered.
        let (_peer_writes, proc_reads) = duplex(4096);
        let (proc_writes, peer_reads) = duplex(4096);
        drop(peer_reads);
        let subprocess = Arc::new(Subprocess::with_io(
            "v2access",
            Box::new(proc_reads),
            Box::new(proc_writes),
        ));
        let client = RpcClient::new(subprocess);
        let token = CancellationToken::new();

        let result = client
            .invoke_rpc_with_target(&token, "local", "RPCPing", &json!({}))
            .await;
        assert!(matches!(result, Err(FabricError::Write(_))));
        assert_eq!(client.waiter_count(), 0);
    }

    #[tokio::test]
    async fn marshal_failure_produces_no_traffic() {
        let peer = client_with_silent_peer(Duration::from_secs(5));
        let unserializable = std::collections::HashMap::from([(vec![1u8], "x")]);
        let result = peer
            .client
            .invoke_rpc_with_target(&peer.token, "local", "RPCPing", &unserializable)
            .await;
        assert!(matches!(result, Err(FabricError::PayloadEncode(_))));
        assert_eq!(peer.client.waiter_count(), 0);
    }
}
