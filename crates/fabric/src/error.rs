use std::{io, time::Duration};

use thiserror::Error;

/// Errors surfaced by the RPC fabric: codec, runtime, client, and broker.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("message has no payload")]
    MissingPayload,
    #[error("failed to decode payload: {0}")]
    PayloadDecode(#[source] serde_json::Error),
    #[error("failed to encode payload: {0}")]
    PayloadEncode(#[source] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("rpc timeout after {0:?}")]
    Timeout(Duration),
    #[error("request was cancelled")]
    Cancelled,
    #[error("reply channel closed unexpectedly")]
    ChannelClosed,
    #[error("failed to write message: {0}")]
    Write(#[source] io::Error),
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("child `{0}` stdio unavailable")]
    ChildIo(String),
    #[error("child `{0}` exited before replying")]
    ChildDead(String),
    #[error("reader already consumed; run() may only be called once")]
    ReaderConsumed,
    #[error("{0}")]
    Handler(String),
}

impl FabricError {
    /// Error text carried on an ERROR reply built from this error.
    pub fn reply_text(&self) -> String {
        self.to_string()
    }
}
