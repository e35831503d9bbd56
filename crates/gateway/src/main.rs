//! The `v2access` service: HTTP gateway process. Stdout carries fabric
//! traffic to the broker; logs go to stderr.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fabric::{RpcClient, Subprocess};
use gateway::{build_state, serve, shutdown_signal, GatewayConfig, GatewayError};

const DEFAULT_PROCESS_ID: &str = "v2access";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        error!(%err, "gateway failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), GatewayError> {
    let config = GatewayConfig::load(None)?;

    let subprocess = Arc::new(Subprocess::new(fabric::process_id(DEFAULT_PROCESS_ID)));
    let rpc = Arc::new(RpcClient::new(subprocess).with_timeout(config.rpc_timeout()));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let fabric_loop = {
        let rpc = rpc.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { rpc.run(token).await })
    };

    let state = build_state(rpc, config);
    let served = serve(state, shutdown.clone()).await;

    shutdown.cancel();
    let _ = fabric_loop.await;
    served
}
