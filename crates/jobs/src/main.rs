//! The `meta` service: hosts the CWE import job controller behind fabric
//! handlers. Spawned by the broker with `PROCESS_ID=meta`.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fabric::{
    handler_fn, require_str_field, unmarshal_payload, FabricError, Message, RpcClient, Subprocess,
};
use jobs::{JobConfig, JobController, JobParams};

const DEFAULT_PROCESS_ID: &str = "meta";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        error!(%err, "meta service failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), FabricError> {
    let subprocess = Arc::new(Subprocess::new(fabric::process_id(DEFAULT_PROCESS_ID)));
    let rpc = Arc::new(RpcClient::new(subprocess.clone()));
    let controller = JobController::new(rpc.clone(), JobConfig::default());

    register_job_handlers(&subprocess, &controller);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    rpc.run(shutdown).await
}

async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    token.cancel();
}

fn register_job_handlers(subprocess: &Arc<Subprocess>, controller: &Arc<JobController>) {
    let ctrl = controller.clone();
    subprocess.register_handler(
        "RPCStartCWEJob",
        handler_fn(move |_token, req| {
            let ctrl = ctrl.clone();
            async move {
                let params: JobParams = match req.payload {
                    Some(_) => unmarshal_payload(&req)?,
                    None => JobParams::default(),
                };
                let session_id = ctrl
                    .start(params)
                    .map_err(|err| FabricError::Handler(err.to_string()))?;
                Ok(Some(Message::success_reply(
                    &req,
                    Some(json!({"session_id": session_id})),
                )))
            }
        }),
    );

    let ctrl = controller.clone();
    subprocess.register_handler(
        "RPCStopCWEJob",
        handler_fn(move |_token, req| {
            let ctrl = ctrl.clone();
            async move {
                let payload = req.payload.clone().ok_or(FabricError::MissingPayload)?;
                let session_id = require_str_field(&payload, "session_id")?.to_string();
                ctrl.stop(&session_id)
                    .map_err(|err| FabricError::Handler(err.to_string()))?;
                Ok(Some(Message::success_reply(
                    &req,
                    Some(json!({"stopped": session_id})),
                )))
            }
        }),
    );

    let ctrl = controller.clone();
    subprocess.register_handler(
        "RPCJobStatus",
        handler_fn(move |_token, req| {
            let ctrl = ctrl.clone();
            async move {
                let status = fabric::marshal_payload(&ctrl.status())?;
                Ok(Some(Message::success_reply(&req, Some(status))))
            }
        }),
    );
}
