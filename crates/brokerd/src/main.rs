//! The broker daemon: parent of the platform's service tree.
//!
//! Reads a TOML roster of children, spawns each with `PROCESS_ID` set, routes
//! messages between them until SIGINT/SIGTERM, then drains and kills within
//! the grace period. Answers `RPCBrokerStatus` itself.

use std::{
    env, io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fabric::{handler_fn, Broker, FabricError, Message};

const CONFIG_PATH_ENV: &str = "BROKER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "broker.toml";

#[derive(Debug, Error)]
enum BrokerdError {
    #[error("failed to read config `{path}`: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config `{path}`: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BrokerConfig {
    grace_secs: u64,
    #[serde(rename = "child")]
    children: Vec<ChildSpec>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            grace_secs: 10,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChildSpec {
    id: String,
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

impl BrokerConfig {
    fn load() -> Result<Self, BrokerdError> {
        let path = env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if !path.is_file() {
            info!(?path, "no broker config found; starting with empty roster");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| BrokerdError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| BrokerdError::ConfigParse { path, source })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        error!(%err, "broker failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BrokerdError> {
    let config = BrokerConfig::load()?;
    let broker = Arc::new(Broker::new());
    let started_at = Instant::now();

    let weak = Arc::downgrade(&broker);
    broker.register_handler(
        "RPCBrokerStatus",
        handler_fn(move |_token, req| {
            let weak = weak.clone();
            async move {
                let Some(broker) = weak.upgrade() else {
                    return Err(FabricError::Handler("broker shutting down".to_string()));
                };
                let routes = broker.route_ids().await;
                Ok(Some(Message::success_reply(
                    &req,
                    Some(json!({
                        "routes": routes,
                        "uptime_secs": started_at.elapsed().as_secs(),
                    })),
                )))
            }
        }),
    );

    for child in &config.children {
        broker
            .spawn_rpc(child.id.as_str(), child.program.as_str(), &child.args)
            .await?;
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    broker.run(shutdown).await?;

    info!("draining children");
    broker.shutdown(Duration::from_secs(config.grace_secs)).await;
    Ok(())
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
