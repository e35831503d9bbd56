use std::{io, path::PathBuf};

use thiserror::Error;

use fabric::FabricError;

/// Errors that may occur while configuring or running the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
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
    #[error("invalid value for {name}: `{value}`")]
    InvalidEnv { name: &'static str, value: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("http server failed: {0}")]
    Serve(#[source] io::Error),
    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Fabric(#[from] FabricError),
}
