//! Gateway configuration: TOML file, every field overridable by environment.

use std::{env, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::GatewayError;

pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
pub const ADDR_ENV: &str = "GATEWAY_ADDR";
pub const RPC_TIMEOUT_ENV: &str = "GATEWAY_RPC_TIMEOUT_SECS";
pub const SHUTDOWN_GRACE_ENV: &str = "GATEWAY_SHUTDOWN_GRACE_SECS";
pub const STATIC_DIR_ENV: &str = "GATEWAY_STATIC_DIR";
pub const RATE_MAX_TOKENS_ENV: &str = "GATEWAY_RATE_MAX_TOKENS";
pub const RATE_REFILL_SECS_ENV: &str = "GATEWAY_RATE_REFILL_SECS";

const DEFAULT_CONFIG_PATH: &str = "gateway.toml";
const HEALTH_PREFIX: &str = "/restful/health";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server_addr: String,
    pub rpc_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub static_dir: Option<PathBuf>,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_tokens: u64,
    pub refill_interval_secs: u64,
    pub trusted_proxies: Vec<String>,
    pub excluded_prefixes: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:8080".to_string(),
            rpc_timeout_secs: 30,
            shutdown_grace_secs: 10,
            static_dir: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            refill_interval_secs: 1,
            trusted_proxies: Vec::new(),
            excluded_prefixes: vec![HEALTH_PREFIX.to_string()],
        }
    }
}

impl GatewayConfig {
    /// Loads configuration: explicit path, else `GATEWAY_CONFIG`, else
    /// `gateway.toml` when present, else defaults — then environment
    /// overrides on top.
    pub fn load(path: Option<PathBuf>) -> Result<Self, GatewayError> {
        let path = path.or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env()?;
        // The health probe must stay reachable no matter what the file says.
        if !config
            .rate_limit
            .excluded_prefixes
            .iter()
            .any(|prefix| prefix == HEALTH_PREFIX)
        {
            config
                .rate_limit
                .excluded_prefixes
                .push(HEALTH_PREFIX.to_string());
        }
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| GatewayError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| GatewayError::ConfigParse { path, source })
    }

    fn apply_env(&mut self) -> Result<(), GatewayError> {
        if let Ok(addr) = env::var(ADDR_ENV) {
            self.server_addr = addr;
        }
        if let Some(secs) = env_u64(RPC_TIMEOUT_ENV)? {
            self.rpc_timeout_secs = secs;
        }
        if let Some(secs) = env_u64(SHUTDOWN_GRACE_ENV)? {
            self.shutdown_grace_secs = secs;
        }
        if let Some(dir) = env::var_os(STATIC_DIR_ENV) {
            self.static_dir = Some(PathBuf::from(dir));
        }
        if let Some(max) = env_u64(RATE_MAX_TOKENS_ENV)? {
            self.rate_limit.max_tokens = max;
        }
        if let Some(secs) = env_u64(RATE_REFILL_SECS_ENV)? {
            self.rate_limit.refill_interval_secs = secs;
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.refill_interval_secs.max(1))
    }
}

fn env_u64(name: &'static str) -> Result<Option<u64>, GatewayError> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| GatewayError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}
