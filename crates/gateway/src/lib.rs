#![forbid(unsafe_code)]
//! HTTP gateway for the security-data platform.
//!
//! Bridges REST clients onto the subprocess RPC fabric: path-based and
//! generic endpoints under `/restful`, a uniform `{retcode, message, payload}`
//! envelope, per-client token-bucket rate limiting, SPA static fallback, and
//! graceful shutdown. RPC calls run on detached tasks bounded by the
//! configured timeout, so HTTP disconnects never cancel in-flight fabric
//! work.

pub mod config;
pub mod envelope;
pub mod ratelimit;
pub mod routes;
pub mod server;

mod error;

pub use config::{GatewayConfig, RateLimitConfig};
pub use envelope::Envelope;
pub use error::GatewayError;
pub use ratelimit::ClientBuckets;
pub use routes::RouteTable;
pub use server::{build_router, build_state, serve, shutdown_signal, GatewayState};
