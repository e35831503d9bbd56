#![forbid(unsafe_code)]
//! Subprocess RPC fabric for the security-data platform.
//!
//! A set of single-purpose services (store, fetcher, gateway, job controller,
//! analysis workers) cooperate through one parent **broker**, speaking
//! line-delimited JSON messages over stdin/stdout. This crate is that fabric:
//!
//! - [`Message`] and its codec: one tagged JSON object per line.
//! - [`Subprocess`]: the per-process runtime — reader loop, serialised
//!   writer, handler registry, parallel per-request dispatch.
//! - [`RpcClient`]: correlated request/response with per-call timeout and
//!   cancellation; waiters are oneshot channels keyed by correlation ID.
//! - [`Broker`]: spawns children with `PROCESS_ID` set, routes by `target`,
//!   fabricates ERROR replies for unknown targets and dead children, and
//!   shuts the tree down gracefully.
//!
//! Stdout belongs to the fabric; all logging goes to stderr via `tracing`.

pub mod broker;
pub mod client;
pub mod message;
pub mod subprocess;

mod error;

pub use broker::{Broker, BROKER_ID, PROCESS_ID_ENV};
pub use client::RpcClient;
pub use error::FabricError;
pub use message::{
    decode_line, encode_line, marshal_payload, require_field, require_str_field,
    unmarshal_payload, Message, MessageType,
};
pub use subprocess::{handler_fn, Handler, HandlerResult, ResponseHook, Subprocess};

/// Reads this process's fabric ID from `PROCESS_ID`, falling back to the
/// service default.
pub fn process_id(default: &str) -> String {
    std::env::var(PROCESS_ID_ENV).unwrap_or_else(|_| default.to_string())
}
