#![forbid(unsafe_code)]
//! Background job controller for the security-data platform.
//!
//! One controller owns one long-running pipeline: page through CWE views on
//! the `remote` fetcher and persist each item via the `local` store, entirely
//! over the RPC fabric. The `meta` binary exposes the controller as fabric
//! handlers (`RPCStartCWEJob`, `RPCStopCWEJob`, `RPCJobStatus`).

pub mod controller;

mod error;

pub use controller::{
    JobConfig, JobController, JobParams, JobStatus, FETCH_VIEWS_METHOD, SAVE_VIEW_METHOD,
};
pub use error::JobError;
