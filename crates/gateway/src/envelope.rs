//! The uniform response body: `{retcode, message, payload}`.
//!
//! RPC-level failures surface as HTTP 200 with a non-zero retcode; only
//! body-parse failures use 4xx, and rate limiting uses 429. The gateway never
//! answers 5xx for an RPC outcome.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RETCODE_OK: i64 = 0;
pub const RETCODE_BAD_REQUEST: i64 = 400;
pub const RETCODE_NOT_FOUND: i64 = 404;
pub const RETCODE_RATE_LIMITED: i64 = 429;
pub const RETCODE_RPC_FAILURE: i64 = 500;

pub const SUCCESS_MESSAGE: &str = "success";
pub const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Please retry later.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub retcode: i64,
    pub message: String,
    pub payload: Value,
}

impl Envelope {
    pub fn success(payload: Value) -> Self {
        Self {
            retcode: RETCODE_OK,
            message: SUCCESS_MESSAGE.to_string(),
            payload,
        }
    }

    pub fn failure(retcode: i64, message: impl Into<String>) -> Self {
        Self {
            retcode,
            message: message.into(),
            payload: Value::Null,
        }
    }
}

/// Wraps an envelope in a response with an explicit HTTP status.
pub fn respond(status: StatusCode, envelope: Envelope) -> Response {
    (status, Json(envelope)).into_response()
}

/// HTTP 200 carrying the envelope; the normal RPC-outcome shape.
pub fn ok(envelope: Envelope) -> Response {
    respond(StatusCode::OK, envelope)
}

/// HTTP 400 for an unparseable or invalid request body.
pub fn bad_request(message: impl Into<String>) -> Response {
    respond(
        StatusCode::BAD_REQUEST,
        Envelope::failure(RETCODE_BAD_REQUEST, message),
    )
}
