//! HTTP handlers and the static path→RPC mapping table.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{Json, Response},
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fabric::BROKER_ID;

use crate::{
    envelope::{bad_request, ok, respond, Envelope, RETCODE_NOT_FOUND, RETCODE_RPC_FAILURE},
    server::GatewayState,
};

/// Resolution of one `{resource}/{action}` pair.
#[derive(Debug, Clone)]
pub struct RpcRoute {
    pub method: String,
    pub target: String,
}

/// Static mapping from path-based endpoints onto `(method, target)` pairs.
/// Populated at startup, immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, RpcRoute>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The platform's endpoints. `get` and `get_by_id` are aliases by
    /// construction: both map onto the same RPC method.
    pub fn platform_defaults() -> Self {
        let mut table = Self::new();
        for (resource, list_method, get_method) in [
            ("cve", "RPCListCVEs", "RPCGetCVE"),
            ("cwe", "RPCListCWEs", "RPCGetCWE"),
            ("capec", "RPCListCAPECs", "RPCGetCAPEC"),
            ("attack", "RPCListAttackTechniques", "RPCGetAttackTechnique"),
            ("ssg", "RPCListSSGRules", "RPCGetSSGRule"),
        ] {
            table.insert(resource, "list", list_method, "local");
            table.insert(resource, "get", get_method, "local");
            table.insert(resource, "get_by_id", get_method, "local");
        }
        table.insert("job", "start", "RPCStartCWEJob", "meta");
        table.insert("job", "stop", "RPCStopCWEJob", "meta");
        table.insert("job", "status", "RPCJobStatus", "meta");
        table.insert("broker", "status", "RPCBrokerStatus", BROKER_ID);
        table
    }

    pub fn insert(&mut self, resource: &str, action: &str, method: &str, target: &str) {
        self.routes.insert(
            format!("{resource}/{action}"),
            RpcRoute {
                method: method.to_string(),
                target: target.to_string(),
            },
        );
    }

    pub fn resolve(&self, resource: &str, action: &str) -> Option<&RpcRoute> {
        self.routes.get(&format!("{resource}/{action}"))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// `GET /restful/health`
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// `POST /restful/rpc` — generic forwarder.
pub async fn generic_rpc(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => return bad_request(format!("Invalid request body: {err}")),
    };
    let Some(method) = parsed
        .get("method")
        .and_then(Value::as_str)
        .filter(|method| !method.is_empty())
        .map(str::to_string)
    else {
        return bad_request("Invalid request: missing method");
    };
    let target = parsed
        .get("target")
        .and_then(Value::as_str)
        .filter(|target| !target.is_empty())
        .unwrap_or(BROKER_ID)
        .to_string();
    let params = parsed.get("params").cloned().unwrap_or(Value::Null);

    invoke_and_envelope(state, target, method, params).await
}

/// `POST /restful/rpc/{resource}/{action}` — table-driven endpoints.
pub async fn path_rpc(
    State(state): State<Arc<GatewayState>>,
    Path((resource, action)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let Some(route) = state.routes.resolve(&resource, &action).cloned() else {
        debug!(%resource, %action, "no rpc route for path");
        return respond(
            StatusCode::NOT_FOUND,
            Envelope::failure(RETCODE_NOT_FOUND, format!("unknown endpoint: {resource}/{action}")),
        );
    };
    let params: Value = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => return bad_request(format!("Invalid request body: {err}")),
        }
    };

    invoke_and_envelope(state, route.target, route.method, params).await
}

/// Invokes the RPC on its own task with a fresh token, detached from the HTTP
/// request future: a client disconnect must not cancel in-flight fabric work
/// other callers may be waiting on. The call is still bounded by the client's
/// configured timeout.
async fn invoke_and_envelope(
    state: Arc<GatewayState>,
    target: String,
    method: String,
    params: Value,
) -> Response {
    let rpc = state.rpc.clone();
    let call = tokio::spawn(async move {
        let token = CancellationToken::new();
        rpc.invoke_rpc_with_target(&token, &target, &method, &params)
            .await
    });

    let reply = match call.await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            warn!(%err, "rpc invocation failed");
            return ok(Envelope::failure(RETCODE_RPC_FAILURE, err.to_string()));
        }
        Err(err) => {
            warn!(%err, "rpc task failed");
            return ok(Envelope::failure(RETCODE_RPC_FAILURE, err.to_string()));
        }
    };

    if let Some(text) = reply.is_error() {
        return ok(Envelope::failure(RETCODE_RPC_FAILURE, text));
    }
    let payload = reply.payload.unwrap_or(Value::Null);
    ok(Envelope::success(payload))
}
