//! Router assembly, SPA fallback, and the serve loop with graceful shutdown.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::{net::TcpListener, time};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

use fabric::RpcClient;

use crate::{
    config::GatewayConfig,
    envelope::{respond, Envelope, RETCODE_NOT_FOUND},
    ratelimit::{rate_limit_middleware, ClientBuckets},
    routes::{generic_rpc, health, path_rpc, RouteTable},
    GatewayError,
};

const API_PREFIX: &str = "/restful";

type SpaService = ServeDir<ServeFile>;

/// Shared state behind every handler.
pub struct GatewayState {
    pub rpc: Arc<RpcClient>,
    pub routes: RouteTable,
    pub limiter: ClientBuckets,
    pub config: GatewayConfig,
    pub spa: Option<SpaService>,
}

/// Builds the state, wiring the SPA service only when the configured static
/// directory actually exists.
pub fn build_state(rpc: Arc<RpcClient>, config: GatewayConfig) -> Arc<GatewayState> {
    let limiter = ClientBuckets::new(config.rate_limit.max_tokens, config.refill_interval());
    let spa = config
        .static_dir
        .as_ref()
        .filter(|dir| dir.is_dir())
        .map(|dir| ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html"))));
    if config.static_dir.is_some() && spa.is_none() {
        warn!(dir = ?config.static_dir, "static directory not found; SPA serving disabled");
    }
    Arc::new(GatewayState {
        rpc,
        routes: RouteTable::platform_defaults(),
        limiter,
        config,
        spa,
    })
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/restful/health", get(health))
        .route("/restful/rpc", post(generic_rpc))
        .route("/restful/rpc/:resource/:action", post(path_rpc))
        .fallback(spa_fallback)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .with_state(state)
}

/// Everything that misses the API routes: API-prefixed paths get the 404
/// envelope and never fall through to the SPA; the rest is static content
/// with the classical index.html fallback.
async fn spa_fallback(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    if request.uri().path().starts_with(API_PREFIX) {
        return respond(
            StatusCode::NOT_FOUND,
            Envelope::failure(RETCODE_NOT_FOUND, "not found"),
        );
    }
    let Some(spa) = state.spa.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match spa.oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(err) => {
            warn!(%err, "static file service failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves until `shutdown` fires, then drains connections within the
/// configured grace period before force-closing the rest.
pub async fn serve(state: Arc<GatewayState>, shutdown: CancellationToken) -> Result<(), GatewayError> {
    let addr = state.config.server_addr.clone();
    let grace = state.config.shutdown_grace();
    let app = build_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "gateway listening");

    let drain = shutdown.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { drain.cancelled().await });

    let mut task = tokio::spawn(async move { server.await });
    tokio::select! {
        finished = &mut task => finished?.map_err(GatewayError::Serve),
        _ = shutdown.cancelled() => match time::timeout(grace, &mut task).await {
            Ok(finished) => finished?.map_err(GatewayError::Serve),
            Err(_) => {
                warn!("shutdown grace expired; aborting open connections");
                task.abort();
                Ok(())
            }
        },
    }
}

/// Resolves on SIGINT or SIGTERM and cancels the token, which stops the HTTP
/// server, the RPC client, and the subprocess run loop in that order.
pub async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt");
    }
    token.cancel();
}
