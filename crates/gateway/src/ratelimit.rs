//! Per-client token buckets and the middleware that enforces them.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::{
    envelope::{Envelope, RATE_LIMITED_MESSAGE, RETCODE_RATE_LIMITED},
    server::GatewayState,
};

/// One client's bucket. Refill adds `floor(elapsed / refill_interval)` tokens
/// capped at `max_tokens`, advancing `last_refill` by whole intervals so the
/// remainder keeps accruing.
#[derive(Debug)]
struct TokenBucket {
    tokens: u64,
    max_tokens: u64,
    refill_interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: u64, refill_interval: Duration, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_interval,
            last_refill: now,
        }
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let interval_us = self.refill_interval.as_micros().max(1) as u64;
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        let intervals = elapsed_us / interval_us;
        if intervals > 0 {
            self.tokens = self.tokens.saturating_add(intervals).min(self.max_tokens);
            self.last_refill += Duration::from_micros(intervals.saturating_mul(interval_us));
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// Buckets indexed by client key, created lazily.
///
/// There is no age-based sweeper: when the map grows past the ceiling on a
/// first-seen key, it is cleared wholesale. That bounds memory at the cost of
/// briefly refilling every active client, which is acceptable for an abuse
/// guard.
pub struct ClientBuckets {
    max_tokens: u64,
    refill_interval: Duration,
    ceiling: usize,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

pub const DEFAULT_BUCKET_CEILING: usize = 10_000;

impl ClientBuckets {
    pub fn new(max_tokens: u64, refill_interval: Duration) -> Self {
        Self::with_ceiling(max_tokens, refill_interval, DEFAULT_BUCKET_CEILING)
    }

    pub fn with_ceiling(max_tokens: u64, refill_interval: Duration, ceiling: usize) -> Self {
        Self {
            max_tokens,
            refill_interval,
            ceiling: ceiling.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("bucket map poisoned");
        if !buckets.contains_key(key) && buckets.len() >= self.ceiling {
            warn!(
                clients = buckets.len(),
                "rate-limit bucket ceiling reached; resetting all buckets"
            );
            buckets.clear();
        }
        buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_tokens, self.refill_interval, now))
            .allow_at(now)
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }
}

/// Client identity for bucketing: first `X-Forwarded-For` entry, else
/// `X-Real-IP`, else the transport peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return first.to_string();
        }
    }
    if let Some(real) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return real.to_string();
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// axum middleware enforcing the per-IP bucket. Excluded path prefixes and
/// trusted proxies pass through untouched.
pub async fn rate_limit_middleware(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    let limits = &state.config.rate_limit;
    if limits
        .excluded_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = client_ip(request.headers(), peer);
    if limits.trusted_proxies.iter().any(|proxy| proxy == &ip) {
        return next.run(request).await;
    }
    if state.limiter.allow(&ip) {
        return next.run(request).await;
    }

    debug!(client = %ip, %path, "rate limit exceeded");
    let refill_secs = state.limiter.refill_interval().as_secs().max(1);
    let mut response = crate::envelope::respond(
        StatusCode::TOO_MANY_REQUESTS,
        Envelope::failure(RETCODE_RATE_LIMITED, RATE_LIMITED_MESSAGE),
    );
    let headers = response.headers_mut();
    if let Ok(limit) = state.limiter.max_tokens().to_string().parse() {
        headers.insert("X-RateLimit-Limit", limit);
    }
    if let Ok(refill) = refill_secs.to_string().parse::<axum::http::HeaderValue>() {
        headers.insert("X-RateLimit-Refill", refill.clone());
        headers.insert("Retry-After", refill);
    }
    response.into_response()
}
