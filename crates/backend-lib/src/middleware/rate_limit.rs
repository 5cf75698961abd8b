// ============================
// crates/backend-lib/src/middleware/rate_limit.rs
// ============================
//! Connection-attempt limiting, applied before the WebSocket upgrade.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::rate_limit::RateCategory;
use crate::{error::AppError, AppState};

/// Client address resolved by the middleware, for handlers downstream
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIp(pub Option<IpAddr>);

fn header_ip(headers: &HeaderMap, name: &str) -> Option<IpAddr> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// `x-real-ip`, then the first `x-forwarded-for` hop, then the peer address
pub fn client_ip(request: &Request) -> Option<IpAddr> {
    header_ip(request.headers(), "x-real-ip")
        .or_else(|| header_ip(request.headers(), "x-forwarded-for"))
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
}

/// Rate limiter middleware
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(&request);
    let key = ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());

    let now = Instant::now();
    let decision = state
        .rate_limiter
        .check_at(&key, RateCategory::Connection, now);
    if !decision.allowed {
        warn!(client = %key, "connection rate limit exceeded");
        return Err(AppError::RateLimited {
            category: RateCategory::Connection.as_str(),
            retry_after_ms: decision.retry_after_ms(now),
        });
    }

    request.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(request).await)
}
