use crate::constants::{DELIVERY_REQUESTS_PER_MINUTE, REQUESTS_PER_MINUTE};
use crate::transport::TransportState;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use tracing::warn;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// HTTP quota buckets, one set per assembled world.
///
/// Constructed alongside the transport state so independent instances (and
/// restarts) never share a bucket; task delivery gets its own tighter quota.
pub struct RateLimiters {
    general: DirectLimiter,
    delivery: DirectLimiter,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self {
            general: RateLimiter::direct(Quota::per_minute(
                NonZeroU32::new(REQUESTS_PER_MINUTE).expect("nonzero quota"),
            )),
            delivery: RateLimiter::direct(Quota::per_minute(
                NonZeroU32::new(DELIVERY_REQUESTS_PER_MINUTE).expect("nonzero quota"),
            )),
        }
    }

    /// True when a request to `path` fits its bucket.
    pub fn check(&self, path: &str) -> bool {
        let limiter = if path == "/tasks/deliver" {
            &self.delivery
        } else {
            &self.general
        };
        limiter.check().is_ok()
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

/// Quota gate over the whole HTTP surface.
pub async fn rate_limit_middleware(
    State(state): State<TransportState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = request.uri().path();
    if !state.rate_limits.check(path) {
        warn!(path, "request rejected by rate limiter");
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "success": false,
                "error": "rate_limited",
            })),
        )
            .into_response());
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DELIVERY_REQUESTS_PER_MINUTE;

    #[test]
    fn fresh_limiters_allow_initial_burst() {
        let limits = RateLimiters::new();
        assert!(limits.check("/health"));
        assert!(limits.check("/tasks/deliver"));
    }

    #[test]
    fn instances_do_not_share_buckets() {
        let first = RateLimiters::new();
        let second = RateLimiters::new();

        // Drain the first instance's delivery quota completely.
        while first.check("/tasks/deliver") {}
        assert!(!first.check("/tasks/deliver"));

        // A sibling instance still has its full bucket.
        assert!(second.check("/tasks/deliver"));
    }

    #[test]
    fn delivery_bucket_is_tighter_than_general() {
        let limits = RateLimiters::new();
        let mut granted = 0;
        while limits.check("/tasks/deliver") {
            granted += 1;
        }
        assert_eq!(granted, DELIVERY_REQUESTS_PER_MINUTE as usize);
        // The general bucket is untouched by delivery checks.
        assert!(limits.check("/health"));
    }
}
