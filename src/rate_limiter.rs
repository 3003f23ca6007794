//! Rate limiting: atomic token bucket, fixed window, and per-key overrides
//!
//! Both algorithms keep their state in the shared store so every replica
//! enforces the same budget. The token-bucket step runs as a single
//! server-side script: two in-flight requests for one identifier can never
//! both consume the last token, because the read-refill-consume-write cycle
//! is atomic on the store. The fixed window uses the store's native INCR with
//! an EXPIRE on first hit.
//!
//! Rate limiter failures are fail-closed: a broken store surfaces as 500
//! rather than silently waving traffic through.

use std::sync::Arc;
use std::sync::LazyLock;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::client_ip::ClientIp;
use crate::config::RateLimitSettings;
use crate::pipeline::{is_health_path, reject_response, GatewayState};
use crate::store::{RedisStore, StoreError};

/// Hash holding per-API-key overrides. Deliberately unprefixed: the override
/// table is shared between gateways on the same store.
pub const CONFIG_KEY: &str = "rl:config";

/// Atomic token-bucket step.
///
/// State is a hash with `tokens` and `lastRefillTime` fields. Returns
/// `{allowed, filled}` where `filled` is the post-refill balance before this
/// request consumes; a rejected request writes nothing.
static TOKEN_BUCKET_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl_secs = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'lastRefillTime')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now_ms
end

local elapsed = (now_ms - last_refill) / 1000
if elapsed < 0 then
    elapsed = 0
end

local filled = tokens + elapsed * refill_rate
if filled > capacity then
    filled = capacity
end

if filled < 1 then
    return {0, tostring(filled)}
end

redis.call('HSET', KEYS[1], 'tokens', tostring(filled - 1), 'lastRefillTime', tostring(now_ms))
redis.call('EXPIRE', KEYS[1], ttl_secs)
return {1, tostring(filled)}
",
    )
});

/// Outcome of one token-bucket step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    pub allowed: bool,
    /// Post-refill balance before consumption
    pub filled: f64,
}

/// Run the atomic bucket step for `key`
pub async fn token_bucket_step(
    store: &RedisStore,
    key: &str,
    capacity: u32,
    refill_rate: f64,
    now_ms: i64,
    ttl_secs: u64,
) -> Result<BucketDecision, StoreError> {
    let mut invocation = TOKEN_BUCKET_SCRIPT.prepare_invoke();
    invocation
        .key(key)
        .arg(capacity)
        .arg(refill_rate)
        .arg(now_ms)
        .arg(ttl_secs);

    let (allowed, filled): (i64, String) = store.eval_script(&invocation).await?;
    let filled = filled.parse::<f64>().unwrap_or(0.0);

    Ok(BucketDecision {
        allowed: allowed == 1,
        filled,
    })
}

/// Pure mirror of the script's refill arithmetic, used for header math and
/// for exercising the bucket invariants without a live store.
pub fn refill_balance(
    tokens: f64,
    last_refill_ms: i64,
    now_ms: i64,
    capacity: u32,
    refill_rate: f64,
) -> f64 {
    let elapsed = ((now_ms - last_refill_ms).max(0)) as f64 / 1000.0;
    (tokens + elapsed * refill_rate).min(f64::from(capacity))
}

fn set_header(headers: &mut HeaderMap, name: String, value: String) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::try_from(name),
        HeaderValue::try_from(value),
    ) {
        headers.insert(name, value);
    }
}

/// Emit `<prefix>-Limit` / `-Remaining` / `-Reset` for a bucket decision
pub fn apply_bucket_headers(
    headers: &mut HeaderMap,
    prefix: &str,
    capacity: u32,
    refill_rate: f64,
    now_ms: i64,
    decision: &BucketDecision,
) {
    let now_secs = now_ms as f64 / 1000.0;

    let (remaining, reset) = if decision.allowed {
        let remaining = (decision.filled - 1.0).max(0.0).floor() as u64;
        let reset =
            (now_secs + (f64::from(capacity) - decision.filled + 1.0) / refill_rate).ceil() as i64;
        (remaining, reset)
    } else {
        let reset = (now_secs + ((1.0 - decision.filled) / refill_rate).ceil()).floor() as i64;
        (0, reset)
    };

    set_header(headers, format!("{prefix}-Limit"), capacity.to_string());
    set_header(headers, format!("{prefix}-Remaining"), remaining.to_string());
    set_header(headers, format!("{prefix}-Reset"), reset.to_string());
}

/// Outcome of one fixed-window step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub count: i64,
    /// Seconds left in the window, when the store reports one
    pub remaining_ttl: Option<i64>,
}

/// Fixed-window step: INCR, EXPIRE on first hit, reject above `limit`
pub async fn fixed_window_step(
    store: &RedisStore,
    key: &str,
    limit: u32,
    window_secs: u64,
) -> Result<WindowDecision, StoreError> {
    let count = store.incr(key).await?;
    if count == 1 {
        store.expire(key, window_secs as i64).await?;
    }

    let ttl = store.ttl(key).await.ok().filter(|t| *t > 0);

    Ok(WindowDecision {
        allowed: count <= i64::from(limit),
        count,
        remaining_ttl: ttl,
    })
}

/// Emit `<prefix>-Limit` / `-Remaining` / `-Reset` for a window decision
pub fn apply_window_headers(
    headers: &mut HeaderMap,
    prefix: &str,
    limit: u32,
    now_ms: i64,
    decision: &WindowDecision,
) {
    let remaining = (i64::from(limit) - decision.count).max(0);

    set_header(headers, format!("{prefix}-Limit"), limit.to_string());
    set_header(headers, format!("{prefix}-Remaining"), remaining.to_string());
    if let Some(ttl) = decision.remaining_ttl {
        let reset = now_ms / 1000 + ttl;
        set_header(headers, format!("{prefix}-Reset"), reset.to_string());
    }
}

// Per-API-key configuration store

/// Stored override payload, one JSON value per hash field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredLimit {
    pub capacity: u32,
    pub refill_rate: f64,
}

/// An override resolved against the defaults
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLimit {
    pub capacity: u32,
    pub refill_rate: f64,
    pub is_default: bool,
}

/// Errors from override mutations
#[derive(Debug, thiserror::Error)]
pub enum LimitConfigError {
    #[error("invalid rate limit config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-API-key `{capacity, refillRate}` overrides in the `rl:config` hash
pub struct RateLimitConfigStore {
    store: Arc<RedisStore>,
}

impl RateLimitConfigStore {
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self { store }
    }

    /// Validate and persist an override
    pub async fn update(
        &self,
        api_key: &str,
        capacity: u32,
        refill_rate: f64,
    ) -> Result<(), LimitConfigError> {
        if api_key.is_empty() {
            return Err(LimitConfigError::Invalid("apiKey must not be empty".into()));
        }
        if capacity == 0 {
            return Err(LimitConfigError::Invalid("capacity must be positive".into()));
        }
        if refill_rate <= 0.0 || !refill_rate.is_finite() {
            return Err(LimitConfigError::Invalid(
                "refillRate must be positive".into(),
            ));
        }

        let payload = serde_json::to_string(&StoredLimit {
            capacity,
            refill_rate,
        })
        .map_err(|e| LimitConfigError::Invalid(e.to_string()))?;

        self.store.hset(CONFIG_KEY, api_key, &payload).await?;
        Ok(())
    }

    /// Resolve an API key's limits. Absent or corrupt entries fall back to
    /// the defaults, marked `is_default`.
    pub async fn get(
        &self,
        api_key: &str,
        defaults: &RateLimitSettings,
    ) -> Result<ResolvedLimit, StoreError> {
        let fallback = ResolvedLimit {
            capacity: defaults.default_capacity,
            refill_rate: defaults.default_refill_rate(),
            is_default: true,
        };

        let Some(raw) = self.store.hget(CONFIG_KEY, api_key).await? else {
            return Ok(fallback);
        };

        match serde_json::from_str::<StoredLimit>(&raw) {
            Ok(stored) => Ok(ResolvedLimit {
                capacity: stored.capacity,
                refill_rate: stored.refill_rate,
                is_default: false,
            }),
            Err(e) => {
                warn!("Corrupt rate limit config for API key '{api_key}': {e}");
                Ok(fallback)
            }
        }
    }

    /// Remove an override; returns whether one existed
    pub async fn delete(&self, api_key: &str) -> Result<bool, StoreError> {
        self.store.hdel(CONFIG_KEY, api_key).await
    }

    /// Enumerate all overrides, skipping corrupt entries
    pub async fn list(&self) -> Result<Vec<(String, StoredLimit)>, StoreError> {
        let fields = self.store.hgetall(CONFIG_KEY).await?;

        let mut entries = Vec::with_capacity(fields.len());
        for (api_key, raw) in fields {
            match serde_json::from_str::<StoredLimit>(&raw) {
                Ok(stored) => entries.push((api_key, stored)),
                Err(e) => warn!("Skipping corrupt rate limit config for '{api_key}': {e}"),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

impl std::fmt::Debug for RateLimitConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitConfigStore").finish_non_exhaustive()
    }
}

// Gateway middleware

const API_KEY_HEADER: &str = "x-api-key";
const BUCKET_KEY_PREFIX: &str = "rate-limit:bucket:";
const BUCKET_HEADER_PREFIX: &str = "X-RateLimit";

/// Token-bucket admission for gateway traffic.
///
/// Requests carrying an API key are limited per key with overrides from the
/// config store; everything else is limited per client IP with the defaults.
pub async fn token_bucket_middleware(
    State(state): State<GatewayState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_health_path(request.uri().path()) {
        return next.run(request).await;
    }

    if request
        .extensions()
        .get::<crate::policy::AllowlistPass>()
        .is_some()
    {
        return next.run(request).await;
    }

    let settings = &state.config.rate_limiting;

    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let (id, capacity, refill_rate) = match api_key {
        Some(key) => {
            let resolved = match state.rate_limits.get(&key, settings).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    error!("Rate limit config lookup failed: {e}");
                    return reject_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Rate limiter unavailable",
                    );
                }
            };
            (key, resolved.capacity, resolved.refill_rate)
        }
        None => {
            let client_ip = request
                .extensions()
                .get::<ClientIp>()
                .copied()
                .unwrap_or(ClientIp(None));
            let Some(ip) = client_ip.0 else {
                return reject_response(StatusCode::BAD_REQUEST, "Missing rate limit identifier");
            };
            (
                ip.to_string(),
                settings.default_capacity,
                settings.default_refill_rate(),
            )
        }
    };

    // A zero or negative budget can only come from misconfiguration
    if capacity == 0 || refill_rate <= 0.0 {
        error!("Non-positive rate limit parameters for '{id}'");
        return reject_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Rate limiter misconfigured",
        );
    }

    let key = state.store.key(&format!("{BUCKET_KEY_PREFIX}{id}"));
    let now_ms = Utc::now().timestamp_millis();

    let decision = match token_bucket_step(
        &state.store,
        &key,
        capacity,
        refill_rate,
        now_ms,
        settings.bucket_ttl_secs,
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            error!("Token bucket step failed for '{id}': {e}");
            return reject_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Rate limiter unavailable",
            );
        }
    };

    if decision.allowed {
        let mut response = next.run(request).await;
        apply_bucket_headers(
            response.headers_mut(),
            BUCKET_HEADER_PREFIX,
            capacity,
            refill_rate,
            now_ms,
            &decision,
        );
        response
    } else {
        debug!("Rate limited '{id}'");
        let mut response = reject_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        apply_bucket_headers(
            response.headers_mut(),
            BUCKET_HEADER_PREFIX,
            capacity,
            refill_rate,
            now_ms,
            &decision,
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_is_bounded_by_capacity() {
        // An hour of elapsed time cannot overfill the bucket
        let filled = refill_balance(2.0, 0, 3_600_000, 10, 1.0);
        assert!((filled - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_refill_ignores_clock_regression() {
        let filled = refill_balance(3.0, 10_000, 5_000, 10, 1.0);
        assert!((filled - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_refill_partial() {
        // 2.5 seconds at 2 tokens/sec on top of 1 token
        let filled = refill_balance(1.0, 0, 2_500, 10, 2.0);
        assert!((filled - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_bound_over_sequence() {
        // Simulate the script's consume path over an arbitrary sequence and
        // check 0 <= tokens <= capacity throughout
        let capacity = 5u32;
        let refill_rate = 1.0;
        let mut tokens = f64::from(capacity);
        let mut last_ms = 0i64;

        for step in 0..200i64 {
            let now_ms = step * 137; // uneven arrivals
            let filled = refill_balance(tokens, last_ms, now_ms, capacity, refill_rate);
            assert!((0.0..=f64::from(capacity)).contains(&filled));
            if filled >= 1.0 {
                tokens = filled - 1.0;
                last_ms = now_ms;
            }
            assert!((0.0..=f64::from(capacity)).contains(&tokens));
        }
    }

    #[test]
    fn test_bucket_headers_allowed() {
        let mut headers = HeaderMap::new();
        let decision = BucketDecision {
            allowed: true,
            filled: 2.0,
        };
        apply_bucket_headers(&mut headers, "X-RateLimit", 2, 1.0, 10_000, &decision);

        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "2");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "1");
        // ceil(10 + (2 - 2 + 1) / 1) = 11
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "11");
    }

    #[test]
    fn test_bucket_headers_rejected() {
        let mut headers = HeaderMap::new();
        let decision = BucketDecision {
            allowed: false,
            filled: 0.25,
        };
        apply_bucket_headers(&mut headers, "X-RateLimit", 2, 1.0, 10_000, &decision);

        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
        // floor(10 + ceil((1 - 0.25) / 1)) = 11
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "11");
    }

    #[test]
    fn test_window_headers() {
        let mut headers = HeaderMap::new();
        let decision = WindowDecision {
            allowed: true,
            count: 2,
            remaining_ttl: Some(30),
        };
        apply_window_headers(&mut headers, "X-Admin-RateLimit", 3, 60_000, &decision);

        assert_eq!(headers.get("X-Admin-RateLimit-Limit").unwrap(), "3");
        assert_eq!(headers.get("X-Admin-RateLimit-Remaining").unwrap(), "1");
        assert_eq!(headers.get("X-Admin-RateLimit-Reset").unwrap(), "90");
    }

    #[test]
    fn test_window_headers_over_limit() {
        let mut headers = HeaderMap::new();
        let decision = WindowDecision {
            allowed: false,
            count: 5,
            remaining_ttl: None,
        };
        apply_window_headers(&mut headers, "X-Admin-RateLimit", 3, 60_000, &decision);

        assert_eq!(headers.get("X-Admin-RateLimit-Remaining").unwrap(), "0");
        // No Reset header without a known TTL
        assert!(headers.get("X-Admin-RateLimit-Reset").is_none());
    }

    #[test]
    fn test_stored_limit_wire_format() {
        let stored = StoredLimit {
            capacity: 100,
            refill_rate: 2.5,
        };
        let json = serde_json::to_string(&stored).unwrap();
        assert_eq!(json, r#"{"capacity":100,"refillRate":2.5}"#);

        let decoded: StoredLimit = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, stored);
    }

    #[test]
    fn test_stored_limit_rejects_garbage() {
        assert!(serde_json::from_str::<StoredLimit>("not json").is_err());
        assert!(serde_json::from_str::<StoredLimit>(r#"{"capacity":"x"}"#).is_err());
    }
}
