//! Admin HTTP API for policy list management and rate limit overrides
//!
//! Endpoints:
//! - GET /health - Health check (store ping)
//! - GET/POST/DELETE /policy/{list} - Policy list CRUD
//! - POST /reload - Rebuild the local policy snapshot
//! - GET /ratelimits - List per-API-key overrides
//! - PUT/DELETE /ratelimits/{api_key} - Mutate per-API-key overrides
//!
//! The shared store is the source of truth: every successful list mutation
//! publishes `reload` on the invalidation channel so all replicas rebuild
//! their snapshots. This process's own snapshot refreshes the same way.
//!
//! Access control is two layers: an optional source-IP allowlist and a
//! mandatory HS256 bearer token whose `sub` claim identifies the admin user.
//! That user id keys the admin fixed-window rate limit.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::pipeline::{reject_response, GatewayState};
use crate::policy::{
    INVALIDATION_CHANNEL, KEY_ALLOW_IPS, KEY_DENY_CIDRS, KEY_DENY_COUNTRIES, KEY_DENY_IPS,
    RELOAD_PAYLOAD,
};
use crate::rate_limiter::{
    apply_window_headers, fixed_window_step, LimitConfigError, StoredLimit,
};

const ADMIN_WINDOW_KEY_PREFIX: &str = "admin-rate-limit:";
const ADMIN_HEADER_PREFIX: &str = "X-Admin-RateLimit";

/// Authenticated admin principal, attached by the auth middleware
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub id: String,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdminClaims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
}

/// Verify an HS256 bearer token and extract the admin principal
pub fn verify_admin_token(token: &str, secret: &str) -> Option<AdminUser> {
    let validation = Validation::new(Algorithm::HS256);
    let decoded = jsonwebtoken::decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .ok()?;

    Some(AdminUser {
        id: decoded.claims.sub,
        role: decoded.claims.role,
    })
}

/// Admin API server
pub struct AdminServer {
    state: GatewayState,
}

impl AdminServer {
    pub fn new(state: GatewayState) -> Self {
        Self { state }
    }

    /// Build the admin router with auth and rate limiting installed
    pub fn router(&self) -> Router {
        let state = self.state.clone();

        Router::new()
            .route("/health", get(health_handler))
            .route("/reload", post(reload_handler))
            .route(
                "/policy/{list}",
                get(policy_list_handler)
                    .post(policy_add_handler)
                    .delete(policy_remove_handler),
            )
            .route("/ratelimits", get(ratelimits_list_handler))
            .route(
                "/ratelimits/{api_key}",
                put(ratelimits_update_handler).delete(ratelimits_delete_handler),
            )
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                admin_rate_limit_middleware,
            ))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                admin_auth_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Run the admin HTTP server
    pub async fn run(self) -> anyhow::Result<()> {
        if !self.state.config.admin.enabled {
            info!("Admin API disabled");
            return Ok(());
        }

        let addr = self.state.config.admin.socket_addr()?;
        let app = self.router();

        info!("Admin API listening on {}", addr);
        let listener = TcpListener::bind(addr).await?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Admin server error: {e}"))
    }
}

/// Authentication middleware for the admin API
async fn admin_auth_middleware(
    State(state): State<GatewayState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    // Health probes skip auth
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let admin = &state.config.admin;

    if !admin.allowed_ips.is_empty() {
        let remote_ip = remote_addr.ip().to_string();
        if !admin.allowed_ips.contains(&remote_ip) {
            warn!("Admin API access denied for {}", remote_ip);
            return reject_response(StatusCode::FORBIDDEN, "Access denied");
        }
    }

    // validate() guarantees a secret whenever the admin API is enabled
    let Some(secret) = admin.jwt_secret.as_deref() else {
        return reject_response(StatusCode::INTERNAL_SERVER_ERROR, "Admin auth misconfigured");
    };

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    let Some(user) = token.and_then(|t| verify_admin_token(t, secret)) else {
        warn!("Admin API request with missing or invalid token from {remote_addr}");
        return reject_response(StatusCode::UNAUTHORIZED, "Invalid or missing token");
    };

    request.extensions_mut().insert(user);
    next.run(request).await
}

/// Fixed-window rate limit keyed by the authenticated admin user
async fn admin_rate_limit_middleware(
    State(state): State<GatewayState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let Some(user) = request.extensions().get::<AdminUser>().cloned() else {
        return reject_response(StatusCode::BAD_REQUEST, "Missing rate limit identifier");
    };

    let settings = &state.config.rate_limiting;
    let key = state
        .store
        .key(&format!("{ADMIN_WINDOW_KEY_PREFIX}{}", user.id));
    let now_ms = Utc::now().timestamp_millis();

    let decision = match fixed_window_step(
        &state.store,
        &key,
        settings.admin_limit,
        settings.admin_window_secs,
    )
    .await
    {
        Ok(decision) => decision,
        Err(e) => {
            warn!("Admin rate limit step failed for '{}': {e}", user.id);
            return reject_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Rate limiter unavailable",
            );
        }
    };

    if decision.allowed {
        let mut response = next.run(request).await;
        apply_window_headers(
            response.headers_mut(),
            ADMIN_HEADER_PREFIX,
            settings.admin_limit,
            now_ms,
            &decision,
        );
        response
    } else {
        let mut response =
            reject_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        apply_window_headers(
            response.headers_mut(),
            ADMIN_HEADER_PREFIX,
            settings.admin_limit,
            now_ms,
            &decision,
        );
        response
    }
}

// Policy list handlers

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Ip,
    Cidr,
    Country,
}

/// Map a URL list name to its store key and entry validation
fn list_spec(list: &str) -> Option<(&'static str, ListKind)> {
    match list {
        "allowlist" => Some((KEY_ALLOW_IPS, ListKind::Ip)),
        "denylist" => Some((KEY_DENY_IPS, ListKind::Ip)),
        "cidrs" => Some((KEY_DENY_CIDRS, ListKind::Cidr)),
        "countries" => Some((KEY_DENY_COUNTRIES, ListKind::Country)),
        _ => None,
    }
}

/// Validate and canonicalize a list entry. Country codes are uppercased
/// before they reach the store.
fn canonicalize_entry(kind: ListKind, entry: &str) -> Option<String> {
    let entry = entry.trim();
    match kind {
        ListKind::Ip => entry.parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string()),
        ListKind::Cidr => entry.parse::<ipnet::IpNet>().ok().map(|net| net.to_string()),
        ListKind::Country => {
            let code = entry.to_ascii_uppercase();
            (code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase()))
                .then_some(code)
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntryPayload {
    entry: String,
}

async fn health_handler(State(state): State<GatewayState>) -> Response {
    let store_ok = state.store.ping().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "store": if store_ok { "up" } else { "down" },
            "version": crate::VERSION,
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

async fn reload_handler(State(state): State<GatewayState>) -> Response {
    state.policy.reload().await;
    Json(json!({ "success": true })).into_response()
}

async fn policy_list_handler(
    State(state): State<GatewayState>,
    Path(list): Path<String>,
) -> Response {
    let Some((key, _)) = list_spec(&list) else {
        return reject_response(StatusCode::NOT_FOUND, "Unknown policy list");
    };

    match state.store.smembers(&state.store.key(key)).await {
        Ok(mut members) => {
            members.sort();
            Json(json!({ "success": true, "list": list, "entries": members })).into_response()
        }
        Err(e) => {
            warn!("Failed to read policy list '{list}': {e}");
            reject_response(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
        }
    }
}

async fn policy_add_handler(
    State(state): State<GatewayState>,
    Path(list): Path<String>,
    Json(payload): Json<EntryPayload>,
) -> Response {
    mutate_policy_list(&state, &list, &payload.entry, true).await
}

async fn policy_remove_handler(
    State(state): State<GatewayState>,
    Path(list): Path<String>,
    Json(payload): Json<EntryPayload>,
) -> Response {
    mutate_policy_list(&state, &list, &payload.entry, false).await
}

async fn mutate_policy_list(
    state: &GatewayState,
    list: &str,
    entry: &str,
    add: bool,
) -> Response {
    let Some((key, kind)) = list_spec(list) else {
        return reject_response(StatusCode::NOT_FOUND, "Unknown policy list");
    };

    let Some(entry) = canonicalize_entry(kind, entry) else {
        return reject_response(StatusCode::BAD_REQUEST, "Invalid list entry");
    };

    let store_key = state.store.key(key);
    let result = if add {
        state.store.sadd(&store_key, &entry).await
    } else {
        state.store.srem(&store_key, &entry).await
    };

    match result {
        Ok(changed) => {
            // Replicas learn of the mutation through the invalidation channel
            if let Err(e) = state
                .store
                .publish(INVALIDATION_CHANNEL, RELOAD_PAYLOAD)
                .await
            {
                warn!("Policy mutation succeeded but invalidation publish failed: {e}");
            }
            info!(
                "Policy list '{list}' {}: {entry}",
                if add { "add" } else { "remove" }
            );
            Json(json!({ "success": true, "changed": changed, "entry": entry })).into_response()
        }
        Err(e) => {
            warn!("Policy list mutation failed for '{list}': {e}");
            reject_response(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
        }
    }
}

// Rate limit override handlers

async fn ratelimits_list_handler(State(state): State<GatewayState>) -> Response {
    match state.rate_limits.list().await {
        Ok(entries) => {
            let entries: Vec<_> = entries
                .into_iter()
                .map(|(api_key, limit)| {
                    json!({
                        "apiKey": api_key,
                        "capacity": limit.capacity,
                        "refillRate": limit.refill_rate,
                    })
                })
                .collect();
            Json(json!({ "success": true, "entries": entries })).into_response()
        }
        Err(e) => {
            warn!("Failed to list rate limit overrides: {e}");
            reject_response(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
        }
    }
}

async fn ratelimits_update_handler(
    State(state): State<GatewayState>,
    Path(api_key): Path<String>,
    Json(payload): Json<StoredLimit>,
) -> Response {
    match state
        .rate_limits
        .update(&api_key, payload.capacity, payload.refill_rate)
        .await
    {
        Ok(()) => Json(json!({ "success": true, "apiKey": api_key })).into_response(),
        Err(LimitConfigError::Invalid(msg)) => {
            reject_response(StatusCode::BAD_REQUEST, &msg)
        }
        Err(LimitConfigError::Store(e)) => {
            warn!("Rate limit override update failed: {e}");
            reject_response(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
        }
    }
}

async fn ratelimits_delete_handler(
    State(state): State<GatewayState>,
    Path(api_key): Path<String>,
) -> Response {
    match state.rate_limits.delete(&api_key).await {
        Ok(removed) => {
            Json(json!({ "success": true, "removed": removed })).into_response()
        }
        Err(e) => {
            warn!("Rate limit override delete failed: {e}");
            reject_response(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        role: String,
        exp: i64,
    }

    #[test]
    fn test_verify_admin_token_roundtrip() {
        let claims = TestClaims {
            sub: "u1".to_string(),
            role: "admin".to_string(),
            exp: Utc::now().timestamp() + 600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        let user = verify_admin_token(&token, "secret").unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.role.as_deref(), Some("admin"));

        // Wrong secret must not verify
        assert!(verify_admin_token(&token, "other").is_none());
    }

    #[test]
    fn test_verify_admin_token_rejects_expired() {
        let claims = TestClaims {
            sub: "u1".to_string(),
            role: "admin".to_string(),
            exp: Utc::now().timestamp() - 600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        assert!(verify_admin_token(&token, "secret").is_none());
    }

    #[test]
    fn test_list_spec_mapping() {
        assert_eq!(list_spec("allowlist").unwrap().0, KEY_ALLOW_IPS);
        assert_eq!(list_spec("denylist").unwrap().0, KEY_DENY_IPS);
        assert_eq!(list_spec("cidrs").unwrap().0, KEY_DENY_CIDRS);
        assert_eq!(list_spec("countries").unwrap().0, KEY_DENY_COUNTRIES);
        assert!(list_spec("bogus").is_none());
    }

    #[test]
    fn test_canonicalize_ip_entry() {
        assert_eq!(
            canonicalize_entry(ListKind::Ip, " 1.2.3.4 ").as_deref(),
            Some("1.2.3.4")
        );
        assert!(canonicalize_entry(ListKind::Ip, "1.2.3.4/32").is_none());
        assert!(canonicalize_entry(ListKind::Ip, "nope").is_none());
    }

    #[test]
    fn test_canonicalize_cidr_entry() {
        assert_eq!(
            canonicalize_entry(ListKind::Cidr, "10.0.0.0/8").as_deref(),
            Some("10.0.0.0/8")
        );
        assert!(canonicalize_entry(ListKind::Cidr, "10.0.0.0").is_none());
    }

    #[test]
    fn test_canonicalize_country_entry_uppercases() {
        assert_eq!(
            canonicalize_entry(ListKind::Country, "ru").as_deref(),
            Some("RU")
        );
        assert_eq!(
            canonicalize_entry(ListKind::Country, "US").as_deref(),
            Some("US")
        );
        assert!(canonicalize_entry(ListKind::Country, "USA").is_none());
        assert!(canonicalize_entry(ListKind::Country, "u1").is_none());
    }
}
