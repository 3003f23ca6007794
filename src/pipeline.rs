//! Per-request pipeline composition
//!
//! The stage order is fixed: client IP derivation runs first, then the policy
//! gate, the reputation gate, and finally rate limiting. Health probe paths
//! bypass all three gates but still get a derived client IP and the shared
//! store handle on the request context.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::Utc;
use ipnet::IpNet;
use serde_json::json;

use crate::client_ip::client_context_middleware;
use crate::config::GatewayConfig;
use crate::geo::GeoLookup;
use crate::policy::{policy_gate_middleware, PolicyCache};
use crate::rate_limiter::{token_bucket_middleware, RateLimitConfigStore};
use crate::reputation::{reputation_gate_middleware, ReputationService};
use crate::store::RedisStore;

/// Shared state for every pipeline stage
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<RedisStore>,
    pub policy: Arc<PolicyCache>,
    pub reputation: Arc<ReputationService>,
    pub rate_limits: Arc<RateLimitConfigStore>,
    pub geo: Arc<dyn GeoLookup>,
    trusted_proxies: Arc<Vec<IpNet>>,
}

impl GatewayState {
    /// Wire up the long-lived subsystems around a connected store.
    ///
    /// Trusted proxy entries must have been validated by
    /// [`GatewayConfig::validate`]; anything unparseable left here is skipped.
    pub fn new(
        config: Arc<GatewayConfig>,
        store: Arc<RedisStore>,
        geo: Arc<dyn GeoLookup>,
    ) -> Self {
        let trusted_proxies: Vec<IpNet> = config
            .security
            .trusted_proxies
            .iter()
            .filter_map(|s| crate::client_ip::parse_cidr_or_ip(s))
            .collect();

        let policy = Arc::new(PolicyCache::new(store.clone()));
        let reputation = Arc::new(ReputationService::from_config(
            store.clone(),
            &config.reputation,
        ));
        let rate_limits = Arc::new(RateLimitConfigStore::new(store.clone()));

        Self {
            config,
            store,
            policy,
            reputation,
            rate_limits,
            geo,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }

    pub fn trusted_proxies(&self) -> &[IpNet] {
        &self.trusted_proxies
    }
}

/// Paths exempt from the policy, reputation and rate-limit gates
pub fn is_health_path(path: &str) -> bool {
    path == "/health" || path.starts_with("/health/") || path == "/healthz"
}

/// Uniform JSON rejection body
pub fn reject_response(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": error,
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

/// Install the policy pipeline around a downstream router.
///
/// Layers run top-down in the fixed order: client context, policy gate,
/// reputation gate, token bucket.
pub fn policy_pipeline(state: GatewayState, router: Router) -> Router {
    router
        .layer(from_fn_with_state(state.clone(), token_bucket_middleware))
        .layer(from_fn_with_state(state.clone(), reputation_gate_middleware))
        .layer(from_fn_with_state(state.clone(), policy_gate_middleware))
        .layer(from_fn_with_state(state, client_context_middleware))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_path_matching() {
        assert!(is_health_path("/health"));
        assert!(is_health_path("/health/live"));
        assert!(is_health_path("/healthz"));
        assert!(!is_health_path("/healthcheck"));
        assert!(!is_health_path("/api/health"));
        assert!(!is_health_path("/"));
    }

    #[tokio::test]
    async fn test_reject_response_shape() {
        use http_body_util::BodyExt;

        let response = reject_response(StatusCode::FORBIDDEN, "Access denied");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Access denied");
        assert!(value["timestamp"].is_string());
    }
}
