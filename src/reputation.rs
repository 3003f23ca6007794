//! IP reputation gate with third-party adapters and single-flight refresh
//!
//! Verdicts are cached in the shared store per IP. On a cache miss exactly one
//! replica refreshes the verdict (set-if-not-exists lock with a millisecond
//! TTL); everyone else passes rather than queueing behind the refresh. That
//! trades a brief stale-allow window for latency and deadlock safety.
//!
//! The gate fails open: a broken store, a slow provider or a corrupt cache
//! entry never rejects traffic on its own.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ProviderConfig, ReputationConfig};
use crate::client_ip::ClientIp;
use crate::pipeline::{is_health_path, reject_response, GatewayState};
use crate::store::RedisStore;

/// Delete the lock only if we still own it (the TTL may have expired and the
/// lock been reacquired by another replica).
static RELEASE_LOCK_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
",
    )
});

/// One adapter's view of an IP. Every field is optional; providers report
/// wildly different subsets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReputationResult {
    /// Risk score 0..=100, higher is worse
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_proxy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_tor: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_vpn: Option<bool>,
}

/// Aggregate score of a verdict: max over adapters, missing scores count as 0
pub fn verdict_score(results: &[ReputationResult]) -> u8 {
    results
        .iter()
        .map(|r| r.score.unwrap_or(0))
        .max()
        .unwrap_or(0)
}

/// A third-party reputation provider.
///
/// `check` must not fail: transport and decode errors are converted to an
/// empty result inside the adapter.
#[async_trait]
pub trait ReputationAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ip: &IpAddr) -> ReputationResult;
}

// AbuseIPDB-style adapter

#[derive(Debug, Deserialize)]
struct AbuseIpdbEnvelope {
    data: AbuseIpdbData,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct AbuseIpdbData {
    abuse_confidence_score: Option<u8>,
    last_reported_at: Option<String>,
    is_tor: Option<bool>,
}

impl From<AbuseIpdbData> for ReputationResult {
    fn from(data: AbuseIpdbData) -> Self {
        Self {
            score: data.abuse_confidence_score,
            last_seen: data.last_reported_at,
            is_tor: data.is_tor,
            ..Default::default()
        }
    }
}

pub struct AbuseIpdbAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_age_in_days: u32,
}

impl AbuseIpdbAdapter {
    pub fn new(client: reqwest::Client, config: &ProviderConfig, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_age_in_days: config.max_age_in_days,
        }
    }

    async fn fetch(&self, ip: &IpAddr) -> Result<ReputationResult, reqwest::Error> {
        let envelope: AbuseIpdbEnvelope = self
            .client
            .get(format!("{}/check", self.base_url))
            .query(&[
                ("ipAddress", ip.to_string()),
                ("maxAgeInDays", self.max_age_in_days.to_string()),
                ("verbose", "true".to_string()),
            ])
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.data.into())
    }
}

#[async_trait]
impl ReputationAdapter for AbuseIpdbAdapter {
    fn name(&self) -> &'static str {
        "abuseipdb"
    }

    async fn check(&self, ip: &IpAddr) -> ReputationResult {
        match self.fetch(ip).await {
            Ok(result) => result,
            Err(e) => {
                warn!("abuseipdb check for {ip} failed: {e}");
                ReputationResult::default()
            }
        }
    }
}

// IPQualityScore-style adapter

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct IpqsPayload {
    fraud_score: Option<u8>,
    recent_abuse: bool,
    bot_status: bool,
    is_crawler: bool,
    proxy: bool,
    vpn: bool,
    tor: bool,
    last_seen_human: Option<String>,
}

impl From<IpqsPayload> for ReputationResult {
    fn from(payload: IpqsPayload) -> Self {
        let mut categories = Vec::new();
        if payload.recent_abuse {
            categories.push("abuse".to_string());
        }
        if payload.bot_status || payload.is_crawler {
            categories.push("bot".to_string());
        }
        // Most specific anonymizer flag wins
        if payload.tor {
            categories.push("tor".to_string());
        } else if payload.vpn {
            categories.push("vpn".to_string());
        } else if payload.proxy {
            categories.push("proxy".to_string());
        }

        Self {
            score: payload.fraud_score,
            categories: (!categories.is_empty()).then_some(categories),
            last_seen: payload.last_seen_human,
            is_proxy: Some(payload.proxy),
            is_vpn: Some(payload.vpn),
            is_tor: Some(payload.tor),
        }
    }
}

pub struct IpqsAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl IpqsAdapter {
    pub fn new(client: reqwest::Client, config: &ProviderConfig, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, ip: &IpAddr) -> Result<ReputationResult, reqwest::Error> {
        let payload: IpqsPayload = self
            .client
            .get(format!("{}/{}/{ip}", self.base_url, self.api_key))
            .query(&[
                ("strictness", "1"),
                ("fast", "true"),
                ("allow_public_access_points", "true"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(payload.into())
    }
}

#[async_trait]
impl ReputationAdapter for IpqsAdapter {
    fn name(&self) -> &'static str {
        "ipqs"
    }

    async fn check(&self, ip: &IpAddr) -> ReputationResult {
        match self.fetch(ip).await {
            Ok(result) => result,
            Err(e) => {
                warn!("ipqs check for {ip} failed: {e}");
                ReputationResult::default()
            }
        }
    }
}

/// Outcome of a reputation evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationDecision {
    Allow,
    Block { score: u8 },
}

/// Reputation evaluator: cache, single-flight refresh, adapter fan-out
pub struct ReputationService {
    store: Arc<RedisStore>,
    adapters: Vec<Arc<dyn ReputationAdapter>>,
    enabled: bool,
    cache_ttl_secs: u64,
    lock_ttl_ms: u64,
    block_threshold: u8,
}

impl ReputationService {
    /// Build the service around an explicit adapter set
    pub fn new(
        store: Arc<RedisStore>,
        config: &ReputationConfig,
        adapters: Vec<Arc<dyn ReputationAdapter>>,
    ) -> Self {
        Self {
            store,
            adapters,
            enabled: config.enabled,
            cache_ttl_secs: config.cache_ttl_secs,
            lock_ttl_ms: config.lock_ttl_ms,
            block_threshold: config.block_threshold,
        }
    }

    /// Build the service from config, instantiating an adapter per provider
    /// that has an API key. Adapter HTTP calls are bounded by the lock TTL so
    /// the single-flight lock is effectively tied to the ongoing work.
    pub fn from_config(store: Arc<RedisStore>, config: &ReputationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.lock_ttl_ms))
            .build()
            .unwrap_or_default();

        let mut adapters: Vec<Arc<dyn ReputationAdapter>> = Vec::new();
        if let Some(key) = &config.abuseipdb.api_key {
            adapters.push(Arc::new(AbuseIpdbAdapter::new(
                client.clone(),
                &config.abuseipdb,
                key.clone(),
            )));
        }
        if let Some(key) = &config.ipqs.api_key {
            adapters.push(Arc::new(IpqsAdapter::new(
                client.clone(),
                &config.ipqs,
                key.clone(),
            )));
        }

        Self::new(store, config, adapters)
    }

    pub fn is_active(&self) -> bool {
        self.enabled
    }

    fn cache_key(&self, ip: &IpAddr) -> String {
        self.store.key(&format!("geo:reputation:{ip}"))
    }

    fn lock_key(&self, ip: &IpAddr) -> String {
        self.store.key(&format!("geo:lock:{ip}"))
    }

    fn decide(&self, results: &[ReputationResult]) -> ReputationDecision {
        let score = verdict_score(results);
        if score >= self.block_threshold {
            ReputationDecision::Block { score }
        } else {
            ReputationDecision::Allow
        }
    }

    /// Evaluate an IP. Never errors: store or provider trouble resolves to
    /// [`ReputationDecision::Allow`].
    pub async fn evaluate(&self, ip: &IpAddr) -> ReputationDecision {
        if !self.is_active() {
            return ReputationDecision::Allow;
        }

        match self.evaluate_inner(ip).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Reputation evaluation for {ip} failed open: {e}");
                ReputationDecision::Allow
            }
        }
    }

    async fn evaluate_inner(&self, ip: &IpAddr) -> Result<ReputationDecision, crate::store::StoreError> {
        let cache_key = self.cache_key(ip);

        if let Some(cached) = self.store.get(&cache_key).await? {
            match serde_json::from_str::<Vec<ReputationResult>>(&cached) {
                Ok(results) => return Ok(self.decide(&results)),
                Err(e) => {
                    // Corrupt entry: treat as a miss and refresh below
                    warn!("Corrupt reputation cache entry for {ip}: {e}");
                }
            }
        }

        let lock_key = self.lock_key(ip);
        let lock_token: String = {
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
                .collect()
        };

        if !self
            .store
            .set_nx_px(&lock_key, &lock_token, self.lock_ttl_ms)
            .await?
        {
            // Another replica is refreshing; pass rather than queue
            debug!("Reputation refresh for {ip} already in flight elsewhere");
            return Ok(ReputationDecision::Allow);
        }

        let refresh = async {
            let results = self.fan_out(ip).await;
            match serde_json::to_string(&results) {
                Ok(json) => {
                    self.store
                        .set_ex(&cache_key, &json, self.cache_ttl_secs)
                        .await?;
                }
                Err(e) => warn!("Failed to encode reputation verdict for {ip}: {e}"),
            }
            Ok::<_, crate::store::StoreError>(results)
        };

        let outcome = refresh.await;

        // Release the lock regardless of how the refresh went
        let mut invocation = RELEASE_LOCK_SCRIPT.prepare_invoke();
        invocation.key(lock_key.as_str()).arg(lock_token.as_str());
        if let Err(e) = self.store.eval_script::<i64>(&invocation).await {
            warn!("Failed to release reputation lock for {ip}: {e}");
        }

        Ok(self.decide(&outcome?))
    }

    /// Query all adapters concurrently
    async fn fan_out(&self, ip: &IpAddr) -> Vec<ReputationResult> {
        futures::future::join_all(self.adapters.iter().map(|adapter| adapter.check(ip))).await
    }
}

impl std::fmt::Debug for ReputationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationService")
            .field("adapters", &self.adapters.len())
            .field("enabled", &self.enabled)
            .field("block_threshold", &self.block_threshold)
            .finish()
    }
}

/// Reputation gate middleware. A missing client IP passes; the 400 decision
/// belongs to the policy gate.
pub async fn reputation_gate_middleware(
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

    let client_ip = request
        .extensions()
        .get::<ClientIp>()
        .copied()
        .unwrap_or(ClientIp(None));

    let Some(ip) = client_ip.0 else {
        return next.run(request).await;
    };

    match state.reputation.evaluate(&ip).await {
        ReputationDecision::Allow => next.run(request).await,
        ReputationDecision::Block { score } => {
            warn!("Blocked IP {ip} with reputation score {score}");
            reject_response(StatusCode::FORBIDDEN, "Access denied")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_score_max() {
        let results = vec![
            ReputationResult {
                score: Some(20),
                ..Default::default()
            },
            ReputationResult {
                score: Some(80),
                ..Default::default()
            },
            ReputationResult::default(),
        ];
        assert_eq!(verdict_score(&results), 80);
    }

    #[test]
    fn test_verdict_score_missing_is_zero() {
        assert_eq!(verdict_score(&[ReputationResult::default()]), 0);
        assert_eq!(verdict_score(&[]), 0);
    }

    #[test]
    fn test_abuseipdb_mapping() {
        let body = r#"{"data":{"abuseConfidenceScore":80,"lastReportedAt":"2026-01-10T12:00:00Z","isTor":true,"totalReports":12}}"#;
        let envelope: AbuseIpdbEnvelope = serde_json::from_str(body).unwrap();
        let result: ReputationResult = envelope.data.into();

        assert_eq!(result.score, Some(80));
        assert_eq!(result.last_seen.as_deref(), Some("2026-01-10T12:00:00Z"));
        assert_eq!(result.is_tor, Some(true));
        assert_eq!(result.is_vpn, None);
    }

    #[test]
    fn test_ipqs_mapping_categories() {
        let body = r#"{"fraud_score":85,"recent_abuse":true,"bot_status":false,"is_crawler":true,"proxy":true,"vpn":true,"tor":false}"#;
        let payload: IpqsPayload = serde_json::from_str(body).unwrap();
        let result: ReputationResult = payload.into();

        assert_eq!(result.score, Some(85));
        let categories = result.categories.unwrap();
        assert_eq!(categories, vec!["abuse", "bot", "vpn"]);
        assert_eq!(result.is_proxy, Some(true));
        assert_eq!(result.is_vpn, Some(true));
        assert_eq!(result.is_tor, Some(false));
    }

    #[test]
    fn test_ipqs_clean_ip_has_no_categories() {
        let payload: IpqsPayload = serde_json::from_str(r#"{"fraud_score":5}"#).unwrap();
        let result: ReputationResult = payload.into();

        assert_eq!(result.score, Some(5));
        assert_eq!(result.categories, None);
    }

    #[test]
    fn test_verdict_wire_format() {
        // Field names on the wire are camelCase, matching the cached JSON
        let result = ReputationResult {
            score: Some(42),
            last_seen: Some("2026-01-01T00:00:00Z".to_string()),
            is_proxy: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_string(&vec![result.clone()]).unwrap();
        assert!(json.contains("\"lastSeen\""));
        assert!(json.contains("\"isProxy\""));

        let decoded: Vec<ReputationResult> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, vec![result]);
    }
}
