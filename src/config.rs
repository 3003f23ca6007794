//! Configuration module with TOML parsing and validation
//!
//! All configuration values are externalized - no hardcoded ports, key names,
//! or thresholds. CLI flags and environment variables override file values at
//! startup (see `main.rs`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server bind configuration
    pub server: ServerConfig,
    /// Shared store (Redis) connection settings
    pub redis: RedisConfig,
    /// Trusted-proxy and client IP derivation settings
    pub security: SecurityConfig,
    /// IP reputation settings
    pub reputation: ReputationConfig,
    /// Rate limiting settings
    pub rate_limiting: RateLimitSettings,
    /// Admin API configuration
    pub admin: AdminConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            security: SecurityConfig::default(),
            reputation: ReputationConfig::default(),
            rate_limiting: RateLimitSettings::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration values, rejecting combinations that would
    /// misbehave at runtime rather than failing on first request.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.redis.url.is_empty() {
            anyhow::bail!("redis.url must not be empty");
        }
        if self.rate_limiting.default_capacity == 0 {
            anyhow::bail!("rate_limiting.default_capacity must be positive");
        }
        if self.rate_limiting.default_refill_tokens <= 0.0 {
            anyhow::bail!("rate_limiting.default_refill_tokens must be positive");
        }
        if self.rate_limiting.default_refill_interval_secs == 0 {
            anyhow::bail!("rate_limiting.default_refill_interval_secs must be positive");
        }
        if self.rate_limiting.admin_limit == 0 {
            anyhow::bail!("rate_limiting.admin_limit must be positive");
        }
        if self.rate_limiting.admin_window_secs == 0 {
            anyhow::bail!("rate_limiting.admin_window_secs must be positive");
        }
        if self.reputation.lock_ttl_ms == 0 {
            anyhow::bail!("reputation.lock_ttl_ms must be positive");
        }
        if self.reputation.block_threshold > 100 {
            anyhow::bail!("reputation.block_threshold must be within 0..=100");
        }
        for cidr in &self.security.trusted_proxies {
            if crate::client_ip::parse_cidr_or_ip(cidr).is_none() {
                anyhow::bail!("security.trusted_proxies entry '{cidr}' is not an IP or CIDR");
            }
        }
        if self.admin.enabled && self.admin.jwt_secret.is_none() {
            anyhow::bail!("admin.jwt_secret is required when the admin API is enabled");
        }
        Ok(())
    }
}

/// Server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the gateway listener (default: 0.0.0.0)
    pub bind_address: String,
    /// TCP port for the gateway listener
    pub port: u16,
    /// Bounded window for in-flight requests to complete on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_grace_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Get the full socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

/// Shared store (Redis) connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://:password@127.0.0.1:6379/0`
    pub url: String,
    /// Maximum pooled command connections
    pub pool_size: u32,
    /// Timeout for establishing a connection
    pub connect_timeout_ms: u64,
    /// Timeout applied to every store command
    pub command_timeout_ms: u64,
    /// Prefix applied to every gateway key
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 10,
            connect_timeout_ms: 5000,
            command_timeout_ms: 2000,
            key_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Trusted-proxy and client IP derivation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// CIDRs (or single IPs) of upstream proxies whose forwarded headers
    /// are trusted for client IP derivation
    pub trusted_proxies: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
                "127.0.0.0/8".to_string(),
            ],
        }
    }
}

/// IP reputation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Enable the reputation gate
    pub enabled: bool,
    /// Seconds a cached verdict stays valid
    pub cache_ttl_secs: u64,
    /// Milliseconds the single-flight refresh lock stays held
    pub lock_ttl_ms: u64,
    /// Minimum aggregate score that triggers a reject
    pub block_threshold: u8,
    /// AbuseIPDB-style provider
    pub abuseipdb: ProviderConfig,
    /// IPQualityScore-style provider
    pub ipqs: ProviderConfig,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_secs: 3600,
            lock_ttl_ms: 10_000,
            block_threshold: 50,
            abuseipdb: ProviderConfig {
                api_key: None,
                base_url: "https://api.abuseipdb.com/api/v2".to_string(),
                max_age_in_days: 90,
            },
            ipqs: ProviderConfig {
                api_key: None,
                base_url: "https://ipqualityscore.com/api/json/ip".to_string(),
                max_age_in_days: 90,
            },
        }
    }
}

/// Third-party reputation provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API key; the provider is disabled when absent
    pub api_key: Option<String>,
    /// Base URL of the provider API
    pub base_url: String,
    /// Report age window passed to providers that support it
    pub max_age_in_days: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: String::new(),
            max_age_in_days: 90,
        }
    }
}

/// Rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Default token bucket capacity
    pub default_capacity: u32,
    /// Tokens added per refill interval
    pub default_refill_tokens: f64,
    /// Refill interval in seconds
    pub default_refill_interval_secs: u64,
    /// TTL on idle bucket state
    pub bucket_ttl_secs: u64,
    /// Fixed-window limit for the admin surface
    pub admin_limit: u32,
    /// Fixed-window length for the admin surface in seconds
    pub admin_window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_capacity: 60,
            default_refill_tokens: 60.0,
            default_refill_interval_secs: 60,
            bucket_ttl_secs: 3600,
            admin_limit: 30,
            admin_window_secs: 60,
        }
    }
}

impl RateLimitSettings {
    /// Default refill rate in tokens per second
    pub fn default_refill_rate(&self) -> f64 {
        self.default_refill_tokens / self.default_refill_interval_secs as f64
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API
    pub enabled: bool,
    /// Bind address for the admin listener
    pub bind_address: String,
    /// TCP port for the admin listener
    pub port: u16,
    /// Source IPs allowed to reach the admin API (empty = any)
    pub allowed_ips: Vec<String>,
    /// HS256 secret for admin bearer tokens
    pub jwt_secret: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 9090,
            allowed_ips: Vec::new(),
            jwt_secret: None,
        }
    }
}

impl AdminConfig {
    /// Get the full socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();

        assert!(!config.server.bind_address.is_empty());
        assert!(config.server.port > 0);
        assert!(config.admin.port > 0);
        assert_eq!(config.reputation.block_threshold, 50);
        assert_eq!(config.rate_limiting.bucket_ttl_secs, 3600);
    }

    #[test]
    fn test_default_refill_rate() {
        let settings = RateLimitSettings::default();
        // 60 tokens per 60 seconds
        assert!((settings.default_refill_rate() - 1.0).abs() < f64::EPSILON);

        let settings = RateLimitSettings {
            default_refill_tokens: 10.0,
            default_refill_interval_secs: 2,
            ..Default::default()
        };
        assert!((settings.default_refill_rate() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_parsing_minimal() {
        let toml_content = r#"
[server]
port = 8443

[redis]
url = "redis://10.1.2.3:6379"
key_prefix = "lb:"
"#;

        let config: GatewayConfig = toml::from_str(toml_content).unwrap();

        assert_eq!(config.server.port, 8443);
        assert_eq!(config.redis.url, "redis://10.1.2.3:6379");
        assert_eq!(config.redis.key_prefix, "lb:");
        // Untouched sections fall back to defaults
        assert_eq!(config.rate_limiting.default_capacity, 60);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = GatewayConfig::default();
        config.admin.jwt_secret = Some("secret".to_string());
        assert!(config.validate().is_ok());

        config.rate_limiting.default_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_trusted_proxy() {
        let mut config = GatewayConfig::default();
        config.admin.jwt_secret = Some("secret".to_string());
        config.security.trusted_proxies = vec!["not-a-cidr".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_admin_secret() {
        let mut config = GatewayConfig::default();
        config.admin.enabled = true;
        config.admin.jwt_secret = None;
        assert!(config.validate().is_err());

        config.admin.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_admin_socket_addr() {
        let config = AdminConfig::default();
        let addr = config.socket_addr().unwrap();

        assert!(addr.port() > 0);
        assert!(!addr.ip().to_string().is_empty());
    }
}
