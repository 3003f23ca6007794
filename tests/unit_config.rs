//! Unit tests for configuration parsing and validation

use sentra_gateway::config::*;

#[test]
fn test_full_config_parsing() {
    let toml_content = r#"
[server]
bind_address = "127.0.0.1"
port = 8088
shutdown_grace_secs = 10

[redis]
url = "redis://:hunter2@10.0.0.5:6380/1"
pool_size = 4
command_timeout_ms = 500
key_prefix = "lb:"

[security]
trusted_proxies = ["10.0.0.0/8", "203.0.113.7"]

[reputation]
cache_ttl_secs = 1800
lock_ttl_ms = 5000
block_threshold = 75

[reputation.abuseipdb]
api_key = "abc"
max_age_in_days = 30

[reputation.ipqs]
api_key = "def"

[rate_limiting]
default_capacity = 100
default_refill_tokens = 50
default_refill_interval_secs = 10
admin_limit = 5
admin_window_secs = 120

[admin]
bind_address = "127.0.0.1"
port = 9191
allowed_ips = ["127.0.0.1"]
jwt_secret = "topsecret"
"#;

    let config: GatewayConfig = toml::from_str(toml_content).expect("Failed to parse config");

    assert_eq!(config.server.bind_address, "127.0.0.1");
    assert_eq!(config.server.port, 8088);
    assert_eq!(config.redis.url, "redis://:hunter2@10.0.0.5:6380/1");
    assert_eq!(config.redis.key_prefix, "lb:");
    assert_eq!(config.security.trusted_proxies.len(), 2);
    assert_eq!(config.reputation.block_threshold, 75);
    assert_eq!(config.reputation.abuseipdb.api_key.as_deref(), Some("abc"));
    assert_eq!(config.reputation.abuseipdb.max_age_in_days, 30);
    // Provider defaults survive partial override
    assert!(config.reputation.ipqs.base_url.contains("ipqualityscore"));
    assert_eq!(config.rate_limiting.default_capacity, 100);
    // 50 tokens over 10 seconds
    assert!((config.rate_limiting.default_refill_rate() - 5.0).abs() < f64::EPSILON);
    assert_eq!(config.admin.port, 9191);

    config.validate().expect("config should validate");
}

#[test]
fn test_empty_config_uses_defaults() {
    let config: GatewayConfig = toml::from_str("").unwrap();

    assert_eq!(config.server.port, 8080);
    assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
    assert_eq!(config.reputation.cache_ttl_secs, 3600);
    assert_eq!(config.reputation.lock_ttl_ms, 10_000);
    assert_eq!(config.rate_limiting.admin_limit, 30);
    assert!(!config.security.trusted_proxies.is_empty());
}

#[test]
fn test_validate_rejects_bad_values() {
    let mut config = GatewayConfig::default();
    config.admin.jwt_secret = Some("s".to_string());
    assert!(config.validate().is_ok());

    let mut bad = config.clone();
    bad.redis.url = String::new();
    assert!(bad.validate().is_err());

    let mut bad = config.clone();
    bad.rate_limiting.default_refill_tokens = 0.0;
    assert!(bad.validate().is_err());

    let mut bad = config.clone();
    bad.rate_limiting.admin_window_secs = 0;
    assert!(bad.validate().is_err());

    let mut bad = config.clone();
    bad.reputation.lock_ttl_ms = 0;
    assert!(bad.validate().is_err());
}
