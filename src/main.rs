//! Sentra Gateway - Edge API gateway policy pipeline
//!
//! A production-ready policy enforcement layer that:
//! - Derives the trusted client IP from forwarded headers
//! - Enforces IP/CIDR/country policy lists from a shared Redis store
//! - Blocks IPs with bad third-party reputation, with single-flight refresh
//! - Rate limits per API key, client IP, and admin user
//! - Exposes an admin API for mutating policy lists at runtime

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sentra_gateway::admin::AdminServer;
use sentra_gateway::config::GatewayConfig;
use sentra_gateway::geo::{GeoLookup, NoGeoLookup};
use sentra_gateway::pipeline::{policy_pipeline, GatewayState};
use sentra_gateway::policy::InvalidationBus;
use sentra_gateway::store::RedisStore;

/// Sentra Gateway - edge policy enforcement in front of backend services
#[derive(Parser, Debug)]
#[command(name = "sentra-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "/etc/sentra/config.toml",
        env = "SENTRA_CONFIG"
    )]
    config: PathBuf,

    /// Override the gateway listen port
    #[arg(long, env = "SENTRA_LISTEN_PORT")]
    port: Option<u16>,

    /// Override the admin API port
    #[arg(long, env = "SENTRA_ADMIN_PORT")]
    admin_port: Option<u16>,

    /// Override the shared store URL
    #[arg(long, env = "SENTRA_REDIS_URL")]
    redis_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SENTRA_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "SENTRA_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start the gateway)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Sentra Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    // Load configuration; a missing file means defaults
    let mut config = if args.config.exists() {
        GatewayConfig::load(&args.config).await?
    } else {
        warn!("Configuration file not found, using defaults");
        GatewayConfig::default()
    };

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.server.port = port;
        info!("Listen port overridden to: {}", port);
    }
    if let Some(port) = args.admin_port {
        config.admin.port = port;
        info!("Admin port overridden to: {}", port);
    }
    if let Some(url) = args.redis_url {
        config.redis.url = url;
    }

    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let config = Arc::new(config);

    // Connect to the shared store (pinging it up front)
    let store = Arc::new(RedisStore::connect(&config.redis).await?);

    // Geo lookup is a deployment seam; without a resolver country
    // denylists are inert
    let geo: Arc<dyn GeoLookup> = Arc::new(NoGeoLookup);

    let state = GatewayState::new(config.clone(), store.clone(), geo);

    // Install the policy snapshot before serving traffic; an empty snapshot
    // blocks nothing, so a failed bootstrap degrades rather than aborts
    if let Err(e) = state.policy.bootstrap().await {
        warn!("Policy bootstrap failed, starting with an empty snapshot: {e}");
    }

    // One dedicated subscriber connection per process
    let invalidation_handle =
        InvalidationBus::new(store.clone(), state.policy.clone()).spawn();

    // Build the gateway router with the pipeline installed
    let app = policy_pipeline(state.clone(), downstream_router());

    let addr = config.server.socket_addr()?;
    let listener = TcpListener::bind(addr).await?;

    print_startup_summary(&config);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let gateway_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    });

    let admin_task = tokio::spawn(AdminServer::new(state.clone()).run());

    shutdown_signal().await;
    info!("Shutdown signal received, draining in-flight requests");

    // Stop accepting new requests, then give in-flight ones a bounded window
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    match tokio::time::timeout(grace, gateway_task).await {
        Ok(result) => {
            if let Err(e) = result? {
                warn!("Gateway server error during shutdown: {e}");
            }
        }
        Err(_) => warn!("Drain window of {grace:?} elapsed, aborting remaining requests"),
    }

    // Subscriber connection goes first; the command pool is dropped last
    invalidation_handle.abort();
    admin_task.abort();

    info!("Sentra Gateway stopped");
    Ok(())
}

/// Downstream routes served behind the pipeline. Proxying to upstream
/// services is out of scope; deployments mount their own handlers here.
fn downstream_router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .fallback(fallback_handler)
}

async fn health_handler(Extension(store): Extension<Arc<RedisStore>>) -> impl IntoResponse {
    let store_ok = store.ping().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "version": sentra_gateway::VERSION,
        })),
    )
}

async fn fallback_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "No such route",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

/// Initialize the tracing subscriber
fn init_logging(log_level: &str, json_logs: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sentra_gateway={log_level},tower_http=warn")));

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received Ctrl+C");
}

/// Print startup summary
fn print_startup_summary(config: &GatewayConfig) {
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Sentra Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!(
        "  Gateway:       {}:{}",
        config.server.bind_address, config.server.port
    );
    if config.admin.enabled {
        info!(
            "  Admin API:     {}:{}",
            config.admin.bind_address, config.admin.port
        );
    } else {
        info!("  Admin API:     disabled");
    }
    info!("  Store prefix:  {:?}", config.redis.key_prefix);
    info!(
        "  Reputation:    threshold {} / cache {}s / lock {}ms",
        config.reputation.block_threshold,
        config.reputation.cache_ttl_secs,
        config.reputation.lock_ttl_ms
    );
    info!(
        "  Rate limits:   {} tokens, {:.3} tokens/s refill, admin {}/{}s",
        config.rate_limiting.default_capacity,
        config.rate_limiting.default_refill_rate(),
        config.rate_limiting.admin_limit,
        config.rate_limiting.admin_window_secs
    );
    info!(
        "  Trusted CIDRs: {} configured",
        config.security.trusted_proxies.len()
    );
    info!("═══════════════════════════════════════════════════════════════");
}
