//! Policy lists: in-memory snapshot, pub/sub invalidation, and the policy gate
//!
//! The shared store owns the four policy lists; every replica keeps a derived
//! in-memory [`PolicySnapshot`] so per-request checks never touch the store.
//! Snapshots are replaced by whole-object swap, so readers always observe one
//! consistent image. A `reload` message on the `invalidation` channel tells
//! every replica to rebuild its snapshot.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use futures::StreamExt;
use ipnet::IpNet;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client_ip::{is_private_or_local, ClientIp};
use crate::pipeline::{is_health_path, reject_response, GatewayState};
use crate::store::{RedisStore, StoreError};

/// Pub/sub channel carrying cache invalidations
pub const INVALIDATION_CHANNEL: &str = "invalidation";
/// The only payload the bus acts on
pub const RELOAD_PAYLOAD: &str = "reload";

/// Store keys holding the policy lists (prefixed via [`RedisStore::key`])
pub const KEY_ALLOW_IPS: &str = "geo:whitelist:ips";
pub const KEY_DENY_IPS: &str = "geo:blocklist:ips";
pub const KEY_DENY_CIDRS: &str = "geo:blocklist:cidrs";
pub const KEY_DENY_COUNTRIES: &str = "geo:blocklist:countries";

fn parse_ip_set<'a>(items: impl IntoIterator<Item = &'a str>) -> HashSet<IpAddr> {
    items
        .into_iter()
        .filter_map(|s| match s.trim().parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("Skipping unparseable IP policy entry '{s}'");
                None
            }
        })
        .collect()
}

/// Immutable image of the four policy lists
#[derive(Debug, Default, Clone)]
pub struct PolicySnapshot {
    ip_allow: HashSet<IpAddr>,
    ip_deny: HashSet<IpAddr>,
    cidr_deny: Vec<IpNet>,
    country_deny: HashSet<String>,
}

impl PolicySnapshot {
    /// Build a snapshot from raw list members, skipping entries that do not
    /// parse. Country codes are uppercased on insert.
    pub fn from_parts<'a>(
        allow_ips: impl IntoIterator<Item = &'a str>,
        deny_ips: impl IntoIterator<Item = &'a str>,
        deny_cidrs: impl IntoIterator<Item = &'a str>,
        deny_countries: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let ip_allow = parse_ip_set(allow_ips);
        let ip_deny = parse_ip_set(deny_ips);

        let cidr_deny = deny_cidrs
            .into_iter()
            .filter_map(|s| match s.trim().parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(_) => {
                    warn!("Skipping unparseable CIDR policy entry '{s}'");
                    None
                }
            })
            .collect();

        let country_deny = deny_countries
            .into_iter()
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            ip_allow,
            ip_deny,
            cidr_deny,
            country_deny,
        }
    }

    pub fn is_allowlisted(&self, ip: &IpAddr) -> bool {
        self.ip_allow.contains(ip)
    }

    /// Exact IP hit or membership in any denylisted CIDR
    pub fn is_denylisted(&self, ip: &IpAddr) -> bool {
        self.ip_deny.contains(ip) || self.cidr_deny.iter().any(|net| net.contains(ip))
    }

    /// Country codes are matched case-insensitively (uppercased on query)
    pub fn is_country_blocked(&self, country: &str) -> bool {
        self.country_deny.contains(&country.to_ascii_uppercase())
    }

    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.ip_allow.len(),
            self.ip_deny.len(),
            self.cidr_deny.len(),
            self.country_deny.len(),
        )
    }
}

/// Per-process policy cache with atomic snapshot swap
pub struct PolicyCache {
    store: Arc<RedisStore>,
    snapshot: ArcSwap<PolicySnapshot>,
    /// Serializes reloads; concurrent invalidations collapse via `dirty`
    reload_lock: tokio::sync::Mutex<()>,
    dirty: AtomicBool,
}

impl PolicyCache {
    /// Create a cache with an empty snapshot; call [`bootstrap`](Self::bootstrap)
    /// before serving traffic.
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self {
            store,
            snapshot: ArcSwap::from_pointee(PolicySnapshot::default()),
            reload_lock: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Fetch all four lists from the shared store and install the snapshot
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        self.fetch_install().await
    }

    /// Rebuild the snapshot from the shared store.
    ///
    /// Run-then-recheck: invalidations arriving while a reload is in flight
    /// mark the cache dirty and collapse into at most one follow-up reload.
    /// A failed reload keeps the previous snapshot in effect.
    pub async fn reload(&self) {
        self.dirty.store(true, Ordering::Release);

        let Ok(_guard) = self.reload_lock.try_lock() else {
            // An in-flight reload will observe the dirty flag
            return;
        };

        while self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.fetch_install().await {
                warn!("Policy reload failed, keeping previous snapshot: {e}");
            }
        }
    }

    async fn fetch_install(&self) -> Result<(), StoreError> {
        let allow_ips = self.store.smembers(&self.store.key(KEY_ALLOW_IPS)).await?;
        let deny_ips = self.store.smembers(&self.store.key(KEY_DENY_IPS)).await?;
        let deny_cidrs = self.store.smembers(&self.store.key(KEY_DENY_CIDRS)).await?;
        let deny_countries = self
            .store
            .smembers(&self.store.key(KEY_DENY_COUNTRIES))
            .await?;

        let snapshot = PolicySnapshot::from_parts(
            allow_ips.iter().map(String::as_str),
            deny_ips.iter().map(String::as_str),
            deny_cidrs.iter().map(String::as_str),
            deny_countries.iter().map(String::as_str),
        );

        let (allow, deny, cidrs, countries) = snapshot.counts();
        self.snapshot.store(Arc::new(snapshot));
        info!(
            allow, deny, cidrs, countries,
            "Policy snapshot installed"
        );

        Ok(())
    }

    /// The current snapshot; cheap, lock-free
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    pub fn is_allowlisted(&self, ip: &IpAddr) -> bool {
        self.snapshot.load().is_allowlisted(ip)
    }

    pub fn is_denylisted(&self, ip: &IpAddr) -> bool {
        self.snapshot.load().is_denylisted(ip)
    }

    pub fn is_country_blocked(&self, country: &str) -> bool {
        self.snapshot.load().is_country_blocked(country)
    }
}

impl std::fmt::Debug for PolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (allow, deny, cidrs, countries) = self.snapshot.load().counts();
        f.debug_struct("PolicyCache")
            .field("allow", &allow)
            .field("deny", &deny)
            .field("cidrs", &cidrs)
            .field("countries", &countries)
            .finish()
    }
}

/// Subscriber on the invalidation channel.
///
/// Holds the process's one dedicated pub/sub connection and triggers a cache
/// reload for each `reload` message. Reconnects with a short backoff when the
/// subscription drops.
pub struct InvalidationBus {
    store: Arc<RedisStore>,
    cache: Arc<PolicyCache>,
}

impl InvalidationBus {
    pub fn new(store: Arc<RedisStore>, cache: Arc<PolicyCache>) -> Self {
        Self { store, cache }
    }

    /// Spawn the subscriber loop; abort the handle on shutdown before the
    /// command pool is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        loop {
            match self.store.subscriber().await {
                Ok(mut pubsub) => {
                    if let Err(e) = pubsub.subscribe(INVALIDATION_CHANNEL).await {
                        warn!("Invalidation subscribe failed: {e}");
                    } else {
                        info!("Subscribed to '{INVALIDATION_CHANNEL}' channel");
                        let mut messages = pubsub.on_message();
                        while let Some(msg) = messages.next().await {
                            let payload: String = msg.get_payload().unwrap_or_default();
                            if payload == RELOAD_PAYLOAD {
                                debug!("Invalidation received, reloading policy snapshot");
                                self.cache.reload().await;
                            } else {
                                debug!("Ignoring unknown invalidation payload '{payload}'");
                            }
                        }
                        warn!("Invalidation subscription ended, reconnecting");
                    }
                }
                Err(e) => {
                    warn!("Invalidation subscriber connection failed: {e}");
                }
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Marker set by the policy gate when an allowlist hit forces a pass.
/// The reputation and rate-limit gates skip requests carrying it.
#[derive(Debug, Clone, Copy)]
pub struct AllowlistPass;

/// Policy gate: allowlist → denylist → country, after internal-traffic bypass
pub async fn policy_gate_middleware(
    State(state): State<GatewayState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if is_health_path(request.uri().path()) {
        return next.run(request).await;
    }

    let client_ip = request
        .extensions()
        .get::<ClientIp>()
        .copied()
        .unwrap_or(ClientIp(None));

    let Some(ip) = client_ip.0 else {
        debug!("Rejecting request without a resolvable client IP");
        return reject_response(StatusCode::BAD_REQUEST, "Invalid client IP");
    };

    // Direct internal traffic is not subject to policy lists. A private
    // address derived from a forwarded header is not direct and still goes
    // through the lists.
    let direct = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_canonical() == ip)
        .unwrap_or(false);
    if direct && is_private_or_local(&ip) {
        return next.run(request).await;
    }

    let snapshot = state.policy.current();

    // Allowlist dominates every other check, including the later gates
    if snapshot.is_allowlisted(&ip) {
        request.extensions_mut().insert(AllowlistPass);
        return next.run(request).await;
    }

    if snapshot.is_denylisted(&ip) {
        warn!("Blocked denylisted IP {ip}");
        return reject_response(StatusCode::FORBIDDEN, "Access denied");
    }

    // Geo lookup failure behaves as "no geo data"
    if let Some(country) = state.geo.lookup(&ip) {
        if snapshot.is_country_blocked(&country) {
            warn!("Blocked IP {ip} from denied country {country}");
            return reject_response(StatusCode::FORBIDDEN, "Access denied");
        }
    }

    next.run(request).await
}
