//! Geolocation lookup seam
//!
//! The gateway does not ship a geo database; deployments plug in whatever
//! resolver they run (an MMDB reader, a sidecar, a header set by the CDN).
//! Lookup failures behave as "no geo data" and are never fatal.

use std::collections::HashMap;
use std::net::IpAddr;

/// Synchronous country lookup for an IP
pub trait GeoLookup: Send + Sync {
    /// ISO-3166 alpha-2 country code, if known
    fn lookup(&self, ip: &IpAddr) -> Option<String>;
}

/// Lookup that knows nothing. Used when no resolver is configured;
/// country denylists are effectively inert with this in place.
#[derive(Debug, Default)]
pub struct NoGeoLookup;

impl GeoLookup for NoGeoLookup {
    fn lookup(&self, _ip: &IpAddr) -> Option<String> {
        None
    }
}

/// Fixed-table lookup, useful in tests and small deployments
#[derive(Debug, Default)]
pub struct StaticGeoLookup {
    entries: HashMap<IpAddr, String>,
}

impl StaticGeoLookup {
    pub fn new(entries: impl IntoIterator<Item = (IpAddr, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

impl GeoLookup for StaticGeoLookup {
    fn lookup(&self, ip: &IpAddr) -> Option<String> {
        self.entries.get(ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_lookup() {
        let geo = StaticGeoLookup::new([(
            "203.0.113.9".parse::<IpAddr>().unwrap(),
            "RU".to_string(),
        )]);

        assert_eq!(
            geo.lookup(&"203.0.113.9".parse().unwrap()),
            Some("RU".to_string())
        );
        assert_eq!(geo.lookup(&"8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_no_lookup() {
        assert_eq!(NoGeoLookup.lookup(&"8.8.8.8".parse().unwrap()), None);
    }
}
