//! Host name resolution capability.
//!
//! The coordinator runtime and the heartbeat transport receive a
//! [`Resolver`] at construction instead of reaching for a process-wide
//! lookup table.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use cxm_proto::defaults::DEFAULT_RESOLVER_TTL;
use cxm_proto::error::{CxmError, CxmResult};

/// Name to address lookups used by registration and the transport.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a host name to one IPv4 or IPv6 address.
    async fn resolve(&self, name: &str) -> CxmResult<IpAddr>;

    /// Expire any cached entry for `name`, so that the next lookup asks the
    /// system resolver again.
    fn forget(&self, name: &str);

    /// Address of the local node.
    fn local_ip(&self) -> IpAddr;

    /// Destination of broadcast heartbeats.
    fn broadcast(&self) -> IpAddr;
}

/// Last octet of an IPv4 address, 0 otherwise. Used to keep ballots apart.
pub fn ip_suffix(ip: IpAddr) -> u64 {
    match ip {
        IpAddr::V4(v4) => u64::from(v4.octets()[3]),
        IpAddr::V6(v6) => u64::from(v6.octets()[15]),
    }
}

struct CacheEntry {
    ip: IpAddr,
    expires: Instant,
}

/// System resolver with a small TTL cache.
pub struct DnsCache {
    local_ip: IpAddr,
    broadcast: IpAddr,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl DnsCache {
    /// Build a cache for the node named `local_name`.
    ///
    /// The broadcast address defaults to the limited broadcast
    /// 255.255.255.255 when none is configured.
    pub async fn new(local_name: &str, broadcast: Option<IpAddr>) -> CxmResult<Self> {
        let cache = Self {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast: broadcast.unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST)),
            ttl: DEFAULT_RESOLVER_TTL,
            entries: Mutex::new(HashMap::new()),
        };
        let local_ip = cache.resolve(local_name).await?;
        Ok(Self { local_ip, ..cache })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cached(&self, name: &str) -> Option<IpAddr> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .get(name)
            .filter(|e| e.expires > Instant::now())
            .map(|e| e.ip)
    }

    /// Address of `name` from an expired entry.
    fn last_known(&self, name: &str) -> Option<IpAddr> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(name).map(|e| e.ip)
    }
}

#[async_trait]
impl Resolver for DnsCache {
    async fn resolve(&self, name: &str) -> CxmResult<IpAddr> {
        if let Some(ip) = self.cached(name) {
            return Ok(ip);
        }

        let lookup = match tokio::net::lookup_host((name, 0)).await {
            Ok(mut addrs) => addrs
                .next()
                .map(|a| a.ip())
                .ok_or_else(|| CxmError::NodeRefused(format!("no address for {}", name))),
            Err(e) => Err(CxmError::NodeRefused(format!("cannot resolve {}: {}", name, e))),
        };
        let ip = match lookup {
            Ok(ip) => ip,
            Err(e) => match self.last_known(name) {
                Some(ip) => {
                    warn!("resolver: {}, keeping {} for now", e, ip);
                    return Ok(ip);
                }
                None => {
                    warn!("resolver: {}", e);
                    return Err(e);
                }
            },
        };

        debug!("resolver: resolved {} to {}", name, ip);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            name.to_string(),
            CacheEntry {
                ip,
                expires: Instant::now() + self.ttl,
            },
        );
        Ok(ip)
    }

    fn forget(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = entries.get_mut(name) {
            entry.expires = Instant::now();
        }
    }

    fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    fn broadcast(&self) -> IpAddr {
        self.broadcast
    }
}

/// Fixed name table, for nodes declared with explicit addresses.
pub struct StaticResolver {
    local_ip: IpAddr,
    broadcast: IpAddr,
    table: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new(local_ip: IpAddr, broadcast: IpAddr, table: HashMap<String, IpAddr>) -> Self {
        Self {
            local_ip,
            broadcast,
            table,
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> CxmResult<IpAddr> {
        self.table
            .get(name)
            .copied()
            .ok_or_else(|| CxmError::NodeRefused(format!("cannot resolve {}", name)))
    }

    fn forget(&self, _name: &str) {}

    fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    fn broadcast(&self) -> IpAddr {
        self.broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dns_cache_resolves_literals() {
        let cache = DnsCache::new("127.0.0.1", None).await.unwrap();
        assert_eq!(cache.local_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cache.broadcast(), IpAddr::V4(Ipv4Addr::BROADCAST));

        let ip = cache.resolve("10.0.0.7").await.unwrap();
        assert_eq!(ip, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(cache.cached("10.0.0.7"), Some(ip));

        cache.forget("10.0.0.7");
        assert_eq!(cache.cached("10.0.0.7"), None);
        assert_eq!(cache.last_known("10.0.0.7"), Some(ip));
    }

    #[tokio::test]
    async fn test_dns_cache_keeps_the_last_known_address() {
        let cache = DnsCache::new("127.0.0.1", None)
            .await
            .unwrap()
            .with_ttl(Duration::ZERO);
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        cache.entries.lock().unwrap().insert(
            "node9.invalid".to_string(),
            CacheEntry {
                ip,
                expires: Instant::now(),
            },
        );

        assert_eq!(cache.resolve("node9.invalid").await.unwrap(), ip);
        assert!(matches!(
            cache.resolve("other.invalid").await,
            Err(CxmError::NodeRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_dns_cache_entries_expire() {
        let cache = DnsCache::new("127.0.0.1", Some("10.0.0.255".parse().unwrap()))
            .await
            .unwrap()
            .with_ttl(Duration::ZERO);
        cache.resolve("10.0.0.7").await.unwrap();
        assert_eq!(cache.cached("10.0.0.7"), None);
        assert_eq!(cache.broadcast(), "10.0.0.255".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_static_resolver_refuses_unknown_hosts() {
        let table: HashMap<String, IpAddr> = [("node1".to_string(), "10.0.0.1".parse().unwrap())]
            .into_iter()
            .collect();
        let r = StaticResolver::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.255".parse().unwrap(),
            table,
        );
        assert_eq!(r.resolve("node1").await.unwrap(), r.local_ip());
        assert!(matches!(
            r.resolve("ghost").await,
            Err(CxmError::NodeRefused(_))
        ));
    }

    #[test]
    fn test_ip_suffix() {
        assert_eq!(ip_suffix("10.0.0.42".parse().unwrap()), 42);
        assert_eq!(ip_suffix("::1".parse().unwrap()), 1);
    }
}
