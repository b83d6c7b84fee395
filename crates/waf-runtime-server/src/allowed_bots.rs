//! Addresses of bots the guest has already verified.
//!
//! A verified address skips the guest for the configured TTL. The cache is
//! shared by every request task; concurrent inserts of the same address are
//! harmless.

use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use waf_runtime_common::FilterConfig;

/// TTL cache of verified bot addresses.
#[derive(Debug)]
pub struct AllowedBotIps {
    entries: DashMap<IpAddr, Instant>,
    ttl: Duration,
    capacity: usize,
}

impl AllowedBotIps {
    /// Create an empty cache holding at most `capacity` addresses for `ttl`.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Create a cache sized by the filter configuration.
    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.allowed_bot_ttl(), config.allowed_bot_capacity)
    }

    /// Whether `ip` was verified less than one TTL ago.
    ///
    /// An expired entry is removed on lookup.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let now = Instant::now();

        match self.entries.get(ip).map(|expires_at| *expires_at) {
            Some(expires_at) if expires_at > now => true,
            Some(_) => {
                self.entries.remove_if(ip, |_, expires_at| *expires_at <= now);
                false
            }
            None => false,
        }
    }

    /// Remember `ip` as verified, refreshing its TTL if already present.
    ///
    /// When the cache is full, expired entries are purged first, then the
    /// entry closest to expiry is evicted.
    pub fn insert(&self, ip: IpAddr) {
        let now = Instant::now();

        if !self.entries.contains_key(&ip) && self.entries.len() >= self.capacity {
            self.make_room(now);
        }

        self.entries.insert(ip, now + self.ttl);
    }

    /// Number of cached addresses, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no address.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self, now: Instant) {
        self.entries.retain(|_, expires_at| *expires_at > now);

        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| *entry.value())
                .map(|entry| *entry.key());

            match oldest {
                Some(ip) => {
                    debug!(ip_address = %ip, "Evicting verified bot address");
                    self.entries.remove(&ip);
                }
                None => break,
            }
        }
    }
}
