//! Reverse-DNS resolution for guest code.
//!
//! PTR lookups go to a fixed set of public resolvers rather than the
//! system resolver. Each attempt picks one at random; transient failures
//! are retried a fixed number of times with a fixed delay.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use rand::Rng;
use tracing::{debug, instrument, warn};

use waf_runtime_common::{DnsConfig, DnsError, RuntimeError};

/// Why a single lookup attempt produced no names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    /// The server answered that the address has no PTR records.
    NoRecords,
    /// Timeout, network or server failure; worth another attempt.
    Transient(String),
}

/// One PTR query against one nameserver.
#[async_trait]
pub trait PtrLookup: Send + Sync + 'static {
    /// Query `nameserver` for the PTR records of `ip`.
    async fn lookup_ptr(
        &self,
        nameserver: SocketAddr,
        ip: IpAddr,
    ) -> Result<Vec<String>, LookupFailure>;
}

/// [`PtrLookup`] backed by one hickory resolver per nameserver.
pub struct HickoryPtrLookup {
    resolvers: HashMap<SocketAddr, TokioAsyncResolver>,
}

impl HickoryPtrLookup {
    /// Build a resolver for every configured nameserver.
    ///
    /// Resolvers query over plain UDP (falling back to TCP on truncation),
    /// make a single attempt per query and ignore the hosts file.
    pub fn new(config: &DnsConfig) -> Self {
        let resolvers = config
            .nameservers
            .iter()
            .map(|addr| {
                let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
                let resolver_config = ResolverConfig::from_parts(None, vec![], group);

                let mut opts = ResolverOpts::default();
                opts.timeout = config.timeout();
                opts.attempts = 1;
                opts.use_hosts_file = false;

                (*addr, TokioAsyncResolver::tokio(resolver_config, opts))
            })
            .collect();

        Self { resolvers }
    }
}

#[async_trait]
impl PtrLookup for HickoryPtrLookup {
    async fn lookup_ptr(
        &self,
        nameserver: SocketAddr,
        ip: IpAddr,
    ) -> Result<Vec<String>, LookupFailure> {
        let resolver = self
            .resolvers
            .get(&nameserver)
            .ok_or_else(|| LookupFailure::Transient(format!("unknown nameserver {nameserver}")))?;

        match resolver.reverse_lookup(ip).await {
            Ok(lookup) => Ok(lookup.iter().map(ToString::to_string).collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(LookupFailure::NoRecords),
                _ => Err(LookupFailure::Transient(e.to_string())),
            },
        }
    }
}

/// Reverse-DNS resolver with server rotation and retries.
#[derive(Clone)]
pub struct ReverseDnsResolver {
    lookup: Arc<dyn PtrLookup>,
    nameservers: Vec<SocketAddr>,
    attempts: u32,
    retry_delay: Duration,
}

impl ReverseDnsResolver {
    /// Create a resolver querying the configured public nameservers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration names no nameserver or zero
    /// attempts.
    pub fn new(config: &DnsConfig) -> Result<Self, RuntimeError> {
        Self::with_lookup(config, Arc::new(HickoryPtrLookup::new(config)))
    }

    /// Create a resolver over a custom [`PtrLookup`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration names no nameserver or zero
    /// attempts.
    pub fn with_lookup(config: &DnsConfig, lookup: Arc<dyn PtrLookup>) -> Result<Self, RuntimeError> {
        if config.nameservers.is_empty() {
            return Err(RuntimeError::invalid_config("dns.nameservers must not be empty"));
        }
        if config.attempts == 0 {
            return Err(RuntimeError::invalid_config("dns.attempts must be at least 1"));
        }

        Ok(Self {
            lookup,
            nameservers: config.nameservers.clone(),
            attempts: config.attempts,
            retry_delay: config.retry_delay(),
        })
    }

    /// Resolve the hostname of `ip`.
    ///
    /// Returns the first usable name of the PTR answer, or an empty string
    /// when the address has none.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Exhausted`] when every attempt failed.
    #[instrument(skip(self))]
    pub async fn resolve_host(&self, ip: IpAddr) -> Result<String, DnsError> {
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            let nameserver = self.pick_nameserver();

            match self.lookup.lookup_ptr(nameserver, ip).await {
                Ok(names) => {
                    let host = first_hostname(&names);
                    debug!(%nameserver, attempt, host = %host, "Reverse lookup answered");
                    return Ok(host);
                }
                Err(LookupFailure::NoRecords) => {
                    debug!(%nameserver, attempt, "No PTR records");
                    return Ok(String::new());
                }
                Err(LookupFailure::Transient(reason)) => {
                    debug!(%nameserver, attempt, reason = %reason, "Reverse lookup failed");
                    last_error = reason;
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        warn!(attempts = self.attempts, reason = %last_error, "Reverse lookup exhausted");

        Err(DnsError::Exhausted {
            ip,
            attempts: self.attempts,
            reason: last_error,
        })
    }

    /// Uniform pick; `nameservers` is non-empty, checked in `with_lookup`.
    fn pick_nameserver(&self) -> SocketAddr {
        let index = rand::thread_rng().gen_range(0..self.nameservers.len());
        self.nameservers[index]
    }
}

impl std::fmt::Debug for ReverseDnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseDnsResolver")
            .field("nameservers", &self.nameservers)
            .field("attempts", &self.attempts)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

/// First non-empty name after normalization.
fn first_hostname(names: &[String]) -> String {
    names
        .iter()
        .find_map(|name| normalize_hostname(name))
        .unwrap_or_default()
}

/// Trim whitespace and the trailing root dot, and drop control characters
/// and replacement characters left by invalid input.
fn normalize_hostname(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .trim_end_matches('.')
        .chars()
        .filter(|c| !c.is_control() && *c != char::REPLACEMENT_CHARACTER)
        .collect();

    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}
