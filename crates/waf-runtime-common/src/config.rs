//! Configuration structures for the waf-runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Engine, per-call limits and instance pool settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, fuel, epochs)
//! - [`ExecutionConfig`]: Per-call execution limits (fuel, timeout)
//! - [`PoolConfig`]: Module instance pool sizing
//! - [`FilterConfig`]: Request pre-filters, verified-bot cache and block delay
//! - [`DnsConfig`]: Reverse-DNS resolver pool and retry policy

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// Everything needed to turn a guest binary into a pool of callable
/// instances.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-call execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// When enabled, memory is pre-allocated for a pool of instance slots,
    /// reducing instantiation time from ~1ms to ~10µs.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Number of instance slots reserved by the pooling allocator.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption of guest calls.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Enable fuel metering of guest calls.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
            fuel_metering: defaults::fuel_metering(),
        }
    }
}

/// Per-call execution configuration.
///
/// Limits are re-armed before every call into the guest, so a pooled
/// instance gets a fresh budget for each request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Fuel granted to each call when fuel metering is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Call deadline in milliseconds when epoch interruption is enabled.
    ///
    /// Covers host callbacks made during the call, including DNS retries.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            timeout_ms: defaults::timeout_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Module instance pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Maximum number of live instances (idle plus borrowed).
    ///
    /// When reached and no instance is idle, borrowing yields nothing and
    /// the request is forwarded unfiltered.
    #[serde(default = "defaults::pool_max_instances")]
    pub max_instances: usize,

    /// Maximum number of idle instances kept for reuse.
    #[serde(default = "defaults::pool_max_idle")]
    pub max_idle: usize,

    /// Drop instances whose last call trapped instead of re-pooling them.
    #[serde(default = "defaults::discard_trapped")]
    pub discard_trapped: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: defaults::pool_max_instances(),
            max_idle: defaults::pool_max_idle(),
            discard_trapped: defaults::discard_trapped(),
        }
    }
}

/// Request filter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// ISO country codes blocked before any guest call.
    #[serde(default)]
    pub blocked_countries: HashSet<String>,

    /// Longest accepted `User-Agent` in bytes.
    #[serde(default = "defaults::max_user_agent_len")]
    pub max_user_agent_len: usize,

    /// Longest accepted path in bytes.
    #[serde(default = "defaults::max_path_len")]
    pub max_path_len: usize,

    /// Longest accepted method in bytes.
    #[serde(default = "defaults::max_method_len")]
    pub max_method_len: usize,

    /// How long a verified bot IP skips analysis, in seconds.
    #[serde(default = "defaults::allowed_bot_ttl_secs")]
    pub allowed_bot_ttl_secs: u64,

    /// Maximum number of verified bot IPs remembered.
    #[serde(default = "defaults::allowed_bot_capacity")]
    pub allowed_bot_capacity: usize,

    /// Lower bound of the delay before a blocked response, in milliseconds.
    #[serde(default = "defaults::block_delay_min_ms")]
    pub block_delay_min_ms: u64,

    /// Upper bound of the delay before a blocked response, in milliseconds.
    #[serde(default = "defaults::block_delay_max_ms")]
    pub block_delay_max_ms: u64,

    /// Longest wait for a guest verdict before forwarding, in milliseconds.
    ///
    /// Must stay below the server request timeout. A call still running
    /// when this elapses completes in the background.
    #[serde(default = "defaults::analysis_timeout_ms")]
    pub analysis_timeout_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_countries: HashSet::new(),
            max_user_agent_len: defaults::max_user_agent_len(),
            max_path_len: defaults::max_path_len(),
            max_method_len: defaults::max_method_len(),
            allowed_bot_ttl_secs: defaults::allowed_bot_ttl_secs(),
            allowed_bot_capacity: defaults::allowed_bot_capacity(),
            block_delay_min_ms: defaults::block_delay_min_ms(),
            block_delay_max_ms: defaults::block_delay_max_ms(),
            analysis_timeout_ms: defaults::analysis_timeout_ms(),
        }
    }
}

impl FilterConfig {
    /// Get the verified bot TTL as a `Duration`.
    pub fn allowed_bot_ttl(&self) -> Duration {
        Duration::from_secs(self.allowed_bot_ttl_secs)
    }

    /// Get the analysis deadline as a `Duration`.
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }
}

/// Reverse-DNS resolver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Public resolvers; one is picked at random for every attempt.
    #[serde(default = "defaults::nameservers")]
    pub nameservers: Vec<SocketAddr>,

    /// Total number of attempts per lookup.
    #[serde(default = "defaults::dns_attempts")]
    pub attempts: u32,

    /// Fixed delay between attempts in milliseconds.
    #[serde(default = "defaults::dns_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-query timeout in milliseconds.
    #[serde(default = "defaults::dns_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: defaults::nameservers(),
            attempts: defaults::dns_attempts(),
            retry_delay_ms: defaults::dns_retry_delay_ms(),
            timeout_ms: defaults::dns_timeout_ms(),
        }
    }
}

impl DnsConfig {
    /// Get the retry delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Get the per-query timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    use std::net::SocketAddr;

    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        256
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn fuel_metering() -> bool {
        false
    }

    pub const fn max_fuel() -> u64 {
        100_000_000
    }

    pub const fn timeout_ms() -> u64 {
        30_000
    }

    pub const fn pool_max_instances() -> usize {
        128
    }

    pub const fn pool_max_idle() -> usize {
        64
    }

    pub const fn discard_trapped() -> bool {
        true
    }

    pub const fn max_user_agent_len() -> usize {
        300
    }

    pub const fn max_path_len() -> usize {
        1024
    }

    pub const fn max_method_len() -> usize {
        20
    }

    pub const fn allowed_bot_ttl_secs() -> u64 {
        7 * 24 * 60 * 60
    }

    pub const fn allowed_bot_capacity() -> usize {
        20_000
    }

    pub const fn block_delay_min_ms() -> u64 {
        1000
    }

    pub const fn block_delay_max_ms() -> u64 {
        1500
    }

    pub const fn analysis_timeout_ms() -> u64 {
        10_000
    }

    pub fn nameservers() -> Vec<SocketAddr> {
        [
            ([8, 8, 8, 8], 53),
            ([1, 0, 0, 1], 53),
            ([8, 8, 4, 4], 53),
            ([1, 1, 1, 1], 53),
        ]
        .into_iter()
        .map(SocketAddr::from)
        .collect()
    }

    pub const fn dns_attempts() -> u32 {
        4
    }

    pub const fn dns_retry_delay_ms() -> u64 {
        50
    }

    pub const fn dns_timeout_ms() -> u64 {
        5000
    }
}
