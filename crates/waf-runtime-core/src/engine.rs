//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared by the compiled module and every instance
//! - Optionally configured with the pooling allocator for fast instantiation
//! - Set up with fuel metering and epoch interruption for per-call limits

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use waf_runtime_common::{EngineConfig, RuntimeError};

/// Interval between two epoch increments.
///
/// Call deadlines are expressed in milliseconds and converted to ticks
/// with this resolution.
pub const EPOCH_TICK: Duration = Duration::from_millis(1);

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// - **Pooling Allocator**: Pre-allocates memory slots for instances
/// - **Fuel Metering**: Deterministic CPU limit per guest call
/// - **Epoch Interruption**: Wall-clock deadline per guest call
/// - **Async Support**: Host callbacks (reverse DNS) run without blocking a worker thread
///
/// # Example
///
/// ```ignore
/// use waf_runtime_common::EngineConfig;
/// use waf_runtime_core::WasmEngine;
///
/// let config = EngineConfig::default();
/// let engine = WasmEngine::new(&config)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is invalid or the
    /// pooling allocator cannot reserve its slots.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        // Host callbacks are async: the DNS lookup awaits network I/O
        wasmtime_config.async_support(true);

        if config.fuel_metering {
            wasmtime_config.consume_fuel(true);
        }

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            fuel_metering = config.fuel_metering,
            epoch_interruption = config.epoch_interruption,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Spawn a background task advancing the epoch every [`EPOCH_TICK`].
    ///
    /// Returns `None` when epoch interruption is disabled. The task runs
    /// until aborted.
    pub fn spawn_epoch_ticker(&self) -> Option<JoinHandle<()>> {
        if !self.config.epoch_interruption {
            return None;
        }

        let engine = Arc::clone(&self.engine);
        debug!(tick_ms = EPOCH_TICK.as_millis(), "Starting epoch ticker");

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(EPOCH_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        }))
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("fuel_metering", &self.config.fuel_metering)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .finish_non_exhaustive()
    }
}
