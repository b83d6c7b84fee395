//! Per-instance store state.
//!
//! This module provides:
//! - [`GuestContext`]: State owned by one instance's store, reachable from host functions
//! - [`CallStats`]: Allocation bookkeeping of the call protocol
//! - [`create_store`]: Store construction with the engine's limits armed

use std::time::Instant;

use wasmtime::Store;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::WasmEngine;
use crate::engine::EPOCH_TICK;
use waf_runtime_common::{ExecutionConfig, RuntimeError};

/// State attached to one instance's [`Store`].
///
/// A store lives as long as its instance, across many pooled calls.
/// Host functions reach it through [`wasmtime::Caller::data`].
pub struct GuestContext {
    /// WASI preview1 context for guests built against `wasm32-wasip1`.
    wasi: WasiP1Ctx,

    /// Identifier of the owning instance, for tracing.
    pub instance_id: u64,

    /// Allocation bookkeeping of host-initiated calls.
    pub stats: CallStats,

    /// When the instance was created.
    pub created_at: Instant,
}

/// Buffer bookkeeping of host-initiated calls.
///
/// The host owns two buffers per call: the input it allocated and the output
/// the guest returned. Every call must leave both counters equal, whatever
/// its outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    /// Completed calls, successful or not.
    pub calls: u64,
    /// Buffers taken over by the host: allocated for an input or returned
    /// as an output.
    pub allocations: u64,
    /// `deallocate` invocations attempted.
    pub deallocations: u64,
}

impl CallStats {
    /// Buffers allocated by the host and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.allocations.saturating_sub(self.deallocations)
    }
}

impl GuestContext {
    /// Create the context for a new instance.
    pub fn new(instance_id: u64) -> Self {
        // Guest diagnostics go to the process streams; no filesystem, env or args
        let wasi = WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();

        Self {
            wasi,
            instance_id,
            stats: CallStats::default(),
            created_at: Instant::now(),
        }
    }

    /// WASI context, for linker registration.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }
}

/// Create a new Wasmtime store for one instance.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    instance_id: u64,
) -> Result<Store<GuestContext>, RuntimeError> {
    let mut store = Store::new(engine.inner(), GuestContext::new(instance_id));
    arm_limits(&mut store, engine, config)?;
    Ok(store)
}

/// Reset the fuel budget and epoch deadline ahead of a guest call.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn arm_limits(
    store: &mut Store<GuestContext>,
    engine: &WasmEngine,
    config: &ExecutionConfig,
) -> Result<(), RuntimeError> {
    if engine.config().fuel_metering {
        store
            .set_fuel(config.max_fuel)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }

    if engine.config().epoch_interruption {
        let tick_ms = u64::try_from(EPOCH_TICK.as_millis()).unwrap_or(1).max(1);
        store.set_epoch_deadline(config.timeout_ms.div_ceil(tick_ms).max(1));
    }

    Ok(())
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<GuestContext>) -> Option<u64> {
    store.get_fuel().ok()
}
