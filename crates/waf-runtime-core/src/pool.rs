//! Module instance pool.
//!
//! The pool owns the compiled guest and the host linker, and lends
//! [`ModuleInstance`]s to callers:
//!
//! - [`InstancePool::get`] hands out an idle instance or creates one; it
//!   never waits, and yields `None` when no instance can be had
//! - [`InstancePool::put`] returns an instance after use
//! - [`InstancePool::close`] drains the idle set at shutdown
//!
//! Every live instance holds a [`LiveSlot`]. Dropping the instance, whether
//! discarded by the pool or abandoned by a cancelled caller, frees its slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use wasmtime::Linker;

use crate::store::GuestContext;
use crate::{CompiledModule, ModuleInstance, WasmEngine};
use waf_runtime_common::{ExecutionConfig, PoolConfig};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Instances waiting in the idle set.
    pub idle: usize,
    /// Instances alive, idle or borrowed.
    pub live: usize,
    /// Instances created since startup.
    pub created: u64,
    /// Instances dropped since startup.
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    live: AtomicUsize,
    created: AtomicU64,
}

/// Reservation of one live-instance slot.
pub struct LiveSlot {
    counters: Arc<Counters>,
}

impl LiveSlot {
    fn reserve(counters: &Arc<Counters>, max: usize) -> Option<Self> {
        counters
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .ok()
            .map(|_| Self {
                counters: Arc::clone(counters),
            })
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pool of guest instances sharing one compiled module.
///
/// # Thread Safety
///
/// The pool is shared behind an `Arc`. The idle set is the only state under
/// a lock; a borrowed instance is owned by its borrower alone.
pub struct InstancePool {
    engine: WasmEngine,
    module: CompiledModule,
    linker: Linker<GuestContext>,
    execution: ExecutionConfig,
    config: PoolConfig,
    idle: Mutex<Vec<ModuleInstance>>,
    counters: Arc<Counters>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InstancePool {
    /// Create an empty pool. Instances are created lazily by [`Self::get`].
    ///
    /// `linker` must already carry every host function the guest imports.
    pub fn new(
        engine: WasmEngine,
        module: CompiledModule,
        linker: Linker<GuestContext>,
        execution: ExecutionConfig,
        config: PoolConfig,
    ) -> Self {
        info!(
            content_hash = module.content_hash(),
            max_instances = config.max_instances,
            max_idle = config.max_idle,
            "Instance pool created"
        );

        Self {
            engine,
            module,
            linker,
            execution,
            config,
            idle: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow an instance.
    ///
    /// Returns an idle instance when one exists, otherwise instantiates a
    /// new one. Returns `None` when the pool is closed, the live limit is
    /// reached, or instantiation fails.
    pub async fn get(&self) -> Option<ModuleInstance> {
        if self.closed.load(Ordering::Acquire) {
            warn!("Instance requested from a closed pool");
            return None;
        }

        let idle = self.idle.lock().pop();
        if let Some(instance) = idle {
            return Some(instance);
        }

        let Some(slot) = LiveSlot::reserve(&self.counters, self.config.max_instances) else {
            warn!(
                max_instances = self.config.max_instances,
                "Instance limit reached"
            );
            return None;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match ModuleInstance::new(
            &self.engine,
            &self.module,
            &self.linker,
            &self.execution,
            id,
        )
        .await
        {
            Ok(mut instance) => {
                instance.slot = Some(slot);
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Some(instance)
            }
            Err(e) => {
                error!(instance_id = id, error = %e, "Failed to instantiate guest module");
                None
            }
        }
    }

    /// Return a borrowed instance.
    ///
    /// The instance is dropped instead of re-pooled when it trapped (and
    /// `discard_trapped` is set), when the idle set is full, or when the
    /// pool is closed.
    pub fn put(&self, instance: ModuleInstance) {
        let reason = if self.closed.load(Ordering::Acquire) {
            Some("pool closed")
        } else if instance.is_trapped() && self.config.discard_trapped {
            Some("instance trapped")
        } else {
            None
        };

        if let Some(reason) = reason {
            debug!(instance_id = instance.id(), reason, "Discarding instance");
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            drop(idle);
            debug!(
                instance_id = instance.id(),
                reason = "idle set full",
                "Discarding instance"
            );
            return;
        }

        idle.push(instance);
    }

    /// Close the pool and drop every idle instance.
    ///
    /// Borrowed instances are dropped when returned. Further calls to
    /// [`Self::get`] yield `None`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained = std::mem::take(&mut *self.idle.lock());
        let count = drained.len();
        drop(drained);

        info!(
            closed = count,
            still_borrowed = self.counters.live.load(Ordering::Acquire),
            "Instance pool closed"
        );
    }

    /// Returns `true` once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let live = self.counters.live.load(Ordering::Acquire);
        let created = self.counters.created.load(Ordering::Relaxed);

        PoolStats {
            idle,
            live,
            created,
            discarded: created.saturating_sub(live as u64),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The compiled guest shared by all instances.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// The engine instances are created in.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_slot_reservation() {
        let counters = Arc::new(Counters::default());

        let first = LiveSlot::reserve(&counters, 2).unwrap();
        let second = LiveSlot::reserve(&counters, 2).unwrap();
        assert!(LiveSlot::reserve(&counters, 2).is_none());
        assert_eq!(counters.live.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(counters.live.load(Ordering::Acquire), 1);

        let third = LiveSlot::reserve(&counters, 2);
        assert!(third.is_some());

        drop(second);
        drop(third);
        assert_eq!(counters.live.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_zero_capacity() {
        let counters = Arc::new(Counters::default());
        assert!(LiveSlot::reserve(&counters, 0).is_none());
    }
}
