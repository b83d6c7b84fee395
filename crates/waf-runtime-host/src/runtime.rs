//! Runtime bootstrap.
//!
//! [`RuntimeHandle`] is built once at process start from the guest binary
//! and shared with the HTTP layer. It owns the engine and the instance
//! pool; there is no global state.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, instrument};
use wasmtime::Linker;

use crate::dns::ReverseDnsResolver;
use crate::linker::register_all;
use waf_runtime_common::{DnsConfig, FilterError, RuntimeConfig, RuntimeError};
use waf_runtime_core::{
    AnalyzeRequestInput, AnalyzeRequestOutput, CompiledModule, GuestExport, InstancePool, Outcome,
    PoolStats, WasmEngine,
};

/// Shared handle to the guest runtime.
///
/// Cloning is cheap; all clones share one pool.
#[derive(Clone)]
pub struct RuntimeHandle {
    engine: WasmEngine,
    pool: Arc<InstancePool>,
}

impl RuntimeHandle {
    /// Compile `guest` and prepare the instance pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be created, the guest does not
    /// compile, or the configuration is invalid.
    pub fn new(
        config: &RuntimeConfig,
        dns: &DnsConfig,
        guest: &[u8],
    ) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&config.engine)?;
        let module = CompiledModule::from_bytes(engine.inner(), guest)?;
        let resolver = ReverseDnsResolver::new(dns)?;

        Self::with_module(engine, module, config, resolver)
    }

    /// Read the guest from `path`, then behave as [`Self::new`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or [`Self::new`] fails.
    pub fn from_file(
        config: &RuntimeConfig,
        dns: &DnsConfig,
        path: impl AsRef<Path>,
    ) -> Result<Self, RuntimeError> {
        let engine = WasmEngine::new(&config.engine)?;
        let module = CompiledModule::from_file(engine.inner(), path)?;
        let resolver = ReverseDnsResolver::new(dns)?;

        Self::with_module(engine, module, config, resolver)
    }

    /// Build the runtime around an already compiled module.
    ///
    /// Host functions are registered before any instance exists.
    ///
    /// # Errors
    ///
    /// Returns an error if host functions cannot be registered or the pool
    /// configuration is invalid.
    pub fn with_module(
        engine: WasmEngine,
        module: CompiledModule,
        config: &RuntimeConfig,
        resolver: ReverseDnsResolver,
    ) -> Result<Self, RuntimeError> {
        if config.pool.max_instances == 0 {
            return Err(RuntimeError::invalid_config(
                "pool.max_instances must be at least 1",
            ));
        }

        let mut linker = Linker::new(engine.inner());
        register_all(&mut linker, resolver)?;

        let pool = InstancePool::new(
            engine.clone(),
            module,
            linker,
            config.execution.clone(),
            config.pool.clone(),
        );

        Ok(Self {
            engine,
            pool: Arc::new(pool),
        })
    }

    /// Create one instance and return it to the pool.
    ///
    /// Surfaces a guest that compiles but cannot be instantiated at startup
    /// rather than on the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if no instance can be created.
    #[instrument(skip(self))]
    pub async fn warm_up(&self) -> Result<(), RuntimeError> {
        let instance = self.pool.get().await.ok_or_else(|| {
            RuntimeError::instantiation_failed("guest module could not be instantiated")
        })?;
        self.pool.put(instance);

        info!(stats = ?self.pool.stats(), "Guest runtime ready");
        Ok(())
    }

    /// Ask the guest for a verdict on one request.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::PoolUnavailable`] when no instance can be had,
    /// [`FilterError::Call`] when the call fails, and
    /// [`FilterError::UnknownOutcome`] when the guest answers with an
    /// outcome this host does not know.
    pub async fn analyze_request(&self, input: &AnalyzeRequestInput) -> Result<Outcome, FilterError> {
        let output: AnalyzeRequestOutput = self.call(GuestExport::AnalyzeRequest, input).await?;

        match output.outcome {
            Outcome::Unrecognized => Err(FilterError::UnknownOutcome),
            outcome => Ok(outcome),
        }
    }

    /// Call any payload-bearing export on a pooled instance.
    ///
    /// The instance goes back to the pool whatever the result.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::PoolUnavailable`] or [`FilterError::Call`].
    pub async fn call<I, O>(&self, export: GuestExport, input: &I) -> Result<O, FilterError>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let mut instance = self.pool.get().await.ok_or(FilterError::PoolUnavailable)?;
        let result = instance.call(export, input).await;
        self.pool.put(instance);

        Ok(result?)
    }

    /// Close the pool; later calls fail with [`FilterError::PoolUnavailable`].
    pub fn close(&self) {
        self.pool.close();
    }

    /// Pool occupancy.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The instance pool.
    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// The engine, for starting the epoch ticker.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("engine", &self.engine)
            .field("pool", &self.pool)
            .finish()
    }
}
