//! Module instance lifecycle.
//!
//! This module provides [`ModuleInstance`], one instantiation of the compiled
//! guest with its own store, linear memory and resolved exports:
//!
//! 1. Create a store with the per-call limits armed
//! 2. Instantiate the module against the host linker
//! 3. Run the guest's `_initialize` routine when exported
//! 4. Resolve `memory`, `allocate`, `deallocate`, `analyze_request` and,
//!    optionally, `verify_bot`

use std::time::Instant;

use tracing::{debug, instrument};
use wasmtime::{Linker, Store, TypedFunc};

use crate::abi::GuestExport;
use crate::buffer::GuestAbi;
use crate::pool::LiveSlot;
use crate::store::{CallStats, GuestContext, arm_limits, create_store};
use crate::{CompiledModule, WasmEngine};
use waf_runtime_common::{CallError, ExecutionConfig, RuntimeError};

/// Name of the reactor initialization export.
pub const INITIALIZE_EXPORT: &str = "_initialize";

/// One instance of the guest module.
///
/// An instance is not safe for concurrent use: every call takes
/// `&mut self`, so a borrower has it to itself until it hands it back.
pub struct ModuleInstance {
    id: u64,
    pub(crate) store: Store<GuestContext>,
    pub(crate) abi: GuestAbi,
    analyze_request: TypedFunc<u64, u64>,
    verify_bot: Option<TypedFunc<u64, u64>>,
    engine: WasmEngine,
    execution: ExecutionConfig,

    /// Set once a call trapped; guest state may be inconsistent afterwards.
    trapped: bool,

    /// Live-instance slot of the owning pool, released on drop.
    pub(crate) slot: Option<LiveSlot>,
}

impl ModuleInstance {
    /// Instantiate `module` and resolve its exports.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation or `_initialize` fails, or if a
    /// required export is missing.
    #[instrument(skip(engine, module, linker, execution))]
    pub async fn new(
        engine: &WasmEngine,
        module: &CompiledModule,
        linker: &Linker<GuestContext>,
        execution: &ExecutionConfig,
        id: u64,
    ) -> Result<Self, RuntimeError> {
        let start = Instant::now();
        let mut store = create_store(engine, execution, id)?;

        let instance = linker
            .instantiate_async(&mut store, module.inner())
            .await
            .map_err(|e| RuntimeError::instantiation_failed(e.to_string()))?;

        if let Some(init) = instance.get_func(&mut store, INITIALIZE_EXPORT) {
            let init = init
                .typed::<(), ()>(&store)
                .map_err(|e| RuntimeError::missing_export(INITIALIZE_EXPORT, e.to_string()))?;

            init.call_async(&mut store, ()).await.map_err(|e| {
                RuntimeError::instantiation_failed(format!("{INITIALIZE_EXPORT} trapped: {e}"))
            })?;
        }

        let abi = GuestAbi::from_instance(&mut store, &instance)?;

        let analyze_request = instance
            .get_typed_func::<u64, u64>(&mut store, GuestExport::AnalyzeRequest.name())
            .map_err(|e| {
                RuntimeError::missing_export(GuestExport::AnalyzeRequest.name(), e.to_string())
            })?;

        let verify_bot = match instance.get_func(&mut store, GuestExport::VerifyBot.name()) {
            Some(func) => Some(func.typed::<u64, u64>(&store).map_err(|e| {
                RuntimeError::missing_export(GuestExport::VerifyBot.name(), e.to_string())
            })?),
            None => None,
        };

        debug!(
            instance_id = id,
            verify_bot = verify_bot.is_some(),
            duration_us = start.elapsed().as_micros(),
            "Module instance created"
        );

        Ok(Self {
            id,
            store,
            abi,
            analyze_request,
            verify_bot,
            engine: engine.clone(),
            execution: execution.clone(),
            trapped: false,
            slot: None,
        })
    }

    /// Instance identifier, unique within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns `true` if a call on this instance trapped.
    pub fn is_trapped(&self) -> bool {
        self.trapped
    }

    /// Buffer bookkeeping of the calls made so far.
    pub fn stats(&self) -> CallStats {
        self.store.data().stats
    }

    /// Returns `true` if the guest exports `export`.
    pub fn has_export(&self, export: GuestExport) -> bool {
        match export {
            GuestExport::AnalyzeRequest => true,
            GuestExport::VerifyBot => self.verify_bot.is_some(),
        }
    }

    /// Handle of a payload-bearing export.
    pub(crate) fn export(&self, export: GuestExport) -> Result<TypedFunc<u64, u64>, CallError> {
        match export {
            GuestExport::AnalyzeRequest => Ok(self.analyze_request.clone()),
            GuestExport::VerifyBot => self
                .verify_bot
                .clone()
                .ok_or_else(|| CallError::ExportMissing(export.name().into())),
        }
    }

    /// Reset fuel and deadline ahead of a call.
    pub(crate) fn arm_limits(&mut self) -> Result<(), CallError> {
        arm_limits(&mut self.store, &self.engine, &self.execution)
            .map_err(|e| CallError::GuestTrap(e.to_string()))
    }

    pub(crate) fn mark_trapped(&mut self) {
        self.trapped = true;
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        let stats = self.stats();
        debug!(
            instance_id = self.id,
            calls = stats.calls,
            outstanding = stats.outstanding(),
            trapped = self.trapped,
            age_ms = self.store.data().created_at.elapsed().as_millis(),
            "Module instance closed"
        );
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("trapped", &self.trapped)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waf_runtime_common::EngineConfig;

    const MINIMAL_GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $init (mut i32) (i32.const 0))
            (func (export "_initialize") (global.set $init (i32.const 1)))
            (func (export "allocate") (param i32) (result i64) (i64.const 0))
            (func (export "deallocate") (param i64))
            (func (export "analyze_request") (param i64) (result i64) (i64.const 0))
        )
    "#;

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap()
    }

    async fn instantiate(wat: &str) -> Result<ModuleInstance, RuntimeError> {
        let engine = engine();
        let module = CompiledModule::from_wat(engine.inner(), wat).unwrap();
        let linker = Linker::new(engine.inner());
        ModuleInstance::new(&engine, &module, &linker, &ExecutionConfig::default(), 3).await
    }

    #[tokio::test]
    async fn test_instance_creation() {
        let instance = instantiate(MINIMAL_GUEST).await.unwrap();

        assert_eq!(instance.id(), 3);
        assert!(!instance.is_trapped());
        assert!(instance.has_export(GuestExport::AnalyzeRequest));
        assert!(!instance.has_export(GuestExport::VerifyBot));
        assert!(matches!(
            instance.export(GuestExport::VerifyBot),
            Err(CallError::ExportMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_analyze_request() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "allocate") (param i32) (result i64) (i64.const 0))
                (func (export "deallocate") (param i64))
            )
        "#;

        let result = instantiate(wat).await;
        assert!(matches!(
            result,
            Err(RuntimeError::MissingExport { name, .. }) if name == "analyze_request"
        ));
    }

    #[tokio::test]
    async fn test_mistyped_allocate() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "allocate") (param i32) (result i32) (i32.const 0))
                (func (export "deallocate") (param i64))
                (func (export "analyze_request") (param i64) (result i64) (i64.const 0))
            )
        "#;

        let result = instantiate(wat).await;
        assert!(matches!(
            result,
            Err(RuntimeError::MissingExport { name, .. }) if name == "allocate"
        ));
    }

    #[tokio::test]
    async fn test_trapping_initialize() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "_initialize") unreachable)
                (func (export "allocate") (param i32) (result i64) (i64.const 0))
                (func (export "deallocate") (param i64))
                (func (export "analyze_request") (param i64) (result i64) (i64.const 0))
            )
        "#;

        let result = instantiate(wat).await;
        assert!(matches!(result, Err(RuntimeError::InstantiationFailed { .. })));
    }

    #[tokio::test]
    async fn test_unresolved_import() {
        let wat = r#"
            (module
                (import "env" "dns_lookup_ip_address" (func (param i64) (result i64)))
                (memory (export "memory") 1)
            )
        "#;

        let result = instantiate(wat).await;
        assert!(matches!(result, Err(RuntimeError::InstantiationFailed { .. })));
    }
}
