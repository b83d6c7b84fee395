//! Core Wasmtime runtime for waf-runtime.
//!
//! This crate provides the fundamental WebAssembly execution capabilities:
//! - [`WasmEngine`]: Configured Wasmtime engine with pooling allocator
//! - [`CompiledModule`]: The guest binary, compiled once per process
//! - [`GuestContext`]: Per-instance store state
//! - [`Buffer`] / [`GuestAbi`]: Bounds-checked access to guest memory
//! - [`ModuleInstance`]: One instance and its call protocol
//! - [`InstancePool`]: Lazy creation and recycling of instances
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared across all requests, thread-safe)              │
//! │  - Pooling Allocator                                    │
//! │  - Fuel metering / epoch interruption                   │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │           InstancePool (CompiledModule + Linker)        │
//! │  (Compiled once, shared read-only)                      │
//! │  - get() / put() / close()                              │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │       ModuleInstance (Store<GuestContext> + exports)    │
//! │  (Borrowed by one request at a time)                    │
//! │  - allocate → write → call → read → deallocate          │
//! │  - Linear memory                                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod abi;
pub mod buffer;
pub mod codec;
pub mod engine;
pub mod instance;
pub mod module;
pub mod pool;
pub mod store;

pub use abi::{
    AnalyzeRequestInput, AnalyzeRequestOutput, Envelope, GuestExport, LookupHostInput,
    LookupHostOutput, Outcome,
};
pub use buffer::{Buffer, GuestAbi};
pub use engine::WasmEngine;
pub use instance::ModuleInstance;
pub use module::CompiledModule;
pub use pool::{InstancePool, PoolStats};
pub use store::{CallStats, GuestContext};
