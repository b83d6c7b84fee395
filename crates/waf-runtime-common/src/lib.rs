//! Common types, errors, and configuration for waf-runtime.
//!
//! This crate provides shared functionality used across the waf-runtime workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the engine, pool, filters and resolver
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{DnsConfig, EngineConfig, ExecutionConfig, FilterConfig, PoolConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, GuestConfig, ServerConfigFile};
pub use error::{CallError, DnsError, FilterError, RuntimeError};
