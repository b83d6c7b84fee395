//! Error types for the waf-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Startup and infrastructure errors (the only kind that may abort)
//! - [`CallError`]: Failures of a single host/guest call
//! - [`DnsError`]: Reverse-DNS resolution failures
//! - [`FilterError`]: Everything the request analyzer fails open on

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures while bootstrapping the runtime: compiling
/// the guest, building the engine, or instantiating a module. A corrupt guest
/// binary surfaces here at startup.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Instantiating the compiled module failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// A required guest export is missing or has the wrong signature.
    #[error("Guest export '{name}' missing or mistyped: {reason}")]
    MissingExport {
        /// Export name.
        name: String,
        /// Underlying reason.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `MissingExport` error.
    pub fn missing_export(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingExport {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Failure of one call across the host/guest boundary.
///
/// Callers treat every variant the same way: this single call failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A buffer does not fit in the instance's current linear memory.
    #[error("Memory access out of bounds: offset {offset}, length {length}, memory size {memory_size}")]
    MemoryBounds {
        /// Buffer offset.
        offset: u32,
        /// Number of bytes accessed.
        length: u32,
        /// Current memory size in bytes.
        memory_size: usize,
    },

    /// The guest `allocate` or `deallocate` export trapped.
    #[error("Guest allocator failed: {0}")]
    Allocation(String),

    /// The target guest function trapped.
    #[error("Guest trapped: {0}")]
    GuestTrap(String),

    /// The guest answered with an explicit error envelope.
    #[error("Guest returned an error: {0}")]
    Application(String),

    /// The input could not be serialized.
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    /// The output could not be deserialized.
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// The requested export is not provided by this guest.
    #[error("Guest does not export '{0}'")]
    ExportMissing(String),
}

impl CallError {
    /// Returns `true` if the instance may be left in an inconsistent state.
    ///
    /// Traps abort guest code midway, so the guest's own bookkeeping
    /// (allocator, globals) can no longer be trusted.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::GuestTrap(_) | Self::Allocation(_))
    }
}

/// Reverse-DNS resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// Every attempt failed.
    #[error("Error resolving hosts for IP address ({ip}) after {attempts} attempts: {reason}")]
    Exhausted {
        /// The address that was looked up.
        ip: IpAddr,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure reason.
        reason: String,
    },
}

/// Failures the request analyzer recovers from by forwarding the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// No module instance could be borrowed or created.
    #[error("No module instance available")]
    PoolUnavailable,

    /// The guest call failed.
    #[error("analyze_request call failed: {0}")]
    Call(#[from] CallError),

    /// The guest returned an outcome this host does not know.
    #[error("Unknown outcome returned by guest")]
    UnknownOutcome,

    /// No verdict arrived within the analysis deadline.
    #[error("Request analysis timed out after {0} ms")]
    Timeout(u64),

    /// The task running the analysis panicked or was cancelled.
    #[error("Request analysis task failed: {0}")]
    Aborted(String),
}
