//! Host side of the waf-runtime guest interface.
//!
//! This crate provides what the guest module imports and the runtime object
//! the HTTP layer talks to.
//!
//! # Modules
//!
//! - [`dns`]: Reverse-DNS resolution over a fixed set of public resolvers
//! - [`linker`]: Registration of `env::dns_lookup_ip_address` and WASI
//! - [`runtime`]: [`RuntimeHandle`], built once from the guest binary
//!
//! # Failure Model
//!
//! Host functions never trap the guest. A failed lookup is written back as
//! an error envelope; deciding what it means is left to the guest.

pub mod dns;
pub mod linker;
pub mod runtime;

pub use dns::{HickoryPtrLookup, LookupFailure, PtrLookup, ReverseDnsResolver};
pub use runtime::RuntimeHandle;
