//! Host function registration for Wasmtime linkers.
//!
//! This module provides functions to register host functions on the linker
//! every guest instance is created from:
//! - WASI preview1, for guests built against `wasm32-wasip1`
//! - `env::dns_lookup_ip_address`, the reverse-DNS callback

use tracing::warn;
use wasmtime::{Caller, Linker};

use crate::dns::ReverseDnsResolver;
use waf_runtime_common::RuntimeError;
use waf_runtime_core::{Buffer, Envelope, GuestAbi, GuestContext, LookupHostInput, LookupHostOutput};

/// Module name of the host functions.
pub const HOST_MODULE: &str = "env";

/// Name of the reverse-DNS host function.
pub const DNS_LOOKUP_FUNCTION: &str = "dns_lookup_ip_address";

/// Register all host functions on a core module linker.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(
    linker: &mut Linker<GuestContext>,
    resolver: ReverseDnsResolver,
) -> Result<(), RuntimeError> {
    register_wasi(linker)?;
    register_dns_lookup(linker, resolver)?;
    Ok(())
}

/// Register the WASI preview1 imports.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_wasi(linker: &mut Linker<GuestContext>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, GuestContext::wasi_mut)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register WASI: {e}")))
}

/// Register the reverse-DNS host function.
///
/// Registers `env::dns_lookup_ip_address(buf: i64) -> i64`.
///
/// # Memory Protocol
///
/// The guest passes a packed buffer holding a JSON `LookupHostInput`; the
/// buffer stays owned by the guest. The host answers with a new buffer,
/// obtained from the guest's `allocate`, holding a JSON envelope:
/// - `{"ok": {"hostname": ...}}` on success (empty hostname when the
///   address has no PTR record)
/// - `{"error": ...}` when the input cannot be read or every DNS attempt
///   failed
///
/// When not even the error envelope can be written back, the packed buffer
/// `0` is returned. The guest owns the returned buffer.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_dns_lookup(
    linker: &mut Linker<GuestContext>,
    resolver: ReverseDnsResolver,
) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            HOST_MODULE,
            DNS_LOOKUP_FUNCTION,
            move |mut caller: Caller<'_, GuestContext>, (input,): (u64,)| {
                let resolver = resolver.clone();
                Box::new(async move {
                    dns_lookup_ip_address(&mut caller, &resolver, Buffer::unpack(input)).await
                })
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!(
                "Failed to register {DNS_LOOKUP_FUNCTION} function: {e}"
            ))
        })?;

    Ok(())
}

async fn dns_lookup_ip_address(
    caller: &mut Caller<'_, GuestContext>,
    resolver: &ReverseDnsResolver,
    input: Buffer,
) -> u64 {
    let instance_id = caller.data().instance_id;

    let abi = match GuestAbi::from_caller(caller) {
        Ok(abi) => abi,
        Err(e) => {
            warn!(instance_id, error = %e, "Guest cannot receive host function output");
            return 0;
        }
    };

    let response = match lookup(caller, &abi, resolver, input).await {
        Ok(output) => serde_json::to_vec(&Envelope::ok(output)),
        Err(message) => serde_json::to_vec(&Envelope::<LookupHostOutput>::error(message)),
    };

    let written = match response {
        Ok(bytes) => abi.write_new(&mut *caller, &bytes).await,
        Err(e) => {
            warn!(instance_id, error = %e, "Failed to encode host function output");
            return 0;
        }
    };

    match written {
        Ok(buffer) => buffer.pack(),
        Err(e) => {
            warn!(instance_id, error = %e, "Failed to write host function output");
            write_error(caller, &abi, &e.to_string()).await
        }
    }
}

/// Read the request, resolve it, and describe any failure for the guest.
async fn lookup(
    caller: &mut Caller<'_, GuestContext>,
    abi: &GuestAbi,
    resolver: &ReverseDnsResolver,
    input: Buffer,
) -> Result<LookupHostOutput, String> {
    let bytes = abi
        .read(&*caller, input)
        .map_err(|e| format!("error reading host function call input data: {e}"))?;

    let request: LookupHostInput = serde_json::from_slice(&bytes)
        .map_err(|e| format!("error decoding host function call input data: {e}"))?;

    let hostname = resolver
        .resolve_host(request.ip_address)
        .await
        .map_err(|e| {
            warn!(
                ip_address = %request.ip_address,
                user_agent = %request.user_agent,
                error = %e,
                "Reverse DNS lookup failed"
            );
            e.to_string()
        })?;

    Ok(LookupHostOutput { hostname })
}

/// Last-resort error envelope; `0` if it cannot be written either.
async fn write_error(caller: &mut Caller<'_, GuestContext>, abi: &GuestAbi, message: &str) -> u64 {
    let Ok(bytes) = serde_json::to_vec(&Envelope::<LookupHostOutput>::error(message)) else {
        return 0;
    };

    abi.write_new(&mut *caller, &bytes)
        .await
        .map_or(0, Buffer::pack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waf_runtime_common::{DnsConfig, EngineConfig};
    use waf_runtime_core::WasmEngine;

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_register_wasi() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());

        assert!(register_wasi(&mut linker).is_ok());
    }

    #[tokio::test]
    async fn test_register_all() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());
        let resolver = ReverseDnsResolver::new(&DnsConfig::default()).unwrap();

        assert!(register_all(&mut linker, resolver).is_ok());

        let mut store = wasmtime::Store::new(engine.inner(), GuestContext::new(0));
        assert!(
            linker
                .get(&mut store, HOST_MODULE, DNS_LOOKUP_FUNCTION)
                .is_some()
        );
        assert!(
            linker
                .get(&mut store, "wasi_snapshot_preview1", "fd_write")
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let engine = engine();
        let mut linker = Linker::new(engine.inner());
        let resolver = ReverseDnsResolver::new(&DnsConfig::default()).unwrap();

        register_dns_lookup(&mut linker, resolver.clone()).unwrap();
        let result = register_dns_lookup(&mut linker, resolver);
        assert!(matches!(result, Err(RuntimeError::InvalidConfig { .. })));
    }
}
