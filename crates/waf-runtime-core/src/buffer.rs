//! Guest memory buffers.
//!
//! A [`Buffer`] names a region of one instance's linear memory as an
//! `(offset, length)` pair packed into a `u64`: offset in the high 32 bits,
//! length in the low 32 bits.
//!
//! [`GuestAbi`] bundles the guest's `memory`, `allocate` and `deallocate`
//! exports. Every read and write is validated against the memory size at
//! the time of access. It works on anything implementing
//! [`AsContextMut`], so host-to-guest calls (through a [`wasmtime::Store`])
//! and guest-to-host callbacks (through a [`Caller`]) share one code path.

use std::ops::Range;

use wasmtime::{AsContext, AsContextMut, Caller, Extern, Instance, Memory, TypedFunc};

use crate::store::GuestContext;
use waf_runtime_common::{CallError, RuntimeError};

/// Name of the exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";
/// Name of the guest allocator export.
pub const ALLOCATE_EXPORT: &str = "allocate";
/// Name of the guest deallocator export.
pub const DEALLOCATE_EXPORT: &str = "deallocate";

/// A region of guest linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Buffer {
    pub offset: u32,
    pub length: u32,
}

impl Buffer {
    pub fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    /// Pack into the wire representation.
    pub fn pack(self) -> u64 {
        (u64::from(self.offset) << 32) | u64::from(self.length)
    }

    /// Unpack from the wire representation.
    pub fn unpack(packed: u64) -> Self {
        Self {
            offset: (packed >> 32) as u32,
            length: (packed & 0xffff_ffff) as u32,
        }
    }

    /// Byte range of this buffer, if it lies within `memory_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MemoryBounds`] if `offset + length` overflows or
    /// exceeds the memory size.
    pub fn range(self, memory_size: usize) -> Result<Range<usize>, CallError> {
        let start = self.offset as usize;
        let end = start
            .checked_add(self.length as usize)
            .filter(|end| *end <= memory_size)
            .ok_or(CallError::MemoryBounds {
                offset: self.offset,
                length: self.length,
                memory_size,
            })?;

        Ok(start..end)
    }
}

/// Handles to the memory and allocator exports of one instance.
///
/// Only the guest manages its linear memory: the host never writes outside
/// a buffer the guest handed out through `allocate`.
#[derive(Clone)]
pub struct GuestAbi {
    memory: Memory,
    allocate: TypedFunc<u32, u64>,
    deallocate: TypedFunc<u64, ()>,
}

impl GuestAbi {
    /// Resolve the exports from a freshly created instance.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingExport`] if an export is absent or has
    /// the wrong signature.
    pub fn from_instance(
        mut store: impl AsContextMut<Data = GuestContext>,
        instance: &Instance,
    ) -> Result<Self, RuntimeError> {
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::missing_export(MEMORY_EXPORT, "not exported"))?;

        let allocate = instance
            .get_typed_func::<u32, u64>(&mut store, ALLOCATE_EXPORT)
            .map_err(|e| RuntimeError::missing_export(ALLOCATE_EXPORT, e.to_string()))?;

        let deallocate = instance
            .get_typed_func::<u64, ()>(&mut store, DEALLOCATE_EXPORT)
            .map_err(|e| RuntimeError::missing_export(DEALLOCATE_EXPORT, e.to_string()))?;

        Ok(Self {
            memory,
            allocate,
            deallocate,
        })
    }

    /// Resolve the exports of the instance calling into a host function.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ExportMissing`] if an export is absent or has
    /// the wrong signature.
    pub fn from_caller(caller: &mut Caller<'_, GuestContext>) -> Result<Self, CallError> {
        let memory = caller
            .get_export(MEMORY_EXPORT)
            .and_then(Extern::into_memory)
            .ok_or_else(|| CallError::ExportMissing(MEMORY_EXPORT.into()))?;

        let allocate = caller
            .get_export(ALLOCATE_EXPORT)
            .and_then(Extern::into_func)
            .ok_or_else(|| CallError::ExportMissing(ALLOCATE_EXPORT.into()))?
            .typed::<u32, u64>(&*caller)
            .map_err(|e| CallError::ExportMissing(format!("{ALLOCATE_EXPORT}: {e}")))?;

        let deallocate = caller
            .get_export(DEALLOCATE_EXPORT)
            .and_then(Extern::into_func)
            .ok_or_else(|| CallError::ExportMissing(DEALLOCATE_EXPORT.into()))?
            .typed::<u64, ()>(&*caller)
            .map_err(|e| CallError::ExportMissing(format!("{DEALLOCATE_EXPORT}: {e}")))?;

        Ok(Self {
            memory,
            allocate,
            deallocate,
        })
    }

    /// Current size of the guest's linear memory in bytes.
    pub fn memory_size(&self, store: impl AsContext) -> usize {
        self.memory.data_size(&store)
    }

    /// Ask the guest to reserve `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Allocation`] if the guest allocator traps.
    pub async fn allocate(
        &self,
        mut store: impl AsContextMut<Data = GuestContext>,
        length: u32,
    ) -> Result<Buffer, CallError> {
        let packed = self
            .allocate
            .call_async(&mut store, length)
            .await
            .map_err(|e| CallError::Allocation(format!("allocate({length}): {e}")))?;

        Ok(Buffer::unpack(packed))
    }

    /// Hand a buffer back to the guest allocator.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Allocation`] if the guest deallocator traps.
    pub async fn deallocate(
        &self,
        mut store: impl AsContextMut<Data = GuestContext>,
        buffer: Buffer,
    ) -> Result<(), CallError> {
        self.deallocate
            .call_async(&mut store, buffer.pack())
            .await
            .map_err(|e| CallError::Allocation(format!("deallocate({buffer:?}): {e}")))
    }

    /// Copy the contents of `buffer` out of guest memory.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::MemoryBounds`] if the buffer does not lie within
    /// the current memory.
    pub fn read(&self, store: impl AsContext, buffer: Buffer) -> Result<Vec<u8>, CallError> {
        let data = self.memory.data(&store);
        let range = buffer.range(data.len())?;
        Ok(data[range].to_vec())
    }

    /// Copy `bytes` into guest memory at the start of `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Allocation`] if the buffer is shorter than
    /// `bytes`, and [`CallError::MemoryBounds`] if it does not lie within the
    /// current memory.
    pub fn write(
        &self,
        mut store: impl AsContextMut,
        buffer: Buffer,
        bytes: &[u8],
    ) -> Result<(), CallError> {
        let length = u32::try_from(bytes.len())
            .ok()
            .filter(|length| *length <= buffer.length)
            .ok_or_else(|| {
                CallError::Allocation(format!(
                    "guest buffer of {} bytes cannot hold {} bytes",
                    buffer.length,
                    bytes.len()
                ))
            })?;

        let data = self.memory.data_mut(&mut store);
        let range = Buffer::new(buffer.offset, length).range(data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Allocate a buffer sized for `bytes` and fill it.
    ///
    /// The buffer is released again if the write fails.
    ///
    /// # Errors
    ///
    /// Returns the allocation or write error.
    pub async fn write_new(
        &self,
        mut store: impl AsContextMut<Data = GuestContext>,
        bytes: &[u8],
    ) -> Result<Buffer, CallError> {
        let length = u32::try_from(bytes.len())
            .map_err(|_| CallError::Encode(format!("payload of {} bytes", bytes.len())))?;

        let buffer = self.allocate(&mut store, length).await?;

        if let Err(e) = self.write(&mut store, buffer, bytes) {
            if let Err(dealloc) = self.deallocate(&mut store, buffer).await {
                tracing::warn!(error = %dealloc, "Failed to release guest buffer after write error");
            }
            return Err(e);
        }

        Ok(buffer)
    }
}

impl std::fmt::Debug for GuestAbi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestAbi").finish_non_exhaustive()
    }
}
