//! Host-to-guest call protocol.
//!
//! Every call follows the same sequence:
//!
//! 1. Serialize the input to JSON
//! 2. `allocate` a guest buffer and write the input into it
//! 3. Invoke the export with the packed input buffer
//! 4. Read the packed output buffer it returns
//! 5. `deallocate` both buffers, whatever happened before
//! 6. Decode the output as an [`Envelope`]

use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use wasmtime::TypedFunc;

use crate::ModuleInstance;
use crate::abi::{Envelope, GuestExport};
use crate::buffer::Buffer;
use waf_runtime_common::CallError;

impl ModuleInstance {
    /// Call a payload-bearing export of this instance.
    ///
    /// A trap anywhere in the sequence marks the instance as trapped.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the sequence; see [`CallError`].
    #[instrument(skip(self, input), fields(instance_id = self.id(), export = %export))]
    pub async fn call<I, O>(&mut self, export: GuestExport, input: &I) -> Result<O, CallError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let start = Instant::now();

        let func = self.export(export)?;
        let bytes = serde_json::to_vec(input).map_err(|e| CallError::Encode(e.to_string()))?;
        self.arm_limits()?;

        let result = self.exchange(&func, &bytes).await;
        self.store.data_mut().stats.calls += 1;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                if e.is_trap() {
                    self.mark_trapped();
                }
                debug!(error = %e, "Guest call failed");
                return Err(e);
            }
        };

        debug!(
            input_len = bytes.len(),
            output_len = output.len(),
            duration_us = start.elapsed().as_micros(),
            "Guest call completed"
        );

        let envelope: Envelope<O> =
            serde_json::from_slice(&output).map_err(|e| CallError::Decode(e.to_string()))?;
        envelope.into_result()
    }

    /// Move `bytes` in, run `func`, move the result out.
    async fn exchange(
        &mut self,
        func: &TypedFunc<u64, u64>,
        bytes: &[u8],
    ) -> Result<Vec<u8>, CallError> {
        let length = u32::try_from(bytes.len())
            .map_err(|_| CallError::Encode(format!("payload of {} bytes", bytes.len())))?;

        let abi = self.abi.clone();

        let input = abi.allocate(&mut self.store, length).await?;
        self.store.data_mut().stats.allocations += 1;

        let output = match abi.write(&mut self.store, input, bytes) {
            Ok(()) => func
                .call_async(&mut self.store, input.pack())
                .await
                .map(Buffer::unpack)
                .map_err(|e| CallError::GuestTrap(e.to_string())),
            Err(e) => Err(e),
        };

        if output.is_ok() {
            self.store.data_mut().stats.allocations += 1;
        }

        let read = output
            .as_ref()
            .map_err(Clone::clone)
            .and_then(|buffer| abi.read(&self.store, *buffer));

        let mut released = self.release(input, "input").await;
        if let Ok(buffer) = output {
            released = released.and(self.release(buffer, "output").await);
        }

        // A failed release leaves the guest allocator in an unknown state,
        // but the payload already read is still valid.
        if let Err(e) = released {
            self.mark_trapped();
            if read.is_ok() {
                warn!(error = %e, "Guest call succeeded but its buffers were not released");
            }
        }

        read
    }

    /// Deallocate one buffer, logging failures.
    async fn release(&mut self, buffer: Buffer, role: &'static str) -> Result<(), CallError> {
        self.store.data_mut().stats.deallocations += 1;

        let abi = self.abi.clone();
        abi.deallocate(&mut self.store, buffer).await.inspect_err(|e| {
            warn!(
                instance_id = self.id(),
                buffer = role,
                offset = buffer.offset,
                length = buffer.length,
                error = %e,
                "Failed to deallocate guest buffer"
            );
        })
    }
}
