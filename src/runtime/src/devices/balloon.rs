//! Memory balloon: lets the host reclaim guest memory at runtime.

use crate::backend::vm_released;
use crate::vm::machine::MachineCore;
use std::sync::{Arc, Weak};
use vmbridge_core::error::{BridgeError, Result};

const MIB: u64 = 1024 * 1024;

/// Configuration of the (single) balloon device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBalloonDeviceConfiguration;

impl MemoryBalloonDeviceConfiguration {
    pub fn new() -> Self {
        Self
    }
}

/// Runtime balloon device of a VM.
///
/// Both accessors are synchronous but run on the VM queue.
#[derive(Clone)]
pub struct MemoryBalloonDevice {
    vm: Weak<MachineCore>,
    index: usize,
}

impl MemoryBalloonDevice {
    pub(crate) fn new(vm: Weak<MachineCore>, index: usize) -> Self {
        Self { vm, index }
    }

    fn core(&self) -> Result<Arc<MachineCore>> {
        self.vm.upgrade().ok_or_else(vm_released)
    }

    /// Memory the guest should be left with, in bytes.
    pub fn set_target_memory_size(&self, bytes: u64) -> Result<()> {
        let core = self.core()?;
        let configured = core.config.memory_size();
        if bytes > configured {
            return Err(BridgeError::InvalidFormat(format!(
                "balloon target {bytes} exceeds configured memory {configured}"
            )));
        }
        if bytes % MIB != 0 {
            return Err(BridgeError::InvalidFormat(format!(
                "balloon target {bytes} is not a multiple of 1 MiB"
            )));
        }
        let index = self.index;
        core.on_queue(move |core, native| {
            tracing::debug!(vm_id = %core.id, bytes, "setting balloon target");
            native.set_balloon_target(index, bytes);
            Ok(())
        })
    }

    pub fn target_memory_size(&self) -> Result<u64> {
        let core = self.core()?;
        let index = self.index;
        core.on_queue(move |_, native| Ok(native.balloon_target(index)))
    }
}

impl std::fmt::Debug for MemoryBalloonDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBalloonDevice").field("index", &self.index).finish()
    }
}
