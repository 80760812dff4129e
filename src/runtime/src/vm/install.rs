//! macOS guest installation from a restore image.

use super::machine::VirtualMachine;
use super::state::VmState;
use crate::host::Feature;
use crate::progress::Progress;
use std::path::{Path, PathBuf};
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::Pending;

/// Installs macOS into a stopped Mac-platform VM.
pub struct MacOsInstaller {
    vm: VirtualMachine,
    restore_image: PathBuf,
    progress: Progress,
}

impl MacOsInstaller {
    pub fn new(vm: &VirtualMachine, restore_image: impl AsRef<Path>) -> Result<Self> {
        let core = vm.core();
        core.host.check_available(Feature::MacOsGuest)?;
        if !core.config.platform().is_mac() {
            return Err(BridgeError::ConfigInvalid {
                violations: vec!["macOS installation requires a Mac platform configuration".to_string()],
            });
        }
        let restore_image = restore_image.as_ref().to_path_buf();
        if !restore_image.is_file() {
            return Err(BridgeError::InvalidFormat(format!(
                "restore image not found: {}",
                restore_image.display()
            )));
        }
        let progress = Progress::new().with_events(core.host.events().clone(), core.id.clone());
        Ok(Self {
            vm: vm.clone(),
            restore_image,
            progress,
        })
    }

    /// Shared progress; fraction reaches 1.0 when installation succeeds.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn restore_image(&self) -> &Path {
        &self.restore_image
    }

    /// Begin installing. The VM must be stopped.
    pub fn install(&self) -> Result<Pending<()>> {
        let image = self.restore_image.clone();
        let progress = self.progress.clone();
        self.vm.core().on_queue(move |core, native| {
            let state = native.state();
            if state != VmState::Stopped {
                return Err(BridgeError::invalid_transition("install", state));
            }
            let pending = core.bridge.completions.register_pending();
            tracing::info!(vm_id = %core.id, image = %image.display(), "installing macOS");
            native.install(&image, progress, pending.handle());
            Ok(pending)
        })
    }
}

impl std::fmt::Debug for MacOsInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacOsInstaller")
            .field("vm", &self.vm.id())
            .field("restore_image", &self.restore_image)
            .field("progress", &self.progress.fraction())
            .finish()
    }
}
