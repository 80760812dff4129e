//! USB controller and hot-pluggable USB devices.

use crate::backend::vm_released;
use crate::devices::StorageAttachment;
use crate::host::Feature;
use crate::vm::machine::MachineCore;
use crate::vm::VmState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use uuid::Uuid;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::Pending;

/// USB controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbControllerConfiguration {
    kind: UsbControllerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbControllerKind {
    Xhci,
}

impl UsbControllerConfiguration {
    pub fn xhci() -> Self {
        Self {
            kind: UsbControllerKind::Xhci,
        }
    }

    pub fn kind(&self) -> UsbControllerKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
pub enum UsbDeviceKind {
    MassStorage(StorageAttachment),
}

/// A device that can be hot-plugged into a running controller.
#[derive(Debug, Clone)]
pub struct UsbDevice {
    id: Uuid,
    kind: UsbDeviceKind,
}

impl UsbDevice {
    pub fn mass_storage(attachment: StorageAttachment) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: UsbDeviceKind::MassStorage(attachment),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &UsbDeviceKind {
        &self.kind
    }

    pub fn info(&self) -> UsbDeviceInfo {
        let read_only = match &self.kind {
            UsbDeviceKind::MassStorage(attachment) => attachment.is_read_only(),
        };
        UsbDeviceInfo {
            id: self.id,
            kind: "mass-storage".to_string(),
            read_only,
        }
    }
}

/// Snapshot of an attached device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    pub id: Uuid,
    pub kind: String,
    pub read_only: bool,
}

/// Runtime USB controller of a VM.
#[derive(Clone)]
pub struct UsbController {
    vm: Weak<MachineCore>,
    index: usize,
}

impl UsbController {
    pub(crate) fn new(vm: Weak<MachineCore>, index: usize) -> Self {
        Self { vm, index }
    }

    fn core(&self) -> Result<Arc<MachineCore>> {
        self.vm.upgrade().ok_or_else(vm_released)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Hot-plug `device`. Resolves once the guest has enumerated it.
    pub fn attach(&self, device: &UsbDevice) -> Result<Pending<()>> {
        let core = self.core()?;
        core.host.require(Feature::UsbController);
        let index = self.index;
        let device = device.clone();
        core.on_queue(move |core, native| {
            let state = native.state();
            if state != VmState::Running {
                return Err(BridgeError::invalid_transition("attach usb device", state));
            }
            let pending = core.bridge.hotplug.register_pending();
            tracing::debug!(vm_id = %core.id, controller = index, device = %device.id(), "attaching usb device");
            native.attach_usb(index, &device, pending.handle());
            Ok(pending)
        })
    }

    /// Unplug the device with `id`.
    pub fn detach(&self, id: Uuid) -> Result<Pending<()>> {
        let core = self.core()?;
        core.host.require(Feature::UsbController);
        let index = self.index;
        core.on_queue(move |core, native| {
            let state = native.state();
            if state != VmState::Running {
                return Err(BridgeError::invalid_transition("detach usb device", state));
            }
            let pending = core.bridge.hotplug.register_pending();
            tracing::debug!(vm_id = %core.id, controller = index, device = %id, "detaching usb device");
            native.detach_usb(index, id, pending.handle());
            Ok(pending)
        })
    }

    /// Devices currently attached to this controller.
    pub fn usb_devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        let core = self.core()?;
        let index = self.index;
        core.on_queue(move |_, native| Ok(native.usb_devices(index)))
    }
}

impl std::fmt::Debug for UsbController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbController").field("index", &self.index).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedHypervisor;
    use crate::devices::LinuxBootLoader;
    use crate::host::Host;
    use crate::vm::{VirtualMachine, VirtualMachineConfig};
    use vmbridge_core::event::events;
    use vmbridge_core::BridgeConfig;

    fn usb_vm(dir: &tempfile::TempDir) -> (Host, VirtualMachine) {
        let kernel = dir.path().join("vmlinuz");
        std::fs::write(&kernel, b"kernel").unwrap();

        let config = BridgeConfig::default();
        let sim = SimulatedHypervisor::new(&config.simulator).unwrap();
        let host = Host::new(sim, config);
        let mut vm_config =
            VirtualMachineConfig::new(LinuxBootLoader::new(&kernel).unwrap(), 2, 512 * 1024 * 1024);
        vm_config.add_usb_controller(UsbControllerConfiguration::xhci()).unwrap();
        let vm = VirtualMachine::new(&host, vm_config).unwrap();
        (host, vm)
    }

    fn disk(dir: &tempfile::TempDir) -> UsbDevice {
        let image = dir.path().join("stick.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();
        UsbDevice::mass_storage(StorageAttachment::disk_image(&image, true).unwrap())
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let dir = tempfile::tempdir().unwrap();
        let (host, vm) = usb_vm(&dir);
        let mut telemetry = host.events().subscribe();
        vm.start().unwrap().await.unwrap();

        let controller = vm.usb_controllers().remove(0);
        let device = disk(&dir);
        controller.attach(&device).unwrap().await.unwrap();

        let attached = controller.usb_devices().unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].id, device.id());
        assert!(attached[0].read_only);

        controller.detach(device.id()).unwrap().await.unwrap();
        assert!(controller.usb_devices().unwrap().is_empty());

        let mut keys = Vec::new();
        while let Ok(event) = telemetry.try_recv() {
            keys.push(event.key);
        }
        assert!(keys.iter().any(|k| k == events::VM_USB_ATTACHED));
        assert!(keys.iter().any(|k| k == events::VM_USB_DETACHED));
    }

    #[tokio::test]
    async fn test_detach_unknown_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_host, vm) = usb_vm(&dir);
        vm.start().unwrap().await.unwrap();

        let controller = vm.usb_controllers().remove(0);
        let err = controller.detach(Uuid::new_v4()).unwrap().await.unwrap_err();
        assert!(matches!(err, BridgeError::OperationFailed { .. }));
    }

    #[test]
    fn test_attach_requires_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let (_host, vm) = usb_vm(&dir);
        let controller = vm.usb_controllers().remove(0);
        let err = controller.attach(&disk(&dir)).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_controller_outlived_by_vm_reference() {
        let dir = tempfile::tempdir().unwrap();
        let (_host, vm) = usb_vm(&dir);
        let controller = vm.usb_controllers().remove(0);
        drop(vm);
        assert!(controller.usb_devices().is_err());
    }
}
