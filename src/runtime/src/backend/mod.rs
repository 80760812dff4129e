//! Native hypervisor seam.
//!
//! A backend owns the real virtualization objects. It never holds Rust
//! continuations: every asynchronous native operation receives a [`Handle`]
//! and reports back through [`NativeBridge`] (VM operations) or
//! [`InterfaceEvents`] (datapath), which look the handle up in the owning
//! registry.
//!
//! All [`NativeMachine`] methods are invoked on the VM's dispatch queue.

pub mod sim;

use crate::devices::usb::{UsbDevice, UsbDeviceInfo};
use crate::devices::SocketConnection;
use crate::host::{HostLimits, PlatformVersion};
use crate::progress::Progress;
use crate::vm::{VirtualMachineConfig, VmState};
use crate::vmnet::{
    InterfaceDescriptor, InterfaceParameters, InterfaceTarget, NetworkConfiguration, NetworkLease,
    PacketBuffer, VmnetReturn,
};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::event::{events, BridgeEvent};
use vmbridge_core::{DispatchQueue, EventEmitter, Handle, HandleRegistry};

/// A hypervisor implementation.
pub trait Hypervisor: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn platform_version(&self) -> PlatformVersion;

    /// Host-reported CPU and memory bounds.
    fn limits(&self) -> HostLimits;

    /// Instantiate a VM for a validated configuration.
    fn create_machine(&self, request: MachineRequest) -> Result<Box<dyn NativeMachine>>;

    /// Create a vmnet network; the lease carries the values the host assigned.
    fn create_network(&self, config: &NetworkConfiguration) -> Result<NetworkLease>;

    /// Start a vmnet interface and negotiate its parameters.
    fn start_interface(
        &self,
        target: &InterfaceTarget,
        descriptor: &InterfaceDescriptor,
        events: InterfaceEvents,
    ) -> std::result::Result<Box<dyn NativeInterface>, VmnetReturn>;
}

/// Everything a backend needs to build one VM.
pub struct MachineRequest {
    pub id: String,
    pub config: Arc<VirtualMachineConfig>,
    pub queue: DispatchQueue,
    pub bridge: NativeBridge,
}

/// Native VM object. Only ever touched from its dispatch queue.
pub trait NativeMachine: Send {
    fn state(&self) -> VmState;

    fn start(&mut self, done: Handle);
    fn pause(&mut self, done: Handle);
    fn resume(&mut self, done: Handle);
    fn stop(&mut self, done: Handle);

    /// Ask the guest to shut down. Reports whether the request was delivered.
    fn request_stop(&mut self) -> Result<()>;

    fn save_state(&mut self, path: &Path, done: Handle);
    fn restore_state(&mut self, path: &Path, done: Handle);

    fn install(&mut self, restore_image: &Path, progress: Progress, done: Handle);

    fn connect(&mut self, device: usize, port: u32, done: Handle);
    fn set_listener(&mut self, device: usize, port: u32, listener: Handle);
    fn remove_listener(&mut self, device: usize, port: u32);

    fn set_balloon_target(&mut self, device: usize, bytes: u64);
    fn balloon_target(&self, device: usize) -> u64;

    fn attach_usb(&mut self, controller: usize, device: &UsbDevice, done: Handle);
    fn detach_usb(&mut self, controller: usize, device: Uuid, done: Handle);
    fn usb_devices(&self, controller: usize) -> Vec<UsbDeviceInfo>;
}

/// Callbacks from a native VM into the bridge.
#[derive(Clone)]
pub struct NativeBridge {
    pub(crate) vm_id: String,
    pub(crate) completions: Arc<HandleRegistry<Result<()>>>,
    pub(crate) hotplug: Arc<HandleRegistry<Result<()>>>,
    pub(crate) connections: Arc<HandleRegistry<Result<SocketConnection>>>,
    pub(crate) accepts: Arc<HandleRegistry<SocketConnection, bool>>,
    pub(crate) observers: Arc<HandleRegistry<VmState>>,
    pub(crate) state_observer: Handle,
    pub(crate) events: EventEmitter,
}

impl NativeBridge {
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// Resolve a lifecycle operation.
    pub fn complete(&self, handle: Handle, result: Result<()>) {
        if let Err(e) = self.completions.resolve(handle, result) {
            tracing::warn!(vm_id = %self.vm_id, error = %e, "dropped lifecycle completion");
        }
    }

    /// Resolve a USB attach or detach.
    pub fn complete_hotplug(&self, handle: Handle, result: Result<()>) {
        if let Err(e) = self.hotplug.resolve(handle, result) {
            tracing::warn!(vm_id = %self.vm_id, error = %e, "dropped hot-plug completion");
        }
    }

    /// Resolve an outbound socket connect.
    pub fn connected(&self, handle: Handle, result: Result<SocketConnection>) {
        if let Err(e) = self.connections.resolve(handle, result) {
            tracing::warn!(vm_id = %self.vm_id, error = %e, "dropped connection result");
        }
    }

    /// Offer an inbound connection to a listener; `false` means rejected.
    pub fn accept(&self, listener: Handle, connection: SocketConnection) -> bool {
        match self.accepts.notify(listener, connection) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::debug!(vm_id = %self.vm_id, error = %e, "no listener for inbound connection");
                false
            }
        }
    }

    /// Report a state transition. Must be called in transition order.
    pub fn state_changed(&self, state: VmState) {
        if let Err(e) = self.observers.notify(self.state_observer, state) {
            tracing::warn!(vm_id = %self.vm_id, error = %e, "state observer missing");
        }
    }

    pub fn usb_event(&self, attached: bool, controller: usize, device: Uuid) {
        let key = if attached {
            events::VM_USB_ATTACHED
        } else {
            events::VM_USB_DETACHED
        };
        self.events.emit(BridgeEvent::with_fields(
            key,
            [
                ("vm_id", serde_json::json!(self.vm_id)),
                ("controller", serde_json::json!(controller)),
                ("device", serde_json::json!(device.to_string())),
            ],
        ));
    }

    /// A network attachment was disconnected by the host.
    pub fn network_disconnected(&self, device: usize, reason: &str) {
        tracing::warn!(vm_id = %self.vm_id, device, reason, "network attachment disconnected");
        self.events.emit(BridgeEvent::with_fields(
            events::VM_NETWORK_DISCONNECTED,
            [
                ("vm_id", serde_json::json!(self.vm_id)),
                ("device", serde_json::json!(device)),
                ("reason", serde_json::json!(reason)),
            ],
        ));
    }
}

/// Native datapath of one vmnet interface.
pub trait NativeInterface: Send + Sync {
    fn parameters(&self) -> InterfaceParameters;

    /// Read up to `count` packets into `buffer`; returns how many arrived.
    fn read(&self, buffer: &mut PacketBuffer, count: usize) -> std::result::Result<usize, VmnetReturn>;

    /// Write the first `count` packets of `buffer`; returns how many were taken.
    fn write(&self, buffer: &PacketBuffer, count: usize) -> std::result::Result<usize, VmnetReturn>;

    /// Install or clear the packets-available callback.
    fn set_event_callback(&self, callback: Option<Handle>);

    fn stop(&self) -> VmnetReturn;
}

/// Callbacks from a native interface into the bridge.
#[derive(Clone)]
pub struct InterfaceEvents {
    pub(crate) registry: Arc<HandleRegistry<usize>>,
}

impl InterfaceEvents {
    /// Signal that roughly `estimate` packets can be read.
    pub fn packets_available(&self, callback: Handle, estimate: usize) {
        if let Err(e) = self.registry.notify(callback, estimate) {
            tracing::trace!(error = %e, "packets-available callback already removed");
        }
    }
}

/// Error for calls on a VM that has been released.
pub(crate) fn vm_released() -> BridgeError {
    BridgeError::failed("virtual machine has been released")
}
