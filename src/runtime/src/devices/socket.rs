//! vsock-style socket device: port-addressed byte channels between host and guest.

use crate::backend::vm_released;
use crate::vm::machine::MachineCore;
use crate::vm::VmState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::{Handle, Pending};

/// Context identifier of the hypervisor.
pub const VMADDR_CID_HYPERVISOR: u32 = 0;
/// Context identifier of the host.
pub const VMADDR_CID_HOST: u32 = 2;
/// Matches any context identifier.
pub const VMADDR_CID_ANY: u32 = u32::MAX;

/// Socket endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsockAddr {
    pub cid: u32,
    pub port: u32,
}

impl VsockAddr {
    pub fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }

    pub fn host(port: u32) -> Self {
        Self::new(VMADDR_CID_HOST, port)
    }
}

impl std::fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vsock://{}:{}", self.cid, self.port)
    }
}

/// Configuration of the (single) socket device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketDeviceConfiguration;

impl SocketDeviceConfiguration {
    pub fn new() -> Self {
        Self
    }
}

/// Established byte channel. The descriptor belongs to whoever holds this.
#[derive(Debug)]
pub struct SocketConnection {
    source_port: u32,
    destination_port: u32,
    fd: OwnedFd,
}

impl SocketConnection {
    pub fn new(source_port: u32, destination_port: u32, fd: OwnedFd) -> Self {
        Self {
            source_port,
            destination_port,
            fd,
        }
    }

    pub fn source_port(&self) -> u32 {
        self.source_port
    }

    pub fn destination_port(&self) -> u32 {
        self.destination_port
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    pub fn into_std_stream(self) -> UnixStream {
        UnixStream::from(self.fd)
    }

    /// Convert into a tokio stream. Must be called inside a runtime.
    pub fn into_tokio_stream(self) -> Result<tokio::net::UnixStream> {
        let stream = self.into_std_stream();
        stream.set_nonblocking(true)?;
        Ok(tokio::net::UnixStream::from_std(stream)?)
    }
}

impl AsFd for SocketConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SocketConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

type AcceptFilter = Arc<dyn Fn(&SocketConnection) -> bool + Send + Sync>;

/// Accepts inbound guest connections on the ports it is bound to.
///
/// The filter is the accept delegate: it runs synchronously for each
/// proposed connection and its answer is what the guest sees. Accepted
/// connections are queued for [`accept`](Self::accept).
#[derive(Clone)]
pub struct SocketListener {
    filter: AcceptFilter,
    tx: mpsc::UnboundedSender<SocketConnection>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SocketConnection>>>,
}

impl SocketListener {
    /// Listener that accepts every connection.
    pub fn new() -> Self {
        Self::with_filter(|_| true)
    }

    pub fn with_filter(filter: impl Fn(&SocketConnection) -> bool + Send + Sync + 'static) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            filter: Arc::new(filter),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Next accepted connection.
    pub async fn accept(&self) -> Option<SocketConnection> {
        self.rx.lock().await.recv().await
    }

    /// Accepted connection if one is already queued.
    pub fn try_accept(&self) -> Option<SocketConnection> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Accept delegate registered for one port.
    fn delegate(&self, port: u32) -> impl Fn(SocketConnection) -> bool + Send + Sync + 'static {
        let filter = Arc::clone(&self.filter);
        let tx = self.tx.clone();
        move |connection| {
            if !filter(&connection) {
                tracing::debug!(port, source_port = connection.source_port(), "listener rejected connection");
                return false;
            }
            tracing::debug!(port, source_port = connection.source_port(), "accepted connection");
            tx.send(connection).is_ok()
        }
    }
}

impl Default for SocketListener {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketListener").finish_non_exhaustive()
    }
}

/// Port table of one socket device; lives as long as the VM.
#[derive(Default)]
pub(crate) struct SocketDeviceState {
    listeners: Mutex<HashMap<u32, Handle>>,
}

/// Runtime socket device of a VM.
#[derive(Clone)]
pub struct VirtioSocketDevice {
    vm: Weak<MachineCore>,
    index: usize,
    state: Arc<SocketDeviceState>,
}

impl VirtioSocketDevice {
    pub(crate) fn new(vm: Weak<MachineCore>, index: usize, state: Arc<SocketDeviceState>) -> Self {
        Self { vm, index, state }
    }

    fn core(&self) -> Result<Arc<MachineCore>> {
        self.vm.upgrade().ok_or_else(vm_released)
    }

    /// Bind `listener` to `port`. Fails with `PortInUse` when the port is taken.
    pub fn set_socket_listener(&self, listener: &SocketListener, port: u32) -> Result<()> {
        let core = self.core()?;
        let handle = {
            let mut listeners = self.state.listeners.lock();
            if listeners.contains_key(&port) {
                return Err(BridgeError::PortInUse(port));
            }
            let handle = core.bridge.accepts.register_persistent(listener.delegate(port));
            listeners.insert(port, handle);
            handle
        };

        // The port stays reserved while the queue installs it; the lock does not.
        let index = self.index;
        let installed = core.on_queue(move |_, native| {
            native.set_listener(index, port, handle);
            Ok(())
        });
        if let Err(e) = installed {
            let mut listeners = self.state.listeners.lock();
            if listeners.get(&port) == Some(&handle) {
                listeners.remove(&port);
            }
            core.bridge.accepts.unregister(handle);
            return Err(e);
        }

        tracing::debug!(vm_id = %core.id, port, %handle, "socket listener installed");
        Ok(())
    }

    /// Unbind whatever listens on `port`. Unbound ports are a no-op.
    pub fn remove_socket_listener(&self, port: u32) -> Result<()> {
        let Some(handle) = self.state.listeners.lock().remove(&port) else {
            return Ok(());
        };
        match self.vm.upgrade() {
            Some(core) => {
                let index = self.index;
                let removed = core.on_queue(move |_, native| {
                    native.remove_listener(index, port);
                    Ok(())
                });
                core.bridge.accepts.unregister(handle);
                tracing::debug!(vm_id = %core.id, port, "socket listener removed");
                removed
            }
            None => Ok(()),
        }
    }

    /// Ports that currently have a listener.
    pub fn listening_ports(&self) -> Vec<u32> {
        let mut ports: Vec<u32> = self.state.listeners.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Open a connection to a guest port. Requires a running VM.
    pub fn connect(&self, port: u32) -> Result<Pending<SocketConnection>> {
        let core = self.core()?;
        let index = self.index;
        core.on_queue(move |core, native| {
            let state = native.state();
            if state != VmState::Running {
                return Err(BridgeError::invalid_transition("connect", state));
            }
            let pending = core.bridge.connections.register_pending();
            tracing::trace!(vm_id = %core.id, port, handle = %pending.handle(), "connecting to guest port");
            native.connect(index, port, pending.handle());
            Ok(pending)
        })
    }
}

impl std::fmt::Debug for VirtioSocketDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtioSocketDevice")
            .field("index", &self.index)
            .field("ports", &self.listening_ports())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedHypervisor;
    use crate::devices::LinuxBootLoader;
    use crate::host::Host;
    use crate::vm::{VirtualMachine, VirtualMachineConfig};
    use std::io::{Read, Write};
    use vmbridge_core::BridgeConfig;

    fn socket_vm() -> (tempfile::TempDir, Arc<SimulatedHypervisor>, VirtualMachine) {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinuz");
        std::fs::write(&kernel, b"kernel").unwrap();

        let config = BridgeConfig::default();
        let sim = SimulatedHypervisor::new(&config.simulator).unwrap();
        let host = Host::new(sim.clone(), config);
        let mut vm_config =
            VirtualMachineConfig::new(LinuxBootLoader::new(&kernel).unwrap(), 2, 512 * 1024 * 1024);
        vm_config.add_socket_device(SocketDeviceConfiguration::new()).unwrap();
        let vm = VirtualMachine::new(&host, vm_config).unwrap();
        (dir, sim, vm)
    }

    #[test]
    fn test_vsock_addr_display() {
        assert_eq!(VsockAddr::host(1024).to_string(), "vsock://2:1024");
    }

    #[test]
    fn test_second_listener_on_port_fails() {
        let (_dir, _sim, vm) = socket_vm();
        let device = vm.socket_devices().remove(0);
        let listener = SocketListener::new();

        device.set_socket_listener(&listener, 5000).unwrap();
        let err = device.set_socket_listener(&SocketListener::new(), 5000).unwrap_err();
        assert!(matches!(err, BridgeError::PortInUse(5000)));
        assert_eq!(device.listening_ports(), vec![5000]);

        device.remove_socket_listener(5000).unwrap();
        device.remove_socket_listener(5000).unwrap();
        assert!(device.listening_ports().is_empty());

        device.set_socket_listener(&listener, 5000).unwrap();
    }

    #[test]
    fn test_queue_task_can_list_ports_during_install() {
        let (_dir, _sim, vm) = socket_vm();
        let device = vm.socket_devices().remove(0);
        let core = Arc::clone(vm.core());
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let observer = device.clone();
        let busy_done = done_tx.clone();
        std::thread::spawn(move || {
            let seen = core.on_queue(move |_, _| {
                let _ = started_tx.send(());
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok(observer.listening_ports())
            });
            let _ = busy_done.send(seen.map(|_| ()));
        });
        started_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();

        let installer = device.clone();
        std::thread::spawn(move || {
            let listener = SocketListener::new();
            let _ = done_tx.send(installer.set_socket_listener(&listener, 7000));
        });

        for _ in 0..2 {
            let result = done_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
            assert!(result.is_ok());
        }
        assert_eq!(device.listening_ports(), vec![7000]);
    }

    #[test]
    fn test_remove_unbound_port_is_noop() {
        let (_dir, _sim, vm) = socket_vm();
        let device = vm.socket_devices().remove(0);
        device.remove_socket_listener(42).unwrap();
    }

    #[test]
    fn test_connect_requires_running_vm() {
        let (_dir, _sim, vm) = socket_vm();
        let device = vm.socket_devices().remove(0);
        let err = device.connect(1024).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_connect_to_guest_listener() {
        let (_dir, sim, vm) = socket_vm();
        vm.start().unwrap().await.unwrap();

        let guest = sim.guest(vm.id()).unwrap();
        let guest_listener = guest.listen(0, 1024);

        let device = vm.socket_devices().remove(0);
        let connection = device.connect(1024).unwrap().await.unwrap();
        assert_eq!(connection.destination_port(), 1024);

        let mut host_side = connection.into_std_stream();
        let mut guest_side = guest_listener.recv().unwrap();
        host_side.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        guest_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connect_without_guest_listener_fails() {
        let (_dir, _sim, vm) = socket_vm();
        vm.start().unwrap().await.unwrap();
        let device = vm.socket_devices().remove(0);
        let err = device.connect(9999).unwrap().await.unwrap_err();
        assert!(matches!(err, BridgeError::OperationFailed { .. }));
    }

    #[tokio::test]
    async fn test_guest_connection_delivered_to_listener() {
        let (_dir, sim, vm) = socket_vm();
        vm.start().unwrap().await.unwrap();

        let device = vm.socket_devices().remove(0);
        let listener = SocketListener::new();
        device.set_socket_listener(&listener, 7000).unwrap();

        let guest = sim.guest(vm.id()).unwrap();
        let mut guest_side = guest.connect(0, 7000).unwrap();

        let connection = listener.accept().await.unwrap();
        assert_eq!(connection.destination_port(), 7000);
        let mut host_side = connection.into_std_stream();
        guest_side.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        host_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_rejecting_filter_refuses_guest() {
        let (_dir, sim, vm) = socket_vm();
        vm.start().unwrap().await.unwrap();

        let device = vm.socket_devices().remove(0);
        let listener = SocketListener::with_filter(|_| false);
        device.set_socket_listener(&listener, 7001).unwrap();

        let guest = sim.guest(vm.id()).unwrap();
        assert!(guest.connect(0, 7001).is_err());
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_stop_fails_pending_connects() {
        let (_dir, sim, vm) = socket_vm();
        vm.start().unwrap().await.unwrap();
        let guest = sim.guest(vm.id()).unwrap();
        guest.hold_connections(true);

        let device = vm.socket_devices().remove(0);
        let pending = device.connect(1024).unwrap();
        vm.stop().unwrap().await.unwrap();

        let err = pending.await.unwrap_err();
        assert!(matches!(err, BridgeError::OperationFailed { .. }));
    }
}
