//! Simulated hypervisor.
//!
//! Behaves like the native framework at the seam: every asynchronous
//! operation reports its intermediate state, then settles on the VM queue.
//! Guest sockets are real socket pairs, and each vmnet network is an
//! in-process segment that reflects frames to every attached interface,
//! the sender included.

use super::{
    Hypervisor, InterfaceEvents, MachineRequest, NativeBridge, NativeInterface, NativeMachine,
};
use crate::artifact;
use crate::devices::usb::{UsbDevice, UsbDeviceInfo};
use crate::devices::{MacAddress, SocketConnection};
use crate::host::{detect_platform_version, HostLimits, PlatformVersion};
use crate::progress::Progress;
use crate::vm::{VirtualMachineConfig, VmState};
use crate::vmnet::{
    InterfaceDescriptor, InterfaceParameters, InterfaceTarget, Ipv4Subnet, Ipv6Prefix, Mode,
    NetworkConfiguration, NetworkLease, PacketBuffer, VmnetReturn,
};
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use uuid::Uuid;
use vmbridge_core::config::SimulatorConfig;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::{DispatchQueue, Handle};

const SAVE_MAGIC: &[u8; 8] = b"VMBSAVE1";
const FIRST_EPHEMERAL_PORT: u32 = 49152;
const INSTALL_STEPS: u32 = 8;
const DEFAULT_MTU: u32 = 1500;
const ETHERNET_HEADER: usize = 14;
const BATCH_LIMIT: usize = 256;
const PORT_BACKLOG: usize = 1024;

/// What the simulated guest does with a cooperative stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// Shut down shortly after the request.
    #[default]
    Cooperative,
    /// Take the request and never act on it.
    Ignore,
    /// Refuse the request.
    Refuse,
}

/// In-process stand-in for the native hypervisor.
pub struct SimulatedHypervisor {
    platform: PlatformVersion,
    limits: HostLimits,
    machines: Mutex<HashMap<String, Weak<SimShared>>>,
    segments: Mutex<HashMap<SegmentKey, Arc<Segment>>>,
}

impl SimulatedHypervisor {
    pub fn new(config: &SimulatorConfig) -> Result<Arc<Self>> {
        let platform = if config.platform_version == "host" {
            detect_platform_version()
                .ok_or_else(|| BridgeError::failed("could not detect the host platform version"))?
        } else {
            config.platform_version.parse()?
        };
        tracing::debug!(%platform, "simulated hypervisor ready");
        Ok(Arc::new(Self {
            platform,
            limits: HostLimits {
                min_cpu_count: config.min_cpu_count,
                max_cpu_count: config.max_cpu_count,
                min_memory_size: config.min_memory_size,
                max_memory_size: config.max_memory_size,
            },
            machines: Mutex::new(HashMap::new()),
            segments: Mutex::new(HashMap::new()),
        }))
    }

    /// Guest-side controls of a live VM.
    pub fn guest(&self, vm_id: &str) -> Option<SimGuest> {
        let shared = self.machines.lock().get(vm_id)?.upgrade()?;
        Some(SimGuest { shared })
    }

    fn segment(&self, key: SegmentKey) -> Arc<Segment> {
        Arc::clone(self.segments.lock().entry(key).or_default())
    }
}

impl Hypervisor for SimulatedHypervisor {
    fn name(&self) -> &str {
        "sim"
    }

    fn platform_version(&self) -> PlatformVersion {
        self.platform
    }

    fn limits(&self) -> HostLimits {
        self.limits
    }

    fn create_machine(&self, request: MachineRequest) -> Result<Box<dyn NativeMachine>> {
        let MachineRequest {
            id,
            config,
            queue,
            bridge,
        } = request;

        let guest = GuestState {
            state: VmState::Stopped,
            shutdown: ShutdownBehavior::default(),
            hold_connections: false,
            held: Vec::new(),
            guest_listeners: HashMap::new(),
            host_listeners: HashMap::new(),
            balloon_targets: vec![config.memory_size(); config.memory_balloon_devices().len()],
            usb: vec![Vec::new(); config.usb_controllers().len()],
            next_port: FIRST_EPHEMERAL_PORT,
        };
        let shared = Arc::new(SimShared {
            id: id.clone(),
            config,
            queue,
            bridge,
            guest: Mutex::new(guest),
        });

        let mut machines = self.machines.lock();
        machines.retain(|_, machine| machine.strong_count() > 0);
        machines.insert(id, Arc::downgrade(&shared));
        Ok(Box::new(SimMachine { shared }))
    }

    fn create_network(&self, config: &NetworkConfiguration) -> Result<NetworkLease> {
        let ipv4_subnet = match config.ipv4_subnet() {
            Some(subnet) => subnet,
            None => Ipv4Subnet::new(Ipv4Addr::new(192, 168, 64, 1), 24)?,
        };
        let ipv6_prefix = match config.ipv6_prefix() {
            Some(prefix) => prefix,
            None => unique_local_prefix()?,
        };
        Ok(NetworkLease {
            ipv4_subnet,
            ipv6_prefix,
            mtu: config.mtu().unwrap_or(DEFAULT_MTU),
        })
    }

    fn start_interface(
        &self,
        target: &InterfaceTarget,
        descriptor: &InterfaceDescriptor,
        events: InterfaceEvents,
    ) -> std::result::Result<Box<dyn NativeInterface>, VmnetReturn> {
        let (key, mtu) = match target {
            InterfaceTarget::Mode(mode) => (SegmentKey::Mode(*mode), DEFAULT_MTU),
            InterfaceTarget::Network(network) => (SegmentKey::Network(network.id()), network.mtu()),
        };
        let segment = self.segment(key);
        let port = Arc::new(SimPort {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            isolated: descriptor.enable_isolation,
            frames: Mutex::new(VecDeque::new()),
            callback: Mutex::new(None),
            events,
        });
        segment.ports.lock().push(Arc::clone(&port));

        let parameters = InterfaceParameters {
            mac_address: descriptor.allocate_mac_address.then(MacAddress::random_local),
            mtu,
            max_packet_size: mtu as usize + ETHERNET_HEADER,
            max_read_packet_count: BATCH_LIMIT,
            max_write_packet_count: BATCH_LIMIT,
        };
        tracing::trace!(port = port.id, ?key, "attached interface to segment");
        Ok(Box::new(SimInterface {
            port,
            segment,
            parameters,
        }))
    }
}

/// RFC 4193 style `fdXX:XXXX:XXXX::/64` with a random global ID.
fn unique_local_prefix() -> Result<Ipv6Prefix> {
    let global: u64 = rand::thread_rng().gen_range(0..(1u64 << 40));
    let address = Ipv6Addr::new(
        0xfd00 | (global >> 32) as u16,
        (global >> 16) as u16,
        global as u16,
        0,
        0,
        0,
        0,
        0,
    );
    Ipv6Prefix::new(address, 64)
}

struct GuestState {
    state: VmState,
    shutdown: ShutdownBehavior,
    hold_connections: bool,
    held: Vec<Handle>,
    guest_listeners: HashMap<(usize, u32), mpsc::Sender<UnixStream>>,
    host_listeners: HashMap<(usize, u32), Handle>,
    balloon_targets: Vec<u64>,
    usb: Vec<Vec<UsbDeviceInfo>>,
    next_port: u32,
}

impl GuestState {
    fn ephemeral_port(&mut self) -> u32 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        port
    }
}

struct SimShared {
    id: String,
    config: Arc<VirtualMachineConfig>,
    queue: DispatchQueue,
    bridge: NativeBridge,
    guest: Mutex<GuestState>,
}

impl SimShared {
    fn state(&self) -> VmState {
        self.guest.lock().state
    }

    /// Record and report a state. The lock is released before the observer runs.
    fn set_state(&self, state: VmState) {
        self.guest.lock().state = state;
        self.bridge.state_changed(state);
    }

    fn set_stopped(&self) {
        {
            let mut guest = self.guest.lock();
            guest.held.clear();
            guest.guest_listeners.clear();
            for devices in &mut guest.usb {
                devices.clear();
            }
        }
        self.set_state(VmState::Stopped);
    }

    /// Run `work` on the VM queue, then resolve `done` with its result.
    fn settle(self: &Arc<Self>, done: Handle, work: impl FnOnce(&SimShared) -> Result<()> + Send + 'static) {
        let shared = Arc::clone(self);
        let submitted = self.queue.submit(move || {
            let result = work(&shared);
            shared.bridge.complete(done, result);
        });
        if let Err(e) = submitted {
            self.bridge.complete(done, Err(e));
        }
    }

    fn hotplug(
        self: &Arc<Self>,
        done: Handle,
        work: impl FnOnce(&SimShared) -> Result<()> + Send + 'static,
    ) {
        let shared = Arc::clone(self);
        let submitted = self.queue.submit(move || {
            let result = work(&shared);
            shared.bridge.complete_hotplug(done, result);
        });
        if let Err(e) = submitted {
            self.bridge.complete_hotplug(done, Err(e));
        }
    }

    fn identity(&self) -> Vec<u8> {
        let mut identity = self
            .config
            .platform()
            .machine_identifier()
            .data_representation()
            .to_vec();
        identity.extend_from_slice(&self.config.cpu_count().to_be_bytes());
        identity.extend_from_slice(&self.config.memory_size().to_be_bytes());
        identity
    }

    fn encode_save(&self) -> Vec<u8> {
        let identity = self.identity();
        let mut bytes = Vec::with_capacity(SAVE_MAGIC.len() + 4 + identity.len() + 32);
        bytes.extend_from_slice(SAVE_MAGIC);
        bytes.extend_from_slice(&(identity.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&identity);
        let checksum = Sha256::digest(&bytes);
        bytes.extend_from_slice(&checksum);
        bytes
    }

    fn verify_save(&self, bytes: &[u8]) -> Result<()> {
        let corrupt = |what: &str| BridgeError::InvalidFormat(format!("save file {what}"));
        if bytes.len() < SAVE_MAGIC.len() + 4 + 32 || !bytes.starts_with(SAVE_MAGIC) {
            return Err(corrupt("has no valid header"));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 32);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(corrupt("checksum mismatch"));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&body[SAVE_MAGIC.len()..SAVE_MAGIC.len() + 4]);
        let identity = &body[SAVE_MAGIC.len() + 4..];
        if identity.len() != u32::from_be_bytes(len) as usize {
            return Err(corrupt("is truncated"));
        }
        if identity != self.identity().as_slice() {
            return Err(corrupt("belongs to a different machine"));
        }
        Ok(())
    }
}

struct SimMachine {
    shared: Arc<SimShared>,
}

impl SimMachine {
    /// Report `via`, then settle into `to` on the queue.
    fn transition(&self, via: VmState, to: VmState, done: Handle) {
        self.shared.set_state(via);
        self.shared.settle(done, move |shared| {
            if to == VmState::Stopped {
                shared.set_stopped();
            } else {
                shared.set_state(to);
            }
            Ok(())
        });
    }
}

impl NativeMachine for SimMachine {
    fn state(&self) -> VmState {
        self.shared.state()
    }

    fn start(&mut self, done: Handle) {
        self.transition(VmState::Starting, VmState::Running, done);
    }

    fn pause(&mut self, done: Handle) {
        self.transition(VmState::Pausing, VmState::Paused, done);
    }

    fn resume(&mut self, done: Handle) {
        self.transition(VmState::Resuming, VmState::Running, done);
    }

    fn stop(&mut self, done: Handle) {
        self.transition(VmState::Stopping, VmState::Stopped, done);
    }

    fn request_stop(&mut self) -> Result<()> {
        let behavior = self.shared.guest.lock().shutdown;
        match behavior {
            ShutdownBehavior::Refuse => Err(BridgeError::failed_with(
                "stop request refused",
                "guest offers no cooperative shutdown",
            )),
            ShutdownBehavior::Ignore => Ok(()),
            ShutdownBehavior::Cooperative => {
                let shared = Arc::clone(&self.shared);
                self.shared.queue.submit(move || {
                    if shared.state() == VmState::Running {
                        shared.set_state(VmState::Stopping);
                        shared.set_stopped();
                    }
                })
            }
        }
    }

    fn save_state(&mut self, path: &Path, done: Handle) {
        let previous = self.shared.state();
        let path = path.to_path_buf();
        self.shared.set_state(VmState::Saving);
        self.shared.settle(done, move |shared| {
            match artifact::store(&path, &shared.encode_save()) {
                Ok(()) => {
                    tracing::debug!(vm_id = %shared.id, path = %path.display(), "saved machine state");
                    shared.set_stopped();
                    Ok(())
                }
                Err(e) => {
                    shared.set_state(previous);
                    Err(BridgeError::failed_with("save failed", e))
                }
            }
        });
    }

    fn restore_state(&mut self, path: &Path, done: Handle) {
        let path = path.to_path_buf();
        self.shared.set_state(VmState::Restoring);
        self.shared.settle(done, move |shared| {
            let restored = artifact::load(&path).and_then(|bytes| shared.verify_save(&bytes));
            match restored {
                Ok(()) => {
                    shared.set_state(VmState::Paused);
                    Ok(())
                }
                Err(e) => {
                    shared.set_state(VmState::Stopped);
                    Err(BridgeError::failed_with("restore failed", e))
                }
            }
        });
    }

    fn install(&mut self, restore_image: &Path, progress: Progress, done: Handle) {
        let image = restore_image.to_path_buf();
        self.shared.settle(done, move |_| {
            std::fs::metadata(&image)
                .map_err(|e| BridgeError::failed_with("restore image unreadable", e))?;
            for step in 1..INSTALL_STEPS {
                progress.update(f64::from(step) / f64::from(INSTALL_STEPS));
            }
            progress.finish();
            Ok(())
        });
    }

    fn connect(&mut self, device: usize, port: u32, done: Handle) {
        {
            let mut guest = self.shared.guest.lock();
            if guest.hold_connections {
                guest.held.push(done);
                return;
            }
        }
        let shared = Arc::clone(&self.shared);
        let submitted = self.shared.queue.submit(move || {
            let result = guest_accept(&shared, device, port);
            shared.bridge.connected(done, result);
        });
        if let Err(e) = submitted {
            self.shared.bridge.connected(done, Err(e));
        }
    }

    fn set_listener(&mut self, device: usize, port: u32, listener: Handle) {
        self.shared
            .guest
            .lock()
            .host_listeners
            .insert((device, port), listener);
    }

    fn remove_listener(&mut self, device: usize, port: u32) {
        self.shared.guest.lock().host_listeners.remove(&(device, port));
    }

    fn set_balloon_target(&mut self, device: usize, bytes: u64) {
        if let Some(target) = self.shared.guest.lock().balloon_targets.get_mut(device) {
            *target = bytes;
        }
    }

    fn balloon_target(&self, device: usize) -> u64 {
        self.shared
            .guest
            .lock()
            .balloon_targets
            .get(device)
            .copied()
            .unwrap_or(0)
    }

    fn attach_usb(&mut self, controller: usize, device: &UsbDevice, done: Handle) {
        let info = device.info();
        self.shared.hotplug(done, move |shared| {
            {
                let mut guest = shared.guest.lock();
                let devices = guest
                    .usb
                    .get_mut(controller)
                    .ok_or_else(|| BridgeError::failed(format!("no usb controller {controller}")))?;
                if devices.iter().any(|d| d.id == info.id) {
                    return Err(BridgeError::failed(format!("usb device {} already attached", info.id)));
                }
                devices.push(info.clone());
            }
            shared.bridge.usb_event(true, controller, info.id);
            Ok(())
        });
    }

    fn detach_usb(&mut self, controller: usize, device: Uuid, done: Handle) {
        self.shared.hotplug(done, move |shared| {
            {
                let mut guest = shared.guest.lock();
                let devices = guest
                    .usb
                    .get_mut(controller)
                    .ok_or_else(|| BridgeError::failed(format!("no usb controller {controller}")))?;
                let position = devices
                    .iter()
                    .position(|d| d.id == device)
                    .ok_or_else(|| BridgeError::failed(format!("usb device {device} is not attached")))?;
                devices.remove(position);
            }
            shared.bridge.usb_event(false, controller, device);
            Ok(())
        });
    }

    fn usb_devices(&self, controller: usize) -> Vec<UsbDeviceInfo> {
        self.shared
            .guest
            .lock()
            .usb
            .get(controller)
            .cloned()
            .unwrap_or_default()
    }
}

/// Hand one end of a socket pair to the guest listener on `port`.
fn guest_accept(shared: &SimShared, device: usize, port: u32) -> Result<SocketConnection> {
    let mut guest = shared.guest.lock();
    let refused = || BridgeError::failed_with(format!("connect to port {port} failed"), "connection refused");
    let Some(listener) = guest.guest_listeners.get(&(device, port)) else {
        return Err(refused());
    };
    let (host_side, guest_side) = UnixStream::pair()?;
    if listener.send(guest_side).is_err() {
        guest.guest_listeners.remove(&(device, port));
        return Err(refused());
    }
    let source_port = guest.ephemeral_port();
    Ok(SocketConnection::new(source_port, port, host_side.into()))
}

/// Test-side view of a simulated guest.
#[derive(Clone)]
pub struct SimGuest {
    shared: Arc<SimShared>,
}

impl SimGuest {
    pub fn state(&self) -> VmState {
        self.shared.state()
    }

    /// Listen on a guest port; host connects arrive on the returned channel.
    pub fn listen(&self, device: usize, port: u32) -> mpsc::Receiver<UnixStream> {
        let (tx, rx) = mpsc::channel();
        self.shared
            .guest
            .lock()
            .guest_listeners
            .insert((device, port), tx);
        rx
    }

    /// Connect from the guest to a host listener. Fails when nothing listens
    /// or the listener rejects the connection.
    pub fn connect(&self, device: usize, port: u32) -> Result<UnixStream> {
        let (listener, source_port) = {
            let mut guest = self.shared.guest.lock();
            if guest.state != VmState::Running {
                return Err(BridgeError::invalid_transition("guest connect", guest.state));
            }
            let listener = guest.host_listeners.get(&(device, port)).copied();
            (listener, guest.ephemeral_port())
        };
        let Some(listener) = listener else {
            return Err(BridgeError::failed_with(
                format!("connect to host port {port} failed"),
                "connection refused",
            ));
        };

        let (host_side, guest_side) = UnixStream::pair()?;
        let connection = SocketConnection::new(source_port, port, host_side.into());
        let shared = Arc::clone(&self.shared);
        let accepted = self
            .shared
            .queue
            .sync(move || shared.bridge.accept(listener, connection))?;
        if accepted {
            Ok(guest_side)
        } else {
            Err(BridgeError::failed_with(
                format!("connect to host port {port} failed"),
                "connection rejected",
            ))
        }
    }

    /// Park host connects instead of answering them. Turning this off
    /// refuses everything that was parked.
    pub fn hold_connections(&self, hold: bool) {
        let released = {
            let mut guest = self.shared.guest.lock();
            guest.hold_connections = hold;
            if hold {
                Vec::new()
            } else {
                std::mem::take(&mut guest.held)
            }
        };
        for handle in released {
            self.shared.bridge.connected(
                handle,
                Err(BridgeError::failed_with("connect failed", "connection refused")),
            );
        }
    }

    pub fn set_shutdown_behavior(&self, behavior: ShutdownBehavior) {
        self.shared.guest.lock().shutdown = behavior;
    }

    /// Fail the VM unrecoverably.
    pub fn crash(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.shared.queue.sync(move || {
            tracing::warn!(vm_id = %shared.id, "simulated guest crashed");
            shared.set_state(VmState::Error);
        })
    }

    /// Report that the host disconnected network device `device`.
    pub fn disconnect_network(&self, device: usize, reason: &str) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let reason = reason.to_string();
        self.shared
            .queue
            .sync(move || shared.bridge.network_disconnected(device, &reason))
    }
}

impl std::fmt::Debug for SimGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimGuest")
            .field("vm_id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SegmentKey {
    Mode(Mode),
    Network(Uuid),
}

/// One broadcast domain.
#[derive(Default)]
struct Segment {
    ports: Mutex<Vec<Arc<SimPort>>>,
}

struct SimPort {
    id: u64,
    isolated: bool,
    frames: Mutex<VecDeque<Vec<u8>>>,
    callback: Mutex<Option<Handle>>,
    events: InterfaceEvents,
}

struct SimInterface {
    port: Arc<SimPort>,
    segment: Arc<Segment>,
    parameters: InterfaceParameters,
}

impl SimInterface {
    fn detach(&self) {
        self.segment.ports.lock().retain(|p| p.id != self.port.id);
    }
}

impl NativeInterface for SimInterface {
    fn parameters(&self) -> InterfaceParameters {
        self.parameters
    }

    fn read(&self, buffer: &mut PacketBuffer, count: usize) -> std::result::Result<usize, VmnetReturn> {
        let mut frames = self.port.frames.lock();
        if frames.is_empty() {
            return Err(VmnetReturn::BufferExhausted);
        }
        let count = count.min(buffer.slot_count()).min(frames.len());
        for index in 0..count {
            let Some(frame) = frames.pop_front() else {
                return Ok(index);
            };
            if let Err(status) = buffer.set_packet(index, &frame) {
                frames.push_front(frame);
                return if index == 0 { Err(status) } else { Ok(index) };
            }
        }
        Ok(count)
    }

    fn write(&self, buffer: &PacketBuffer, count: usize) -> std::result::Result<usize, VmnetReturn> {
        if count > buffer.slot_count() {
            return Err(VmnetReturn::TooManyPackets);
        }
        let peers: Vec<Arc<SimPort>> = self
            .segment
            .ports
            .lock()
            .iter()
            .filter(|p| p.id == self.port.id || !(self.port.isolated || p.isolated))
            .cloned()
            .collect();

        let room = PORT_BACKLOG.saturating_sub(self.port.frames.lock().len());
        let accepted = count.min(room);
        if accepted == 0 {
            return Err(VmnetReturn::BufferExhausted);
        }

        let mut wakeups = Vec::new();
        for peer in &peers {
            let mut frames = peer.frames.lock();
            let mut delivered = 0;
            for packet in buffer.packets(accepted) {
                if frames.len() >= PORT_BACKLOG {
                    break;
                }
                frames.push_back(packet.to_vec());
                delivered += 1;
            }
            drop(frames);
            if delivered > 0 {
                if let Some(callback) = *peer.callback.lock() {
                    wakeups.push((peer.events.clone(), callback, delivered));
                }
            }
        }
        for (events, callback, delivered) in wakeups {
            events.packets_available(callback, delivered);
        }
        Ok(accepted)
    }

    fn set_event_callback(&self, callback: Option<Handle>) {
        *self.port.callback.lock() = callback;
    }

    fn stop(&self) -> VmnetReturn {
        *self.port.callback.lock() = None;
        self.detach();
        self.port.frames.lock().clear();
        VmnetReturn::Success
    }
}

impl Drop for SimInterface {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::LinuxBootLoader;
    use crate::host::Host;
    use crate::vm::VirtualMachine;
    use vmbridge_core::BridgeConfig;

    fn vm(dir: &tempfile::TempDir) -> (Arc<SimulatedHypervisor>, VirtualMachine) {
        let kernel = dir.path().join("vmlinuz");
        std::fs::write(&kernel, b"kernel").unwrap();
        let config = BridgeConfig::default();
        let sim = SimulatedHypervisor::new(&config.simulator).unwrap();
        let host = Host::new(sim.clone(), config);
        let vm_config =
            VirtualMachineConfig::new(LinuxBootLoader::new(&kernel).unwrap(), 1, 256 * 1024 * 1024);
        (sim, VirtualMachine::new(&host, vm_config).unwrap())
    }

    #[test]
    fn test_platform_from_config() {
        let config = SimulatorConfig {
            platform_version: "14.6".to_string(),
            ..Default::default()
        };
        let sim = SimulatedHypervisor::new(&config).unwrap();
        assert_eq!(sim.platform_version(), PlatformVersion::new(14, 6));
        assert_eq!(sim.name(), "sim");
    }

    #[test]
    fn test_bad_platform_version() {
        let config = SimulatorConfig {
            platform_version: "latest".to_string(),
            ..Default::default()
        };
        assert!(SimulatedHypervisor::new(&config).is_err());
    }

    #[test]
    fn test_guest_lookup_follows_vm_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, vm) = vm(&dir);
        let id = vm.id().to_string();
        assert!(sim.guest(&id).is_some());
        drop(vm);
        assert!(sim.guest(&id).is_none());
    }

    #[test]
    fn test_unique_local_prefix() {
        let prefix = unique_local_prefix().unwrap();
        assert_eq!(prefix.prefix_len(), 64);
        assert_eq!(prefix.address().segments()[0] & 0xff00, 0xfd00);
    }

    #[test]
    fn test_save_file_round_trip_and_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, vm) = vm(&dir);
        let guest = sim.guest(vm.id()).unwrap();
        let bytes = guest.shared.encode_save();
        guest.shared.verify_save(&bytes).unwrap();

        let mut tampered = bytes.clone();
        tampered[SAVE_MAGIC.len() + 5] ^= 0xff;
        assert!(guest.shared.verify_save(&tampered).is_err());
        assert!(guest.shared.verify_save(b"short").is_err());
    }
}
