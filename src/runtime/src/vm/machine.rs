//! VirtualMachine - lifecycle controller bound to one dispatch queue.

use super::config::VirtualMachineConfig;
use super::state::{StateFanout, StateSubscription, VmState};
use crate::backend::{MachineRequest, NativeBridge, NativeMachine};
use crate::devices::socket::SocketDeviceState;
use crate::devices::{kind, DeviceHandle, MemoryBalloonDevice, UsbController, VirtioSocketDevice};
use crate::host::{Feature, Host};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::event::{events, BridgeEvent};
use vmbridge_core::{DispatchQueue, Handle, HandleRegistry, Pending, QueueStatus};

/// Shared VM state. Runtime devices hold a `Weak` to it.
pub(crate) struct MachineCore {
    pub(crate) id: String,
    pub(crate) host: Host,
    pub(crate) config: Arc<VirtualMachineConfig>,
    pub(crate) queue: DispatchQueue,
    pub(crate) bridge: NativeBridge,
    native: Mutex<Box<dyn NativeMachine>>,
    state: Arc<RwLock<VmState>>,
    fanout: Arc<StateFanout>,
    pub(crate) socket_devices: Vec<Arc<SocketDeviceState>>,
}

impl MachineCore {
    /// Run `f` against the native VM on the VM queue and wait for it.
    pub(crate) fn on_queue<T>(
        self: &Arc<Self>,
        f: impl FnOnce(&MachineCore, &mut dyn NativeMachine) -> Result<T> + Send + 'static,
    ) -> Result<T>
    where
        T: Send + 'static,
    {
        let core = Arc::clone(self);
        self.queue.sync(move || {
            let mut native = core.native.lock();
            f(&core, native.as_mut())
        })?
    }

    pub(crate) fn state(&self) -> VmState {
        *self.state.read()
    }

    /// Submit a lifecycle transition, rejecting it up front when `allowed` is false.
    fn transition(
        self: &Arc<Self>,
        operation: &'static str,
        allowed: fn(VmState) -> bool,
        invoke: impl FnOnce(&mut dyn NativeMachine, Handle) + Send + 'static,
    ) -> Result<Pending<()>> {
        self.on_queue(move |core, native| {
            let state = native.state();
            if !allowed(state) {
                tracing::debug!(vm_id = %core.id, operation, %state, "rejected invalid transition");
                return Err(BridgeError::invalid_transition(operation, state));
            }
            let pending = core.bridge.completions.register_pending();
            tracing::debug!(vm_id = %core.id, operation, handle = %pending.handle(), "submitting transition");
            invoke(native, pending.handle());
            Ok(pending)
        })
    }
}

impl Drop for MachineCore {
    fn drop(&mut self) {
        self.bridge.observers.unregister(self.bridge.state_observer);
        let released = || Err(BridgeError::failed("virtual machine released"));
        let pending = self.bridge.completions.resolve_all(released)
            + self.bridge.hotplug.resolve_all(released)
            + self.bridge.connections.resolve_all(|| Err(BridgeError::failed("virtual machine released")));
        tracing::debug!(vm_id = %self.id, pending, "virtual machine released");
    }
}

/// A live virtual machine.
///
/// Every state read and mutation of the native VM happens on its dispatch
/// queue; this handle may be used from any thread.
#[derive(Clone)]
pub struct VirtualMachine {
    core: Arc<MachineCore>,
}

impl VirtualMachine {
    /// Validate `config` and create the VM. Nothing native happens if
    /// validation fails.
    pub fn new(host: &Host, mut config: VirtualMachineConfig) -> Result<Self> {
        config.seal(host)?;
        let config = Arc::new(config);

        let id = Uuid::new_v4().to_string();
        let queue = DispatchQueue::new(format!("vmbridge.vm.{}", &id[..8]))?;

        let completions = Arc::new(HandleRegistry::new("vm-completions"));
        let hotplug = Arc::new(HandleRegistry::new("usb-hotplug"));
        let connections = Arc::new(HandleRegistry::new("vsock-connect"));
        let accepts = Arc::new(HandleRegistry::new("vsock-accept"));
        let observers = Arc::new(HandleRegistry::new("vm-state-observer"));

        let state = Arc::new(RwLock::new(VmState::Stopped));
        let fanout = Arc::new(StateFanout::new());

        let state_observer = {
            let state = Arc::clone(&state);
            let fanout = Arc::clone(&fanout);
            let completions: Arc<HandleRegistry<Result<()>>> = Arc::clone(&completions);
            let hotplug: Arc<HandleRegistry<Result<()>>> = Arc::clone(&hotplug);
            let connections = Arc::clone(&connections);
            let emitter = host.events().clone();
            let vm_id = id.clone();
            observers.register_persistent(move |new_state: VmState| {
                let previous = std::mem::replace(&mut *state.write(), new_state);
                tracing::debug!(vm_id = %vm_id, from = %previous, to = %new_state, "state changed");
                fanout.publish(new_state);
                emitter.emit(BridgeEvent::with_fields(
                    events::VM_STATE_CHANGED,
                    [
                        ("vm_id", serde_json::json!(vm_id)),
                        ("state", serde_json::json!(new_state)),
                    ],
                ));

                if matches!(new_state, VmState::Stopped | VmState::Error) {
                    let reason = format!("virtual machine {new_state}");
                    connections.resolve_all(|| Err(BridgeError::failed(reason.clone())));
                    hotplug.resolve_all(|| Err(BridgeError::failed(reason.clone())));
                    if new_state == VmState::Error {
                        completions.resolve_all(|| Err(BridgeError::failed(reason.clone())));
                    }
                }
            })
        };

        let bridge = NativeBridge {
            vm_id: id.clone(),
            completions,
            hotplug,
            connections,
            accepts,
            observers,
            state_observer,
            events: host.events().clone(),
        };

        let native = host.backend().create_machine(MachineRequest {
            id: id.clone(),
            config: Arc::clone(&config),
            queue: queue.clone(),
            bridge: bridge.clone(),
        })?;

        let socket_devices = config
            .socket_devices()
            .iter()
            .map(|_| Arc::new(SocketDeviceState::default()))
            .collect();

        tracing::info!(
            vm_id = %id,
            backend = host.backend_name(),
            cpus = config.cpu_count(),
            memory = config.memory_size(),
            "created virtual machine"
        );

        Ok(Self {
            core: Arc::new(MachineCore {
                id,
                host: host.clone(),
                config,
                queue,
                bridge,
                native: Mutex::new(native),
                state,
                fanout,
                socket_devices,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn config(&self) -> &VirtualMachineConfig {
        &self.core.config
    }

    /// Last state reported by the native VM.
    pub fn state(&self) -> VmState {
        self.core.state()
    }

    fn predicate(&self, check: fn(VmState) -> bool) -> bool {
        self.core
            .on_queue(move |_, native| Ok(check(native.state())))
            .unwrap_or(false)
    }

    pub fn can_start(&self) -> bool {
        self.predicate(VmState::can_start)
    }

    pub fn can_pause(&self) -> bool {
        self.predicate(VmState::can_pause)
    }

    pub fn can_resume(&self) -> bool {
        self.predicate(VmState::can_resume)
    }

    pub fn can_request_stop(&self) -> bool {
        self.predicate(VmState::can_request_stop)
    }

    pub fn can_stop(&self) -> bool {
        self.predicate(VmState::can_stop)
    }

    pub fn can_save(&self) -> bool {
        self.predicate(VmState::can_save)
    }

    pub fn can_restore(&self) -> bool {
        self.predicate(VmState::can_restore)
    }

    pub fn start(&self) -> Result<Pending<()>> {
        self.core
            .transition("start", VmState::can_start, |native, done| native.start(done))
    }

    pub fn pause(&self) -> Result<Pending<()>> {
        self.core
            .transition("pause", VmState::can_pause, |native, done| native.pause(done))
    }

    pub fn resume(&self) -> Result<Pending<()>> {
        self.core
            .transition("resume", VmState::can_resume, |native, done| native.resume(done))
    }

    /// Tear the VM down immediately.
    pub fn stop(&self) -> Result<Pending<()>> {
        self.core.host.require(Feature::ForcedStop);
        self.core
            .transition("stop", VmState::can_stop, |native, done| native.stop(done))
    }

    /// Ask the guest to shut down.
    ///
    /// Returns once the request is delivered, not when the guest stops.
    /// Watch [`state_changes`](Self::state_changes) for the outcome.
    pub fn request_stop(&self) -> Result<()> {
        self.core.on_queue(|core, native| {
            let state = native.state();
            if !state.can_request_stop() {
                return Err(BridgeError::invalid_transition("request stop", state));
            }
            native.request_stop().map_err(|e| {
                tracing::warn!(vm_id = %core.id, error = %e, "guest refused stop request");
                e
            })
        })?;

        if let Some(timeout) = self.core.host.config().lifecycle.request_stop_escalation() {
            arm_stop_escalation(Arc::downgrade(&self.core), timeout);
        }
        Ok(())
    }

    /// Snapshot the VM to `path`; the VM ends up stopped.
    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<Pending<()>> {
        self.core.host.require(Feature::SaveRestore);
        let path = path.as_ref().to_path_buf();
        self.core
            .transition("save", VmState::can_save, move |native, done| native.save_state(&path, done))
    }

    /// Restore a snapshot produced by [`save_state`](Self::save_state); the VM ends up paused.
    pub fn restore_state(&self, path: impl AsRef<Path>) -> Result<Pending<()>> {
        self.core.host.require(Feature::SaveRestore);
        let path: PathBuf = path.as_ref().to_path_buf();
        self.core.transition("restore", VmState::can_restore, move |native, done| {
            native.restore_state(&path, done)
        })
    }

    /// Subscribe to every subsequent state change.
    pub fn state_changes(&self) -> StateSubscription {
        self.core.fanout.subscribe()
    }

    pub fn unsubscribe(&self, subscription: Handle) -> bool {
        self.core.fanout.unsubscribe(subscription)
    }

    pub fn socket_devices(&self) -> Vec<VirtioSocketDevice> {
        (0..self.core.socket_devices.len())
            .filter_map(|index| self.socket_device(DeviceHandle::new(index)))
            .collect()
    }

    pub fn socket_device(&self, handle: DeviceHandle<kind::Socket>) -> Option<VirtioSocketDevice> {
        let state = self.core.socket_devices.get(handle.index())?;
        Some(VirtioSocketDevice::new(
            Arc::downgrade(&self.core),
            handle.index(),
            Arc::clone(state),
        ))
    }

    pub fn usb_controllers(&self) -> Vec<UsbController> {
        (0..self.core.config.usb_controllers().len())
            .map(|index| UsbController::new(Arc::downgrade(&self.core), index))
            .collect()
    }

    pub fn usb_controller(&self, handle: DeviceHandle<kind::Usb>) -> Option<UsbController> {
        (handle.index() < self.core.config.usb_controllers().len())
            .then(|| UsbController::new(Arc::downgrade(&self.core), handle.index()))
    }

    pub fn memory_balloon_devices(&self) -> Vec<MemoryBalloonDevice> {
        (0..self.core.config.memory_balloon_devices().len())
            .map(|index| MemoryBalloonDevice::new(Arc::downgrade(&self.core), index))
            .collect()
    }

    pub fn memory_balloon_device(&self, handle: DeviceHandle<kind::Balloon>) -> Option<MemoryBalloonDevice> {
        (handle.index() < self.core.config.memory_balloon_devices().len())
            .then(|| MemoryBalloonDevice::new(Arc::downgrade(&self.core), handle.index()))
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.core.queue.status()
    }

    pub(crate) fn core(&self) -> &Arc<MachineCore> {
        &self.core
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Force a stop if a cooperative stop request has not finished in time.
fn arm_stop_escalation(core: Weak<MachineCore>, timeout: Duration) {
    let spawned = std::thread::Builder::new()
        .name("vmbridge-stop-escalation".to_string())
        .spawn(move || {
            std::thread::sleep(timeout);
            let Some(core) = core.upgrade() else {
                return;
            };
            let submitted = core.transition("stop", VmState::can_stop, |native, done| native.stop(done));
            match submitted {
                Ok(pending) => {
                    tracing::warn!(vm_id = %core.id, ?timeout, "guest did not stop in time, forcing stop");
                    drop(pending);
                }
                Err(BridgeError::InvalidStateTransition { .. }) => {
                    tracing::trace!(vm_id = %core.id, "stop request completed before escalation");
                }
                Err(e) => {
                    tracing::warn!(vm_id = %core.id, error = %e, "stop escalation failed");
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to arm stop escalation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{ShutdownBehavior, SimulatedHypervisor};
    use crate::devices::{LinuxBootLoader, NetworkAttachment, NetworkDeviceConfiguration, SocketDeviceConfiguration};
    use vmbridge_core::BridgeConfig;

    struct Fixture {
        dir: tempfile::TempDir,
        sim: Arc<SimulatedHypervisor>,
        host: Host,
        kernel: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(BridgeConfig::default())
        }

        fn with_config(config: BridgeConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let kernel = dir.path().join("vmlinuz");
            std::fs::write(&kernel, b"kernel").unwrap();
            let sim = SimulatedHypervisor::new(&config.simulator).unwrap();
            let host = Host::new(sim.clone(), config);
            Self {
                dir,
                sim,
                host,
                kernel,
            }
        }

        fn config(&self) -> VirtualMachineConfig {
            let loader = LinuxBootLoader::new(&self.kernel).unwrap();
            VirtualMachineConfig::new(loader, 2, 512 * 1024 * 1024)
        }

        fn vm(&self) -> VirtualMachine {
            VirtualMachine::new(&self.host, self.config()).unwrap()
        }
    }

    async fn next_states(sub: &mut StateSubscription, target: VmState) -> Vec<VmState> {
        tokio::time::timeout(Duration::from_secs(5), sub.wait_for(target))
            .await
            .expect("state change timed out")
            .expect("subscription ended")
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let fx = Fixture::new();
        let vm = fx.vm();
        let err = vm.pause().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidStateTransition { ref operation, ref state }
                if operation == "pause" && state == "stopped"
        ));
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(vm.can_start());
        assert!(!vm.can_pause());
    }

    #[test]
    fn test_invalid_config_creates_nothing() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.set_cpu_count(0).unwrap();
        assert!(matches!(
            VirtualMachine::new(&fx.host, config),
            Err(BridgeError::ConfigInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_notifications_in_order() {
        let fx = Fixture::new();
        let vm = fx.vm();
        let mut states = vm.state_changes();

        vm.start().unwrap().await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        vm.pause().unwrap().await.unwrap();
        vm.resume().unwrap().await.unwrap();
        vm.stop().unwrap().await.unwrap();

        assert_eq!(
            next_states(&mut states, VmState::Stopped).await,
            vec![
                VmState::Starting,
                VmState::Running,
                VmState::Pausing,
                VmState::Paused,
                VmState::Resuming,
                VmState::Running,
                VmState::Stopping,
                VmState::Stopped,
            ]
        );
        assert!(vm.queue_status().completed >= 4);
    }

    #[tokio::test]
    async fn test_machines_notify_independently() {
        let fx = Fixture::new();
        let vms: Vec<_> = (0..3).map(|_| fx.vm()).collect();
        let mut subs: Vec<_> = vms.iter().map(|vm| vm.state_changes()).collect();

        let pending: Vec<_> = vms.iter().map(|vm| vm.start().unwrap()).collect();
        for p in pending {
            p.await.unwrap();
        }
        for sub in &mut subs {
            assert_eq!(
                next_states(sub, VmState::Running).await,
                vec![VmState::Starting, VmState::Running]
            );
        }
        assert_ne!(vms[0].id(), vms[1].id());
    }

    #[tokio::test]
    async fn test_state_change_events_emitted() {
        let fx = Fixture::new();
        let vm = fx.vm();
        let mut rx = fx.host.events().subscribe();
        vm.start().unwrap().await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::VM_STATE_CHANGED);
        assert_eq!(event.field("vm_id"), Some(&serde_json::json!(vm.id())));
        assert_eq!(event.field("state"), Some(&serde_json::json!("starting")));
    }

    #[tokio::test]
    async fn test_save_and_restore() {
        let fx = Fixture::new();
        let vm = fx.vm();
        let snapshot = fx.dir.path().join("vm.save");

        vm.start().unwrap().await.unwrap();
        assert!(vm.can_save());
        let mut states = vm.state_changes();
        vm.save_state(&snapshot).unwrap().await.unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(snapshot.exists());

        vm.restore_state(&snapshot).unwrap().await.unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        assert_eq!(
            next_states(&mut states, VmState::Paused).await,
            vec![VmState::Saving, VmState::Stopped, VmState::Restoring, VmState::Paused]
        );
        vm.resume().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_snapshot() {
        let fx = Fixture::new();
        let vm = fx.vm();
        let snapshot = fx.dir.path().join("other.save");
        vm.start().unwrap().await.unwrap();
        vm.save_state(&snapshot).unwrap().await.unwrap();

        let other = fx.vm();
        assert!(other.restore_state(&snapshot).unwrap().await.is_err());
        assert_eq!(other.state(), VmState::Stopped);
        assert!(vm.restore_state(fx.dir.path().join("missing")).unwrap().await.is_err());
    }

    #[tokio::test]
    async fn test_request_stop_cooperative() {
        let fx = Fixture::new();
        let vm = fx.vm();
        assert!(vm.request_stop().is_err());
        vm.start().unwrap().await.unwrap();

        let mut states = vm.state_changes();
        vm.request_stop().unwrap();
        assert_eq!(
            next_states(&mut states, VmState::Stopped).await,
            vec![VmState::Stopping, VmState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_request_stop_refused() {
        let fx = Fixture::new();
        let vm = fx.vm();
        vm.start().unwrap().await.unwrap();
        fx.sim
            .guest(vm.id())
            .unwrap()
            .set_shutdown_behavior(ShutdownBehavior::Refuse);

        let err = vm.request_stop().unwrap_err();
        assert!(matches!(err, BridgeError::OperationFailed { .. }));
        assert_eq!(vm.state(), VmState::Running);
    }

    #[tokio::test]
    async fn test_ignored_stop_request_escalates() {
        let mut config = BridgeConfig::default();
        config.lifecycle.request_stop_escalation_ms = Some(50);
        let fx = Fixture::with_config(config);
        let vm = fx.vm();
        vm.start().unwrap().await.unwrap();
        fx.sim
            .guest(vm.id())
            .unwrap()
            .set_shutdown_behavior(ShutdownBehavior::Ignore);

        let mut states = vm.state_changes();
        vm.request_stop().unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert_eq!(
            next_states(&mut states, VmState::Stopped).await,
            vec![VmState::Stopping, VmState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_crash_fails_pending_operations() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.add_socket_device(SocketDeviceConfiguration::new()).unwrap();
        let vm = VirtualMachine::new(&fx.host, config).unwrap();
        vm.start().unwrap().await.unwrap();

        let guest = fx.sim.guest(vm.id()).unwrap();
        guest.hold_connections(true);
        let connecting = vm.socket_devices().remove(0).connect(2000).unwrap();
        guest.crash().unwrap();

        assert!(connecting.await.is_err());
        assert_eq!(vm.state(), VmState::Error);
        assert!(!vm.can_start());
        assert!(matches!(vm.stop(), Err(BridgeError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn test_network_disconnect_event() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config
            .add_network_device(NetworkDeviceConfiguration::new(NetworkAttachment::Nat))
            .unwrap();
        let vm = VirtualMachine::new(&fx.host, config).unwrap();
        vm.start().unwrap().await.unwrap();

        let mut stream = fx
            .host
            .events()
            .subscribe_filtered(|e| e.key == events::VM_NETWORK_DISCONNECTED);
        fx.sim
            .guest(vm.id())
            .unwrap()
            .disconnect_network(0, "interface went away")
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.field("device"), Some(&serde_json::json!(0)));
        assert_eq!(event.field("reason"), Some(&serde_json::json!("interface went away")));
    }
}
