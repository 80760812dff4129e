//! vmbridge runtime - VM control and I/O bridge.
//!
//! Drives virtual machines through a [`backend::Hypervisor`]: lifecycle
//! transitions serialized on a per-VM dispatch queue, runtime devices,
//! vsock channels, the vmnet packet datapath and typed IPC sessions.

#![allow(clippy::result_large_err)]

pub mod artifact;
pub mod backend;
pub mod devices;
pub mod host;
pub mod ipc;
pub mod progress;
pub mod vm;
pub mod vmnet;

// Re-export common types
pub use backend::sim::{ShutdownBehavior, SimGuest, SimulatedHypervisor};
pub use backend::Hypervisor;
pub use devices::{
    DeviceHandle, MacAddress, MemoryBalloonDevice, SocketConnection, SocketListener, UsbController,
    UsbDevice, VirtioSocketDevice,
};
pub use host::{detect_platform_version, Feature, Host, HostLimits, PlatformVersion};
pub use ipc::{
    AcceptDecision, IpcValue, Listener, LocalBus, PeerIdentity, PeerRequirement, Session,
    SessionState,
};
pub use progress::Progress;
pub use vm::{MacOsInstaller, StateSubscription, VirtualMachine, VirtualMachineConfig, VmState};
pub use vmnet::{Interface, InterfaceDescriptor, InterfaceTarget, Mode, Network, NetworkConfiguration};

/// vmbridge runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
