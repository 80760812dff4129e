//! Device bridge: configuration values and post-start runtime devices.
//!
//! Configuration objects are plain values. Adding one to a
//! `VirtualMachineConfig` returns a typed [`DeviceHandle`], which later
//! looks up the runtime device (socket, USB controller, balloon) once the
//! VM exists.

pub mod balloon;
pub mod boot;
pub mod console;
pub mod directory;
pub mod display;
pub mod network;
pub mod platform;
pub mod socket;
pub mod storage;
pub mod usb;

use std::fmt;
use std::marker::PhantomData;

pub use balloon::{MemoryBalloonDevice, MemoryBalloonDeviceConfiguration};
pub use boot::{BootLoader, EfiBootLoader, EfiVariableStore, LinuxBootLoader};
pub use console::{ConsoleDeviceConfiguration, ConsolePortConfiguration, SerialAttachment, SerialPortConfiguration};
pub use directory::{DirectoryShare, DirectorySharingDeviceConfiguration, SharedDirectory};
pub use display::{
    EntropyDeviceConfiguration, GraphicsDeviceConfiguration, KeyboardConfiguration,
    PointingDeviceConfiguration, SoundDeviceConfiguration, SoundStream,
};
pub use network::{MacAddress, NetworkAttachment, NetworkDeviceConfiguration};
pub use platform::{HardwareModel, MachineIdentifier, PlatformConfiguration};
pub use socket::{SocketConnection, SocketDeviceConfiguration, SocketListener, VirtioSocketDevice, VsockAddr};
pub use storage::{DiskCachingMode, DiskSyncMode, StorageAttachment, StorageDeviceConfiguration};
pub use usb::{UsbController, UsbControllerConfiguration, UsbDevice, UsbDeviceInfo};

/// Device kind markers for [`DeviceHandle`].
pub mod kind {
    macro_rules! kinds {
        ($($name:ident => $label:literal),* $(,)?) => {
            $(
                #[derive(Debug)]
                pub enum $name {}

                impl super::DeviceKind for $name {
                    const LABEL: &'static str = $label;
                }
            )*
        };
    }

    kinds! {
        Storage => "storage",
        Network => "network",
        Serial => "serial",
        Console => "console",
        Socket => "socket",
        Graphics => "graphics",
        Keyboard => "keyboard",
        Pointing => "pointing",
        Sound => "sound",
        Entropy => "entropy",
        Balloon => "memory-balloon",
        DirectorySharing => "directory-sharing",
        Usb => "usb-controller",
    }
}

pub trait DeviceKind {
    const LABEL: &'static str;
}

/// Typed reference to a device added to a configuration.
///
/// Lookup-only: it never owns the device or the VM.
pub struct DeviceHandle<K> {
    index: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K> DeviceHandle<K> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            _kind: PhantomData,
        }
    }

    /// Position within the configuration's list for this kind.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<K> Clone for DeviceHandle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for DeviceHandle<K> {}

impl<K> PartialEq for DeviceHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<K> Eq for DeviceHandle<K> {}

impl<K: DeviceKind> fmt::Debug for DeviceHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceHandle<{}>({})", K::LABEL, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_handle_debug_names_kind() {
        let handle: DeviceHandle<kind::Socket> = DeviceHandle::new(0);
        assert_eq!(format!("{handle:?}"), "DeviceHandle<socket>(0)");
        let copy = handle;
        assert_eq!(copy, handle);
        assert_eq!(copy.index(), 0);
    }
}
