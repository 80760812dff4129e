//! VM configuration: built incrementally, validated once, then sealed.

use crate::devices::{
    kind, BootLoader, ConsoleDeviceConfiguration, DeviceHandle, DirectorySharingDeviceConfiguration,
    EntropyDeviceConfiguration, GraphicsDeviceConfiguration, KeyboardConfiguration,
    MemoryBalloonDeviceConfiguration, NetworkDeviceConfiguration, PlatformConfiguration,
    PointingDeviceConfiguration, SerialPortConfiguration, SocketDeviceConfiguration,
    SoundDeviceConfiguration, StorageDeviceConfiguration, UsbControllerConfiguration,
};
use crate::host::{Feature, Host};
use std::collections::HashSet;
use vmbridge_core::error::{BridgeError, Result};

const MIB: u64 = 1024 * 1024;

/// Aggregate VM configuration.
#[derive(Debug, Clone)]
pub struct VirtualMachineConfig {
    boot_loader: Option<BootLoader>,
    cpu_count: u32,
    memory_size: u64,
    platform: PlatformConfiguration,
    storage_devices: Vec<StorageDeviceConfiguration>,
    network_devices: Vec<NetworkDeviceConfiguration>,
    serial_ports: Vec<SerialPortConfiguration>,
    console_devices: Vec<ConsoleDeviceConfiguration>,
    socket_devices: Vec<SocketDeviceConfiguration>,
    graphics_devices: Vec<GraphicsDeviceConfiguration>,
    keyboards: Vec<KeyboardConfiguration>,
    pointing_devices: Vec<PointingDeviceConfiguration>,
    sound_devices: Vec<SoundDeviceConfiguration>,
    entropy_devices: Vec<EntropyDeviceConfiguration>,
    memory_balloon_devices: Vec<MemoryBalloonDeviceConfiguration>,
    directory_sharing_devices: Vec<DirectorySharingDeviceConfiguration>,
    usb_controllers: Vec<UsbControllerConfiguration>,
    sealed: bool,
}

macro_rules! device_list {
    ($add:ident, $get:ident, $field:ident, $ty:ty, $kind:ty) => {
        pub fn $add(&mut self, device: $ty) -> Result<DeviceHandle<$kind>> {
            self.ensure_unsealed(stringify!($add))?;
            self.$field.push(device);
            Ok(DeviceHandle::new(self.$field.len() - 1))
        }

        pub fn $get(&self) -> &[$ty] {
            &self.$field
        }
    };
}

impl VirtualMachineConfig {
    pub fn new(boot_loader: impl Into<BootLoader>, cpu_count: u32, memory_size: u64) -> Self {
        Self {
            boot_loader: Some(boot_loader.into()),
            cpu_count,
            memory_size,
            platform: PlatformConfiguration::default(),
            storage_devices: Vec::new(),
            network_devices: Vec::new(),
            serial_ports: Vec::new(),
            console_devices: Vec::new(),
            socket_devices: Vec::new(),
            graphics_devices: Vec::new(),
            keyboards: Vec::new(),
            pointing_devices: Vec::new(),
            sound_devices: Vec::new(),
            entropy_devices: Vec::new(),
            memory_balloon_devices: Vec::new(),
            directory_sharing_devices: Vec::new(),
            usb_controllers: Vec::new(),
            sealed: false,
        }
    }

    fn ensure_unsealed(&self, operation: &str) -> Result<()> {
        if self.sealed {
            return Err(BridgeError::ConfigSealed(format!(
                "{operation} after the configuration was validated"
            )));
        }
        Ok(())
    }

    pub fn set_cpu_count(&mut self, cpu_count: u32) -> Result<()> {
        self.ensure_unsealed("set_cpu_count")?;
        self.cpu_count = cpu_count;
        Ok(())
    }

    pub fn set_memory_size(&mut self, bytes: u64) -> Result<()> {
        self.ensure_unsealed("set_memory_size")?;
        self.memory_size = bytes;
        Ok(())
    }

    pub fn set_boot_loader(&mut self, boot_loader: impl Into<BootLoader>) -> Result<()> {
        self.ensure_unsealed("set_boot_loader")?;
        self.boot_loader = Some(boot_loader.into());
        Ok(())
    }

    pub fn set_platform(&mut self, platform: PlatformConfiguration) -> Result<()> {
        self.ensure_unsealed("set_platform")?;
        self.platform = platform;
        Ok(())
    }

    device_list!(add_storage_device, storage_devices, storage_devices, StorageDeviceConfiguration, kind::Storage);
    device_list!(add_network_device, network_devices, network_devices, NetworkDeviceConfiguration, kind::Network);
    device_list!(add_serial_port, serial_ports, serial_ports, SerialPortConfiguration, kind::Serial);
    device_list!(add_console_device, console_devices, console_devices, ConsoleDeviceConfiguration, kind::Console);
    device_list!(add_socket_device, socket_devices, socket_devices, SocketDeviceConfiguration, kind::Socket);
    device_list!(add_graphics_device, graphics_devices, graphics_devices, GraphicsDeviceConfiguration, kind::Graphics);
    device_list!(add_keyboard, keyboards, keyboards, KeyboardConfiguration, kind::Keyboard);
    device_list!(add_pointing_device, pointing_devices, pointing_devices, PointingDeviceConfiguration, kind::Pointing);
    device_list!(add_sound_device, sound_devices, sound_devices, SoundDeviceConfiguration, kind::Sound);
    device_list!(add_entropy_device, entropy_devices, entropy_devices, EntropyDeviceConfiguration, kind::Entropy);
    device_list!(
        add_memory_balloon_device,
        memory_balloon_devices,
        memory_balloon_devices,
        MemoryBalloonDeviceConfiguration,
        kind::Balloon
    );
    device_list!(
        add_directory_sharing_device,
        directory_sharing_devices,
        directory_sharing_devices,
        DirectorySharingDeviceConfiguration,
        kind::DirectorySharing
    );
    device_list!(add_usb_controller, usb_controllers, usb_controllers, UsbControllerConfiguration, kind::Usb);

    pub fn boot_loader(&self) -> Option<&BootLoader> {
        self.boot_loader.as_ref()
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn platform(&self) -> &PlatformConfiguration {
        &self.platform
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Check the configuration against the host without changing anything.
    ///
    /// Reports every violation at once.
    pub fn validate(&self, host: &Host) -> Result<()> {
        let violations = self.violations(host);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::ConfigInvalid { violations })
        }
    }

    /// Validate, then freeze the configuration.
    pub fn seal(&mut self, host: &Host) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.validate(host)?;
        self.sealed = true;
        Ok(())
    }

    fn violations(&self, host: &Host) -> Vec<String> {
        let limits = host.limits();
        let mut violations = Vec::new();

        match &self.boot_loader {
            None => violations.push("boot loader is not set".to_string()),
            Some(loader) => {
                if let Some(feature) = loader.required_feature() {
                    require(host, feature, &mut violations);
                }
                if matches!(loader, BootLoader::MacOs) && !self.platform.is_mac() {
                    violations.push("macOS boot loader needs a Mac platform configuration".to_string());
                }
            }
        }

        if self.cpu_count < limits.min_cpu_count {
            violations.push(format!(
                "CPU count {} is below the minimum of {}",
                self.cpu_count, limits.min_cpu_count
            ));
        }
        if self.cpu_count > limits.max_cpu_count {
            violations.push(format!(
                "CPU count {} exceeds the maximum of {}",
                self.cpu_count, limits.max_cpu_count
            ));
        }
        if self.memory_size < limits.min_memory_size {
            violations.push(format!(
                "memory size {} is below the minimum of {}",
                self.memory_size, limits.min_memory_size
            ));
        }
        if self.memory_size > limits.max_memory_size {
            violations.push(format!(
                "memory size {} exceeds the maximum of {}",
                self.memory_size, limits.max_memory_size
            ));
        }
        if self.memory_size % MIB != 0 {
            violations.push(format!("memory size {} is not a multiple of 1 MiB", self.memory_size));
        }

        if self.socket_devices.len() > 1 {
            violations.push(format!(
                "{} socket devices configured; at most one is allowed",
                self.socket_devices.len()
            ));
        }
        if self.memory_balloon_devices.len() > 1 {
            violations.push(format!(
                "{} memory balloon devices configured; at most one is allowed",
                self.memory_balloon_devices.len()
            ));
        }

        let mut macs = HashSet::new();
        for device in &self.network_devices {
            if !macs.insert(device.mac_address()) {
                violations.push(format!("duplicate MAC address {}", device.mac_address()));
            }
        }

        let mut tags = HashSet::new();
        for device in &self.directory_sharing_devices {
            if !tags.insert(device.tag()) {
                violations.push(format!("duplicate directory sharing tag {:?}", device.tag()));
            }
            if device.share().is_none() {
                violations.push(format!("directory sharing tag {:?} has no share", device.tag()));
            }
        }
        if !self.directory_sharing_devices.is_empty() {
            require(host, Feature::DirectorySharing, &mut violations);
        }

        for console in &self.console_devices {
            violations.extend(console.violations());
        }
        if !self.console_devices.is_empty() {
            require(host, Feature::ConsoleDevice, &mut violations);
        }

        for storage in &self.storage_devices {
            for feature in storage.required_features() {
                require(host, feature, &mut violations);
            }
        }
        for graphics in &self.graphics_devices {
            require(host, graphics.required_feature(), &mut violations);
        }
        if !self.sound_devices.is_empty() {
            require(host, Feature::SoundDevice, &mut violations);
        }
        if !self.keyboards.is_empty() || !self.pointing_devices.is_empty() {
            require(host, Feature::KeyboardAndPointing, &mut violations);
        }
        if !self.usb_controllers.is_empty() {
            require(host, Feature::UsbController, &mut violations);
        }

        violations.dedup();
        violations
    }
}

fn require(host: &Host, feature: Feature, violations: &mut Vec<String>) {
    if let Err(e) = host.check_available(feature) {
        violations.push(e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedHypervisor;
    use crate::devices::{LinuxBootLoader, MacAddress, NetworkAttachment};
    use vmbridge_core::config::SimulatorConfig;
    use vmbridge_core::BridgeConfig;

    fn host(version: &str) -> Host {
        let config = BridgeConfig {
            simulator: SimulatorConfig {
                platform_version: version.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        Host::new(SimulatedHypervisor::new(&config.simulator).unwrap(), config)
    }

    fn linux_config(kernel: &tempfile::NamedTempFile) -> VirtualMachineConfig {
        let loader = LinuxBootLoader::new(kernel.path()).unwrap();
        VirtualMachineConfig::new(loader, 2, 512 * MIB)
    }

    #[test]
    fn test_valid_config() {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        let config = linux_config(&kernel);
        assert!(config.validate(&host("26.0")).is_ok());
        assert!(!config.is_sealed());
    }

    #[test]
    fn test_memory_below_minimum() {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        let mut config = linux_config(&kernel);
        config.set_memory_size(64 * MIB).unwrap();
        match config.validate(&host("26.0")) {
            Err(BridgeError::ConfigInvalid { violations }) => {
                assert_eq!(violations.len(), 1);
                assert!(violations[0].contains("below the minimum"));
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_every_violation_is_reported() {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        let mut config = linux_config(&kernel);
        config.set_cpu_count(0).unwrap();
        config.set_memory_size(512 * MIB + 1).unwrap();
        config.add_socket_device(SocketDeviceConfiguration::new()).unwrap();
        config.add_socket_device(SocketDeviceConfiguration::new()).unwrap();
        let mac: MacAddress = "02:00:00:00:00:01".parse().unwrap();
        for _ in 0..2 {
            let mut net = NetworkDeviceConfiguration::new(NetworkAttachment::Nat);
            net.set_mac_address(mac);
            config.add_network_device(net).unwrap();
        }

        match config.validate(&host("26.0")) {
            Err(BridgeError::ConfigInvalid { violations }) => {
                assert_eq!(violations.len(), 4, "{violations:?}");
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_platform_gated_devices_are_violations() {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        let mut config = linux_config(&kernel);
        config.add_usb_controller(UsbControllerConfiguration::xhci()).unwrap();
        let err = config.validate(&host("14.0")).unwrap_err();
        assert!(err.to_string().contains("USB controller"));
        assert!(config.validate(&host("15.0")).is_ok());
    }

    #[test]
    fn test_seal_blocks_mutation() {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        let mut config = linux_config(&kernel);
        let handle = config.add_entropy_device(EntropyDeviceConfiguration).unwrap();
        assert_eq!(handle.index(), 0);

        config.seal(&host("26.0")).unwrap();
        assert!(config.is_sealed());
        assert!(matches!(config.set_cpu_count(4), Err(BridgeError::ConfigSealed(_))));
        assert!(matches!(
            config.add_socket_device(SocketDeviceConfiguration::new()),
            Err(BridgeError::ConfigSealed(_))
        ));
        assert_eq!(config.cpu_count(), 2);
        assert_eq!(config.socket_devices().len(), 0);
    }

    #[test]
    fn test_failed_seal_leaves_config_mutable() {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        let mut config = linux_config(&kernel);
        config.set_cpu_count(64).unwrap();
        assert!(config.seal(&host("26.0")).is_err());
        assert!(!config.is_sealed());
        config.set_cpu_count(4).unwrap();
        assert!(config.seal(&host("26.0")).is_ok());
    }

    #[test]
    fn test_device_handles_index_per_kind() {
        let kernel = tempfile::NamedTempFile::new().unwrap();
        let mut config = linux_config(&kernel);
        let net0 = config
            .add_network_device(NetworkDeviceConfiguration::new(NetworkAttachment::Nat))
            .unwrap();
        let sock = config.add_socket_device(SocketDeviceConfiguration::new()).unwrap();
        let net1 = config
            .add_network_device(NetworkDeviceConfiguration::new(NetworkAttachment::Nat))
            .unwrap();
        assert_eq!((net0.index(), net1.index(), sock.index()), (0, 1, 0));
    }
}
