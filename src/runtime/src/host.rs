//! Host capabilities: OS version gating and hypervisor-reported bounds.
//!
//! Every platform-dependent feature has an availability predicate. Value
//! constructors return `UnsupportedOnPlatform` so callers can check up front;
//! runtime operations treat an unavailable feature as a programming defect
//! and panic through [`Host::require`].

use crate::backend::Hypervisor;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use vmbridge_core::error::{BridgeError, Result};
use vmbridge_core::{BridgeConfig, EventEmitter};

/// Host OS version, e.g. `15.4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlatformVersion {
    pub major: u32,
    pub minor: u32,
}

impl PlatformVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PlatformVersion {
    type Err = BridgeError;

    /// Accepts `26`, `15.4` and `15.4.1` (patch ignored).
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let parse = |part: Option<&str>| -> Result<u32> {
            match part {
                None => Ok(0),
                Some(p) => p
                    .parse()
                    .map_err(|_| BridgeError::InvalidFormat(format!("invalid platform version: {s}"))),
            }
        };
        let major = match parts.next() {
            Some(p) if !p.is_empty() => parse(Some(p))?,
            _ => return Err(BridgeError::InvalidFormat(format!("invalid platform version: {s}"))),
        };
        let minor = parse(parts.next())?;
        Ok(Self { major, minor })
    }
}

/// Platform-gated capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    ForcedStop,
    MacOsGuest,
    GraphicsDevice,
    SoundDevice,
    KeyboardAndPointing,
    DirectorySharing,
    EfiBootLoader,
    VirtioGraphics,
    ConsoleDevice,
    NetworkBlockDevice,
    NvmeController,
    SaveRestore,
    UsbController,
    IpcSession,
    IpcListener,
    PeerRequirement,
    VmnetNetwork,
}

impl Feature {
    /// Minimum OS version that ships the feature.
    pub fn required(self) -> PlatformVersion {
        match self {
            Feature::ForcedStop
            | Feature::MacOsGuest
            | Feature::GraphicsDevice
            | Feature::SoundDevice
            | Feature::KeyboardAndPointing
            | Feature::DirectorySharing => PlatformVersion::new(12, 0),
            Feature::EfiBootLoader
            | Feature::VirtioGraphics
            | Feature::ConsoleDevice
            | Feature::IpcSession => PlatformVersion::new(13, 0),
            Feature::NetworkBlockDevice
            | Feature::NvmeController
            | Feature::SaveRestore
            | Feature::IpcListener
            | Feature::PeerRequirement => PlatformVersion::new(14, 0),
            Feature::UsbController => PlatformVersion::new(15, 0),
            Feature::VmnetNetwork => PlatformVersion::new(26, 0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::ForcedStop => "forced stop",
            Feature::MacOsGuest => "macOS guest",
            Feature::GraphicsDevice => "graphics device",
            Feature::SoundDevice => "sound device",
            Feature::KeyboardAndPointing => "keyboard and pointing device",
            Feature::DirectorySharing => "directory sharing",
            Feature::EfiBootLoader => "EFI boot loader",
            Feature::VirtioGraphics => "virtio graphics",
            Feature::ConsoleDevice => "virtio console",
            Feature::NetworkBlockDevice => "network block device",
            Feature::NvmeController => "NVMe controller",
            Feature::SaveRestore => "save/restore",
            Feature::UsbController => "USB controller",
            Feature::IpcSession => "IPC session",
            Feature::IpcListener => "IPC listener",
            Feature::PeerRequirement => "IPC peer requirement",
            Feature::VmnetNetwork => "vmnet network",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// CPU and memory bounds reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    pub min_cpu_count: u32,
    pub max_cpu_count: u32,
    pub min_memory_size: u64,
    pub max_memory_size: u64,
}

struct HostInner {
    backend: Arc<dyn Hypervisor>,
    limits: OnceLock<HostLimits>,
    config: BridgeConfig,
    events: EventEmitter,
}

/// Entry point to a hypervisor backend.
///
/// Cheap to clone. Bounds are queried from the backend once and reused for
/// the lifetime of the process.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(backend: Arc<dyn Hypervisor>, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                backend,
                limits: OnceLock::new(),
                config,
                events: EventEmitter::default(),
            }),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Hypervisor> {
        &self.inner.backend
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Telemetry events (state changes, USB hot-plug, install progress).
    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    pub fn platform_version(&self) -> PlatformVersion {
        self.inner.backend.platform_version()
    }

    pub fn limits(&self) -> HostLimits {
        *self.inner.limits.get_or_init(|| {
            let limits = self.inner.backend.limits();
            tracing::debug!(backend = self.backend_name(), ?limits, "queried host limits");
            limits
        })
    }

    /// Availability predicate.
    pub fn is_available(&self, feature: Feature) -> bool {
        self.platform_version() >= feature.required()
    }

    /// Recoverable availability check for constructors.
    pub fn check_available(&self, feature: Feature) -> Result<()> {
        if self.is_available(feature) {
            Ok(())
        } else {
            Err(BridgeError::UnsupportedOnPlatform {
                feature: feature.name().to_string(),
                required: feature.required().to_string(),
            })
        }
    }

    /// Abort on an unavailable feature.
    ///
    /// Reaching this with an unavailable feature means the caller skipped
    /// the availability predicate: a build/OS mismatch, not a runtime error.
    pub fn require(&self, feature: Feature) {
        if !self.is_available(feature) {
            panic!(
                "{} requires platform {} but host is {}",
                feature,
                feature.required(),
                self.platform_version()
            );
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("backend", &self.backend_name())
            .field("platform", &self.platform_version())
            .finish()
    }
}

/// Read the running macOS version.
///
/// Returns `None` elsewhere or when `sw_vers` is unavailable.
pub fn detect_platform_version() -> Option<PlatformVersion> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()?;
        if !output.status.success() {
            tracing::warn!("sw_vers exited with {}", output.status);
            return None;
        }
        String::from_utf8_lossy(&output.stdout).parse().ok()
    }

    #[cfg(not(target_os = "macos"))]
    {
        None
    }
}
