//! Storage attachments and storage device configuration.

use crate::host::Feature;
use serde::{Deserialize, Serialize};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use vmbridge_core::error::{BridgeError, Result};

/// Longest virtio block device identifier, in bytes.
pub const MAX_BLOCK_IDENTIFIER_LEN: usize = 20;

/// Host caching for disk images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskCachingMode {
    #[default]
    Automatic,
    Cached,
    Uncached,
}

/// How guest flushes reach the disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskSyncMode {
    #[default]
    Full,
    Fsync,
    None,
}

/// Backing store of a storage device.
#[derive(Debug, Clone)]
pub enum StorageAttachment {
    DiskImage {
        path: PathBuf,
        read_only: bool,
        caching: DiskCachingMode,
        sync: DiskSyncMode,
    },
    BlockDevice {
        fd: Arc<OwnedFd>,
        read_only: bool,
        sync: DiskSyncMode,
    },
    NetworkBlockDevice {
        url: Url,
        timeout: Duration,
        forced_read_only: bool,
        sync: DiskSyncMode,
    },
}

impl StorageAttachment {
    /// Disk image with default caching and sync modes. The image must exist.
    pub fn disk_image(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        Self::disk_image_with_options(path, read_only, DiskCachingMode::default(), DiskSyncMode::default())
    }

    pub fn disk_image_with_options(
        path: impl AsRef<Path>,
        read_only: bool,
        caching: DiskCachingMode,
        sync: DiskSyncMode,
    ) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(BridgeError::ConfigInvalid {
                violations: vec![format!("disk image {} is not a regular file", path.display())],
            });
        }
        Ok(StorageAttachment::DiskImage {
            path: path.to_path_buf(),
            read_only,
            caching,
            sync,
        })
    }

    /// Opened block device (e.g. `/dev/rdisk4`).
    pub fn block_device(fd: OwnedFd, read_only: bool, sync: DiskSyncMode) -> Self {
        StorageAttachment::BlockDevice {
            fd: Arc::new(fd),
            read_only,
            sync,
        }
    }

    /// NBD export, e.g. `nbd://host:10809/export` or `nbd+unix:///export?socket=/tmp/nbd.sock`.
    pub fn network_block_device(
        url: &str,
        timeout: Duration,
        forced_read_only: bool,
        sync: DiskSyncMode,
    ) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| BridgeError::InvalidFormat(format!("invalid NBD URL {url:?}: {e}")))?;
        match url.scheme() {
            "nbd" | "nbds" | "nbd+unix" | "nbds+unix" => {}
            other => {
                return Err(BridgeError::InvalidFormat(format!(
                    "unsupported NBD URL scheme {other:?}"
                )))
            }
        }
        Ok(StorageAttachment::NetworkBlockDevice {
            url,
            timeout,
            forced_read_only,
            sync,
        })
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            StorageAttachment::DiskImage { read_only, .. }
            | StorageAttachment::BlockDevice { read_only, .. } => *read_only,
            StorageAttachment::NetworkBlockDevice { forced_read_only, .. } => *forced_read_only,
        }
    }
}

/// Bus a storage attachment is exposed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBus {
    VirtioBlock { identifier: Option<String> },
    UsbMassStorage,
    Nvme,
}

/// Storage device configuration.
#[derive(Debug, Clone)]
pub struct StorageDeviceConfiguration {
    attachment: StorageAttachment,
    bus: StorageBus,
}

impl StorageDeviceConfiguration {
    pub fn virtio_block(attachment: StorageAttachment) -> Self {
        Self {
            attachment,
            bus: StorageBus::VirtioBlock { identifier: None },
        }
    }

    pub fn usb_mass_storage(attachment: StorageAttachment) -> Self {
        Self {
            attachment,
            bus: StorageBus::UsbMassStorage,
        }
    }

    pub fn nvme(attachment: StorageAttachment) -> Self {
        Self {
            attachment,
            bus: StorageBus::Nvme,
        }
    }

    /// Serial number the guest sees for a virtio block device.
    ///
    /// At most 20 bytes of ASCII.
    pub fn set_block_identifier(&mut self, id: &str) -> Result<()> {
        let StorageBus::VirtioBlock { identifier } = &mut self.bus else {
            return Err(BridgeError::ConfigInvalid {
                violations: vec!["block identifier applies only to virtio block devices".to_string()],
            });
        };
        if id.is_empty() || id.len() > MAX_BLOCK_IDENTIFIER_LEN || !id.is_ascii() {
            return Err(BridgeError::InvalidFormat(format!(
                "block device identifier {id:?} must be 1 to {MAX_BLOCK_IDENTIFIER_LEN} ASCII bytes"
            )));
        }
        *identifier = Some(id.to_string());
        Ok(())
    }

    pub fn block_identifier(&self) -> Option<&str> {
        match &self.bus {
            StorageBus::VirtioBlock { identifier } => identifier.as_deref(),
            _ => None,
        }
    }

    pub fn attachment(&self) -> &StorageAttachment {
        &self.attachment
    }

    pub fn bus(&self) -> &StorageBus {
        &self.bus
    }

    /// Platform features this device needs.
    pub(crate) fn required_features(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        if self.bus == StorageBus::Nvme {
            features.push(Feature::NvmeController);
        }
        if matches!(self.attachment, StorageAttachment::NetworkBlockDevice { .. }) {
            features.push(Feature::NetworkBlockDevice);
        }
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_image_must_exist() {
        let err = StorageAttachment::disk_image("/nonexistent/disk.img", false).unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));

        let file = tempfile::NamedTempFile::new().unwrap();
        let attachment = StorageAttachment::disk_image(file.path(), true).unwrap();
        assert!(attachment.is_read_only());
    }

    #[test]
    fn test_disk_image_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = StorageAttachment::disk_image(dir.path(), false).unwrap_err();
        assert!(matches!(err, BridgeError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_block_identifier_limits() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let attachment = StorageAttachment::disk_image(file.path(), false).unwrap();
        let mut device = StorageDeviceConfiguration::virtio_block(attachment.clone());

        device.set_block_identifier("disk-0123456789abcde").unwrap();
        assert_eq!(device.block_identifier(), Some("disk-0123456789abcde"));

        let too_long = "x".repeat(MAX_BLOCK_IDENTIFIER_LEN + 1);
        assert!(matches!(
            device.set_block_identifier(&too_long),
            Err(BridgeError::InvalidFormat(_))
        ));
        assert!(device.set_block_identifier("disque-é").is_err());
        assert!(device.set_block_identifier("").is_err());

        let mut nvme = StorageDeviceConfiguration::nvme(attachment);
        assert!(nvme.set_block_identifier("nvme0").is_err());
    }

    #[test]
    fn test_network_block_device_url() {
        let nbd = StorageAttachment::network_block_device(
            "nbd://localhost:10809/export",
            Duration::from_secs(5),
            true,
            DiskSyncMode::Full,
        )
        .unwrap();
        assert!(nbd.is_read_only());
        let device = StorageDeviceConfiguration::virtio_block(nbd);
        assert_eq!(device.required_features(), vec![Feature::NetworkBlockDevice]);

        assert!(StorageAttachment::network_block_device(
            "http://localhost/export",
            Duration::from_secs(5),
            false,
            DiskSyncMode::None,
        )
        .is_err());
        assert!(StorageAttachment::network_block_device(
            "not a url",
            Duration::from_secs(5),
            false,
            DiskSyncMode::None,
        )
        .is_err());
    }
}
