//! Directory sharing (virtio-fs).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vmbridge_core::error::{BridgeError, Result};

/// Longest virtio-fs tag, in bytes.
pub const MAX_TAG_LEN: usize = 36;

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedDirectory {
    path: PathBuf,
    read_only: bool,
}

impl SharedDirectory {
    pub fn new(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(BridgeError::ConfigInvalid {
                violations: vec![format!("shared path {} is not a directory", path.display())],
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryShare {
    Single(SharedDirectory),
    /// Each entry appears as a subdirectory named by its key.
    Multiple(BTreeMap<String, SharedDirectory>),
}

/// Virtio file system device.
#[derive(Debug, Clone)]
pub struct DirectorySharingDeviceConfiguration {
    tag: String,
    share: Option<DirectoryShare>,
}

impl DirectorySharingDeviceConfiguration {
    /// `tag` is the name the guest mounts, e.g. `mount -t virtiofs <tag> /mnt`.
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        validate_tag(&tag)?;
        Ok(Self { tag, share: None })
    }

    pub fn set_share(&mut self, share: DirectoryShare) {
        self.share = Some(share);
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn share(&self) -> Option<&DirectoryShare> {
        self.share.as_ref()
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(BridgeError::InvalidFormat("virtio-fs tag is empty".to_string()));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(BridgeError::InvalidFormat(format!(
            "virtio-fs tag {tag:?} exceeds {MAX_TAG_LEN} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_validation() {
        assert!(DirectorySharingDeviceConfiguration::new("").is_err());
        assert!(DirectorySharingDeviceConfiguration::new("a".repeat(MAX_TAG_LEN + 1)).is_err());
        let device = DirectorySharingDeviceConfiguration::new("workspace").unwrap();
        assert_eq!(device.tag(), "workspace");
        assert!(device.share().is_none());
    }

    #[test]
    fn test_shared_directory_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDirectory::new(dir.path(), true).unwrap();
        assert!(shared.read_only());

        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(SharedDirectory::new(file.path(), false).is_err());
    }

    #[test]
    fn test_multiple_share() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut dirs = BTreeMap::new();
        dirs.insert("src".to_string(), SharedDirectory::new(a.path(), false).unwrap());
        dirs.insert("cache".to_string(), SharedDirectory::new(b.path(), true).unwrap());

        let mut device = DirectorySharingDeviceConfiguration::new("shared").unwrap();
        device.set_share(DirectoryShare::Multiple(dirs));
        match device.share() {
            Some(DirectoryShare::Multiple(map)) => assert_eq!(map.len(), 2),
            other => panic!("unexpected share: {other:?}"),
        }
    }
}
