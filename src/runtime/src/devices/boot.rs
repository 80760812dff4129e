//! Boot loaders.

use crate::artifact;
use crate::host::Feature;
use std::path::{Path, PathBuf};
use vmbridge_core::error::{BridgeError, Result};

/// Header written into a freshly created variable store.
const EFI_STORE_MAGIC: &[u8; 8] = b"VBEFIVS\0";
const EFI_STORE_SIZE: usize = 128 * 1024;

/// Direct Linux kernel boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxBootLoader {
    kernel: PathBuf,
    command_line: String,
    initial_ramdisk: Option<PathBuf>,
}

impl LinuxBootLoader {
    /// The kernel image must exist.
    pub fn new(kernel: impl AsRef<Path>) -> Result<Self> {
        let kernel = existing_file(kernel.as_ref(), "kernel")?;
        Ok(Self {
            kernel,
            command_line: String::new(),
            initial_ramdisk: None,
        })
    }

    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    pub fn with_initial_ramdisk(mut self, initrd: impl AsRef<Path>) -> Result<Self> {
        self.initial_ramdisk = Some(existing_file(initrd.as_ref(), "initial ramdisk")?);
        Ok(self)
    }

    pub fn kernel(&self) -> &Path {
        &self.kernel
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn initial_ramdisk(&self) -> Option<&Path> {
        self.initial_ramdisk.as_deref()
    }
}

fn existing_file(path: &Path, what: &str) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(BridgeError::ConfigInvalid {
            violations: vec![format!("{what} {} does not exist", path.display())],
        });
    }
    Ok(path.to_path_buf())
}

/// EFI NVRAM backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiVariableStore {
    path: PathBuf,
}

impl EfiVariableStore {
    /// Create a new, empty store. Fails if the file exists and `overwrite` is false.
    pub fn create(path: impl AsRef<Path>, overwrite: bool) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            return Err(BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("EFI variable store {} already exists", path.display()),
            )));
        }
        let mut blob = vec![0u8; EFI_STORE_SIZE];
        blob[..EFI_STORE_MAGIC.len()].copy_from_slice(EFI_STORE_MAGIC);
        artifact::store(path, &blob)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = existing_file(path.as_ref(), "EFI variable store")?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// UEFI firmware boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiBootLoader {
    variable_store: EfiVariableStore,
}

impl EfiBootLoader {
    pub fn new(variable_store: EfiVariableStore) -> Self {
        Self { variable_store }
    }

    pub fn variable_store(&self) -> &EfiVariableStore {
        &self.variable_store
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootLoader {
    Linux(LinuxBootLoader),
    Efi(EfiBootLoader),
    MacOs,
}

impl BootLoader {
    pub(crate) fn required_feature(&self) -> Option<Feature> {
        match self {
            BootLoader::Linux(_) => None,
            BootLoader::Efi(_) => Some(Feature::EfiBootLoader),
            BootLoader::MacOs => Some(Feature::MacOsGuest),
        }
    }
}

impl From<LinuxBootLoader> for BootLoader {
    fn from(loader: LinuxBootLoader) -> Self {
        BootLoader::Linux(loader)
    }
}

impl From<EfiBootLoader> for BootLoader {
    fn from(loader: EfiBootLoader) -> Self {
        BootLoader::Efi(loader)
    }
}
