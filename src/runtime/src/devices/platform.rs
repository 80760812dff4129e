//! Platform identity: hardware model and machine identifier.

use crate::artifact;
use std::path::{Path, PathBuf};
use vmbridge_core::error::{BridgeError, Result};

/// Opaque hardware model token of a Mac guest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HardwareModel(Vec<u8>);

impl HardwareModel {
    pub fn from_data_representation(data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        if data.is_empty() {
            return Err(BridgeError::InvalidFormat("hardware model data is empty".to_string()));
        }
        Ok(Self(data))
    }

    pub fn data_representation(&self) -> &[u8] {
        &self.0
    }

    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        artifact::store(path, &self.0)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_data_representation(artifact::load(path)?)
    }
}

/// Opaque identity of one VM instance; must match across save/restore.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineIdentifier(Vec<u8>);

impl MachineIdentifier {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn from_data_representation(data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        if data.is_empty() {
            return Err(BridgeError::InvalidFormat(
                "machine identifier data is empty".to_string(),
            ));
        }
        Ok(Self(data))
    }

    pub fn data_representation(&self) -> &[u8] {
        &self.0
    }

    pub fn store(&self, path: impl AsRef<Path>) -> Result<()> {
        artifact::store(path, &self.0)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_data_representation(artifact::load(path)?)
    }
}

impl Default for MachineIdentifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform the guest runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformConfiguration {
    Generic {
        machine_identifier: MachineIdentifier,
    },
    Mac {
        hardware_model: HardwareModel,
        machine_identifier: MachineIdentifier,
        auxiliary_storage: PathBuf,
    },
}

impl PlatformConfiguration {
    pub fn generic() -> Self {
        PlatformConfiguration::Generic {
            machine_identifier: MachineIdentifier::new(),
        }
    }

    pub fn machine_identifier(&self) -> &MachineIdentifier {
        match self {
            PlatformConfiguration::Generic { machine_identifier }
            | PlatformConfiguration::Mac {
                machine_identifier, ..
            } => machine_identifier,
        }
    }

    pub fn is_mac(&self) -> bool {
        matches!(self, PlatformConfiguration::Mac { .. })
    }
}

impl Default for PlatformConfiguration {
    fn default() -> Self {
        Self::generic()
    }
}
