//! Serial ports and virtio console devices.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vmbridge_core::error::{BridgeError, Result};

/// Ports a virtio console device can carry.
pub const MAX_CONSOLE_PORTS: u32 = 31;

/// Where serial output goes and input comes from.
#[derive(Debug, Clone)]
pub enum SerialAttachment {
    FileHandle {
        read: Option<Arc<OwnedFd>>,
        write: Option<Arc<OwnedFd>>,
    },
    File {
        path: PathBuf,
        append: bool,
    },
}

impl SerialAttachment {
    /// At least one of `read` and `write` must be given.
    pub fn file_handle(read: Option<OwnedFd>, write: Option<OwnedFd>) -> Result<Self> {
        if read.is_none() && write.is_none() {
            return Err(BridgeError::ConfigInvalid {
                violations: vec!["serial file handle attachment needs a read or write descriptor".to_string()],
            });
        }
        Ok(SerialAttachment::FileHandle {
            read: read.map(Arc::new),
            write: write.map(Arc::new),
        })
    }

    /// Log serial output to `path`; its directory must exist.
    pub fn file(path: impl AsRef<Path>, append: bool) -> Result<Self> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if !parent.is_dir() {
            return Err(BridgeError::ConfigInvalid {
                violations: vec![format!("serial log directory {} does not exist", parent.display())],
            });
        }
        Ok(SerialAttachment::File {
            path: path.to_path_buf(),
            append,
        })
    }
}

/// Virtio console serial port.
#[derive(Debug, Clone)]
pub struct SerialPortConfiguration {
    attachment: SerialAttachment,
}

impl SerialPortConfiguration {
    pub fn new(attachment: SerialAttachment) -> Self {
        Self { attachment }
    }

    pub fn attachment(&self) -> &SerialAttachment {
        &self.attachment
    }
}

/// One port of a multiport console device.
#[derive(Debug, Clone, Default)]
pub struct ConsolePortConfiguration {
    pub name: Option<String>,
    pub is_console: bool,
    pub attachment: Option<SerialAttachment>,
}

/// Virtio console device with named ports.
#[derive(Debug, Clone, Default)]
pub struct ConsoleDeviceConfiguration {
    ports: BTreeMap<u32, ConsolePortConfiguration>,
}

impl ConsoleDeviceConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_port(&mut self, index: u32, port: ConsolePortConfiguration) -> Result<()> {
        if index >= MAX_CONSOLE_PORTS {
            return Err(BridgeError::ConfigInvalid {
                violations: vec![format!(
                    "console port index {index} exceeds maximum port count {MAX_CONSOLE_PORTS}"
                )],
            });
        }
        self.ports.insert(index, port);
        Ok(())
    }

    pub fn port(&self, index: u32) -> Option<&ConsolePortConfiguration> {
        self.ports.get(&index)
    }

    pub fn ports(&self) -> impl Iterator<Item = (u32, &ConsolePortConfiguration)> {
        self.ports.iter().map(|(i, p)| (*i, p))
    }

    /// Structural problems reported by VM config validation.
    pub(crate) fn violations(&self) -> Vec<String> {
        let consoles = self.ports.values().filter(|p| p.is_console).count();
        if consoles > 1 {
            vec![format!("console device marks {consoles} ports as the console; at most one allowed")]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_handle_needs_a_descriptor() {
        assert!(SerialAttachment::file_handle(None, None).is_err());
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        assert!(SerialAttachment::file_handle(None, Some(OwnedFd::from(a))).is_ok());
    }

    #[test]
    fn test_file_attachment_needs_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SerialAttachment::file(dir.path().join("console.log"), true).is_ok());
        assert!(SerialAttachment::file("/nonexistent/dir/console.log", false).is_err());
    }

    #[test]
    fn test_console_port_limits() {
        let mut console = ConsoleDeviceConfiguration::new();
        console
            .set_port(
                0,
                ConsolePortConfiguration {
                    name: Some("org.vmbridge.agent".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(console.set_port(MAX_CONSOLE_PORTS, Default::default()).is_err());
        assert_eq!(console.port(0).unwrap().name.as_deref(), Some("org.vmbridge.agent"));
        assert!(console.violations().is_empty());

        let primary = ConsolePortConfiguration {
            is_console: true,
            ..Default::default()
        };
        console.set_port(1, primary.clone()).unwrap();
        console.set_port(2, primary).unwrap();
        assert_eq!(console.violations().len(), 1);
        assert_eq!(console.ports().count(), 3);
    }
}
