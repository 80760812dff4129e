//! Network device configuration.

use crate::vmnet::Network;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::OwnedFd;
use std::str::FromStr;
use std::sync::Arc;
use vmbridge_core::error::{BridgeError, Result};

/// Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Random locally administered unicast address.
    pub fn random_local() -> Self {
        let mut octets = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut octets);
        octets[0] = (octets[0] | 0x02) & 0xfe;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl FromStr for MacAddress {
    type Err = BridgeError;

    /// Six colon-separated two-digit hex octets, e.g. `02:42:0a:58:00:02`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BridgeError::InvalidFormat(format!("invalid MAC address: {s:?}"));
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Smallest MTU a file handle attachment accepts.
pub const FILE_HANDLE_MIN_MTU: u32 = 1500;
/// Largest MTU a file handle attachment accepts.
pub const FILE_HANDLE_MAX_MTU: u32 = 65535;

/// How a network device reaches the host.
#[derive(Debug, Clone)]
pub enum NetworkAttachment {
    /// Host NAT.
    Nat,
    /// Bridged to a host interface (e.g. `en0`).
    Bridged { interface: String },
    /// Raw frames over a connected datagram socket.
    FileHandle { fd: Arc<OwnedFd>, mtu: u32 },
    /// A vmnet network created by this process.
    Vmnet(Network),
}

impl NetworkAttachment {
    pub fn bridged(interface: impl Into<String>) -> Result<Self> {
        let interface = interface.into();
        if interface.is_empty() {
            return Err(BridgeError::InvalidFormat(
                "bridged interface identifier is empty".to_string(),
            ));
        }
        Ok(NetworkAttachment::Bridged { interface })
    }

    /// File handle attachment with the default MTU.
    pub fn file_handle(fd: OwnedFd) -> Self {
        NetworkAttachment::FileHandle {
            fd: Arc::new(fd),
            mtu: FILE_HANDLE_MIN_MTU,
        }
    }

    /// Set the MTU of a file handle attachment.
    pub fn set_mtu(&mut self, value: u32) -> Result<()> {
        match self {
            NetworkAttachment::FileHandle { mtu, .. } => {
                if !(FILE_HANDLE_MIN_MTU..=FILE_HANDLE_MAX_MTU).contains(&value) {
                    return Err(BridgeError::ConfigInvalid {
                        violations: vec![format!(
                            "MTU {value} outside {FILE_HANDLE_MIN_MTU}..={FILE_HANDLE_MAX_MTU}"
                        )],
                    });
                }
                *mtu = value;
                Ok(())
            }
            _ => Err(BridgeError::ConfigInvalid {
                violations: vec!["MTU applies only to file handle attachments".to_string()],
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NetworkAttachment::Nat => "nat",
            NetworkAttachment::Bridged { .. } => "bridged",
            NetworkAttachment::FileHandle { .. } => "file-handle",
            NetworkAttachment::Vmnet(_) => "vmnet",
        }
    }
}

/// Virtio network device.
#[derive(Debug, Clone)]
pub struct NetworkDeviceConfiguration {
    attachment: NetworkAttachment,
    mac_address: MacAddress,
}

impl NetworkDeviceConfiguration {
    /// New device with a random locally administered MAC address.
    pub fn new(attachment: NetworkAttachment) -> Self {
        Self {
            attachment,
            mac_address: MacAddress::random_local(),
        }
    }

    pub fn set_mac_address(&mut self, mac: MacAddress) {
        self.mac_address = mac;
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac_address
    }

    pub fn attachment(&self) -> &NetworkAttachment {
        &self.attachment
    }
}
