//! vmnet network configuration.
//!
//! Built by composing adjustments. Every adjustment returns a
//! [`VmnetReturn`] and a rejected adjustment leaves the configuration
//! exactly as it was, so callers decide how to treat partial failures.

use super::status::VmnetReturn;
use crate::devices::MacAddress;
use crate::host::{Feature, Host};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use vmbridge_core::error::{BridgeError, Result};

/// Minimum MTU accepted by [`NetworkConfiguration::set_mtu`].
pub const MIN_MTU: u32 = 1280;
/// Maximum MTU accepted by [`NetworkConfiguration::set_mtu`].
pub const MAX_MTU: u32 = 9000;

/// Range every vmnet IPv4 subnet must overlap.
const PRIVATE_RANGE: Ipv4Subnet = Ipv4Subnet {
    address: Ipv4Addr::new(192, 168, 0, 0),
    prefix_len: 16,
};

/// Operating mode of a vmnet network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Guests reach each other and the host only.
    Host,
    /// Guests additionally reach the outside through NAT.
    Shared,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Host => "host",
            Mode::Shared => "shared",
        }
    }
}

impl FromStr for Mode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Mode::Host),
            "shared" => Ok(Mode::Shared),
            other => Err(BridgeError::InvalidFormat(format!("unknown vmnet mode: {other}"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn split_cidr(cidr: &str) -> Result<(&str, u8)> {
    let parts: Vec<&str> = cidr.split('/').collect();
    if parts.len() != 2 {
        return Err(BridgeError::InvalidFormat(format!("invalid CIDR notation: {cidr}")));
    }
    let prefix_len: u8 = parts[1].parse().map_err(|e| {
        BridgeError::InvalidFormat(format!("invalid prefix length '{}': {}", parts[1], e))
    })?;
    Ok((parts[0], prefix_len))
}

/// IPv4 address with a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Subnet {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Subnet {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 30 {
            return Err(BridgeError::InvalidFormat(format!(
                "prefix length {prefix_len} too large (max 30 for usable hosts)"
            )));
        }
        Ok(Self { address, prefix_len })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix_len))
    }

    /// Subnet with host bits cleared.
    pub fn masked(&self) -> Self {
        Self {
            address: Ipv4Addr::from(u32::from(self.address) & mask_bits(self.prefix_len)),
            prefix_len: self.prefix_len,
        }
    }

    /// First assignable address (network + 1).
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.masked().address) + 1)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.masked().address) | !mask_bits(self.prefix_len))
    }

    /// Whether `ip` may be handed to a client: inside the subnet and
    /// neither the gateway nor the broadcast address.
    pub fn is_assignable(&self, ip: Ipv4Addr) -> bool {
        self.contains(ip) && ip != self.first_host() && ip != self.broadcast()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = mask_bits(self.prefix_len);
        u32::from(ip) & mask == u32::from(self.address) & mask
    }

    pub fn overlaps(&self, other: &Ipv4Subnet) -> bool {
        let shorter = self.prefix_len.min(other.prefix_len);
        let mask = mask_bits(shorter);
        u32::from(self.address) & mask == u32::from(other.address) & mask
    }
}

fn mask_bits(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = BridgeError;

    fn from_str(cidr: &str) -> Result<Self> {
        let (address, prefix_len) = split_cidr(cidr)?;
        let address: Ipv4Addr = address.parse().map_err(|e| {
            BridgeError::InvalidFormat(format!("invalid network address '{address}': {e}"))
        })?;
        Self::new(address, prefix_len)
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// IPv6 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    address: Ipv6Addr,
    prefix_len: u8,
}

impl Ipv6Prefix {
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 128 {
            return Err(BridgeError::InvalidFormat(format!(
                "prefix length {prefix_len} exceeds 128"
            )));
        }
        Ok(Self { address, prefix_len })
    }

    pub fn address(&self) -> Ipv6Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: Ipv6Addr) -> bool {
        let mask = if self.prefix_len == 0 {
            0
        } else {
            u128::MAX << (128 - self.prefix_len as u32)
        };
        u128::from(ip) & mask == u128::from(self.address) & mask
    }
}

impl FromStr for Ipv6Prefix {
    type Err = BridgeError;

    fn from_str(cidr: &str) -> Result<Self> {
        let (address, prefix_len) = split_cidr(cidr)?;
        let address: Ipv6Addr = address.parse().map_err(|e| {
            BridgeError::InvalidFormat(format!("invalid IPv6 address '{address}': {e}"))
        })?;
        Self::new(address, prefix_len)
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardingRule {
    pub protocol: Protocol,
    pub family: AddressFamily,
    pub internal_port: u16,
    pub external_port: u16,
    pub internal_address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpReservation {
    pub client: MacAddress,
    pub address: Ipv4Addr,
}

/// vmnet network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfiguration {
    mode: Mode,
    external_interface: Option<String>,
    ipv4_subnet: Option<Ipv4Subnet>,
    ipv6_prefix: Option<Ipv6Prefix>,
    mtu: Option<u32>,
    nat44: bool,
    nat66: bool,
    dhcp: bool,
    dns_proxy: bool,
    router_advertisement: bool,
    dhcp_reservations: Vec<DhcpReservation>,
    port_forwarding_rules: Vec<PortForwardingRule>,
}

impl NetworkConfiguration {
    pub fn new(host: &Host, mode: Mode) -> Result<Self> {
        host.check_available(Feature::VmnetNetwork)?;
        Ok(Self {
            mode,
            external_interface: None,
            ipv4_subnet: None,
            ipv6_prefix: None,
            mtu: None,
            nat44: true,
            nat66: true,
            dhcp: true,
            dns_proxy: true,
            router_advertisement: true,
            dhcp_reservations: Vec::new(),
            port_forwarding_rules: Vec::new(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Host interface to share; shared mode only.
    #[must_use]
    pub fn set_external_interface(&mut self, ifname: &str) -> VmnetReturn {
        if self.mode != Mode::Shared || ifname.is_empty() {
            return VmnetReturn::InvalidArgument;
        }
        self.external_interface = Some(ifname.to_string());
        VmnetReturn::Success
    }

    /// Set the IPv4 subnet. It must overlap 192.168.0.0/16; the stored
    /// address is the first assignable address of the masked subnet.
    #[must_use]
    pub fn set_ipv4_subnet(&mut self, subnet: Ipv4Subnet) -> VmnetReturn {
        if !PRIVATE_RANGE.overlaps(&subnet) {
            tracing::debug!(%subnet, "ipv4 subnet out of range");
            return VmnetReturn::InvalidArgument;
        }
        let stored = Ipv4Subnet {
            address: subnet.first_host(),
            prefix_len: subnet.prefix_len,
        };
        if self
            .dhcp_reservations
            .iter()
            .any(|reservation| !stored.is_assignable(reservation.address))
        {
            return VmnetReturn::InvalidArgument;
        }
        self.ipv4_subnet = Some(stored);
        VmnetReturn::Success
    }

    #[must_use]
    pub fn set_ipv6_prefix(&mut self, prefix: Ipv6Prefix) -> VmnetReturn {
        if prefix.prefix_len == 0 || prefix.prefix_len > 64 {
            return VmnetReturn::InvalidArgument;
        }
        self.ipv6_prefix = Some(prefix);
        VmnetReturn::Success
    }

    #[must_use]
    pub fn set_mtu(&mut self, mtu: u32) -> VmnetReturn {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return VmnetReturn::InvalidArgument;
        }
        self.mtu = Some(mtu);
        VmnetReturn::Success
    }

    pub fn set_nat44(&mut self, enabled: bool) {
        self.nat44 = enabled;
    }

    pub fn set_nat66(&mut self, enabled: bool) {
        self.nat66 = enabled;
    }

    pub fn set_dhcp(&mut self, enabled: bool) {
        self.dhcp = enabled;
    }

    pub fn set_dns_proxy(&mut self, enabled: bool) {
        self.dns_proxy = enabled;
    }

    pub fn set_router_advertisement(&mut self, enabled: bool) {
        self.router_advertisement = enabled;
    }

    /// Pin `address` to `client`. The address must lie in the configured
    /// subnet and each client gets at most one reservation.
    #[must_use]
    pub fn add_dhcp_reservation(&mut self, client: MacAddress, address: Ipv4Addr) -> VmnetReturn {
        if let Some(subnet) = &self.ipv4_subnet {
            if !subnet.is_assignable(address) {
                return VmnetReturn::InvalidArgument;
            }
        } else if !PRIVATE_RANGE.contains(address) {
            return VmnetReturn::InvalidArgument;
        }
        if self
            .dhcp_reservations
            .iter()
            .any(|r| r.client == client || r.address == address)
        {
            return VmnetReturn::InvalidArgument;
        }
        self.dhcp_reservations.push(DhcpReservation { client, address });
        VmnetReturn::Success
    }

    #[must_use]
    pub fn add_port_forwarding_rule(
        &mut self,
        protocol: Protocol,
        family: AddressFamily,
        internal_port: u16,
        external_port: u16,
        internal_address: IpAddr,
    ) -> VmnetReturn {
        let family_matches = matches!(
            (family, internal_address),
            (AddressFamily::Ipv4, IpAddr::V4(_)) | (AddressFamily::Ipv6, IpAddr::V6(_))
        );
        if !family_matches || internal_port == 0 || external_port == 0 {
            return VmnetReturn::InvalidArgument;
        }
        if self
            .port_forwarding_rules
            .iter()
            .any(|rule| rule.protocol == protocol && rule.external_port == external_port)
        {
            return VmnetReturn::InvalidArgument;
        }
        self.port_forwarding_rules.push(PortForwardingRule {
            protocol,
            family,
            internal_port,
            external_port,
            internal_address,
        });
        VmnetReturn::Success
    }

    pub fn external_interface(&self) -> Option<&str> {
        self.external_interface.as_deref()
    }

    pub fn ipv4_subnet(&self) -> Option<Ipv4Subnet> {
        self.ipv4_subnet
    }

    pub fn ipv6_prefix(&self) -> Option<Ipv6Prefix> {
        self.ipv6_prefix
    }

    pub fn mtu(&self) -> Option<u32> {
        self.mtu
    }

    pub fn nat44(&self) -> bool {
        self.nat44
    }

    pub fn nat66(&self) -> bool {
        self.nat66
    }

    pub fn dhcp(&self) -> bool {
        self.dhcp
    }

    pub fn dns_proxy(&self) -> bool {
        self.dns_proxy
    }

    pub fn router_advertisement(&self) -> bool {
        self.router_advertisement
    }

    pub fn dhcp_reservations(&self) -> &[DhcpReservation] {
        &self.dhcp_reservations
    }

    pub fn port_forwarding_rules(&self) -> &[PortForwardingRule] {
        &self.port_forwarding_rules
    }
}
