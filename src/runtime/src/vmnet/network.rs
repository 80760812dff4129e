//! vmnet networks and their serialized form.

use super::config::{Ipv4Subnet, Ipv6Prefix, Mode, NetworkConfiguration};
use crate::host::{Feature, Host};
use crate::ipc::IpcValue;
use uuid::Uuid;
use vmbridge_core::error::{BridgeError, Result};

const KEY_ID: &str = "vmnet.network.id";
const KEY_MODE: &str = "vmnet.network.mode";
const KEY_IPV4_SUBNET: &str = "vmnet.network.ipv4_subnet";
const KEY_IPV6_PREFIX: &str = "vmnet.network.ipv6_prefix";
const KEY_MTU: &str = "vmnet.network.mtu";

/// Values the host assigned when a network was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkLease {
    pub ipv4_subnet: Ipv4Subnet,
    pub ipv6_prefix: Ipv6Prefix,
    pub mtu: u32,
}

/// A vmnet network. Interfaces started against the same network (in this
/// or another process, via its serialization) share one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    id: Uuid,
    mode: Mode,
    lease: NetworkLease,
}

impl Network {
    pub fn new(host: &Host, config: &NetworkConfiguration) -> Result<Self> {
        host.check_available(Feature::VmnetNetwork)?;
        let lease = host.backend().create_network(config)?;
        let network = Self {
            id: Uuid::new_v4(),
            mode: config.mode(),
            lease,
        };
        tracing::info!(
            network = %network.id,
            mode = %network.mode,
            subnet = %lease.ipv4_subnet,
            prefix = %lease.ipv6_prefix,
            mtu = lease.mtu,
            "created vmnet network"
        );
        Ok(network)
    }

    /// Rebuild a network from [`copy_serialization`](Self::copy_serialization) output.
    pub fn new_with_serialization(host: &Host, serialization: &IpcValue) -> Result<Self> {
        host.check_available(Feature::VmnetNetwork)?;
        let id = serialization
            .get_uuid(KEY_ID)?
            .ok_or_else(|| missing(KEY_ID))?;
        let mode = serialization
            .get_string(KEY_MODE)?
            .ok_or_else(|| missing(KEY_MODE))?
            .parse()?;
        let ipv4_subnet = serialization
            .get_string(KEY_IPV4_SUBNET)?
            .ok_or_else(|| missing(KEY_IPV4_SUBNET))?
            .parse()?;
        let ipv6_prefix = serialization
            .get_string(KEY_IPV6_PREFIX)?
            .ok_or_else(|| missing(KEY_IPV6_PREFIX))?
            .parse()?;
        let mtu = serialization
            .get_u64(KEY_MTU)?
            .ok_or_else(|| missing(KEY_MTU))?;
        let mtu = u32::try_from(mtu)
            .map_err(|_| BridgeError::InvalidFormat(format!("network MTU {mtu} out of range")))?;

        Ok(Self {
            id,
            mode,
            lease: NetworkLease {
                ipv4_subnet,
                ipv6_prefix,
                mtu,
            },
        })
    }

    /// Serialized form, suitable for sending to another process.
    pub fn copy_serialization(&self) -> Result<IpcValue> {
        let mut dict = IpcValue::dictionary();
        dict.insert(KEY_ID, self.id)?;
        dict.insert(KEY_MODE, self.mode.as_str())?;
        dict.insert(KEY_IPV4_SUBNET, self.lease.ipv4_subnet.to_string())?;
        dict.insert(KEY_IPV6_PREFIX, self.lease.ipv6_prefix.to_string())?;
        dict.insert(KEY_MTU, u64::from(self.lease.mtu))?;
        Ok(dict)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn ipv4_subnet(&self) -> Ipv4Subnet {
        self.lease.ipv4_subnet
    }

    pub fn ipv6_prefix(&self) -> Ipv6Prefix {
        self.lease.ipv6_prefix
    }

    pub fn mtu(&self) -> u32 {
        self.lease.mtu
    }
}

fn missing(key: &str) -> BridgeError {
    BridgeError::InvalidFormat(format!("network serialization is missing {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedHypervisor;
    use crate::vmnet::VmnetReturn;
    use vmbridge_core::BridgeConfig;

    fn host() -> Host {
        let config = BridgeConfig::default();
        Host::new(SimulatedHypervisor::new(&config.simulator).unwrap(), config)
    }

    #[test]
    fn test_defaults_assigned_by_host() {
        let host = host();
        let config = NetworkConfiguration::new(&host, Mode::Shared).unwrap();
        let network = Network::new(&host, &config).unwrap();
        assert_eq!(network.ipv4_subnet().to_string(), "192.168.64.1/24");
        assert_eq!(network.mtu(), 1500);
        assert_eq!(network.ipv6_prefix().prefix_len(), 64);
    }

    #[test]
    fn test_serialization_round_trip() {
        let host = host();
        let mut config = NetworkConfiguration::new(&host, Mode::Shared).unwrap();
        assert_eq!(
            config.set_ipv4_subnet("192.168.105.0/24".parse().unwrap()),
            VmnetReturn::Success
        );
        assert_eq!(config.set_ipv6_prefix("fd00:1::/64".parse().unwrap()), VmnetReturn::Success);
        assert_eq!(config.set_mtu(9000), VmnetReturn::Success);

        let network = Network::new(&host, &config).unwrap();
        let serialization = network.copy_serialization().unwrap();
        let rebuilt = Network::new_with_serialization(&host, &serialization).unwrap();

        assert_eq!(rebuilt.ipv4_subnet(), network.ipv4_subnet());
        assert_eq!(rebuilt.ipv6_prefix(), network.ipv6_prefix());
        assert_eq!(rebuilt.mtu(), 9000);
        assert_eq!(rebuilt, network);
    }

    #[test]
    fn test_bad_serialization() {
        let host = host();
        assert!(matches!(
            Network::new_with_serialization(&host, &IpcValue::dictionary()),
            Err(BridgeError::InvalidFormat(_))
        ));
        assert!(matches!(
            Network::new_with_serialization(&host, &IpcValue::from("not a dictionary")),
            Err(BridgeError::TypeMismatch { .. })
        ));
    }
}
