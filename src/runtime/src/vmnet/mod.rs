//! vmnet: host networks and the batched packet datapath.

pub mod config;
mod forward;
mod interface;
mod network;
mod packet;
mod stats;
mod status;

pub use config::{
    AddressFamily, DhcpReservation, Ipv4Subnet, Ipv6Prefix, Mode, NetworkConfiguration,
    PortForwardingRule, Protocol, MAX_MTU, MIN_MTU,
};
pub use forward::{datagram_pair, forward_datagram, forward_stream};
pub use interface::{Interface, InterfaceDescriptor, InterfaceParameters, InterfaceTarget};
pub use network::{Network, NetworkLease};
pub use packet::PacketBuffer;
pub use stats::DatapathStats;
pub use status::VmnetReturn;
