//! Read-only descriptors for the network interfaces datagrams arrive on
//!
//! The transport collaborator owns the actual sockets and multicast group
//! membership; the packet core only consults these descriptors to scope
//! published records and to pick the destination of a multicast reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde_derive::{Deserialize, Serialize};

use crate::mdns::protocol::MDNS_PORT;

/// The link-local mDNS group for IPv4.
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The link-local mDNS group for IPv6.
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFB);

/// Transport and address-family variant of one interface socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketKind {
    MulticastV4,
    UnicastV4,
    MulticastV6,
    UnicastV6,
}

/// An IPv4 address with its subnet mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
}

/// One network interface as seen by the packet core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub ifindex: u32,
    pub kind: SocketKind,
    pub v4_addrs: Vec<Ipv4Net>,
    pub v6_addrs: Vec<Ipv6Addr>,
}

impl Interface {
    pub fn is_multicast(&self) -> bool {
        matches!(self.kind, SocketKind::MulticastV4 | SocketKind::MulticastV6)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.kind, SocketKind::MulticastV6 | SocketKind::UnicastV6)
    }

    /// The group address replies are multicast to on this interface.
    pub fn multicast_group(&self) -> SocketAddr {
        let addr: IpAddr = if self.is_ipv6() {
            MDNS_GROUP_V6.into()
        } else {
            MDNS_GROUP_V4.into()
        };

        SocketAddr::new(addr, MDNS_PORT)
    }
}
