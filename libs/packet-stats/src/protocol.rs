//! Per-lane protocol counters.

use bitflags::bitflags;
use packet_types::PacketTypeFlags;
use packet_types::packet_type::LANE_SIZE;

bitflags! {
    /// Which packet-type lanes a sink tracks.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolFlags: u32 {
        const ETHERNET = 1 << 0;
        const IP = 1 << 1;
        const TRANSPORT = 1 << 2;
        const TUNNEL = 1 << 3;
        const INNER_ETHERNET = 1 << 4;
        const INNER_IP = 1 << 5;
        const INNER_TRANSPORT = 1 << 6;
    }
}

/// One `u64` slot per lane variant for every tracked lane.
#[derive(Debug, Clone)]
pub struct ProtocolCounters {
    mask: ProtocolFlags,
    ethernet: [u64; LANE_SIZE],
    ip: [u64; LANE_SIZE],
    transport: [u64; LANE_SIZE],
    tunnel: [u64; LANE_SIZE],
    inner_ethernet: [u64; LANE_SIZE],
    inner_ip: [u64; LANE_SIZE],
    inner_transport: [u64; LANE_SIZE],
}

impl ProtocolCounters {
    pub fn new(mask: ProtocolFlags) -> Self {
        Self {
            mask,
            ethernet: [0; LANE_SIZE],
            ip: [0; LANE_SIZE],
            transport: [0; LANE_SIZE],
            tunnel: [0; LANE_SIZE],
            inner_ethernet: [0; LANE_SIZE],
            inner_ip: [0; LANE_SIZE],
            inner_transport: [0; LANE_SIZE],
        }
    }

    pub fn mask(&self) -> ProtocolFlags {
        self.mask
    }

    /// Bumps the tracked lane slots for a burst of decoded packet
    /// types.
    pub fn update(&mut self, packet_types: &[PacketTypeFlags]) {
        for &flags in packet_types {
            if self.mask.contains(ProtocolFlags::ETHERNET) {
                self.ethernet[flags.ethernet().index()] += 1;
            }
            if self.mask.contains(ProtocolFlags::IP) {
                self.ip[flags.ip().index()] += 1;
            }
            if self.mask.contains(ProtocolFlags::TRANSPORT) {
                self.transport[flags.protocol().index()] += 1;
            }
            if self.mask.contains(ProtocolFlags::TUNNEL) {
                self.tunnel[flags.tunnel().index()] += 1;
            }
            if self.mask.contains(ProtocolFlags::INNER_ETHERNET) {
                self.inner_ethernet[flags.inner_ethernet().index()] += 1;
            }
            if self.mask.contains(ProtocolFlags::INNER_IP) {
                self.inner_ip[flags.inner_ip().index()] += 1;
            }
            if self.mask.contains(ProtocolFlags::INNER_TRANSPORT) {
                self.inner_transport[flags.inner_protocol().index()] += 1;
            }
        }
    }

    pub fn ethernet(&self, lane: packet_types::packet_type::Ethernet) -> u64 {
        self.ethernet[lane.index()]
    }

    pub fn ip(&self, lane: packet_types::packet_type::Ip) -> u64 {
        self.ip[lane.index()]
    }

    pub fn transport(&self, lane: packet_types::packet_type::Protocol) -> u64 {
        self.transport[lane.index()]
    }

    pub fn tunnel(&self, lane: packet_types::packet_type::Tunnel) -> u64 {
        self.tunnel[lane.index()]
    }

    /// Folds another shard's counters into this one.
    pub fn merge(&mut self, other: &ProtocolCounters) {
        for (a, b) in self.ethernet.iter_mut().zip(&other.ethernet) {
            *a += b;
        }
        for (a, b) in self.ip.iter_mut().zip(&other.ip) {
            *a += b;
        }
        for (a, b) in self.transport.iter_mut().zip(&other.transport) {
            *a += b;
        }
        for (a, b) in self.tunnel.iter_mut().zip(&other.tunnel) {
            *a += b;
        }
        for (a, b) in self.inner_ethernet.iter_mut().zip(&other.inner_ethernet) {
            *a += b;
        }
        for (a, b) in self.inner_ip.iter_mut().zip(&other.inner_ip) {
            *a += b;
        }
        for (a, b) in self.inner_transport.iter_mut().zip(&other.inner_transport) {
            *a += b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet_types::packet_type::{Ethernet, Ip, Protocol};

    #[test]
    fn counts_tracked_lanes_only() {
        let mut counters =
            ProtocolCounters::new(ProtocolFlags::ETHERNET | ProtocolFlags::TRANSPORT);

        let flags = PacketTypeFlags::default()
            .with_ethernet(Ethernet::Ether)
            .with_ip(Ip::Ipv4)
            .with_protocol(Protocol::Udp);
        counters.update(&[flags, flags, flags]);

        assert_eq!(counters.ethernet(Ethernet::Ether), 3);
        assert_eq!(counters.transport(Protocol::Udp), 3);
        assert_eq!(counters.ip(Ip::Ipv4), 0);
    }

    #[test]
    fn merge_sums_shards() {
        let mut a = ProtocolCounters::new(ProtocolFlags::all());
        let mut b = ProtocolCounters::new(ProtocolFlags::all());

        let flags = PacketTypeFlags::default().with_ethernet(Ethernet::Vlan);
        a.update(&[flags]);
        b.update(&[flags, flags]);

        a.merge(&b);
        assert_eq!(a.ethernet(Ethernet::Vlan), 3);
    }
}
