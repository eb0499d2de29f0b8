//! Decoded packet-type flags.
//!
//! A 32 bit value partitioned into seven 4 bit lanes, one per protocol
//! layer. Each lane holds an enumeration, not independent bits: AND-ing
//! with the lane mask yields the lane's variant.

macro_rules! lane_enum {
    ($(#[$meta:meta])* $name:ident, $shift:expr, { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value << $shift),+
        }

        impl $name {
            pub const MASK: u32 = 0xf << $shift;

            pub fn from_flags(flags: PacketTypeFlags) -> Self {
                match flags.0 & Self::MASK {
                    $(v if v == $value << $shift => Self::$variant,)+
                    _ => Self::None,
                }
            }

            /// Lane-local index, suitable for counter array indexing.
            pub fn index(self) -> usize {
                ((self as u32) >> $shift) as usize
            }
        }
    };
}

lane_enum!(Ethernet, 0, {
    None = 0x0,
    Ether = 0x1,
    Timesync = 0x2,
    Arp = 0x3,
    Lldp = 0x4,
    Nsh = 0x5,
    Vlan = 0x6,
    Qinq = 0x7,
    Pppoe = 0x8,
    Fcoe = 0x9,
    Mpls = 0xa,
});

lane_enum!(Ip, 4, {
    None = 0x0,
    Ipv4 = 0x1,
    Ipv4Ext = 0x3,
    Ipv6 = 0x4,
    Ipv4ExtUnknown = 0x9,
    Ipv6Ext = 0xc,
    Ipv6ExtUnknown = 0xe,
});

lane_enum!(Protocol, 8, {
    None = 0x0,
    Tcp = 0x1,
    Udp = 0x2,
    Fragment = 0x3,
    Sctp = 0x4,
    Icmp = 0x5,
    NonFragment = 0x6,
    Igmp = 0x7,
});

lane_enum!(Tunnel, 12, {
    None = 0x0,
    Ip = 0x1,
    Gre = 0x2,
    Vxlan = 0x3,
    Nvgre = 0x4,
    Geneve = 0x5,
    Grenat = 0x6,
    Gtpc = 0x7,
    Gtpu = 0x8,
    Esp = 0x9,
    L2tp = 0xa,
    VxlanGpe = 0xb,
    MplsInGre = 0xc,
    MplsInUdp = 0xd,
});

lane_enum!(InnerEthernet, 16, {
    None = 0x0,
    Ether = 0x1,
    Vlan = 0x2,
    Qinq = 0x3,
});

lane_enum!(InnerIp, 20, {
    None = 0x0,
    Ipv4 = 0x1,
    Ipv4Ext = 0x2,
    Ipv6 = 0x3,
    Ipv4ExtUnknown = 0x4,
    Ipv6Ext = 0x5,
    Ipv6ExtUnknown = 0x6,
});

lane_enum!(InnerProtocol, 24, {
    None = 0x0,
    Tcp = 0x1,
    Udp = 0x2,
    Fragment = 0x3,
    Sctp = 0x4,
    Icmp = 0x5,
    NonFragment = 0x6,
});

/// The number of variants a single lane can hold.
pub const LANE_SIZE: usize = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketTypeFlags(pub u32);

impl PacketTypeFlags {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn ethernet(self) -> Ethernet {
        Ethernet::from_flags(self)
    }

    pub fn ip(self) -> Ip {
        Ip::from_flags(self)
    }

    pub fn protocol(self) -> Protocol {
        Protocol::from_flags(self)
    }

    pub fn tunnel(self) -> Tunnel {
        Tunnel::from_flags(self)
    }

    pub fn inner_ethernet(self) -> InnerEthernet {
        InnerEthernet::from_flags(self)
    }

    pub fn inner_ip(self) -> InnerIp {
        InnerIp::from_flags(self)
    }

    pub fn inner_protocol(self) -> InnerProtocol {
        InnerProtocol::from_flags(self)
    }

    pub fn with_ethernet(self, lane: Ethernet) -> Self {
        Self((self.0 & !Ethernet::MASK) | lane as u32)
    }

    pub fn with_ip(self, lane: Ip) -> Self {
        Self((self.0 & !Ip::MASK) | lane as u32)
    }

    pub fn with_protocol(self, lane: Protocol) -> Self {
        Self((self.0 & !Protocol::MASK) | lane as u32)
    }

    pub fn with_tunnel(self, lane: Tunnel) -> Self {
        Self((self.0 & !Tunnel::MASK) | lane as u32)
    }
}

impl std::ops::BitOr for PacketTypeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_are_disjoint() {
        let flags = PacketTypeFlags::default()
            .with_ethernet(Ethernet::Vlan)
            .with_ip(Ip::Ipv6)
            .with_protocol(Protocol::Udp);

        assert_eq!(flags.ethernet(), Ethernet::Vlan);
        assert_eq!(flags.ip(), Ip::Ipv6);
        assert_eq!(flags.protocol(), Protocol::Udp);
        assert_eq!(flags.tunnel(), Tunnel::None);
    }

    #[test]
    fn lane_replacement_preserves_other_lanes() {
        let flags = PacketTypeFlags::default()
            .with_ethernet(Ethernet::Ether)
            .with_ip(Ip::Ipv4);

        let flags = flags.with_ip(Ip::Ipv6);

        assert_eq!(flags.ethernet(), Ethernet::Ether);
        assert_eq!(flags.ip(), Ip::Ipv6);
    }

    #[test]
    fn index_is_lane_local() {
        assert_eq!(Ethernet::Mpls.index(), 0xa);
        assert_eq!(Ip::Ipv6.index(), 0x4);
        assert_eq!(Protocol::Igmp.index(), 0x7);
        assert_eq!(InnerProtocol::Icmp.index(), 0x5);
    }
}
