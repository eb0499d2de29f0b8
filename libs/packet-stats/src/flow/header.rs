//! First-packet header capture and the lane-driven header-length
//! walker.

use packet_types::PacketTypeFlags;
use packet_types::packet_type::{Ethernet, Ip, Protocol};

/// Bytes of a flow's first packet retained for reporting.
pub const CAPTURE_LENGTH: usize = 124;

const ETHERNET_LENGTH: u16 = 14;
const VLAN_LENGTH: u16 = 4;
const MPLS_LENGTH: u16 = 4;
const IPV4_LENGTH: u16 = 20;
const IPV6_LENGTH: u16 = 40;
const TCP_LENGTH: u16 = 20;
const UDP_LENGTH: u16 = 8;

/// The decoded type and leading bytes of a flow's first packet.
#[derive(Debug, Clone, Copy)]
pub struct HeaderCapture {
    pub flags: PacketTypeFlags,
    pub length: u8,
    data: [u8; CAPTURE_LENGTH],
}

impl Default for HeaderCapture {
    fn default() -> Self {
        Self {
            flags: PacketTypeFlags::default(),
            length: 0,
            data: [0; CAPTURE_LENGTH],
        }
    }
}

impl HeaderCapture {
    pub fn capture(&mut self, flags: PacketTypeFlags, packet: &[u8]) {
        let length = packet.len().min(CAPTURE_LENGTH);
        self.flags = flags;
        self.length = length as u8;
        self.data[..length].copy_from_slice(&packet[..length]);
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

fn skip(cursor: u16, length: u16, end: u16) -> u16 {
    if cursor + length <= end { cursor + length } else { end }
}

fn skip_layer2(flags: PacketTypeFlags, packet: &[u8], cursor: u16, end: u16) -> u16 {
    match flags.ethernet() {
        Ethernet::Ether => skip(cursor, ETHERNET_LENGTH, end),
        Ethernet::Timesync => skip(cursor, 34, end),
        Ethernet::Arp => skip(cursor, 28, end),
        Ethernet::Vlan => skip(skip(cursor, ETHERNET_LENGTH, end), VLAN_LENGTH, end),
        Ethernet::Qinq => {
            let cursor = skip(cursor, ETHERNET_LENGTH, end);
            skip(skip(cursor, VLAN_LENGTH, end), VLAN_LENGTH, end)
        }
        Ethernet::Pppoe => skip(cursor, 22, end),
        Ethernet::Fcoe => skip(cursor, 36, end),
        Ethernet::Mpls => {
            let mut cursor = skip(cursor, ETHERNET_LENGTH, end);
            while cursor < end {
                let label_start = cursor as usize;
                cursor = skip(cursor, MPLS_LENGTH, end);
                let bottom_of_stack = packet
                    .get(label_start + 2)
                    .is_none_or(|byte| byte & 0x01 != 0);
                if bottom_of_stack {
                    break;
                }
            }
            cursor
        }
        _ => end,
    }
}

fn skip_layer3(flags: PacketTypeFlags, packet: &[u8], cursor: u16, end: u16) -> u16 {
    match flags.ip() {
        Ip::Ipv4 => skip(cursor, IPV4_LENGTH, end),
        Ip::Ipv4Ext | Ip::Ipv4ExtUnknown => {
            let ihl = packet
                .get(cursor as usize)
                .map(|byte| ((byte & 0x0f) as u16) << 2)
                .unwrap_or(IPV4_LENGTH);
            skip(cursor, ihl, end)
        }
        Ip::Ipv6 | Ip::Ipv6Ext | Ip::Ipv6ExtUnknown => skip(cursor, IPV6_LENGTH, end),
        _ => end,
    }
}

fn skip_layer4(flags: PacketTypeFlags, cursor: u16, end: u16) -> u16 {
    match flags.protocol() {
        Protocol::Tcp => skip(cursor, TCP_LENGTH, end),
        Protocol::Udp => skip(cursor, UDP_LENGTH, end),
        Protocol::Sctp => skip(cursor, 12, end),
        Protocol::Icmp | Protocol::Igmp => skip(cursor, 8, end),
        _ => end,
    }
}

/// Total decoded header length of a packet, bounded by its length.
pub fn header_length(flags: PacketTypeFlags, packet: &[u8]) -> u16 {
    let end = packet.len() as u16;
    let cursor = skip_layer2(flags, packet, 0, end);
    let cursor = skip_layer3(flags, packet, cursor, end);
    skip_layer4(flags, cursor, end)
}
