//! Protocol headers a traffic definition can stack, their modifier
//! field catalogs, and the per-protocol contributions to packet-type
//! flags and header lengths.

use etherparse::{
    EtherType, Ethernet2Header, IpNumber, Ipv4Dscp, Ipv4Header, Ipv6FlowLabel, Ipv6Header,
    SingleVlanHeader, TcpHeader, UdpHeader, VlanId, VlanPcp,
};
use packet_types::{HeaderLengths, PacketTypeFlags, packet_type};

use super::modifier::ModifierValue;
use crate::Error;

pub const ETHERTYPE_MPLS: u16 = 0x8847;

/// A 4-byte MPLS label stack entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MplsHeader {
    pub label: u32,
    pub traffic_class: u8,
    pub bottom_of_stack: bool,
    pub ttl: u8,
}

impl Default for MplsHeader {
    fn default() -> Self {
        Self {
            label: 0,
            traffic_class: 0,
            bottom_of_stack: true,
            ttl: 64,
        }
    }
}

impl MplsHeader {
    fn encode(&self) -> [u8; 4] {
        let word = (self.label & 0xf_ffff) << 12
            | ((self.traffic_class & 0x7) as u32) << 9
            | (self.bottom_of_stack as u32) << 8
            | self.ttl as u32;
        word.to_be_bytes()
    }
}

/// Where a custom header's bytes sit in the stack; drives offload
/// header-length accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomLayer {
    Layer2,
    Layer3,
    Layer4,
    Payload,
}

/// An opaque header with byte-offset modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomHeader {
    pub data: Vec<u8>,
    pub layer: CustomLayer,
}

/// One header in a traffic definition.
#[derive(Debug, Clone)]
pub enum Header {
    Ethernet(Ethernet2Header),
    Vlan(SingleVlanHeader),
    Mpls(MplsHeader),
    Ipv4(Ipv4Header),
    Ipv6(Ipv6Header),
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Custom(CustomHeader),
}

/// A modifier-bindable protocol field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    EthernetSource,
    EthernetDestination,
    EthernetEtherType,
    VlanId,
    VlanPriority,
    MplsLabel,
    MplsTtl,
    Ipv4Source,
    Ipv4Destination,
    Ipv4Ttl,
    Ipv4Dscp,
    Ipv6Source,
    Ipv6Destination,
    Ipv6HopLimit,
    Ipv6FlowLabel,
    TcpSourcePort,
    TcpDestinationPort,
    TcpSequence,
    UdpSourcePort,
    UdpDestinationPort,
    /// Byte offset into a custom header.
    CustomOffset(u16),
}

fn field_error(field: Field) -> Error {
    Error::UnsupportedField(format!("{field:?}"))
}

impl Header {
    /// Applies a modifier value to one of this header's fields.
    pub fn apply(&mut self, field: Field, value: &ModifierValue) -> Result<(), Error> {
        match (self, field, value) {
            (Header::Ethernet(header), Field::EthernetSource, ModifierValue::Mac(mac)) => {
                header.source = *mac;
            }
            (Header::Ethernet(header), Field::EthernetDestination, ModifierValue::Mac(mac)) => {
                header.destination = *mac;
            }
            (Header::Ethernet(header), Field::EthernetEtherType, ModifierValue::Field(value)) => {
                header.ether_type = EtherType(*value as u16);
            }
            (Header::Vlan(header), Field::VlanId, ModifierValue::Field(value)) => {
                header.vlan_id = VlanId::try_new(*value as u16)
                    .map_err(|_| Error::BadSequence("vlan id exceeds 12 bits".to_string()))?;
            }
            (Header::Vlan(header), Field::VlanPriority, ModifierValue::Field(value)) => {
                header.pcp = VlanPcp::try_new(*value as u8)
                    .map_err(|_| Error::BadSequence("vlan priority exceeds 3 bits".to_string()))?;
            }
            (Header::Mpls(header), Field::MplsLabel, ModifierValue::Field(value)) => {
                header.label = *value & 0xf_ffff;
            }
            (Header::Mpls(header), Field::MplsTtl, ModifierValue::Field(value)) => {
                header.ttl = *value as u8;
            }
            (Header::Ipv4(header), Field::Ipv4Source, ModifierValue::Ipv4(addr)) => {
                header.source = *addr;
            }
            (Header::Ipv4(header), Field::Ipv4Destination, ModifierValue::Ipv4(addr)) => {
                header.destination = *addr;
            }
            (Header::Ipv4(header), Field::Ipv4Ttl, ModifierValue::Field(value)) => {
                header.time_to_live = *value as u8;
            }
            (Header::Ipv4(header), Field::Ipv4Dscp, ModifierValue::Field(value)) => {
                header.dscp = Ipv4Dscp::try_new(*value as u8)
                    .map_err(|_| Error::BadSequence("dscp exceeds 6 bits".to_string()))?;
            }
            (Header::Ipv6(header), Field::Ipv6Source, ModifierValue::Ipv6(addr)) => {
                header.source = *addr;
            }
            (Header::Ipv6(header), Field::Ipv6Destination, ModifierValue::Ipv6(addr)) => {
                header.destination = *addr;
            }
            (Header::Ipv6(header), Field::Ipv6HopLimit, ModifierValue::Field(value)) => {
                header.hop_limit = *value as u8;
            }
            (Header::Ipv6(header), Field::Ipv6FlowLabel, ModifierValue::Field(value)) => {
                header.flow_label = Ipv6FlowLabel::try_new(*value).map_err(|_| {
                    Error::BadSequence("flow label exceeds 20 bits".to_string())
                })?;
            }
            (Header::Tcp(header), Field::TcpSourcePort, ModifierValue::Field(value)) => {
                header.source_port = *value as u16;
            }
            (Header::Tcp(header), Field::TcpDestinationPort, ModifierValue::Field(value)) => {
                header.destination_port = *value as u16;
            }
            (Header::Tcp(header), Field::TcpSequence, ModifierValue::Field(value)) => {
                header.sequence_number = *value;
            }
            (Header::Udp(header), Field::UdpSourcePort, ModifierValue::Field(value)) => {
                header.source_port = *value as u16;
            }
            (Header::Udp(header), Field::UdpDestinationPort, ModifierValue::Field(value)) => {
                header.destination_port = *value as u16;
            }
            (Header::Custom(header), Field::CustomOffset(offset), value) => {
                let bytes: Vec<u8> = match value {
                    ModifierValue::Field(v) => v.to_be_bytes().to_vec(),
                    ModifierValue::Ipv4(v) => v.to_vec(),
                    ModifierValue::Ipv6(v) => v.to_vec(),
                    ModifierValue::Mac(v) => v.to_vec(),
                };
                let offset = offset as usize;
                if offset + bytes.len() > header.data.len() {
                    return Err(Error::BadSequence(
                        "custom modifier exceeds header length".to_string(),
                    ));
                }
                header.data[offset..offset + bytes.len()].copy_from_slice(&bytes);
            }
            _ => return Err(field_error(field)),
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length() as usize);
        match self {
            Header::Ethernet(header) => header.write(&mut bytes).expect("vec write"),
            Header::Vlan(header) => header.write(&mut bytes).expect("vec write"),
            Header::Mpls(header) => bytes.extend_from_slice(&header.encode()),
            Header::Ipv4(header) => header.write(&mut bytes).expect("vec write"),
            Header::Ipv6(header) => header.write(&mut bytes).expect("vec write"),
            Header::Tcp(header) => header.write(&mut bytes).expect("vec write"),
            Header::Udp(header) => header.write(&mut bytes).expect("vec write"),
            Header::Custom(header) => bytes.extend_from_slice(&header.data),
        }
        bytes
    }

    pub fn length(&self) -> u16 {
        match self {
            Header::Ethernet(_) => 14,
            Header::Vlan(_) => 4,
            Header::Mpls(_) => 4,
            Header::Ipv4(header) => header.header_len() as u16,
            Header::Ipv6(_) => 40,
            Header::Tcp(header) => header.header_len() as u16,
            Header::Udp(_) => 8,
            Header::Custom(header) => header.data.len() as u16,
        }
    }

    /// The ethertype that identifies this header to an encapsulating
    /// Ethernet or VLAN header.
    fn ether_type(&self) -> Option<EtherType> {
        match self {
            Header::Vlan(_) => Some(EtherType::VLAN_TAGGED_FRAME),
            Header::Mpls(_) => Some(EtherType(ETHERTYPE_MPLS)),
            Header::Ipv4(_) => Some(EtherType::IPV4),
            Header::Ipv6(_) => Some(EtherType::IPV6),
            _ => None,
        }
    }

    /// The IP protocol number identifying this header to an
    /// encapsulating IP header.
    fn ip_number(&self) -> Option<IpNumber> {
        match self {
            Header::Tcp(_) => Some(IpNumber::TCP),
            Header::Udp(_) => Some(IpNumber::UDP),
            _ => None,
        }
    }
}

/// Writes `previous`'s next-header field from `next`'s identity.
pub fn update_context(previous: &mut Header, next: &Header) {
    match previous {
        Header::Ethernet(header) => {
            if let Some(ether_type) = next.ether_type() {
                header.ether_type = ether_type;
            }
        }
        Header::Vlan(header) => {
            if let Some(ether_type) = next.ether_type() {
                header.ether_type = ether_type;
            }
        }
        Header::Mpls(header) => {
            // Only the last label of a stack is bottom-of-stack.
            header.bottom_of_stack = !matches!(next, Header::Mpls(_));
        }
        Header::Ipv4(header) => {
            if let Some(protocol) = next.ip_number() {
                header.protocol = protocol;
            }
        }
        Header::Ipv6(header) => {
            if let Some(next_header) = next.ip_number() {
                header.next_header = next_header;
            }
        }
        Header::Tcp(_) | Header::Udp(_) | Header::Custom(_) => {}
    }
}

/// Decoded packet type of an ordered header stack.
pub fn to_packet_type_flags(headers: impl Iterator<Item = impl std::ops::Deref<Target = Header>>)
-> PacketTypeFlags {
    let mut flags = PacketTypeFlags::default();
    let mut vlans = 0;
    let mut has_mpls = false;

    for header in headers {
        match &*header {
            Header::Ethernet(_) => {
                flags = flags.with_ethernet(packet_type::Ethernet::Ether);
            }
            Header::Vlan(_) => vlans += 1,
            Header::Mpls(_) => has_mpls = true,
            Header::Ipv4(_) => flags = flags.with_ip(packet_type::Ip::Ipv4),
            Header::Ipv6(_) => flags = flags.with_ip(packet_type::Ip::Ipv6),
            Header::Tcp(_) => flags = flags.with_protocol(packet_type::Protocol::Tcp),
            Header::Udp(_) => flags = flags.with_protocol(packet_type::Protocol::Udp),
            Header::Custom(_) => {}
        }
    }

    if has_mpls {
        flags = flags.with_ethernet(packet_type::Ethernet::Mpls);
    } else if vlans == 1 {
        flags = flags.with_ethernet(packet_type::Ethernet::Vlan);
    } else if vlans >= 2 {
        flags = flags.with_ethernet(packet_type::Ethernet::Qinq);
    }

    flags
}

/// Per-layer header lengths of an ordered header stack.
pub fn to_header_lengths(headers: impl Iterator<Item = impl std::ops::Deref<Target = Header>>)
-> HeaderLengths {
    let mut lengths = HeaderLengths::default();

    for header in headers {
        match &*header {
            Header::Ethernet(_) | Header::Vlan(_) | Header::Mpls(_) => {
                lengths.layer2 += header.length() as u8;
            }
            Header::Ipv4(_) | Header::Ipv6(_) => lengths.layer3 += header.length(),
            Header::Tcp(_) | Header::Udp(_) => lengths.layer4 += header.length() as u8,
            Header::Custom(custom) => match custom.layer {
                CustomLayer::Layer2 => lengths.layer2 += header.length() as u8,
                CustomLayer::Layer3 => lengths.layer3 += header.length(),
                CustomLayer::Layer4 => lengths.layer4 += header.length() as u8,
                CustomLayer::Payload => {}
            },
        }
    }

    lengths
}
