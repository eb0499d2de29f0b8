//! Frozen packet templates.
//!
//! A template is the expansion of an ordered header-config list crossed
//! with a length template. Pseudo-header checksums for UDP/TCP are
//! precomputed into each header instance so runtime emission only folds
//! in the payload-length contribution.

use packet_types::{HeaderLengths, PacketTypeFlags, packet_type};

use super::header::{self, Container, HeaderConfig};
use super::modifier::Mux;
use super::lcm;
use crate::Error;

/// One's complement sum of big-endian 16-bit words; no final fold.
fn sum16(bytes: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold32(mut sum: u32) -> u16 {
    sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    sum as u16
}

fn read_u16_be(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn write_u16_be(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Pseudo-header partial sum with a zero length contribution.
fn pseudoheader_sum(header: &[u8], lengths: HeaderLengths, flags: PacketTypeFlags) -> u32 {
    let ip_offset = lengths.layer2 as usize;
    match flags.ip() {
        packet_type::Ip::Ipv4 => {
            // Source and destination addresses plus the protocol.
            sum16(&header[ip_offset + 12..ip_offset + 20]) + header[ip_offset + 9] as u32
        }
        packet_type::Ip::Ipv6 => {
            sum16(&header[ip_offset + 8..ip_offset + 40]) + header[ip_offset + 6] as u32
        }
        _ => 0,
    }
}

/// Writes the precomputed pseudo-header checksum into a header's
/// UDP/TCP checksum field.
fn set_pseudoheader_checksum(header: &mut [u8], lengths: HeaderLengths, flags: PacketTypeFlags) {
    let l4_offset = lengths.layer2 as usize + lengths.layer3 as usize;
    let checksum = fold32(pseudoheader_sum(header, lengths, flags));

    match flags.protocol() {
        packet_type::Protocol::Udp => write_u16_be(header, l4_offset + 6, checksum),
        packet_type::Protocol::Tcp => write_u16_be(header, l4_offset + 16, checksum),
        _ => {}
    }
}

/// Rewrites the length-dependent fields of an emitted packet: IP total
/// or payload length, UDP length, and the payload-length contribution
/// of the precomputed UDP/TCP checksum.
pub fn update_packet_header_lengths(
    header: &[u8],
    lengths: HeaderLengths,
    flags: PacketTypeFlags,
    pkt_len: u16,
    packet: &mut [u8],
) {
    let l2 = lengths.layer2 as u16;
    let l3 = lengths.layer3;
    let payload_len = pkt_len - l2 - l3;
    let l4_offset = (l2 + l3) as usize;

    match flags.ip() {
        packet_type::Ip::Ipv4 => {
            write_u16_be(packet, l2 as usize + 2, pkt_len - l2);
        }
        packet_type::Ip::Ipv6 => {
            write_u16_be(packet, l2 as usize + 4, payload_len);
        }
        _ => {}
    }

    match flags.protocol() {
        packet_type::Protocol::Udp => {
            write_u16_be(packet, l4_offset + 4, payload_len);
            let checksum =
                fold32(read_u16_be(header, l4_offset + 6) as u32 + payload_len as u32);
            write_u16_be(packet, l4_offset + 6, checksum);
        }
        packet_type::Protocol::Tcp => {
            let checksum =
                fold32(read_u16_be(header, l4_offset + 16) as u32 + payload_len as u32);
            write_u16_be(packet, l4_offset + 16, checksum);
        }
        _ => {}
    }
}

/// A frozen traffic definition: expanded headers crossed with expanded
/// lengths.
#[derive(Debug, Clone)]
pub struct PacketTemplate {
    headers: Container,
    header_lengths: HeaderLengths,
    flags: PacketTypeFlags,
    lengths: Vec<u16>,
}

impl PacketTemplate {
    pub fn new(
        mut configs: Vec<HeaderConfig>,
        mux: Mux,
        lengths: Vec<u16>,
    ) -> Result<Self, Error> {
        if configs.is_empty() {
            return Err(Error::EmptyDefinition);
        }
        if lengths.is_empty() {
            return Err(Error::BadSequence(
                "a definition needs at least one packet length".to_string(),
            ));
        }

        header::update_context_fields(&mut configs);

        let expanded = configs
            .iter()
            .map(header::expand)
            .collect::<Result<Vec<_>, _>>()?;
        let mut headers = header::explode(&expanded, mux);

        let header_lengths = header::to_header_lengths(&configs);
        let flags = header::to_packet_type_flags(&configs);

        headers
            .for_each_mut(|header| set_pseudoheader_checksum(header, header_lengths, flags));

        Ok(Self {
            headers,
            header_lengths,
            flags,
            lengths,
        })
    }

    /// Packets in one template iteration.
    pub fn size(&self) -> usize {
        lcm(self.headers.len(), self.lengths.len())
    }

    /// Distinct header instances, i.e. flows.
    pub fn flow_count(&self) -> usize {
        self.headers.len()
    }

    pub fn header_lengths(&self) -> HeaderLengths {
        self.header_lengths
    }

    pub fn header_flags(&self) -> PacketTypeFlags {
        self.flags
    }

    pub fn max_packet_length(&self) -> u16 {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// `(flow index, header bytes, packet length)` at `idx`, which is
    /// taken modulo the template size.
    pub fn get(&self, idx: usize) -> (usize, &[u8], u16) {
        let flow_idx = idx % self.headers.len();
        (
            flow_idx,
            self.headers.get(flow_idx),
            self.lengths[idx % self.lengths.len()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::modifier::{Modifier, ModifierValue, SequenceModifier};
    use crate::traffic::protocol::{Field, Header};
    use etherparse::{Ethernet2Header, Ipv4Header, TcpHeader, UdpHeader};

    fn udp_stack() -> Vec<HeaderConfig> {
        vec![
            HeaderConfig::plain(Header::Ethernet(Ethernet2Header {
                source: [2, 0, 0, 0, 0, 1],
                destination: [2, 0, 0, 0, 0, 2],
                ..Default::default()
            })),
            HeaderConfig::plain(Header::Ipv4(Ipv4Header {
                source: [10, 0, 0, 1],
                destination: [10, 0, 0, 2],
                time_to_live: 64,
                ..Default::default()
            })),
            HeaderConfig::plain(Header::Udp(UdpHeader {
                source_port: 1000,
                destination_port: 2000,
                ..Default::default()
            })),
        ]
    }

    #[test]
    fn template_freezes_stack_layout() {
        let template = PacketTemplate::new(udp_stack(), Mux::Zip, vec![128]).unwrap();

        assert_eq!(template.size(), 1);
        assert_eq!(template.flow_count(), 1);
        assert_eq!(template.max_packet_length(), 128);
        assert_eq!(template.header_lengths().header_length(), 42);

        let (flow, header, len) = template.get(0);
        assert_eq!(flow, 0);
        assert_eq!(header.len(), 42);
        assert_eq!(len, 128);

        // The context fixup wired up the stack.
        assert_eq!(&header[12..14], &[0x08, 0x00]); // ethertype ipv4
        assert_eq!(header[23], 17); // protocol udp
    }

    #[test]
    fn expansion_size_arithmetic() {
        let mut configs = udp_stack();
        configs[1].modifiers = vec![(
            Field::Ipv4Source,
            Modifier::Sequence(SequenceModifier {
                first: ModifierValue::Ipv4([10, 0, 0, 1]),
                last: None,
                count: 4,
                skip: Vec::new(),
                permute: false,
            }),
        )];
        configs[2].modifiers = vec![(
            Field::UdpSourcePort,
            Modifier::Sequence(SequenceModifier {
                first: ModifierValue::Field(1000),
                last: None,
                count: 6,
                skip: Vec::new(),
                permute: false,
            }),
        )];

        let zip = PacketTemplate::new(configs.clone(), Mux::Zip, vec![128]).unwrap();
        assert_eq!(zip.flow_count(), 12); // lcm(4, 6)

        let cartesian = PacketTemplate::new(configs, Mux::Cartesian, vec![128]).unwrap();
        assert_eq!(cartesian.flow_count(), 24); // 4 * 6

        // Uniqueness of expanded headers.
        let mut headers: Vec<Vec<u8>> = (0..cartesian.flow_count())
            .map(|idx| cartesian.get(idx).1.to_vec())
            .collect();
        headers.sort();
        headers.dedup();
        assert_eq!(headers.len(), 24);
    }

    #[test]
    fn lengths_cross_with_headers() {
        let mut configs = udp_stack();
        configs[1].modifiers = vec![(
            Field::Ipv4Source,
            Modifier::Sequence(SequenceModifier {
                first: ModifierValue::Ipv4([10, 0, 0, 1]),
                last: None,
                count: 2,
                skip: Vec::new(),
                permute: false,
            }),
        )];

        let template = PacketTemplate::new(configs, Mux::Zip, vec![64, 128, 256]).unwrap();
        assert_eq!(template.size(), 6); // lcm(2 headers, 3 lengths)
        assert_eq!(template.flow_count(), 2);
        assert_eq!(template.max_packet_length(), 256);
    }

    #[test]
    fn udp_checksum_fixup_matches_full_computation() {
        let template = PacketTemplate::new(udp_stack(), Mux::Zip, vec![90]).unwrap();
        let (_, header, pkt_len) = template.get(0);

        let mut packet = vec![0u8; pkt_len as usize];
        packet[..header.len()].copy_from_slice(header);
        update_packet_header_lengths(
            header,
            template.header_lengths(),
            template.header_flags(),
            pkt_len,
            &mut packet,
        );

        let payload_len = pkt_len - 42;
        assert_eq!(read_u16_be(&packet, 14 + 2), pkt_len - 14); // ipv4 total
        assert_eq!(read_u16_be(&packet, 34 + 4), payload_len); // udp length

        // The partial checksum equals pseudo-header sum (with the real
        // length) folded once.
        let mut expected = sum16(&packet[14 + 12..14 + 20]); // addresses
        expected += 17; // protocol
        expected += payload_len as u32; // pseudo-header length
        assert_eq!(read_u16_be(&packet, 34 + 6), fold32(expected));
    }

    #[test]
    fn tcp_checksum_gets_pseudoheader_partial(){
        let mut configs = udp_stack();
        configs[2] = HeaderConfig::plain(Header::Tcp(TcpHeader::new(1000, 2000, 1, 8192)));

        let template = PacketTemplate::new(configs, Mux::Zip, vec![128]).unwrap();
        let (_, header, _) = template.get(0);

        // The checksum field holds the folded pseudo-header partial.
        let l4 = 14 + 20;
        let mut expected = sum16(&header[14 + 12..14 + 20]);
        expected += 6; // protocol tcp, set by the context fixup
        assert_eq!(read_u16_be(header, l4 + 16), fold32(expected));
        assert_eq!(header[23], 6);
    }
}
