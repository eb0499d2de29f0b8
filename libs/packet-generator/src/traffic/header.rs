//! Header configurations and their expansion into byte-level
//! containers.

use packet_types::{HeaderLengths, PacketTypeFlags};

use super::modifier::{Modifier, ModifierValue, Mux};
use super::protocol::{self, Field, Header};
use super::lcm;
use crate::Error;

/// One header plus its modifier bindings.
#[derive(Debug, Clone)]
pub struct HeaderConfig {
    pub header: Header,
    pub modifiers: Vec<(Field, Modifier)>,
    pub mux: Mux,
}

impl HeaderConfig {
    pub fn plain(header: Header) -> Self {
        Self {
            header,
            modifiers: Vec::new(),
            mux: Mux::Zip,
        }
    }

    /// Number of distinct header instances this config expands to.
    pub fn count(&self) -> usize {
        match self.modifiers.as_slice() {
            [] => 1,
            [(_, modifier)] => modifier.length(),
            modifiers => match self.mux {
                Mux::Zip => modifiers
                    .iter()
                    .fold(1, |acc, (_, modifier)| lcm(acc, modifier.length())),
                Mux::Cartesian => modifiers
                    .iter()
                    .fold(1, |acc, (_, modifier)| acc * modifier.length()),
            },
        }
    }
}

/// An ordered collection of expanded headers: a flat byte blob plus
/// per-instance lengths.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Container {
    data: Vec<u8>,
    lengths: Vec<u16>,
}

impl Container {
    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.lengths.push(bytes.len() as u16);
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn get(&self, idx: usize) -> &[u8] {
        let offset: usize = self.lengths[..idx].iter().map(|&len| len as usize).sum();
        &self.data[offset..offset + self.lengths[idx] as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        let mut offset = 0;
        self.lengths.iter().map(move |&len| {
            let slice = &self.data[offset..offset + len as usize];
            offset += len as usize;
            slice
        })
    }

    /// Runs `f` over every instance, in order, with mutable access.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut [u8])) {
        let mut offset = 0;
        for &len in &self.lengths {
            f(&mut self.data[offset..offset + len as usize]);
            offset += len as usize;
        }
    }
}

/// Mixed-radix basis for a cartesian enumeration: the first (outermost)
/// element varies slowest.
fn cartesian_basis(lengths: &[usize]) -> Vec<usize> {
    let mut basis = vec![1usize; lengths.len()];
    for idx in (0..lengths.len().saturating_sub(1)).rev() {
        basis[idx] = basis[idx + 1] * lengths[idx + 1];
    }
    basis
}

/// Expands one header config into its instances.
pub fn expand(config: &HeaderConfig) -> Result<Container, Error> {
    let mut container = Container::default();

    if config.modifiers.is_empty() {
        container.push(&config.header.encode());
        return Ok(container);
    }

    let values: Vec<Vec<ModifierValue>> = config
        .modifiers
        .iter()
        .map(|(_, modifier)| modifier.values())
        .collect::<Result<_, _>>()?;
    let lengths: Vec<usize> = values.iter().map(Vec::len).collect();
    let basis = cartesian_basis(&lengths);
    let count = config.count();

    for idx in 0..count {
        let mut header = config.header.clone();
        for (slot, ((field, _), values)) in config.modifiers.iter().zip(&values).enumerate() {
            let value_idx = match config.mux {
                Mux::Zip => idx % lengths[slot],
                Mux::Cartesian => (idx / basis[slot]) % lengths[slot],
            };
            header.apply(*field, &values[value_idx])?;
        }
        container.push(&header.encode());
    }

    Ok(container)
}

/// Combines per-header containers into full packet headers under the
/// packet-level mux.
pub fn explode(containers: &[Container], mux: Mux) -> Container {
    let lengths: Vec<usize> = containers.iter().map(Container::len).collect();
    let count = match mux {
        Mux::Zip => lengths.iter().fold(1, |acc, &len| lcm(acc, len)),
        Mux::Cartesian => lengths.iter().product(),
    };
    let basis = cartesian_basis(&lengths);

    let mut flattened = Container::default();
    let mut buffer = Vec::new();

    for idx in 0..count {
        buffer.clear();
        for (slot, container) in containers.iter().enumerate() {
            let header_idx = match mux {
                Mux::Zip => idx % container.len(),
                Mux::Cartesian => (idx / basis[slot]) % container.len(),
            };
            buffer.extend_from_slice(container.get(header_idx));
        }
        flattened.push(&buffer);
    }

    flattened
}

/// Total packet count of a config list under the packet-level mux.
pub fn count_headers(configs: &[HeaderConfig], mux: Mux) -> usize {
    match mux {
        Mux::Zip => configs.iter().fold(1, |acc, config| lcm(acc, config.count())),
        Mux::Cartesian => configs.iter().map(HeaderConfig::count).product(),
    }
}

/// Walks the configs tail to head, fixing each header's next-header
/// field from its successor.
pub fn update_context_fields(configs: &mut [HeaderConfig]) {
    for idx in (1..configs.len()).rev() {
        let (head, tail) = configs.split_at_mut(idx);
        let previous = &mut head[idx - 1];
        protocol::update_context(&mut previous.header, &tail[0].header);
    }
}

pub fn to_packet_type_flags(configs: &[HeaderConfig]) -> PacketTypeFlags {
    protocol::to_packet_type_flags(configs.iter().map(|config| &config.header))
}

pub fn to_header_lengths(configs: &[HeaderConfig]) -> HeaderLengths {
    protocol::to_header_lengths(configs.iter().map(|config| &config.header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::modifier::SequenceModifier;
    use etherparse::{Ethernet2Header, Ipv4Header, UdpHeader};

    fn mac_modifier(count: u32) -> Modifier {
        Modifier::Sequence(SequenceModifier {
            first: ModifierValue::Mac([2, 0, 0, 0, 0, 1]),
            last: None,
            count,
            skip: Vec::new(),
            permute: false,
        })
    }

    fn ip_modifier(count: u32) -> Modifier {
        Modifier::Sequence(SequenceModifier {
            first: ModifierValue::Ipv4([10, 0, 0, 1]),
            last: None,
            count,
            skip: Vec::new(),
            permute: false,
        })
    }

    #[test]
    fn zip_count_is_lcm() {
        let config = HeaderConfig {
            header: Header::Ethernet(Ethernet2Header::default()),
            modifiers: vec![
                (Field::EthernetSource, mac_modifier(4)),
                (Field::EthernetDestination, mac_modifier(6)),
            ],
            mux: Mux::Zip,
        };

        assert_eq!(config.count(), 12);
        assert_eq!(expand(&config).unwrap().len(), 12);
    }

    #[test]
    fn cartesian_count_is_product() {
        let config = HeaderConfig {
            header: Header::Ipv4(Ipv4Header::default()),
            modifiers: vec![
                (Field::Ipv4Source, ip_modifier(4)),
                (Field::Ipv4Destination, ip_modifier(6)),
            ],
            mux: Mux::Cartesian,
        };

        assert_eq!(config.count(), 24);

        let container = expand(&config).unwrap();
        assert_eq!(container.len(), 24);

        // Every instance is unique.
        let mut seen: Vec<&[u8]> = container.iter().collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn explode_zip_cycles_shorter_containers() {
        let a = expand(&HeaderConfig {
            header: Header::Ethernet(Ethernet2Header::default()),
            modifiers: vec![(Field::EthernetSource, mac_modifier(2))],
            mux: Mux::Zip,
        })
        .unwrap();
        let b = expand(&HeaderConfig {
            header: Header::Ipv4(Ipv4Header::default()),
            modifiers: vec![(Field::Ipv4Source, ip_modifier(3))],
            mux: Mux::Zip,
        })
        .unwrap();

        let exploded = explode(&[a, b], Mux::Zip);
        assert_eq!(exploded.len(), 6);
        assert_eq!(exploded.get(0).len(), 14 + 20);
    }

    #[test]
    fn explode_cartesian_enumerates_product() {
        let a = expand(&HeaderConfig {
            header: Header::Ethernet(Ethernet2Header::default()),
            modifiers: vec![(Field::EthernetSource, mac_modifier(2))],
            mux: Mux::Zip,
        })
        .unwrap();
        let b = expand(&HeaderConfig {
            header: Header::Ipv4(Ipv4Header::default()),
            modifiers: vec![(Field::Ipv4Source, ip_modifier(3))],
            mux: Mux::Zip,
        })
        .unwrap();

        let exploded = explode(&[a, b], Mux::Cartesian);
        assert_eq!(exploded.len(), 6);

        let mut seen: Vec<&[u8]> = exploded.iter().collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn context_update_fixes_whole_stack() {
        let mut configs = vec![
            HeaderConfig::plain(Header::Ethernet(Ethernet2Header::default())),
            HeaderConfig::plain(Header::Ipv4(Ipv4Header::default())),
            HeaderConfig::plain(Header::Udp(UdpHeader::default())),
        ];

        update_context_fields(&mut configs);

        let Header::Ethernet(ethernet) = &configs[0].header else {
            unreachable!()
        };
        assert_eq!(ethernet.ether_type, etherparse::EtherType::IPV4);

        let Header::Ipv4(ipv4) = &configs[1].header else {
            unreachable!()
        };
        assert_eq!(ipv4.protocol, etherparse::IpNumber::UDP);
    }
}
