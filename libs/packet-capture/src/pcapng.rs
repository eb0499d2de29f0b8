//! PCAPNG block codec.
//!
//! Captures are exchanged as PCAPNG: one Section Header Block, one
//! Interface Description Block (Ethernet, nanosecond timestamps), then
//! an Enhanced Packet Block per packet. Every block is padded to a four
//! byte multiple and carries its total length at both ends.

use std::io::{self, Read, Write};

pub const BLOCK_TYPE_SECTION: u32 = 0x0A0D_0D0D;
pub const BLOCK_TYPE_INTERFACE: u32 = 0x0000_0001;
pub const BLOCK_TYPE_ENHANCED_PACKET: u32 = 0x0000_0006;

pub const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
pub const SECTION_LENGTH_UNSPECIFIED: u64 = u64::MAX;

pub const LINK_TYPE_ETHERNET: u16 = 1;
pub const SNAP_LENGTH: u32 = 16384;

const OPTION_END: u16 = 0;
const OPTION_IF_TSRESOL: u16 = 9;
const OPTION_EPB_FLAGS: u16 = 2;

/// if_tsresol power-of-ten exponent for nanoseconds.
const TSRESOL_NANOSECONDS: u8 = 9;

/// Direction bits of the epb_flags option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Unknown,
    Inbound,
    Outbound,
}

impl PacketDirection {
    fn to_flags(self) -> u32 {
        match self {
            PacketDirection::Unknown => 0,
            PacketDirection::Inbound => 0x1,
            PacketDirection::Outbound => 0x2,
        }
    }

    fn from_flags(flags: u32) -> Self {
        match flags & 0x3 {
            0x1 => PacketDirection::Inbound,
            0x2 => PacketDirection::Outbound,
            _ => PacketDirection::Unknown,
        }
    }
}

pub const fn pad_block_length(length: u32) -> u32 {
    (length + 3) & !0x03
}

/// An Enhanced Packet Block, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedPacket {
    pub timestamp: u64,
    pub captured_len: u32,
    pub packet_len: u32,
    pub direction: PacketDirection,
    pub data: Vec<u8>,
}

fn write_all(out: &mut impl Write, chunks: &[&[u8]]) -> io::Result<()> {
    for chunk in chunks {
        out.write_all(chunk)?;
    }
    Ok(())
}

/// Writes the Section Header Block.
pub fn write_section_header(out: &mut impl Write) -> io::Result<()> {
    // type + total length + magic + version + section length + trailing
    // total length.
    let block_length: u32 = 4 + 4 + 4 + 4 + 8 + 4;

    write_all(
        out,
        &[
            &BLOCK_TYPE_SECTION.to_le_bytes(),
            &block_length.to_le_bytes(),
            &BYTE_ORDER_MAGIC.to_le_bytes(),
            &1u16.to_le_bytes(), // major
            &0u16.to_le_bytes(), // minor
            &SECTION_LENGTH_UNSPECIFIED.to_le_bytes(),
            &block_length.to_le_bytes(),
        ],
    )
}

/// Writes the Interface Description Block: Ethernet link type and
/// nanosecond timestamp resolution.
pub fn write_interface_description(out: &mut impl Write) -> io::Result<()> {
    // type + total length + link type/reserved + snap length
    // + if_tsresol option (4 header + 1 value + 3 pad)
    // + opt_end (4) + trailing total length.
    let block_length: u32 = 4 + 4 + 4 + 4 + 8 + 4 + 4;

    write_all(
        out,
        &[
            &BLOCK_TYPE_INTERFACE.to_le_bytes(),
            &block_length.to_le_bytes(),
            &LINK_TYPE_ETHERNET.to_le_bytes(),
            &0u16.to_le_bytes(), // reserved
            &SNAP_LENGTH.to_le_bytes(),
            &OPTION_IF_TSRESOL.to_le_bytes(),
            &1u16.to_le_bytes(),
            &[TSRESOL_NANOSECONDS, 0, 0, 0],
            &OPTION_END.to_le_bytes(),
            &0u16.to_le_bytes(),
            &block_length.to_le_bytes(),
        ],
    )
}

/// Writes one Enhanced Packet Block.
pub fn write_enhanced_packet(
    out: &mut impl Write,
    timestamp: u64,
    packet_len: u32,
    direction: PacketDirection,
    data: &[u8],
) -> io::Result<()> {
    let captured_len = data.len() as u32;
    let pad_len = pad_block_length(captured_len) - captured_len;

    // type + total length + interface id + timestamp + lengths + data
    // + pad + flags option + opt_end + trailing total length.
    let block_length: u32 =
        4 + 4 + 4 + 8 + 4 + 4 + captured_len + pad_len + 8 + 4 + 4;

    write_all(
        out,
        &[
            &BLOCK_TYPE_ENHANCED_PACKET.to_le_bytes(),
            &block_length.to_le_bytes(),
            &0u32.to_le_bytes(), // interface id
            &((timestamp >> 32) as u32).to_le_bytes(),
            &(timestamp as u32).to_le_bytes(),
            &captured_len.to_le_bytes(),
            &packet_len.to_le_bytes(),
            data,
            &[0u8; 4][..pad_len as usize],
            &OPTION_EPB_FLAGS.to_le_bytes(),
            &4u16.to_le_bytes(),
            &direction.to_flags().to_le_bytes(),
            &OPTION_END.to_le_bytes(),
            &0u16.to_le_bytes(),
            &block_length.to_le_bytes(),
        ],
    )
}

fn read_exact_or_eof(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(true)
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Reads and validates the section header and interface description;
/// positions the stream at the first packet block.
pub fn read_file_header(input: &mut impl Read) -> io::Result<()> {
    let (block_type, body) = read_block(input)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing section header"))?;
    if block_type != BLOCK_TYPE_SECTION || read_u32(&body, 0) != BYTE_ORDER_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unrecognized PCAPNG section",
        ));
    }

    let (block_type, body) = read_block(input)?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "missing interface description")
    })?;
    if block_type != BLOCK_TYPE_INTERFACE || read_u16(&body, 0) != LINK_TYPE_ETHERNET {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported interface description",
        ));
    }

    Ok(())
}

/// Reads one block; returns `(type, body)` where the body excludes the
/// framing (type and both total lengths). `None` at end of stream.
fn read_block(input: &mut impl Read) -> io::Result<Option<(u32, Vec<u8>)>> {
    let mut framing = [0u8; 8];
    if !read_exact_or_eof(input, &mut framing)? {
        return Ok(None);
    }

    let block_type = read_u32(&framing, 0);
    let total_length = read_u32(&framing, 4);
    if total_length < 12 || total_length % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad PCAPNG block length",
        ));
    }

    let mut body = vec![0u8; total_length as usize - 12];
    if !read_exact_or_eof(input, &mut body)? {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }

    let mut trailer = [0u8; 4];
    if !read_exact_or_eof(input, &mut trailer)? {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    if read_u32(&trailer, 0) != total_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "mismatched PCAPNG block trailer",
        ));
    }

    Ok(Some((block_type, body)))
}

/// Reads the next Enhanced Packet Block, skipping unrelated blocks.
/// `max_packet_size` truncates the returned data.
pub fn read_enhanced_packet(
    input: &mut impl Read,
    max_packet_size: Option<u32>,
) -> io::Result<Option<EnhancedPacket>> {
    loop {
        let Some((block_type, body)) = read_block(input)? else {
            return Ok(None);
        };
        if block_type != BLOCK_TYPE_ENHANCED_PACKET {
            continue;
        }
        if body.len() < 20 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short enhanced packet block",
            ));
        }

        let timestamp = ((read_u32(&body, 4) as u64) << 32) | read_u32(&body, 8) as u64;
        let mut captured_len = read_u32(&body, 12);
        let packet_len = read_u32(&body, 16);

        let data_start = 20usize;
        let available = body.len() - data_start;
        if captured_len as usize > available {
            tracing::error!(captured_len, available, "PCAPNG captured length too large");
            captured_len = available as u32;
        }

        // Options follow the padded packet data.
        let mut direction = PacketDirection::Unknown;
        let mut cursor = data_start + pad_block_length(captured_len) as usize;
        while cursor + 4 <= body.len() {
            let code = read_u16(&body, cursor);
            let length = read_u16(&body, cursor + 2) as usize;
            if code == OPTION_END {
                break;
            }
            if code == OPTION_EPB_FLAGS && length == 4 && cursor + 8 <= body.len() {
                direction = PacketDirection::from_flags(read_u32(&body, cursor + 4));
            }
            cursor += 4 + pad_block_length(length as u32) as usize;
        }

        let keep = max_packet_size
            .map(|max| captured_len.min(max))
            .unwrap_or(captured_len) as usize;
        let data = body[data_start..data_start + keep].to_vec();

        return Ok(Some(EnhancedPacket {
            timestamp,
            captured_len: keep as u32,
            packet_len,
            direction,
            data,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn file_header_round_trips() {
        let mut bytes = Vec::new();
        write_section_header(&mut bytes).unwrap();
        write_interface_description(&mut bytes).unwrap();

        read_file_header(&mut Cursor::new(bytes)).unwrap();
    }

    #[test]
    fn enhanced_packet_round_trips() {
        let mut bytes = Vec::new();
        write_section_header(&mut bytes).unwrap();
        write_interface_description(&mut bytes).unwrap();

        let payload: Vec<u8> = (0..61).collect();
        write_enhanced_packet(
            &mut bytes,
            0x0102_0304_0506_0708,
            1500,
            PacketDirection::Outbound,
            &payload,
        )
        .unwrap();

        let mut cursor = Cursor::new(bytes);
        read_file_header(&mut cursor).unwrap();

        let packet = read_enhanced_packet(&mut cursor, None).unwrap().unwrap();
        assert_eq!(packet.timestamp, 0x0102_0304_0506_0708);
        assert_eq!(packet.captured_len, 61);
        assert_eq!(packet.packet_len, 1500);
        assert_eq!(packet.direction, PacketDirection::Outbound);
        assert_eq!(packet.data, payload);

        assert!(read_enhanced_packet(&mut cursor, None).unwrap().is_none());
    }

    #[test]
    fn blocks_are_four_byte_aligned() {
        for payload_len in [0usize, 1, 2, 3, 4, 61] {
            let mut bytes = Vec::new();
            write_enhanced_packet(
                &mut bytes,
                0,
                payload_len as u32,
                PacketDirection::Inbound,
                &vec![0u8; payload_len],
            )
            .unwrap();

            assert_eq!(bytes.len() % 4, 0);
            // Leading and trailing total lengths agree.
            let total = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
            let trailer =
                u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
            assert_eq!(total, trailer);
            assert_eq!(total as usize, bytes.len());
        }
    }

    #[test]
    fn reader_truncates_to_max_packet_size() {
        let mut bytes = Vec::new();
        write_enhanced_packet(&mut bytes, 0, 1000, PacketDirection::Inbound, &[7u8; 1000])
            .unwrap();

        let packet = read_enhanced_packet(&mut Cursor::new(bytes), Some(128))
            .unwrap()
            .unwrap();
        assert_eq!(packet.captured_len, 128);
        assert_eq!(packet.data.len(), 128);
        assert_eq!(packet.packet_len, 1000);
    }
}
