use crate::{HeaderLengths, PacketTypeFlags};

/// Spirent-style signature metadata decoded from (rx) or destined for
/// (tx) the tail of a test packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub stream_id: u32,
    pub sequence_number: u32,
    pub tx_timestamp: u64,
    pub flags: u32,
}

/// A packet buffer as handed around the driver boundary.
///
/// The real driver backs this with an mbuf; here the storage is owned so
/// the cores and their tests can run without any I/O plumbing. Metadata
/// fields mirror the offloads the driver populates on receive
/// (timestamps, RSS hash, decoded packet type, signature, error flags)
/// and consumes on transmit (offload descriptor, signature request).
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    data: Vec<u8>,
    length: u16,
    rx_timestamp: u64,
    rss_hash: u32,
    packet_type: PacketTypeFlags,
    signature: Option<Signature>,
    prbs_bit_errors: Option<u32>,
    ipv4_checksum_error: bool,
    tcp_checksum_error: bool,
    udp_checksum_error: bool,
    tx_sink: bool,
    tx_offload: Option<(HeaderLengths, PacketTypeFlags)>,
}

impl PacketBuffer {
    pub fn new(max_length: usize) -> Self {
        Self {
            data: vec![0; max_length],
            length: 0,
            rx_timestamp: 0,
            rss_hash: 0,
            packet_type: PacketTypeFlags::default(),
            signature: None,
            prbs_bit_errors: None,
            ipv4_checksum_error: false,
            tcp_checksum_error: false,
            udp_checksum_error: false,
            tx_sink: false,
            tx_offload: None,
        }
    }

    /// Builds a received packet from raw bytes plus driver metadata.
    pub fn from_data(data: &[u8]) -> Self {
        let mut buffer = Self::new(data.len().max(64));
        buffer.data[..data.len()].copy_from_slice(data);
        buffer.length = data.len() as u16;
        buffer
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn set_length(&mut self, length: u16) {
        debug_assert!(length as usize <= self.data.len());
        self.length = length;
    }

    pub fn max_length(&self) -> u16 {
        self.data.len() as u16
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn rx_timestamp(&self) -> u64 {
        self.rx_timestamp
    }

    pub fn set_rx_timestamp(&mut self, nanos: u64) {
        self.rx_timestamp = nanos;
    }

    pub fn rss_hash(&self) -> u32 {
        self.rss_hash
    }

    pub fn set_rss_hash(&mut self, hash: u32) {
        self.rss_hash = hash;
    }

    pub fn packet_type_flags(&self) -> PacketTypeFlags {
        self.packet_type
    }

    pub fn set_packet_type_flags(&mut self, flags: PacketTypeFlags) {
        self.packet_type = flags;
    }

    pub fn signature_stream_id(&self) -> Option<u32> {
        self.signature.map(|sig| sig.stream_id)
    }

    pub fn signature_sequence_number(&self) -> Option<u32> {
        self.signature.map(|sig| sig.sequence_number)
    }

    pub fn signature_tx_timestamp(&self) -> Option<u64> {
        self.signature.map(|sig| sig.tx_timestamp)
    }

    /// Requests (tx) or records (rx) a signature on this packet.
    pub fn set_signature(&mut self, stream_id: u32, sequence_number: u32, flags: u32) {
        let tx_timestamp = self.signature.map(|sig| sig.tx_timestamp).unwrap_or(0);
        self.signature = Some(Signature {
            stream_id,
            sequence_number,
            tx_timestamp,
            flags,
        });
    }

    pub fn set_signature_tx_timestamp(&mut self, nanos: u64) {
        let mut sig = self.signature.unwrap_or_default();
        sig.tx_timestamp = nanos;
        self.signature = Some(sig);
    }

    pub fn clear_signature(&mut self) {
        self.signature = None;
    }

    pub fn prbs_bit_errors(&self) -> Option<u32> {
        self.prbs_bit_errors
    }

    pub fn set_prbs_bit_errors(&mut self, errors: u32) {
        self.prbs_bit_errors = Some(errors);
    }

    pub fn ipv4_checksum_error(&self) -> bool {
        self.ipv4_checksum_error
    }

    pub fn set_ipv4_checksum_error(&mut self, error: bool) {
        self.ipv4_checksum_error = error;
    }

    pub fn tcp_checksum_error(&self) -> bool {
        self.tcp_checksum_error
    }

    pub fn set_tcp_checksum_error(&mut self, error: bool) {
        self.tcp_checksum_error = error;
    }

    pub fn udp_checksum_error(&self) -> bool {
        self.udp_checksum_error
    }

    pub fn set_udp_checksum_error(&mut self, error: bool) {
        self.udp_checksum_error = error;
    }

    /// Direction flag: `false` for received packets, `true` for packets
    /// observed on the transmit side.
    pub fn tx_sink(&self) -> bool {
        self.tx_sink
    }

    pub fn set_tx_sink(&mut self, tx: bool) {
        self.tx_sink = tx;
    }

    pub fn tx_offload(&mut self, lengths: HeaderLengths, flags: PacketTypeFlags) {
        self.tx_offload = Some((lengths, flags));
        self.packet_type = flags;
    }

    pub fn tx_offload_request(&self) -> Option<(HeaderLengths, PacketTypeFlags)> {
        self.tx_offload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_accessors() {
        let mut buffer = PacketBuffer::new(128);
        assert_eq!(buffer.signature_stream_id(), None);

        buffer.set_signature(7, 42, 0);
        buffer.set_signature_tx_timestamp(1_000);

        assert_eq!(buffer.signature_stream_id(), Some(7));
        assert_eq!(buffer.signature_sequence_number(), Some(42));
        assert_eq!(buffer.signature_tx_timestamp(), Some(1_000));
    }

    #[test]
    fn data_is_bounded_by_length() {
        let mut buffer = PacketBuffer::new(128);
        buffer.data_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buffer.set_length(4);

        assert_eq!(buffer.data(), &[1, 2, 3, 4]);
        assert_eq!(buffer.max_length(), 128);
    }
}
