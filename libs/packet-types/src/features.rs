use bitflags::bitflags;

bitflags! {
    /// Receive-side hardware/driver features a sink may depend on.
    ///
    /// A sink advertises the union of the features its configuration
    /// needs; the I/O layer enables the matching offloads before the
    /// first burst is delivered.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SinkFeatures: u32 {
        const RX_TIMESTAMP = 1 << 0;
        const RSS_HASH = 1 << 1;
        const PACKET_TYPE_DECODE = 1 << 2;
        const SIGNATURE_DECODE = 1 << 3;
        const PRBS_ERROR_DETECT = 1 << 4;
    }
}

bitflags! {
    /// Transmit-side features a source may depend on.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SourceFeatures: u32 {
        const SIGNATURE_ENCODE = 1 << 0;
    }
}
