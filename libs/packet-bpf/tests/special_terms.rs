//! Semantics of the metadata ("special") filter terms and their
//! combinations with byte predicates.

use etherparse::PacketBuilder;
use packet_bpf::{Bpf, FilterFlags};
use packet_types::PacketBuffer;

fn plain_packet() -> PacketBuffer {
    let mut bytes = Vec::new();
    PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(1000, 2000)
        .write(&mut bytes, &[0u8; 32])
        .expect("write packet");
    PacketBuffer::from_data(&bytes)
}

fn signed(stream_id: u32, prbs_errors: Option<u32>) -> PacketBuffer {
    let mut packet = plain_packet();
    packet.set_signature(stream_id, 0, 0);
    if let Some(errors) = prbs_errors {
        packet.set_prbs_bit_errors(errors);
    }
    packet
}

fn matches(filter: &Bpf, packet: &PacketBuffer) -> bool {
    let mut results = [0u64; 1];
    filter.exec_burst(&[packet], &mut results);
    results[0] != 0
}

#[test]
fn valid_chksum_matches_any_checksum_error() {
    let filter = Bpf::parse("valid chksum").expect("compile");

    let clean = plain_packet();
    assert!(!matches(&filter, &clean));

    for setter in [
        PacketBuffer::set_ipv4_checksum_error,
        PacketBuffer::set_tcp_checksum_error,
        PacketBuffer::set_udp_checksum_error,
    ] {
        let mut packet = plain_packet();
        setter(&mut packet, true);
        assert!(matches(&filter, &packet));
    }
}

#[test]
fn valid_prbs_requires_signature_and_errors() {
    let filter = Bpf::parse("valid prbs").expect("compile");

    assert!(!matches(&filter, &plain_packet()));
    assert!(!matches(&filter, &signed(1, None)));
    assert!(!matches(&filter, &signed(1, Some(0))));
    assert!(matches(&filter, &signed(1, Some(3))));

    // PRBS inspection needs the signature decoded first.
    let flags = filter.filter_flags();
    assert!(flags.contains(FilterFlags::SIGNATURE | FilterFlags::PRBS_ERROR));
}

#[test]
fn stream_id_ranges_are_inclusive() {
    let filter = Bpf::parse("signature streamid 0x10-0x20").expect("compile");

    assert!(!matches(&filter, &signed(0x0f, None)));
    assert!(matches(&filter, &signed(0x10, None)));
    assert!(matches(&filter, &signed(0x18, None)));
    assert!(matches(&filter, &signed(0x20, None)));
    assert!(!matches(&filter, &signed(0x21, None)));
    assert!(!matches(&filter, &plain_packet()));
}

#[test]
fn negated_stream_id_term() {
    let filter = Bpf::parse("not signature streamid 5").expect("compile");

    // NOT applies to the whole signature term: non-signature packets
    // match, as do signatures outside the range.
    assert!(matches(&filter, &plain_packet()));
    assert!(matches(&filter, &signed(4, None)));
    assert!(!matches(&filter, &signed(5, None)));
}

#[test]
fn special_disjunction_without_program() {
    let filter = Bpf::parse("signature streamid 1-3 or valid chksum").expect("compile");

    assert!(matches(&filter, &signed(2, None)));
    assert!(!matches(&filter, &signed(9, None)));

    let mut bad_chksum = plain_packet();
    bad_chksum.set_udp_checksum_error(true);
    assert!(matches(&filter, &bad_chksum));

    assert!(!matches(&filter, &plain_packet()));
}

#[test]
fn special_and_byte_predicate() {
    let filter = Bpf::parse("signature and udp and dst port 2000").expect("compile");

    assert!(matches(&filter, &signed(1, None)));
    assert!(!matches(&filter, &plain_packet()));

    // Signed, but to a different destination port.
    let mut bytes = Vec::new();
    PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(1000, 2001)
        .write(&mut bytes, &[0u8; 32])
        .expect("write packet");
    let mut wrong_port = PacketBuffer::from_data(&bytes);
    wrong_port.set_signature(1, 0, 0);
    assert!(!matches(&filter, &wrong_port));
}

#[test]
fn byte_predicate_first_is_reassociated() {
    // The special term sits on the right; the rewrite moves it left and
    // the result behaves identically.
    let a = Bpf::parse("udp and signature").expect("compile");
    let b = Bpf::parse("signature and udp").expect("compile");

    for packet in [plain_packet(), signed(1, None)] {
        assert_eq!(matches(&a, &packet), matches(&b, &packet));
    }
}

#[test]
fn find_next_skips_non_matching_prefix() {
    let filter = Bpf::parse("signature streamid 7").expect("compile");

    let packets = [
        plain_packet(),
        signed(3, None),
        signed(7, None),
        plain_packet(),
        signed(7, None),
    ];
    let refs: Vec<&PacketBuffer> = packets.iter().collect();

    assert_eq!(filter.find_next(&refs, 0), 2);
    assert_eq!(filter.find_next(&refs, 3), 4);
    assert_eq!(filter.find_next(&refs, 5), 5);
}

#[test]
fn trigger_style_filters_compile_without_programs() {
    // The shapes the capture sink uses for triggers resolve to
    // specialized evaluators or compact programs.
    for filter in [
        "signature",
        "not signature",
        "signature streamid 1",
        "valid fcs",
        "valid fcs chksum prbs",
    ] {
        let compiled = Bpf::parse(filter).expect(filter);
        let packets = [plain_packet(), signed(1, Some(1))];
        let refs: Vec<&PacketBuffer> = packets.iter().collect();
        let mut results = [0u64; 2];
        compiled.exec_burst(&refs, &mut results);
    }
}

#[test]
fn sink_feature_requirements_follow_terms() {
    use packet_types::SinkFeatures;

    let filter = Bpf::parse("signature").expect("compile");
    assert!(filter.sink_features().contains(SinkFeatures::SIGNATURE_DECODE));
    assert!(!filter.sink_features().contains(SinkFeatures::PRBS_ERROR_DETECT));

    let filter = Bpf::parse("valid prbs").expect("compile");
    assert!(filter.sink_features().contains(SinkFeatures::SIGNATURE_DECODE));
    assert!(filter.sink_features().contains(SinkFeatures::PRBS_ERROR_DETECT));

    let filter = Bpf::parse("valid chksum").expect("compile");
    assert!(filter.sink_features().contains(SinkFeatures::PACKET_TYPE_DECODE));

    let filter = Bpf::parse("ip src 10.0.0.1").expect("compile");
    assert!(filter.sink_features().is_empty());
}
