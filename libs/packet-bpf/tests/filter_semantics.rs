//! Burst-level semantics of compiled filters against synthesized
//! packets: the three entry points must agree with a straightforward
//! per-packet evaluation of the corpus filters.

use etherparse::PacketBuilder;
use packet_bpf::Bpf;
use packet_types::PacketBuffer;

const MAC_A: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0a];
const MAC_B: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x0b];
const V6_A: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
const V6_B: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];

fn udp4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> PacketBuffer {
    let mut bytes = Vec::new();
    PacketBuilder::ethernet2(MAC_A, MAC_B)
        .ipv4(src, dst, 64)
        .udp(sport, dport)
        .write(&mut bytes, payload)
        .expect("write packet");
    PacketBuffer::from_data(&bytes)
}

fn tcp4(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> PacketBuffer {
    let mut bytes = Vec::new();
    PacketBuilder::ethernet2(MAC_A, MAC_B)
        .ipv4(src, dst, 64)
        .tcp(sport, dport, 0, 8192)
        .write(&mut bytes, &[])
        .expect("write packet");
    PacketBuffer::from_data(&bytes)
}

fn udp6(src: [u8; 16], dst: [u8; 16], sport: u16, dport: u16) -> PacketBuffer {
    let mut bytes = Vec::new();
    PacketBuilder::ethernet2(MAC_A, MAC_B)
        .ipv6(src, dst, 64)
        .udp(sport, dport)
        .write(&mut bytes, &[])
        .expect("write packet");
    PacketBuffer::from_data(&bytes)
}

/// Checks the three burst entry points against per-packet expectations.
fn assert_burst_semantics(filter: &Bpf, packets: &[PacketBuffer], expected: &[bool]) {
    assert_eq!(packets.len(), expected.len());
    let refs: Vec<&PacketBuffer> = packets.iter().collect();

    let mut exec = vec![0u64; refs.len()];
    assert_eq!(filter.exec_burst(&refs, &mut exec), refs.len());
    let exec: Vec<bool> = exec.iter().map(|&r| r != 0).collect();
    assert_eq!(exec, expected, "exec_burst disagrees");

    let mut filtered = vec![refs[0]; refs.len()];
    let kept = filter.filter_burst(&refs, &mut filtered);
    assert_eq!(
        kept,
        expected.iter().filter(|&&e| e).count(),
        "filter_burst count disagrees"
    );
    let mut cursor = filtered[..kept].iter();
    for (packet, &matches) in refs.iter().zip(expected) {
        if matches {
            assert!(std::ptr::eq(*cursor.next().expect("kept packet"), *packet));
        }
    }

    let mut offset = 0;
    for (idx, &matches) in expected.iter().enumerate() {
        if matches {
            assert_eq!(filter.find_next(&refs, offset), idx, "find_next disagrees");
            offset = idx + 1;
        }
    }
    assert_eq!(filter.find_next(&refs, offset), refs.len());
}

fn corpus() -> Vec<PacketBuffer> {
    let mut signed = udp4([10, 0, 0, 1], [10, 0, 0, 2], 1000, 53, b"query");
    signed.set_signature(7, 0, 0);

    vec![
        udp4([10, 0, 0, 1], [10, 0, 0, 2], 1000, 53, b"query"),
        udp4([10, 0, 0, 2], [10, 0, 0, 1], 53, 1000, b"reply"),
        udp4([192, 168, 0, 1], [192, 168, 0, 2], 2000, 2001, &[0u8; 100]),
        tcp4([10, 0, 0, 1], [10, 0, 0, 2], 4000, 80),
        udp6(V6_A, V6_B, 1000, 53),
        udp6(V6_B, V6_A, 53, 1000),
        signed,
    ]
}

#[test]
fn mac_filters() {
    let packets = corpus();

    let filter = Bpf::parse("ether src 02:00:00:00:00:0a").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, true, true, true, true, true, true],
    );

    let filter = Bpf::parse("ether dst 02:00:00:00:00:0a").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, false, false, false, false],
    );
}

#[test]
fn ipv4_filters() {
    let packets = corpus();

    let filter = Bpf::parse("ip src 10.0.0.1").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, false, false, true, false, false, true],
    );

    let filter = Bpf::parse("ip dst 10.0.0.1").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, true, false, false, false, false, false],
    );

    let filter = Bpf::parse("host 192.168.0.2").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, true, false, false, false, false],
    );
}

#[test]
fn ipv6_filters() {
    let packets = corpus();

    let filter = Bpf::parse("ip6 src 2001:db8::1").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, false, true, false, false],
    );

    let filter = Bpf::parse("ip6 dst 2001:db8::1").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, false, false, true, false],
    );
}

#[test]
fn protocol_filters() {
    let packets = corpus();

    let filter = Bpf::parse("udp").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, true, true, false, true, true, true],
    );

    let filter = Bpf::parse("tcp").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, true, false, false, false],
    );
}

#[test]
fn port_filters() {
    let packets = corpus();

    let filter = Bpf::parse("port 53").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, true, false, false, true, true, true],
    );

    let filter = Bpf::parse("dst port 53").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, false, false, false, true, false, true],
    );

    let filter = Bpf::parse("udp portrange 2000-2001").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, true, false, false, false, false],
    );
}

#[test]
fn length_filters() {
    let packets = corpus();
    let lengths: Vec<u16> = packets.iter().map(|p| p.length()).collect();

    let filter = Bpf::parse("len > 100").expect("compile");
    let expected: Vec<bool> = lengths.iter().map(|&len| len as u32 > 100).collect();
    assert_burst_semantics(&filter, &packets, &expected);

    let filter = Bpf::parse("less 60").expect("compile");
    let expected: Vec<bool> = lengths.iter().map(|&len| len as u32 <= 60).collect();
    assert_burst_semantics(&filter, &packets, &expected);
}

#[test]
fn signature_filters() {
    let packets = corpus();

    let filter = Bpf::parse("signature").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, false, false, false, true],
    );

    let filter = Bpf::parse("not signature").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, true, true, true, true, true, false],
    );

    let filter = Bpf::parse("signature streamid 7").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, false, false, false, true],
    );

    let filter = Bpf::parse("signature streamid 8-9").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, false, false, false, false],
    );
}

#[test]
fn mixed_conjunctions() {
    let packets = corpus();

    let filter = Bpf::parse("udp and port 53").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, true, false, false, true, true, true],
    );

    let filter = Bpf::parse("signature and udp").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[false, false, false, false, false, false, true],
    );

    let filter = Bpf::parse("not signature and ip src 10.0.0.1").expect("compile");
    assert_burst_semantics(
        &filter,
        &packets,
        &[true, false, false, true, false, false, false],
    );
}

/// A batch split between signed and unsigned packets with identical L3
/// addressing keeps exactly the unsigned half.
#[test]
fn no_signature_conjunction_batch() {
    let filter = Bpf::parse("not signature and ip src 10.0.0.1 and ip dst 10.0.0.2")
        .expect("compile");

    let mut packets = Vec::new();
    for idx in 0..1000u32 {
        let mut packet = udp4([10, 0, 0, 1], [10, 0, 0, 2], 1000, 2000, &[0u8; 32]);
        if idx >= 500 {
            packet.set_signature(idx, idx, 0);
        }
        packets.push(packet);
    }

    let refs: Vec<&PacketBuffer> = packets.iter().collect();
    let mut filtered = vec![refs[0]; refs.len()];
    let kept = filter.filter_burst(&refs, &mut filtered);

    assert_eq!(kept, 500);
    assert!(
        filtered[..kept]
            .iter()
            .all(|packet| packet.signature_stream_id().is_none())
    );
}

/// De Morgan rewrites preserve semantics across a large random batch.
#[test]
fn de_morgan_preserves_semantics() {
    let filters = [
        ("not (signature or ip src 10.0.0.1)", "not signature and not ip src 10.0.0.1"),
        ("not (signature and udp)", "not signature or not udp"),
    ];

    let mut packets = Vec::new();
    for idx in 0..1000u32 {
        let src = if idx % 3 == 0 {
            [10, 0, 0, 1]
        } else {
            [10, 0, 0, 9]
        };
        let mut packet = if idx % 2 == 0 {
            udp4(src, [10, 0, 0, 2], 1000, 2000, &[0u8; 16])
        } else {
            tcp4(src, [10, 0, 0, 2], 1000, 2000)
        };
        if idx % 5 == 0 {
            packet.set_signature(idx, idx, 0);
        }
        packets.push(packet);
    }
    let refs: Vec<&PacketBuffer> = packets.iter().collect();

    for (original, rewritten) in filters {
        let a = Bpf::parse(original).expect("compile");
        let b = Bpf::parse(rewritten).expect("compile");

        let mut results_a = vec![0u64; refs.len()];
        let mut results_b = vec![0u64; refs.len()];
        a.exec_burst(&refs, &mut results_a);
        b.exec_burst(&refs, &mut results_b);

        assert_eq!(results_a, results_b, "{original} != {rewritten}");
    }
}
