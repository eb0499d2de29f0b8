//! End-to-end analysis scenarios.

use std::sync::Arc;

use packet_analyzer::{AnalyzerConfig, Sink, SinkResult};
use packet_stats::{FlowCounterFlags, FlowDigestFlags, ProtocolFlags};
use packet_types::packet_type::{Ethernet, Ip, Protocol};
use packet_types::{PacketBuffer, PacketTypeFlags};

fn analyzer(flow_counters: FlowCounterFlags) -> (Sink, Arc<SinkResult>) {
    let sink = Sink::new(
        AnalyzerConfig {
            id: "ana-0".to_string(),
            source: "port-0".to_string(),
            protocol_counters: ProtocolFlags::ETHERNET | ProtocolFlags::IP | ProtocolFlags::TRANSPORT,
            flow_counters,
            flow_digests: FlowDigestFlags::empty(),
            filter: None,
        },
        &[0],
    )
    .expect("create sink");

    let results = Arc::new(SinkResult::new(&sink));
    sink.start(results.clone());
    (sink, results)
}

/// A 100-packet signature stream with known latency jitter resolves to
/// a single in-order flow with the expected latency envelope.
#[test]
fn signature_stream_statistics() {
    let (sink, results) = analyzer(
        FlowCounterFlags::FRAME_COUNT | FlowCounterFlags::LATENCY | FlowCounterFlags::SEQUENCING,
    );

    // tx at 1 ms spacing, rx 100 µs later with a ±5 µs wobble.
    let packets: Vec<PacketBuffer> = (0..100u32)
        .map(|seq| {
            let tx = 1_000_000_000 + seq as u64 * 1_000_000;
            let wobble = (seq as i64 % 11 - 5) * 1_000;
            let rx = (tx as i64 + 100_000 + wobble) as u64;

            let mut packet = PacketBuffer::from_data(&[0u8; 128]);
            packet.set_rss_hash(0x1234);
            packet.set_rx_timestamp(rx);
            packet.set_signature(7, seq, 0);
            packet.set_signature_tx_timestamp(tx);
            packet.set_packet_type_flags(
                PacketTypeFlags::default()
                    .with_ethernet(Ethernet::Ether)
                    .with_ip(Ip::Ipv4)
                    .with_protocol(Protocol::Udp),
            );
            packet
        })
        .collect();

    let refs: Vec<&PacketBuffer> = packets.iter().collect();
    assert_eq!(sink.push(&refs), 100);

    assert_eq!(results.flow_count(), 1);
    let flows = results.flows(0);
    let (key, counters) = &flows[0];

    assert_eq!(key.rss_hash, 0x1234);
    assert_eq!(key.stream_id, Some(7));

    assert_eq!(counters.frames.count, 100);
    assert_eq!(counters.frames.octets, 100 * 128);

    let sequencing = counters.sequencing.as_ref().expect("sequencing configured");
    assert_eq!(sequencing.in_order, 99);
    assert_eq!(sequencing.duplicate + sequencing.late + sequencing.reordered, 0);

    let latency = counters.latency.as_ref().expect("latency configured");
    assert_eq!(latency.summary.min, 95_000);
    assert_eq!(latency.summary.max, 105_000);
    let mean = latency.summary.mean();
    assert!((95_000.0..=105_000.0).contains(&mean));

    let protocols = results.protocols_total();
    assert_eq!(protocols.ethernet(Ethernet::Ether), 100);
    assert_eq!(protocols.transport(Protocol::Udp), 100);

    // Flow packet totals reconcile with the protocol counters.
    let flow_total: u64 = results
        .flows(0)
        .iter()
        .map(|(_, counters)| counters.frames.count)
        .sum();
    assert_eq!(flow_total, protocols.ethernet(Ethernet::Ether));
}

/// Digest configuration pulls in its source counters and produces sane
/// quantiles.
#[test]
fn latency_digest_quantiles() {
    let sink = Sink::new(
        AnalyzerConfig {
            id: "ana-digest".to_string(),
            source: "port-0".to_string(),
            protocol_counters: ProtocolFlags::empty(),
            flow_counters: FlowCounterFlags::FRAME_COUNT,
            flow_digests: FlowDigestFlags::LATENCY | FlowDigestFlags::FRAME_LENGTH,
            filter: None,
        },
        &[0],
    )
    .expect("create sink");
    let results = Arc::new(SinkResult::new(&sink));
    sink.start(results.clone());

    let packets: Vec<PacketBuffer> = (0..200u32)
        .map(|seq| {
            let tx = 1_000_000_000 + seq as u64 * 10_000;
            let mut packet = PacketBuffer::from_data(&vec![0u8; 64 + seq as usize]);
            packet.set_rss_hash(9);
            packet.set_rx_timestamp(tx + 50_000 + (seq as u64 % 10) * 1_000);
            packet.set_signature(3, seq, 0);
            packet.set_signature_tx_timestamp(tx);
            packet
        })
        .collect();
    let refs: Vec<&PacketBuffer> = packets.iter().collect();
    sink.push(&refs);

    let flows = results.flows(0);
    let (_, counters) = &flows[0];

    // The digest request implied the latency counter.
    let latency = counters.latency.as_ref().expect("latency implied by digest");
    assert_eq!(latency.summary.count, 200);

    let digests = counters.digests.as_ref().expect("digests configured");
    let mut latency_digest = digests.latency.expect("latency digest");
    let median = latency_digest.quantile(0.5).expect("median");
    assert!((50_000.0..=59_000.0).contains(&median), "median {median}");
    assert_eq!(latency_digest.min(), Some(50_000.0));
    assert_eq!(latency_digest.max(), Some(59_000.0));

    let mut length_digest = digests.frame_length.expect("frame length digest");
    assert_eq!(length_digest.min(), Some(64.0));
    assert_eq!(length_digest.max(), Some(263.0));
    assert!(length_digest.quantile(0.0).is_some());
}

/// Stopping the sink mid-stream drops subsequent bursts without
/// touching the collected result.
#[test]
fn stop_freezes_results() {
    let (sink, results) = analyzer(FlowCounterFlags::FRAME_COUNT);

    let packets: Vec<PacketBuffer> = (0..10)
        .map(|idx| {
            let mut packet = PacketBuffer::from_data(&[0u8; 64]);
            packet.set_rss_hash(1);
            packet.set_rx_timestamp(idx);
            packet
        })
        .collect();
    let refs: Vec<&PacketBuffer> = packets.iter().collect();

    assert_eq!(sink.push(&refs), 10);
    sink.stop();
    assert_eq!(sink.push(&refs), 0);

    let flows = results.flows(0);
    assert_eq!(flows[0].1.frames.count, 10);
}
