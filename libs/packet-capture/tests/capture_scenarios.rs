//! End-to-end capture scenarios.

use std::sync::Arc;

use etherparse::PacketBuilder;
use packet_capture::{CaptureConfig, CaptureMode, Sink, SinkResult};
use packet_types::{PacketBuffer, worker};

fn udp_packet(dport: u16, timestamp: u64, payload: &[u8]) -> PacketBuffer {
    let mut bytes = Vec::new();
    PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .udp(3_000, dport)
        .write(&mut bytes, payload)
        .expect("write packet");

    let mut packet = PacketBuffer::from_data(&bytes);
    packet.set_rx_timestamp(timestamp);
    packet
}

fn tcp_packet(timestamp: u64) -> PacketBuffer {
    let mut bytes = Vec::new();
    PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
        .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
        .tcp(3_000, 80, 0, 8192)
        .write(&mut bytes, &[])
        .expect("write packet");

    let mut packet = PacketBuffer::from_data(&bytes);
    packet.set_rx_timestamp(timestamp);
    packet
}

/// A filtered file capture across two workers holds exactly the DNS
/// packets, truncated, and reads back in receive order.
#[test]
fn filtered_dns_capture_across_workers() {
    let dir = tempfile::tempdir().expect("tempdir");

    let sink = Sink::new(
        CaptureConfig {
            id: "cap-dns".to_string(),
            source: "port-0".to_string(),
            mode: CaptureMode::File,
            buffer_wrap: false,
            buffer_size: 1 << 20,
            max_packet_size: 128,
            duration_ms: None,
            filter: Some("udp and port 53".to_string()),
            start_trigger: None,
            stop_trigger: None,
            file_path: Some(dir.path().join("dns.pcapng")),
            keep_file: false,
        },
        &[0, 1],
    )
    .expect("create sink");

    let results = Arc::new(SinkResult::new(&sink).expect("create result"));
    sink.start(results.clone());

    // 10^4 mixed packets split between two workers by timestamp
    // parity; every fourth packet is DNS.
    let payload = vec![0u8; 200];
    let mut dns_count = 0u64;
    for worker_id in 0..2usize {
        worker::set_id(worker_id);
        let batch: Vec<PacketBuffer> = (0..5_000u64)
            .map(|idx| {
                let timestamp = 1_000_000 + idx * 2 + worker_id as u64;
                if idx % 4 == 0 {
                    dns_count += 1;
                    udp_packet(53, timestamp, &payload)
                } else if idx % 4 == 1 {
                    udp_packet(4_000, timestamp, &payload)
                } else {
                    tcp_packet(timestamp)
                }
            })
            .collect();

        for chunk in batch.iter().collect::<Vec<_>>().chunks(32) {
            sink.push(chunk);
        }
    }

    assert_eq!(results.stats().packets, dns_count);

    let packets = results
        .with_reader(|reader| {
            let mut packets = Vec::new();
            loop {
                let read = reader.read_packets(&mut packets, 64);
                if read == 0 && reader.is_done() {
                    break;
                }
            }
            packets
        })
        .expect("read capture");

    assert_eq!(packets.len(), dns_count as usize);

    let mut previous = 0;
    for capture in &packets {
        // Only DNS packets, truncated to the configured bound.
        assert_eq!(capture.header.captured_len, 128);
        assert_eq!(capture.header.packet_len, 242);
        let dport = u16::from_be_bytes([capture.data[36], capture.data[37]]);
        assert_eq!(dport, 53);

        // Global receive order across both workers.
        assert!(capture.header.timestamp >= previous);
        previous = capture.header.timestamp;
    }

    sink.stop();
}

/// Wrapping captures keep the most recent packets when the region
/// overflows.
#[test]
fn wrapping_capture_retains_recent_packets() {
    let sink = Sink::new(
        CaptureConfig {
            id: "cap-wrap".to_string(),
            source: "port-0".to_string(),
            mode: CaptureMode::Buffer,
            buffer_wrap: true,
            buffer_size: 1 << 16,
            max_packet_size: 1500,
            duration_ms: None,
            filter: None,
            start_trigger: None,
            stop_trigger: None,
            file_path: None,
            keep_file: false,
        },
        &[0],
    )
    .expect("create sink");
    worker::set_id(0);

    let results = Arc::new(SinkResult::new(&sink).expect("create result"));
    sink.start(results.clone());

    let packets: Vec<PacketBuffer> = (0..1000u64)
        .map(|idx| {
            let mut packet = PacketBuffer::from_data(&[0xabu8; 256]);
            packet.set_rx_timestamp(idx);
            packet
        })
        .collect();
    for chunk in packets.iter().collect::<Vec<_>>().chunks(32) {
        sink.push(chunk);
    }

    // Capacity in whole records: header plus padded data.
    let record = 24 + 256;
    let expected = (1 << 16) / record;
    assert_eq!(results.stats().packets, expected as u64);

    let read = results
        .with_reader(|reader| {
            let mut read = Vec::new();
            loop {
                let count = reader.read_packets(&mut read, 64);
                if count == 0 && reader.is_done() {
                    break;
                }
            }
            read
        })
        .expect("read capture");

    assert_eq!(read.len(), expected);
    // Oldest packets were reclaimed whole; the rest are in write order.
    assert_eq!(
        read.last().expect("resident packets").header.timestamp,
        999
    );
    let first = read[0].header.timestamp;
    for (idx, capture) in read.iter().enumerate() {
        assert_eq!(capture.header.timestamp, first + idx as u64);
    }

    sink.stop();
}
