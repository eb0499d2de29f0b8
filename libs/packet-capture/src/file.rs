//! PCAPNG file capture buffer.
//!
//! Write-through capture into a PCAPNG file; not intended for line-rate
//! capture. The file is deleted when the buffer drops unless it was
//! created with `keep_file`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use packet_types::PacketBuffer;

use crate::buffer::{CaptureBufferStats, CapturePacket, CapturePacketHeader, CaptureReader};
use crate::pcapng::{self, PacketDirection};

pub struct FileBuffer {
    path: PathBuf,
    keep_file: bool,
    writer: BufWriter<File>,
    stats: CaptureBufferStats,
    max_packet_size: u32,
    full: bool,
}

impl FileBuffer {
    pub fn new(path: &Path, keep_file: bool, max_packet_size: u32) -> anyhow::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        pcapng::write_section_header(&mut writer)?;
        pcapng::write_interface_description(&mut writer)?;

        Ok(Self {
            path: path.to_path_buf(),
            keep_file,
            writer,
            stats: CaptureBufferStats::default(),
            max_packet_size,
            full: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_packets(&mut self, packets: &[&PacketBuffer]) -> usize {
        if self.full {
            return 0;
        }

        for (idx, packet) in packets.iter().enumerate() {
            let captured_len = (packet.length() as u32).min(self.max_packet_size) as usize;
            let direction = if packet.tx_sink() {
                PacketDirection::Outbound
            } else {
                PacketDirection::Inbound
            };

            if let Err(error) = pcapng::write_enhanced_packet(
                &mut self.writer,
                packet.rx_timestamp(),
                packet.length() as u32,
                direction,
                &packet.data()[..captured_len],
            ) {
                tracing::error!(%error, "failed writing enhanced packet block");
                self.full = true;
                return idx;
            }

            self.stats.packets += 1;
            self.stats.octets += captured_len as u64;
        }

        packets.len()
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn stats(&self) -> CaptureBufferStats {
        self.stats
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn reader(&mut self) -> anyhow::Result<FileReader> {
        self.flush()?;

        let mut file = BufReader::new(File::open(&self.path)?);
        pcapng::read_file_header(&mut file)?;

        Ok(FileReader {
            file,
            stats: self.stats,
            max_packet_size: self.max_packet_size,
            eof: false,
        })
    }
}

impl Drop for FileBuffer {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        if !self.keep_file && self.path.exists() {
            if let Err(error) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), %error, "failed to remove capture file");
            }
        }
    }
}

pub struct FileReader {
    file: BufReader<File>,
    stats: CaptureBufferStats,
    max_packet_size: u32,
    eof: bool,
}

impl CaptureReader for FileReader {
    fn is_done(&self) -> bool {
        self.eof
    }

    fn read_packets(&mut self, out: &mut Vec<CapturePacket>, max: usize) -> usize {
        let mut count = 0;
        while count < max && !self.eof {
            match pcapng::read_enhanced_packet(&mut self.file, Some(self.max_packet_size)) {
                Ok(Some(packet)) => {
                    let header = CapturePacketHeader {
                        timestamp: packet.timestamp,
                        captured_len: packet.captured_len,
                        packet_len: packet.packet_len,
                        flags: 0,
                        dir: match packet.direction {
                            PacketDirection::Outbound => 2,
                            _ => 1,
                        },
                    };
                    out.push(CapturePacket {
                        header,
                        data: packet.data,
                    });
                    count += 1;
                }
                Ok(None) => self.eof = true,
                Err(error) => {
                    tracing::error!(%error, "failed reading enhanced packet block");
                    self.eof = true;
                }
            }
        }
        count
    }

    fn stats(&self) -> CaptureBufferStats {
        self.stats
    }

    fn rewind(&mut self) {
        self.eof = false;
        if self
            .file
            .seek(std::io::SeekFrom::Start(0))
            .and_then(|_| pcapng::read_file_header(&mut self.file))
            .is_err()
        {
            self.eof = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(len: usize, timestamp: u64, tx: bool) -> PacketBuffer {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let mut packet = PacketBuffer::from_data(&data);
        packet.set_rx_timestamp(timestamp);
        packet.set_tx_sink(tx);
        packet
    }

    #[test]
    fn pcapng_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcapng");

        let mut buffer = FileBuffer::new(&path, false, 1500).unwrap();
        let packets: Vec<PacketBuffer> = (0..100)
            .map(|i| packet(64 + i, 1_000_000_000 + i as u64, i % 2 == 1))
            .collect();
        let refs: Vec<&PacketBuffer> = packets.iter().collect();
        assert_eq!(buffer.write_packets(&refs), 100);

        let mut reader = buffer.reader().unwrap();
        let mut read = Vec::new();
        while !reader.is_done() {
            if reader.read_packets(&mut read, 7) == 0 {
                break;
            }
        }

        assert_eq!(read.len(), 100);
        for (idx, capture) in read.iter().enumerate() {
            assert_eq!(capture.header.timestamp, 1_000_000_000 + idx as u64);
            assert_eq!(capture.header.captured_len as usize, 64 + idx);
            assert_eq!(capture.header.packet_len as usize, 64 + idx);
            assert_eq!(capture.header.dir, if idx % 2 == 1 { 2 } else { 1 });
            assert_eq!(capture.data, packets[idx].data());
        }

        reader.rewind();
        let mut again = Vec::new();
        reader.read_packets(&mut again, 200);
        assert_eq!(again.len(), 100);
    }

    #[test]
    fn file_is_removed_on_drop_unless_kept() {
        let dir = tempfile::tempdir().unwrap();

        let removed = dir.path().join("removed.pcapng");
        drop(FileBuffer::new(&removed, false, 1500).unwrap());
        assert!(!removed.exists());

        let kept = dir.path().join("kept.pcapng");
        drop(FileBuffer::new(&kept, true, 1500).unwrap());
        assert!(kept.exists());
    }

    #[test]
    fn truncation_preserves_wire_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.pcapng");

        let mut buffer = FileBuffer::new(&path, false, 128).unwrap();
        let big = packet(1000, 42, false);
        buffer.write_packets(&[&big]);

        let mut reader = buffer.reader().unwrap();
        let mut read = Vec::new();
        reader.read_packets(&mut read, 10);

        assert_eq!(read.len(), 1);
        assert_eq!(read[0].header.captured_len, 128);
        assert_eq!(read[0].header.packet_len, 1000);
    }
}
