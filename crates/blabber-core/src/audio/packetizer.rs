//! Packetizers turning the decoded elementary stream into playable packets

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Splits a byte stream into packets.
///
/// Bytes are pushed as they arrive; packets are pulled once complete.
pub trait Packetizer: Send {
    /// Append newly arrived stream bytes
    fn push(&mut self, data: &[u8]);

    /// Next complete packet, if one is ready
    fn next_packet(&mut self) -> Option<Bytes>;

    /// Final packet to emit when the stream ends, if the format allows one
    fn flush(&mut self) -> Option<Bytes> {
        None
    }

    /// Drop all partial state, returning the number of discarded bytes
    fn reset(&mut self) -> usize;
}

const CAPTURE_PATTERN: &[u8] = b"OggS";
const PAGE_HEADER_LEN: usize = 27;
const CONTINUED_PACKET: u8 = 0x01;

/// Extracts Opus packets from an Ogg bitstream.
///
/// Each synthesized phrase is a complete Ogg Opus stream, so the
/// `OpusHead`/`OpusTags` header packets that open every stream are skipped.
#[derive(Debug, Default)]
pub struct OggPacketizer {
    buffer: BytesMut,
    partial: BytesMut,
    ready: VecDeque<Bytes>,
    pages: u64,
}

impl OggPacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages parsed since the last reset
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Parse one page from the buffer. Returns false when more bytes are needed.
    fn parse_page(&mut self) -> bool {
        if !self.resync() || self.buffer.len() < PAGE_HEADER_LEN {
            return false;
        }

        let version = self.buffer[4];
        let header_type = self.buffer[5];
        let segments = self.buffer[26] as usize;
        let header_len = PAGE_HEADER_LEN + segments;
        if self.buffer.len() < header_len {
            return false;
        }

        let lacing = &self.buffer[PAGE_HEADER_LEN..header_len];
        let body_len: usize = lacing.iter().map(|&l| l as usize).sum();
        if self.buffer.len() < header_len + body_len {
            return false;
        }

        if version != 0 {
            warn!("Skipping Ogg page with unsupported version {}", version);
            self.buffer.advance(header_len + body_len);
            return true;
        }

        let mut page = self.buffer.split_to(header_len + body_len).freeze();
        let lacing = page.split_to(header_len).slice(PAGE_HEADER_LEN..);
        self.pages += 1;

        let mut continued = header_type & CONTINUED_PACKET != 0;
        if !continued && !self.partial.is_empty() {
            warn!(
                "Dropping {} bytes of unterminated Ogg packet",
                self.partial.len()
            );
            self.partial.clear();
        }

        for &segment_len in lacing.iter() {
            let segment = page.split_to(segment_len as usize);
            if continued && self.partial.is_empty() {
                // Tail of a packet whose head we never saw
                if segment_len < 255 {
                    continued = false;
                }
                continue;
            }
            continued = false;
            self.partial.extend_from_slice(&segment);
            if segment_len < 255 {
                let packet = self.partial.split().freeze();
                if !is_opus_header(&packet) {
                    self.ready.push_back(packet);
                }
            }
        }
        true
    }

    /// Discard bytes until the buffer starts with a capture pattern
    fn resync(&mut self) -> bool {
        if self.buffer.len() < CAPTURE_PATTERN.len() {
            return false;
        }
        if self.buffer.starts_with(CAPTURE_PATTERN) {
            return true;
        }

        let found = self
            .buffer
            .windows(CAPTURE_PATTERN.len())
            .position(|w| w == CAPTURE_PATTERN);
        let skip = found.unwrap_or(self.buffer.len() - (CAPTURE_PATTERN.len() - 1));
        warn!("Lost Ogg page sync, skipping {} bytes", skip);
        self.buffer.advance(skip);
        found.is_some()
    }
}

fn is_opus_header(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}

impl Packetizer for OggPacketizer {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_packet(&mut self) -> Option<Bytes> {
        while self.ready.is_empty() {
            if !self.parse_page() {
                return None;
            }
        }
        self.ready.pop_front()
    }

    fn reset(&mut self) -> usize {
        let discarded = self.buffer.len() + self.partial.len();
        if discarded > 0 {
            debug!("Resetting Ogg packetizer, discarding {} bytes", discarded);
        }
        self.buffer.clear();
        self.partial.clear();
        self.ready.clear();
        self.pages = 0;
        discarded
    }
}

/// Cuts the stream into packets of a fixed size; the last one may be short.
#[derive(Debug)]
pub struct RawPacketizer {
    packet_size: usize,
    buffer: BytesMut,
}

impl RawPacketizer {
    /// # Panics
    /// Panics if `packet_size` is zero.
    pub fn new(packet_size: usize) -> Self {
        assert!(packet_size > 0, "packet size must be non-zero");
        Self {
            packet_size,
            buffer: BytesMut::new(),
        }
    }
}

impl Packetizer for RawPacketizer {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_packet(&mut self) -> Option<Bytes> {
        if self.buffer.len() >= self.packet_size {
            Some(self.buffer.split_to(self.packet_size).freeze())
        } else {
            None
        }
    }

    fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    fn reset(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        discarded
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build one Ogg page around the given packets (each under 255 * 255 bytes)
    pub(crate) fn ogg_page(header_type: u8, sequence: u32, packets: &[&[u8]]) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();
        for packet in packets {
            let mut remaining = packet.len();
            while remaining >= 255 {
                lacing.push(255u8);
                remaining -= 255;
            }
            lacing.push(remaining as u8);
            body.extend_from_slice(packet);
        }

        let mut page = Vec::new();
        page.extend_from_slice(CAPTURE_PATTERN);
        page.push(0);
        page.push(header_type);
        page.extend_from_slice(&0u64.to_le_bytes());
        page.extend_from_slice(&7u32.to_le_bytes());
        page.extend_from_slice(&sequence.to_le_bytes());
        page.extend_from_slice(&0u32.to_le_bytes());
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(&body);
        page
    }

    pub(crate) fn opus_stream(packets: &[&[u8]]) -> Vec<u8> {
        let mut stream = ogg_page(0x02, 0, &[&b"OpusHead\x01\x01"[..]]);
        stream.extend(ogg_page(0, 1, &[&b"OpusTags\x00"[..]]));
        stream.extend(ogg_page(0, 2, packets));
        stream
    }

    fn drain(packetizer: &mut impl Packetizer) -> Vec<Bytes> {
        std::iter::from_fn(|| packetizer.next_packet()).collect()
    }

    #[test]
    fn test_ogg_skips_opus_headers() {
        let mut packetizer = OggPacketizer::new();
        packetizer.push(&opus_stream(&[&b"frame-1"[..], &b"frame-2"[..]]));

        let packets = drain(&mut packetizer);
        assert_eq!(packets, vec![&b"frame-1"[..], &b"frame-2"[..]]);
        assert_eq!(packetizer.pages(), 3);
    }

    #[test]
    fn test_ogg_waits_for_complete_page() {
        let stream = opus_stream(&[&b"abc"[..]]);
        let mut packetizer = OggPacketizer::new();

        for byte in &stream[..stream.len() - 1] {
            packetizer.push(&[*byte]);
            assert!(packetizer.next_packet().is_none());
        }
        packetizer.push(&stream[stream.len() - 1..]);
        assert_eq!(packetizer.next_packet().unwrap(), &b"abc"[..]);
    }

    #[test]
    fn test_ogg_packet_spanning_pages() {
        let big = vec![9u8; 300];
        // First page carries 255 bytes with a 255 lacing value (packet continues)
        let mut stream = ogg_page(0, 0, &[]);
        stream[26] = 1;
        stream.push(255);
        stream.extend_from_slice(&big[..255]);
        // Second page finishes it
        let mut tail = ogg_page(CONTINUED_PACKET, 1, &[&big[255..]]);
        stream.append(&mut tail);

        let mut packetizer = OggPacketizer::new();
        packetizer.push(&stream);
        assert_eq!(drain(&mut packetizer), vec![Bytes::from(big)]);
    }

    #[test]
    fn test_ogg_resyncs_after_garbage() {
        let mut stream = b"garbage".to_vec();
        stream.extend(opus_stream(&[&b"ok"[..]]));

        let mut packetizer = OggPacketizer::new();
        packetizer.push(&stream);
        assert_eq!(drain(&mut packetizer), vec![&b"ok"[..]]);
    }

    #[test]
    fn test_ogg_reset_discards_partial_page() {
        let stream = opus_stream(&[&b"abc"[..]]);
        let mut packetizer = OggPacketizer::new();
        packetizer.push(&stream[..stream.len() - 2]);
        assert!(drain(&mut packetizer).is_empty());

        assert!(packetizer.reset() > 0);
        packetizer.push(&stream);
        assert_eq!(drain(&mut packetizer), vec![&b"abc"[..]]);
    }

    #[test]
    fn test_raw_packetizer_flushes_tail() {
        let mut packetizer = RawPacketizer::new(4);
        packetizer.push(b"abcdefghij");
        assert_eq!(drain(&mut packetizer), vec![&b"abcd"[..], &b"efgh"[..]]);
        assert_eq!(packetizer.flush().unwrap(), &b"ij"[..]);
        assert!(packetizer.flush().is_none());
        assert_eq!(packetizer.reset(), 0);
    }

    #[test]
    #[should_panic(expected = "packet size must be non-zero")]
    fn test_raw_packetizer_rejects_zero() {
        RawPacketizer::new(0);
    }
}
