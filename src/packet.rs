//! Parsed RTP packets (RFC 3550 §5.1) and the reorder/jitter queue that
//! turns them back into an in-order payload byte stream for the extractor.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StreamError};

/// Fixed RTP header length (no CSRCs, no extension).
const RTP_HEADER_LEN: usize = 12;

/// Half the 16-bit sequence space; distances beyond it are "behind".
const SEQUENCE_HALF_SPACE: u16 = 0x8000;

/// Forward jumps larger than this reset the expected sequence
/// (RFC 3550 A.1 MAX_DROPOUT).
const MAX_DROPOUT: u16 = 3000;

/// Default bound on buffered packets.
const DEFAULT_CAPACITY: usize = 256;

/// Default count of out-of-order packets held before a gap is declared.
const DEFAULT_REORDER_DEPTH: usize = 64;

/// A parsed RTP packet.
///
/// Parsing is kept at the wire boundary: everything downstream of the
/// transport works with this record, never with raw datagram bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Parse a datagram into an RTP packet (RFC 3550 §5.1).
    ///
    /// Handles CSRC lists, header extensions and padding. Returns
    /// `UnexpectedEof` for truncated packets and `Io` for a bad version.
    pub fn parse(data: &[u8]) -> Result<RtpPacket> {
        if data.len() < RTP_HEADER_LEN {
            return Err(StreamError::UnexpectedEof);
        }

        let version = data[0] >> 6;
        if version != 2 {
            return Err(StreamError::Io(std::sync::Arc::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("RTP version {version}, expected 2"),
            ))));
        }

        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if offset > data.len() {
            return Err(StreamError::UnexpectedEof);
        }
        if extension {
            if offset + 4 > data.len() {
                return Err(StreamError::UnexpectedEof);
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if offset > data.len() {
                return Err(StreamError::UnexpectedEof);
            }
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(StreamError::UnexpectedEof);
            }
            end -= pad;
        }

        Ok(RtpPacket {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload: data[offset..end].to_vec(),
        })
    }

    /// Serialize to a minimal wire packet (12-byte header + payload).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        bytes.push(2 << 6);
        bytes.push(((self.marker as u8) << 7) | self.payload_type);
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(&self.ssrc.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

struct QueueInner {
    /// Buffered packets sorted by sequence number.
    packets: VecDeque<RtpPacket>,
    /// Next sequence number due for playout; `None` until the first packet.
    expected: Option<u16>,
    /// Payload currently being drained by partial reads.
    current: Option<(Vec<u8>, usize)>,
    closed: bool,
    dropped: u64,
}

impl QueueInner {
    /// Whether the front packet may be released: contiguous, first ever,
    /// buffered past the reorder depth (gap declared), or draining after
    /// close.
    fn front_ready(&self, reorder_depth: usize) -> bool {
        match (self.packets.front(), self.expected) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(front), Some(expected)) => {
                front.sequence == expected || self.packets.len() > reorder_depth || self.closed
            }
        }
    }

    fn pop_ready(&mut self, reorder_depth: usize) -> Option<Vec<u8>> {
        if !self.front_ready(reorder_depth) {
            return None;
        }
        let packet = self.packets.pop_front()?;
        if let Some(expected) = self.expected {
            if packet.sequence != expected {
                tracing::warn!(
                    expected,
                    got = packet.sequence,
                    "sequence gap released from reorder buffer"
                );
            }
        }
        self.expected = Some(packet.sequence.wrapping_add(1));
        Some(packet.payload)
    }
}

/// Thread-safe RTP reorder/jitter buffer.
///
/// Packets are inserted in sequence order as they arrive; the read side
/// receives in-order, sequence-contiguous payload bytes. Late duplicates
/// are dropped, forward discontinuities beyond [`MAX_DROPOUT`] reset the
/// expected sequence, and overflow discards the oldest packet so that
/// recent media survives at the cost of a gap.
///
/// One writer (the transport pump or the signalling thread) and one reader
/// (the extractor) are the intended users; [`close`](Self::close) unblocks
/// a pending reader with end-of-stream.
pub struct PacketQueue {
    clock_rate: u32,
    capacity: usize,
    reorder_depth: usize,
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl PacketQueue {
    pub fn new(clock_rate: u32) -> Self {
        Self::with_limits(clock_rate, DEFAULT_CAPACITY, DEFAULT_REORDER_DEPTH)
    }

    pub fn with_limits(clock_rate: u32, capacity: usize, reorder_depth: usize) -> Self {
        PacketQueue {
            clock_rate,
            capacity,
            reorder_depth,
            inner: Mutex::new(QueueInner {
                packets: VecDeque::new(),
                expected: None,
                current: None,
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Payload clock rate in Hz this queue was configured with.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Insert a packet. Returns `false` when the packet was dropped
    /// (late, duplicate, or the queue is closed).
    pub fn push(&self, packet: RtpPacket) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        if let Some(expected) = inner.expected {
            let distance = packet.sequence.wrapping_sub(expected);
            if distance >= SEQUENCE_HALF_SPACE {
                inner.dropped += 1;
                tracing::trace!(seq = packet.sequence, expected, "dropped late packet");
                return false;
            }
            if distance > MAX_DROPOUT {
                tracing::warn!(
                    seq = packet.sequence,
                    expected,
                    "sequence discontinuity, resetting expected sequence"
                );
                inner.packets.clear();
                inner.expected = Some(packet.sequence);
            }
        }

        if inner.packets.iter().any(|p| p.sequence == packet.sequence) {
            inner.dropped += 1;
            tracing::trace!(seq = packet.sequence, "dropped duplicate packet");
            return false;
        }

        let pos = inner
            .packets
            .iter()
            .position(|p| {
                packet.sequence.wrapping_sub(p.sequence) >= SEQUENCE_HALF_SPACE
            })
            .unwrap_or(inner.packets.len());
        inner.packets.insert(pos, packet);

        if inner.packets.len() > self.capacity {
            let oldest = inner.packets.pop_front();
            inner.dropped += 1;
            // Keep recent media; the remaining front becomes releasable and
            // the dropped packet shows up downstream as a gap.
            inner.expected = inner.packets.front().map(|p| p.sequence);
            if let Some(oldest) = oldest {
                tracing::warn!(seq = oldest.sequence, "reorder buffer full, dropped oldest");
            }
        }

        self.available.notify_all();
        true
    }

    /// Non-blocking read used by the transport pump: fills `buf` with the
    /// next in-order payload bytes if any are ready.
    ///
    /// Returns `Ok(None)` when nothing is ready, `Ok(Some(0))` at
    /// end-of-stream after [`close`](Self::close).
    pub fn try_read(&self, buf: &mut [u8]) -> Option<usize> {
        let mut inner = self.inner.lock();
        self.fill_from(&mut inner, buf)
    }

    /// Blocking read used by the interleaved path: waits until in-order
    /// payload bytes are available or the queue is closed.
    ///
    /// Returns `Ok(0)` at end-of-stream.
    pub fn read_blocking(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(n) = self.fill_from(&mut inner, buf) {
                return Ok(n);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Blocking read with a deadline; `ReadTimeout` when nothing became
    /// available in time.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(n) = self.fill_from(&mut inner, buf) {
                return Ok(n);
            }
            if self.available.wait_for(&mut inner, timeout).timed_out() {
                return Err(StreamError::ReadTimeout(timeout));
            }
        }
    }

    fn fill_from(&self, inner: &mut QueueInner, buf: &mut [u8]) -> Option<usize> {
        if inner.current.is_none() {
            match inner.pop_ready(self.reorder_depth) {
                Some(payload) => inner.current = Some((payload, 0)),
                None => {
                    if inner.closed {
                        return Some(0);
                    }
                    return None;
                }
            }
        }

        let (payload, offset) = inner.current.as_mut().expect("current payload present");
        let n = buf.len().min(payload.len() - *offset);
        buf[..n].copy_from_slice(&payload[*offset..*offset + n]);
        *offset += n;
        if *offset == payload.len() {
            inner.current = None;
        }
        Some(n)
    }

    /// Close the queue: pending and future reads drain buffered packets,
    /// then observe end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            tracing::debug!(
                buffered = inner.packets.len(),
                dropped = inner.dropped,
                "packet queue closed"
            );
        }
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Count of packets dropped as late, duplicate or overflowed.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn packet(seq: u16, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            marker: false,
            payload_type: 96,
            sequence: seq,
            timestamp: seq as u32 * 3000,
            ssrc: 0xDEADBEEF,
            payload: payload.to_vec(),
        }
    }

    fn read_all(queue: &PacketQueue) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        while let Some(n) = queue.try_read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn parse_round_trip() {
        let original = packet(7, b"hello");
        let parsed = RtpPacket::parse(&original.to_bytes()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_rejects_truncated_and_bad_version() {
        assert!(RtpPacket::parse(&[0x80; 4]).is_err());
        let mut bytes = packet(0, b"x").to_bytes();
        bytes[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&bytes).is_err());
    }

    #[test]
    fn in_order_payloads_concatenate() {
        let queue = PacketQueue::new(90_000);
        queue.push(packet(10, b"ab"));
        queue.push(packet(11, b"cd"));
        assert_eq!(read_all(&queue), b"abcd");
    }

    #[test]
    fn reordered_packets_released_in_sequence() {
        let queue = PacketQueue::new(90_000);
        queue.push(packet(5, b"a"));
        // 7 arrives before 6; nothing past "a" until 6 shows up.
        queue.push(packet(7, b"c"));
        let mut buf = [0u8; 8];
        assert_eq!(queue.try_read(&mut buf), Some(1));
        assert_eq!(queue.try_read(&mut buf), None);
        queue.push(packet(6, b"b"));
        assert_eq!(read_all(&queue), b"bc");
    }

    #[test]
    fn duplicates_and_late_packets_dropped() {
        let queue = PacketQueue::new(90_000);
        assert!(queue.push(packet(1, b"a")));
        assert!(!queue.push(packet(1, b"a")));
        read_all(&queue);
        // Sequence 0 is now behind the expected sequence.
        assert!(!queue.push(packet(0, b"z")));
        assert_eq!(queue.dropped(), 2);
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = PacketQueue::with_limits(90_000, 2, 64);
        queue.push(packet(1, b"a"));
        // 3 and 4 leave a hole at 2; capacity 2 forces the oldest out.
        queue.push(packet(3, b"c"));
        queue.push(packet(4, b"d"));
        assert_eq!(read_all(&queue), b"cd");
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn large_forward_jump_resets_expected() {
        let queue = PacketQueue::new(90_000);
        queue.push(packet(1, b"a"));
        read_all(&queue);
        queue.push(packet(20_000, b"z"));
        assert_eq!(read_all(&queue), b"z");
    }

    #[test]
    fn sequence_wraparound() {
        let queue = PacketQueue::new(90_000);
        queue.push(packet(65_535, b"a"));
        queue.push(packet(0, b"b"));
        assert_eq!(read_all(&queue), b"ab");
    }

    #[test]
    fn close_unblocks_reader_with_eos() {
        let queue = Arc::new(PacketQueue::new(90_000));
        let reader = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 16];
                queue.read_blocking(&mut buf)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
        // Push after close is refused.
        assert!(!queue.push(packet(1, b"a")));
    }

    #[test]
    fn read_timeout_expires() {
        let queue = PacketQueue::new(90_000);
        let mut buf = [0u8; 4];
        let err = queue
            .read_timeout(&mut buf, Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn close_drains_buffered_packets_first() {
        let queue = PacketQueue::new(90_000);
        queue.push(packet(1, b"ab"));
        queue.close();
        let mut buf = [0u8; 1];
        // Partial reads keep draining the buffered payload before EOS.
        assert_eq!(queue.read_blocking(&mut buf).unwrap(), 1);
        assert_eq!(&buf, b"a");
        assert_eq!(queue.read_blocking(&mut buf).unwrap(), 1);
        assert_eq!(&buf, b"b");
        assert_eq!(queue.read_blocking(&mut buf).unwrap(), 0);
    }
}
