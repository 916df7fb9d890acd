//! Parsed RTCP packets (RFC 3550 §6) and the observable dispatchers that
//! fan them out.
//!
//! One dispatcher instance carries the inbound direction (transport →
//! listeners) and a second instance the outbound one (listeners' locally
//! generated reports → transport sink). Dispatch is synchronous on the
//! caller's thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, StreamError};

/// Fixed RTCP header length.
const RTCP_HEADER_LEN: usize = 8;

/// RTCP packet types occupy 192..=223 in the payload-type octet; used to
/// demultiplex RTCP from RTP when both share one socket.
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (192..=223).contains(&data[1])
}

/// A parsed RTCP packet. The compound body is retained verbatim; only the
/// leading header is interpreted here, detailed report parsing being the
/// listeners' concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpPacket {
    /// Packet type of the leading report (200 = SR, 201 = RR, ...).
    pub packet_type: u8,
    /// Report count from the leading header.
    pub report_count: u8,
    /// Sender SSRC of the leading report.
    pub ssrc: u32,
    /// The full compound packet bytes.
    pub bytes: Vec<u8>,
}

impl RtcpPacket {
    /// Parse the leading header of a (possibly compound) RTCP packet.
    pub fn parse(data: &[u8]) -> Result<RtcpPacket> {
        if data.len() < RTCP_HEADER_LEN {
            return Err(StreamError::UnexpectedEof);
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(StreamError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("RTCP version {version}, expected 2"),
            ))));
        }
        Ok(RtcpPacket {
            packet_type: data[1],
            report_count: data[0] & 0x1f,
            ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            bytes: data.to_vec(),
        })
    }
}

/// Receives RTCP packets from a dispatcher.
pub trait RtcpListener: Send + Sync {
    fn on_rtcp(&self, packet: &RtcpPacket);
}

/// Observable for parsed RTCP packets.
///
/// Listeners are invoked synchronously in registration order. A closed
/// dispatcher drops packets instead of delivering them; `open`/`close`
/// bracket the lifetime of a load.
pub struct RtcpDispatcher {
    listeners: RwLock<Vec<Arc<dyn RtcpListener>>>,
    open: AtomicBool,
}

impl RtcpDispatcher {
    pub fn new() -> Self {
        RtcpDispatcher {
            listeners: RwLock::new(Vec::new()),
            open: AtomicBool::new(false),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Close the dispatcher. Subsequent dispatches are dropped. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: Arc<dyn RtcpListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RtcpListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Deliver a packet to every registered listener. Returns whether the
    /// packet was delivered (false when closed).
    pub fn dispatch(&self, packet: &RtcpPacket) -> bool {
        if !self.is_open() {
            tracing::trace!(pt = packet.packet_type, "RTCP packet dropped, dispatcher closed");
            return false;
        }
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_rtcp(packet);
        }
        true
    }
}

impl Default for RtcpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
