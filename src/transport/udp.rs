//! UDP endpoint: adjacent socket pair for RTP/RTCP reception, NAT punch
//! writes, and the media sources layered on top of it.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, StreamError};
use crate::packet::{PacketQueue, RtpPacket};
use crate::rtcp::{self, RtcpDispatcher, RtcpListener, RtcpPacket};
use crate::transport::{MediaSource, TransferListener};

/// Inclusive lower bound of the local RTP port range.
pub const UDP_PORT_MIN: u16 = 50_000;

/// Exclusive upper bound of the local RTP port range.
pub const UDP_PORT_MAX: u16 = 60_000;

/// Bind attempts before giving up on the port range.
const BIND_ATTEMPTS: u32 = 64;

/// NAT punch payload: `0xCEFAEDFE` big-endian.
pub const NAT_PUNCH_MAGIC: [u8; 4] = [0xCE, 0xFA, 0xED, 0xFE];

/// Largest datagram the endpoint will receive.
const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Owns the local UDP socket pair for one track: the media socket on an
/// even port P in `[50000, 60000)` and the control (RTCP) socket on P+1.
///
/// When RTCP is multiplexed onto the media port no control socket is
/// bound. Media reads carry a per-datagram timeout; `close` is level
/// triggered and flips reads to end-of-stream at the next timeout
/// boundary.
pub struct UdpEndpoint {
    media: UdpSocket,
    control: Option<UdpSocket>,
    local_port: u16,
    read_timeout: Duration,
    closed: AtomicBool,
}

impl UdpEndpoint {
    /// Bind a socket pair, drawing even ports uniformly at random from
    /// `[50000, 60000)` until a free pair is found.
    pub fn bind_pair(read_timeout: Duration, rtcp_muxed: bool) -> Result<UdpEndpoint> {
        let mut rng = rand::rng();
        for attempt in 0..BIND_ATTEMPTS {
            let port = UDP_PORT_MIN + rng.random_range(0..(UDP_PORT_MAX - UDP_PORT_MIN) / 2) * 2;
            let media = match UdpSocket::bind(("0.0.0.0", port)) {
                Ok(socket) => socket,
                Err(_) => continue,
            };
            let control = if rtcp_muxed {
                None
            } else {
                match UdpSocket::bind(("0.0.0.0", port + 1)) {
                    Ok(socket) => Some(socket),
                    Err(_) => continue,
                }
            };

            media.set_read_timeout(Some(read_timeout))?;
            if let Some(control) = &control {
                control.set_nonblocking(true)?;
            }

            tracing::debug!(port, attempt, rtcp_muxed, "UDP endpoint bound");
            return Ok(UdpEndpoint {
                media,
                control,
                local_port: port,
                read_timeout,
                closed: AtomicBool::new(false),
            });
        }
        Err(StreamError::PortExhausted(BIND_ATTEMPTS))
    }

    /// The chosen local RTP port (always even, in `[50000, 60000)`).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The control socket's port, absent when RTCP is multiplexed.
    pub fn control_port(&self) -> Option<u16> {
        self.control.as_ref().map(|_| self.local_port + 1)
    }

    /// Receive one datagram from the media socket.
    ///
    /// Returns `Ok(0)` once closed, `ReadTimeout` when the per-datagram
    /// deadline expires.
    pub fn recv_media(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(0);
        }
        match self.media.recv_from(buf) {
            Ok((n, _)) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if self.closed.load(Ordering::SeqCst) {
                    Ok(0)
                } else {
                    Err(StreamError::ReadTimeout(self.read_timeout))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the control socket without blocking.
    pub fn try_recv_control(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(control) = &self.control else {
            return Ok(None);
        };
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match control.recv_from(buf) {
            Ok((n, _)) => Ok(Some(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Send raw bytes to `host:port` from the media socket (NAT punching,
    /// outbound RTCP on muxed transports).
    pub fn write_to(&self, data: &[u8], host: &str, port: u16) -> Result<usize> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| StreamError::Io(Arc::new(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {host}:{port}"),
            ))))?;
        Ok(self.media.send_to(data, addr)?)
    }

    /// Send from the control socket, falling back to the media socket when
    /// RTCP is multiplexed.
    pub fn write_control_to(&self, data: &[u8], host: &str, port: u16) -> Result<usize> {
        match &self.control {
            Some(control) => {
                let addr = (host, port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| StreamError::Io(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        format!("no address for {host}:{port}"),
                    ))))?;
                Ok(control.send_to(data, addr)?)
            }
            None => self.write_to(data, host, port),
        }
    }

    /// Close the endpoint. Blocked media reads observe end-of-stream at
    /// their next timeout. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(port = self.local_port, "UDP endpoint closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// RTP-over-UDP media source: pumps datagrams off the endpoint, filters by
/// SSRC, reorders through a [`PacketQueue`] and yields in-order payload
/// bytes. RTCP is pulled off the control socket (or demultiplexed off the
/// media socket) and handed to the inbound dispatcher.
pub struct RtpUdpSource {
    endpoint: Arc<UdpEndpoint>,
    queue: PacketQueue,
    ssrc_filter: Option<u32>,
    rtcp_enabled: bool,
    rtcp_muxed: bool,
    rtcp_in: Arc<RtcpDispatcher>,
    transfer: Arc<dyn TransferListener>,
    recv_buf: Vec<u8>,
}

impl RtpUdpSource {
    pub fn new(
        endpoint: Arc<UdpEndpoint>,
        clock_rate: u32,
        ssrc_filter: Option<u64>,
        rtcp_enabled: bool,
        rtcp_muxed: bool,
        rtcp_in: Arc<RtcpDispatcher>,
        transfer: Arc<dyn TransferListener>,
    ) -> Self {
        RtpUdpSource {
            endpoint,
            queue: PacketQueue::new(clock_rate),
            ssrc_filter: ssrc_filter.map(|ssrc| ssrc as u32),
            rtcp_enabled,
            rtcp_muxed,
            rtcp_in,
            transfer,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    fn dispatch_rtcp(&self, data: &[u8]) {
        if !self.rtcp_enabled {
            return;
        }
        match RtcpPacket::parse(data) {
            Ok(packet) => {
                self.rtcp_in.dispatch(&packet);
            }
            Err(e) => tracing::trace!(error = %e, "ignoring malformed RTCP packet"),
        }
    }
}

impl MediaSource for RtpUdpSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(n) = self.queue.try_read(buf) {
                return Ok(n);
            }

            // Drain any pending RTCP before blocking on media.
            if self.rtcp_enabled {
                let mut control_buf = [0u8; 2048];
                while let Some(n) = self.endpoint.try_recv_control(&mut control_buf)? {
                    self.transfer.on_bytes_transferred(n);
                    let data = control_buf[..n].to_vec();
                    self.dispatch_rtcp(&data);
                }
            }

            let n = self.endpoint.recv_media(&mut self.recv_buf)?;
            if n == 0 {
                self.queue.close();
                continue;
            }
            self.transfer.on_bytes_transferred(n);

            let data = &self.recv_buf[..n];
            if self.rtcp_muxed && rtcp::is_rtcp(data) {
                let data = data.to_vec();
                self.dispatch_rtcp(&data);
                continue;
            }

            match RtpPacket::parse(data) {
                Ok(packet) => {
                    if let Some(ssrc) = self.ssrc_filter {
                        if packet.ssrc != ssrc {
                            tracing::trace!(
                                ssrc = packet.ssrc,
                                expected = ssrc,
                                "dropped packet from foreign SSRC"
                            );
                            continue;
                        }
                    }
                    self.queue.push(packet);
                }
                Err(e) => tracing::trace!(error = %e, "ignoring malformed RTP datagram"),
            }
        }
    }
}

/// Raw datagram passthrough for MP2T/RAW over UDP. Each datagram's bytes
/// are surfaced verbatim, split across reads as needed.
pub struct RawUdpSource {
    endpoint: Arc<UdpEndpoint>,
    transfer: Arc<dyn TransferListener>,
    pending: Vec<u8>,
    pending_offset: usize,
    recv_buf: Vec<u8>,
}

impl RawUdpSource {
    pub fn new(endpoint: Arc<UdpEndpoint>, transfer: Arc<dyn TransferListener>) -> Self {
        RawUdpSource {
            endpoint,
            transfer,
            pending: Vec::new(),
            pending_offset: 0,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }
}

impl MediaSource for RawUdpSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending_offset >= self.pending.len() {
            let n = self.endpoint.recv_media(&mut self.recv_buf)?;
            if n == 0 {
                return Ok(0);
            }
            self.transfer.on_bytes_transferred(n);
            self.pending.clear();
            self.pending.extend_from_slice(&self.recv_buf[..n]);
            self.pending_offset = 0;
        }
        let n = buf.len().min(self.pending.len() - self.pending_offset);
        buf[..n].copy_from_slice(&self.pending[self.pending_offset..self.pending_offset + n]);
        self.pending_offset += n;
        Ok(n)
    }
}

/// Outbound RTCP sink for UDP transports: locally-generated reports are
/// written to the server's RTCP address from the control socket.
pub struct UdpRtcpSink {
    endpoint: Arc<UdpEndpoint>,
    host: String,
    port: u16,
}

impl UdpRtcpSink {
    pub fn new(endpoint: Arc<UdpEndpoint>, host: String, port: u16) -> Self {
        UdpRtcpSink {
            endpoint,
            host,
            port,
        }
    }
}

impl RtcpListener for UdpRtcpSink {
    fn on_rtcp(&self, packet: &RtcpPacket) {
        if let Err(e) = self
            .endpoint
            .write_control_to(&packet.bytes, &self.host, self.port)
        {
            tracing::debug!(error = %e, host = %self.host, port = self.port, "outbound RTCP send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NullTransferListener;

    fn endpoint() -> UdpEndpoint {
        UdpEndpoint::bind_pair(Duration::from_millis(50), false).unwrap()
    }

    #[test]
    fn binds_even_adjacent_ports_in_range() {
        let endpoint = endpoint();
        let port = endpoint.local_port();
        assert_eq!(port % 2, 0);
        assert!((UDP_PORT_MIN..UDP_PORT_MAX).contains(&port));
        assert_eq!(endpoint.control_port(), Some(port + 1));
    }

    #[test]
    fn muxed_endpoint_has_no_control_socket() {
        let endpoint = UdpEndpoint::bind_pair(Duration::from_millis(50), true).unwrap();
        assert_eq!(endpoint.control_port(), None);
    }

    #[test]
    fn media_read_times_out_then_eos_after_close() {
        let endpoint = endpoint();
        let mut buf = [0u8; 16];
        assert!(endpoint.recv_media(&mut buf).unwrap_err().is_timeout());
        endpoint.close();
        assert_eq!(endpoint.recv_media(&mut buf).unwrap(), 0);
        endpoint.close();
    }

    #[test]
    fn write_to_delivers_punch_magic() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let endpoint = endpoint();
        endpoint.write_to(&NAT_PUNCH_MAGIC, "127.0.0.1", port).unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xCE, 0xFA, 0xED, 0xFE]);
    }

    fn rtp_datagram(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        RtpPacket {
            marker: false,
            payload_type: 96,
            sequence: seq,
            timestamp: 0,
            ssrc,
            payload: payload.to_vec(),
        }
        .to_bytes()
    }

    #[test]
    fn rtp_source_yields_in_order_payloads() {
        let endpoint = Arc::new(endpoint());
        let port = endpoint.local_port();
        let mut source = RtpUdpSource::new(
            endpoint,
            90_000,
            None,
            false,
            false,
            Arc::new(RtcpDispatcher::new()),
            Arc::new(NullTransferListener),
        );

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&rtp_datagram(1, 0xABCD, b"one"), ("127.0.0.1", port))
            .unwrap();
        sender
            .send_to(&rtp_datagram(2, 0xABCD, b"two"), ("127.0.0.1", port))
            .unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"one");
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"two");
    }

    #[test]
    fn rtp_source_filters_foreign_ssrc() {
        let endpoint = Arc::new(endpoint());
        let port = endpoint.local_port();
        let mut source = RtpUdpSource::new(
            endpoint,
            90_000,
            Some(0xABCD),
            false,
            false,
            Arc::new(RtcpDispatcher::new()),
            Arc::new(NullTransferListener),
        );

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&rtp_datagram(1, 0x9999, b"bad"), ("127.0.0.1", port))
            .unwrap();
        sender
            .send_to(&rtp_datagram(1, 0xABCD, b"good"), ("127.0.0.1", port))
            .unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"good");
    }

    #[test]
    fn raw_source_passes_datagrams_through() {
        let endpoint = Arc::new(endpoint());
        let port = endpoint.local_port();
        let mut source = RawUdpSource::new(endpoint, Arc::new(NullTransferListener));

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"abcdef", ("127.0.0.1", port)).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }
}
