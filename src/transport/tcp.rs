//! TCP-interleaved endpoint: media for a track whose RTP/RTCP frames
//! travel over the RTSP control connection, `$`-framed with a channel
//! byte (RFC 2326 §10.12).
//!
//! The endpoint owns no socket. The signalling layer demultiplexes frames
//! off the control connection and hands them over via
//! [`InterleavedEndpoint::on_frame`]; channel\[0\] carries RTP into the
//! shared [`PacketQueue`], channel\[1\] carries RTCP into the inbound
//! dispatcher.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::packet::{PacketQueue, RtpPacket};
use crate::rtcp::{RtcpDispatcher, RtcpPacket};
use crate::transport::{InterleavedFrame, MediaSource, TransferListener};

/// Receives interleaved frames for one track and routes them by channel.
pub struct InterleavedEndpoint {
    channels: (u8, u8),
    queue: Arc<PacketQueue>,
    rtcp_in: Arc<RtcpDispatcher>,
}

impl InterleavedEndpoint {
    pub fn new(channels: (u8, u8), queue: Arc<PacketQueue>, rtcp_in: Arc<RtcpDispatcher>) -> Self {
        InterleavedEndpoint {
            channels,
            queue,
            rtcp_in,
        }
    }

    pub fn channels(&self) -> (u8, u8) {
        self.channels
    }

    /// Route one frame. Frames for unknown channels and malformed packets
    /// are dropped with a trace.
    pub fn on_frame(&self, frame: &InterleavedFrame) {
        if frame.channel == self.channels.0 {
            match RtpPacket::parse(&frame.data) {
                Ok(packet) => {
                    self.queue.push(packet);
                }
                Err(e) => tracing::trace!(error = %e, "malformed interleaved RTP frame"),
            }
        } else if frame.channel == self.channels.1 {
            match RtcpPacket::parse(&frame.data) {
                Ok(packet) => {
                    self.rtcp_in.dispatch(&packet);
                }
                Err(e) => tracing::trace!(error = %e, "malformed interleaved RTCP frame"),
            }
        } else {
            tracing::trace!(channel = frame.channel, "frame for unknown channel dropped");
        }
    }

    /// Close the underlying packet queue, unblocking any reader with
    /// end-of-stream.
    pub fn close(&self) {
        self.queue.close();
    }
}

/// Media source reading in-order RTP payload bytes off the shared
/// [`PacketQueue`].
///
/// Reads wake at `poll_interval` so the load loop can observe cancellation
/// while the control connection is quiet; the resulting `ReadTimeout` is
/// not a failure on this transport.
pub struct InterleavedSource {
    queue: Arc<PacketQueue>,
    poll_interval: Duration,
    transfer: Arc<dyn TransferListener>,
}

impl InterleavedSource {
    pub fn new(
        queue: Arc<PacketQueue>,
        poll_interval: Duration,
        transfer: Arc<dyn TransferListener>,
    ) -> Self {
        InterleavedSource {
            queue,
            poll_interval,
            transfer,
        }
    }
}

impl MediaSource for InterleavedSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.queue.read_timeout(buf, self.poll_interval) {
            Ok(n) => {
                self.transfer.on_bytes_transferred(n);
                Ok(n)
            }
            Err(StreamError::ReadTimeout(timeout)) => Err(StreamError::ReadTimeout(timeout)),
            Err(e) => Err(e),
        }
    }
}
