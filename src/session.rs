//! Collaborator interfaces to the RTSP signalling layer.
//!
//! The pipeline never parses RTSP or SDP itself; it consumes the
//! already-negotiated [`MediaTrack`] and queries session-wide state
//! through [`MediaSession`]. Session playback events (pause, resume,
//! seek, stop) flow the other way, into the wrapper's
//! `on_session_*` entry points.

use crate::format::{Format, TrackType};
use crate::transport::{InterleavedFrame, TrackTransport};

/// Session-wide state the per-track pipeline consults, and the callbacks
/// it raises towards signalling.
///
/// Implementations are shared across threads (loader, event loop,
/// consumer) and must be internally synchronized.
pub trait MediaSession: Send + Sync {
    /// Whether media travels interleaved on the RTSP control connection.
    fn is_interleaved(&self) -> bool;

    /// Whether NAT punch packets must be sent before playback.
    fn is_nat_required(&self) -> bool;

    fn is_rtcp_supported(&self) -> bool;

    /// Whether RTCP shares the RTP port (RFC 5761).
    fn is_rtcp_muxed(&self) -> bool;

    /// Whether playback is currently paused. Read timeouts during pause
    /// are swallowed by the load loop.
    fn is_paused(&self) -> bool;

    /// Total media duration in microseconds, when known.
    fn duration_us(&self) -> Option<i64>;

    /// The enabled set changed: one entry per sample queue, aligned with
    /// `track_types`.
    fn on_select_tracks(&self, track_types: &[TrackType], enabled: &[bool]);

    /// A locally-generated frame (e.g. an RTCP receiver report) must be
    /// written to the interleaved control connection.
    fn on_outgoing_interleaved_frame(&self, frame: InterleavedFrame);
}

/// RTP payload description for a track, from SDP `rtpmap`/`fmtp`.
#[derive(Debug, Clone)]
pub struct RtpPayloadFormat {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub format: Format,
}

/// One selected media track inside an established session.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    /// Control URL of the track (`rtsp://host/path/trackID=1`).
    pub url: String,
    pub transport: TrackTransport,
    pub payload: RtpPayloadFormat,
    /// Whether RTP and RTCP are muxed for this track specifically.
    pub muxed: bool,
}

impl MediaTrack {
    /// Host component of the track URL, for NAT punch fallback.
    pub fn url_host(&self) -> Option<&str> {
        let rest = self
            .url
            .strip_prefix("rtsp://")
            .or_else(|| self.url.strip_prefix("rtspu://"))
            .or_else(|| self.url.strip_prefix("rtsps://"))?;
        let authority = rest.split('/').next()?;
        // Strip userinfo and port.
        let host = authority.rsplit('@').next()?;
        Some(host.split(':').next().unwrap_or(host))
    }
}
