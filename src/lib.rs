//! # rtsp-stream — per-track RTSP media-stream pipeline
//!
//! For one selected media track inside an established RTSP session, this
//! crate establishes a transport (UDP socket pair or TCP interleaved
//! channel), ingests RTP and RTCP, reassembles elementary media samples
//! through a pluggable extractor, buffers them in seekable per-track
//! queues and surfaces them to a consumer as a readable sample stream. It
//! also participates in NAT traversal, seek/pause/resume control, and
//! transparent failover from UDP to TCP interleaving.
//!
//! RTSP/SDP signalling, DRM key exchange and the byte-level extractor
//! implementations are external collaborators behind the traits in
//! [`session`], [`sample`] and [`extractor`].
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Interleaved framing, transport parameters negotiated by signalling |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | Packet parsing, sequence reordering, report dispatch |
//! | [RFC 5761](https://tools.ietf.org/html/rfc5761) | RTP/RTCP mux | Single-port demultiplexing by payload type |
//! | [RFC 6381](https://tools.ietf.org/html/rfc6381) | Codecs parameter | Codec identity and manifest codec filtering |
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Consumer (player / renderer)                  │
//! ├───────────────────────────────────────────────┤
//! │  SampleStreamWrapper — lifecycle state machine │
//! │  SampleQueue (per track) — seekable ring       │
//! ├───────────────────────────────────────────────┤
//! │  Loader + loadable — worker-thread load loop   │
//! │  Extractor contracts — bytes → typed samples   │
//! ├───────────────────────────────────────────────┤
//! │  Transport — UDP pair / TCP interleaved        │
//! │  PacketQueue — RTP reorder, RtcpDispatcher     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtsp_stream::{
//!     Allocator, NoopDrmSessionManager, NullTransferListener, SampleStreamWrapper,
//!     StreamConfig, StreamEvent, TrackIdGenerator,
//! };
//! # fn collaborators() -> (Arc<dyn rtsp_stream::MediaSession>, rtsp_stream::MediaTrack,
//! #     Arc<dyn rtsp_stream::ExtractorFactory>) { unimplemented!() }
//!
//! let (session, track, extractors) = collaborators();
//! let wrapper = SampleStreamWrapper::new(
//!     session,
//!     track,
//!     Box::new(|event: StreamEvent| println!("{event:?}")),
//!     StreamConfig::default(),
//!     Allocator::new(),
//!     Arc::new(NoopDrmSessionManager),
//!     Arc::new(NullTransferListener),
//!     extractors,
//!     Arc::new(TrackIdGenerator::new(1)),
//! ).unwrap();
//!
//! wrapper.prepare();
//! // ... on PrepareSuccess: select tracks, then read samples.
//! wrapper.playback();
//! ```
//!
//! ## Crate layout
//!
//! - [`wrapper`] — [`SampleStreamWrapper`] coordinator, loadables, events.
//! - [`sample`] — [`SampleQueue`], allocator, read-side records.
//! - [`loader`] — single-worker load scheduler.
//! - [`extractor`] — extractor contracts, selection, drive loop.
//! - [`transport`] — UDP endpoint, interleaved adapter, NAT punching.
//! - [`packet`] — RTP parsing and the reorder/jitter queue.
//! - [`rtcp`] — RTCP parsing and report dispatchers.
//! - [`format`] — elementary-stream format descriptors and merges.
//! - [`session`] — signalling-layer collaborator interfaces.
//! - [`error`] — [`StreamError`] enum and [`Result`] alias.

pub mod error;
pub mod extractor;
pub mod format;
pub mod loader;
pub mod packet;
pub mod rtcp;
pub mod sample;
pub mod session;
pub mod transport;
pub mod wrapper;

pub use error::{Result, StreamError};
pub use extractor::{
    Extractor, ExtractorFactory, ExtractorOutput, MediaInput, ReadAction, TrackIdGenerator,
    TrackOutput,
};
pub use format::{Format, FormatBuilder, TrackType};
pub use packet::{PacketQueue, RtpPacket};
pub use rtcp::{RtcpDispatcher, RtcpListener, RtcpPacket};
pub use sample::{
    Allocator, DrmSessionManager, FormatHolder, NoopDrmSessionManager, ReadResult, SampleBuffer,
    SampleFlags, SampleQueue,
};
pub use session::{MediaSession, MediaTrack, RtpPayloadFormat};
pub use transport::{
    InterleavedFrame, LowerTransport, MediaSource, NullTransferListener, TrackTransport,
    TransferListener, TransportProtocol,
};
pub use wrapper::{
    SampleStream, SampleStreamWrapper, StreamConfig, StreamEvent, StreamEventListener, TrackGroup,
    TrackGroupArray,
};
