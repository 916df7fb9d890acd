//! Top-level per-track pipeline coordinator.
//!
//! [`SampleStreamWrapper`] owns everything for one media track: the
//! loader and its loadable, the sample queues the extractor fills, the
//! RTCP dispatchers, and the event loop that serializes listener
//! callbacks. It runs the lifecycle
//!
//! ```text
//! new -> preparing -> prepared -> playing <-> (resetting | paused) -> released
//! ```
//!
//! and recovers from UDP read failure by restarting the load on a TCP
//! interleaved loadable without discarding already-queued samples.
//!
//! ## Threading
//!
//! Lifecycle callbacks and posted transitions run on the wrapper's event
//! loop; wrapper state lives behind one mutex so consumer-thread control
//! calls serialize with them. Consumer read APIs bypass the loop and touch
//! only per-queue synchronization. `pending_reset_position_us` is shared
//! with the load thread through an atomic.

mod event_loop;
mod loadable;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, StreamError};
use crate::extractor::{ExtractorFactory, ExtractorOutput, TrackIdGenerator, TrackOutput};
use crate::format::{Format, TrackType};
use crate::loader::{LoadErrorAction, Loadable, Loader, LoaderCallback};
use crate::packet::PacketQueue;
use crate::rtcp::{RtcpDispatcher, RtcpListener, RtcpPacket};
use crate::sample::{
    Allocator, DrmSessionManager, FormatHolder, ReadResult, SampleBuffer, SampleQueue,
    TIME_END_OF_SOURCE, TIME_UNSET, UpstreamFormatChangedListener,
};
use crate::session::{MediaSession, MediaTrack};
use crate::transport::tcp::InterleavedEndpoint;
use crate::transport::{
    InterleavedFrame, LowerTransport, TrackTransport, TransferListener, punch_host,
};

use event_loop::{EventLoop, LoadCondition};
use loadable::{LoadableMode, MediaLoadable};

/// How many times each NAT punch datagram is sent.
const NAT_PUNCH_REPEATS: usize = 2;

/// Tuning knobs for one wrapper.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Per-datagram socket timeout, and the interleaved poll interval.
    pub read_timeout: Duration,
    /// Delay between load retries when a callback elects to retry.
    pub min_retry_delay: Duration,
    /// Initial playback position in microseconds.
    pub position_us: i64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            read_timeout: Duration::from_secs(3),
            min_retry_delay: Duration::from_millis(500),
            position_us: 0,
        }
    }
}

/// Lifecycle events published to the wrapper's listener, always on the
/// event-loop thread.
#[derive(Debug)]
pub enum StreamEvent {
    PrepareStarted,
    PrepareFailure(StreamError),
    PrepareSuccess,
    PlaybackCancel,
    PlaybackComplete,
    PlaybackFailure(StreamError),
}

/// Receives [`StreamEvent`]s. Dispatch is serialized on the event loop,
/// so implementations need no internal synchronization.
pub trait StreamEventListener: Send {
    fn on_event(&mut self, event: StreamEvent);
}

impl<F: FnMut(StreamEvent) + Send> StreamEventListener for F {
    fn on_event(&mut self, event: StreamEvent) {
        self(event)
    }
}

/// A bundle of exchangeable formats; always a single format here.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackGroup {
    formats: Vec<Format>,
}

impl TrackGroup {
    pub fn new(format: Format) -> Self {
        TrackGroup {
            formats: vec![format],
        }
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn format(&self, index: usize) -> &Format {
        &self.formats[index]
    }
}

/// The track groups exposed once preparation completes; built exactly
/// once, on the transition into `prepared`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackGroupArray {
    groups: Vec<TrackGroup>,
}

impl TrackGroupArray {
    pub fn new(groups: Vec<TrackGroup>) -> Self {
        TrackGroupArray { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, index: usize) -> &TrackGroup {
        &self.groups[index]
    }
}

/// Read handle for one selected track group, returned by
/// [`SampleStreamWrapper::select_tracks`].
pub struct SampleStream {
    core: Arc<WrapperCore>,
    group: usize,
}

impl SampleStream {
    pub fn group(&self) -> usize {
        self.group
    }

    pub fn is_ready(&self) -> bool {
        self.core.stream_is_ready(self.group)
    }

    pub fn read_data(
        &self,
        format_holder: &mut FormatHolder,
        buffer: &mut SampleBuffer,
        require_format: bool,
    ) -> ReadResult {
        self.core.read_data(self.group, format_holder, buffer, require_format)
    }

    pub fn skip_data(&self, position_us: i64) -> usize {
        self.core.skip_data(self.group, position_us)
    }

    pub fn maybe_throw_error(&self) -> Result<()> {
        self.core.loader.maybe_throw_error()
    }
}

struct WrapperState {
    prepared: bool,
    playback: bool,
    released: bool,
    loading_finished: bool,
    sample_queues_built: bool,
    sample_queues: Vec<Arc<SampleQueue>>,
    sample_queue_track_ids: Vec<u32>,
    sample_queue_track_types: Vec<TrackType>,
    track_groups: Option<TrackGroupArray>,
    track_group_enabled: Vec<bool>,
    enabled_sample_queue_count: usize,
    enabled_track_count: usize,
    last_seek_position_us: i64,
    local_port: Option<u16>,
    interleaved: Option<Arc<InterleavedEndpoint>>,
    loadable: Option<Arc<MediaLoadable>>,
}

pub(crate) struct WrapperCore {
    pub(crate) session: Arc<dyn MediaSession>,
    pub(crate) track: MediaTrack,
    /// Live transport parameters; signalling may renegotiate them (e.g.
    /// re-SETUP over TCP) before canceling the loader.
    transport: Mutex<TrackTransport>,
    pub(crate) config: StreamConfig,
    pub(crate) transfer: Arc<dyn TransferListener>,
    pub(crate) extractors: Arc<dyn ExtractorFactory>,
    pub(crate) track_ids: Arc<TrackIdGenerator>,
    pub(crate) rtcp_in: Arc<RtcpDispatcher>,
    pub(crate) rtcp_out: Arc<RtcpDispatcher>,
    pub(crate) packet_queue: Arc<PacketQueue>,
    pub(crate) load_condition: Arc<LoadCondition>,
    pub(crate) loader: Loader,
    allocator: Allocator,
    drm: Arc<dyn DrmSessionManager>,
    events: EventLoop,
    listener: Arc<Mutex<Box<dyn StreamEventListener>>>,
    pending_reset_position_us: AtomicI64,
    state: Mutex<WrapperState>,
    self_weak: Weak<WrapperCore>,
}

/// Coordinator for one track's media pipeline. See the module docs.
pub struct SampleStreamWrapper {
    core: Arc<WrapperCore>,
}

impl SampleStreamWrapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<dyn MediaSession>,
        track: MediaTrack,
        listener: Box<dyn StreamEventListener>,
        config: StreamConfig,
        allocator: Allocator,
        drm: Arc<dyn DrmSessionManager>,
        transfer: Arc<dyn TransferListener>,
        extractors: Arc<dyn ExtractorFactory>,
        track_ids: Arc<TrackIdGenerator>,
    ) -> std::io::Result<SampleStreamWrapper> {
        let events = EventLoop::new("rtsp-stream:events")?;
        let packet_queue = Arc::new(PacketQueue::new(track.payload.clock_rate));
        let position_us = config.position_us;
        let min_retry_delay = config.min_retry_delay;

        let transport = track.transport.clone();
        let core = Arc::new_cyclic(|self_weak| WrapperCore {
            session,
            track,
            transport: Mutex::new(transport),
            config,
            transfer,
            extractors,
            track_ids,
            rtcp_in: Arc::new(RtcpDispatcher::new()),
            rtcp_out: Arc::new(RtcpDispatcher::new()),
            packet_queue,
            load_condition: Arc::new(LoadCondition::new(false)),
            loader: Loader::new("rtsp-stream:loader", min_retry_delay),
            allocator,
            drm,
            events,
            listener: Arc::new(Mutex::new(listener)),
            pending_reset_position_us: AtomicI64::new(TIME_UNSET),
            state: Mutex::new(WrapperState {
                prepared: false,
                playback: false,
                released: false,
                loading_finished: false,
                sample_queues_built: false,
                sample_queues: Vec::new(),
                sample_queue_track_ids: Vec::new(),
                sample_queue_track_types: Vec::new(),
                track_groups: None,
                track_group_enabled: Vec::new(),
                enabled_sample_queue_count: 0,
                enabled_track_count: 0,
                last_seek_position_us: position_us,
                local_port: None,
                interleaved: None,
                loadable: None,
            }),
            self_weak: self_weak.clone(),
        });

        // Locally-generated RTCP reports flow back out through the
        // interleaved control connection when channels are known.
        let out_listener: Arc<dyn RtcpListener> = core.clone();
        core.rtcp_out.add_listener(out_listener);

        Ok(SampleStreamWrapper { core })
    }

    /// Start (or restart) preparation. Idempotent: a second call while the
    /// loader is live cancels it, which re-enters loading on the
    /// transport-appropriate loadable.
    pub fn prepare(&self) {
        self.core.prepare();
    }

    /// Enter playback: perform the NAT punch when the session requires
    /// one, then release the load loop.
    pub fn playback(&self) {
        self.core.playback();
    }

    /// Release everything. Idempotent; afterwards `prepare` and
    /// `playback` are no-ops.
    pub fn release(&self) {
        self.core.release();
    }

    /// Interleaved channel pair for this track, from signalling.
    pub fn set_interleaved_channels(&self, channels: (u8, u8)) {
        self.core.set_interleaved_channels(channels);
    }

    /// Replace the track's transport parameters after signalling
    /// renegotiates them (e.g. a re-SETUP over TCP before failover).
    pub fn update_transport(&self, transport: TrackTransport) {
        *self.core.transport.lock() = transport;
    }

    /// One frame lifted off the RTSP control connection.
    pub fn on_interleaved_frame(&self, frame: &InterleavedFrame) {
        self.core.on_interleaved_frame(frame);
    }

    /// Apply a track selection. `selections[i]` is the chosen group index
    /// for output slot `i`; cleared or non-retained slots are deselected
    /// first.
    pub fn select_tracks(
        &self,
        selections: &[Option<usize>],
        may_retain: &[bool],
        streams: &mut [Option<SampleStream>],
        stream_reset_flags: &mut [bool],
        position_us: i64,
    ) {
        self.core
            .select_tracks(selections, may_retain, streams, stream_reset_flags, position_us);
    }

    /// Seek. Returns `true` when the queues had to be reset (the seek
    /// position left the buffer); `false` after a successful in-buffer
    /// seek.
    pub fn seek_to_us(&self, position_us: i64) -> bool {
        self.core.seek_to_us(position_us)
    }

    pub fn discard_buffer(&self, position_us: i64, to_keyframe: bool) {
        self.core.discard_buffer(position_us, to_keyframe);
    }

    pub fn discard_buffer_to_end(&self) {
        self.core.discard_buffer_to_end();
    }

    /// Rethrow the loader's terminal error, or `PrepareInterrupted` when
    /// loading finished before preparation completed.
    pub fn maybe_throw_prepare_error(&self) -> Result<()> {
        self.core.maybe_throw_prepare_error()
    }

    pub fn maybe_throw_error(&self) -> Result<()> {
        self.core.loader.maybe_throw_error()
    }

    pub fn track_groups(&self) -> Option<TrackGroupArray> {
        self.core.state.lock().track_groups.clone()
    }

    pub fn media_track(&self) -> &MediaTrack {
        &self.core.track
    }

    /// The UDP endpoint's local RTP port, once bound.
    pub fn local_port(&self) -> Option<u16> {
        self.core.state.lock().local_port
    }

    pub fn buffered_position_us(&self) -> i64 {
        self.core.buffered_position_us()
    }

    pub fn next_load_position_us(&self) -> i64 {
        self.core.next_load_position_us()
    }

    pub fn is_loading(&self) -> bool {
        self.core.loader.is_loading()
    }

    /// The pending out-of-buffer seek position, if a reset is in flight.
    pub fn pending_reset_position_us(&self) -> Option<i64> {
        self.core.pending_reset_position()
    }

    /// Count of currently enabled sample queues.
    pub fn enabled_sample_queue_count(&self) -> usize {
        self.core.state.lock().enabled_sample_queue_count
    }

    // Session playback events.

    pub fn on_session_pause(&self) {
        // Reads are swallowed while the session reports paused; nothing
        // to do here.
    }

    pub fn on_session_resume(&self) {
        self.core.nudge_pending_reset();
    }

    pub fn on_session_seek(&self) {
        self.core.nudge_pending_reset();
    }

    pub fn on_session_stop(&self) {
        self.core.cancel_playback();
        self.core.release();
    }
}

impl Drop for SampleStreamWrapper {
    fn drop(&mut self) {
        self.core.release();
    }
}

impl WrapperCore {
    fn arc(&self) -> Arc<WrapperCore> {
        self.self_weak.upgrade().expect("wrapper core still alive")
    }

    fn post_event(&self, event: StreamEvent) {
        let listener = self.listener.clone();
        self.events.post(move || listener.lock().on_event(event));
    }

    pub(crate) fn post_prepare_started(&self) {
        self.post_event(StreamEvent::PrepareStarted);
    }

    pub(crate) fn post_prepare_failure(&self, error: StreamError) {
        self.post_event(StreamEvent::PrepareFailure(error));
    }

    pub(crate) fn set_local_port(&self, port: u16) {
        self.state.lock().local_port = Some(port);
    }

    pub(crate) fn current_transport(&self) -> TrackTransport {
        self.transport.lock().clone()
    }

    pub(crate) fn pending_reset_position(&self) -> Option<i64> {
        match self.pending_reset_position_us.load(Ordering::Acquire) {
            TIME_UNSET => None,
            position => Some(position),
        }
    }

    pub(crate) fn take_pending_reset_position(&self) -> Option<i64> {
        match self.pending_reset_position_us.swap(TIME_UNSET, Ordering::AcqRel) {
            TIME_UNSET => None,
            position => Some(position),
        }
    }

    fn is_pending_reset(&self) -> bool {
        self.pending_reset_position().is_some()
    }

    fn prepare(&self) {
        let mut state = self.state.lock();
        if state.released || state.loading_finished {
            return;
        }

        if !state.prepared {
            let mode = if self.session.is_interleaved()
                || self.current_transport().lower_transport != LowerTransport::Udp
            {
                LoadableMode::Interleaved
            } else {
                LoadableMode::Udp
            };
            let loadable = Arc::new(MediaLoadable::new(self.arc(), mode, false));
            state.loadable = Some(loadable.clone());
            state.prepared = true;
            drop(state);

            tracing::info!(url = %self.track.url, ?mode, "preparing media stream");
            let callback: Arc<dyn LoaderCallback> = self.arc();
            if let Err(e) = self.loader.start_loading(loadable, callback) {
                tracing::warn!(error = %e, "failed to start loader");
            }
        } else if self.loader.is_loading() {
            drop(state);
            // Re-prepare: cancel and let the canceled callback restart
            // loading on the right transport.
            self.loader.cancel_loading();
        }
    }

    fn playback(&self) {
        {
            let state = self.state.lock();
            if state.released || state.loading_finished || !state.prepared || state.playback {
                return;
            }
        }

        if self.session.is_nat_required() {
            self.send_nat_punches();
        }

        let position_us = self.state.lock().last_seek_position_us;
        self.continue_loading(position_us);
    }

    fn send_nat_punches(&self) {
        let transport = self.current_transport();
        let Some(&rtp_port) = transport.server_ports.first() else {
            return;
        };
        let loadable = self.state.lock().loadable.clone();
        let Some(loadable) = loadable else {
            return;
        };

        let url_host = self.track.url_host().unwrap_or_default();
        let host = punch_host(&transport, url_host);

        let rtcp_needed = transport.protocol == crate::transport::TransportProtocol::Rtp
            && self.session.is_rtcp_supported()
            && !self.session.is_rtcp_muxed()
            && transport.server_ports.len() == 2;

        for _ in 0..NAT_PUNCH_REPEATS {
            loadable.punch(host, rtp_port);
            if rtcp_needed {
                loadable.punch(host, transport.server_ports[1]);
            }
        }
    }

    fn continue_loading(&self, _position_us: i64) -> bool {
        let state = self.state.lock();
        if state.loading_finished || !state.prepared {
            return false;
        }
        let playing = state.playback;
        drop(state);
        if self.loader.is_loading() && !playing {
            self.load_condition.open();
        }
        true
    }

    fn nudge_pending_reset(&self) {
        if !self.is_pending_reset() {
            return;
        }
        let (loadable, playing) = {
            let state = self.state.lock();
            (state.loadable.clone(), state.playback)
        };
        if let Some(loadable) = loadable {
            if self.loader.is_loading() && playing {
                loadable.seek_load();
            }
        }
    }

    fn cancel_playback(&self) {
        let playing = self.state.lock().playback;
        if self.loader.is_loading() && playing {
            self.loader.cancel_loading();
        }
    }

    fn seek_to_us(&self, position_us: i64) -> bool {
        let (queues, built) = {
            let mut state = self.state.lock();
            state.last_seek_position_us = position_us;
            (state.sample_queues.clone(), state.sample_queues_built)
        };

        if built && queues.iter().all(|q| q.seek_to(position_us, false)) {
            return false;
        }

        // The position is outside the buffer: flush everything and let the
        // extractor seek on its next iteration.
        for queue in &queues {
            queue.discard_to_end();
        }
        self.pending_reset_position_us
            .store(position_us, Ordering::Release);
        true
    }

    fn discard_buffer(&self, position_us: i64, to_keyframe: bool) {
        let (queues, enabled) = {
            let state = self.state.lock();
            (state.sample_queues.clone(), state.track_group_enabled.clone())
        };
        for (queue, enabled) in queues.iter().zip(enabled) {
            queue.discard_to(position_us, to_keyframe, enabled);
        }
    }

    fn discard_buffer_to_end(&self) {
        let queues = self.state.lock().sample_queues.clone();
        for queue in &queues {
            queue.discard_to_end();
        }
    }

    fn select_tracks(
        &self,
        selections: &[Option<usize>],
        may_retain: &[bool],
        streams: &mut [Option<SampleStream>],
        stream_reset_flags: &mut [bool],
        _position_us: i64,
    ) {
        let mut state = self.state.lock();
        assert!(state.prepared, "select_tracks before prepare completed");

        // Deselect old tracks.
        for i in 0..selections.len() {
            if streams[i].is_some() && (selections[i].is_none() || !may_retain[i]) {
                let group = streams[i].as_ref().map(|s| s.group).expect("stream present");
                set_track_group_enabled(&mut state, group, false);
                streams[i] = None;
            }
        }

        // Select new tracks.
        for i in 0..selections.len() {
            if streams[i].is_none() {
                if let Some(group) = selections[i] {
                    assert!(
                        !state.track_group_enabled[group],
                        "group {group} selected twice"
                    );
                    state.enabled_track_count += 1;
                    set_track_group_enabled(&mut state, group, true);
                    streams[i] = Some(SampleStream {
                        core: self.arc(),
                        group,
                    });
                    stream_reset_flags[i] = true;
                }
            }
        }

        let track_types = state.sample_queue_track_types.clone();
        let enabled = state.track_group_enabled.clone();
        drop(state);
        self.session.on_select_tracks(&track_types, &enabled);
    }

    fn stream_is_ready(&self, group: usize) -> bool {
        if self.is_pending_reset() {
            return false;
        }
        let (queue, loading_finished) = {
            let state = self.state.lock();
            (state.sample_queues[group].clone(), state.loading_finished)
        };
        queue.is_ready(loading_finished)
    }

    fn read_data(
        &self,
        group: usize,
        format_holder: &mut FormatHolder,
        buffer: &mut SampleBuffer,
        require_format: bool,
    ) -> ReadResult {
        if self.is_pending_reset() {
            return ReadResult::NothingRead;
        }
        let (queue, loading_finished) = {
            let state = self.state.lock();
            (state.sample_queues[group].clone(), state.loading_finished)
        };
        queue.read(format_holder, buffer, require_format, loading_finished)
    }

    fn skip_data(&self, group: usize, position_us: i64) -> usize {
        if self.is_pending_reset() {
            return 0;
        }
        let (queue, loading_finished) = {
            let state = self.state.lock();
            (state.sample_queues[group].clone(), state.loading_finished)
        };
        if loading_finished && position_us > queue.largest_queued_timestamp_us() {
            queue.advance_to_end()
        } else {
            queue.advance_to(position_us)
        }
    }

    fn buffered_position_us(&self) -> i64 {
        let state = self.state.lock();
        if state.loading_finished {
            return TIME_END_OF_SOURCE;
        }
        if let Some(position) = self.pending_reset_position() {
            return position;
        }
        let mut buffered = i64::MAX;
        for (queue, enabled) in state.sample_queues.iter().zip(&state.track_group_enabled) {
            if *enabled {
                buffered = buffered.min(queue.largest_queued_timestamp_us());
            }
        }
        buffered
    }

    fn next_load_position_us(&self) -> i64 {
        if let Some(position) = self.pending_reset_position() {
            return position;
        }
        if self.state.lock().loading_finished {
            TIME_END_OF_SOURCE
        } else {
            self.buffered_position_us()
        }
    }

    fn maybe_throw_prepare_error(&self) -> Result<()> {
        self.loader.maybe_throw_error()?;
        let state = self.state.lock();
        if state.loading_finished && !state.playback {
            return Err(StreamError::PrepareInterrupted);
        }
        Ok(())
    }

    fn set_interleaved_channels(&self, channels: (u8, u8)) {
        let endpoint = Arc::new(InterleavedEndpoint::new(
            channels,
            self.packet_queue.clone(),
            self.rtcp_in.clone(),
        ));
        self.state.lock().interleaved = Some(endpoint);
    }

    fn on_interleaved_frame(&self, frame: &InterleavedFrame) {
        let endpoint = {
            let state = self.state.lock();
            if !state.prepared || state.loading_finished {
                return;
            }
            state.interleaved.clone()
        };
        if let Some(endpoint) = endpoint {
            endpoint.on_frame(frame);
        }
    }

    /// Completes preparation once every discovered queue has a format.
    /// Runs on the event loop.
    fn maybe_finish_prepare(&self) {
        let groups = {
            let mut state = self.state.lock();
            if state.released || !state.prepared || state.playback || !state.sample_queues_built {
                return;
            }
            let formats: Option<Vec<Format>> = state
                .sample_queues
                .iter()
                .map(|q| q.upstream_format())
                .collect();
            let Some(formats) = formats else {
                return;
            };

            self.load_condition.close();
            let groups = TrackGroupArray::new(formats.into_iter().map(TrackGroup::new).collect());
            state.track_groups = Some(groups.clone());
            state.playback = true;
            groups
        };

        tracing::info!(track_count = groups.len(), "media stream prepared");
        self.post_event(StreamEvent::PrepareSuccess);
    }

    fn release(&self) {
        let (loadable, queues, prepared) = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            let prepared = state.prepared;
            state.prepared = false;
            state.playback = false;
            (state.loadable.take(), state.sample_queues.clone(), prepared)
        };

        tracing::info!(url = %self.track.url, "releasing media stream");

        let release_queues = queues.clone();
        self.loader.release(Some(Box::new(move || {
            for queue in &release_queues {
                queue.release();
            }
        })));
        if let Some(loadable) = loadable {
            loadable.release();
        }

        if prepared {
            // Discard as much as we can synchronously; the queues are
            // internally synchronized against a straggling load thread.
            for queue in &queues {
                queue.discard_to_end();
            }
        }

        self.rtcp_in.close();
        self.rtcp_out.close();
        self.packet_queue.close();
        self.events.quit();
    }
}

fn set_track_group_enabled(state: &mut WrapperState, group: usize, enabled: bool) {
    assert!(
        state.track_group_enabled[group] != enabled,
        "group {group} already in state {enabled}"
    );
    state.track_group_enabled[group] = enabled;
    if enabled {
        state.enabled_sample_queue_count += 1;
    } else {
        state.enabled_sample_queue_count -= 1;
    }
}

// Track discovery, invoked by the extractor on the load thread.
impl ExtractorOutput for WrapperCore {
    fn track(&self, id: u32, track_type: TrackType) -> Arc<dyn TrackOutput> {
        let mut state = self.state.lock();
        for (i, existing) in state.sample_queue_track_ids.iter().enumerate() {
            if *existing == id {
                return state.sample_queues[i].clone();
            }
        }

        let queue = Arc::new(SampleQueue::new(self.allocator.clone(), self.drm.clone()));
        let listener: Arc<dyn UpstreamFormatChangedListener> = self.arc();
        queue.set_upstream_format_change_listener(listener);
        state.sample_queue_track_ids.push(id);
        state.sample_queue_track_types.push(track_type);
        state.sample_queues.push(queue.clone());
        state.track_group_enabled.push(false);
        tracing::debug!(id, ?track_type, "sample queue created");
        queue
    }

    fn end_tracks(&self) {
        self.state.lock().sample_queues_built = true;
        let core = self.arc();
        self.events.post(move || core.maybe_finish_prepare());
    }
}

// Format announcements, invoked on the load thread.
impl UpstreamFormatChangedListener for WrapperCore {
    fn on_upstream_format_changed(&self, _format: &Format) {
        let core = self.arc();
        self.events.post(move || core.maybe_finish_prepare());
    }
}

// Outbound RTCP: forward locally-generated reports to the interleaved
// control connection.
impl RtcpListener for WrapperCore {
    fn on_rtcp(&self, packet: &RtcpPacket) {
        let channels = {
            let state = self.state.lock();
            state.interleaved.as_ref().map(|e| e.channels())
        };
        if let Some((_, rtcp_channel)) = channels {
            self.session.on_outgoing_interleaved_frame(InterleavedFrame {
                channel: rtcp_channel,
                data: packet.bytes.clone(),
            });
        }
    }
}

// Loader outcomes, invoked on the load worker thread.
impl LoaderCallback for WrapperCore {
    fn on_load_completed(&self, _loadable: Arc<dyn Loadable>, _load_duration: Duration) {
        self.state.lock().loading_finished = true;
        self.post_event(StreamEvent::PlaybackComplete);
    }

    fn on_load_canceled(
        &self,
        _loadable: Arc<dyn Loadable>,
        _load_duration: Duration,
        released: bool,
    ) {
        if released {
            self.state.lock().loading_finished = true;
            self.post_event(StreamEvent::PlaybackCancel);
            return;
        }

        // Transport failover: restart loading in the "already open" state,
        // keeping every queued sample. TCP when the track negotiated it as
        // lower transport, UDP otherwise.
        let loadable = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            let mode =
                if self.current_transport().lower_transport == LowerTransport::TcpInterleaved {
                    LoadableMode::Interleaved
                } else {
                    LoadableMode::Udp
                };
            let loadable = Arc::new(MediaLoadable::new(self.arc(), mode, true));
            state.loadable = Some(loadable.clone());
            tracing::info!(?mode, "restarting load after cancellation");
            loadable
        };

        let callback: Arc<dyn LoaderCallback> = self.arc();
        if let Err(e) = self.loader.start_loading(loadable, callback) {
            tracing::warn!(error = %e, "failed to restart loader");
        }
    }

    fn on_load_error(
        &self,
        _loadable: Arc<dyn Loadable>,
        load_duration: Duration,
        error: &StreamError,
        _error_count: u32,
    ) -> LoadErrorAction {
        let open_failed = {
            let mut state = self.state.lock();
            state.loading_finished = true;
            state
                .loadable
                .as_ref()
                .is_some_and(|loadable| loadable.open_failed())
        };

        if open_failed {
            // Already surfaced as PrepareFailure; don't double-report.
            return LoadErrorAction::DontRetry;
        }

        let load_duration_us = load_duration.as_micros() as i64;
        let event = match self.session.duration_us() {
            // Playing past the declared end is completion, not failure.
            Some(duration_us) if load_duration_us > duration_us => StreamEvent::PlaybackComplete,
            _ => StreamEvent::PlaybackFailure(error.clone()),
        };
        self.post_event(event);
        LoadErrorAction::DontRetry
    }
}
