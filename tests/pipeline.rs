//! End-to-end pipeline scenarios: prepare over real UDP sockets, NAT
//! punching, UDP→TCP failover, and seeks, driven against fake signalling
//! and extractor collaborators.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rtsp_stream::format::mime;
use rtsp_stream::{
    Allocator, Extractor, ExtractorFactory, ExtractorOutput, Format, FormatHolder,
    InterleavedFrame, LowerTransport, MediaInput, MediaSession, MediaTrack,
    NoopDrmSessionManager, NullTransferListener, ReadAction, ReadResult, Result, RtpPacket,
    RtpPayloadFormat, SampleBuffer, SampleFlags, SampleStream, SampleStreamWrapper, StreamConfig,
    StreamEvent, TrackIdGenerator, TrackOutput, TrackTransport, TrackType, TransportProtocol,
};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Sample framing used by the test extractor: one sample per RTP payload,
/// `[flags u8][timestamp_us i64 BE][data...]`.
fn media_payload(keyframe: bool, timestamp_us: i64, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![keyframe as u8];
    payload.extend_from_slice(&timestamp_us.to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

fn rtp_datagram(sequence: u16, payload: Vec<u8>) -> Vec<u8> {
    RtpPacket {
        marker: false,
        payload_type: 96,
        sequence,
        timestamp: 0,
        ssrc: 0x4242,
        payload,
    }
    .to_bytes()
}

/// Extractor that announces one audio track on the first payload and then
/// appends one sample per payload.
struct TestExtractor {
    output: Option<Arc<dyn ExtractorOutput>>,
    track: Option<Arc<dyn TrackOutput>>,
    seeks: Arc<Mutex<Vec<i64>>>,
}

impl TestExtractor {
    fn new(seeks: Arc<Mutex<Vec<i64>>>) -> Self {
        TestExtractor {
            output: None,
            track: None,
            seeks,
        }
    }

    fn announced_format() -> Format {
        Format::builder()
            .id("test-audio")
            .sample_mime(mime::AUDIO_AAC)
            .build()
    }
}

impl Extractor for TestExtractor {
    fn sniff(&mut self, _input: &mut MediaInput) -> Result<bool> {
        Ok(true)
    }

    fn init(&mut self, output: Arc<dyn ExtractorOutput>) {
        self.output = Some(output);
    }

    fn read(&mut self, input: &mut MediaInput) -> Result<ReadAction> {
        let mut buf = [0u8; 2048];
        let n = input.read(&mut buf)?;
        if n == 0 {
            return Ok(ReadAction::EndOfInput);
        }
        if n < 9 {
            return Ok(ReadAction::Continue);
        }

        if self.track.is_none() {
            let output = self.output.clone().expect("init before read");
            let track = output.track(0, TrackType::Audio);
            track.set_format(Self::announced_format());
            output.end_tracks();
            self.track = Some(track);
        }

        let flags = if buf[0] & 1 != 0 {
            SampleFlags::KEYFRAME
        } else {
            SampleFlags::NONE
        };
        let timestamp_us = i64::from_be_bytes(buf[1..9].try_into().expect("8-byte timestamp"));
        self.track
            .as_ref()
            .expect("track announced")
            .append(timestamp_us, flags, &buf[9..n]);
        Ok(ReadAction::Continue)
    }

    fn seek(&mut self, _position: Option<u64>, time_us: i64) {
        self.seeks.lock().push(time_us);
    }
}

#[derive(Default)]
struct TestExtractorFactory {
    seeks: Arc<Mutex<Vec<i64>>>,
}

impl ExtractorFactory for TestExtractorFactory {
    fn create_rtp(
        &self,
        _payload: &RtpPayloadFormat,
        _track_ids: Arc<TrackIdGenerator>,
    ) -> Box<dyn Extractor> {
        Box::new(TestExtractor::new(self.seeks.clone()))
    }

    fn create_rtp_mp2t(&self, _flags: u32) -> Box<dyn Extractor> {
        Box::new(TestExtractor::new(self.seeks.clone()))
    }

    fn create_mp2t(&self, _flags: u32) -> Box<dyn Extractor> {
        Box::new(TestExtractor::new(self.seeks.clone()))
    }

    fn create_raw_candidates(&self) -> Vec<Box<dyn Extractor>> {
        vec![Box::new(TestExtractor::new(self.seeks.clone()))]
    }
}

struct FakeSession {
    interleaved: bool,
    nat_required: bool,
    rtcp_supported: bool,
    rtcp_muxed: bool,
    paused: AtomicBool,
    duration_us: Option<i64>,
    selections: Mutex<Vec<(Vec<TrackType>, Vec<bool>)>>,
}

impl FakeSession {
    fn base(interleaved: bool) -> FakeSession {
        FakeSession {
            interleaved,
            nat_required: false,
            rtcp_supported: false,
            rtcp_muxed: false,
            // Paused sessions swallow read timeouts, keeping quiet test
            // periods from surfacing as playback failures.
            paused: AtomicBool::new(true),
            duration_us: None,
            selections: Mutex::new(Vec::new()),
        }
    }

    fn udp() -> Arc<FakeSession> {
        Arc::new(Self::base(false))
    }

    fn interleaved() -> Arc<FakeSession> {
        Arc::new(Self::base(true))
    }
}

impl MediaSession for FakeSession {
    fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    fn is_nat_required(&self) -> bool {
        self.nat_required
    }

    fn is_rtcp_supported(&self) -> bool {
        self.rtcp_supported
    }

    fn is_rtcp_muxed(&self) -> bool {
        self.rtcp_muxed
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    fn on_select_tracks(&self, track_types: &[TrackType], enabled: &[bool]) {
        self.selections
            .lock()
            .push((track_types.to_vec(), enabled.to_vec()));
    }

    fn on_outgoing_interleaved_frame(&self, _frame: InterleavedFrame) {}
}

fn audio_track(transport: TrackTransport) -> MediaTrack {
    MediaTrack {
        url: "rtsp://127.0.0.1/stream/track1".to_string(),
        transport,
        payload: RtpPayloadFormat {
            payload_type: 96,
            clock_rate: 48_000,
            format: Format::builder().sample_mime(mime::AUDIO_AAC).build(),
        },
        muxed: false,
    }
}

fn event_tag(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::PrepareStarted => "prepare_started",
        StreamEvent::PrepareFailure(_) => "prepare_failure",
        StreamEvent::PrepareSuccess => "prepare_success",
        StreamEvent::PlaybackCancel => "playback_cancel",
        StreamEvent::PlaybackComplete => "playback_complete",
        StreamEvent::PlaybackFailure(_) => "playback_failure",
    }
}

struct Harness {
    wrapper: SampleStreamWrapper,
    events: mpsc::Receiver<&'static str>,
    seeks: Arc<Mutex<Vec<i64>>>,
    session: Arc<FakeSession>,
}

impl Harness {
    fn new(session: Arc<FakeSession>, track: MediaTrack) -> Harness {
        init_tracing();
        let (tx, rx) = mpsc::channel();
        let factory = Arc::new(TestExtractorFactory::default());
        let seeks = factory.seeks.clone();
        let wrapper = SampleStreamWrapper::new(
            session.clone(),
            track,
            Box::new(move |event: StreamEvent| {
                let _ = tx.send(event_tag(&event));
            }),
            StreamConfig {
                read_timeout: Duration::from_millis(200),
                min_retry_delay: Duration::from_millis(10),
                position_us: 0,
            },
            Allocator::new(),
            Arc::new(NoopDrmSessionManager),
            Arc::new(NullTransferListener),
            factory,
            Arc::new(TrackIdGenerator::new(1)),
        )
        .expect("wrapper construction");
        Harness {
            wrapper,
            events: rx,
            seeks,
            session,
        }
    }

    /// Wait for a specific event, collecting the tags seen on the way.
    fn wait_for(&self, wanted: &str) -> Vec<&'static str> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {wanted}, saw {seen:?}"));
            let tag = self
                .events
                .recv_timeout(remaining)
                .unwrap_or_else(|_| panic!("timed out waiting for {wanted}, saw {seen:?}"));
            if tag == wanted {
                return seen;
            }
            seen.push(tag);
        }
    }

    fn drain_events(&self) -> Vec<&'static str> {
        let mut seen = Vec::new();
        while let Ok(tag) = self.events.try_recv() {
            seen.push(tag);
        }
        seen
    }

    /// Read, retrying while nothing is buffered yet.
    fn read_with_retry(&self, stream: &SampleStream) -> (ReadResult, FormatHolder, SampleBuffer) {
        let deadline = Instant::now() + WAIT;
        loop {
            let mut holder = FormatHolder::default();
            let mut buffer = SampleBuffer::default();
            match stream.read_data(&mut holder, &mut buffer, false) {
                ReadResult::NothingRead if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                result => return (result, holder, buffer),
            }
        }
    }

    fn select_single_track(&self) -> SampleStream {
        let mut streams = [None];
        let mut reset_flags = [false];
        self.wrapper
            .select_tracks(&[Some(0)], &[false], &mut streams, &mut reset_flags, 0);
        assert!(reset_flags[0], "newly selected stream must be flagged reset");
        streams[0].take().expect("stream handle created")
    }
}

/// Sends crafted RTP datagrams at the wrapper's local UDP port.
struct UdpFeeder {
    socket: UdpSocket,
    port: u16,
    sequence: u16,
}

impl UdpFeeder {
    fn new(wrapper: &SampleStreamWrapper) -> UdpFeeder {
        let port = wrapper.local_port().expect("local port bound");
        UdpFeeder {
            socket: UdpSocket::bind("127.0.0.1:0").expect("feeder socket"),
            port,
            sequence: 1,
        }
    }

    fn send(&mut self, keyframe: bool, timestamp_us: i64, data: &[u8]) {
        let datagram = rtp_datagram(self.sequence, media_payload(keyframe, timestamp_us, data));
        self.sequence += 1;
        self.socket
            .send_to(&datagram, ("127.0.0.1", self.port))
            .expect("send datagram");
    }
}

#[test]
fn clean_udp_prepare_produces_single_track_group() {
    let harness = Harness::new(FakeSession::udp(), audio_track(TrackTransport::rtp_udp()));

    harness.wrapper.prepare();
    harness.wait_for("prepare_started");

    let port = harness.wrapper.local_port().expect("local port bound");
    assert_eq!(port % 2, 0, "local RTP port must be even");
    assert!((50_000..60_000).contains(&port), "port {port} out of range");

    harness.wrapper.playback();
    let mut feeder = UdpFeeder::new(&harness.wrapper);
    feeder.send(true, 0, b"s0");
    feeder.send(false, 20_000, b"s1");
    feeder.send(false, 40_000, b"s2");

    let before_success = harness.wait_for("prepare_success");
    assert!(
        !before_success.contains(&"prepare_failure"),
        "unexpected failure before success: {before_success:?}"
    );

    let groups = harness.wrapper.track_groups().expect("track groups built");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups.get(0).len(), 1);
    assert_eq!(groups.get(0).format(0).id.as_deref(), Some("test-audio"));

    let stream = harness.select_single_track();
    assert_eq!(harness.wrapper.enabled_sample_queue_count(), 1);
    {
        let selections = harness.session.selections.lock();
        assert_eq!(
            selections.last(),
            Some(&(vec![TrackType::Audio], vec![true]))
        );
    }

    let (result, holder, _) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::FormatRead);
    assert_eq!(holder.format.unwrap().id.as_deref(), Some("test-audio"));

    let (result, _, buffer) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::BufferRead);
    assert_eq!(buffer.timestamp_us, 0);
    assert!(buffer.is_keyframe());
    assert_eq!(buffer.data, b"s0");

    // Remaining samples are at 20ms and 40ms; skipping to 40ms drops one.
    let deadline = Instant::now() + WAIT;
    while harness.wrapper.buffered_position_us() < 40_000 {
        assert!(Instant::now() < deadline, "trailing samples never buffered");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(stream.skip_data(40_000), 1);
}

#[test]
fn nat_punch_sends_magic_twice_per_server_port() {
    let rtp_receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
    for receiver in [&rtp_receiver, &rtcp_receiver] {
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }

    let mut transport = TrackTransport::rtp_udp();
    transport.server_ports = vec![
        rtp_receiver.local_addr().unwrap().port(),
        rtcp_receiver.local_addr().unwrap().port(),
    ];

    let session = Arc::new(FakeSession {
        interleaved: false,
        nat_required: true,
        rtcp_supported: true,
        rtcp_muxed: false,
        paused: AtomicBool::new(true),
        duration_us: None,
        selections: Mutex::new(Vec::new()),
    });
    let harness = Harness::new(session, audio_track(transport));

    harness.wrapper.prepare();
    harness.wait_for("prepare_started");
    harness.wrapper.playback();

    for (name, receiver) in [("rtp", &rtp_receiver), ("rtcp", &rtcp_receiver)] {
        for i in 0..2 {
            let mut buf = [0u8; 16];
            let (n, _) = receiver
                .recv_from(&mut buf)
                .unwrap_or_else(|e| panic!("{name} punch {i} missing: {e}"));
            assert_eq!(&buf[..n], &[0xCE, 0xFA, 0xED, 0xFE], "{name} punch {i}");
        }
        receiver
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert!(
            receiver.recv_from(&mut buf).is_err(),
            "{name} received a third punch"
        );
    }
}

#[test]
fn udp_to_tcp_failover_retains_sample_queues() {
    let harness = Harness::new(FakeSession::udp(), audio_track(TrackTransport::rtp_udp()));

    harness.wrapper.prepare();
    harness.wait_for("prepare_started");
    harness.wrapper.playback();

    let mut feeder = UdpFeeder::new(&harness.wrapper);
    feeder.send(true, 0, b"s0");
    feeder.send(false, 20_000, b"s1");
    harness.wait_for("prepare_success");
    let stream = harness.select_single_track();

    // Signalling renegotiates the transport to TCP interleaved, then
    // cancels the load; the wrapper must fail over without resetting.
    harness.wrapper.set_interleaved_channels((0, 1));
    harness
        .wrapper
        .update_transport(TrackTransport::rtp_interleaved((0, 1)));
    harness.wrapper.prepare();

    // New media arrives over the control connection.
    harness.wrapper.on_interleaved_frame(&InterleavedFrame {
        channel: 0,
        data: rtp_datagram(50, media_payload(false, 40_000, b"s2")),
    });

    // Samples queued before the failover are still consumable...
    let (result, _, _) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::FormatRead);
    for (expected_ts, expected_data) in [(0, b"s0" as &[u8]), (20_000, b"s1")] {
        let (result, _, buffer) = harness.read_with_retry(&stream);
        assert_eq!(result, ReadResult::BufferRead);
        assert_eq!(buffer.timestamp_us, expected_ts);
        assert_eq!(buffer.data, expected_data);
    }

    // ...and the TCP loadable keeps feeding the same queue.
    let (result, _, buffer) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::BufferRead);
    assert_eq!(buffer.timestamp_us, 40_000);
    assert_eq!(buffer.data, b"s2");

    let seen = harness.drain_events();
    assert!(
        !seen.contains(&"prepare_failure"),
        "failover must not surface a prepare failure: {seen:?}"
    );
}

#[test]
fn seek_within_and_beyond_buffer() {
    let harness = Harness::new(FakeSession::udp(), audio_track(TrackTransport::rtp_udp()));

    harness.wrapper.prepare();
    harness.wait_for("prepare_started");
    harness.wrapper.playback();

    // Keyframes at 0s, 1s, 2s with inter-frames between.
    let mut feeder = UdpFeeder::new(&harness.wrapper);
    for second in 0..3i64 {
        feeder.send(true, second * 1_000_000, b"k");
        feeder.send(false, second * 1_000_000 + 500_000, b"i");
    }
    harness.wait_for("prepare_success");
    let stream = harness.select_single_track();

    // Wait until everything sent is buffered.
    let deadline = Instant::now() + WAIT;
    while harness.wrapper.buffered_position_us() < 2_500_000 {
        assert!(Instant::now() < deadline, "samples never fully buffered");
        std::thread::sleep(Duration::from_millis(20));
    }

    // In-buffer seek: lands on the 1s keyframe, no reset.
    assert!(!harness.wrapper.seek_to_us(1_500_000));
    assert_eq!(harness.wrapper.pending_reset_position_us(), None);
    let (result, _, _) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::FormatRead);
    let (result, _, buffer) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::BufferRead);
    assert_eq!(buffer.timestamp_us, 1_000_000);
    assert!(buffer.is_keyframe());

    // Out-of-buffer seek: queues reset, extractor asked to seek.
    assert!(harness.wrapper.seek_to_us(10_000_000));
    assert_eq!(
        harness.wrapper.pending_reset_position_us(),
        Some(10_000_000)
    );
    assert!(!stream.is_ready(), "pending reset must gate readiness");
    {
        let mut holder = FormatHolder::default();
        let mut buffer = SampleBuffer::default();
        assert_eq!(
            stream.read_data(&mut holder, &mut buffer, false),
            ReadResult::NothingRead
        );
    }

    harness.wrapper.on_session_seek();
    let deadline = Instant::now() + WAIT;
    while harness.wrapper.pending_reset_position_us().is_some() {
        assert!(Instant::now() < deadline, "pending reset never serviced");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(&*harness.seeks.lock(), &[10_000_000]);
}

#[test]
fn interleaved_prepare_reads_frames_from_control_connection() {
    let harness = Harness::new(
        FakeSession::interleaved(),
        audio_track(TrackTransport::rtp_interleaved((0, 1))),
    );
    harness.wrapper.set_interleaved_channels((0, 1));

    harness.wrapper.prepare();
    harness.wait_for("prepare_started");
    harness.wrapper.playback();

    harness.wrapper.on_interleaved_frame(&InterleavedFrame {
        channel: 0,
        data: rtp_datagram(1, media_payload(true, 0, b"tcp0")),
    });
    harness.wait_for("prepare_success");

    let stream = harness.select_single_track();
    let (result, _, _) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::FormatRead);
    let (result, _, buffer) = harness.read_with_retry(&stream);
    assert_eq!(result, ReadResult::BufferRead);
    assert_eq!(buffer.data, b"tcp0");
}

#[test]
fn interleaved_non_rtp_transport_fails_prepare() {
    let transport = TrackTransport {
        lower_transport: LowerTransport::TcpInterleaved,
        protocol: TransportProtocol::Mp2t,
        ssrc: None,
        source: None,
        destination: None,
        server_ports: Vec::new(),
        interleaved: Some((0, 1)),
    };
    let harness = Harness::new(FakeSession::interleaved(), audio_track(transport));

    harness.wrapper.prepare();
    let seen = harness.wait_for("prepare_failure");
    assert!(
        !seen.contains(&"prepare_started"),
        "open must fail before announcing prepare start: {seen:?}"
    );

    // The loader records its terminal error shortly after the event.
    let deadline = Instant::now() + WAIT;
    while harness.wrapper.maybe_throw_prepare_error().is_ok() {
        assert!(Instant::now() < deadline, "prepare error never surfaced");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn release_is_idempotent_and_blocks_restart() {
    let harness = Harness::new(FakeSession::udp(), audio_track(TrackTransport::rtp_udp()));
    harness.wrapper.prepare();
    harness.wait_for("prepare_started");

    harness.wrapper.release();
    harness.wrapper.release();

    // Preparing or playing after release must not spawn new work.
    harness.wrapper.prepare();
    harness.wrapper.playback();
    let deadline = Instant::now() + WAIT;
    while harness.wrapper.is_loading() {
        assert!(Instant::now() < deadline, "loader still running after release");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn select_tracks_tracks_enabled_count() {
    let harness = Harness::new(FakeSession::udp(), audio_track(TrackTransport::rtp_udp()));
    harness.wrapper.prepare();
    harness.wait_for("prepare_started");
    harness.wrapper.playback();
    let mut feeder = UdpFeeder::new(&harness.wrapper);
    feeder.send(true, 0, b"s0");
    harness.wait_for("prepare_success");

    let mut streams = [None];
    let mut reset_flags = [false];
    harness
        .wrapper
        .select_tracks(&[Some(0)], &[false], &mut streams, &mut reset_flags, 0);
    assert!(streams[0].is_some());
    assert_eq!(harness.wrapper.enabled_sample_queue_count(), 1);

    // Clearing the selection disables the queue again.
    let mut reset_flags = [false];
    harness
        .wrapper
        .select_tracks(&[None], &[false], &mut streams, &mut reset_flags, 0);
    assert!(streams[0].is_none());
    assert_eq!(harness.wrapper.enabled_sample_queue_count(), 0);

    let selections = harness.session.selections.lock();
    assert_eq!(selections.len(), 2);
    assert_eq!(selections[1].1, vec![false]);
}
