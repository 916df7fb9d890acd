//! Extractor contracts: the state-machine interface that turns a media
//! byte stream into typed samples, the peekable input it reads from, and
//! the selection logic that picks an extractor for a track.
//!
//! Byte-level extractor implementations (MP2T demuxing, RTP depacketizers)
//! live outside this crate behind [`ExtractorFactory`]; this module owns
//! the contracts and the drive loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, StreamError};
use crate::format::{Format, TrackType, mime};
use crate::sample::{SampleFlags, SampleQueue};
use crate::session::RtpPayloadFormat;
use crate::transport::{MediaSource, TransportProtocol};

/// MP2T extractor flag: treat non-IDR slices as keyframes. Live RTSP
/// cameras frequently never send IDR frames.
pub const TS_FLAG_ALLOW_NON_IDR_KEYFRAMES: u32 = 1;

/// Monotonic source of unique track ids, shared across extractors.
pub struct TrackIdGenerator {
    next: AtomicU32,
}

impl TrackIdGenerator {
    pub fn new(first_id: u32) -> Self {
        TrackIdGenerator {
            next: AtomicU32::new(first_id),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Write side of one elementary track, implemented by
/// [`SampleQueue`].
pub trait TrackOutput: Send + Sync {
    /// Announce the upstream format of subsequent samples.
    fn set_format(&self, format: Format);

    /// Append one complete sample.
    fn append(&self, timestamp_us: i64, flags: SampleFlags, data: &[u8]);
}

impl TrackOutput for SampleQueue {
    fn set_format(&self, format: Format) {
        SampleQueue::set_format(self, format);
    }

    fn append(&self, timestamp_us: i64, flags: SampleFlags, data: &[u8]) {
        SampleQueue::append(self, timestamp_us, flags, data);
    }
}

/// Receives track discovery from an extractor. `track` lazily creates one
/// output per unique id; `end_tracks` signals that no further tracks will
/// be discovered.
pub trait ExtractorOutput: Send + Sync {
    fn track(&self, id: u32, track_type: TrackType) -> Arc<dyn TrackOutput>;
    fn end_tracks(&self);
}

/// Outcome of one extractor read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    /// More input may be consumed immediately.
    Continue,
    /// The input is exhausted; the load is complete.
    EndOfInput,
    /// The extractor requires the input repositioned before continuing.
    Seek(u64),
}

/// A media extractor state machine.
pub trait Extractor: Send {
    /// Cheap content probe: whether this extractor can read the stream.
    /// Must only peek, never consume.
    fn sniff(&mut self, input: &mut MediaInput) -> Result<bool>;

    /// Supply the output the extractor announces tracks and samples to.
    /// Called once, before the first `read`.
    fn init(&mut self, output: Arc<dyn ExtractorOutput>);

    /// Consume some input, advancing the state machine.
    fn read(&mut self, input: &mut MediaInput) -> Result<ReadAction>;

    /// Reposition the state machine to the given media time.
    fn seek(&mut self, position: Option<u64>, time_us: i64);

    /// Drop any held resources. The extractor is not used again.
    fn release(&mut self) {}
}

/// Positioned, peekable reader over a [`MediaSource`].
///
/// Peeked bytes are buffered and re-served to `read`, so sniffing never
/// loses data; `reset_peek` rewinds the peek cursor between sniff
/// attempts.
pub struct MediaInput {
    source: Box<dyn MediaSource>,
    position: u64,
    peeked: Vec<u8>,
    peek_offset: usize,
}

impl MediaInput {
    pub fn new(source: Box<dyn MediaSource>) -> Self {
        MediaInput {
            source,
            position: 0,
            peeked: Vec::new(),
            peek_offset: 0,
        }
    }

    /// Absolute read position in bytes.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read up to `buf.len()` bytes, serving previously peeked bytes
    /// first. `Ok(0)` is end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.peeked.is_empty() {
            let n = buf.len().min(self.peeked.len());
            buf[..n].copy_from_slice(&self.peeked[..n]);
            self.peeked.drain(..n);
            self.peek_offset = self.peek_offset.saturating_sub(n);
            self.position += n as u64;
            return Ok(n);
        }
        let n = self.source.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes or fail with `UnexpectedEof`.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                0 => return Err(StreamError::UnexpectedEof),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Peek up to `buf.len()` bytes ahead of the read position without
    /// consuming them. Successive peeks advance the peek cursor.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.peeked.len() - self.peek_offset < buf.len() {
            let mut chunk = [0u8; 4096];
            let n = self.source.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            self.peeked.extend_from_slice(&chunk[..n]);
        }
        let available = self.peeked.len() - self.peek_offset;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.peeked[self.peek_offset..self.peek_offset + n]);
        self.peek_offset += n;
        Ok(n)
    }

    /// Peek exactly `buf.len()` bytes or fail with `UnexpectedEof`.
    pub fn peek_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.peek(buf)?;
        if n < buf.len() {
            return Err(StreamError::UnexpectedEof);
        }
        Ok(())
    }

    /// Rewind the peek cursor to the read position.
    pub fn reset_peek(&mut self) {
        self.peek_offset = 0;
    }

    /// Consume and discard up to `count` bytes. Returns the number
    /// skipped (0 at end of stream).
    pub fn skip(&mut self, count: usize) -> Result<usize> {
        let mut scratch = [0u8; 4096];
        let mut skipped = 0;
        while skipped < count {
            let want = (count - skipped).min(scratch.len());
            match self.read(&mut scratch[..want])? {
                0 => break,
                n => skipped += n,
            }
        }
        Ok(skipped)
    }
}

/// Creates the byte-level extractor implementations. The pipeline treats
/// them as opaque state machines behind [`Extractor`].
pub trait ExtractorFactory: Send + Sync {
    /// Generic RTP depacketizing extractor for the given payload format.
    fn create_rtp(
        &self,
        payload: &RtpPayloadFormat,
        track_ids: Arc<TrackIdGenerator>,
    ) -> Box<dyn Extractor>;

    /// Extractor for MPEG-2 TS framed in RTP payloads.
    fn create_rtp_mp2t(&self, flags: u32) -> Box<dyn Extractor>;

    /// Plain MPEG-2 TS extractor.
    fn create_mp2t(&self, flags: u32) -> Box<dyn Extractor>;

    /// Sniff candidates for RAW transports, in probe order.
    fn create_raw_candidates(&self) -> Vec<Box<dyn Extractor>>;
}

/// Picks an extractor for `(protocol, sample MIME)`. Returns `None` for
/// RAW transports, which are resolved by [`sniff_raw`] instead.
pub fn select_extractor(
    factory: &dyn ExtractorFactory,
    protocol: TransportProtocol,
    payload: &RtpPayloadFormat,
    track_ids: Arc<TrackIdGenerator>,
) -> Option<Box<dyn Extractor>> {
    match protocol {
        TransportProtocol::Rtp => {
            if payload.format.sample_mime.as_deref() == Some(mime::VIDEO_MP2T) {
                Some(factory.create_rtp_mp2t(TS_FLAG_ALLOW_NON_IDR_KEYFRAMES))
            } else {
                Some(factory.create_rtp(payload, track_ids))
            }
        }
        TransportProtocol::Mp2t => Some(factory.create_mp2t(TS_FLAG_ALLOW_NON_IDR_KEYFRAMES)),
        TransportProtocol::Raw => None,
    }
}

/// Probes the factory's raw candidates against the input. The first
/// extractor whose sniff succeeds wins; a sniff that runs out of input
/// skips that candidate. The peek position is reset between attempts.
pub fn sniff_raw(
    factory: &dyn ExtractorFactory,
    input: &mut MediaInput,
) -> Result<Box<dyn Extractor>> {
    for mut candidate in factory.create_raw_candidates() {
        let sniffed = candidate.sniff(input);
        input.reset_peek();
        match sniffed {
            Ok(true) => return Ok(candidate),
            Ok(false) => {}
            Err(StreamError::UnexpectedEof) => {}
            Err(e) => return Err(e),
        }
    }
    Err(StreamError::UnsupportedFormat(
        "no extractor accepted the raw stream".into(),
    ))
}

/// Drives a selected extractor over its input, translating `Seek` yields
/// into input repositioning.
pub struct ExtractorDriver {
    extractor: Box<dyn Extractor>,
    input: MediaInput,
}

impl ExtractorDriver {
    pub fn new(extractor: Box<dyn Extractor>, input: MediaInput) -> Self {
        ExtractorDriver { extractor, input }
    }

    pub fn init(&mut self, output: Arc<dyn ExtractorOutput>) {
        self.extractor.init(output);
    }

    /// One iteration of the drive loop.
    pub fn read(&mut self) -> Result<ReadAction> {
        match self.extractor.read(&mut self.input)? {
            ReadAction::Seek(target) => {
                let position = self.input.position();
                if target < position {
                    // Network inputs cannot rewind.
                    return Err(StreamError::Io(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        format!("extractor requested rewind from {position} to {target}"),
                    ))));
                }
                self.input.skip((target - position) as usize)?;
                Ok(ReadAction::Continue)
            }
            action => Ok(action),
        }
    }

    /// Reposition the extractor to the given media time.
    pub fn seek(&mut self, time_us: i64) {
        self.extractor.seek(None, time_us);
    }

    pub fn release(&mut self) {
        self.extractor.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Source serving a fixed byte script.
    struct ScriptedSource {
        data: Vec<u8>,
        offset: usize,
    }

    impl ScriptedSource {
        fn new(data: &[u8]) -> Self {
            ScriptedSource {
                data: data.to_vec(),
                offset: 0,
            }
        }
    }

    impl MediaSource for ScriptedSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.data.len() - self.offset);
            buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
            self.offset += n;
            Ok(n)
        }
    }

    fn input(data: &[u8]) -> MediaInput {
        MediaInput::new(Box::new(ScriptedSource::new(data)))
    }

    #[test]
    fn peeked_bytes_are_reserved_for_read() {
        let mut input = input(b"abcdef");
        let mut peek = [0u8; 3];
        input.peek_fully(&mut peek).unwrap();
        assert_eq!(&peek, b"abc");
        assert_eq!(input.position(), 0);

        // Reads serve the peeked prefix first.
        let mut read = [0u8; 4];
        assert_eq!(input.read(&mut read).unwrap(), 3);
        assert_eq!(&read[..3], b"abc");
        assert_eq!(input.read(&mut read).unwrap(), 3);
        assert_eq!(&read[..3], b"def");
        assert_eq!(input.position(), 6);
    }

    #[test]
    fn reset_peek_rewinds_cursor() {
        let mut input = input(b"abcdef");
        let mut peek = [0u8; 2];
        input.peek_fully(&mut peek).unwrap();
        input.reset_peek();
        input.peek_fully(&mut peek).unwrap();
        assert_eq!(&peek, b"ab");
    }

    #[test]
    fn peek_fully_past_end_is_unexpected_eof() {
        let mut input = input(b"ab");
        let mut peek = [0u8; 4];
        assert!(matches!(
            input.peek_fully(&mut peek),
            Err(StreamError::UnexpectedEof)
        ));
    }

    #[test]
    fn skip_consumes_bytes() {
        let mut input = input(b"abcdef");
        assert_eq!(input.skip(4).unwrap(), 4);
        let mut read = [0u8; 4];
        assert_eq!(input.read(&mut read).unwrap(), 2);
        assert_eq!(&read[..2], b"ef");
        assert_eq!(input.skip(10).unwrap(), 0);
    }

    /// Extractor that accepts streams starting with a magic byte.
    struct MagicExtractor {
        magic: u8,
        need: usize,
    }

    impl Extractor for MagicExtractor {
        fn sniff(&mut self, input: &mut MediaInput) -> Result<bool> {
            let mut probe = vec![0u8; self.need];
            input.peek_fully(&mut probe)?;
            Ok(probe[0] == self.magic)
        }

        fn init(&mut self, _output: Arc<dyn ExtractorOutput>) {}

        fn read(&mut self, _input: &mut MediaInput) -> Result<ReadAction> {
            Ok(ReadAction::EndOfInput)
        }

        fn seek(&mut self, _position: Option<u64>, _time_us: i64) {}
    }

    struct MagicFactory;

    impl ExtractorFactory for MagicFactory {
        fn create_rtp(
            &self,
            _payload: &RtpPayloadFormat,
            _track_ids: Arc<TrackIdGenerator>,
        ) -> Box<dyn Extractor> {
            Box::new(MagicExtractor { magic: 0, need: 1 })
        }

        fn create_rtp_mp2t(&self, _flags: u32) -> Box<dyn Extractor> {
            Box::new(MagicExtractor { magic: 0, need: 1 })
        }

        fn create_mp2t(&self, _flags: u32) -> Box<dyn Extractor> {
            Box::new(MagicExtractor { magic: 0, need: 1 })
        }

        fn create_raw_candidates(&self) -> Vec<Box<dyn Extractor>> {
            vec![
                // Wants more bytes than the stream has: skipped via EOF.
                Box::new(MagicExtractor {
                    magic: b'x',
                    need: 64,
                }),
                Box::new(MagicExtractor {
                    magic: b'n',
                    need: 2,
                }),
                Box::new(MagicExtractor {
                    magic: b'm',
                    need: 2,
                }),
            ]
        }
    }

    #[test]
    fn sniff_raw_skips_eof_and_picks_first_match() {
        let mut input = input(b"magic-stream");
        let extractor = sniff_raw(&MagicFactory, &mut input).unwrap();
        drop(extractor);
        // The winning sniff only peeked; the stream is intact.
        let mut read = [0u8; 5];
        input.read_fully(&mut read).unwrap();
        assert_eq!(&read, b"magic");
    }

    #[test]
    fn sniff_raw_rejects_unknown_stream() {
        let mut input = input(b"zz");
        assert!(matches!(
            sniff_raw(&MagicFactory, &mut input),
            Err(StreamError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn selection_is_pure_in_protocol_and_mime() {
        let ids = Arc::new(TrackIdGenerator::new(1));
        let payload_aac = RtpPayloadFormat {
            payload_type: 96,
            clock_rate: 48_000,
            format: Format::builder().sample_mime(mime::AUDIO_AAC).build(),
        };
        let payload_ts = RtpPayloadFormat {
            payload_type: 33,
            clock_rate: 90_000,
            format: Format::builder().sample_mime(mime::VIDEO_MP2T).build(),
        };

        assert!(select_extractor(&MagicFactory, TransportProtocol::Rtp, &payload_aac, ids.clone()).is_some());
        assert!(select_extractor(&MagicFactory, TransportProtocol::Rtp, &payload_ts, ids.clone()).is_some());
        assert!(select_extractor(&MagicFactory, TransportProtocol::Mp2t, &payload_ts, ids.clone()).is_some());
        assert!(select_extractor(&MagicFactory, TransportProtocol::Raw, &payload_ts, ids).is_none());
    }

    /// Extractor that asks for a forward seek once, then finishes.
    struct SeekOnce {
        asked: Mutex<bool>,
    }

    impl Extractor for SeekOnce {
        fn sniff(&mut self, _input: &mut MediaInput) -> Result<bool> {
            Ok(true)
        }

        fn init(&mut self, _output: Arc<dyn ExtractorOutput>) {}

        fn read(&mut self, input: &mut MediaInput) -> Result<ReadAction> {
            let mut asked = self.asked.lock().unwrap();
            if !*asked {
                *asked = true;
                return Ok(ReadAction::Seek(input.position() + 4));
            }
            Ok(ReadAction::EndOfInput)
        }

        fn seek(&mut self, _position: Option<u64>, _time_us: i64) {}
    }

    #[test]
    fn driver_honors_forward_seek() {
        let driver_input = input(b"abcdefgh");
        let mut driver = ExtractorDriver::new(
            Box::new(SeekOnce {
                asked: Mutex::new(false),
            }),
            driver_input,
        );
        assert_eq!(driver.read().unwrap(), ReadAction::Continue);
        assert_eq!(driver.read().unwrap(), ReadAction::EndOfInput);
        assert_eq!(driver.input.position(), 4);
    }

    #[test]
    fn track_id_generator_is_monotonic() {
        let ids = TrackIdGenerator::new(5);
        assert_eq!(ids.next_id(), 5);
        assert_eq!(ids.next_id(), 6);
        assert_eq!(ids.next_id(), 7);
    }
}
