//! Per-track sample queues with in-buffer seek semantics, plus the
//! allocator and the read-side records shared with the consumer.
//!
//! A [`SampleQueue`] is single-writer (the loader thread appends samples in
//! arrival order) and multi-reader (the consumer reads, skips, seeks and
//! discards). All synchronization is internal to the queue; a reader never
//! observes a partially-appended sample.
//!
//! ## Lifecycle
//!
//! ```text
//! constructed -> receiving -> flushed (reset) -> released
//! ```
//!
//! After [`reset`](SampleQueue::reset) the queue is empty and the upstream
//! format must be re-announced before the first subsequent read.

use std::collections::VecDeque;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::format::Format;

/// Sentinel for an unset time value.
pub const TIME_UNSET: i64 = i64::MIN + 1;

/// Position reported once loading has finished and the buffer is drained.
pub const TIME_END_OF_SOURCE: i64 = i64::MIN;

/// Per-sample flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags(0);
    /// The sample is a random access point.
    pub const KEYFRAME: SampleFlags = SampleFlags(1);
    /// The buffer marks the end of the stream (read side only).
    pub const END_OF_STREAM: SampleFlags = SampleFlags(1 << 2);

    pub fn contains(self, other: SampleFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SampleFlags {
    type Output = SampleFlags;

    fn bitor(self, rhs: SampleFlags) -> SampleFlags {
        SampleFlags(self.0 | rhs.0)
    }
}

/// A decoded-ready sample handed to the consumer.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    pub timestamp_us: i64,
    pub flags: SampleFlags,
    pub data: Vec<u8>,
}

impl SampleBuffer {
    pub fn clear(&mut self) {
        self.timestamp_us = 0;
        self.flags = SampleFlags::NONE;
        self.data.clear();
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(SampleFlags::KEYFRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(SampleFlags::END_OF_STREAM)
    }
}

/// Receives the format on format-change reads.
#[derive(Debug, Default)]
pub struct FormatHolder {
    pub format: Option<Format>,
}

/// Outcome of a [`SampleQueue::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    NothingRead,
    FormatRead,
    BufferRead,
    EndOfStream,
}

/// Thread-safe byte-budget tracker backing sample payloads.
///
/// Payload buffers are owned by the queues; the allocator accounts for
/// their total size so the coordinator can observe memory pressure.
#[derive(Clone, Default)]
pub struct Allocator {
    allocated: Arc<AtomicUsize>,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator::default()
    }

    /// Copy `data` into a tracked payload buffer.
    pub fn copy(&self, data: &[u8]) -> Vec<u8> {
        self.allocated.fetch_add(data.len(), Ordering::Relaxed);
        data.to_vec()
    }

    /// Return `len` payload bytes to the budget.
    pub fn release(&self, len: usize) {
        self.allocated.fetch_sub(len, Ordering::Relaxed);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Opaque DRM collaborator notified when DRM-protected formats appear.
pub trait DrmSessionManager: Send + Sync {
    fn on_drm_format(&self, format: &Format);
}

/// Default no-op DRM collaborator.
pub struct NoopDrmSessionManager;

impl DrmSessionManager for NoopDrmSessionManager {
    fn on_drm_format(&self, _format: &Format) {}
}

/// Observes upstream format changes on a queue. Invoked on the writer
/// (loader) thread.
pub trait UpstreamFormatChangedListener: Send + Sync {
    fn on_upstream_format_changed(&self, format: &Format);
}

struct QueuedSample {
    timestamp_us: i64,
    flags: SampleFlags,
    data: Vec<u8>,
    format: Arc<Format>,
}

struct QueueState {
    samples: VecDeque<QueuedSample>,
    /// Read cursor, relative to the front of `samples`.
    read_index: usize,
    upstream_format: Option<Arc<Format>>,
    /// Format most recently delivered to the reader; a differing sample
    /// format forces a format read before the sample itself.
    last_read_format: Option<Arc<Format>>,
    largest_queued_timestamp_us: i64,
    listener: Option<Arc<dyn UpstreamFormatChangedListener>>,
    released: bool,
}

/// Ring of media samples for one elementary track.
///
/// Samples are appended in arrival order (not timestamp order); the queue
/// tracks the largest queued timestamp, which is non-decreasing within an
/// epoch bounded by [`reset`](Self::reset). Format announcements are
/// deduplicated on the writer side and delivered to readers before the
/// first sample they apply to.
pub struct SampleQueue {
    allocator: Allocator,
    drm: Arc<dyn DrmSessionManager>,
    state: Mutex<QueueState>,
}

impl SampleQueue {
    pub fn new(allocator: Allocator, drm: Arc<dyn DrmSessionManager>) -> Self {
        SampleQueue {
            allocator,
            drm,
            state: Mutex::new(QueueState {
                samples: VecDeque::new(),
                read_index: 0,
                upstream_format: None,
                last_read_format: None,
                largest_queued_timestamp_us: i64::MIN,
                listener: None,
                released: false,
            }),
        }
    }

    pub fn set_upstream_format_change_listener(
        &self,
        listener: Arc<dyn UpstreamFormatChangedListener>,
    ) {
        self.state.lock().listener = Some(listener);
    }

    // Writer side. Called only by the loading thread.

    /// Announce the upstream format. A format equal to the current one is
    /// a no-op; a new format is reported to the listener and delivered to
    /// readers before the next sample.
    pub fn set_format(&self, format: Format) {
        let (listener, announced) = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            if state
                .upstream_format
                .as_deref()
                .is_some_and(|current| *current == format)
            {
                return;
            }
            let format = Arc::new(format);
            state.upstream_format = Some(format.clone());
            (state.listener.clone(), format)
        };
        // Collaborator callbacks run outside the queue lock; the listener
        // may re-enter reader APIs.
        if announced.drm.is_some() {
            self.drm.on_drm_format(&announced);
        }
        if let Some(listener) = listener {
            listener.on_upstream_format_changed(&announced);
        }
    }

    /// Append one sample. Requires a prior format announcement; samples
    /// arriving before one are dropped.
    pub fn append(&self, timestamp_us: i64, flags: SampleFlags, data: &[u8]) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }
        let Some(format) = state.upstream_format.clone() else {
            tracing::warn!(timestamp_us, "sample dropped, no upstream format announced");
            return;
        };
        let sample = QueuedSample {
            timestamp_us,
            flags,
            data: self.allocator.copy(data),
            format,
        };
        state.largest_queued_timestamp_us = state.largest_queued_timestamp_us.max(timestamp_us);
        state.samples.push_back(sample);
    }

    // Reader side. Callable from any thread.

    /// The most recently announced upstream format.
    pub fn upstream_format(&self) -> Option<Format> {
        self.state
            .lock()
            .upstream_format
            .as_deref()
            .cloned()
    }

    /// Largest timestamp appended in the current epoch, or `i64::MIN`.
    pub fn largest_queued_timestamp_us(&self) -> i64 {
        self.state.lock().largest_queued_timestamp_us
    }

    /// Whether a read would produce something (a sample, or end-of-stream
    /// once loading has finished).
    pub fn is_ready(&self, loading_finished: bool) -> bool {
        let state = self.state.lock();
        state.read_index < state.samples.len() || loading_finished
    }

    /// Read the next sample or pending format.
    ///
    /// `require_format` forces the current format to be delivered even if
    /// it was already reported to this reader.
    pub fn read(
        &self,
        format_holder: &mut FormatHolder,
        buffer: &mut SampleBuffer,
        require_format: bool,
        loading_finished: bool,
    ) -> ReadResult {
        let mut state = self.state.lock();
        if state.read_index >= state.samples.len() {
            return if loading_finished {
                buffer.clear();
                buffer.flags = SampleFlags::END_OF_STREAM;
                ReadResult::EndOfStream
            } else {
                ReadResult::NothingRead
            };
        }

        let sample_format = state.samples[state.read_index].format.clone();
        let format_changed = match &state.last_read_format {
            None => true,
            Some(last) => !Arc::ptr_eq(last, &sample_format) && **last != *sample_format,
        };
        if require_format || format_changed {
            format_holder.format = Some((*sample_format).clone());
            state.last_read_format = Some(sample_format);
            return ReadResult::FormatRead;
        }

        let sample = &state.samples[state.read_index];
        buffer.timestamp_us = sample.timestamp_us;
        buffer.flags = sample.flags;
        buffer.data.clear();
        buffer.data.extend_from_slice(&sample.data);
        state.read_index += 1;
        ReadResult::BufferRead
    }

    /// Skip samples with timestamps earlier than `position_us`. Returns
    /// the number skipped, capped at the available range.
    pub fn advance_to(&self, position_us: i64) -> usize {
        let mut state = self.state.lock();
        let mut skipped = 0;
        while state.read_index < state.samples.len()
            && state.samples[state.read_index].timestamp_us < position_us
        {
            state.read_index += 1;
            skipped += 1;
        }
        skipped
    }

    /// Skip every readable sample. Returns the number flushed.
    pub fn advance_to_end(&self) -> usize {
        let mut state = self.state.lock();
        let skipped = state.samples.len() - state.read_index;
        state.read_index = state.samples.len();
        skipped
    }

    /// Reposition the read cursor at the latest keyframe with a timestamp
    /// at or before `position_us`.
    ///
    /// Fails when the queue is empty, no such keyframe is buffered, or the
    /// position lies beyond the buffer and `allow_beyond_buffer` is unset.
    pub fn seek_to(&self, position_us: i64, allow_beyond_buffer: bool) -> bool {
        let mut state = self.state.lock();
        if state.samples.is_empty() {
            return false;
        }
        if !allow_beyond_buffer && position_us > state.largest_queued_timestamp_us {
            return false;
        }
        let target = state
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.timestamp_us <= position_us && s.flags.contains(SampleFlags::KEYFRAME)
            })
            .map(|(i, _)| i)
            .next_back();
        match target {
            Some(index) => {
                state.read_index = index;
                true
            }
            None => false,
        }
    }

    /// Discard samples from the front of the queue up to `position_us`.
    ///
    /// With `to_keyframe`, discarding stops at the latest keyframe at or
    /// before the position so the remaining prefix stays decodable. With
    /// `stop_at_read_position`, samples the reader has not consumed yet are
    /// kept regardless of position.
    pub fn discard_to(&self, position_us: i64, to_keyframe: bool, stop_at_read_position: bool) {
        let mut state = self.state.lock();
        let limit = if stop_at_read_position {
            state.read_index
        } else {
            state.samples.len()
        };

        let mut boundary = 0;
        while boundary < limit && state.samples[boundary].timestamp_us < position_us {
            boundary += 1;
        }
        if to_keyframe {
            boundary = (0..=boundary.min(state.samples.len().saturating_sub(1)))
                .rev()
                .find(|&i| {
                    i < state.samples.len()
                        && state.samples[i].flags.contains(SampleFlags::KEYFRAME)
                        && state.samples[i].timestamp_us <= position_us
                })
                .unwrap_or(0);
        }

        self.drop_front(&mut state, boundary);
    }

    /// Discard the entire buffer, including unread samples.
    pub fn discard_to_end(&self) {
        let mut state = self.state.lock();
        let count = state.samples.len();
        self.drop_front(&mut state, count);
    }

    /// Flush the queue and start a new epoch. The upstream format must be
    /// re-announced before the first subsequent read.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let count = state.samples.len();
        self.drop_front(&mut state, count);
        state.largest_queued_timestamp_us = i64::MIN;
        state.upstream_format = None;
        state.last_read_format = None;
    }

    /// Release the queue. Further writes are ignored. Idempotent.
    pub fn release(&self) {
        let mut state = self.state.lock();
        let count = state.samples.len();
        self.drop_front(&mut state, count);
        state.released = true;
    }

    fn drop_front(&self, state: &mut QueueState, count: usize) {
        for _ in 0..count {
            if let Some(sample) = state.samples.pop_front() {
                self.allocator.release(sample.data.len());
            }
        }
        state.read_index = state.read_index.saturating_sub(count);
    }
}
