//! Error types for the media-stream pipeline.

use std::sync::Arc;
use std::time::Duration;

/// Errors that can occur in the media-stream pipeline.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Open**: [`UnsupportedProtocol`](Self::UnsupportedProtocol),
///   [`UnsupportedFormat`](Self::UnsupportedFormat),
///   [`Canceled`](Self::Canceled), [`PortExhausted`](Self::PortExhausted).
/// - **Steady-state load**: [`ReadTimeout`](Self::ReadTimeout),
///   [`Io`](Self::Io), [`UnexpectedEof`](Self::UnexpectedEof),
///   [`QueueClosed`](Self::QueueClosed).
/// - **Prepare**: [`PrepareInterrupted`](Self::PrepareInterrupted).
///
/// The enum is `Clone` so the loader can hand an error to its callback and
/// still retain it for [`maybe_throw_error`](crate::loader::Loader::maybe_throw_error);
/// I/O causes are therefore held behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error during steady-state load.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// A socket read exceeded its timeout. Swallowed by the load loop while
    /// the session is paused; fatal otherwise.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// The track's transport protocol is not RTP, MP2T or RAW.
    #[error("transport protocol not supported: {0}")]
    UnsupportedProtocol(String),

    /// No extractor accepted the stream (sniff/init rejected, or required
    /// payload metadata is absent).
    #[error("media format not supported: {0}")]
    UnsupportedFormat(String),

    /// The wrapper was released while the loadable was still opening.
    #[error("load canceled during open")]
    Canceled,

    /// End of input reached where more data was required (e.g. inside a
    /// sniff peek).
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Loading finished before every sample queue published a format.
    #[error("loading finished before preparation completed")]
    PrepareInterrupted,

    /// UDP socket-pair allocation exhausted its retry budget over the
    /// [50000, 60000) range.
    #[error("UDP port allocation exhausted after {0} attempts")]
    PortExhausted(u32),

    /// A packet queue was closed while a reader was blocked on it.
    #[error("packet queue closed")]
    QueueClosed,
}

impl StreamError {
    /// Whether this error is a socket-timeout (as opposed to a generic
    /// read failure). Drives the timeout-vs-failed split on the consumer
    /// surface.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::ReadTimeout(_))
    }

    /// Whether this error belongs to the open phase of a load. Open-time
    /// failures are reported through `PrepareFailure` and must not be
    /// re-reported as playback failures.
    pub fn is_open_failure(&self) -> bool {
        matches!(
            self,
            StreamError::UnsupportedProtocol(_)
                | StreamError::UnsupportedFormat(_)
                | StreamError::Canceled
                | StreamError::PortExhausted(_)
        )
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
