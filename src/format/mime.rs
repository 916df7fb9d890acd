//! MIME and RFC 6381 codec-string helpers.
//!
//! Track types are derived from sample MIME types, and codec lists from
//! container manifests can be filtered down to the codecs of a single track
//! type. The filter is what lets a muxed manifest codecs string (e.g.
//! `"avc1.42E01E,mp4a.40.2"`) contribute exactly one codec to an audio-only
//! sample format.

use super::TrackType;

pub const VIDEO_MP2T: &str = "video/mp2t";
pub const VIDEO_H264: &str = "video/avc";
pub const VIDEO_H265: &str = "video/hevc";
pub const AUDIO_AAC: &str = "audio/mp4a-latm";
pub const AUDIO_OPUS: &str = "audio/opus";
pub const APPLICATION_ID3: &str = "application/id3";

/// Returns the track type implied by a MIME type.
pub fn track_type_of_mime(mime: &str) -> TrackType {
    let mime = mime.trim();
    if mime.starts_with("audio/") {
        TrackType::Audio
    } else if mime.starts_with("video/") {
        TrackType::Video
    } else if mime.starts_with("text/") || mime == "application/x-subrip" || mime == "application/ttml+xml" {
        TrackType::Text
    } else if mime == APPLICATION_ID3 || mime == "application/x-emsg" {
        TrackType::Metadata
    } else {
        TrackType::Unknown
    }
}

/// Returns the track type implied by a single RFC 6381 codec string.
pub fn track_type_of_codec(codec: &str) -> TrackType {
    let prefix = codec.trim().split('.').next().unwrap_or("");
    match prefix {
        "avc1" | "avc3" | "hev1" | "hvc1" | "vp08" | "vp09" | "vp8" | "vp9" | "av01"
        | "mp4v" | "mjpg" => TrackType::Video,
        "mp4a" | "opus" | "vorbis" | "flac" | "alac" | "ac-3" | "ec-3" | "ac-4" | "dtsc"
        | "dtse" => TrackType::Audio,
        "stpp" | "wvtt" => TrackType::Text,
        _ => TrackType::Unknown,
    }
}

/// Filters a comma-separated RFC 6381 codecs string down to the codecs of
/// the given track type. Returns `None` when nothing matches.
pub fn codecs_of_type(codecs: Option<&str>, track_type: TrackType) -> Option<String> {
    let codecs = codecs?;
    let matching: Vec<&str> = codecs
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty() && track_type_of_codec(c) == track_type)
        .collect();
    if matching.is_empty() {
        None
    } else {
        Some(matching.join(","))
    }
}

/// Number of codecs in a comma-separated RFC 6381 codecs string.
pub fn split_codec_count(codecs: &str) -> usize {
    codecs.split(',').filter(|c| !c.trim().is_empty()).count()
}

/// Normalizes a language tag towards IETF BCP-47: trimmed, lowercased,
/// underscores replaced. Empty and `und` tags normalize to `None`.
pub fn normalize_language(language: &str) -> Option<String> {
    let normalized = language.trim().to_ascii_lowercase().replace('_', "-");
    if normalized.is_empty() || normalized == "und" {
        None
    } else {
        Some(normalized)
    }
}
