//! Elementary-stream format descriptors (RFC 6381 codec identity, category
//! payloads, DRM/init data) and the two merge operations used when
//! container- or manifest-level information arrives after the sample-level
//! format.
//!
//! ## Shape
//!
//! A [`Format`] is an immutable value: identity and codec fields shared by
//! every track category, plus a [`FormatPayload`] variant carrying the
//! video-, audio- or text-specific fields. Integer fields use the
//! [`NO_VALUE`] sentinel for absence at the wire boundary; construction
//! through [`FormatBuilder`] coerces absent defaults (rotation 0, pixel
//! aspect ratio 1.0, encoder delay/padding 0).
//!
//! Formats are value-equal across **all** fields (byte blobs by content).
//! The hash is memoized lazily and deliberately excludes initialization
//! data, DRM data, projection bytes and color info.

pub mod mime;

use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Sentinel for "unknown / not applicable" integer fields.
pub const NO_VALUE: i32 = -1;

/// Sentinel for "unknown" float fields; coerced to the field default on
/// construction.
pub const NO_VALUE_F: f32 = -1.0;

/// Subsample timestamps are relative to the parent sample's timestamp.
pub const OFFSET_SAMPLE_RELATIVE: i64 = i64::MAX;

/// Selection flag: the track should be selected by default.
pub const SELECTION_FLAG_DEFAULT: u32 = 1;
/// Selection flag: the track must be displayed when selected.
pub const SELECTION_FLAG_FORCED: u32 = 1 << 1;
/// Selection flag: the track is eligible for automatic selection.
pub const SELECTION_FLAG_AUTOSELECT: u32 = 1 << 2;

/// Role flag: main content.
pub const ROLE_FLAG_MAIN: u32 = 1;
/// Role flag: an alternate rendition of the main content.
pub const ROLE_FLAG_ALTERNATE: u32 = 1 << 1;
/// Role flag: closed captions.
pub const ROLE_FLAG_CAPTION: u32 = 1 << 2;
/// Role flag: a textual or spoken description of the video content.
pub const ROLE_FLAG_DESCRIBES_VIDEO: u32 = 1 << 3;

/// Media track categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackType {
    Unknown,
    Audio,
    Video,
    Text,
    Metadata,
}

/// A single metadata sidecar entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// Ordered metadata sidecar attached to a format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub entries: Vec<MetadataEntry>,
}

impl Metadata {
    pub fn new(entries: Vec<MetadataEntry>) -> Self {
        Metadata { entries }
    }

    /// Returns a copy with `other`'s entries appended after this one's.
    pub fn with_appended_entries_from(&self, other: Option<&Metadata>) -> Metadata {
        let mut entries = self.entries.clone();
        if let Some(other) = other {
            entries.extend(other.entries.iter().cloned());
        }
        Metadata { entries }
    }
}

/// One DRM scheme's initialization blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemeData {
    /// 16-byte scheme identifier (UUID bytes).
    pub scheme_id: [u8; 16],
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// DRM initialization data: an ordered list of per-scheme blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DrmInitData {
    pub scheme_type: Option<String>,
    pub scheme_data: Vec<SchemeData>,
}

impl DrmInitData {
    /// Merges manifest- and media-level DRM data for session creation:
    /// manifest scheme data first, then media-level data, duplicates
    /// dropped. Returns `None` when both inputs are `None`.
    pub fn session_creation_data(
        manifest: Option<&DrmInitData>,
        media: Option<&DrmInitData>,
    ) -> Option<DrmInitData> {
        match (manifest, media) {
            (None, None) => None,
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (Some(manifest), Some(media)) => {
                let scheme_type = manifest
                    .scheme_type
                    .clone()
                    .or_else(|| media.scheme_type.clone());
                let mut scheme_data = manifest.scheme_data.clone();
                for data in &media.scheme_data {
                    if !scheme_data.contains(data) {
                        scheme_data.push(data.clone());
                    }
                }
                Some(DrmInitData {
                    scheme_type,
                    scheme_data,
                })
            }
        }
    }
}

/// HDR/color description for video formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorInfo {
    pub color_space: i32,
    pub color_range: i32,
    pub color_transfer: i32,
    pub hdr_static_info: Option<Vec<u8>>,
}

/// Video-specific format fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: i32,
    pub height: i32,
    /// Frames per second, or [`NO_VALUE_F`] when unknown.
    pub frame_rate: f32,
    /// Clockwise rotation to apply before display: 0, 90, 180 or 270.
    pub rotation_degrees: u32,
    pub pixel_aspect_ratio: f32,
    pub projection_data: Option<Vec<u8>>,
    pub stereo_mode: i32,
    pub color_info: Option<ColorInfo>,
}

impl Default for VideoInfo {
    fn default() -> Self {
        VideoInfo {
            width: NO_VALUE,
            height: NO_VALUE,
            frame_rate: NO_VALUE_F,
            rotation_degrees: 0,
            pixel_aspect_ratio: 1.0,
            projection_data: None,
            stereo_mode: NO_VALUE,
            color_info: None,
        }
    }
}

/// Audio-specific format fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub channel_count: i32,
    pub sample_rate: i32,
    pub pcm_encoding: i32,
    pub encoder_delay: i32,
    pub encoder_padding: i32,
}

impl Default for AudioInfo {
    fn default() -> Self {
        AudioInfo {
            channel_count: NO_VALUE,
            sample_rate: NO_VALUE,
            pcm_encoding: NO_VALUE,
            encoder_delay: 0,
            encoder_padding: 0,
        }
    }
}

/// Text-specific format fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextInfo {
    pub accessibility_channel: i32,
}

impl Default for TextInfo {
    fn default() -> Self {
        TextInfo {
            accessibility_channel: NO_VALUE,
        }
    }
}

/// Category-specific payload of a [`Format`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum FormatPayload {
    #[default]
    None,
    Video(VideoInfo),
    Audio(AudioInfo),
    Text(TextInfo),
}

impl FormatPayload {
    fn track_type(&self) -> Option<TrackType> {
        match self {
            FormatPayload::None => None,
            FormatPayload::Video(_) => Some(TrackType::Video),
            FormatPayload::Audio(_) => Some(TrackType::Audio),
            FormatPayload::Text(_) => Some(TrackType::Text),
        }
    }
}

/// An immutable description of one media elementary stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Format {
    // Identity.
    pub id: Option<String>,
    pub label: Option<String>,
    /// IETF BCP-47 language tag, normalized lowercase.
    pub language: Option<String>,
    pub selection_flags: u32,
    pub role_flags: u32,

    // Bitrate.
    pub average_bitrate: i32,
    pub peak_bitrate: i32,

    // Codec identity.
    pub codecs: Option<String>,
    pub metadata: Option<Metadata>,
    pub container_mime: Option<String>,
    pub sample_mime: Option<String>,
    /// Ordered initialization blobs (e.g. SPS/PPS, codec config).
    pub init_data: Vec<Vec<u8>>,

    // DRM.
    pub drm: Option<DrmInitData>,
    pub crypto_type: Option<String>,

    /// [`OFFSET_SAMPLE_RELATIVE`] means subsample timestamps are relative
    /// to the parent sample.
    pub subsample_offset_us: i64,

    pub payload: FormatPayload,

    #[serde(skip)]
    hash: OnceLock<u64>,
}

impl Format {
    pub fn builder() -> FormatBuilder {
        FormatBuilder::default()
    }

    /// The effective bitrate: peak when known, else average.
    pub fn bitrate(&self) -> i32 {
        if self.peak_bitrate != NO_VALUE {
            self.peak_bitrate
        } else {
            self.average_bitrate
        }
    }

    /// The track category: from the payload variant when present, else
    /// derived from the sample MIME type.
    pub fn track_type(&self) -> TrackType {
        self.payload.track_type().unwrap_or_else(|| {
            self.sample_mime
                .as_deref()
                .map(mime::track_type_of_mime)
                .unwrap_or(TrackType::Unknown)
        })
    }

    /// Combines this sample-level format with container-level hints.
    ///
    /// Passed metadata is appended to existing metadata; the single
    /// `bitrate` replaces both average and peak; width/height/channel count
    /// apply to the matching payload variant.
    pub fn with_container_info(&self, info: ContainerInfo) -> Format {
        let metadata = match (&self.metadata, &info.metadata) {
            (Some(own), passed) => Some(own.with_appended_entries_from(passed.as_ref())),
            (None, passed) => passed.clone(),
        };

        let payload = match &self.payload {
            FormatPayload::Video(video) => FormatPayload::Video(VideoInfo {
                width: info.width,
                height: info.height,
                ..video.clone()
            }),
            FormatPayload::Audio(audio) => FormatPayload::Audio(AudioInfo {
                channel_count: info.channel_count,
                ..audio.clone()
            }),
            other => other.clone(),
        };

        Format {
            id: info.id,
            label: info.label,
            language: info.language.as_deref().and_then(mime::normalize_language),
            selection_flags: info.selection_flags,
            role_flags: self.role_flags,
            average_bitrate: info.bitrate,
            peak_bitrate: info.bitrate,
            codecs: info.codecs,
            metadata,
            container_mime: self.container_mime.clone(),
            sample_mime: info.sample_mime.or_else(|| self.sample_mime.clone()),
            init_data: self.init_data.clone(),
            drm: self.drm.clone(),
            crypto_type: self.crypto_type.clone(),
            subsample_offset_us: self.subsample_offset_us,
            payload,
            hash: OnceLock::new(),
        }
    }

    /// Combines this sample-level format with a manifest-level format.
    ///
    /// Precedence: id from the manifest; label prefers the manifest;
    /// language prefers the sample, falling back to the manifest for TEXT
    /// and AUDIO tracks; bitrates and codecs prefer the sample, with a
    /// muxed manifest codecs string filtered down to the sample's track
    /// type and adopted only when exactly one codec survives; frame rate
    /// falls back to the manifest for VIDEO tracks; selection and role
    /// flags are OR'd; DRM data is merged for session creation.
    pub fn with_manifest_format_info(&self, manifest: &Format) -> Format {
        let track_type = self
            .sample_mime
            .as_deref()
            .map(mime::track_type_of_mime)
            .unwrap_or(TrackType::Unknown);

        let id = manifest.id.clone();
        let label = manifest.label.clone().or_else(|| self.label.clone());

        let mut language = self.language.clone();
        if matches!(track_type, TrackType::Text | TrackType::Audio) && manifest.language.is_some()
        {
            language = manifest.language.clone();
        }

        let average_bitrate = if self.average_bitrate == NO_VALUE {
            manifest.average_bitrate
        } else {
            self.average_bitrate
        };
        let peak_bitrate = if self.peak_bitrate == NO_VALUE {
            manifest.peak_bitrate
        } else {
            self.peak_bitrate
        };

        let mut codecs = self.codecs.clone();
        if codecs.is_none() {
            // The manifest may describe a muxed stream; adopt its codecs
            // only when exactly one codec of this track's type survives.
            let of_type = mime::codecs_of_type(manifest.codecs.as_deref(), track_type);
            if let Some(of_type) = of_type {
                if mime::split_codec_count(&of_type) == 1 {
                    codecs = Some(of_type);
                }
            }
        }

        let metadata = match &self.metadata {
            None => manifest.metadata.clone(),
            Some(own) => Some(own.with_appended_entries_from(manifest.metadata.as_ref())),
        };

        let mut payload = self.payload.clone();
        if track_type == TrackType::Video {
            if let (FormatPayload::Video(video), FormatPayload::Video(manifest_video)) =
                (&mut payload, &manifest.payload)
            {
                if video.frame_rate == NO_VALUE_F {
                    video.frame_rate = manifest_video.frame_rate;
                }
            }
        }

        Format {
            id,
            label,
            language,
            selection_flags: self.selection_flags | manifest.selection_flags,
            role_flags: self.role_flags | manifest.role_flags,
            average_bitrate,
            peak_bitrate,
            codecs,
            metadata,
            container_mime: self.container_mime.clone(),
            sample_mime: self.sample_mime.clone(),
            init_data: self.init_data.clone(),
            drm: DrmInitData::session_creation_data(manifest.drm.as_ref(), self.drm.as_ref()),
            crypto_type: self.crypto_type.clone(),
            subsample_offset_us: self.subsample_offset_us,
            payload,
            hash: OnceLock::new(),
        }
    }

    /// The memoized hash. Excludes initialization data, DRM data,
    /// projection bytes and color info.
    fn memoized_hash(&self) -> u64 {
        *self.hash.get_or_init(|| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            self.id.hash(&mut hasher);
            self.label.hash(&mut hasher);
            self.language.hash(&mut hasher);
            self.selection_flags.hash(&mut hasher);
            self.role_flags.hash(&mut hasher);
            self.average_bitrate.hash(&mut hasher);
            self.peak_bitrate.hash(&mut hasher);
            self.codecs.hash(&mut hasher);
            self.metadata.hash(&mut hasher);
            self.container_mime.hash(&mut hasher);
            self.sample_mime.hash(&mut hasher);
            self.crypto_type.hash(&mut hasher);
            self.subsample_offset_us.hash(&mut hasher);
            match &self.payload {
                FormatPayload::None => 0u8.hash(&mut hasher),
                FormatPayload::Video(v) => {
                    1u8.hash(&mut hasher);
                    v.width.hash(&mut hasher);
                    v.height.hash(&mut hasher);
                    v.frame_rate.to_bits().hash(&mut hasher);
                    v.rotation_degrees.hash(&mut hasher);
                    v.pixel_aspect_ratio.to_bits().hash(&mut hasher);
                    v.stereo_mode.hash(&mut hasher);
                }
                FormatPayload::Audio(a) => {
                    2u8.hash(&mut hasher);
                    a.channel_count.hash(&mut hasher);
                    a.sample_rate.hash(&mut hasher);
                    a.pcm_encoding.hash(&mut hasher);
                    a.encoder_delay.hash(&mut hasher);
                    a.encoder_padding.hash(&mut hasher);
                }
                FormatPayload::Text(t) => {
                    3u8.hash(&mut hasher);
                    t.accessibility_channel.hash(&mut hasher);
                }
            }
            hasher.finish()
        })
    }
}

impl PartialEq for Format {
    fn eq(&self, other: &Self) -> bool {
        // A differing memoized hash is a cheap early out; equality itself
        // covers every field, including the blobs the hash skips.
        if let (Some(a), Some(b)) = (self.hash.get(), other.hash.get()) {
            if a != b {
                return false;
            }
        }
        self.id == other.id
            && self.label == other.label
            && self.language == other.language
            && self.selection_flags == other.selection_flags
            && self.role_flags == other.role_flags
            && self.average_bitrate == other.average_bitrate
            && self.peak_bitrate == other.peak_bitrate
            && self.codecs == other.codecs
            && self.metadata == other.metadata
            && self.container_mime == other.container_mime
            && self.sample_mime == other.sample_mime
            && self.init_data == other.init_data
            && self.drm == other.drm
            && self.crypto_type == other.crypto_type
            && self.subsample_offset_us == other.subsample_offset_us
            && self.payload == other.payload
    }
}

impl Eq for Format {}

impl Hash for Format {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.memoized_hash());
    }
}

/// Container-level hints merged into a sample format by
/// [`Format::with_container_info`].
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: Option<String>,
    pub label: Option<String>,
    pub sample_mime: Option<String>,
    pub codecs: Option<String>,
    pub metadata: Option<Metadata>,
    pub bitrate: i32,
    pub width: i32,
    pub height: i32,
    pub channel_count: i32,
    pub selection_flags: u32,
    pub language: Option<String>,
}

/// Builder for [`Format`]. Absent integer fields default to [`NO_VALUE`];
/// the language is normalized and payload defaults coerced on
/// [`build`](Self::build).
#[derive(Debug, Default)]
pub struct FormatBuilder {
    id: Option<String>,
    label: Option<String>,
    language: Option<String>,
    selection_flags: u32,
    role_flags: u32,
    average_bitrate: Option<i32>,
    peak_bitrate: Option<i32>,
    codecs: Option<String>,
    metadata: Option<Metadata>,
    container_mime: Option<String>,
    sample_mime: Option<String>,
    init_data: Vec<Vec<u8>>,
    drm: Option<DrmInitData>,
    crypto_type: Option<String>,
    subsample_offset_us: Option<i64>,
    payload: FormatPayload,
}

impl FormatBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn selection_flags(mut self, flags: u32) -> Self {
        self.selection_flags = flags;
        self
    }

    pub fn role_flags(mut self, flags: u32) -> Self {
        self.role_flags = flags;
        self
    }

    pub fn average_bitrate(mut self, bitrate: i32) -> Self {
        self.average_bitrate = Some(bitrate);
        self
    }

    pub fn peak_bitrate(mut self, bitrate: i32) -> Self {
        self.peak_bitrate = Some(bitrate);
        self
    }

    pub fn codecs(mut self, codecs: impl Into<String>) -> Self {
        self.codecs = Some(codecs.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn container_mime(mut self, mime: impl Into<String>) -> Self {
        self.container_mime = Some(mime.into());
        self
    }

    pub fn sample_mime(mut self, mime: impl Into<String>) -> Self {
        self.sample_mime = Some(mime.into());
        self
    }

    pub fn init_data(mut self, init_data: Vec<Vec<u8>>) -> Self {
        self.init_data = init_data;
        self
    }

    pub fn drm(mut self, drm: DrmInitData) -> Self {
        self.drm = Some(drm);
        self
    }

    pub fn crypto_type(mut self, crypto_type: impl Into<String>) -> Self {
        self.crypto_type = Some(crypto_type.into());
        self
    }

    pub fn subsample_offset_us(mut self, offset_us: i64) -> Self {
        self.subsample_offset_us = Some(offset_us);
        self
    }

    pub fn video(mut self, video: VideoInfo) -> Self {
        self.payload = FormatPayload::Video(video);
        self
    }

    pub fn audio(mut self, audio: AudioInfo) -> Self {
        self.payload = FormatPayload::Audio(audio);
        self
    }

    pub fn text(mut self, text: TextInfo) -> Self {
        self.payload = FormatPayload::Text(text);
        self
    }

    pub fn build(self) -> Format {
        let payload = match self.payload {
            FormatPayload::Video(mut video) => {
                if video.pixel_aspect_ratio == NO_VALUE_F {
                    video.pixel_aspect_ratio = 1.0;
                }
                debug_assert!(matches!(video.rotation_degrees, 0 | 90 | 180 | 270));
                FormatPayload::Video(video)
            }
            FormatPayload::Audio(mut audio) => {
                if audio.encoder_delay == NO_VALUE {
                    audio.encoder_delay = 0;
                }
                if audio.encoder_padding == NO_VALUE {
                    audio.encoder_padding = 0;
                }
                FormatPayload::Audio(audio)
            }
            other => other,
        };

        Format {
            id: self.id,
            label: self.label,
            language: self.language.as_deref().and_then(mime::normalize_language),
            selection_flags: self.selection_flags,
            role_flags: self.role_flags,
            average_bitrate: self.average_bitrate.unwrap_or(NO_VALUE),
            peak_bitrate: self.peak_bitrate.unwrap_or(NO_VALUE),
            codecs: self.codecs,
            metadata: self.metadata,
            container_mime: self.container_mime,
            sample_mime: self.sample_mime,
            init_data: self.init_data,
            drm: self.drm,
            crypto_type: self.crypto_type,
            subsample_offset_us: self.subsample_offset_us.unwrap_or(0),
            payload,
            hash: OnceLock::new(),
        }
    }
}
