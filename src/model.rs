// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Shared data types: the access-unit/fragment/segment hierarchy that flows
//! between the bitstream converter, the encryptor, the fragmenter, and the
//! segmenter.

use derive_more::Debug as DeriveDebug;
use pretty_hex::PrettyHex as _;
use std::sync::Arc;

/// One of the four CENC protection schemes (ISO/IEC 23001-7 §8.1).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProtectionScheme {
    /// AES-CTR, subsamples byte-aligned, per-sample IV.
    Cenc,
    /// AES-CTR with a `crypt_byte_block`:`skip_byte_block` pattern.
    Cens,
    /// AES-CBC, subsamples byte-aligned, per-sample IV.
    Cbc1,
    /// AES-CBC with a `crypt_byte_block`:`skip_byte_block` pattern and a
    /// constant IV.
    Cbcs,
}

impl ProtectionScheme {
    /// The four-character code used in `schm`/`sinf`/`styp` contexts.
    pub fn fourcc(self) -> &'static [u8; 4] {
        match self {
            ProtectionScheme::Cenc => b"cenc",
            ProtectionScheme::Cens => b"cens",
            ProtectionScheme::Cbc1 => b"cbc1",
            ProtectionScheme::Cbcs => b"cbcs",
        }
    }

    /// True for the two pattern-encrypted schemes.
    pub fn is_pattern(self) -> bool {
        matches!(self, ProtectionScheme::Cens | ProtectionScheme::Cbcs)
    }

    /// True for the two AES-CBC-based schemes.
    pub fn is_cbc(self) -> bool {
        matches!(self, ProtectionScheme::Cbc1 | ProtectionScheme::Cbcs)
    }
}

/// A (`clear_bytes`, `cipher_bytes`) pair describing which bytes of a sample
/// are encrypted. The sum across entries equals the sample size.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SubsampleEntry {
    pub clear_bytes: u16,
    pub cipher_bytes: u32,
}

/// Per-sample auxiliary encryption info, produced by the `SampleEncryptor`
/// and consumed by the `FragmenterPerTrack` when building `senc`.
#[derive(Clone, DeriveDebug)]
pub struct DecryptConfig {
    #[debug("{}", key_id.hex_dump())]
    pub key_id: [u8; 16],
    /// 8 or 16 bytes.
    #[debug("{}", iv.hex_dump())]
    pub iv: Vec<u8>,
    pub subsamples: Vec<SubsampleEntry>,
    pub protection_scheme: ProtectionScheme,
    /// Both zero for non-pattern schemes.
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
}

/// An access unit as it arrives from upstream: raw payload plus timing.
///
/// Samples are immutable once produced by upstream. Encryption is modeled
/// as the encryptor returning a new `Sample` with `data` and
/// `decrypt_config` filled in, rather than in-place mutation, since the
/// input `data` may still be needed (e.g. for retry/logging) after
/// encryption fails partway.
#[derive(Clone, DeriveDebug)]
pub struct Sample {
    pub track_id: u32,
    /// Decode timestamp, in the track's stream timescale.
    pub dts: i64,
    /// Presentation timestamp, in the track's stream timescale.
    pub pts: i64,
    /// Duration in timescale units, if already known (e.g. from upstream
    /// container metadata). When absent the fragmenter derives it from the
    /// next sample's DTS.
    pub duration: Option<u32>,
    pub is_key_frame: bool,
    #[debug("{}", data.hex_dump())]
    pub data: Vec<u8>,
    /// Set once the sample has passed through a `SampleEncryptor`.
    pub decrypt_config: Option<DecryptConfig>,
}

impl Sample {
    pub fn composition_offset(&self) -> i64 {
        self.pts - self.dts
    }
}

/// Width/height/PAR and codec-specific extra data needed to build a
/// `DecoderConfigurationRecord`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoParameters {
    pub width: u16,
    pub height: u16,
    /// `None` selects the codec's usual default (derived from the SPS/VUI,
    /// or a resolution-keyed fallback table; see `bitstream::h264`).
    pub pixel_aspect_ratio: Option<(u16, u16)>,
}

/// A fully-built codec configuration record (`avcC` or `hvcC`), ready to be
/// embedded in a `stsd` sample entry.
#[derive(Clone, DeriveDebug, PartialEq, Eq)]
pub enum DecoderConfigurationRecord {
    Avc {
        /// The serialized `AVCDecoderConfigurationRecord`, ISO/IEC 14496-15
        /// §5.2.4.1, NAL-length-size-minus-one hardcoded to 3.
        #[debug("{}", record.hex_dump())]
        record: Vec<u8>,
        rfc6381_codec: String,
    },
    Hevc {
        /// The serialized `HEVCDecoderConfigurationRecord`, ISO/IEC 14496-15
        /// §8.3.3.1.2.
        #[debug("{}", record.hex_dump())]
        record: Vec<u8>,
        rfc6381_codec: String,
    },
}

impl DecoderConfigurationRecord {
    pub fn record_bytes(&self) -> &[u8] {
        match self {
            DecoderConfigurationRecord::Avc { record, .. }
            | DecoderConfigurationRecord::Hevc { record, .. } => record,
        }
    }

    pub fn rfc6381_codec(&self) -> &str {
        match self {
            DecoderConfigurationRecord::Avc { rfc6381_codec, .. }
            | DecoderConfigurationRecord::Hevc { rfc6381_codec, .. } => rfc6381_codec,
        }
    }

    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            DecoderConfigurationRecord::Avc { .. } => b"avc1",
            DecoderConfigurationRecord::Hevc { .. } => b"hvc1",
        }
    }

    pub fn box_fourcc(&self) -> &'static [u8; 4] {
        match self {
            DecoderConfigurationRecord::Avc { .. } => b"avcC",
            DecoderConfigurationRecord::Hevc { .. } => b"hvcC",
        }
    }
}

/// Which kind of media a track carries. Only `Video` has a concrete sample
/// entry implemented — `Audio` is modeled for forward compatibility (a
/// generic `FragmenterPerTrack` works for it too) but no audio codec is
/// supported yet, so there is no audio sample-entry box builder.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Static, per-track configuration established once at setup: timescale,
/// decoder config, and video dimensions.
#[derive(Clone, Debug)]
pub struct TrackInfo {
    pub track_id: u32,
    pub kind: TrackKind,
    pub timescale: u32,
    pub decoder_config: DecoderConfigurationRecord,
    pub video_parameters: Option<VideoParameters>,
}

/// One packaged sample as it will be written into a fragment's `trun`/`mdat`.
#[derive(Clone, Debug)]
pub struct SampleRecord {
    pub size: u32,
    pub duration: u32,
    pub is_sync: bool,
    pub composition_offset: i32,
    pub decrypt_config: Option<DecryptConfig>,
}

/// An ordered sequence of samples of one track sharing a base decode time.
#[derive(Clone, DeriveDebug)]
pub struct Fragment {
    pub track_id: u32,
    pub base_decode_time: i64,
    #[debug("{}", sample_data.hex_dump())]
    pub sample_data: Vec<u8>,
    pub samples: Vec<SampleRecord>,
    /// True iff the first sample is a SAP (required when the fragment opens
    /// a segment).
    pub starts_with_sap: bool,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> u64 {
        self.samples.iter().map(|s| u64::from(s.duration)).sum()
    }
}

/// A `sidx` subsegment reference, pre-coalescing. `earliest_presentation_time`
/// is carried alongside the fields `sidx` itself serializes so the
/// coalescing algorithm (`spec.md` §4.5) can recompute `sap_delta_time`
/// relative to a merged group's earliest PT; `sap_type == 0` is this crate's
/// sentinel for "no known SAP in this subsegment" (ISO SAP types are 1-6).
#[derive(Copy, Clone, Debug)]
pub struct SidxReference {
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub earliest_presentation_time: i64,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

/// One or more consecutive fragments across all tracks.
#[derive(Clone, Debug)]
pub struct Segment {
    pub sequence_number: u32,
    pub earliest_presentation_time: i64,
    pub duration: u64,
    pub size: u64,
    pub file_name: Option<String>,
}

/// A pre-built, DRM-system-specific `pssh` payload, supplied by the
/// out-of-scope key source.
#[derive(Clone, Debug)]
pub struct PsshInfo {
    pub system_id: [u8; 16],
    pub key_ids: Vec<[u8; 16]>,
    pub data: Vec<u8>,
}

pub type Shared<T> = Arc<T>;
