// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! `ftyp`/`styp` and the initialization `moov` tree: `mvhd`, one `trak` per
//! track (`tkhd`/`mdia`/`minf`/`stbl`/`stsd`), `mvex`/`trex`, and `pssh`.
//!
//! Grounded on the teacher's `append_moov`/`append_video_trak`/`append_mvex`
//! (`server/src/mp4.rs`), generalized from "exactly one video track plus an
//! optional timestamp subtitle track" to N tracks of the kinds this crate's
//! data model actually carries, and from a plain (unencrypted) `stsd` entry
//! to the `sinf`/`schm`/`schi`/`tenc` wrapping CENC requires.

use super::{to_iso14496_timestamp, BoxWriter};
use crate::model::{DecoderConfigurationRecord, ProtectionScheme, PsshInfo, TrackInfo, TrackKind};
use itertools::Itertools as _;

pub struct MoovInput<'a> {
    pub tracks: &'a [TrackInfo],
    pub creation_time_unix: i64,
    pub movie_timescale: u32,
    /// `protection_scheme.is_some()` selects the `sinf`-wrapped sample entry
    /// and the `tenc` box; `None` produces a plain, unencrypted `moov`.
    pub protection_scheme: Option<ProtectionScheme>,
    pub default_key_id: [u8; 16],
    pub default_per_sample_iv_size: u8,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub psshes: &'a [PsshInfo],
}

/// Builds the top-level `ftyp` (single-file mode and multi-file init
/// segments both start with one). `spec.md` §6: brands are at minimum
/// `iso6`, `dash`, and any codec-specific brand.
pub fn build_ftyp(tracks: &[TrackInfo]) -> Vec<u8> {
    build_brand_box(b"ftyp", tracks, None)
}

/// Builds a media segment's `styp`, with the scheme-specific compatible
/// brand `spec.md` §10 adds (`cenc`/`cens`/`cbc1`/`cbcs` match the active
/// `ProtectionScheme`'s own fourcc).
pub fn build_styp(tracks: &[TrackInfo], scheme: Option<ProtectionScheme>) -> Vec<u8> {
    build_brand_box(b"styp", tracks, scheme)
}

fn build_brand_box(fourcc: &[u8; 4], tracks: &[TrackInfo], scheme: Option<ProtectionScheme>) -> Vec<u8> {
    let mut w = BoxWriter::new();
    w.write_box(fourcc, |w| {
        w.bytes(b"iso6"); // major_brand
        w.u32(0); // minor_version
        w.bytes(b"iso6");
        w.bytes(b"dash");
        for fourcc in tracks
            .iter()
            .map(|t| *t.decoder_config.fourcc())
            .unique()
        {
            w.bytes(&fourcc);
        }
        if let Some(scheme) = scheme {
            w.bytes(scheme.fourcc());
        }
    });
    w.into_inner()
}

pub fn build_moov(input: &MoovInput) -> Result<Vec<u8>, base::Error> {
    let mut w = BoxWriter::new();
    w.write_box(b"moov", |w| {
        append_mvhd(w, input);
        for track in input.tracks {
            append_trak(w, input, track);
        }
        append_mvex(w, input.tracks);
        for pssh in input.psshes {
            append_pssh(w, pssh);
        }
    });
    Ok(w.into_inner())
}

/// `MovieHeaderBox`, version 0 (ISO/IEC 14496-12 §8.2.2). Duration is left
/// unknown (`0xffff_ffff`): these are fragmented movies, whose duration is
/// only known once every segment has been written, long after the init
/// segment is emitted.
fn append_mvhd(w: &mut BoxWriter, input: &MoovInput) {
    w.write_full_box(b"mvhd", 0, 0, |w| {
        let ts = to_iso14496_timestamp(input.creation_time_unix);
        w.u32(ts); // creation_time
        w.u32(ts); // modification_time
        w.u32(input.movie_timescale);
        w.u32(0xffff_ffff); // duration, unknown
        w.fixed_16_16(0x0001_0000); // rate, 1.0
        w.i16(0x0100); // volume, 1.0
        w.u16(0); // reserved
        w.u32(0);
        w.u32(0); // reserved[2]
        write_unity_matrix(w);
        for _ in 0..6 {
            w.u32(0); // pre_defined[6]
        }
        w.u32(u32::try_from(input.tracks.len()).unwrap_or(u32::MAX) + 1); // next_track_ID
    });
}

fn write_unity_matrix(w: &mut BoxWriter) {
    #[rustfmt::skip]
    let matrix: [i32; 9] = [
        0x0001_0000, 0, 0,
        0, 0x0001_0000, 0,
        0, 0, 0x4000_0000,
    ];
    for v in matrix {
        w.i32(v);
    }
}

fn append_trak(w: &mut BoxWriter, input: &MoovInput, track: &TrackInfo) {
    w.write_box(b"trak", |w| {
        append_tkhd(w, input, track);
        w.write_box(b"mdia", |w| {
            append_mdhd(w, input, track);
            append_hdlr(w, track.kind);
            w.write_box(b"minf", |w| {
                match track.kind {
                    TrackKind::Video => append_vmhd(w),
                    TrackKind::Audio => append_nmhd(w),
                }
                append_dinf(w);
                append_stbl(w, input, track);
            });
        });
    });
}

/// `TrackHeaderBox`, version 0 (ISO/IEC 14496-12 §8.3.2). `track_enabled`
/// (bit 0) and `track_in_movie`(bit 1) are set; `track_in_preview` is not.
fn append_tkhd(w: &mut BoxWriter, input: &MoovInput, track: &TrackInfo) {
    w.write_full_box(b"tkhd", 0, 0x0000_0007, |w| {
        let ts = to_iso14496_timestamp(input.creation_time_unix);
        w.u32(ts);
        w.u32(ts);
        w.u32(track.track_id);
        w.u32(0); // reserved
        w.u32(0xffff_ffff); // duration, unknown (fragmented)
        w.u32(0);
        w.u32(0); // reserved[2]
        w.i16(0); // layer
        w.i16(0); // alternate_group
        w.i16(if track.kind == TrackKind::Audio { 0x0100 } else { 0 }); // volume
        w.u16(0); // reserved
        write_unity_matrix(w);
        let (width, height) = track
            .video_parameters
            .as_ref()
            .map(|p| (p.width, p.height))
            .unwrap_or((0, 0));
        w.fixed_16_16(i32::from(width) << 16);
        w.fixed_16_16(i32::from(height) << 16);
    });
}

fn append_mdhd(w: &mut BoxWriter, input: &MoovInput, track: &TrackInfo) {
    w.write_full_box(b"mdhd", 0, 0, |w| {
        let ts = to_iso14496_timestamp(input.creation_time_unix);
        w.u32(ts);
        w.u32(ts);
        w.u32(track.timescale);
        w.u32(0xffff_ffff); // duration, unknown
        w.u16(0x55c4); // language = "und"
        w.u16(0); // pre_defined
    });
}

fn append_hdlr(w: &mut BoxWriter, kind: TrackKind) {
    w.write_full_box(b"hdlr", 0, 0, |w| {
        w.u32(0); // pre_defined
        w.bytes(match kind {
            TrackKind::Video => b"vide",
            TrackKind::Audio => b"soun",
        });
        w.u32(0);
        w.u32(0);
        w.u32(0); // reserved[3]
        w.bytes(b"\0"); // empty name, NUL-terminated
    });
}

fn append_vmhd(w: &mut BoxWriter) {
    w.write_full_box(b"vmhd", 0, 1, |w| {
        w.u16(0); // graphicsmode
        w.u16(0);
        w.u16(0);
        w.u16(0); // opcolor
    });
}

/// `NullMediaHeaderBox` (ISO/IEC 14496-12 §8.4.5.2), used for tracks with no
/// video/sound/hint-specific header — this crate only has that situation
/// for the unimplemented `TrackKind::Audio` forward-compat slot.
fn append_nmhd(w: &mut BoxWriter) {
    w.write_full_box(b"nmhd", 0, 0, |_| {});
}

fn append_dinf(w: &mut BoxWriter) {
    w.write_box(b"dinf", |w| {
        w.write_full_box(b"dref", 0, 0, |w| {
            w.u32(1); // entry_count
            w.write_full_box(b"url ", 0, 1, |_| {}); // flags=1: media in same file
        });
    });
}

fn append_stbl(w: &mut BoxWriter, input: &MoovInput, track: &TrackInfo) {
    w.write_box(b"stbl", |w| {
        append_stsd(w, input, track);
        w.write_full_box(b"stts", 0, 0, |w| w.u32(0));
        w.write_full_box(b"stsc", 0, 0, |w| w.u32(0));
        w.write_full_box(b"stsz", 0, 0, |w| {
            w.u32(0); // sample_size
            w.u32(0); // sample_count
        });
        w.write_full_box(b"stco", 0, 0, |w| w.u32(0));
    });
}

fn append_stsd(w: &mut BoxWriter, input: &MoovInput, track: &TrackInfo) {
    w.write_full_box(b"stsd", 0, 0, |w| {
        w.u32(1); // entry_count
        match input.protection_scheme {
            None => append_sample_entry(w, track, *track.decoder_config.fourcc(), None),
            Some(scheme) => {
                let protected_fourcc = match track.kind {
                    TrackKind::Video => *b"encv",
                    TrackKind::Audio => *b"enca",
                };
                append_sample_entry(w, track, protected_fourcc, Some((scheme, input)));
            }
        }
    });
}

/// Writes one `SampleEntry` (ISO/IEC 14496-12 §8.5.2). When `protection` is
/// set, the original codec fourcc/config are wrapped in a `ProtectionSchemeInfoBox`
/// (`sinf`: `frma` + `schm` + `schi/tenc`, ISO/IEC 23001-7 §8.1/§8.2) instead
/// of being the sample entry's own type.
fn append_sample_entry(
    w: &mut BoxWriter,
    track: &TrackInfo,
    fourcc: [u8; 4],
    protection: Option<(ProtectionScheme, &MoovInput)>,
) {
    w.write_box(&fourcc, |w| {
        w.bytes(&[0; 6]); // reserved
        w.u16(1); // data_reference_index
        match track.kind {
            TrackKind::Video => append_visual_sample_entry_body(w, track),
            TrackKind::Audio => append_audio_sample_entry_body(w),
        }
        append_codec_config_box(w, &track.decoder_config);
        if let Some((scheme, input)) = protection {
            append_sinf(w, &track.decoder_config, scheme, input);
        }
    });
}

/// `ProtectionSchemeInfoBox` (ISO/IEC 14496-12 §8.12.6): the original format,
/// scheme type/version, and the `tenc` default encryption parameters
/// (ISO/IEC 23001-7 §8.2).
fn append_sinf(w: &mut BoxWriter, original: &DecoderConfigurationRecord, scheme: ProtectionScheme, input: &MoovInput) {
    w.write_box(b"sinf", |w| {
        w.write_box(b"frma", |w| w.bytes(original.fourcc()));
        w.write_full_box(b"schm", 0, 0, |w| {
            w.bytes(scheme.fourcc());
            w.u32(0x0001_0000); // scheme_version, 1.0
        });
        w.write_box(b"schi", |w| {
            append_tenc(w, scheme, input);
        });
    });
}

/// `TrackEncryptionBox` (ISO/IEC 23001-7 §8.2). Version 1 is used whenever a
/// pattern scheme is active so `default_crypt_byte_block`/
/// `default_skip_byte_block` are present; version 0 otherwise.
fn append_tenc(w: &mut BoxWriter, scheme: ProtectionScheme, input: &MoovInput) {
    let version = u8::from(scheme.is_pattern());
    w.write_full_box(b"tenc", version, 0, |w| {
        w.u8(0); // reserved
        if version == 0 {
            w.u8(0); // reserved
        } else {
            w.u8((input.crypt_byte_block << 4) | (input.skip_byte_block & 0x0f));
        }
        w.u8(1); // default_isProtected
        w.u8(input.default_per_sample_iv_size);
        w.bytes(&input.default_key_id);
        if input.default_per_sample_iv_size == 0 {
            // Constant IV case (ISO/IEC 23001-7 §8.2.1): carry a 16-byte
            // zero placeholder. `cbcs`/`cens` always supply a per-sample
            // `DecryptConfig::iv`, so the IV the first fragment actually
            // uses is the authoritative one; this default exists only so a
            // player reading `moov` alone sees a structurally valid box.
            w.u8(16);
            w.bytes(&[0; 16]);
        }
    });
}

fn append_visual_sample_entry_body(w: &mut BoxWriter, track: &TrackInfo) {
    let (width, height, par) = track
        .video_parameters
        .as_ref()
        .map(|p| (p.width, p.height, p.pixel_aspect_ratio))
        .unwrap_or((0, 0, None));
    w.u16(0); // pre_defined
    w.u16(0); // reserved
    w.u32(0);
    w.u32(0);
    w.u32(0); // pre_defined[3]
    w.u16(width);
    w.u16(height);
    w.u32(0x0048_0000); // horizresolution, 72 dpi
    w.u32(0x0048_0000); // vertresolution, 72 dpi
    w.u32(0); // reserved
    w.u16(1); // frame_count
    w.bytes(&[0; 32]); // compressorname, empty Pascal string + padding
    w.u16(0x0018); // depth
    w.i16(-1); // pre_defined

    if let Some((h, v)) = par {
        if (h, v) != (1, 1) {
            w.write_box(b"pasp", |w| {
                w.u32(u32::from(h));
                w.u32(u32::from(v));
            });
        }
    }
}

/// No audio codec is implemented (`spec.md` names none); this writes only
/// the `AudioSampleEntry` fixed fields so `TrackKind::Audio` at least
/// round-trips structurally if a future codec module appends its own
/// decoder-config child box.
fn append_audio_sample_entry_body(w: &mut BoxWriter) {
    w.u32(0);
    w.u32(0); // reserved[2]
    w.u16(2); // channelcount
    w.u16(16); // samplesize
    w.u16(0); // pre_defined
    w.u16(0); // reserved
    w.u32(0); // samplerate, left as 0 — no codec to source it from
}

fn append_codec_config_box(w: &mut BoxWriter, config: &DecoderConfigurationRecord) {
    w.write_box(config.box_fourcc(), |w| w.bytes(config.record_bytes()));
}

fn append_mvex(w: &mut BoxWriter, tracks: &[TrackInfo]) {
    w.write_box(b"mvex", |w| {
        for track in tracks {
            w.write_full_box(b"trex", 0, 0, |w| {
                w.u32(track.track_id);
                w.u32(1); // default_sample_description_index
                w.u32(0); // default_sample_duration
                w.u32(0); // default_sample_size
                // default_sample_flags: non-sync, depends on others.
                w.u32(0x0001_0000);
            });
        }
    });
}

fn append_pssh(w: &mut BoxWriter, pssh: &PsshInfo) {
    let version = if pssh.key_ids.is_empty() { 0 } else { 1 };
    w.write_full_box(b"pssh", version, 0, |w| {
        w.bytes(&pssh.system_id);
        if version > 0 {
            w.u32(u32::try_from(pssh.key_ids.len()).expect("key_ids fits in u32"));
            for kid in &pssh.key_ids {
                w.bytes(kid);
            }
        }
        w.u32(u32::try_from(pssh.data.len()).expect("pssh payload fits in u32"));
        w.bytes(&pssh.data);
    });
}
