// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Orchestrates the per-track `FragmenterPerTrack`s into DASH segments:
//! decides fragment/segment cut points, builds `styp`/`moof`/`mdat`/`sidx`,
//! and drives a `SegmentSink`.
//!
//! Boundary policy is reference-track-driven: one track (ordinarily the
//! video track) supplies the SAP/duration signal every other track's
//! fragments are cut alongside (`spec.md` §9 leaves "which track decides
//! fragment boundaries in a multi-track mux" as an open question; this
//! crate answers it the way most DASH packagers do — see `DESIGN.md`).

use crate::boxes::{self, build_free_box, init::MoovInput, moof, sidx};
use crate::config::{PackagerConfig, SidxMode};
use crate::fragmenter::FragmenterPerTrack;
use crate::listener::{NullListener, SegmentListener};
use crate::model::{DecryptConfig, Fragment, ProtectionScheme, PsshInfo, Segment, SidxReference, TrackInfo};
use crate::sink::SegmentSink;
use base::bail;

/// Everything the `Segmenter` needs beyond what's already in
/// [`PackagerConfig`]: the track list and the out-of-scope key source's
/// encryption parameters, resolved by the caller before construction.
pub struct SegmenterInit<'a> {
    pub config: &'a PackagerConfig,
    pub tracks: Vec<TrackInfo>,
    /// Index into `tracks` of the track whose SAPs/durations drive fragment
    /// and segment cuts.
    pub reference_track_index: usize,
    pub protection_scheme: Option<ProtectionScheme>,
    pub default_key_id: [u8; 16],
    pub default_per_sample_iv_size: u8,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub psshes: Vec<PsshInfo>,
    pub creation_time_unix: i64,
    pub movie_timescale: u32,
    pub representation_id: String,
}

pub struct Segmenter<L: SegmentListener = NullListener> {
    output_file_name: String,
    segment_template: String,
    is_single_file: bool,
    segment_duration_units: u64,
    fragment_duration_units: u64,
    segment_sap_aligned: bool,
    fragment_sap_aligned: bool,
    sidx_mode: SidxMode,
    bandwidth: u64,
    representation_id: String,

    tracks: Vec<TrackInfo>,
    reference_track_index: usize,
    protection_scheme: Option<ProtectionScheme>,
    default_key_id: [u8; 16],
    default_per_sample_iv_size: u8,
    crypt_byte_block: u8,
    skip_byte_block: u8,
    psshes: Vec<PsshInfo>,
    creation_time_unix: i64,
    movie_timescale: u32,

    fragmenters: Vec<FragmenterPerTrack>,
    duration_notified: Vec<bool>,
    encryption_notified: Vec<bool>,

    moof_sequence: u32,
    segment_sequence: u32,
    fragment_start_dts: Option<i64>,
    segment_start_dts: Option<i64>,

    pending_fragment_bytes: Vec<u8>,
    pending_sidx_refs: Vec<SidxReference>,

    /// Single-file mode only: every subsegment reference seen across the
    /// whole file, not just the current segment, since the file carries one
    /// index rather than one per segment.
    single_file_all_refs: Vec<SidxReference>,
    /// Single-file mode with `SidxMode::Coalesce(n)` only: the
    /// `(offset, reserved_len)` of the placeholder `free` box written right
    /// after `moov` in `write_init`, later overwritten in `finish` with the
    /// real `sidx` (padded with a trailing `free` box if the final
    /// reference count came in under `n`). `None` when the final size can't
    /// be bounded in advance (`SidxMode::OnePerFragment`).
    single_file_sidx_placeholder: Option<(u64, u64)>,
    /// Single-file mode with `SidxMode::OnePerFragment` only: every
    /// segment's bytes, held back rather than written to `sink` as they're
    /// cut. A `sidx`'s `first_offset` (ISO/IEC 14496-12 §8.16.3) is a
    /// forward-only distance from the box's own end, so a whole-file index
    /// must precede the fragments it references; since `OnePerFragment`'s
    /// final size isn't known until the last fragment is seen, the
    /// fragment bytes are buffered here and only flushed, after the `sidx`,
    /// in `write_single_file_index`.
    single_file_pending_bytes: Vec<u8>,
    /// Running count of bytes written to the sink so far, used to compute
    /// `single_file_sidx_placeholder`'s offset and the ranges below.
    bytes_written: u64,
    init_range: Option<(u64, u64)>,
    index_range: Option<(u64, u64)>,

    listener: L,
}

impl Segmenter<NullListener> {
    pub fn new(init: SegmenterInit) -> Self {
        Segmenter::with_listener(init, NullListener)
    }
}

impl<L: SegmentListener> Segmenter<L> {
    pub fn with_listener(init: SegmenterInit, listener: L) -> Self {
        let config = init.config;
        let fragmenters = init.tracks.iter().map(|t| FragmenterPerTrack::new(t.track_id)).collect();
        let n = init.tracks.len();
        // Fragment/segment durations are expressed in seconds in config but
        // compared against the reference track's own timescale.
        let reference_timescale = u64::from(init.tracks[init.reference_track_index].timescale);
        Segmenter {
            output_file_name: config.output_file_name.clone(),
            segment_template: config.segment_template.clone(),
            is_single_file: config.is_single_file(),
            segment_duration_units: (config.segment_duration * reference_timescale as f64) as u64,
            fragment_duration_units: (config.fragment_duration * reference_timescale as f64) as u64,
            segment_sap_aligned: config.segment_sap_aligned,
            fragment_sap_aligned: config.fragment_sap_aligned,
            sidx_mode: config.sidx_mode(),
            bandwidth: config.bandwidth,
            representation_id: init.representation_id,

            tracks: init.tracks,
            reference_track_index: init.reference_track_index,
            protection_scheme: init.protection_scheme,
            default_key_id: init.default_key_id,
            default_per_sample_iv_size: init.default_per_sample_iv_size,
            crypt_byte_block: init.crypt_byte_block,
            skip_byte_block: init.skip_byte_block,
            psshes: init.psshes,
            creation_time_unix: init.creation_time_unix,
            movie_timescale: init.movie_timescale,

            fragmenters,
            duration_notified: vec![false; n],
            encryption_notified: vec![false; n],

            moof_sequence: 1,
            segment_sequence: 1,
            fragment_start_dts: None,
            segment_start_dts: None,

            pending_fragment_bytes: Vec::new(),
            pending_sidx_refs: Vec::new(),

            single_file_all_refs: Vec::new(),
            single_file_sidx_placeholder: None,
            single_file_pending_bytes: Vec::new(),
            bytes_written: 0,
            init_range: None,
            index_range: None,

            listener,
        }
    }

    /// Builds the initialization data: `ftyp` followed by `moov`. In
    /// single-file mode this opens the one output file — and, when the
    /// eventual `sidx`'s size is bounded in advance
    /// (`SidxMode::Coalesce(n)`, which always yields at most `n`
    /// references), reserves its space immediately after `moov` so it can
    /// precede every fragment (ISO-BMFF on-demand profile) rather than being
    /// appended at the end. In multi-file mode this is written to
    /// `output_file_name` as its own file.
    pub fn write_init(&mut self, sink: &mut dyn SegmentSink) -> Result<(), base::Error> {
        let ftyp = boxes::init::build_ftyp(&self.tracks);
        sink.write_all(&ftyp)?;
        let moov_input = MoovInput {
            tracks: &self.tracks,
            creation_time_unix: self.creation_time_unix,
            movie_timescale: self.movie_timescale,
            protection_scheme: self.protection_scheme,
            default_key_id: self.default_key_id,
            default_per_sample_iv_size: self.default_per_sample_iv_size,
            crypt_byte_block: self.crypt_byte_block,
            skip_byte_block: self.skip_byte_block,
            psshes: &self.psshes,
        };
        let moov = boxes::init::build_moov(&moov_input)?;
        sink.write_all(&moov)?;
        self.bytes_written = (ftyp.len() + moov.len()) as u64;
        self.init_range = Some((0, self.bytes_written));

        if self.is_single_file {
            if let SidxMode::Coalesce(n) = self.sidx_mode {
                let reserved_len = sidx::sidx_box_len(n) as u64;
                let placeholder = build_free_box(reserved_len as usize);
                sink.write_all(&placeholder)?;
                self.single_file_sidx_placeholder = Some((self.bytes_written, reserved_len));
                self.bytes_written += reserved_len;
            }
        }
        Ok(())
    }

    pub fn output_file_name(&self) -> &str {
        &self.output_file_name
    }

    /// The byte range of `ftyp`+`moov` within the single output file. Only
    /// meaningful in single-file mode, and only after [`Segmenter::write_init`]
    /// has run; corresponds to a DASH `<Initialization range="...">`.
    pub fn init_range(&self) -> Option<(u64, u64)> {
        self.init_range
    }

    /// The byte range of the whole-file `sidx` within the single output
    /// file. Only meaningful in single-file mode, and only after
    /// [`Segmenter::finish`] has run; corresponds to a DASH
    /// `<SegmentBase indexRange="...">`.
    pub fn index_range(&self) -> Option<(u64, u64)> {
        self.index_range
    }

    /// Resolves a media segment's file name from `segment_template`, for
    /// multi-file mode. Not called in single-file mode.
    pub fn segment_file_name(&self, number: u32, time: i64) -> Result<String, base::Error> {
        apply_segment_template(&self.segment_template, number, time, self.bandwidth, &self.representation_id)
    }

    /// Feeds one already-converted-and-encrypted sample for `track_idx`
    /// (index into the track list passed at construction, not `track_id`).
    /// Drives the reference track's fragment/segment boundary decisions;
    /// writes newly-closed fragments and segments to `sink` as they occur.
    #[allow(clippy::too_many_arguments)]
    pub fn push_sample(
        &mut self,
        sink: &mut dyn SegmentSink,
        track_idx: usize,
        dts: i64,
        pts: i64,
        is_sync: bool,
        declared_duration: Option<u32>,
        data: Vec<u8>,
        decrypt_config: Option<DecryptConfig>,
    ) -> Result<(), base::Error> {
        self.fragmenters[track_idx].append_sample(dts, pts, is_sync, declared_duration, data, decrypt_config)?;

        if track_idx != self.reference_track_index {
            return Ok(());
        }

        if self.fragment_start_dts.is_none() {
            self.fragment_start_dts = Some(dts);
        }
        if self.segment_start_dts.is_none() {
            self.segment_start_dts = Some(dts);
        }

        let elapsed_fragment = (dts - self.fragment_start_dts.unwrap()).max(0) as u64;
        let fragment_due = elapsed_fragment >= self.fragment_duration_units && (!self.fragment_sap_aligned || is_sync);
        if fragment_due {
            self.cut_fragment(false)?;
            self.fragment_start_dts = Some(dts);

            let elapsed_segment = (dts - self.segment_start_dts.unwrap()).max(0) as u64;
            let segment_due = elapsed_segment >= self.segment_duration_units && (!self.segment_sap_aligned || is_sync);
            if segment_due {
                self.cut_segment(sink)?;
                self.segment_start_dts = Some(dts);
            }
        }
        Ok(())
    }

    /// Flushes everything buffered (final fragment and final segment),
    /// using each track's declared last-sample duration. Call once, after
    /// the last `push_sample`.
    pub fn finish(&mut self, sink: &mut dyn SegmentSink) -> Result<(), base::Error> {
        self.cut_fragment(true)?;
        if !self.pending_fragment_bytes.is_empty() {
            self.cut_segment(sink)?;
        }
        if self.is_single_file {
            self.write_single_file_index(sink)?;
        }
        sink.close()
    }

    /// Writes the single whole-file `sidx` single-file mode accumulates
    /// instead of a `sidx` per segment: patched into the placeholder
    /// reserved in `write_init` when the reference count was bounded in
    /// advance (`SidxMode::Coalesce`), or written fresh ahead of the
    /// fragment bytes buffered for exactly this purpose otherwise
    /// (`SidxMode::OnePerFragment`). Either way the `sidx` ends up
    /// preceding every fragment it references.
    fn write_single_file_index(&mut self, sink: &mut dyn SegmentSink) -> Result<(), base::Error> {
        let refs = std::mem::take(&mut self.single_file_all_refs);
        let sidx_refs = match self.sidx_mode {
            SidxMode::Disabled => Vec::new(),
            SidxMode::OnePerFragment => refs,
            SidxMode::Coalesce(n) => sidx::coalesce_references(&refs, n),
        };
        if sidx_refs.is_empty() {
            return Ok(());
        }

        let reference_track_id = self.tracks[self.reference_track_index].track_id;
        let timescale = self.tracks[self.reference_track_index].timescale;
        let earliest_presentation_time = sidx_refs[0].earliest_presentation_time;
        let sidx_bytes = sidx::build_sidx(reference_track_id, timescale, earliest_presentation_time, 0, &sidx_refs);

        match self.single_file_sidx_placeholder {
            Some((offset, reserved_len)) => {
                // `coalesce_references` never returns more than `n`
                // references (spec.md §4.5's "resize to exactly N" when
                // there were enough fragments to coalesce, fewer than N
                // verbatim otherwise), so the reserved placeholder — sized
                // from `n` alone — is always big enough.
                debug_assert!(sidx_bytes.len() as u64 <= reserved_len, "sidx overflowed its reserved placeholder");
                let mut patch = sidx_bytes;
                let slack = reserved_len - patch.len() as u64;
                if slack > 0 {
                    patch.extend_from_slice(&build_free_box(slack as usize));
                }
                sink.seek_and_overwrite(offset, &patch)?;
                self.index_range = Some((offset, offset + reserved_len));
            }
            None => {
                // `OnePerFragment`'s fragment bytes were held back in
                // `single_file_pending_bytes` rather than written as each
                // segment was cut, precisely so the `sidx` can be written
                // first here and its `first_offset` point forward at
                // genuinely still-unwritten data.
                let offset = self.bytes_written;
                sink.write_all(&sidx_bytes)?;
                self.bytes_written += sidx_bytes.len() as u64;
                self.index_range = Some((offset, self.bytes_written));

                let pending = std::mem::take(&mut self.single_file_pending_bytes);
                if !pending.is_empty() {
                    sink.write_all(&pending)?;
                    self.bytes_written += pending.len() as u64;
                }
            }
        }
        Ok(())
    }

    fn cut_fragment(&mut self, end_of_stream: bool) -> Result<(), base::Error> {
        let mut fragments: Vec<Fragment> = Vec::new();
        for f in &mut self.fragmenters {
            if let Some(frag) = f.finalize(end_of_stream) {
                fragments.push(frag);
            }
        }
        if fragments.is_empty() {
            return Ok(());
        }

        for (idx, track) in self.tracks.iter().enumerate() {
            let Some(frag) = fragments.iter().find(|f| f.track_id == track.track_id) else {
                continue;
            };
            if let Some(sample) = frag.samples.first() {
                if !self.duration_notified[idx] {
                    self.listener.on_sample_duration_ready(track.track_id, sample.duration);
                    self.duration_notified[idx] = true;
                }
                if !self.encryption_notified[idx] {
                    if let Some(cfg) = &sample.decrypt_config {
                        self.listener.on_encryption_info_ready(track.track_id, cfg);
                        self.encryption_notified[idx] = true;
                    }
                }
            }
        }

        let reference_track_id = self.tracks[self.reference_track_index].track_id;
        let reference_fragment = fragments.iter().find(|f| f.track_id == reference_track_id);

        let bytes = moof::build_fragment(self.moof_sequence, &fragments)?;
        self.moof_sequence += 1;

        if let Some(frag) = reference_fragment {
            let earliest_presentation_time = frag.base_decode_time
                + i64::from(frag.samples.first().map_or(0, |s| s.composition_offset));
            self.pending_sidx_refs.push(SidxReference {
                referenced_size: u32::try_from(bytes.len()).expect("fragment size fits in u32"),
                subsegment_duration: u32::try_from(frag.duration()).unwrap_or(u32::MAX),
                earliest_presentation_time,
                starts_with_sap: frag.starts_with_sap,
                sap_type: u8::from(frag.starts_with_sap),
                sap_delta_time: 0,
            });
        }
        self.pending_fragment_bytes.extend_from_slice(&bytes);
        Ok(())
    }

    fn cut_segment(&mut self, sink: &mut dyn SegmentSink) -> Result<(), base::Error> {
        if self.pending_fragment_bytes.is_empty() {
            return Ok(());
        }

        let refs = std::mem::take(&mut self.pending_sidx_refs);
        let fragment_bytes = std::mem::take(&mut self.pending_fragment_bytes);

        // Single-file mode (spec.md §4.5) carries one index for the whole
        // file rather than a `styp`+`sidx` pair per segment: no `styp` is
        // written, and these references join the whole-file accumulator
        // `finish` builds the single `sidx` from.
        let mut out = Vec::with_capacity(fragment_bytes.len() + 64);
        let defer_write = self.is_single_file && matches!(self.sidx_mode, SidxMode::OnePerFragment);
        if self.is_single_file {
            self.single_file_all_refs.extend_from_slice(&refs);
        } else {
            let styp = boxes::init::build_styp(&self.tracks, self.protection_scheme);
            out.extend_from_slice(&styp);
            let sidx_refs = match self.sidx_mode {
                SidxMode::Disabled => Vec::new(),
                SidxMode::OnePerFragment => refs.clone(),
                SidxMode::Coalesce(n) => sidx::coalesce_references(&refs, n),
            };
            if !sidx_refs.is_empty() {
                let reference_track_id = self.tracks[self.reference_track_index].track_id;
                let timescale = self.tracks[self.reference_track_index].timescale;
                let earliest_presentation_time = sidx_refs[0].earliest_presentation_time;
                let first_offset = 0u64;
                out.extend_from_slice(&sidx::build_sidx(
                    reference_track_id,
                    timescale,
                    earliest_presentation_time,
                    first_offset,
                    &sidx_refs,
                ));
            }
        }
        out.extend_from_slice(&fragment_bytes);

        if defer_write {
            // A whole-file `sidx` must precede the fragments it indexes
            // (see `single_file_pending_bytes`'s doc comment); its size
            // isn't known yet, so hold these bytes rather than writing them
            // now. `write_single_file_index` flushes them once the `sidx`
            // has been written in front of them.
            self.single_file_pending_bytes.extend_from_slice(&out);
        } else {
            sink.write_all(&out)?;
            sink.flush()?;
            self.bytes_written += out.len() as u64;
        }

        let earliest_presentation_time = refs.first().map_or(0, |r| r.earliest_presentation_time);
        let duration = refs.iter().map(|r| u64::from(r.subsegment_duration)).sum();
        let segment = Segment {
            sequence_number: self.segment_sequence,
            earliest_presentation_time,
            duration,
            size: u64::try_from(out.len()).expect("segment size fits in u64"),
            file_name: if self.is_single_file {
                None
            } else {
                Some(self.segment_file_name(self.segment_sequence, earliest_presentation_time)?)
            },
        };
        self.segment_sequence += 1;
        self.listener.on_new_segment(&segment);
        Ok(())
    }
}

/// Expands `$Number$`/`$Time$`/`$Bandwidth$`/`$RepresentationID$`, each with
/// an optional width specifier (`$Number%05d$`), and `$$` as a literal `$`
/// (ISO/IEC 23009-1 §5.3.9.4.4).
fn apply_segment_template(template: &str, number: u32, time: i64, bandwidth: u64, representation_id: &str) -> Result<String, base::Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(dollar_pos) = rest.find('$') {
        out.push_str(&rest[..dollar_pos]);
        rest = &rest[dollar_pos + 1..];
        if let Some(stripped) = rest.strip_prefix('$') {
            out.push('$');
            rest = stripped;
            continue;
        }
        let Some(end) = rest.find('$') else {
            bail!(InvalidArgument, msg("unterminated identifier in segment_template {template:?}"));
        };
        let token = &rest[..end];
        rest = &rest[end + 1..];
        out.push_str(&expand_token(token, number, time, bandwidth, representation_id)?);
    }
    out.push_str(rest);
    Ok(out)
}

fn expand_token(token: &str, number: u32, time: i64, bandwidth: u64, representation_id: &str) -> Result<String, base::Error> {
    let (name, format_spec) = match token.find('%') {
        Some(idx) => (&token[..idx], Some(&token[idx + 1..])),
        None => (token, None),
    };
    match name {
        "Number" => format_numeric(u64::from(number), format_spec),
        "Time" => format_numeric(time.max(0) as u64, format_spec),
        "Bandwidth" => format_numeric(bandwidth, format_spec),
        "RepresentationID" => Ok(representation_id.to_string()),
        other => bail!(InvalidArgument, msg("unknown segment_template identifier ${other}$")),
    }
}

fn format_numeric(value: u64, format_spec: Option<&str>) -> Result<String, base::Error> {
    let Some(spec) = format_spec else {
        return Ok(value.to_string());
    };
    let Some(width_str) = spec.strip_suffix('d') else {
        bail!(InvalidArgument, msg("unsupported segment_template format specifier %{spec}"));
    };
    let width: usize = if width_str.is_empty() {
        0
    } else {
        width_str
            .parse()
            .map_err(|_| base::err!(InvalidArgument, msg("bad segment_template width %{width_str}d")))?
    };
    Ok(format!("{value:0width$}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DecoderConfigurationRecord, TrackKind};

    fn track(track_id: u32) -> TrackInfo {
        TrackInfo {
            track_id,
            kind: TrackKind::Video,
            timescale: 90_000,
            decoder_config: DecoderConfigurationRecord::Avc {
                record: vec![1, 0x4d, 0x00, 0x1f],
                rfc6381_codec: "avc1.4d001f".to_string(),
            },
            video_parameters: None,
        }
    }

    fn init(config: &PackagerConfig) -> SegmenterInit {
        SegmenterInit {
            config,
            tracks: vec![track(1)],
            reference_track_index: 0,
            protection_scheme: None,
            default_key_id: [0; 16],
            default_per_sample_iv_size: 8,
            crypt_byte_block: 0,
            skip_byte_block: 0,
            psshes: Vec::new(),
            creation_time_unix: 0,
            movie_timescale: 90_000,
            representation_id: "v1".to_string(),
        }
    }

    /// Multi-file mode: a non-empty `segment_template`.
    fn base_config() -> PackagerConfig {
        PackagerConfig {
            output_file_name: "init.mp4".to_string(),
            segment_template: "seg-$Number%05d$.m4s".to_string(),
            segment_duration: 4.0,
            fragment_duration: 2.0,
            segment_sap_aligned: true,
            fragment_sap_aligned: true,
            num_subsegments_per_sidx: 0,
            bandwidth: 500_000,
            protection: None,
        }
    }

    #[test]
    fn template_expands_number_with_width_and_literal_dollar() {
        let out = apply_segment_template("seg-$Number%05d$-$$end.m4s", 7, 0, 0, "v1").unwrap();
        assert_eq!(out, "seg-00007-$end.m4s");
    }

    #[test]
    fn template_expands_representation_id_and_bandwidth() {
        let out = apply_segment_template("$RepresentationID$/$Bandwidth$.m4s", 0, 0, 500_000, "video-1").unwrap();
        assert_eq!(out, "video-1/500000.m4s");
    }

    #[test]
    fn unknown_identifier_is_invalid_argument() {
        let err = apply_segment_template("$Nope$", 0, 0, 0, "").unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn pushing_samples_cuts_fragments_and_segments_at_sap_boundaries() {
        let config = base_config();
        let mut seg = Segmenter::new(init(&config));
        let mut sink = crate::sink::BufferSink::new();
        seg.write_init(&mut sink).unwrap();

        // 90_000 timescale; fragment_duration=2s => 180_000 units,
        // segment_duration=4s => 360_000 units. Five SAPs 2s apart give two
        // full segments (4s each) plus a one-fragment remainder.
        for i in 0..5i64 {
            seg.push_sample(&mut sink, 0, i * 180_000, i * 180_000, true, None, vec![0; 4], None)
                .unwrap();
        }
        seg.finish(&mut sink).unwrap();

        let bytes = sink.into_inner();
        // ftyp + moov + at least two styp-prefixed segments should all be present.
        assert!(bytes.windows(4).any(|w| w == b"ftyp"));
        assert!(bytes.windows(4).any(|w| w == b"moov"));
        let styp_count = bytes.windows(4).filter(|w| *w == b"styp").count();
        assert!(styp_count >= 2, "expected at least 2 styp boxes, saw {styp_count}");
    }

    #[test]
    fn coalesce_mode_still_produces_valid_segments() {
        let mut config = base_config();
        config.num_subsegments_per_sidx = 1;
        let mut seg = Segmenter::new(init(&config));
        let mut sink = crate::sink::BufferSink::new();
        seg.write_init(&mut sink).unwrap();
        for i in 0..3i64 {
            seg.push_sample(&mut sink, 0, i * 180_000, i * 180_000, true, None, vec![0; 4], None)
                .unwrap();
        }
        seg.finish(&mut sink).unwrap();
        let bytes = sink.into_inner();
        assert!(bytes.windows(4).any(|w| w == b"sidx"));
        let styp_count = bytes.windows(4).filter(|w| *w == b"styp").count();
        assert!(styp_count >= 2, "multi-file mode still styp-prefixes every segment, saw {styp_count}");
    }

    /// Single-file mode: an empty `segment_template`.
    fn single_file_config() -> PackagerConfig {
        let mut config = base_config();
        config.segment_template = String::new();
        config
    }

    fn push_five_samples(seg: &mut Segmenter, sink: &mut crate::sink::BufferSink) {
        for i in 0..5i64 {
            seg.push_sample(sink, 0, i * 180_000, i * 180_000, true, None, vec![0; 4], None)
                .unwrap();
        }
        seg.finish(sink).unwrap();
    }

    #[test]
    fn single_file_mode_never_emits_styp() {
        let config = single_file_config();
        let mut seg = Segmenter::new(init(&config));
        let mut sink = crate::sink::BufferSink::new();
        seg.write_init(&mut sink).unwrap();
        push_five_samples(&mut seg, &mut sink);

        let bytes = sink.into_inner();
        assert!(bytes.windows(4).any(|w| w == b"ftyp"));
        assert!(bytes.windows(4).any(|w| w == b"moov"));
        assert!(bytes.windows(4).any(|w| w == b"moof"));
        assert_eq!(bytes.windows(4).filter(|w| *w == b"styp").count(), 0);
    }

    #[test]
    fn single_file_mode_disabled_sidx_writes_no_sidx() {
        let mut config = single_file_config();
        config.num_subsegments_per_sidx = -1;
        let mut seg = Segmenter::new(init(&config));
        let mut sink = crate::sink::BufferSink::new();
        seg.write_init(&mut sink).unwrap();
        push_five_samples(&mut seg, &mut sink);

        let bytes = sink.into_inner();
        assert_eq!(bytes.windows(4).filter(|w| *w == b"sidx").count(), 0);
        assert!(seg.index_range().is_none());
    }

    #[test]
    fn single_file_mode_one_per_fragment_writes_one_sidx_ahead_of_every_fragment() {
        let mut config = single_file_config();
        config.num_subsegments_per_sidx = 0; // OnePerFragment
        let mut seg = Segmenter::new(init(&config));
        let mut sink = crate::sink::BufferSink::new();
        seg.write_init(&mut sink).unwrap();
        push_five_samples(&mut seg, &mut sink);

        let bytes = sink.into_inner();
        assert_eq!(bytes.windows(4).filter(|w| *w == b"sidx").count(), 1);
        // `sidx.first_offset` is a forward-only distance from the box's own
        // end (ISO/IEC 14496-12 §8.16.3), so the single whole-file index
        // must precede every fragment it references, the same as the
        // bounded Coalesce(n) placeholder path does.
        let sidx_pos = bytes.windows(4).position(|w| w == b"sidx").unwrap();
        let first_moof_pos = bytes.windows(4).position(|w| w == b"moof").unwrap();
        assert!(sidx_pos < first_moof_pos, "OnePerFragment sidx must precede every fragment");

        let (index_off, _index_end) = seg.index_range().unwrap();
        assert_eq!(index_off as usize, sidx_pos - 4); // box starts 4 bytes before the fourcc
    }

    #[test]
    fn single_file_mode_coalesce_reserves_sidx_right_after_moov() {
        let mut config = single_file_config();
        config.num_subsegments_per_sidx = 2;
        let mut seg = Segmenter::new(init(&config));
        let mut sink = crate::sink::BufferSink::new();
        seg.write_init(&mut sink).unwrap();
        let (init_off, init_end) = seg.init_range().unwrap();
        assert_eq!(init_off, 0);
        push_five_samples(&mut seg, &mut sink);

        let bytes = sink.into_inner();
        assert_eq!(bytes.windows(4).filter(|w| *w == b"sidx").count(), 1);
        let sidx_pos = bytes.windows(4).position(|w| w == b"sidx").unwrap();
        let first_moof_pos = bytes.windows(4).position(|w| w == b"moof").unwrap();
        assert!(
            sidx_pos < first_moof_pos,
            "Coalesce sidx must be reserved right after moov, before the first moof"
        );
        assert_eq!(sidx_pos as u64 - 4, init_end, "sidx placeholder immediately follows moov");

        let (index_off, index_end) = seg.index_range().unwrap();
        assert_eq!(index_off, init_end);
        assert_eq!(index_end - index_off, crate::boxes::sidx::sidx_box_len(2) as u64);
    }

    #[test]
    fn single_file_mode_coalesce_pads_reserved_space_when_final_count_is_smaller() {
        // Five SAPs 2s apart, 4s segments => two full "segments" worth of
        // fragments plus a remainder; coalescing into 4 groups while only 3
        // fragments exist leaves the placeholder oversized, exercising the
        // trailing `free`-box padding branch.
        let mut config = single_file_config();
        config.num_subsegments_per_sidx = 4;
        let mut seg = Segmenter::new(init(&config));
        let mut sink = crate::sink::BufferSink::new();
        seg.write_init(&mut sink).unwrap();
        for i in 0..3i64 {
            seg.push_sample(&mut sink, 0, i * 180_000, i * 180_000, true, None, vec![0; 4], None)
                .unwrap();
        }
        seg.finish(&mut sink).unwrap();

        let bytes = sink.into_inner();
        assert_eq!(bytes.windows(4).filter(|w| *w == b"sidx").count(), 1);
        assert!(bytes.windows(4).any(|w| w == b"free"), "leftover reserved space is padded with a free box");

        let (index_off, index_end) = seg.index_range().unwrap();
        assert_eq!(index_end - index_off, crate::boxes::sidx::sidx_box_len(4) as u64);
    }
}
