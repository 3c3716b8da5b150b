// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Top-level orchestration: for each track, pushes a raw Annex-B access unit
//! through its [`BitstreamConverter`] (if any), then its
//! [`SampleEncryptor`] (if a key is installed), then hands the result to the
//! [`Segmenter`].
//!
//! `spec.md` §2: "the Segmenter pulls samples from upstream demuxers, hands
//! each video sample through the BitstreamConverter, then through the
//! SampleEncryptor (if a key is installed), then appends to the per-track
//! Fragmenter." Grounded on the teacher's `streamer.rs::Streamer::run` pump
//! loop, which does the analogous "convert `orig_data` via
//! `h264::transform_sample_data` if `need_transform`, then write" for one
//! non-fragmented, unencrypted track; this generalizes that to N tracks, an
//! optional CENC encryption step, and the fragmenter/segmenter machinery
//! `spec.md` §4.4-4.5 describe in place of the teacher's single `db::Writer`.

use crate::bitstream::{BitstreamConverter, ConvertedSample};
use crate::crypto::SampleEncryptor;
use crate::listener::{NullListener, SegmentListener};
use crate::segmenter::{Segmenter, SegmenterInit};
use crate::sink::SegmentSink;
use base::ErrorKind;

/// Per-track pipeline state supplied at construction: how (if at all) this
/// track's samples are converted from Annex-B and encrypted. A track with
/// `converter: None` is passed through unchanged (e.g. a codec whose samples
/// already arrive length-prefixed); `encryptor: None` packages the track in
/// clear.
pub struct TrackPipelineInit {
    pub converter: Option<Box<dyn BitstreamConverter>>,
    pub encryptor: Option<SampleEncryptor>,
}

struct TrackPipeline {
    converter: Option<Box<dyn BitstreamConverter>>,
    encryptor: Option<SampleEncryptor>,
}

/// Drives the whole packaging pipeline for every track in a mux: bitstream
/// conversion, CENC encryption, fragmentation, and segmentation.
pub struct Packager<L: SegmentListener = NullListener> {
    segmenter: Segmenter<L>,
    tracks: Vec<TrackPipeline>,
}

impl Packager<NullListener> {
    pub fn new(init: SegmenterInit, track_pipelines: Vec<TrackPipelineInit>) -> Self {
        Packager::with_listener(init, track_pipelines, NullListener)
    }
}

impl<L: SegmentListener> Packager<L> {
    pub fn with_listener(init: SegmenterInit, track_pipelines: Vec<TrackPipelineInit>, listener: L) -> Self {
        assert_eq!(
            init.tracks.len(),
            track_pipelines.len(),
            "one pipeline entry is required per track"
        );
        let tracks = track_pipelines
            .into_iter()
            .map(|p| TrackPipeline {
                converter: p.converter,
                encryptor: p.encryptor,
            })
            .collect();
        Packager {
            segmenter: Segmenter::with_listener(init, listener),
            tracks,
        }
    }

    pub fn write_init(&mut self, sink: &mut dyn SegmentSink) -> Result<(), base::Error> {
        self.segmenter.write_init(sink)
    }

    /// Pushes one raw access unit for `track_idx`. `annexb` is Annex-B form
    /// (H.264/H.265) if the track has a [`BitstreamConverter`] installed,
    /// already length-prefixed sample data otherwise.
    ///
    /// `spec.md` §7: a malformed bitstream is `PARSER_FAILURE`, non-fatal
    /// per sample — the sample is dropped rather than propagated. The same
    /// policy applies to a mid-fragment parameter-set change that isn't at a
    /// SAP (`spec.md` §9's open question; this crate's answer, recorded in
    /// `DESIGN.md`, is to refuse rather than silently overwrite the
    /// in-flight segment's decoder configuration record): the offending
    /// sample is dropped and the stream continues from the next one, which
    /// the `Segmenter`'s normal SAP-aligned boundary logic will cut a new
    /// segment at.
    #[allow(clippy::too_many_arguments)]
    pub fn push_sample(
        &mut self,
        sink: &mut dyn SegmentSink,
        track_idx: usize,
        dts: i64,
        pts: i64,
        is_sync: bool,
        declared_duration: Option<u32>,
        annexb: &[u8],
    ) -> Result<(), base::Error> {
        let pipeline = &mut self.tracks[track_idx];

        let converted = match &mut pipeline.converter {
            Some(conv) => match conv.convert_sample(annexb) {
                Ok(c) => c,
                Err(e) if e.kind() == ErrorKind::ParserFailure => {
                    tracing::warn!(track_idx, dts, err = %e.chain(), "dropping malformed sample");
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            None => ConvertedSample {
                data: annexb.to_vec(),
                nal_ranges: smallvec::SmallVec::new(),
                parameter_sets_changed: false,
            },
        };

        if converted.parameter_sets_changed && !is_sync {
            tracing::warn!(
                track_idx,
                dts,
                "dropping sample: parameter sets changed mid-fragment, not at a SAP"
            );
            return Ok(());
        }

        let (data, decrypt_config) = match &mut pipeline.encryptor {
            Some(enc) => {
                let (ciphertext, cfg) = enc.encrypt(&converted)?;
                (ciphertext, Some(cfg))
            }
            None => (converted.data, None),
        };

        tracing::trace!(track_idx, dts, pts, size = data.len(), "pushing sample");
        self.segmenter
            .push_sample(sink, track_idx, dts, pts, is_sync, declared_duration, data, decrypt_config)
    }

    /// Flushes the final fragment and segment, then closes `sink`.
    pub fn finish(&mut self, sink: &mut dyn SegmentSink) -> Result<(), base::Error> {
        self.segmenter.finish(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::h264::H264Converter;
    use crate::crypto::SampleEncryptor;
    use crate::model::{DecoderConfigurationRecord, ProtectionScheme, TrackInfo, TrackKind};
    use crate::sink::BufferSink;

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for n in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(n);
        }
        out
    }

    #[rustfmt::skip]
    const SPS: [u8; 23] = [
        0x67, 0x4d, 0x00, 0x1f, 0x9a, 0x66, 0x02, 0x80, 0x2d, 0xff, 0x35, 0x01,
        0x01, 0x01, 0x40, 0x00, 0x00, 0xfa, 0x00, 0x00, 0x1d, 0x4c, 0x01,
    ];
    const PPS: [u8; 4] = [0x68, 0xee, 0x3c, 0x80];

    fn track() -> TrackInfo {
        TrackInfo {
            track_id: 1,
            kind: TrackKind::Video,
            timescale: 90_000,
            decoder_config: DecoderConfigurationRecord::Avc {
                record: vec![1, 0x4d, 0x00, 0x1f],
                rfc6381_codec: "avc1.4d001f".to_string(),
            },
            video_parameters: None,
        }
    }

    fn base_init(config: &PackagerConfig) -> SegmenterInit {
        SegmenterInit {
            config,
            tracks: vec![track()],
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

    fn base_config() -> PackagerConfig {
        PackagerConfig {
            output_file_name: "init.mp4".to_string(),
            segment_template: String::new(),
            segment_duration: 4.0,
            fragment_duration: 2.0,
            segment_sap_aligned: true,
            fragment_sap_aligned: true,
            num_subsegments_per_sidx: 0,
            bandwidth: 0,
            protection: None,
        }
    }

    use crate::config::PackagerConfig;

    #[test]
    fn converts_and_segments_a_clear_track() {
        let config = base_config();
        let init = base_init(&config);
        let pipelines = vec![TrackPipelineInit {
            converter: Some(Box::new(H264Converter::new())),
            encryptor: None,
        }];
        let mut packager = Packager::new(init, pipelines);
        let mut sink = BufferSink::new();
        packager.write_init(&mut sink).unwrap();

        for i in 0..5i64 {
            let slice = [0x65, 0b1_0001000, 0xaa, 0xbb];
            let sample = if i == 0 {
                annexb(&[&SPS, &PPS, &slice])
            } else {
                annexb(&[&slice])
            };
            packager
                .push_sample(&mut sink, 0, i * 180_000, i * 180_000, true, None, &sample)
                .unwrap();
        }
        packager.finish(&mut sink).unwrap();

        let bytes = sink.into_inner();
        assert!(bytes.windows(4).any(|w| w == b"moov"));
        assert!(bytes.windows(4).any(|w| w == b"moof"));
        // The SPS/PPS never land in `mdat`.
        assert!(!bytes.windows(SPS.len()).any(|w| w == SPS));
    }

    #[test]
    fn encrypts_converted_samples_before_segmenting() {
        let mut config = base_config();
        config.protection = Some(crate::config::EncryptionConfig {
            scheme: crate::config::ConfigProtectionScheme::Cenc,
            crypt_byte_block: 0,
            skip_byte_block: 0,
        });
        let mut init = base_init(&config);
        init.protection_scheme = Some(ProtectionScheme::Cenc);

        let encryptor = SampleEncryptor::new(
            vec![0u8; 16],
            [9u8; 16],
            ProtectionScheme::Cenc,
            0,
            0,
            vec![0u8; 8],
            false,
        )
        .unwrap();
        let pipelines = vec![TrackPipelineInit {
            converter: Some(Box::new(H264Converter::new())),
            encryptor: Some(encryptor),
        }];
        let mut packager = Packager::new(init, pipelines);
        let mut sink = BufferSink::new();
        packager.write_init(&mut sink).unwrap();

        let slice = [0x65, 0b1_0001000, 0xaa, 0xbb, 0xcc, 0xdd];
        let sample = annexb(&[&SPS, &PPS, &slice]);
        packager.push_sample(&mut sink, 0, 0, 0, true, Some(3000), &sample).unwrap();
        packager.finish(&mut sink).unwrap();

        let bytes = sink.into_inner();
        assert!(bytes.windows(4).any(|w| w == b"senc"));
    }

    #[test]
    fn malformed_sample_is_dropped_not_fatal() {
        let config = base_config();
        let init = base_init(&config);
        let pipelines = vec![TrackPipelineInit {
            converter: Some(Box::new(H264Converter::new())),
            encryptor: None,
        }];
        let mut packager = Packager::new(init, pipelines);
        let mut sink = BufferSink::new();
        packager.write_init(&mut sink).unwrap();

        // An empty NAL unit between two start codes is a parser failure.
        let bad = [0, 0, 0, 1, 0, 0, 0, 1, 0x65, 0xaa];
        packager.push_sample(&mut sink, 0, 0, 0, true, None, &bad).unwrap();
        packager.finish(&mut sink).unwrap();
    }
}
