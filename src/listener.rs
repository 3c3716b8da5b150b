// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Notification hooks the `Segmenter` fires as it produces output, in the
//! small-capability-trait style the teacher uses for `SampleIndexSoftLimit`/
//! `Clocks` (one tiny trait per concern, default no-op bodies so a caller
//! only overrides what it cares about).

use crate::model::{DecryptConfig, Segment};

/// Observes segment boundaries and media-timing facts as they become known.
/// All methods default to doing nothing; a caller interested only in e.g.
/// manifest generation overrides just `on_new_segment`.
pub trait SegmentListener {
    /// Fired once a [`Segment`] has been fully written (its file closed, in
    /// multi-file mode, or its span within the single output file known).
    fn on_new_segment(&mut self, _segment: &Segment) {}

    /// Fired the first time a track's sample duration becomes fixed (the
    /// first `Fragmenter::finalize` call that commits a sample), since a
    /// DASH manifest's `SegmentTemplate/@duration` wants this as early as
    /// possible rather than only at the end of the stream.
    fn on_sample_duration_ready(&mut self, _track_id: u32, _duration: u32) {}

    /// Fired once per encrypted track, the first time its [`DecryptConfig`]
    /// is known, so a manifest's `ContentProtection` element can be emitted
    /// without waiting for the first full segment to close.
    fn on_encryption_info_ready(&mut self, _track_id: u32, _decrypt_config: &DecryptConfig) {}
}

/// A listener that does nothing, for callers with no manifest/metrics
/// collaborator to notify.
#[derive(Default)]
pub struct NullListener;

impl SegmentListener for NullListener {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProtectionScheme, SubsampleEntry};

    #[derive(Default)]
    struct RecordingListener {
        segments: Vec<u32>,
        durations: Vec<(u32, u32)>,
    }

    impl SegmentListener for RecordingListener {
        fn on_new_segment(&mut self, segment: &Segment) {
            self.segments.push(segment.sequence_number);
        }

        fn on_sample_duration_ready(&mut self, track_id: u32, duration: u32) {
            self.durations.push((track_id, duration));
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        let mut l = NullListener;
        l.on_new_segment(&Segment {
            sequence_number: 1,
            earliest_presentation_time: 0,
            duration: 0,
            size: 0,
            file_name: None,
        });
        l.on_sample_duration_ready(1, 3000);
        l.on_encryption_info_ready(
            1,
            &DecryptConfig {
                key_id: [0; 16],
                iv: vec![0; 8],
                subsamples: vec![SubsampleEntry {
                    clear_bytes: 0,
                    cipher_bytes: 0,
                }],
                protection_scheme: ProtectionScheme::Cenc,
                crypt_byte_block: 0,
                skip_byte_block: 0,
            },
        );
    }

    #[test]
    fn overridden_methods_record_calls() {
        let mut l = RecordingListener::default();
        l.on_new_segment(&Segment {
            sequence_number: 7,
            earliest_presentation_time: 0,
            duration: 0,
            size: 0,
            file_name: None,
        });
        l.on_sample_duration_ready(2, 1500);
        assert_eq!(l.segments, vec![7]);
        assert_eq!(l.durations, vec![(2, 1500)]);
    }
}
