// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Buffers one track's samples into a pending fragment.
//!
//! Grounded on `db/writer.rs::InnerWriter`'s `unflushed_sample` discipline:
//! a sample's duration is the gap to the *next* sample's timestamp, so a
//! sample is held back as `pending` until either another sample arrives
//! (fixing its duration) or the fragment is forced closed at end of stream
//! (in which case its own declared duration, if any, is used as-is — ISO-BMFF
//! allows a zero-duration final sample).
//!
//! Boundary policy — *when* to finalize — is the `Segmenter`'s job (`spec.md`
//! §4.4: "The Segmenter tells the Fragmenter to finalize the current
//! fragment"); this type only ever does what it's told.

use crate::model::{DecryptConfig, Fragment, SampleRecord};
use base::bail;

struct PendingSample {
    dts: i64,
    pts: i64,
    is_sync: bool,
    /// The sample's own declared duration, used only if this turns out to be
    /// the last sample before the track ends (there being no "next" sample
    /// to derive a duration from).
    declared_duration: Option<u32>,
    data: Vec<u8>,
    decrypt_config: Option<DecryptConfig>,
}

/// Per-track fragment accumulator. One instance per track, reused across
/// fragments and segments for the life of the packaging session.
pub struct FragmenterPerTrack {
    track_id: u32,
    base_decode_time: Option<i64>,
    samples: Vec<SampleRecord>,
    sample_data: Vec<u8>,
    starts_with_sap: bool,
    pending: Option<PendingSample>,
}

impl FragmenterPerTrack {
    pub fn new(track_id: u32) -> Self {
        FragmenterPerTrack {
            track_id,
            base_decode_time: None,
            samples: Vec::new(),
            sample_data: Vec::new(),
            starts_with_sap: false,
            pending: None,
        }
    }

    /// True iff there is buffered (committed or pending) state that a
    /// segment boundary would need to account for.
    pub fn has_pending_work(&self) -> bool {
        !self.samples.is_empty() || self.pending.is_some()
    }

    /// Appends one already-converted-and-encrypted sample. `data` is the
    /// exact bytes that will land in `mdat` (length-prefixed NAL data,
    /// encrypted in place if a `decrypt_config` is supplied).
    #[allow(clippy::too_many_arguments)]
    pub fn append_sample(
        &mut self,
        dts: i64,
        pts: i64,
        is_sync: bool,
        declared_duration: Option<u32>,
        data: Vec<u8>,
        decrypt_config: Option<DecryptConfig>,
    ) -> Result<(), base::Error> {
        if let Some(prev) = self.pending.take() {
            let duration = dts - prev.dts;
            if duration <= 0 {
                bail!(
                    Internal,
                    msg(
                        "track {}: DTS not monotonically increasing; got {} then {}",
                        self.track_id,
                        prev.dts,
                        dts
                    )
                );
            }
            self.commit(duration as u32, prev);
        }
        self.pending = Some(PendingSample {
            dts,
            pts,
            is_sync,
            declared_duration,
            data,
            decrypt_config,
        });
        Ok(())
    }

    fn commit(&mut self, duration: u32, pending: PendingSample) {
        if self.samples.is_empty() {
            self.base_decode_time = Some(pending.dts);
            self.starts_with_sap = pending.is_sync;
        }
        self.samples.push(SampleRecord {
            size: u32::try_from(pending.data.len()).expect("sample size fits in u32"),
            duration,
            is_sync: pending.is_sync,
            composition_offset: i32::try_from(pending.pts - pending.dts)
                .expect("composition offset fits in i32"),
            decrypt_config: pending.decrypt_config,
        });
        self.sample_data.extend_from_slice(&pending.data);
    }

    /// Finalizes whatever has been committed into a [`Fragment`]. When
    /// `end_of_stream` is set, the pending (not-yet-committed) sample, if
    /// any, is committed too, using its own declared duration (defaulting to
    /// zero if the caller never supplied one). Returns `None` if there is
    /// nothing to emit.
    pub fn finalize(&mut self, end_of_stream: bool) -> Option<Fragment> {
        if end_of_stream {
            if let Some(pending) = self.pending.take() {
                let duration = pending.declared_duration.unwrap_or(0);
                self.commit(duration, pending);
            }
        }
        if self.samples.is_empty() {
            return None;
        }
        let fragment = Fragment {
            track_id: self.track_id,
            base_decode_time: self
                .base_decode_time
                .expect("non-empty samples implies a base decode time"),
            sample_data: std::mem::take(&mut self.sample_data),
            samples: std::mem::take(&mut self.samples),
            starts_with_sap: self.starts_with_sap,
        };
        self.base_decode_time = None;
        self.starts_with_sap = false;
        Some(fragment)
    }
}
