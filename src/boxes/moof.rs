// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! `moof`/`mdat`, and the CENC auxiliary-info boxes (`saiz`/`saio`/`senc`)
//! that ride along in `traf` when a track is encrypted.
//!
//! Grounded on the teacher's `append_moof`/`append_truns`
//! (`server/src/mp4.rs`): `mfhd`/`tfhd`/`tfdt` are carried over near
//! verbatim (the teacher hardcodes a single track and a zero
//! `baseMediaDecodeTime`; this generalizes both to per-`Fragment` values).
//! `saiz`/`senc` have no teacher precedent — their wire layout is grounded
//! on `other_examples/86823c05_...senc.rs.rs` instead (see `DESIGN.md`).

use super::BoxWriter;
use crate::model::Fragment;
use base::bail;

/// Box/field ordering within `traf` chosen here: `tfhd`, `tfdt`, `senc`,
/// `saiz`, `saio`, `trun`. ISO/IEC 14496-12 only constrains `tfhd` before
/// `tfdt` before the first `trun`; writing `senc` before `saiz`/`saio` lets
/// `saio`'s offset be computed from `senc`'s already-known start position
/// instead of a forward reference.
pub fn build_fragment(sequence_number: u32, fragments: &[Fragment]) -> Result<Vec<u8>, base::Error> {
    let mut w = BoxWriter::new();
    let mut data_offset_positions = Vec::with_capacity(fragments.len());

    w.write_box(b"moof", |w| {
        w.write_full_box(b"mfhd", 0, 0, |w| w.u32(sequence_number));
        for frag in fragments {
            w.write_box(b"traf", |w| {
                append_tfhd(w, frag.track_id);
                append_tfdt(w, frag.base_decode_time);
                let encrypted = frag.samples.iter().any(|s| s.decrypt_config.is_some());
                if encrypted {
                    append_senc_saiz_saio(w, frag);
                }
                let pos = append_trun(w, frag);
                data_offset_positions.push(pos);
            });
        }
    });

    let moof_len = w.len();
    let mut data_offset = moof_len + 8; // + mdat box header
    for (frag, pos) in fragments.iter().zip(&data_offset_positions) {
        let offset = u32::try_from(data_offset)
            .map_err(|_| base::err!(Internal, msg("fragment data offset {data_offset} exceeds u32")))?;
        w.patch_u32(*pos, offset);
        data_offset += frag.sample_data.len();
    }

    w.write_box(b"mdat", |w| {
        for frag in fragments {
            w.bytes(&frag.sample_data);
        }
    });

    Ok(w.into_inner())
}

/// `TrackFragmentHeaderBox` (ISO/IEC 14496-12 §8.8.7). `default-base-is-moof`
/// (0x020000) is always set; per-sample `trun` fields carry size/duration/
/// flags/composition-offset, so no `tfhd` defaults are needed.
fn append_tfhd(w: &mut BoxWriter, track_id: u32) {
    w.write_full_box(b"tfhd", 0, 0x02_0000, |w| {
        w.u32(track_id);
    });
}

/// `TrackFragmentBaseMediaDecodeTimeBox`, version 1 (ISO/IEC 14496-12
/// §8.8.12), 64-bit `base_decode_time`.
fn append_tfdt(w: &mut BoxWriter, base_decode_time: i64) {
    w.write_full_box(b"tfdt", 1, 0, |w| {
        w.i64(base_decode_time);
    });
}

fn append_senc_saiz_saio(w: &mut BoxWriter, frag: &Fragment) {
    // `saiz`/`senc` list only the encrypted subset of `frag.samples`, in
    // order; a generic CENC parser assumes that subset's i-th entry maps to
    // `trun`'s i-th encrypted sample, which only holds if encryption is
    // all-or-nothing across one fragment.
    debug_assert!(
        frag.samples.iter().all(|s| s.decrypt_config.is_some()) || frag.samples.iter().all(|s| s.decrypt_config.is_none()),
        "a fragment's samples must be uniformly encrypted or uniformly clear"
    );
    let senc_pos = w.len();
    w.write_full_box(b"senc", 0, 0x0000_02, |w| {
        let count = frag
            .samples
            .iter()
            .filter(|s| s.decrypt_config.is_some())
            .count();
        w.u32(u32::try_from(count).expect("sample count fits in u32"));
        for sample in &frag.samples {
            let Some(cfg) = &sample.decrypt_config else {
                continue;
            };
            w.bytes(&cfg.iv);
            w.u16(u16::try_from(cfg.subsamples.len()).expect("subsample count fits in u16"));
            for ss in &cfg.subsamples {
                w.u16(ss.clear_bytes);
                w.u32(ss.cipher_bytes);
            }
        }
    });
    // `senc`'s sample-count field sits right after its 12-byte full-box
    // header; the IVs/subsample tables this `saio` points at start
    // immediately after.
    let aux_info_offset = senc_pos + 16;

    w.write_full_box(b"saiz", 0, 0, |w| {
        w.u8(0); // default_sample_info_size: 0, sizes vary (subsample counts differ)
        let count = frag
            .samples
            .iter()
            .filter(|s| s.decrypt_config.is_some())
            .count();
        w.u32(u32::try_from(count).expect("sample count fits in u32"));
        for sample in &frag.samples {
            let Some(cfg) = &sample.decrypt_config else {
                continue;
            };
            let size = cfg.iv.len() + 2 + cfg.subsamples.len() * 6;
            w.u8(u8::try_from(size).expect("per-sample aux info size fits in u8"));
        }
    });

    w.write_full_box(b"saio", 0, 0, |w| {
        w.u32(1); // entry_count
        w.u32(u32::try_from(aux_info_offset).expect("aux info offset fits in u32"));
    });
}

/// `TrackRunBox`, version 1 (ISO/IEC 14496-12 §8.8.8). Returns the absolute
/// position within `w`'s buffer of the `data_offset` field, so the caller
/// can patch it once the full `moof` length is known.
fn append_trun(w: &mut BoxWriter, frag: &Fragment) -> usize {
    const DATA_OFFSET_PRESENT: u32 = 0x00_0001;
    const SAMPLE_DURATION_PRESENT: u32 = 0x00_0100;
    const SAMPLE_SIZE_PRESENT: u32 = 0x00_0200;
    const SAMPLE_FLAGS_PRESENT: u32 = 0x00_0400;
    const SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT: u32 = 0x00_0800;
    let flags = DATA_OFFSET_PRESENT
        | SAMPLE_DURATION_PRESENT
        | SAMPLE_SIZE_PRESENT
        | SAMPLE_FLAGS_PRESENT
        | SAMPLE_COMPOSITION_TIME_OFFSETS_PRESENT;

    let mut data_offset_pos = 0;
    w.write_full_box(b"trun", 1, flags, |w| {
        w.u32(u32::try_from(frag.samples.len()).expect("sample count fits in u32"));
        data_offset_pos = w.len();
        w.i32(0); // data_offset, patched by the caller once known
        for sample in &frag.samples {
            w.u32(sample.duration);
            w.u32(sample.size);
            w.u32(sample_flags(sample.is_sync));
            w.i32(sample.composition_offset);
        }
    });
    data_offset_pos
}

/// ISO/IEC 14496-12 §8.8.3.1 sample flags: `is_leading`(2) /
/// `sample_depends_on`(2) / `sample_is_depended_on`(2) /
/// `sample_has_redundancy`(2) / `sample_padding_value`(3) /
/// `sample_is_non_sync_sample`(1) / `sample_degradation_priority`(16).
fn sample_flags(is_sync: bool) -> u32 {
    if is_sync {
        // A sync sample depends on no other sample (2) and is not itself
        // non-sync (bit clear).
        0x0200_0000
    } else {
        // Depends on others (1), is a non-sync sample.
        0x0101_0000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DecryptConfig, ProtectionScheme, SampleRecord, SubsampleEntry};

    fn plain_fragment(track_id: u32, sizes: &[u32]) -> Fragment {
        Fragment {
            track_id,
            base_decode_time: 1000,
            sample_data: sizes.iter().flat_map(|&n| vec![0u8; n as usize]).collect(),
            samples: sizes
                .iter()
                .map(|&size| SampleRecord {
                    size,
                    duration: 3000,
                    is_sync: true,
                    composition_offset: 0,
                    decrypt_config: None,
                })
                .collect(),
            starts_with_sap: true,
        }
    }

    #[test]
    fn data_offset_points_past_moof_into_mdat() {
        let frag = plain_fragment(1, &[10, 20]);
        let bytes = build_fragment(1, std::slice::from_ref(&frag)).unwrap();
        // moof is the first box; find its length from the header.
        let moof_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(&bytes[4..8], b"moof");
        assert_eq!(&bytes[moof_len..moof_len + 4][..], (8 + 30u32).to_be_bytes());
        assert_eq!(&bytes[moof_len + 4..moof_len + 8], b"mdat");
    }

    #[test]
    fn encrypted_fragment_gets_senc_saiz_saio() {
        let mut frag = plain_fragment(1, &[16]);
        frag.samples[0].decrypt_config = Some(DecryptConfig {
            key_id: [1; 16],
            iv: vec![0; 8],
            subsamples: vec![SubsampleEntry {
                clear_bytes: 5,
                cipher_bytes: 11,
            }],
            protection_scheme: ProtectionScheme::Cenc,
            crypt_byte_block: 0,
            skip_byte_block: 0,
        });
        let bytes = build_fragment(1, std::slice::from_ref(&frag)).unwrap();
        for needle in [&b"senc"[..], b"saiz", b"saio", b"trun", b"tfhd", b"tfdt"] {
            assert!(bytes.windows(4).any(|w| w == needle));
        }
    }
}
