// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! `sidx` (`SegmentIndexBox`, ISO/IEC 14496-12 §8.16.3) construction and the
//! subsegment-coalescing algorithm from `spec.md` §4.5.
//!
//! No teacher precedent exists (the teacher serves progressive, non-indexed
//! `.mp4` over HTTP range requests and never builds a `sidx`); the box layout
//! is taken directly from ISO/IEC 14496-12, written with the same
//! `BoxWriter` discipline as every other box in this crate.

use super::BoxWriter;
use crate::model::SidxReference;

/// If `num_subsegments` is `None`, the references are passed through
/// one-per-fragment (`spec.md` §4.5 "If zero, one reference per fragment").
/// If `Some(n)`, they are coalesced into exactly `n` groups first.
///
/// `spec.md` §4.5 algorithm:
/// 1. `P = ceil(F / N)` fragments per subsegment.
/// 2. Sum `referenced_size`/`subsegment_duration` per group of `P`; take the
///    min `earliest_presentation_time`; take the first non-unknown
///    `sap_type`, recomputing `sap_delta_time` relative to the group's
///    earliest PT.
/// 3. Resize to exactly `N` references.
///
/// If `P == 1`, coalescing is a no-op. The final group may be smaller than
/// `P`. If no reference in a group has a known SAP type, the group's
/// `sap_type` is `0` (`TypeUnknown`) and `sap_delta_time` is `0`.
pub fn coalesce_references(references: &[SidxReference], num_subsegments: u32) -> Vec<SidxReference> {
    let f = references.len();
    if f == 0 || num_subsegments == 0 {
        return Vec::new();
    }
    let n = num_subsegments as usize;
    let p = f.div_ceil(n);
    if p <= 1 {
        return references.to_vec();
    }

    let mut out = Vec::with_capacity(n);
    for group in references.chunks(p) {
        out.push(coalesce_group(group));
    }
    // "Resize the reference vector to exactly N." Only relevant when the
    // last chunk's presence pushed the count past N, which `chunks(p)` with
    // `p = ceil(f/n)` never does; this is a defensive trim matching the
    // spec's explicit step.
    out.truncate(n);
    out
}

fn coalesce_group(group: &[SidxReference]) -> SidxReference {
    debug_assert!(!group.is_empty());
    let referenced_size = group.iter().map(|r| r.referenced_size).sum();
    let subsegment_duration = group.iter().map(|r| r.subsegment_duration).sum();
    let earliest_presentation_time = group
        .iter()
        .map(|r| r.earliest_presentation_time)
        .min()
        .expect("group is non-empty");
    let starts_with_sap = group[0].starts_with_sap;

    let known = group.iter().find(|r| r.sap_type != 0);
    let (sap_type, sap_delta_time) = match known {
        Some(r) => {
            let delta = (r.earliest_presentation_time - earliest_presentation_time)
                .try_into()
                .unwrap_or(0u32);
            (r.sap_type, delta)
        }
        None => (0, 0),
    };

    SidxReference {
        referenced_size,
        subsegment_duration,
        earliest_presentation_time,
        starts_with_sap,
        sap_type,
        sap_delta_time,
    }
}

/// The exact byte length of a `sidx` built by [`build_sidx`] with
/// `reference_count` references: a 12-byte full-box header, 26 bytes of
/// fixed fields, 2 bytes of padding to a 4-byte boundary, and 12 bytes per
/// reference. Lets a caller reserve (and later patch) the box's space before
/// the final reference count — bounded by `coalesce_references`' `N` — is
/// known.
pub fn sidx_box_len(reference_count: u32) -> usize {
    40 + 12 * reference_count as usize
}

/// Builds a version-1 `sidx` (ISO/IEC 14496-12 §8.16.3), 64-bit
/// `earliest_presentation_time`/`first_offset` used unconditionally to avoid
/// a dual-version code path for a box this crate always writes itself.
pub fn build_sidx(
    reference_id: u32,
    timescale: u32,
    earliest_presentation_time: i64,
    first_offset: u64,
    references: &[SidxReference],
) -> Vec<u8> {
    let mut w = BoxWriter::new();
    w.write_full_box(b"sidx", 1, 0, |w| {
        w.u32(reference_id);
        w.u32(timescale);
        w.u64(earliest_presentation_time as u64);
        w.u64(first_offset);
        w.u16(0); // reserved
        w.u16(u16::try_from(references.len()).expect("reference count fits in u16"));
        for r in references {
            // reference_type (1 bit, always 0: media reference) + referenced_size (31 bits).
            w.u32(r.referenced_size & 0x7fff_ffff);
            w.u32(r.subsegment_duration);
            let sap_type = u32::from(r.sap_type & 0x7);
            let sap_delta = r.sap_delta_time & 0x0fff_ffff;
            w.u32((u32::from(r.starts_with_sap) << 31) | (sap_type << 28) | sap_delta);
        }
    });
    w.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(size: u32, duration: u32, pt: i64, sap_type: u8) -> SidxReference {
        SidxReference {
            referenced_size: size,
            subsegment_duration: duration,
            earliest_presentation_time: pt,
            starts_with_sap: sap_type != 0,
            sap_type,
            sap_delta_time: 0,
        }
    }

    #[test]
    fn coalescing_10_fragments_into_3_groups_of_4_4_2() {
        // 10 fragments, each 1000 bytes / 9000 duration units, PTs 0, 9000, ...
        let refs: Vec<SidxReference> = (0..10)
            .map(|i| reference(1000, 9000, i * 9000, if i == 0 { 1 } else { 0 }))
            .collect();
        let coalesced = coalesce_references(&refs, 3);
        assert_eq!(coalesced.len(), 3);
        assert_eq!(coalesced[0].referenced_size, 4000);
        assert_eq!(coalesced[1].referenced_size, 4000);
        assert_eq!(coalesced[2].referenced_size, 2000);
        assert_eq!(coalesced[0].subsegment_duration, 36000);
        assert_eq!(coalesced[2].subsegment_duration, 18000);
    }

    #[test]
    fn p_equal_one_skips_coalescing() {
        let refs: Vec<SidxReference> = (0..3).map(|i| reference(10, 100, i * 100, 1)).collect();
        let coalesced = coalesce_references(&refs, 3);
        assert_eq!(coalesced.len(), 3);
        for (a, b) in coalesced.iter().zip(refs.iter()) {
            assert_eq!(a.referenced_size, b.referenced_size);
        }
    }

    #[test]
    fn unknown_sap_type_when_no_reference_has_one() {
        let refs = vec![reference(10, 100, 0, 0), reference(10, 100, 100, 0)];
        let coalesced = coalesce_references(&refs, 1);
        assert_eq!(coalesced.len(), 1);
        assert_eq!(coalesced[0].sap_type, 0);
        assert_eq!(coalesced[0].sap_delta_time, 0);
    }

    #[test]
    fn zero_disables_coalescing_one_ref_per_fragment() {
        let refs: Vec<SidxReference> = (0..5).map(|i| reference(10, 100, i * 100, 1)).collect();
        // num_subsegments == 0 models "disabled coalescing"; the Segmenter
        // itself handles the "one ref per fragment" `SidxMode` by never
        // calling this function at all.
        assert!(coalesce_references(&refs, 0).is_empty());
    }

    #[test]
    fn sidx_box_len_matches_build_sidx_output() {
        let refs: Vec<SidxReference> = (0..4).map(|i| reference(10, 100, i * 100, 1)).collect();
        let bytes = build_sidx(1, 90_000, 0, 0, &refs);
        assert_eq!(bytes.len(), sidx_box_len(4));
    }

    #[test]
    fn sidx_box_round_trip_fields() {
        let refs = vec![reference(1234, 9000, 500, 1)];
        let bytes = build_sidx(1, 90_000, 500, 48, &refs);
        assert_eq!(&bytes[4..8], b"sidx");
        assert_eq!(bytes[8], 1); // version
        let reference_id = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(reference_id, 1);
        let timescale = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        assert_eq!(timescale, 90_000);
    }
}
