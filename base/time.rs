// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Timescale arithmetic shared across the packager.
//!
//! Every timestamp in the data model is expressed in stream timescale
//! units rather than a fixed rate, so [`rescale`] takes an arbitrary
//! `from`/`to` timescale pair — needed when, e.g., converting a `sidx`
//! reference's duration from a track's media timescale into the `sidx`
//! timescale.

use std::convert::TryFrom;

/// Converts `from_off` (expressed against `from_timescale` ticks per second)
/// into the equivalent offset against `to_timescale` ticks per second.
///
/// Uses an `i64` intermediate so offsets near `i32::MAX` don't overflow
/// during the multiply.
pub fn rescale(from_off: i64, from_timescale: u32, to_timescale: u32) -> i64 {
    if from_timescale == 0 {
        return 0; // avoid a divide by zero.
    }
    i64::from(from_off) * i64::from(to_timescale) / i64::from(from_timescale)
}

/// Converts seconds since the Unix epoch (1970-01-01 00:00:00 UTC) to seconds
/// since the ISO/IEC 14496-12 epoch (1904-01-01 00:00:00 UTC), as used in
/// `mvhd`/`mdhd`/`tkhd` creation and modification times.
pub fn to_iso14496_timestamp(unix_secs: i64) -> u32 {
    u32::try_from(unix_secs + 24107 * 86400).unwrap_or(0)
}
