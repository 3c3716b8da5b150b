// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.
// Cross-cutting concerns shared by the packager, in the style of
// moonfire-nvr's `base` crate: errors, time/timescale helpers, and test
// tracing setup.

pub mod clock;
mod error;
pub mod time;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
