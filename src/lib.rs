// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! A fragmented-MP4 (ISO/IEC 14496-12) segmenter with Common Encryption
//! (ISO/IEC 23001-7). Given decoded access units and a key/IV policy, builds
//! `moof`/`mdat`/`sidx`/`styp` segments, optionally encrypting sample data
//! in place under `cenc`/`cens`/`cbc1`/`cbcs`.
//!
//! [`packager::Packager`] is the top-level entry point: it drives a track's
//! [`bitstream::BitstreamConverter`], its [`crypto::SampleEncryptor`] (when a
//! key is installed), and the [`segmenter::Segmenter`] that writes bytes to a
//! caller-supplied [`sink::SegmentSink`]. The CLI, MPD/HLS manifest writers,
//! key-acquisition clients, and file I/O are out of scope — collaborators a
//! caller supplies.

pub mod bitstream;
pub mod boxes;
pub mod config;
pub mod crypto;
pub mod fragmenter;
pub mod listener;
pub mod model;
pub mod packager;
pub mod segmenter;
pub mod sink;

pub use config::{EncryptionConfig, PackagerConfig, SidxMode};
pub use listener::{NullListener, SegmentListener};
pub use packager::{Packager, TrackPipelineInit};
pub use segmenter::{Segmenter, SegmenterInit};
pub use sink::{BufferSink, FileSink, SegmentSink};
