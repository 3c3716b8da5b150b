// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Where packaged bytes go: a small capability trait plus two
//! implementations, grounded on the teacher's `db/writer.rs` `FileWriter`/
//! `DirWriter` traits (there, an abstraction over "one growable file" vs "a
//! directory of files"; here, over "one growable buffer" vs "a filesystem
//! file"), generalized with a `seek_and_overwrite` operation single-file mode
//! needs to patch a `moov` or `sidx` box's length after the fact.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use base::bail;

/// An output destination for packaged bytes: either a whole init/media
/// segment file in multi-file mode, or the single growing file in
/// single-file mode.
pub trait SegmentSink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), base::Error>;
    fn flush(&mut self) -> Result<(), base::Error>;
    fn close(&mut self) -> Result<(), base::Error>;

    /// Overwrites `len` bytes at absolute offset `offset`, already written.
    /// Used to patch a box's length once its true extent is known (e.g. a
    /// `moov` rewritten in place after the last track's `stsz`/`stco`
    /// metadata is finalized) without rebuffering the whole file.
    fn seek_and_overwrite(&mut self, offset: u64, data: &[u8]) -> Result<(), base::Error>;
}

/// An in-memory sink, for tests and for callers that want the packaged
/// bytes back directly rather than written to a filesystem path.
#[derive(Default)]
pub struct BufferSink {
    buf: Vec<u8>,
}

impl BufferSink {
    pub fn new() -> Self {
        BufferSink::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl SegmentSink for BufferSink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), base::Error> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), base::Error> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), base::Error> {
        Ok(())
    }

    fn seek_and_overwrite(&mut self, offset: u64, data: &[u8]) -> Result<(), base::Error> {
        let start = usize::try_from(offset).map_err(|_| base::err!(Internal, msg("offset {offset} out of range")))?;
        let end = start + data.len();
        if end > self.buf.len() {
            bail!(
                Internal,
                msg("seek_and_overwrite range {}..{} past buffer end {}", start, end, self.buf.len())
            );
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// A plain filesystem file, opened fresh (truncating any prior contents) for
/// each init/media segment file in multi-file mode, or once for the whole
/// output in single-file mode.
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self, base::Error> {
        let file = File::create(path).map_err(|e| base::err!(FileFailure, source(e), msg("creating {}", path.display())))?;
        Ok(FileSink { file })
    }
}

impl SegmentSink for FileSink {
    fn write_all(&mut self, data: &[u8]) -> Result<(), base::Error> {
        self.file
            .write_all(data)
            .map_err(|e| base::err!(FileFailure, source(e), msg("writing segment data")))
    }

    fn flush(&mut self) -> Result<(), base::Error> {
        self.file.flush().map_err(|e| base::err!(FileFailure, source(e), msg("flushing segment data")))
    }

    fn close(&mut self) -> Result<(), base::Error> {
        self.flush()
    }

    fn seek_and_overwrite(&mut self, offset: u64, data: &[u8]) -> Result<(), base::Error> {
        let original_pos = self
            .file
            .stream_position()
            .map_err(|e| base::err!(FileFailure, source(e), msg("querying stream position")))?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| base::err!(FileFailure, source(e), msg("seeking to {offset}")))?;
        let result = self.file.write_all(data);
        // Always restore the append position, even on error, so a failed
        // patch doesn't silently redirect subsequent writes mid-file.
        let seek_back = self.file.seek(SeekFrom::Start(original_pos));
        result.map_err(|e| base::err!(FileFailure, source(e), msg("overwriting at {offset}")))?;
        seek_back.map_err(|e| base::err!(FileFailure, source(e), msg("restoring stream position")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sink_overwrite_patches_in_place() {
        let mut sink = BufferSink::new();
        sink.write_all(&[0, 0, 0, 0, 0xaa]).unwrap();
        sink.seek_and_overwrite(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(sink.as_slice(), &[1, 2, 3, 4, 0xaa]);
    }

    #[test]
    fn buffer_sink_overwrite_past_end_is_an_error() {
        let mut sink = BufferSink::new();
        sink.write_all(&[0, 0]).unwrap();
        assert!(sink.seek_and_overwrite(0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        {
            let mut sink = FileSink::create(&path).unwrap();
            sink.write_all(b"hello").unwrap();
            sink.write_all(b"world").unwrap();
            sink.seek_and_overwrite(0, b"HELLO").unwrap();
            sink.write_all(b"!").unwrap();
            sink.close().unwrap();
        }
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents, b"HELLOworld!");
    }
}
