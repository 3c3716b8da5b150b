// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! Error handling.
//!
//! A small, closed taxonomy of error kinds, as a Rust enum plus a
//! `bail!`/`err!` macro pair and a `ResultExt` adapter
//! (`bail!(Internal, msg("..."))`, `result.err_kind(ErrorKind::Internal)`).

use std::error::Error as StdError;
use std::fmt;

/// The stable error taxonomy.
///
/// `EndOfStream` is deliberately absent here: it's informational, not an
/// error, so it is never represented by this type — callers observe end of
/// stream as `Ok(None)` from sample iteration, not as an `Err`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad key size, unsupported protection scheme, malformed configuration.
    InvalidArgument,
    /// Malformed bitstream, unparsable box.
    ParserFailure,
    /// Underlying crypto primitive refused (bad key/IV, short buffer, ...).
    EncryptionFailure,
    /// Open, write, or close on the file/segment-sink abstraction failed.
    FileFailure,
    /// Broken invariant; assertion-class.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::ParserFailure => "parser failure",
            ErrorKind::EncryptionFailure => "encryption failure",
            ErrorKind::FileFailure => "file failure",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// The crate's error type: a kind plus an optional message and an optional
/// chained source.
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[doc(hidden)]
    pub fn with_msg(mut self, msg: String) -> Self {
        self.msg = Some(msg);
        self
    }

    #[doc(hidden)]
    pub fn with_source<E: StdError + Send + Sync + 'static>(mut self, e: E) -> Self {
        self.source = Some(Box::new(e));
        self
    }

    /// Returns a `Display`-able value that prints this error followed by
    /// `caused by: ...` for each chained source. Used at the top level when
    /// an error is finally surfaced to a caller, e.g.
    /// `error!(err = %e.chain(), ...)`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cur = self.0.source.as_deref().map(|e| e as &dyn StdError);
        while let Some(e) = cur {
            write!(f, "\ncaused by: {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}: {}", self.kind, m),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error {{ kind: {:?}, msg: {:?} }}", self.kind, self.msg)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

/// Extension methods for `Result`, for annotating foreign errors with a kind.
///
/// ```
/// use fmp4cenc_base::{ErrorKind, ResultExt};
/// use std::io::Read;
/// let mut buf = [0u8; 1];
/// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
/// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
/// ```
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).with_msg(e.to_string()).with_source(e))
    }
}

/// Builds an [`Error`] with a kind and, optionally, a formatted message
/// and/or a chained source.
///
/// ```ignore
/// err!(Internal, msg("unexpected box size {}", size))
/// err!(ParserFailure, source(parse_err))
/// err!(Internal)
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident, msg($fmt:expr $(, $arg:expr)* $(,)?), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($fmt $(, $arg)*))
            .with_source($src)
    };
    ($kind:ident, msg($fmt:expr $(, $arg:expr)* $(,)?)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($fmt $(, $arg)*))
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_source($src)
    };
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
}

/// Like [`err!`], but returns early with `Err(...)`.
#[macro_export]
macro_rules! bail {
    ($($rest:tt)*) => {
        return Err($crate::err!($($rest)*))
    };
}
