//! Domain error type for the crate.
//!
//! Mirrors the tagged-kind design used throughout the source library this
//! crate is modeled on: seek/decode transients are recovered locally (see
//! `crate::seek`), and only terminal conditions ever reach a caller as one
//! of these variants.

use std::path::PathBuf;

/// All errors that can cross the public API boundary of this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The container or codec could not be opened.
    #[error("failed to open '{path}': {message}")]
    Open { path: PathBuf, message: String },

    /// A hardware device could not be created. Distinct from `Open` so
    /// callers can retry without hardware acceleration.
    #[error("hardware device unavailable for '{path}': {message}")]
    HWUnavailable { path: PathBuf, message: String },

    /// The requested track selector does not resolve to a track of the
    /// expected media type.
    #[error("invalid track selector {selector:?} for {path}")]
    InvalidTrack { path: PathBuf, selector: i32 },

    /// A frame that should exist could not be produced outside of seek
    /// recovery (i.e. the seek resolver already gave up).
    #[error("decode failed at frame {frame}: {message} (retrying single-threaded may help)")]
    Decode { frame: i64, message: String },

    /// A persisted index failed a fence check; triggers silent re-indexing,
    /// never surfaced unless the caller explicitly asks to observe it.
    #[error("index fence mismatch: {0}")]
    IndexMismatch(String),

    /// The progress callback returned `false`.
    #[error("indexing canceled")]
    Canceled,

    /// An invalid numeric construction argument.
    #[error("invalid argument: {0}")]
    ArgumentError(String),

    /// A feature combination this crate deliberately does not support.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Wraps an underlying decode-library error that doesn't fit a more
    /// specific kind above.
    #[error(transparent)]
    Ffmpeg(#[from] ffmpeg::Error),

    /// Wraps a filesystem error encountered while reading or writing a
    /// `.bsindex` cache file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
