//! Indexing progress reporting and cancellation.
//!
//! A `ProgressSink` is handed to [`crate::indexer::index_video`] and
//! [`crate::indexer::index_audio`]; returning `false` raises
//! [`crate::Error::Canceled`]. This mirrors the original source library's
//! `ProgressFunction`, but as a plain closure rather than a shared atomic
//! counter, since indexing here runs on a single thread owned by the
//! caller.

use crate::error::{Error, Result};

/// `(track, current, total) -> continue?`
pub trait ProgressSink {
    fn tick(&mut self, track: i32, current: i64, total: i64) -> bool;
}

impl<F> ProgressSink for F
where
    F: FnMut(i32, i64, i64) -> bool,
{
    fn tick(&mut self, track: i32, current: i64, total: i64) -> bool {
        self(track, current, total)
    }
}

/// A no-op sink for callers that don't care about progress.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn tick(&mut self, _track: i32, _current: i64, _total: i64) -> bool {
        true
    }
}

/// Report a tick, turning a `false` return into `Error::Canceled`.
pub(crate) fn report(sink: &mut dyn ProgressSink, track: i32, current: i64, total: i64) -> Result<()> {
    if sink.tick(track, current, total) {
        Ok(())
    } else {
        Err(Error::Canceled)
    }
}

/// Signals that indexing has finished, per the `(INT64_MAX, INT64_MAX)` convention.
pub(crate) fn report_done(sink: &mut dyn ProgressSink, track: i32) {
    sink.tick(track, i64::MAX, i64::MAX);
}
