//! One-shot linear decode that builds a [`crate::index::TrackIndex`],
//! reporting progress and raising [`crate::Error::Canceled`] if the caller's
//! progress callback asks to stop.
//!
//! Indexing always uses its own dedicated decoder handle, never one drawn
//! from the pool, because the pool's handles are mutated concurrently with
//! indexing's own construction (the source doesn't exist yet).

use tracing::instrument;

use crate::decoder::{AudioDecoderHandle, TrackDecoder, VideoDecoderHandle};
use crate::error::Result;
use crate::index::{AudioFrameRecord, TrackIndex, VideoFrameRecord};
use crate::progress::{self, ProgressSink};

fn video_duration(frame: &ffmpeg::util::frame::Video) -> i64 {
    unsafe { (*frame.as_ptr()).pkt_duration }
}

#[instrument(skip(decoder, progress), fields(track), err)]
pub fn index_video(
    decoder: &mut VideoDecoderHandle,
    track: i32,
    source_size: i64,
    progress: &mut dyn ProgressSink,
) -> Result<TrackIndex<VideoFrameRecord>> {
    let mut frames = Vec::new();
    let mut last_frame_duration = 0i64;

    while let Some(frame) = decoder.read_frame()? {
        last_frame_duration = video_duration(&frame);
        frames.push(decoder.current_frame_record(&frame));
        progress::report(progress, track, decoder.source_position(), source_size)?;
    }
    progress::report_done(progress, track);

    Ok(TrackIndex::new(frames, last_frame_duration))
}

#[instrument(skip(decoder, progress), fields(track), err)]
pub fn index_audio(
    decoder: &mut AudioDecoderHandle,
    track: i32,
    source_size: i64,
    progress: &mut dyn ProgressSink,
) -> Result<TrackIndex<AudioFrameRecord>> {
    let mut frames = Vec::new();

    while let Some(frame) = decoder.read_frame()? {
        frames.push(decoder.current_frame_record(&frame));
        progress::report(progress, track, decoder.source_position(), source_size)?;
    }
    progress::report_done(progress, track);

    Ok(TrackIndex::new(frames, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::index::FrameRecord;

    // Indexing end to end needs a real decoder, so only the cancellation
    // contract (no decoder involvement at all) is unit-testable here; the
    // decode loop itself is covered by `#[ignore]`d integration tests next
    // to `VideoDecoderHandle`/`AudioDecoderHandle`.
    #[test]
    fn progress_done_sentinel_uses_int64_max() {
        struct Recorder(Vec<(i32, i64, i64)>);
        impl ProgressSink for Recorder {
            fn tick(&mut self, track: i32, current: i64, total: i64) -> bool {
                self.0.push((track, current, total));
                true
            }
        }
        let mut recorder = Recorder(Vec::new());
        progress::report_done(&mut recorder, 0);
        assert_eq!(recorder.0, vec![(0, i64::MAX, i64::MAX)]);
    }

    #[test]
    fn cancel_during_report_raises_canceled() {
        struct AlwaysCancel;
        impl ProgressSink for AlwaysCancel {
            fn tick(&mut self, _track: i32, _current: i64, _total: i64) -> bool {
                false
            }
        }
        let mut sink = AlwaysCancel;
        let err = progress::report(&mut sink, 0, 0, 100).unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }

    #[test]
    fn empty_audio_index_has_no_seek_candidates() {
        let frames: Vec<AudioFrameRecord> = Vec::new();
        let index = TrackIndex::new(frames, 0);
        assert!(index.is_empty());
        assert!(index.get(0).is_none());
    }

    #[allow(dead_code)]
    fn is_seek_candidate_is_used(r: &VideoFrameRecord) -> bool {
        r.is_seek_candidate()
    }
}
