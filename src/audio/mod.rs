//! Audio track composition: sample-address resolution and packed/planar
//! delivery with zero-fill at both ends, on top of the generic index/seek
//! machinery shared with video.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cache::{CachedFrame, FrameCache};
use crate::cache_file::{self, CacheMode};
use crate::decoder::pool::DecoderPool;
use crate::decoder::{self, AudioDecoderHandle, HwDevice, OpenOptions, TrackSelector};
use crate::error::{Error, Result};
use crate::index::codec::Fence;
use crate::index::{codec, AudioFrameRecord, TrackIndex};
use crate::indexer;
use crate::progress::ProgressSink;
use crate::seek;

/// One owned, decoded audio frame in whatever layout the decoder produced
/// it (planar or interleaved); packed/planar delivery converts on read
/// rather than at cache-fill time, matching `crate::hash`'s treatment of the
/// same distinction.
#[derive(Debug, Clone)]
pub struct CachedAudioFrame {
    pub is_planar: bool,
    pub channels: usize,
    pub nb_samples: usize,
    pub bytes_per_sample: usize,
    pub pts: i64,
    /// One buffer per channel if planar; a single interleaved buffer
    /// (`data[0]`) otherwise.
    pub data: Vec<Vec<u8>>,
}

impl CachedFrame for CachedAudioFrame {
    fn byte_size(&self) -> usize {
        self.data.iter().map(Vec::len).sum()
    }
}

fn copy_audio_frame(frame: &ffmpeg::util::frame::Audio) -> CachedAudioFrame {
    let is_planar = frame.is_planar();
    let channels = frame.channels() as usize;
    let nb_samples = frame.samples();
    let bytes_per_sample = frame.format().bytes();

    let data = if is_planar {
        let per_channel = nb_samples * bytes_per_sample;
        (0..channels).map(|ch| frame.data(ch)[..per_channel].to_vec()).collect()
    } else {
        let total = nb_samples * channels * bytes_per_sample;
        vec![frame.data(0)[..total].to_vec()]
    };

    CachedAudioFrame {
        is_planar,
        channels,
        nb_samples,
        bytes_per_sample,
        pts: frame.pts().unwrap_or(crate::index::UNSET_PTS),
        data,
    }
}

/// The frame range covering a sample span, per §4.10's `get_range_by_samples`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRange {
    pub first: i64,
    pub last: i64,
    pub first_sample_pos: i64,
}

/// Rightmost frame whose `start_sample <= sample`, by binary search over the
/// (monotonically non-decreasing) `start_sample` field.
fn frame_containing_sample(frames: &[AudioFrameRecord], sample: i64) -> Option<i64> {
    if frames.is_empty() || sample < frames[0].start_sample {
        return None;
    }
    let mut lo = 0i64;
    let mut hi = frames.len() as i64 - 1;
    let mut result = 0i64;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        if frames[mid as usize].start_sample <= sample {
            result = mid;
            lo = mid + 1;
        } else {
            hi = mid - 1;
        }
    }
    Some(result)
}

fn fill_in_frame_packed(
    dst: &mut [u8],
    dst_base: i64,
    frame: &CachedAudioFrame,
    frame_global_start: i64,
    want_start: i64,
    want_end: i64,
    out_channels: usize,
    bps: usize,
) {
    let lo = want_start.max(frame_global_start);
    let hi = want_end.min(frame_global_start + frame.nb_samples as i64);
    for sample in lo..hi {
        let local = (sample - frame_global_start) as usize;
        let dst_sample_index = (sample - dst_base) as usize;
        for ch in 0..out_channels.min(frame.channels) {
            let src = if frame.is_planar {
                let off = local * bps;
                &frame.data[ch][off..off + bps]
            } else {
                let off = (local * frame.channels + ch) * bps;
                &frame.data[0][off..off + bps]
            };
            let dst_off = (dst_sample_index * out_channels + ch) * bps;
            dst[dst_off..dst_off + bps].copy_from_slice(src);
        }
    }
}

fn fill_in_frame_planar(
    channel_dsts: &mut [&mut [u8]],
    dst_base: i64,
    frame: &CachedAudioFrame,
    frame_global_start: i64,
    want_start: i64,
    want_end: i64,
    bps: usize,
) {
    let lo = want_start.max(frame_global_start);
    let hi = want_end.min(frame_global_start + frame.nb_samples as i64);
    for sample in lo..hi {
        let local = (sample - frame_global_start) as usize;
        let dst_sample_index = (sample - dst_base) as usize;
        for (ch, dst) in channel_dsts.iter_mut().enumerate() {
            if ch >= frame.channels {
                break;
            }
            let src = if frame.is_planar {
                let off = local * bps;
                &frame.data[ch][off..off + bps]
            } else {
                let off = (local * frame.channels + ch) * bps;
                &frame.data[0][off..off + bps]
            };
            let dst_off = dst_sample_index * bps;
            dst[dst_off..dst_off + bps].copy_from_slice(src);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioProperties {
    pub sample_rate: u32,
    pub channels: usize,
    pub sample_format: ffmpeg::format::Sample,
    pub bytes_per_sample: usize,
    /// Total addressable samples, including any leading `sample_delay`
    /// silence from cross-track alignment (§4.10).
    pub num_samples: i64,
    pub sample_delay: i64,
}

#[derive(Debug, Clone)]
pub struct AudioSourceConfig {
    pub path: PathBuf,
    pub track: TrackSelector,
    pub demuxer_options: Vec<(String, String)>,
    pub threads: i32,
    pub hw_device: Option<HwDevice>,
    pub variable_format: bool,
    /// Dynamic range compression scale; fence-only (§4.2), since no generic
    /// per-codec AVOption path exists in this binding to apply it to the
    /// decode itself.
    pub drc_scale: f64,
    pub seek_preroll: i64,
    pub cache_mode: CacheMode,
    pub cache_path: Option<PathBuf>,
    pub pool_size: usize,
    pub max_cache_bytes: usize,
    /// Another track's start time in seconds, for `sample_delay` alignment
    /// (§4.10's cross-track delay). `None` means no alignment shift.
    pub align_to_start_time: Option<f64>,
}

pub struct AudioSourceBuilder {
    cfg: AudioSourceConfig,
}

impl AudioSourceBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            cfg: AudioSourceConfig {
                path: path.into(),
                track: TrackSelector::NthOfType(0),
                demuxer_options: Vec::new(),
                threads: 0,
                hw_device: None,
                variable_format: false,
                drc_scale: 0.0,
                seek_preroll: 40,
                cache_mode: CacheMode::AutoSubTree,
                cache_path: None,
                pool_size: crate::decoder::pool::DEFAULT_POOL_SIZE,
                max_cache_bytes: crate::cache::DEFAULT_MAX_BYTES,
                align_to_start_time: None,
            },
        }
    }

    pub fn track(mut self, track: TrackSelector) -> Self {
        self.cfg.track = track;
        self
    }

    pub fn demuxer_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.cfg.demuxer_options.push((key.into(), value.into()));
        self
    }

    pub fn threads(mut self, threads: i32) -> Self {
        self.cfg.threads = threads;
        self
    }

    pub fn hw_device(mut self, hw_device: HwDevice) -> Self {
        self.cfg.hw_device = Some(hw_device);
        self
    }

    pub fn variable_format(mut self, enabled: bool) -> Self {
        self.cfg.variable_format = enabled;
        self
    }

    pub fn drc_scale(mut self, scale: f64) -> Self {
        self.cfg.drc_scale = scale;
        self
    }

    pub fn seek_preroll(mut self, frames: i64) -> Self {
        self.cfg.seek_preroll = frames;
        self
    }

    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cfg.cache_mode = mode;
        self
    }

    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cfg.cache_path = Some(path.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.cfg.pool_size = size;
        self
    }

    pub fn max_cache_bytes(mut self, bytes: usize) -> Self {
        self.cfg.max_cache_bytes = bytes;
        self
    }

    pub fn align_to_start_time(mut self, other_start_time_seconds: f64) -> Self {
        self.cfg.align_to_start_time = Some(other_start_time_seconds);
        self
    }

    pub fn build(self, progress: &mut dyn ProgressSink) -> Result<AudioSource> {
        let cfg = self.cfg;
        if cfg.drc_scale < 0.0 {
            return Err(Error::ArgumentError(format!("drc_scale must be >= 0, got {}", cfg.drc_scale)));
        }
        if !(0..=40).contains(&cfg.seek_preroll) {
            return Err(Error::ArgumentError(format!(
                "seek_preroll must be in 0..=40, got {}",
                cfg.seek_preroll
            )));
        }
        if cfg.pool_size == 0 {
            return Err(Error::ArgumentError("pool_size must be at least 1".into()));
        }

        let threads = if cfg.threads <= 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as i32)
                .unwrap_or(1)
                .min(16)
        } else {
            cfg.threads
        };

        let open_options = OpenOptions {
            path: cfg.path.clone(),
            track: cfg.track,
            demuxer_options: cfg.demuxer_options.clone(),
            threads,
            hw_device: cfg.hw_device.clone(),
            variable_format: cfg.variable_format,
        };

        let mut indexing_decoder = AudioDecoderHandle::open(&open_options)?;
        let stream_props = indexing_decoder.properties();
        let file_size = std::fs::metadata(&cfg.path)?.len() as i64;
        let track = indexing_decoder.track_index() as i32;

        let fence = Fence {
            lib_versions: decoder::lib_versions(),
            file_size,
            track,
            variable_format: cfg.variable_format as i32,
            hw_device: String::new(),
            extra_hw_frames: 0,
            drc_scale: cfg.drc_scale,
            options: cfg.demuxer_options.clone(),
        };

        let cache_file_path = cache_file::resolve(cfg.cache_mode, cfg.cache_path.as_deref(), &cfg.path, track);

        let cached_index = if cfg.cache_mode != CacheMode::Disabled {
            match std::fs::File::open(&cache_file_path) {
                Ok(f) => {
                    let mut r = std::io::BufReader::new(f);
                    match codec::read_audio(&mut r, &fence) {
                        Ok(idx) => Some(idx),
                        Err(e) => {
                            warn!(error = %e, path = %cache_file_path.display(), "index fence mismatch, rebuilding");
                            None
                        }
                    }
                }
                Err(_) => None,
            }
        } else {
            None
        };

        let index = match cached_index {
            Some(idx) => idx,
            None => {
                let idx = indexer::index_audio(&mut indexing_decoder, track, file_size, progress)?;
                if cache_file::should_write_index(cfg.cache_mode, idx.len()) {
                    if let Some(parent) = cache_file_path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    match std::fs::File::create(&cache_file_path) {
                        Ok(f) => {
                            let mut w = std::io::BufWriter::new(f);
                            if let Err(e) = codec::write_audio(&mut w, &idx, &fence) {
                                warn!(error = %e, path = %cache_file_path.display(), "failed to write index, continuing without it");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, path = %cache_file_path.display(), "failed to create index file, continuing without it");
                        }
                    }
                }
                idx
            }
        };

        let real_num_samples = index
            .frames()
            .last()
            .map(|f| f.start_sample + f.length_samples)
            .unwrap_or(0);

        let sample_delay = match cfg.align_to_start_time {
            Some(other_start_time_seconds) => {
                let this_start_time_seconds =
                    stream_props.time_base.0 as f64 / stream_props.time_base.1 as f64 * indexing_decoder.start_time() as f64;
                let delay_seconds = this_start_time_seconds - other_start_time_seconds;
                (delay_seconds * stream_props.sample_rate as f64).round() as i64
            }
            None => 0,
        };
        drop(indexing_decoder);

        let bytes_per_sample = stream_props.sample_format.bytes();
        let properties = AudioProperties {
            sample_rate: stream_props.sample_rate,
            channels: stream_props.channels,
            sample_format: stream_props.sample_format,
            bytes_per_sample,
            num_samples: real_num_samples + sample_delay,
            sample_delay,
        };

        Ok(AudioSource {
            index,
            pool: DecoderPool::new(cfg.pool_size),
            cache: FrameCache::new(cfg.max_cache_bytes),
            bad_seek_locations: Default::default(),
            linear_mode: false,
            open_options,
            seek_preroll: cfg.seek_preroll,
            properties,
            real_num_samples,
        })
    }
}

pub struct AudioSource {
    index: TrackIndex<AudioFrameRecord>,
    pool: DecoderPool<AudioDecoderHandle>,
    cache: FrameCache<CachedAudioFrame>,
    bad_seek_locations: std::collections::HashSet<i64>,
    linear_mode: bool,
    open_options: OpenOptions,
    seek_preroll: i64,
    properties: AudioProperties,
    real_num_samples: i64,
}

impl AudioSource {
    pub fn properties(&self) -> AudioProperties {
        self.properties
    }

    pub fn num_frames(&self) -> i64 {
        self.index.len() as i64
    }

    /// `get_frame(N)` for the underlying audio frame, reusing the same
    /// seek-and-verify machinery as video (§4.8); `preroll_skip` burns off
    /// post-seek warm-up frames before hash matching begins, per step 2 of
    /// `SeekAndDecode`.
    pub fn get_frame(&mut self, n: i64) -> Result<Option<CachedAudioFrame>> {
        let open_options = self.open_options.clone();
        let open = || AudioDecoderHandle::open(&open_options);
        let hash_of = |f: &ffmpeg::util::frame::Audio| decoder::hash_audio_frame(f);
        let to_cached = |f: &ffmpeg::util::frame::Audio| copy_audio_frame(f);

        seek::get_frame(
            &self.index,
            &mut self.pool,
            &mut self.cache,
            &mut self.bad_seek_locations,
            &mut self.linear_mode,
            n,
            self.seek_preroll,
            self.seek_preroll / 2,
            &open,
            &hash_of,
            &to_cached,
        )
    }

    /// The frame range covering real (pre-delay) sample span `[start, start
    /// + count)`. Returns `None` if `count <= 0` or the span lies entirely
    /// outside the track.
    pub fn get_range_by_samples(&self, start: i64, count: i64) -> Option<AudioRange> {
        if count <= 0 || start < 0 || start >= self.real_num_samples {
            return None;
        }
        let end = (start + count - 1).min(self.real_num_samples - 1);
        let frames = self.index.frames();
        let first = frame_containing_sample(frames, start)?;
        let last = frame_containing_sample(frames, end)?;
        Some(AudioRange {
            first,
            last,
            first_sample_pos: frames[first as usize].start_sample,
        })
    }

    /// Resolves the real sample range backing the requested (delay-shifted)
    /// span, clipped to what's actually decodable.
    fn resolve_real_span(&self, start: i64, count: i64) -> Option<(i64, i64)> {
        let valid_start = start.max(0);
        let valid_end = (start + count).min(self.properties.num_samples);
        if valid_end <= valid_start {
            return None;
        }
        let real_start = (valid_start - self.properties.sample_delay).max(0);
        let real_end = (valid_end - self.properties.sample_delay).min(self.real_num_samples);
        if real_end <= real_start {
            return None;
        }
        Some((valid_start, valid_end))
    }

    /// Packed (interleaved) delivery (§4.10): `dst` must hold exactly
    /// `count * channels * bytes_per_sample` bytes. Samples outside
    /// `[0, num_samples)` are zero-filled; this never decodes frames to
    /// satisfy a purely out-of-range request.
    pub fn get_packed(&mut self, dst: &mut [u8], start: i64, count: i64) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }
        let channels = self.properties.channels;
        let bps = self.properties.bytes_per_sample;
        let expected_len = count as usize * channels * bps;
        if dst.len() != expected_len {
            return Err(Error::ArgumentError(format!(
                "dst length {} does not match count*channels*bytes_per_sample {expected_len}",
                dst.len()
            )));
        }
        dst.fill(0);

        let (valid_start, valid_end) = match self.resolve_real_span(start, count) {
            Some(span) => span,
            None => return Ok(()),
        };
        let real_start = (valid_start - self.properties.sample_delay).max(0);
        let real_end = (valid_end - self.properties.sample_delay).min(self.real_num_samples);
        let range = match self.get_range_by_samples(real_start, real_end - real_start) {
            Some(r) => r,
            None => return Ok(()),
        };

        for frame_idx in range.first..=range.last {
            let record = *self.index.get(frame_idx).expect("range within index bounds");
            let frame = match self.get_frame(frame_idx)? {
                Some(f) => f,
                None => continue,
            };
            let frame_global_start = record.start_sample + self.properties.sample_delay;
            fill_in_frame_packed(dst, start, &frame, frame_global_start, valid_start, valid_end, channels, bps);
        }
        Ok(())
    }

    /// Planar (per-channel) delivery, symmetric with [`Self::get_packed`].
    pub fn get_planar(&mut self, channel_dsts: &mut [&mut [u8]], start: i64, count: i64) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }
        let channels = self.properties.channels;
        if channel_dsts.len() != channels {
            return Err(Error::ArgumentError(format!(
                "expected {channels} channel buffers, got {}",
                channel_dsts.len()
            )));
        }
        let bps = self.properties.bytes_per_sample;
        let expected_len = count as usize * bps;
        for buf in channel_dsts.iter_mut() {
            if buf.len() != expected_len {
                return Err(Error::ArgumentError(format!(
                    "channel buffer length {} does not match count*bytes_per_sample {expected_len}",
                    buf.len()
                )));
            }
            buf.fill(0);
        }

        let (valid_start, valid_end) = match self.resolve_real_span(start, count) {
            Some(span) => span,
            None => return Ok(()),
        };
        let real_start = (valid_start - self.properties.sample_delay).max(0);
        let real_end = (valid_end - self.properties.sample_delay).min(self.real_num_samples);
        let range = match self.get_range_by_samples(real_start, real_end - real_start) {
            Some(r) => r,
            None => return Ok(()),
        };

        for frame_idx in range.first..=range.last {
            let record = *self.index.get(frame_idx).expect("range within index bounds");
            let frame = match self.get_frame(frame_idx)? {
                Some(f) => f,
                None => continue,
            };
            let frame_global_start = record.start_sample + self.properties.sample_delay;
            fill_in_frame_planar(channel_dsts, start, &frame, frame_global_start, valid_start, valid_end, bps);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(start_sample: i64, length: i64) -> AudioFrameRecord {
        AudioFrameRecord {
            pts: start_sample,
            start_sample,
            length_samples: length,
            hash: 0,
        }
    }

    fn source(frames: Vec<AudioFrameRecord>, sample_delay: i64) -> AudioSource {
        let real_num_samples = frames.last().map(|f| f.start_sample + f.length_samples).unwrap_or(0);
        let properties = AudioProperties {
            sample_rate: 48_000,
            channels: 2,
            sample_format: ffmpeg::format::Sample::None,
            bytes_per_sample: 2,
            num_samples: real_num_samples + sample_delay,
            sample_delay,
        };
        AudioSource {
            index: TrackIndex::new(frames, 0),
            pool: DecoderPool::new(1),
            cache: FrameCache::new(1024),
            bad_seek_locations: Default::default(),
            linear_mode: false,
            open_options: OpenOptions {
                path: PathBuf::new(),
                track: TrackSelector::NthOfType(0),
                demuxer_options: Vec::new(),
                threads: 1,
                hw_device: None,
                variable_format: false,
            },
            seek_preroll: 40,
            properties,
            real_num_samples,
        }
    }

    #[test]
    fn frame_containing_sample_finds_rightmost_covering_frame() {
        let frames = vec![rec(0, 1024), rec(1024, 1024), rec(2048, 512)];
        assert_eq!(frame_containing_sample(&frames, 0), Some(0));
        assert_eq!(frame_containing_sample(&frames, 1023), Some(0));
        assert_eq!(frame_containing_sample(&frames, 1024), Some(1));
        assert_eq!(frame_containing_sample(&frames, 2500), Some(2));
        assert_eq!(frame_containing_sample(&frames, 5000), Some(2));
    }

    #[test]
    fn get_range_by_samples_covers_the_full_track() {
        let frames = vec![rec(0, 1024), rec(1024, 1024), rec(2048, 512)];
        let total = 2560;
        let s = source(frames, 0);
        let range = s.get_range_by_samples(0, total).unwrap();
        assert_eq!(range.first, 0);
        assert_eq!(range.last, 2);
        assert_eq!(range.first_sample_pos, 0);
    }

    #[test]
    fn get_range_by_samples_rejects_zero_or_negative_count() {
        let frames = vec![rec(0, 1024)];
        let s = source(frames, 0);
        assert!(s.get_range_by_samples(0, 0).is_none());
        assert!(s.get_range_by_samples(0, -5).is_none());
    }

    #[test]
    fn resolve_real_span_clips_to_the_delay_shifted_window() {
        let frames = vec![rec(0, 1024)];
        let s = source(frames, 10);
        // num_samples = 1034; request (-5, 20) -> valid [0, 15)
        let (valid_start, valid_end) = s.resolve_real_span(-5, 20).unwrap();
        assert_eq!(valid_start, 0);
        assert_eq!(valid_end, 15);
    }

    #[test]
    fn resolve_real_span_none_when_entirely_out_of_range() {
        let frames = vec![rec(0, 1024)];
        let s = source(frames, 0);
        assert!(s.resolve_real_span(2000, 10).is_none());
        assert!(s.resolve_real_span(-100, 50).is_none());
    }
}
