//! Video track composition: owns the generic index/seek/cache machinery for
//! one video track and adds what is specific to video -- RFF expansion,
//! frame-rate estimation, time-indexed access, and v2 timecode export.

pub mod rff;

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cache::{CachedFrame, FrameCache};
use crate::cache_file::{self, CacheMode};
use crate::decoder::pool::DecoderPool;
use crate::decoder::{self, HwDevice, OpenOptions, TrackSelector, VideoDecoderHandle};
use crate::error::{Error, Result};
use crate::index::codec::Fence;
use crate::index::{codec, TrackIndex, VideoFrameRecord, UNSET_PTS};
use crate::indexer;
use crate::progress::ProgressSink;
use crate::seek;

/// One owned, decoded video frame, stripped of stride padding so its
/// `byte_size` reflects only the bytes that matter (matches how
/// `crate::hash` walks planes).
#[derive(Debug, Clone)]
pub struct PlaneBuf {
    pub data: Vec<u8>,
    pub active_bytes_per_row: usize,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct CachedVideoFrame {
    pub planes: Vec<PlaneBuf>,
    pub pts: i64,
    pub key_frame: bool,
    pub tff: bool,
    pub repeat_pict: i32,
}

impl CachedFrame for CachedVideoFrame {
    fn byte_size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

fn copy_video_frame(frame: &ffmpeg::util::frame::Video) -> CachedVideoFrame {
    let bytes_per_sample = decoder::bytes_per_sample(frame.format());
    let mut planes = Vec::with_capacity(frame.planes());
    for p in 0..frame.planes() {
        let active_bytes_per_row = frame.plane_width(p) as usize * bytes_per_sample;
        let rows = frame.plane_height(p) as usize;
        let stride = frame.stride(p);
        let src = frame.data(p);
        let mut data = Vec::with_capacity(active_bytes_per_row * rows);
        let mut offset = 0usize;
        for _ in 0..rows {
            data.extend_from_slice(&src[offset..offset + active_bytes_per_row]);
            offset += stride;
        }
        planes.push(PlaneBuf {
            data,
            active_bytes_per_row,
            rows,
        });
    }

    CachedVideoFrame {
        planes,
        pts: frame.pts().unwrap_or(UNSET_PTS),
        key_frame: frame.is_key(),
        tff: frame.is_top_first(),
        repeat_pict: unsafe { (*frame.as_ptr()).repeat_pict },
    }
}

/// Weaves two fields into one frame, alternating source rows starting from
/// the top field -- the counterpart to `rff::build_rff_fields` splitting a
/// frame into fields in the first place.
fn weave_fields(top: &CachedVideoFrame, bottom: &CachedVideoFrame) -> CachedVideoFrame {
    let planes = top
        .planes
        .iter()
        .zip(&bottom.planes)
        .map(|(t, b)| {
            let width = t.active_bytes_per_row;
            let rows = t.rows;
            let mut data = Vec::with_capacity(width * rows);
            for r in 0..rows {
                let src = if r % 2 == 0 { &t.data } else { &b.data };
                let offset = r * width;
                data.extend_from_slice(&src[offset..offset + width]);
            }
            PlaneBuf {
                data,
                active_bytes_per_row: width,
                rows,
            }
        })
        .collect();

    CachedVideoFrame {
        planes,
        pts: top.pts,
        key_frame: top.key_frame,
        tff: top.tff,
        repeat_pict: top.repeat_pict,
    }
}

/// Stream-level properties exposed to callers, separate from the raw
/// container-reported values since frame-rate may have been overridden by
/// `estimate_fps` (§4.9).
#[derive(Debug, Clone, Copy)]
pub struct VideoProperties {
    pub width: u32,
    pub height: u32,
    pub pixel_format: ffmpeg::format::Pixel,
    pub time_base: (i32, i32),
    pub fps: (i32, i32),
    pub num_frames: i64,
    pub num_rff_frames: i64,
    pub rff_state: rff::RffState,
}

const COMMON_RATES: &[(i32, i32)] = &[
    (24, 1),
    (24000, 1001),
    (25, 1),
    (25000, 1001),
    (30, 1),
    (30000, 1001),
    (48, 1),
    (48000, 1001),
    (50, 1),
    (50000, 1001),
    (60, 1),
    (60000, 1001),
    (100, 1),
    (100000, 1001),
    (120, 1),
    (120000, 1001),
];

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}

fn reduce_fraction(num: i64, den: i64) -> (i32, i32) {
    if den == 0 {
        return (0, 1);
    }
    let sign = if den < 0 { -1 } else { 1 };
    let (num, den) = (num * sign, den * sign);
    let g = gcd(num, den);
    ((num / g) as i32, (den / g) as i32)
}

/// Snaps `fps` to the nearest entry in [`COMMON_RATES`] when it falls within
/// half the gap to its neighbors, else keeps it as a direct rational
/// approximation (§4.9's "snap to the nearest common rate ... when within
/// half the gap").
fn snap_to_common(fps: f64) -> (i32, i32) {
    let candidates: Vec<(f64, (i32, i32))> = COMMON_RATES
        .iter()
        .map(|&(n, d)| (n as f64 / d as f64, (n, d)))
        .collect();

    let (nearest_value, nearest_frac) = *candidates
        .iter()
        .min_by(|a, b| (a.0 - fps).abs().partial_cmp(&(b.0 - fps).abs()).unwrap())
        .expect("COMMON_RATES is non-empty");

    let mut sorted: Vec<f64> = candidates.iter().map(|c| c.0).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = sorted.iter().position(|&v| v == nearest_value).unwrap();
    let gap_next = if idx + 1 < sorted.len() {
        sorted[idx + 1] - nearest_value
    } else {
        f64::INFINITY
    };
    let gap_prev = if idx > 0 {
        nearest_value - sorted[idx - 1]
    } else {
        f64::INFINITY
    };
    let half_gap = gap_next.min(gap_prev) / 2.0;

    if (nearest_value - fps).abs() < half_gap {
        nearest_frac
    } else {
        let den = 1_000_000i64;
        let num = (fps * den as f64).round() as i64;
        reduce_fraction(num, den)
    }
}

/// Frame-rate estimation (§4.9): overrides the container-reported rate only
/// when the PTS sequence gives clear evidence of a different one. A single
/// PTS delta across the whole track is treated as CFR; a wider histogram is
/// trimmed to its dominant mass before averaging, and the MPEG timebase
/// sentinel (90000/1) is special-cased since it carries no real rate
/// information of its own.
fn estimate_fps(frames: &[VideoFrameRecord], time_base: (i32, i32), container_fps: (i32, i32)) -> (i32, i32) {
    if container_fps == (90000, 1) && frames.len() >= 2 {
        let mid = frames.len() / 2;
        let delta = frames[mid].pts - frames[mid - 1].pts;
        if delta > 0 && frames[mid].pts != UNSET_PTS && frames[mid - 1].pts != UNSET_PTS {
            return reduce_fraction(time_base.1 as i64, delta * time_base.0 as i64);
        }
        return container_fps;
    }

    let mut hist: HashMap<i64, usize> = HashMap::new();
    for w in frames.windows(2) {
        let delta = if w[0].pts != UNSET_PTS && w[1].pts != UNSET_PTS {
            w[1].pts - w[0].pts
        } else {
            UNSET_PTS
        };
        *hist.entry(delta).or_insert(0) += 1;
    }

    if hist.len() == 1 {
        let delta = *hist.keys().next().expect("hist has one entry");
        if delta > 0 {
            return reduce_fraction(time_base.1 as i64, delta * time_base.0 as i64);
        }
        return container_fps;
    }

    if frames.len() >= 20 && hist.len() > 1 {
        hist.remove(&UNSET_PTS);
        let total: usize = hist.values().sum();
        if total == 0 {
            return container_fps;
        }

        loop {
            if hist.len() <= 1 {
                break;
            }
            let (&min_delta, &min_count) = hist.iter().min_by_key(|(_, &c)| c).expect("non-empty");
            let remaining = total - min_count;
            if remaining as f64 / total as f64 >= 0.95 {
                hist.remove(&min_delta);
            } else {
                break;
            }
        }

        let weight_sum: i64 = hist.iter().map(|(&d, &c)| d * c as i64).sum();
        let count_sum: i64 = hist.values().map(|&c| c as i64).sum();
        if count_sum > 0 {
            let mean_delta = weight_sum as f64 / count_sum as f64;
            if mean_delta > 0.0 {
                let fps = time_base.1 as f64 / (mean_delta * time_base.0 as f64);
                return snap_to_common(fps);
            }
        }
    }

    container_fps
}

/// `last_frame_duration` as reported by the indexer falls back to the modal
/// inter-PTS delta when unavailable (zero). When both a real container value
/// and the modal delta are known and disagree by more than one frame, this
/// is logged as a diagnostic rather than silently overridden -- an open
/// question resolved in `DESIGN.md` in favor of visibility over silent
/// correction.
fn resolve_last_frame_duration(index: &TrackIndex<VideoFrameRecord>) -> i64 {
    let reported = index.last_frame_duration;

    let mut hist: HashMap<i64, usize> = HashMap::new();
    for w in index.frames().windows(2) {
        if w[0].pts != UNSET_PTS && w[1].pts != UNSET_PTS {
            *hist.entry(w[1].pts - w[0].pts).or_insert(0) += 1;
        }
    }
    let modal = hist.into_iter().max_by_key(|&(_, c)| c).map(|(d, _)| d).unwrap_or(0);

    if reported > 0 {
        if modal > 0 && (reported - modal).abs() > modal {
            warn!(reported, modal, "last_frame_duration disagrees with modal inter-PTS delta by more than one frame");
        }
        reported
    } else {
        modal
    }
}

/// Construction options for a [`VideoSource`], gathered in one place per
/// §6's "Inputs accepted from collaborators" and validated at
/// [`VideoSourceBuilder::build`] time.
#[derive(Debug, Clone)]
pub struct VideoSourceConfig {
    pub path: PathBuf,
    pub track: TrackSelector,
    pub demuxer_options: Vec<(String, String)>,
    pub threads: i32,
    pub hw_device: Option<HwDevice>,
    pub variable_format: bool,
    pub seek_preroll: i64,
    pub cache_mode: CacheMode,
    pub cache_path: Option<PathBuf>,
    pub pool_size: usize,
    pub max_cache_bytes: usize,
    pub rff: bool,
}

pub struct VideoSourceBuilder {
    cfg: VideoSourceConfig,
}

impl VideoSourceBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            cfg: VideoSourceConfig {
                path: path.into(),
                track: TrackSelector::NthOfType(0),
                demuxer_options: Vec::new(),
                threads: 0,
                hw_device: None,
                variable_format: false,
                seek_preroll: 20,
                cache_mode: CacheMode::AutoSubTree,
                cache_path: None,
                pool_size: crate::decoder::pool::DEFAULT_POOL_SIZE,
                max_cache_bytes: crate::cache::DEFAULT_MAX_BYTES,
                rff: false,
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

    pub fn rff(mut self, enabled: bool) -> Self {
        self.cfg.rff = enabled;
        self
    }

    pub fn build(self, progress: &mut dyn ProgressSink) -> Result<VideoSource> {
        let cfg = self.cfg;
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

        let mut indexing_decoder = VideoDecoderHandle::open(&open_options)?;
        let stream_props = indexing_decoder.properties();
        let file_size = indexing_decoder.file_size(&cfg.path)?;
        let track = indexing_decoder.track_index() as i32;

        let fence = Fence {
            lib_versions: decoder::lib_versions(),
            file_size,
            track,
            variable_format: cfg.variable_format as i32,
            hw_device: cfg.hw_device.as_ref().map(|h| h.name.clone()).unwrap_or_default(),
            extra_hw_frames: cfg.hw_device.as_ref().map(|h| h.extra_frames).unwrap_or(0),
            drc_scale: 0.0,
            options: cfg.demuxer_options.clone(),
        };

        let cache_file_path = cache_file::resolve(cfg.cache_mode, cfg.cache_path.as_deref(), &cfg.path, track);

        let cached_index = if cfg.cache_mode != CacheMode::Disabled {
            match std::fs::File::open(&cache_file_path) {
                Ok(f) => {
                    let mut r = std::io::BufReader::new(f);
                    match codec::read_video(&mut r, &fence) {
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
                let idx = indexer::index_video(&mut indexing_decoder, track, file_size, progress)?;
                if cache_file::should_write_index(cfg.cache_mode, idx.len()) {
                    if let Some(parent) = cache_file_path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    match std::fs::File::create(&cache_file_path) {
                        Ok(f) => {
                            let mut w = std::io::BufWriter::new(f);
                            if let Err(e) = codec::write_video(&mut w, &idx, &fence) {
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
        drop(indexing_decoder);

        let last_frame_duration = resolve_last_frame_duration(&index);
        let fps = estimate_fps(index.frames(), stream_props.time_base, stream_props.container_fps);
        let (rff_fields, rff_state) = if cfg.rff {
            rff::build_rff_fields(index.frames())
        } else {
            (Vec::new(), rff::RffState::Unused)
        };

        let properties = VideoProperties {
            width: stream_props.width,
            height: stream_props.height,
            pixel_format: stream_props.pixel_format,
            time_base: stream_props.time_base,
            fps,
            num_frames: index.len() as i64,
            num_rff_frames: rff_fields.len() as i64,
            rff_state,
        };

        let index = TrackIndex::new(index.frames().to_vec(), last_frame_duration);

        Ok(VideoSource {
            index,
            pool: DecoderPool::new(cfg.pool_size),
            cache: FrameCache::new(cfg.max_cache_bytes),
            bad_seek_locations: Default::default(),
            linear_mode: false,
            open_options,
            seek_preroll: cfg.seek_preroll,
            properties,
            rff_fields,
        })
    }
}

pub struct VideoSource {
    index: TrackIndex<VideoFrameRecord>,
    pool: DecoderPool<VideoDecoderHandle>,
    cache: FrameCache<CachedVideoFrame>,
    bad_seek_locations: std::collections::HashSet<i64>,
    linear_mode: bool,
    open_options: OpenOptions,
    seek_preroll: i64,
    properties: VideoProperties,
    rff_fields: rff::RffFields,
}

impl VideoSource {
    pub fn properties(&self) -> VideoProperties {
        self.properties
    }

    pub fn num_frames(&self) -> i64 {
        self.index.len() as i64
    }

    pub fn num_rff_frames(&self) -> i64 {
        self.properties.num_rff_frames
    }

    pub fn is_top_field_first(&self, n: i64) -> bool {
        self.index.get(n).map(|f| f.tff).unwrap_or(false)
    }

    pub fn duration(&self) -> i64 {
        match (self.index.frames().first(), self.index.frames().last()) {
            (Some(first), Some(last)) => (last.pts - first.pts) + self.index.last_frame_duration,
            _ => 0,
        }
    }

    /// `get_frame(N)` (§4.8): cache → near-hit linear → seek-and-verify →
    /// permanent linear fallback, delegated wholesale to `crate::seek`.
    pub fn get_frame(&mut self, n: i64) -> Result<Option<CachedVideoFrame>> {
        let open_options = self.open_options.clone();
        let open = || VideoDecoderHandle::open(&open_options);
        let hash_of = |f: &ffmpeg::util::frame::Video| decoder::hash_video_frame(f);
        let to_cached = |f: &ffmpeg::util::frame::Video| copy_video_frame(f);

        seek::get_frame(
            &self.index,
            &mut self.pool,
            &mut self.cache,
            &mut self.bad_seek_locations,
            &mut self.linear_mode,
            n,
            self.seek_preroll,
            0,
            &open,
            &hash_of,
            &to_cached,
        )
    }

    /// RFF-aware access (§4.9): returns the frame unmodified when its field
    /// pair comes from a single physical frame, else weaves the two
    /// contributing frames' fields together.
    pub fn get_frame_with_rff(&mut self, n: i64) -> Result<Option<CachedVideoFrame>> {
        if self.properties.rff_state == rff::RffState::Unused {
            return self.get_frame(n);
        }
        let (top_idx, bottom_idx) = match self.rff_fields.get(n as usize) {
            Some(&pair) => pair,
            None => return Ok(None),
        };
        if top_idx == bottom_idx {
            return self.get_frame(top_idx);
        }
        match (self.get_frame(top_idx)?, self.get_frame(bottom_idx)?) {
            (Some(top), Some(bottom)) => Ok(Some(weave_fields(&top, &bottom))),
            _ => Ok(None),
        }
    }

    /// Binary-searches by PTS for the frame whose presentation time is
    /// closest to `t` seconds, breaking ties toward the closer neighbor.
    pub fn get_frame_by_time(&mut self, t: f64) -> Result<Option<CachedVideoFrame>> {
        let time_base = self.properties.time_base;
        let target = (t * time_base.1 as f64 / time_base.0 as f64).round() as i64;
        let n = self.frame_number_for_pts(target);
        self.get_frame(n)
    }

    fn frame_number_for_pts(&self, target: i64) -> i64 {
        let frames = self.index.frames();
        if frames.is_empty() {
            return 0;
        }
        match frames.binary_search_by_key(&target, |f| f.pts) {
            Ok(i) => i as i64,
            Err(i) => {
                if i == 0 {
                    0
                } else if i >= frames.len() {
                    (frames.len() - 1) as i64
                } else {
                    let before = frames[i - 1].pts;
                    let after = frames[i].pts;
                    if (target - before).abs() <= (after - target).abs() {
                        (i - 1) as i64
                    } else {
                        i as i64
                    }
                }
            }
        }
    }

    /// Writes a v2 timecode file: `# timecode format v2` followed by one
    /// line per frame, `pts * time_base` in seconds at two decimal places.
    /// Fails if any frame's PTS is unset.
    pub fn write_timecodes(&self, path: &Path) -> Result<()> {
        let (num, den) = self.properties.time_base;
        let mut w = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(w, "# timecode format v2")?;
        for frame in self.index.frames() {
            if frame.pts == UNSET_PTS {
                return Err(Error::Unsupported("cannot write timecodes: a frame has an unset PTS".into()));
            }
            let seconds = (frame.pts as f64 * num as f64) / den as f64;
            writeln!(w, "{seconds:.2}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pts: i64, key_frame: bool) -> VideoFrameRecord {
        VideoFrameRecord {
            pts,
            repeat_pict: 0,
            key_frame,
            tff: false,
            hash: 0,
        }
    }

    #[test]
    fn estimate_fps_detects_cfr_from_single_delta_bucket() {
        let frames: Vec<VideoFrameRecord> = (0..50).map(|i| rec(i * 1001, i == 0)).collect();
        let fps = estimate_fps(&frames, (1, 30000), (25, 1));
        // delta = 1001, time_base = 1/30000 -> fps = 30000/1001
        assert_eq!(fps, (30000, 1001));
    }

    #[test]
    fn estimate_fps_falls_back_to_container_when_fewer_than_two_frames() {
        let frames = vec![rec(0, true)];
        let fps = estimate_fps(&frames, (1, 25), (25, 1));
        assert_eq!(fps, (25, 1));
    }

    #[test]
    fn estimate_fps_handles_mpeg_timebase_sentinel_via_middle_pair() {
        let frames: Vec<VideoFrameRecord> = (0..10).map(|i| rec(i * 3000, i == 0)).collect();
        let fps = estimate_fps(&frames, (1, 90000), (90000, 1));
        assert_eq!(fps, (30, 1));
    }

    #[test]
    fn reduce_fraction_normalizes_sign_and_gcd() {
        assert_eq!(reduce_fraction(-30000, -1001), (30000, 1001));
        assert_eq!(reduce_fraction(50, 2), (25, 1));
    }

    #[test]
    fn resolve_last_frame_duration_falls_back_to_modal_delta_when_unreported() {
        let frames: Vec<VideoFrameRecord> = (0..10).map(|i| rec(i * 100, i == 0)).collect();
        let index = TrackIndex::new(frames, 0);
        assert_eq!(resolve_last_frame_duration(&index), 100);
    }

    #[test]
    fn frame_number_for_pts_breaks_ties_toward_closer_neighbor() {
        let frames: Vec<VideoFrameRecord> = (0..10).map(|i| rec(i * 100, i == 0)).collect();
        let index = TrackIndex::new(frames, 100);
        let source_properties = VideoProperties {
            width: 0,
            height: 0,
            pixel_format: ffmpeg::format::Pixel::None,
            time_base: (1, 1),
            fps: (25, 1),
            num_frames: index.len() as i64,
            num_rff_frames: index.len() as i64,
            rff_state: rff::RffState::Unused,
        };
        let source = VideoSource {
            index,
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
            seek_preroll: 0,
            properties: source_properties,
            rff_fields: Vec::new(),
        };
        assert_eq!(source.frame_number_for_pts(150), 1);
        assert_eq!(source.frame_number_for_pts(149), 1);
        assert_eq!(source.frame_number_for_pts(140), 1);
    }
}
