//! Thin wrappers around one underlying demux/decode pipeline: open, read one
//! frame, seek by PTS, skip, flush. Two concrete handles exist
//! ([`VideoDecoderHandle`], [`AudioDecoderHandle`]); both implement
//! [`TrackDecoder`] so [`crate::seek::get_frame`] and friends can drive
//! either without duplicating the seek-and-verify loop.

pub mod pool;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::error::{Error, Result};
use crate::hash::{self, AudioPlanes, VideoPlanes};
use crate::index::UNSET_PTS;

/// Mirrors the source library's convention: non-negative values are an
/// absolute stream index; -1 means "first stream of the requested media
/// type"; values below -1 mean "the Nth (0-based after negation - 2)
/// stream of that type".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSelector {
    Absolute(usize),
    NthOfType(usize),
}

impl TrackSelector {
    pub fn from_raw(selector: i32) -> Self {
        if selector >= 0 {
            TrackSelector::Absolute(selector as usize)
        } else {
            TrackSelector::NthOfType((-selector - 1) as usize)
        }
    }
}

/// Hardware acceleration device request; resolution to a concrete
/// `AVHWDeviceType` and construction failure are reported with different
/// error variants (see `crate::Error::HWUnavailable`).
#[derive(Debug, Clone, Default)]
pub struct HwDevice {
    pub name: String,
    pub extra_frames: i32,
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub path: PathBuf,
    pub track: TrackSelector,
    pub demuxer_options: Vec<(String, String)>,
    pub threads: i32,
    pub hw_device: Option<HwDevice>,
    /// Disables "drop frame on format change" at the codec level when true.
    pub variable_format: bool,
}

/// The three library version integers used as the `.bsindex` fence (§4.2,
/// §11.2): `avutil`, `avformat`, `avcodec` drift independently between
/// builds, so each gets its own fence slot rather than one combined number.
pub fn lib_versions() -> [i32; 3] {
    unsafe {
        [
            ffmpeg::ffi::avutil_version() as i32,
            ffmpeg::ffi::avformat_version() as i32,
            ffmpeg::ffi::avcodec_version() as i32,
        ]
    }
}

fn resolved_thread_count(requested: i32, hw: bool, h264: bool) -> i32 {
    if requested > 0 {
        return requested;
    }
    let cap = if hw {
        if h264 {
            1
        } else {
            2
        }
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1)
            .min(16)
    };
    cap.max(1)
}

/// Shared surface the `crate::seek` state machine needs to drive a
/// decoder, independent of whether the underlying frames are video or
/// audio.
pub trait TrackDecoder {
    type Frame;

    /// Decodes and returns the next frame, or `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Self::Frame>>;
    /// Like `read_frame` but discards the payload; still advances logical
    /// position counters.
    fn skip_frames(&mut self, count: i64) -> Result<()>;
    /// Seeks the underlying demuxer backward to a keyframe at or before
    /// `pts`, flushes the decoder, and sets `logical_frame_number` to
    /// `UNSET_PTS` pending re-anchoring by the seek resolver.
    fn seek(&mut self, pts: i64) -> Result<()>;

    fn logical_frame_number(&self) -> i64;
    fn set_frame_number(&mut self, n: i64);
    fn seeked(&self) -> bool;
    fn has_more(&self) -> bool;
    /// Byte offset of the demuxer's read cursor, for indexing progress.
    fn source_position(&self) -> i64;
}

pub struct VideoDecoderHandle {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    stream_index: usize,
    logical_frame_number: i64,
    seeked: bool,
    has_more: bool,
    h264_first_seek_done: bool,
    is_h264: bool,
}

impl VideoDecoderHandle {
    #[instrument(skip(opts), fields(path = %opts.path.display()))]
    pub fn open(opts: &OpenOptions) -> Result<Self> {
        let input = ffmpeg::format::input_with_dictionary(&opts.path, to_ffmpeg_options(&opts.demuxer_options))?;
        open_common_video(input, opts)
    }

    pub(crate) fn current_frame_record(&self, frame: &ffmpeg::util::frame::Video) -> crate::index::VideoFrameRecord {
        crate::index::VideoFrameRecord {
            pts: frame.pts().unwrap_or(UNSET_PTS),
            repeat_pict: raw_repeat_pict(frame),
            key_frame: frame.is_key(),
            tff: frame.is_top_first(),
            hash: hash::hash_video_frame(&FfmpegVideoPlanes(frame)),
        }
    }

    /// Stream-level properties, populated as soon as the decoder is opened
    /// (width/height/format come from the codec parameters, not the first
    /// decoded frame, since those are known before any packet is sent).
    pub fn properties(&self) -> VideoStreamProperties {
        let stream = self.input.stream(self.stream_index).expect("stream_index validated at open");
        let time_base = stream.time_base();
        let fps = stream.avg_frame_rate();
        VideoStreamProperties {
            width: self.decoder.width(),
            height: self.decoder.height(),
            pixel_format: self.decoder.format(),
            time_base: (time_base.numerator(), time_base.denominator()),
            container_fps: (fps.numerator(), fps.denominator()),
            duration: stream.duration(),
        }
    }

    pub fn file_size(&self, path: &Path) -> Result<i64> {
        Ok(std::fs::metadata(path)?.len() as i64)
    }

    pub fn start_time(&self) -> i64 {
        self.input.stream(self.stream_index).expect("stream_index validated at open").start_time()
    }

    /// The resolved stream index, for fence construction (§4.2's `track`
    /// fence field is the resolved index, not the raw selector that may
    /// have been a negative "Nth of type" request).
    pub fn track_index(&self) -> usize {
        self.stream_index
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VideoStreamProperties {
    pub width: u32,
    pub height: u32,
    pub pixel_format: ffmpeg::format::Pixel,
    pub time_base: (i32, i32),
    pub container_fps: (i32, i32),
    pub duration: i64,
}

fn open_common_video(
    mut input: ffmpeg::format::context::Input,
    opts: &OpenOptions,
) -> Result<VideoDecoderHandle> {
    let stream_index = select_stream(&input, opts.track, ffmpeg::media::Type::Video, &opts.path)?;
    for (i, mut stream) in input.streams_mut().enumerate() {
        if i != stream_index {
            stream.set_discard(ffmpeg::Discard::All);
        }
    }

    let stream = input.stream(stream_index).expect("validated by select_stream");
    let parameters = stream.parameters();
    let is_h264 = parameters.id() == ffmpeg::codec::Id::H264;

    let mut decoder_ctx = ffmpeg::codec::Context::from_parameters(parameters)?;
    if let Some(hw) = &opts.hw_device {
        attach_hw_device(&mut decoder_ctx, hw, &opts.path)?;
    }
    decoder_ctx.set_threading(ffmpeg::codec::threading::Config {
        kind: ffmpeg::codec::threading::Type::Frame,
        count: resolved_thread_count(opts.threads, opts.hw_device.is_some(), is_h264) as usize,
        #[cfg(not(feature = "ffmpeg_5_0"))]
        safe: true,
    });
    apply_format_flags(&mut decoder_ctx, opts.variable_format);
    let decoder = decoder_ctx.decoder().video()?;

    Ok(VideoDecoderHandle {
        input,
        decoder,
        stream_index,
        logical_frame_number: 0,
        seeked: false,
        has_more: true,
        h264_first_seek_done: false,
        is_h264,
    })
}

/// Toggles the codec's "drop frame on format change" behavior per §11.6:
/// unless `variable_format` is set, the decoder drops frames that don't
/// match the first decoded format instead of surfacing a mid-stream change.
/// Also enables ICC-profile propagation and opts the decoder out of output
/// alignment padding, per §4.4's "decoder context flags" note -- raw
/// `AVCodecContext` fields with no safe accessor in this binding.
fn apply_format_flags(ctx: &mut ffmpeg::codec::context::Context, variable_format: bool) {
    unsafe {
        let raw = ctx.as_mut_ptr();
        if !variable_format {
            (*raw).flags |= ffmpeg::ffi::AV_CODEC_FLAG_DROP_CHANGED as i32;
        }
        (*raw).flags2 |= ffmpeg::ffi::AV_CODEC_FLAG2_ICC_PROFILES as i32;
        (*raw).flags |= ffmpeg::ffi::AV_CODEC_FLAG_UNALIGNED as i32;
    }
}

fn attach_hw_device(
    ctx: &mut ffmpeg::codec::context::Context,
    hw: &HwDevice,
    path: &Path,
) -> Result<()> {
    let device_type = ffmpeg::util::hwaccel::HWDeviceType::from(hw.name.as_str());
    if matches!(device_type, ffmpeg::util::hwaccel::HWDeviceType::None) {
        return Err(Error::ArgumentError(format!(
            "unknown hardware device {:?}",
            hw.name
        )));
    }
    ffmpeg::util::hwaccel::hwdevice_ctx_create(ctx, device_type).map_err(|e| Error::HWUnavailable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn select_stream(
    input: &ffmpeg::format::context::Input,
    selector: TrackSelector,
    kind: ffmpeg::media::Type,
    path: &Path,
) -> Result<usize> {
    match selector {
        TrackSelector::Absolute(index) => {
            let stream = input
                .stream(index)
                .ok_or_else(|| Error::InvalidTrack {
                    path: path.to_path_buf(),
                    selector: index as i32,
                })?;
            if stream.parameters().medium() != kind {
                return Err(Error::InvalidTrack {
                    path: path.to_path_buf(),
                    selector: index as i32,
                });
            }
            Ok(index)
        }
        TrackSelector::NthOfType(n) => input
            .streams()
            .filter(|s| s.parameters().medium() == kind)
            .nth(n)
            .map(|s| s.index())
            .ok_or_else(|| Error::InvalidTrack {
                path: path.to_path_buf(),
                selector: -(n as i32) - 1,
            }),
    }
}

/// Exposed so `crate::video` and `crate::seek` can hash a freshly decoded
/// frame the exact same way the index was built, without duplicating the
/// plane-walking logic in `crate::hash`.
pub(crate) fn hash_video_frame(frame: &ffmpeg::util::frame::Video) -> u64 {
    hash::hash_video_frame(&FfmpegVideoPlanes(frame))
}

fn raw_repeat_pict(frame: &ffmpeg::util::frame::Video) -> i32 {
    unsafe { (*frame.as_ptr()).repeat_pict }
}

struct FfmpegVideoPlanes<'a>(&'a ffmpeg::util::frame::Video);

impl VideoPlanes for FfmpegVideoPlanes<'_> {
    fn num_planes(&self) -> usize {
        self.0.planes()
    }

    fn active_bytes_per_row(&self, plane: usize) -> usize {
        self.0.plane_width(plane) as usize * bytes_per_sample(self.0.format())
    }

    fn rows(&self, plane: usize) -> usize {
        self.0.plane_height(plane) as usize
    }

    fn stride(&self, plane: usize) -> usize {
        self.0.stride(plane)
    }

    fn data(&self, plane: usize) -> &[u8] {
        self.0.data(plane)
    }
}

pub(crate) fn bytes_per_sample(format: ffmpeg::format::Pixel) -> usize {
    // High bit-depth formats (10/12/16-bit) store each sample in two bytes;
    // everything else this crate targets is one byte per sample per plane.
    match format {
        ffmpeg::format::Pixel::YUV420P10LE
        | ffmpeg::format::Pixel::YUV422P10LE
        | ffmpeg::format::Pixel::YUV444P10LE
        | ffmpeg::format::Pixel::YUV420P16LE
        | ffmpeg::format::Pixel::YUV422P16LE
        | ffmpeg::format::Pixel::YUV444P16LE => 2,
        _ => 1,
    }
}

impl TrackDecoder for VideoDecoderHandle {
    type Frame = ffmpeg::util::frame::Video;

    fn read_frame(&mut self) -> Result<Option<Self::Frame>> {
        loop {
            let mut frame = ffmpeg::util::frame::Video::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    self.logical_frame_number += 1;
                    return Ok(Some(frame));
                }
                Err(ffmpeg::Error::Other { errno } ) if errno == ffmpeg::util::error::EAGAIN => {
                    match self.input.packets().find(|(s, _)| s.index() == self.stream_index) {
                        Some((_, packet)) => self.decoder.send_packet(&packet)?,
                        None => {
                            self.decoder.send_eof()?;
                            self.has_more = false;
                            let mut flushed = ffmpeg::util::frame::Video::empty();
                            if self.decoder.receive_frame(&mut flushed).is_ok() {
                                self.logical_frame_number += 1;
                                return Ok(Some(flushed));
                            }
                            return Ok(None);
                        }
                    }
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn skip_frames(&mut self, count: i64) -> Result<()> {
        for _ in 0..count {
            if self.read_frame()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn seek(&mut self, pts: i64) -> Result<()> {
        if self.is_h264 && !self.h264_first_seek_done {
            self.h264_first_seek_done = true;
            let _ = self.read_frame();
        }
        self.input
            .seek(pts, ..pts)
            .map_err(Error::from)?;
        self.decoder.flush();
        self.seeked = true;
        self.logical_frame_number = UNSET_PTS;
        self.has_more = true;
        Ok(())
    }

    fn logical_frame_number(&self) -> i64 {
        self.logical_frame_number
    }

    fn set_frame_number(&mut self, n: i64) {
        self.logical_frame_number = n;
    }

    fn seeked(&self) -> bool {
        self.seeked
    }

    fn has_more(&self) -> bool {
        self.has_more
    }

    fn source_position(&self) -> i64 {
        self.input.position()
    }
}

pub struct AudioDecoderHandle {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Audio,
    stream_index: usize,
    logical_frame_number: i64,
    logical_sample_number: i64,
    seeked: bool,
    has_more: bool,
}

impl AudioDecoderHandle {
    #[instrument(skip(opts), fields(path = %opts.path.display()))]
    pub fn open(opts: &OpenOptions) -> Result<Self> {
        let mut input =
            ffmpeg::format::input_with_dictionary(&opts.path, to_ffmpeg_options(&opts.demuxer_options))?;
        let stream_index = select_stream(&input, opts.track, ffmpeg::media::Type::Audio, &opts.path)?;
        for (i, mut stream) in input.streams_mut().enumerate() {
            if i != stream_index {
                stream.set_discard(ffmpeg::Discard::All);
            }
        }
        let stream = input.stream(stream_index).expect("validated by select_stream");
        let mut decoder_ctx = ffmpeg::codec::Context::from_parameters(stream.parameters())?;
        apply_format_flags(&mut decoder_ctx, opts.variable_format);
        let decoder = decoder_ctx.decoder().audio()?;

        Ok(AudioDecoderHandle {
            input,
            decoder,
            stream_index,
            logical_frame_number: 0,
            logical_sample_number: 0,
            seeked: false,
            has_more: true,
        })
    }

    pub fn logical_sample_number(&self) -> i64 {
        self.logical_sample_number
    }

    pub fn set_sample_number(&mut self, n: i64) {
        self.logical_sample_number = n;
    }

    pub(crate) fn current_frame_record(&self, frame: &ffmpeg::util::frame::Audio) -> crate::index::AudioFrameRecord {
        crate::index::AudioFrameRecord {
            pts: frame.pts().unwrap_or(UNSET_PTS),
            start_sample: self.logical_sample_number,
            length_samples: frame.samples() as i64,
            hash: hash::hash_audio_frame(&FfmpegAudioPlanes(frame)),
        }
    }

    pub fn properties(&self) -> AudioStreamProperties {
        let stream = self.input.stream(self.stream_index).expect("stream_index validated at open");
        let time_base = stream.time_base();
        AudioStreamProperties {
            sample_rate: self.decoder.rate(),
            channels: self.decoder.channels() as usize,
            sample_format: self.decoder.format(),
            time_base: (time_base.numerator(), time_base.denominator()),
        }
    }

    pub fn start_time(&self) -> i64 {
        self.input.stream(self.stream_index).expect("stream_index validated at open").start_time()
    }

    pub fn track_index(&self) -> usize {
        self.stream_index
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AudioStreamProperties {
    pub sample_rate: u32,
    pub channels: usize,
    pub sample_format: ffmpeg::format::Sample,
    pub time_base: (i32, i32),
}

pub(crate) fn hash_audio_frame(frame: &ffmpeg::util::frame::Audio) -> u64 {
    hash::hash_audio_frame(&FfmpegAudioPlanes(frame))
}

struct FfmpegAudioPlanes<'a>(&'a ffmpeg::util::frame::Audio);

impl AudioPlanes for FfmpegAudioPlanes<'_> {
    fn is_planar(&self) -> bool {
        self.0.is_planar()
    }

    fn channels(&self) -> usize {
        self.0.channels() as usize
    }

    fn nb_samples(&self) -> usize {
        self.0.samples()
    }

    fn bytes_per_sample(&self) -> usize {
        self.0.format().bytes()
    }

    fn channel_data(&self, channel: usize) -> &[u8] {
        self.0.data(channel)
    }
}

impl TrackDecoder for AudioDecoderHandle {
    type Frame = ffmpeg::util::frame::Audio;

    fn read_frame(&mut self) -> Result<Option<Self::Frame>> {
        loop {
            let mut frame = ffmpeg::util::frame::Audio::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    self.logical_frame_number += 1;
                    self.logical_sample_number += frame.samples() as i64;
                    return Ok(Some(frame));
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    match self.input.packets().find(|(s, _)| s.index() == self.stream_index) {
                        Some((_, packet)) => self.decoder.send_packet(&packet)?,
                        None => {
                            self.decoder.send_eof()?;
                            self.has_more = false;
                            let mut flushed = ffmpeg::util::frame::Audio::empty();
                            if self.decoder.receive_frame(&mut flushed).is_ok() {
                                self.logical_frame_number += 1;
                                self.logical_sample_number += flushed.samples() as i64;
                                return Ok(Some(flushed));
                            }
                            return Ok(None);
                        }
                    }
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn skip_frames(&mut self, count: i64) -> Result<()> {
        for _ in 0..count {
            if self.read_frame()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn seek(&mut self, pts: i64) -> Result<()> {
        self.input.seek(pts, ..pts).map_err(Error::from)?;
        self.decoder.flush();
        self.seeked = true;
        self.logical_frame_number = UNSET_PTS;
        self.has_more = true;
        Ok(())
    }

    fn logical_frame_number(&self) -> i64 {
        self.logical_frame_number
    }

    fn set_frame_number(&mut self, n: i64) {
        self.logical_frame_number = n;
    }

    fn seeked(&self) -> bool {
        self.seeked
    }

    fn has_more(&self) -> bool {
        self.has_more
    }

    fn source_position(&self) -> i64 {
        self.input.position()
    }
}

/// Forwards a demuxer option map verbatim; kept as a free function so both
/// handle constructors share the same translation into `ffmpeg`'s
/// `Dictionary`.
pub(crate) fn to_ffmpeg_options(opts: &[(String, String)]) -> ffmpeg::Dictionary<'static> {
    let mut dict = ffmpeg::Dictionary::new();
    for (k, v) in opts {
        dict.set(k, v);
    }
    dict
}

/// Snapshot used by `crate::index::codec::Fence` construction; kept
/// separate from `OpenOptions` since the fence only cares about a subset of
/// fields plus values only known after opening (file size).
pub fn demuxer_options_map(opts: &[(String, String)]) -> HashMap<String, String> {
    opts.iter().cloned().collect()
}
