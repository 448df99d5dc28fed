//! The seek-and-verify state machine shared by video and audio tracks.
//!
//! The original implementation duplicates this algorithm once per media
//! type (`BestVideoSource::SeekAndDecode` / `GetFrameLinearInternal` and
//! their audio counterparts are near-identical ~400-line twins). Here it is
//! written once, generic over [`crate::decoder::TrackDecoder`], since the
//! only real difference between the two call sites is which decoder type
//! and frame-record type is involved, both of which are already captured
//! by that trait plus [`crate::index::FrameRecord`].

use tracing::{instrument, trace, warn};

use std::collections::HashSet;

use crate::cache::{CachedFrame, FrameCache};
use crate::decoder::pool::DecoderPool;
use crate::decoder::TrackDecoder;
use crate::error::{Error, Result};
use crate::index::{FrameRecord, TrackIndex};

pub const RETRY_ATTEMPTS: u32 = 10;
pub const SEEK_FLOOR: i64 = 100;
const AMBIGUITY_WINDOW: usize = 10;

/// Frames accumulated while trying to re-anchor a decoder's logical
/// position after a seek.
struct MatchFrame<F> {
    frame: F,
    hash: u64,
}

/// Picks the nearest seek-eligible index position at or before `n -
/// preroll`, skipping anything in `bad_seek_locations`, never going below
/// [`SEEK_FLOOR`]. Returns -1 if no eligible position exists.
pub fn seek_frame<R: FrameRecord>(
    index: &TrackIndex<R>,
    n: i64,
    preroll: i64,
    bad_seek_locations: &std::collections::HashSet<i64>,
) -> i64 {
    let mut i = n - preroll;
    while i >= SEEK_FLOOR {
        if let Some(rec) = index.get(i) {
            if rec.pts() != crate::index::UNSET_PTS
                && rec.is_seek_candidate()
                && !bad_seek_locations.contains(&i)
            {
                return i;
            }
        }
        i -= 1;
    }
    -1
}

/// Outcome of one pass through the match-accumulation loop in
/// `seek_and_decode`, named per the design note's tagged-variant plan so
/// each branch is independently testable.
#[derive(Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    Resolved(i64),
    NeedMore,
    BadSeek,
}

/// Pure decision function over already-decoded hashes: given the track
/// index, the hash sequence accumulated since the seek, and whether the
/// decoder has hit EOF, decides whether the match is resolved, needs
/// another frame, or the seek point should be blacklisted.
///
/// Kept separate from the decode loop so it is unit-testable without any
/// decoder at all.
pub fn resolve_match<R: FrameRecord>(
    index: &TrackIndex<R>,
    match_hashes: &[u64],
    at_eof: bool,
    requested: i64,
) -> MatchOutcome {
    if match_hashes.is_empty() && at_eof {
        return MatchOutcome::BadSeek;
    }

    let candidates: Vec<i64> = if at_eof {
        let only = index.len() as i64 - match_hashes.len() as i64;
        if only >= 0 && matches_at(index, only, match_hashes) {
            vec![only]
        } else {
            vec![]
        }
    } else {
        (0..=(index.len() as i64 - match_hashes.len() as i64))
            .filter(|&i| matches_at(index, i, match_hashes))
            .collect()
    };

    if !candidates.iter().any(|&c| c <= requested) {
        return MatchOutcome::BadSeek;
    }

    let ambiguous = candidates.len() > 1 && (at_eof || match_hashes.len() >= AMBIGUITY_WINDOW);
    if ambiguous {
        return MatchOutcome::BadSeek;
    }

    if candidates.len() == 1 {
        MatchOutcome::Resolved(candidates[0])
    } else {
        MatchOutcome::NeedMore
    }
}

fn matches_at<R: FrameRecord>(index: &TrackIndex<R>, start: i64, hashes: &[u64]) -> bool {
    if start < 0 {
        return false;
    }
    hashes.iter().enumerate().all(|(j, h)| {
        index
            .get(start + j as i64)
            .map(|r| r.hash() == *h)
            .unwrap_or(false)
    })
}

/// Drives a seek-and-match pass for one decoder handle. Returns the
/// resolved frame (already matched against `requested`) if it landed within
/// the decoded window, or `None` if the caller should hand off to linear
/// service starting at the handle's newly re-anchored position.
///
/// `preroll_skip` lets audio callers burn off warm-up frames post-seek
/// before matching begins (§4.8 step 2); video passes 0.
#[instrument(skip(index, decoder, cache, bad_seek_locations, hash_of, to_cached), fields(requested = n))]
pub fn seek_and_decode<D, R, F>(
    index: &TrackIndex<R>,
    decoder: &mut D,
    n: i64,
    seek_target: i64,
    preroll: i64,
    preroll_skip: i64,
    bad_seek_locations: &mut std::collections::HashSet<i64>,
    cache: &mut FrameCache<F>,
    hash_of: impl Fn(&D::Frame) -> u64,
    to_cached: impl Fn(&D::Frame) -> F,
) -> Result<SeekAndDecodeResult<F>>
where
    D: TrackDecoder,
    R: FrameRecord,
    F: CachedFrame + Clone,
{
    let mut seek_target = seek_target;
    let mut attempts = 0u32;

    loop {
        if seek_target < SEEK_FLOOR {
            return Ok(SeekAndDecodeResult::LatchLinear);
        }

        let pts = index
            .get(seek_target)
            .map(|r| r.pts())
            .unwrap_or(crate::index::UNSET_PTS);
        if decoder.seek(pts).is_err() {
            return Ok(SeekAndDecodeResult::LatchLinear);
        }

        if preroll_skip > 0 {
            decoder.skip_frames(preroll_skip)?;
        }

        let mut matches: Vec<MatchFrame<D::Frame>> = Vec::new();
        let resolved = loop {
            let frame = decoder.read_frame()?;
            let at_eof = frame.is_none();

            let hashes: Vec<u64> = matches.iter().map(|m| m.hash).collect();
            let hash_of_new = frame.as_ref().map(&hash_of);

            let probe_hashes: Vec<u64> = if let Some(h) = hash_of_new {
                hashes.iter().copied().chain(std::iter::once(h)).collect()
            } else {
                hashes.clone()
            };

            match resolve_match(index, &probe_hashes, at_eof, n) {
                MatchOutcome::BadSeek => {
                    warn!(seek_target, "seek point proved unreliable, blacklisting");
                    bad_seek_locations.insert(seek_target);
                    break None;
                }
                MatchOutcome::NeedMore => {
                    if let Some(f) = frame {
                        let h = hash_of_new.expect("frame present implies hash present");
                        matches.push(MatchFrame { frame: f, hash: h });
                        trace!(matched = matches.len(), "extending match window");
                        continue;
                    } else {
                        bad_seek_locations.insert(seek_target);
                        break None;
                    }
                }
                MatchOutcome::Resolved(m) => {
                    if let Some(f) = frame {
                        matches.push(MatchFrame {
                            frame: f,
                            hash: hash_of_new.expect("frame present implies hash present"),
                        });
                    }
                    break Some(m);
                }
            }
        };

        match resolved {
            Some(m) => {
                let window_len = matches.len() as i64;
                decoder.set_frame_number(m + window_len);

                let mut found = None;
                for (k, mf) in matches.into_iter().enumerate() {
                    let frame_no = m + k as i64;
                    if frame_no >= n - preroll {
                        let cached = to_cached(&mf.frame);
                        if frame_no == n {
                            found = Some(cached.clone());
                        }
                        cache.put(frame_no, cached);
                    }
                }

                return Ok(match found {
                    Some(f) => SeekAndDecodeResult::Found(f),
                    None => SeekAndDecodeResult::ContinueLinearFrom(m + window_len),
                });
            }
            None => {
                attempts += 1;
                if attempts >= RETRY_ATTEMPTS {
                    return Ok(SeekAndDecodeResult::LatchLinear);
                }
                seek_target = seek_frame(index, seek_target - 100, 0, bad_seek_locations);
            }
        }
    }
}

pub enum SeekAndDecodeResult<F> {
    Found(F),
    ContinueLinearFrom(i64),
    LatchLinear,
}

/// Picks the pool slot best suited to service frame `n` linearly: the
/// occupied slot with the largest `logical_frame_number <= n`, skipping
/// seeked handles when `force_unseeked` (used once linear mode is latched,
/// so a misbehaving seeked handle is never reused). Returns `None` if no
/// slot qualifies, in which case the caller acquires one.
fn pick_linear_slot<D: TrackDecoder>(pool: &DecoderPool<D>, n: i64, force_unseeked: bool) -> Option<usize> {
    pool.iter()
        .filter(|(_, d)| !force_unseeked || !d.seeked())
        .filter(|(_, d)| d.logical_frame_number() != crate::index::UNSET_PTS && d.logical_frame_number() <= n)
        .max_by_key(|(_, d)| d.logical_frame_number())
        .map(|(i, _)| i)
}

/// Linear service (§4.8): decodes forward from whatever position a slot
/// already holds (or a freshly opened handle) until frame `n` is produced,
/// verifying each frame in the pre-roll window against the index hash.
///
/// A verification mismatch on a handle that got to its position via a seek
/// is itself a bad seek: it is blacklisted and a fresh `seek_and_decode`
/// pass is attempted from further back, bounded by [`RETRY_ATTEMPTS`], after
/// which linear mode is latched permanently and retried once more with
/// `force_unseeked = true` from a brand new handle.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(requested = n, force_unseeked))]
pub fn get_frame_linear<D, R, F>(
    index: &TrackIndex<R>,
    pool: &mut DecoderPool<D>,
    cache: &mut FrameCache<F>,
    bad_seek_locations: &mut HashSet<i64>,
    linear_mode: &mut bool,
    n: i64,
    preroll: i64,
    preroll_skip: i64,
    mut seek_target: i64,
    mut force_unseeked: bool,
    open: &impl Fn() -> Result<D>,
    hash_of: &impl Fn(&D::Frame) -> u64,
    to_cached: &impl Fn(&D::Frame) -> F,
) -> Result<Option<F>>
where
    D: TrackDecoder,
    R: FrameRecord,
    F: CachedFrame + Clone,
{
    let mut attempts = 0u32;

    'outer: loop {
        let slot_idx = match pick_linear_slot(pool, n, force_unseeked) {
            Some(i) => i,
            None => {
                let i = pool.acquire_index();
                pool.install(i, open()?);
                i
            }
        };

        loop {
            let logical = pool.get_mut(slot_idx).expect("slot just selected").logical_frame_number();
            let has_more = pool.get_mut(slot_idx).expect("slot just selected").has_more();
            if !has_more || logical > n {
                break;
            }

            if logical >= n - preroll {
                let decoder = pool.get_mut(slot_idx).expect("slot just selected");
                let seeked = decoder.seeked();
                let frame = decoder.read_frame()?;
                let expected = index.get(logical).map(FrameRecord::hash);
                let ok = match (&frame, expected) {
                    (Some(f), Some(h)) => hash_of(f) == h,
                    _ => false,
                };

                if ok {
                    let f = frame.expect("ok implies Some");
                    let cached = to_cached(&f);
                    if logical == n {
                        cache.put(logical, cached.clone());
                        return Ok(Some(cached));
                    }
                    cache.put(logical, cached);
                } else if seeked {
                    warn!(seek_target, logical, "verification mismatch on seeked handle, blacklisting");
                    pool.evict(slot_idx);
                    bad_seek_locations.insert(seek_target);
                    attempts += 1;

                    if attempts >= RETRY_ATTEMPTS || *linear_mode {
                        *linear_mode = true;
                        pool.clear();
                        cache.clear();
                        force_unseeked = true;
                        seek_target = -1;
                        continue 'outer;
                    }

                    let retry_target = seek_frame(index, seek_target - 100, 0, bad_seek_locations);
                    if retry_target < SEEK_FLOOR {
                        *linear_mode = true;
                        pool.clear();
                        cache.clear();
                        force_unseeked = true;
                        seek_target = -1;
                        continue 'outer;
                    }

                    let idx = pool.acquire_index();
                    pool.install(idx, open()?);
                    let decoder = pool.get_mut(idx).expect("just installed");
                    match seek_and_decode(
                        index,
                        decoder,
                        n,
                        retry_target,
                        preroll,
                        preroll_skip,
                        bad_seek_locations,
                        cache,
                        hash_of,
                        to_cached,
                    )? {
                        SeekAndDecodeResult::Found(f) => return Ok(Some(f)),
                        SeekAndDecodeResult::ContinueLinearFrom(_) => {
                            seek_target = retry_target;
                            continue 'outer;
                        }
                        SeekAndDecodeResult::LatchLinear => {
                            *linear_mode = true;
                            pool.clear();
                            cache.clear();
                            force_unseeked = true;
                            seek_target = -1;
                            continue 'outer;
                        }
                    }
                } else {
                    // A mismatch on a handle that was never seeked means the
                    // index itself disagrees with a from-scratch decode;
                    // documented as a diagnostic rather than silently
                    // papered over (§4.8).
                    return Err(Error::Decode {
                        frame: logical,
                        message: "frame content does not match index hash on unseeked decode"
                            .to_string(),
                    });
                }
            } else {
                let decoder = pool.get_mut(slot_idx).expect("slot just selected");
                decoder.skip_frames(n - preroll - logical)?;
            }
        }

        if !pool.get_mut(slot_idx).map(|d| d.has_more()).unwrap_or(false) {
            pool.evict(slot_idx);
        }
        return Ok(None);
    }
}

/// Top-level `get_frame(N)` dispatch (§4.8): cache hit, then near-hit linear
/// service, then seek-and-verify, then permanent linear fallback. This is
/// the single entry point [`crate::video::VideoSource`] and
/// [`crate::audio::AudioSource`] both delegate to.
#[allow(clippy::too_many_arguments)]
pub fn get_frame<D, R, F>(
    index: &TrackIndex<R>,
    pool: &mut DecoderPool<D>,
    cache: &mut FrameCache<F>,
    bad_seek_locations: &mut HashSet<i64>,
    linear_mode: &mut bool,
    n: i64,
    preroll: i64,
    preroll_skip: i64,
    open: &impl Fn() -> Result<D>,
    hash_of: &impl Fn(&D::Frame) -> u64,
    to_cached: &impl Fn(&D::Frame) -> F,
) -> Result<Option<F>>
where
    D: TrackDecoder,
    R: FrameRecord,
    F: CachedFrame + Clone,
{
    if n < 0 || n as usize >= index.len() {
        return Ok(None);
    }
    if let Some(f) = cache.get(n) {
        return Ok(Some(f.clone()));
    }

    if *linear_mode {
        return get_frame_linear(
            index,
            pool,
            cache,
            bad_seek_locations,
            linear_mode,
            n,
            preroll,
            preroll_skip,
            -1,
            true,
            open,
            hash_of,
            to_cached,
        );
    }

    let target = seek_frame(index, n, preroll, bad_seek_locations);
    if target < SEEK_FLOOR {
        return get_frame_linear(
            index,
            pool,
            cache,
            bad_seek_locations,
            linear_mode,
            n,
            preroll,
            preroll_skip,
            target,
            false,
            open,
            hash_of,
            to_cached,
        );
    }

    // §4.8 dispatch step 3: only take the near-hit fast path when some slot
    // is already positioned within [seek_frame(N), N] -- a slot sitting far
    // behind N would otherwise force a much longer linear decode than a
    // fresh seek, defeating the point of the seek resolver. This is also
    // what makes successive get_frame(N), get_frame(N+1) calls a fast path
    // per §5's ordering guarantee: the handle that just produced N is
    // always within that window for N+1.
    if pool.near_hit(target, n).is_some() {
        return get_frame_linear(
            index,
            pool,
            cache,
            bad_seek_locations,
            linear_mode,
            n,
            preroll,
            preroll_skip,
            target,
            false,
            open,
            hash_of,
            to_cached,
        );
    }

    let idx = pool.acquire_index();
    if pool.get_mut(idx).is_none() {
        pool.install(idx, open()?);
    }
    let decoder = pool.get_mut(idx).expect("just installed or already present");

    match seek_and_decode(
        index,
        decoder,
        n,
        target,
        preroll,
        preroll_skip,
        bad_seek_locations,
        cache,
        hash_of,
        to_cached,
    )? {
        SeekAndDecodeResult::Found(f) => Ok(Some(f)),
        SeekAndDecodeResult::ContinueLinearFrom(_) => get_frame_linear(
            index,
            pool,
            cache,
            bad_seek_locations,
            linear_mode,
            n,
            preroll,
            preroll_skip,
            target,
            false,
            open,
            hash_of,
            to_cached,
        ),
        SeekAndDecodeResult::LatchLinear => {
            *linear_mode = true;
            pool.clear();
            cache.clear();
            get_frame_linear(
                index,
                pool,
                cache,
                bad_seek_locations,
                linear_mode,
                n,
                preroll,
                preroll_skip,
                -1,
                true,
                open,
                hash_of,
                to_cached,
            )
        }
    }
}
