//! Frame-indexed, seek-and-verify random access over demuxed video and
//! audio tracks.
//!
//! A container's packets are addressable by presentation timestamp, but
//! many containers seek imprecisely, duplicate or drop timestamps, and
//! leave the first frames after a seek decoder-dependent. This crate turns
//! one track of a demuxed source into a stable sequence: frame N always
//! resolves to the same decoded payload, regardless of access pattern.
//!
//! [`video::VideoSource`] and [`audio::AudioSource`] are the two public
//! entry points; both build on the same generic index ([`index`]),
//! seek-and-verify state machine ([`seek`]), decoder pool
//! ([`decoder::pool`]) and frame cache ([`cache`]).

pub mod audio;
pub mod cache;
pub mod cache_file;
pub mod decoder;
pub mod error;
pub mod hash;
pub mod index;
pub mod indexer;
pub mod log;
pub mod progress;
pub mod seek;
pub mod video;

pub use audio::{AudioProperties, AudioSource, AudioSourceBuilder};
pub use decoder::{HwDevice, TrackSelector};
pub use error::{Error, Result};
pub use video::{VideoProperties, VideoSource, VideoSourceBuilder};

/// Process-wide setup: starts the `tracing` subscriber and initializes the
/// underlying decode library. Safe to call more than once; only the first
/// call of each takes effect.
pub fn init() {
    log::init();
    ffmpeg::init().expect("failed to initialize the underlying decode library");
}
