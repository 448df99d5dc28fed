//! Content hashing over decoded frame payloads.
//!
//! The hash must be identical for two independent decodes of the same
//! frame, on any platform, so it is computed only over the "active" bytes
//! of each plane/channel -- line padding introduced by stride alignment is
//! never included. The chosen algorithm (XXH3-64, via `xxhash-rust`) is
//! part of the on-disk index format (see `crate::index::codec`); changing
//! it is a format-breaking change.

use xxhash_rust::xxh3::Xxh3;

/// Planar access to a decoded video frame, abstracted so the hasher can be
/// unit tested without a real decoder in the loop.
pub trait VideoPlanes {
    fn num_planes(&self) -> usize;
    /// Number of meaningful bytes per row for this plane, i.e.
    /// `plane_width * bytes_per_sample * step`, already accounting for
    /// chroma subsampling. Must be `<= stride`.
    fn active_bytes_per_row(&self, plane: usize) -> usize;
    fn rows(&self, plane: usize) -> usize;
    fn stride(&self, plane: usize) -> usize;
    fn data(&self, plane: usize) -> &[u8];
}

/// Planar or interleaved access to a decoded audio frame.
pub trait AudioPlanes {
    fn is_planar(&self) -> bool;
    fn channels(&self) -> usize;
    fn nb_samples(&self) -> usize;
    fn bytes_per_sample(&self) -> usize;
    /// For planar formats, the buffer for one channel (`nb_samples *
    /// bytes_per_sample` bytes). For interleaved formats, channel 0 is the
    /// single buffer holding all channels interleaved.
    fn channel_data(&self, channel: usize) -> &[u8];
}

/// Hash a decoded video frame's significant bytes, in plane order.
pub fn hash_video_frame<F: VideoPlanes>(frame: &F) -> u64 {
    let mut hasher = Xxh3::new();
    for plane in 0..frame.num_planes() {
        let width = frame.active_bytes_per_row(plane);
        let stride = frame.stride(plane);
        debug_assert!(width <= stride.max(width));
        let data = frame.data(plane);
        let mut offset = 0usize;
        for _ in 0..frame.rows(plane) {
            hasher.update(&data[offset..offset + width]);
            offset += stride;
        }
    }
    hasher.digest()
}

/// Hash a decoded audio frame's significant bytes.
pub fn hash_audio_frame<F: AudioPlanes>(frame: &F) -> u64 {
    let mut hasher = Xxh3::new();
    if frame.is_planar() {
        let per_channel = frame.nb_samples() * frame.bytes_per_sample();
        for ch in 0..frame.channels() {
            hasher.update(&frame.channel_data(ch)[..per_channel]);
        }
    } else {
        let total = frame.nb_samples() * frame.channels() * frame.bytes_per_sample();
        hasher.update(&frame.channel_data(0)[..total]);
    }
    hasher.digest()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeVideo {
        planes: Vec<(usize, usize, usize, Vec<u8>)>, // (active_width, rows, stride, data)
    }

    impl VideoPlanes for FakeVideo {
        fn num_planes(&self) -> usize {
            self.planes.len()
        }
        fn active_bytes_per_row(&self, plane: usize) -> usize {
            self.planes[plane].0
        }
        fn rows(&self, plane: usize) -> usize {
            self.planes[plane].1
        }
        fn stride(&self, plane: usize) -> usize {
            self.planes[plane].2
        }
        fn data(&self, plane: usize) -> &[u8] {
            &self.planes[plane].3
        }
    }

    fn padded_plane(active_width: usize, rows: usize, stride: usize, fill: u8) -> Vec<u8> {
        let mut data = vec![0xAAu8; stride * rows];
        for r in 0..rows {
            for c in 0..active_width {
                data[r * stride + c] = fill;
            }
        }
        data
    }

    #[test]
    fn padding_bytes_do_not_affect_hash() {
        let unpadded = FakeVideo {
            planes: vec![(4, 2, 4, vec![7, 7, 7, 7, 7, 7, 7, 7])],
        };
        let padded = FakeVideo {
            planes: vec![(4, 2, 8, padded_plane(4, 2, 8, 7))],
        };
        assert_eq!(hash_video_frame(&unpadded), hash_video_frame(&padded));
    }

    #[test]
    fn different_content_hashes_differently() {
        let a = FakeVideo {
            planes: vec![(4, 2, 4, vec![1, 2, 3, 4, 5, 6, 7, 8])],
        };
        let b = FakeVideo {
            planes: vec![(4, 2, 4, vec![1, 2, 3, 4, 5, 6, 7, 9])],
        };
        assert_ne!(hash_video_frame(&a), hash_video_frame(&b));
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let f = FakeVideo {
            planes: vec![(4, 2, 4, vec![9, 8, 7, 6, 5, 4, 3, 2])],
        };
        assert_eq!(hash_video_frame(&f), hash_video_frame(&f));
    }

    struct FakeAudio {
        planar: bool,
        channels: usize,
        nb_samples: usize,
        bytes_per_sample: usize,
        data: Vec<Vec<u8>>,
    }

    impl AudioPlanes for FakeAudio {
        fn is_planar(&self) -> bool {
            self.planar
        }
        fn channels(&self) -> usize {
            self.channels
        }
        fn nb_samples(&self) -> usize {
            self.nb_samples
        }
        fn bytes_per_sample(&self) -> usize {
            self.bytes_per_sample
        }
        fn channel_data(&self, channel: usize) -> &[u8] {
            &self.data[channel]
        }
    }

    #[test]
    fn planar_and_interleaved_equivalent_content_need_not_match() {
        let planar = FakeAudio {
            planar: true,
            channels: 2,
            nb_samples: 2,
            bytes_per_sample: 2,
            data: vec![vec![1, 0, 2, 0], vec![3, 0, 4, 0]],
        };
        let interleaved = FakeAudio {
            planar: false,
            channels: 2,
            nb_samples: 2,
            bytes_per_sample: 2,
            data: vec![vec![1, 0, 3, 0, 2, 0, 4, 0]],
        };
        // Different byte layouts, so different hashes -- hashing is over the
        // decoded representation as it actually occurs, not a canonical one.
        assert_ne!(hash_audio_frame(&planar), hash_audio_frame(&interleaved));
        assert_eq!(hash_audio_frame(&planar), hash_audio_frame(&planar));
    }
}
