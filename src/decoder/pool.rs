//! Fixed-size LRU pool of decoder handles, so repeated nearby seeks reuse an
//! already-warm decoder instead of opening a new one every time.

use crate::decoder::TrackDecoder;

pub const DEFAULT_POOL_SIZE: usize = 4;

struct Slot<D> {
    handle: D,
    last_use_seq: u64,
}

pub struct DecoderPool<D> {
    slots: Vec<Option<Slot<D>>>,
    seq: u64,
}

impl<D: TrackDecoder> DecoderPool<D> {
    pub fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self { slots, seq: 0 }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// A slot already positioned within `[low, high]`, suitable for
    /// servicing frame `high` by linear decode without a fresh seek.
    pub fn near_hit(&mut self, low: i64, high: i64) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map(|s| {
                    let n = s.handle.logical_frame_number();
                    n >= low && n <= high
                })
                .unwrap_or(false)
        })
    }

    /// An empty slot if one exists, else the least-recently-used occupied
    /// slot's index.
    pub fn acquire_index(&self) -> usize {
        if let Some(i) = self.slots.iter().position(|s| s.is_none()) {
            return i;
        }
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map(|s| s.last_use_seq).unwrap_or(0))
            .map(|(i, _)| i)
            .expect("pool has at least one slot")
    }

    /// Read-only view of occupied slots, for scans that must not disturb
    /// `last_use_seq` (e.g. choosing a linear-service slot by logical frame
    /// number without counting that inspection as a "use").
    pub fn iter(&self) -> impl Iterator<Item = (usize, &D)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, &s.handle)))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut D> {
        let seq = self.next_seq();
        let slot = self.slots.get_mut(index)?.as_mut()?;
        slot.last_use_seq = seq;
        Some(&mut slot.handle)
    }

    pub fn install(&mut self, index: usize, handle: D) {
        let seq = self.next_seq();
        self.slots[index] = Some(Slot {
            handle,
            last_use_seq: seq,
        });
    }

    pub fn evict(&mut self, index: usize) {
        self.slots[index] = None;
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDecoder {
        logical_frame_number: i64,
        seeked: bool,
    }

    impl TrackDecoder for FakeDecoder {
        type Frame = ();

        fn read_frame(&mut self) -> crate::error::Result<Option<()>> {
            Ok(None)
        }

        fn skip_frames(&mut self, _count: i64) -> crate::error::Result<()> {
            Ok(())
        }

        fn seek(&mut self, _pts: i64) -> crate::error::Result<()> {
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
            true
        }

        fn source_position(&self) -> i64 {
            0
        }
    }

    fn fake(n: i64) -> FakeDecoder {
        FakeDecoder {
            logical_frame_number: n,
            seeked: false,
        }
    }

    #[test]
    fn acquire_prefers_empty_slot() {
        let mut pool: DecoderPool<FakeDecoder> = DecoderPool::new(2);
        pool.install(0, fake(10));
        assert_eq!(pool.acquire_index(), 1);
    }

    #[test]
    fn acquire_evicts_least_recently_used_when_full() {
        let mut pool: DecoderPool<FakeDecoder> = DecoderPool::new(2);
        pool.install(0, fake(10));
        pool.install(1, fake(20));
        pool.get_mut(0); // touch slot 0, making slot 1 the LRU
        assert_eq!(pool.acquire_index(), 1);
    }

    #[test]
    fn near_hit_finds_slot_within_window() {
        let mut pool: DecoderPool<FakeDecoder> = DecoderPool::new(2);
        pool.install(0, fake(500));
        pool.install(1, fake(5000));
        assert_eq!(pool.near_hit(100, 600), Some(0));
        assert_eq!(pool.near_hit(4000, 4999), None);
    }

    #[test]
    fn evict_frees_the_slot_for_reuse() {
        let mut pool: DecoderPool<FakeDecoder> = DecoderPool::new(1);
        pool.install(0, fake(10));
        pool.evict(0);
        assert_eq!(pool.acquire_index(), 0);
        assert!(pool.get_mut(0).is_none());
    }
}
