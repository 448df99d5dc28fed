//! Byte-bounded LRU cache of decoded frames.
//!
//! Frames are expensive to decode but cheap to re-serve, so every source
//! keeps a bounded cache seeded as a side effect of ordinary linear and
//! seek-driven access (see `crate::seek`). Eviction is by total decoded
//! payload size, not frame count, since a single raw 4K frame can be
//! thousands of times larger than a compressed audio frame.

use lru::LruCache;

/// Default budget, matching the source library's own default.
pub const DEFAULT_MAX_BYTES: usize = 100 * 1024 * 1024;

/// Anything cacheable must know its own decoded payload size, so the cache
/// can enforce a byte budget rather than an item-count budget.
pub trait CachedFrame {
    fn byte_size(&self) -> usize;
}

pub struct FrameCache<F> {
    inner: LruCache<i64, F>,
    size: usize,
    max_size: usize,
}

impl<F: CachedFrame> FrameCache<F> {
    pub fn new(max_size: usize) -> Self {
        Self {
            // Capacity is unbounded by count; `max_size` governs eviction.
            inner: LruCache::unbounded(),
            size: 0,
            max_size,
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.apply_max_size();
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.inner.clear();
        self.size = 0;
    }

    /// Inserts or replaces frame `n`, promoting it to most-recently-used,
    /// then evicts least-recently-used entries until back under budget.
    pub fn put(&mut self, n: i64, frame: F) {
        if let Some(old) = self.inner.put(n, frame) {
            self.size -= old.byte_size();
        }
        self.size += self.inner.peek(&n).map(CachedFrame::byte_size).unwrap_or(0);
        self.apply_max_size();
    }

    /// Looks up frame `n`, promoting it to most-recently-used on hit.
    pub fn get(&mut self, n: i64) -> Option<&F> {
        self.inner.get(&n)
    }

    fn apply_max_size(&mut self) {
        while self.size > self.max_size {
            match self.inner.pop_lru() {
                Some((_, frame)) => self.size -= frame.byte_size(),
                None => break,
            }
        }
    }
}

impl<F> Default for FrameCache<F>
where
    F: CachedFrame,
{
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Blob(usize);

    impl CachedFrame for Blob {
        fn byte_size(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn evicts_least_recently_used_when_over_budget() {
        let mut cache: FrameCache<Blob> = FrameCache::new(10);
        cache.put(0, Blob(4));
        cache.put(1, Blob(4));
        cache.put(2, Blob(4)); // total 12 > 10, evicts frame 0
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_some());
        assert!(cache.size() <= 10);
    }

    #[test]
    fn get_promotes_to_most_recently_used() {
        let mut cache: FrameCache<Blob> = FrameCache::new(10);
        cache.put(0, Blob(4));
        cache.put(1, Blob(4));
        cache.get(0); // touch 0, making 1 the least recently used
        cache.put(2, Blob(4)); // total 12 > 10, evicts 1, not 0
        assert!(cache.get(0).is_some());
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn replacing_an_entry_updates_size_without_double_counting() {
        let mut cache: FrameCache<Blob> = FrameCache::new(100);
        cache.put(0, Blob(4));
        cache.put(0, Blob(9));
        assert_eq!(cache.size(), 9);
    }

    #[test]
    fn shrinking_max_size_evicts_immediately() {
        let mut cache: FrameCache<Blob> = FrameCache::new(100);
        cache.put(0, Blob(10));
        cache.put(1, Blob(10));
        cache.set_max_size(10);
        assert_eq!(cache.size(), 10);
    }

    #[test]
    fn clear_resets_size_to_zero() {
        let mut cache: FrameCache<Blob> = FrameCache::new(100);
        cache.put(0, Blob(10));
        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(cache.get(0).is_none());
    }
}
