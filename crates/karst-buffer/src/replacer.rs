//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use lru::LruCache;
use parking_lot::Mutex;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Selects a victim frame for eviction and removes it.
    ///
    /// Returns `None` if no frame is evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Removes a frame from the evictable set (idempotent).
    fn pin(&self, frame_id: FrameId);

    /// Adds a frame to the evictable set as most recently used (idempotent).
    fn unpin(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU replacement over unpinned frames.
///
/// Frames are ordered by when they last became unpinned; the victim is the
/// frame that has been evictable the longest. Re-unpinning a frame that is
/// already tracked does not refresh its position.
pub struct LruReplacer {
    /// Maximum number of tracked frames.
    capacity: usize,
    /// Recency list plus index map in one structure. Kept unbounded so a full
    /// replacer rejects new entries instead of silently evicting old ones.
    inner: Mutex<LruCache<FrameId, ()>>,
}

impl LruReplacer {
    /// Creates a replacer tracking at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Returns the maximum number of tracked frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.inner.lock().pop_lru().map(|(frame_id, ())| frame_id)
    }

    fn pin(&self, frame_id: FrameId) {
        self.inner.lock().pop(&frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.len() < self.capacity && !inner.contains(&frame_id) {
            inner.put(frame_id, ());
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().len()
    }
}
