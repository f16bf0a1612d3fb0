//! Buffer pool management for karst.
//!
//! This crate provides in-memory page caching on top of the disk manager:
//! - Fixed-size pool of frames with pin counting and dirty tracking
//! - LRU eviction over unpinned frames
//! - RAII pin guards that release pages on every exit path

mod frame;
mod pool;
mod replacer;

pub use frame::{FrameId, Page};
pub use pool::{BufferPoolManager, PageGuard};
pub use replacer::{LruReplacer, Replacer};
