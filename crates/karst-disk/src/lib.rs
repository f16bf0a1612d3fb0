//! Disk management for karst.
//!
//! This crate owns the single database file and exposes fixed-size logical
//! pages numbered from 0 upward:
//! - Meta page at physical offset 0 with per-extent allocation counters
//! - Extents of one bitmap page plus its data pages, appended lazily
//! - Page allocation, deallocation, and raw page I/O on logical ids

mod bitmap;
mod manager;
mod meta;

pub use bitmap::{BitmapPage, BITMAP_CAPACITY};
pub use manager::DiskManager;
pub use meta::{DiskMetaPage, MAX_EXTENTS, MAX_VALID_PAGE_ID};
