//! Buffer pool management for the karst storage engine.
//!
//! This crate provides the in-memory page cache:
//! - Fixed-size frame array with pin counting and dirty tracking
//! - LRU eviction with strict recency order
//! - Extendible hash directory mapping page ids to frames
//! - RAII page guards that release their pin on every exit path

mod frame;
mod hash_table;
mod pool;
mod replacer;

pub use frame::{Frame, FrameId};
pub use hash_table::ExtendibleHashTable;
pub use pool::{BufferPoolConfig, BufferPoolManager, BufferPoolStats, LogManager, PageGuard};
pub use replacer::{LruReplacer, Replacer};
