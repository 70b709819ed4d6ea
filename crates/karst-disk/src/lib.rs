//! Disk I/O for the karst storage engine.
//!
//! This crate provides the page-granular disk manager: blocking reads and
//! writes of fixed-size pages, page id allocation, and id reuse after
//! deallocation.

mod manager;

pub use manager::{DiskManager, DiskManagerConfig};
