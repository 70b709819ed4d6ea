//! Page-based B+Tree index.
//!
//! Node storage is loaned from the buffer pool: a node is a typed view
//! over the bytes of a pinned frame, never held past its pin. Both node
//! kinds store parent page ids rather than pointers, so traversal always
//! re-fetches through the pool.
//!
//! Node layout (fixed-width entries after a fixed-width header):
//!
//! ```text
//! leaf:      | header 20B | (key, rid) | (key, rid) | ...
//! internal:  | header 16B | (⊥, child) | (key, child) | ...
//! ```
//!
//! An internal node's slot-0 key is a sentinel and never consulted; for an
//! internal node with keys K₁..Kₙ, subtree Cᵢ covers [Kᵢ, Kᵢ₊₁).

pub mod header;
pub mod index;
pub mod iterator;
pub mod page;
pub mod types;

pub use header::HeaderPage;
pub use index::BPlusTree;
pub use iterator::IndexIterator;
pub use page::{internal_capacity, leaf_capacity, InternalNode, LeafNode};
pub use types::{FixedKey, IndexKey, LeafHeader, NodeHeader, NodeType};
