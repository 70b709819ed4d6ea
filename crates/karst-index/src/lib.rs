//! B+Tree indexing for the karst storage engine.
//!
//! This crate provides:
//! - Typed leaf and internal node layouts over buffer pool frames
//! - The header page mapping index names to root page ids
//! - A unique-key B+Tree with split, redistribute, and coalesce
//! - Forward leaf-chain iteration

mod btree;

pub use btree::{
    internal_capacity, leaf_capacity, BPlusTree, FixedKey, HeaderPage, IndexIterator, IndexKey,
    InternalNode, LeafHeader, LeafNode, NodeHeader, NodeType,
};
