//! On-page types for B+Tree nodes: headers, type tags, and key encoding.

use bytes::{Buf, BufMut};
use karst_common::page::PageId;
use karst_common::{KarstError, Result};

/// Type tag stored in the first byte of every tree node.
///
/// A zeroed page carries tag 0, which is rejected: attaching a view to an
/// uninitialized page is an error, not a silent empty node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    /// Leaf node holding (key, rid) pairs.
    Leaf = 1,
    /// Internal node holding (key, child page id) pairs.
    Internal = 2,
}

impl TryFrom<u8> for NodeType {
    type Error = KarstError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(NodeType::Leaf),
            2 => Ok(NodeType::Internal),
            _ => Err(KarstError::InvalidNodeType { tag }),
        }
    }
}

/// Fixed-width header at the start of every tree node.
///
/// Layout (16 bytes):
/// - node_type: 1 byte
/// - reserved: 1 byte
/// - size: 2 bytes (current entry count)
/// - max_size: 2 bytes
/// - reserved: 2 bytes
/// - page_id: 4 bytes
/// - parent_page_id: 4 bytes
///
/// Leaf nodes extend this with a next-leaf pointer, see [`LeafHeader`].
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    pub node_type: NodeType,
    pub size: u16,
    pub max_size: u16,
    pub page_id: PageId,
    pub parent_page_id: PageId,
}

// Field offsets shared by both node kinds.
pub(crate) const OFF_NODE_TYPE: usize = 0;
pub(crate) const OFF_SIZE: usize = 2;
pub(crate) const OFF_MAX_SIZE: usize = 4;
pub(crate) const OFF_PAGE_ID: usize = 8;
pub(crate) const OFF_PARENT_PAGE_ID: usize = 12;
/// Leaf-only next-leaf pointer.
pub(crate) const OFF_NEXT_PAGE_ID: usize = 16;

impl NodeHeader {
    /// Size of the common header in bytes.
    pub const SIZE: usize = 16;

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u8(self.node_type as u8);
        cursor.put_u8(0);
        cursor.put_u16_le(self.size);
        cursor.put_u16_le(self.max_size);
        cursor.put_u16_le(0);
        cursor.put_u32_le(self.page_id.0);
        cursor.put_u32_le(self.parent_page_id.0);
        buf
    }

    /// Deserializes the header, validating the type tag.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut cursor = buf;
        let node_type = NodeType::try_from(cursor.get_u8())?;
        cursor.advance(1);
        let size = cursor.get_u16_le();
        let max_size = cursor.get_u16_le();
        cursor.advance(2);
        let page_id = PageId(cursor.get_u32_le());
        let parent_page_id = PageId(cursor.get_u32_le());

        Ok(Self {
            node_type,
            size,
            max_size,
            page_id,
            parent_page_id,
        })
    }
}

/// Leaf node header: the common header plus the next-leaf pointer.
///
/// Layout: [`NodeHeader`] (16 bytes) followed by next_page_id (4 bytes).
#[derive(Debug, Clone, Copy)]
pub struct LeafHeader {
    pub node: NodeHeader,
    pub next_page_id: PageId,
}

impl LeafHeader {
    /// Size of the leaf header in bytes.
    pub const SIZE: usize = NodeHeader::SIZE + 4;

    /// Serializes the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..NodeHeader::SIZE].copy_from_slice(&self.node.to_bytes());
        let mut cursor = &mut buf[OFF_NEXT_PAGE_ID..];
        cursor.put_u32_le(self.next_page_id.0);
        buf
    }

    /// Deserializes the header, validating the type tag.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let node = NodeHeader::from_bytes(buf)?;
        let mut cursor = &buf[OFF_NEXT_PAGE_ID..];
        let next_page_id = PageId(cursor.get_u32_le());
        Ok(Self { node, next_page_id })
    }
}

/// Fixed-width key stored in tree nodes.
///
/// One generic tree covers every key width; implementations provide a
/// stable byte encoding whose order matches `Ord`.
pub trait IndexKey: Ord + Copy + Send + Sync + std::fmt::Debug + 'static {
    /// Size of the on-page encoding in bytes.
    const ENCODED_LEN: usize;

    /// Writes the key into `buf` (exactly `ENCODED_LEN` bytes).
    fn encode(&self, buf: &mut [u8]);

    /// Reads a key back from `buf`.
    fn decode(buf: &[u8]) -> Self;
}

impl IndexKey for u32 {
    const ENCODED_LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

impl IndexKey for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

impl IndexKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        i64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

/// Fixed-width byte-string key of `N` bytes, compared lexicographically.
///
/// Shorter inputs are zero-padded, so `FixedKey::<8>::from("ab")` sorts the
/// way the padded byte string does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedKey<const N: usize>(pub [u8; N]);

impl<const N: usize> FixedKey<N> {
    /// Builds a key from up to `N` bytes, zero-padding the remainder.
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = [0u8; N];
        let len = src.len().min(N);
        buf[..len].copy_from_slice(&src[..len]);
        Self(buf)
    }
}

impl<const N: usize> From<&str> for FixedKey<N> {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

impl<const N: usize> IndexKey for FixedKey<N> {
    const ENCODED_LEN: usize = N;

    fn encode(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(&self.0);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; N];
        key.copy_from_slice(&buf[..N]);
        Self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_tags() {
        assert_eq!(NodeType::try_from(1).unwrap(), NodeType::Leaf);
        assert_eq!(NodeType::try_from(2).unwrap(), NodeType::Internal);
        assert!(matches!(
            NodeType::try_from(0),
            Err(KarstError::InvalidNodeType { tag: 0 })
        ));
        assert!(NodeType::try_from(7).is_err());
    }

    #[test]
    fn test_node_header_roundtrip() {
        let header = NodeHeader {
            node_type: NodeType::Internal,
            size: 12,
            max_size: 100,
            page_id: PageId(7),
            parent_page_id: PageId::INVALID,
        };

        let bytes = header.to_bytes();
        let decoded = NodeHeader::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.node_type, NodeType::Internal);
        assert_eq!(decoded.size, 12);
        assert_eq!(decoded.max_size, 100);
        assert_eq!(decoded.page_id, PageId(7));
        assert_eq!(decoded.parent_page_id, PageId::INVALID);
    }

    #[test]
    fn test_node_header_rejects_zeroed_page() {
        let bytes = [0u8; NodeHeader::SIZE];
        assert!(NodeHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_leaf_header_roundtrip() {
        let header = LeafHeader {
            node: NodeHeader {
                node_type: NodeType::Leaf,
                size: 3,
                max_size: 50,
                page_id: PageId(9),
                parent_page_id: PageId(2),
            },
            next_page_id: PageId(10),
        };

        let bytes = header.to_bytes();
        let decoded = LeafHeader::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.node.node_type, NodeType::Leaf);
        assert_eq!(decoded.node.size, 3);
        assert_eq!(decoded.next_page_id, PageId(10));
    }

    #[test]
    fn test_integer_key_roundtrip() {
        let mut buf = [0u8; 8];

        42u32.encode(&mut buf);
        assert_eq!(u32::decode(&buf), 42);

        u64::MAX.encode(&mut buf);
        assert_eq!(u64::decode(&buf), u64::MAX);

        (-7i64).encode(&mut buf);
        assert_eq!(i64::decode(&buf), -7);
    }

    #[test]
    fn test_fixed_key_roundtrip() {
        let key = FixedKey::<16>::from("hello");
        let mut buf = [0u8; 16];
        key.encode(&mut buf);
        assert_eq!(FixedKey::<16>::decode(&buf), key);
    }

    #[test]
    fn test_fixed_key_ordering() {
        let a = FixedKey::<8>::from("apple");
        let b = FixedKey::<8>::from("banana");
        assert!(a < b);

        // Zero padding keeps prefixes before their extensions
        let short = FixedKey::<8>::from("app");
        assert!(short < a);
    }

    #[test]
    fn test_fixed_key_truncates_long_input() {
        let key = FixedKey::<4>::from("abcdefgh");
        assert_eq!(key.0, *b"abcd");
    }
}
