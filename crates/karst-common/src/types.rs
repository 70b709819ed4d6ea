//! Record identifiers and transaction handles.

use crate::page::PageId;
use serde::{Deserialize, Serialize};

/// Identifier for a record stored outside the index (page + slot).
///
/// The index stores rids as leaf values but never dereferences them; the
/// tuple layer owns their interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    /// Page holding the record.
    pub page_id: PageId,
    /// Slot within that page.
    pub slot: u32,
}

impl Rid {
    /// Size of the fixed on-page encoding in bytes.
    pub const ENCODED_LEN: usize = 8;

    /// Creates a new record id.
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot)
    }
}

/// Transaction identifier.
pub type TxnId = u64;

/// Opaque transaction handle threaded through index operations.
///
/// The core attaches no behavior to it; it exists so callers can plumb a
/// transaction context through without the index depending on a
/// transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    id: TxnId,
}

impl Transaction {
    /// Creates a handle for the given transaction id.
    pub fn new(id: TxnId) -> Self {
        Self { id }
    }

    /// Returns the transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rid_new() {
        let rid = Rid::new(PageId(3), 17);
        assert_eq!(rid.page_id, PageId(3));
        assert_eq!(rid.slot, 17);
    }

    #[test]
    fn test_rid_display() {
        let rid = Rid::new(PageId(3), 17);
        assert_eq!(rid.to_string(), "page:3:17");
    }

    #[test]
    fn test_rid_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Rid::new(PageId(1), 0));
        set.insert(Rid::new(PageId(1), 1));
        set.insert(Rid::new(PageId(1), 0));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_rid_serde_roundtrip() {
        let original = Rid::new(PageId(10), 500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: Rid = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_transaction_handle() {
        let txn = Transaction::new(7);
        assert_eq!(txn.id(), 7);
    }
}
