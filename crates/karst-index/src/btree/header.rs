//! Header page: the persistent mapping from index name to root page id.
//!
//! The header page lives at the reserved [`PageId::HEADER`] and is the only
//! process-wide anchor; an index re-reads its root from here on open and
//! rewrites its record on every root change.

use bytes::{Buf, BufMut};
use karst_common::page::{PageId, PAGE_SIZE};
use karst_common::{KarstError, Result};

/// Bytes reserved for an index name; longer names are identified by their
/// first `NAME_LEN` bytes.
const NAME_LEN: usize = 32;

/// Record layout: name (32 bytes, zero padded) + root page id (4 bytes).
const RECORD_LEN: usize = NAME_LEN + 4;

/// Record count field at the start of the page.
const COUNT_OFFSET: usize = 0;

/// First record offset.
const RECORDS_OFFSET: usize = 4;

/// Typed view of the header page.
pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    /// Maximum number of (name, root id) records the page can hold.
    pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_LEN;

    /// Attaches a view to header page bytes.
    ///
    /// A zeroed page is a valid empty header, so a freshly allocated
    /// header page needs no separate initialization.
    pub fn attach(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Returns the number of records.
    pub fn record_count(&self) -> usize {
        (&self.data[COUNT_OFFSET..]).get_u32_le() as usize
    }

    fn set_record_count(&mut self, count: usize) {
        (&mut self.data[COUNT_OFFSET..]).put_u32_le(count as u32);
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_LEN
    }

    fn encoded_name(name: &str) -> [u8; NAME_LEN] {
        let mut buf = [0u8; NAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LEN);
        buf[..len].copy_from_slice(&bytes[..len]);
        buf
    }

    fn find(&self, name: &str) -> Option<usize> {
        let probe = Self::encoded_name(name);
        (0..self.record_count()).find(|&i| {
            let offset = Self::record_offset(i);
            self.data[offset..offset + NAME_LEN] == probe
        })
    }

    /// Returns the recorded root page id for `name`, if any.
    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        self.find(name).map(|i| {
            let offset = Self::record_offset(i) + NAME_LEN;
            PageId((&self.data[offset..]).get_u32_le())
        })
    }

    /// Inserts a new (name, root id) record.
    ///
    /// Returns false when a record for `name` already exists and fails
    /// when the page is out of record slots.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> Result<bool> {
        if self.find(name).is_some() {
            return Ok(false);
        }
        let count = self.record_count();
        if count >= Self::MAX_RECORDS {
            return Err(KarstError::HeaderPageFull {
                name: name.to_string(),
            });
        }

        let offset = Self::record_offset(count);
        self.data[offset..offset + NAME_LEN].copy_from_slice(&Self::encoded_name(name));
        (&mut self.data[offset + NAME_LEN..]).put_u32_le(root_page_id.0);
        self.set_record_count(count + 1);
        Ok(true)
    }

    /// Rewrites the root id of an existing record, returning whether the
    /// record was found.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.find(name) {
            Some(i) => {
                let offset = Self::record_offset(i) + NAME_LEN;
                (&mut self.data[offset..]).put_u32_le(root_page_id.0);
                true
            }
            None => false,
        }
    }

    /// Removes the record for `name`, returning whether it existed.
    pub fn delete_record(&mut self, name: &str) -> bool {
        match self.find(name) {
            Some(i) => {
                let count = self.record_count();
                self.data.copy_within(
                    Self::record_offset(i + 1)..Self::record_offset(count),
                    Self::record_offset(i),
                );
                self.set_record_count(count - 1);
                true
            }
            None => false,
        }
    }
}
