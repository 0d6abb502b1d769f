//! The logical record model stored inside key-value leaf pages.
//!
//! This core treats record payloads as opaque bytes; higher-level node
//! cursor / XQuery / JSON / XML APIs (out of scope,) are
//! responsible for encoding/decoding the payload.

use serde::{Deserialize, Serialize};

/// Number of logical records addressed by a single leaf page. Record
/// key `k` lives on leaf page key `k >> RECORDS_PER_PAGE_SHIFT`.
pub const RECORDS_PER_PAGE_SHIFT: u32 = 9;
pub const RECORDS_PER_PAGE: usize = 1 << RECORDS_PER_PAGE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(pub u64);

impl RecordKey {
    /// The logical leaf page key this record lives on.
    pub fn page_key(self) -> u64 {
        self.0 >> RECORDS_PER_PAGE_SHIFT
    }

    /// The record's slot offset within its leaf page.
    pub fn in_page_offset(self) -> usize {
        (self.0 as usize) & (RECORDS_PER_PAGE - 1)
    }
}

/// Secondary index a record belongs to. `Document` is the primary
/// tree; the rest back the secondary keyed (HOT) tries and auxiliary
/// sub-trees referenced from the revision root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    Document,
    Name,
    Path,
    PathSummary,
    Cas,
    DeweyId,
    ChangedNodes,
    RecordToRevisions,
}

/// A leaf-page entry: either a present node or a tombstone marking a
/// deletion that must be visible to both the `complete` and
/// `modified` overlays of a container (`removeRecord`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Present(Node),
    Deleted(RecordKey),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Present(n) => n.key,
            Record::Deleted(k) => *k,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Record::Deleted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub key: RecordKey,
    pub payload: Vec<u8>,
}

impl Node {
    pub fn new(key: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: RecordKey(key),
            payload: payload.into(),
        }
    }
}
