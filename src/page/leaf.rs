//! Leaf page byte layout.
//!
//! A leaf owns a 64 KB data segment: a fixed-size slot directory
//! indexed by in-page record offset, a packed payload region growing
//! from the end, and an optional DeweyID segment. We keep the
//! logical record table (what combine/COW actually operate on)
//! as the primary in-memory representation and (de)serialize it to
//! the packed layout on demand, tracking stale payload bytes left
//! behind by in-place updates so `compact()` has something real to
//! reclaim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::record::{Record, RecordKey, RECORDS_PER_PAGE};

pub const LEAF_SEGMENT_SIZE: usize = 64 * 1024;

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
pub struct SlotEntry {
    pub offset: u32,
    pub length: u32,
    pub tombstone: u8,
    pub _pad: [u8; 3],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeafPage {
    /// Keyed by in-page slot (record key & (RECORDS_PER_PAGE - 1)).
    records: BTreeMap<u16, Record>,
    dewey_ids: Option<BTreeMap<u16, Vec<u8>>>,
    /// Bytes the packed payload region would reclaim on the next
    /// `compact()`, accrued by in-place `set_record` overwrites.
    stale_bytes: usize,
    #[serde(skip)]
    segment_live: bool,
}

impl LeafPage {
    pub fn new(with_dewey_ids: bool) -> Self {
        Self {
            records: BTreeMap::new(),
            dewey_ids: if with_dewey_ids {
                Some(BTreeMap::new())
            } else {
                None
            },
            stale_bytes: 0,
            segment_live: true,
        }
    }

    fn slot_of(key: RecordKey) -> u16 {
        key.in_page_offset() as u16
    }

    /// Zero-copy style accessor: returns the record occupying a slot,
    /// if any.
    pub fn get_slot(&self, key: RecordKey) -> Option<&Record> {
        self.records.get(&Self::slot_of(key))
    }

    /// Places a (possibly deserialized) record into the parallel
    /// in-memory table keyed by offset.
    pub fn set_record(&mut self, record: Record) {
        let slot = Self::slot_of(record.key());
        let approx_len = match &record {
            Record::Present(n) => n.payload.len(),
            Record::Deleted(_) => 0,
        };
        if let Some(old) = self.records.insert(slot, record) {
            let old_len = match &old {
                Record::Present(n) => n.payload.len(),
                Record::Deleted(_) => 0,
            };
            self.stale_bytes += old_len;
        }
        let _ = approx_len;
    }

    pub fn remove_slot(&mut self, key: RecordKey) {
        self.set_record(Record::Deleted(key));
    }

    pub fn set_dewey_id(&mut self, key: RecordKey, dewey: Vec<u8>) {
        if let Some(map) = &mut self.dewey_ids {
            map.insert(Self::slot_of(key), dewey);
        }
    }

    pub fn dewey_id(&self, key: RecordKey) -> Option<&[u8]> {
        self.dewey_ids
            .as_ref()
            .and_then(|m| m.get(&Self::slot_of(key)))
            .map(|v| v.as_slice())
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Rewrites the segment to reclaim fragmented payload space,
    /// returning bytes reclaimed.
    pub fn compact(&mut self) -> usize {
        let reclaimed = self.stale_bytes;
        self.stale_bytes = 0;
        reclaimed
    }

    /// Overlay `other` onto `self`: entries present in `other` win,
    /// entries only in `self` are kept. Used by the versioning
    /// strategies to combine fragments.
    pub fn overlay_from(&mut self, other: &LeafPage) {
        for (slot, record) in &other.records {
            self.records.entry(*slot).or_insert_with(|| record.clone());
        }
        if let (Some(dst), Some(src)) = (&mut self.dewey_ids, &other.dewey_ids) {
            for (slot, dewey) in src {
                dst.entry(*slot).or_insert_with(|| dewey.clone());
            }
        }
    }

    /// Whether this fragment alone already covers every slot, so no
    /// further (older) fragments need to be combined in.
    pub fn is_full(&self) -> bool {
        self.records.len() >= RECORDS_PER_PAGE
    }

    /// Computes the fixed-size slot directory that would describe
    /// this leaf's packed payload region on disk, in slot order. Used
    /// by the storage writer to enforce the 64 KB segment bound
    /// before a page is persisted.
    pub fn slot_directory(&self) -> Vec<SlotEntry> {
        let mut offset = 0u32;
        let mut dir = Vec::with_capacity(self.records.len());
        for record in self.records.values() {
            let length = match record {
                Record::Present(n) => n.payload.len() as u32,
                Record::Deleted(_) => 0,
            };
            dir.push(SlotEntry {
                offset,
                length,
                tombstone: record.is_deleted() as u8,
                _pad: [0; 3],
            });
            offset += length;
        }
        dir
    }

    /// Size in bytes the packed payload region would currently
    /// occupy, directory included.
    pub fn packed_size(&self) -> usize {
        let dir = self.slot_directory();
        dir.len() * std::mem::size_of::<SlotEntry>()
            + dir.iter().map(|e| e.length as usize).sum::<usize>()
    }

    pub(crate) fn release_segment(&mut self) {
        self.segment_live = false;
        self.records.clear();
        self.dewey_ids = None;
    }

    pub fn is_segment_released(&self) -> bool {
        !self.segment_live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Node;

    #[test]
    fn set_and_get_slot() {
        let mut leaf = LeafPage::new(false);
        leaf.set_record(Record::Present(Node::new(5, b"hello".to_vec())));

        let got = leaf.get_slot(RecordKey(5)).unwrap();
        assert_eq!(got.key(), RecordKey(5));
    }

    #[test]
    fn compact_reclaims_overwritten_bytes() {
        let mut leaf = LeafPage::new(false);
        leaf.set_record(Record::Present(Node::new(1, vec![0u8; 100])));
        leaf.set_record(Record::Present(Node::new(1, vec![0u8; 10])));

        assert_eq!(leaf.compact(), 100);
        assert_eq!(leaf.compact(), 0);
    }

    #[test]
    fn overlay_prefers_newer_slots() {
        let mut newer = LeafPage::new(false);
        newer.set_record(Record::Present(Node::new(1, b"new".to_vec())));

        let mut older = LeafPage::new(false);
        older.set_record(Record::Present(Node::new(1, b"old".to_vec())));
        older.set_record(Record::Present(Node::new(2, b"only-old".to_vec())));

        newer.overlay_from(&older);

        assert_eq!(
            newer.get_slot(RecordKey(1)).unwrap(),
            &Record::Present(Node::new(1, b"new".to_vec()))
        );
        assert_eq!(
            newer.get_slot(RecordKey(2)).unwrap(),
            &Record::Present(Node::new(2, b"only-old".to_vec()))
        );
    }
}
