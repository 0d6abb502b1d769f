//! Revision root & uber page.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::IndexType;

use super::{PageReference, Revision};

/// The top of a revision: references to index sub-trees, per-index
/// max-node-key counters, and commit credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionRootPage {
    pub revision: Revision,
    pub index_roots: HashMap<(IndexType, u8), PageReference>,
    pub max_node_keys: HashMap<(IndexType, u8), u64>,
    pub index_tree_heights: HashMap<(IndexType, u8), u32>,
    pub user: Option<String>,
    pub message: Option<String>,
    pub timestamp: u64,
}

impl RevisionRootPage {
    pub fn bootstrap(revision: Revision) -> Self {
        Self {
            revision,
            index_roots: HashMap::new(),
            max_node_keys: HashMap::new(),
            index_tree_heights: HashMap::new(),
            user: None,
            message: None,
            timestamp: 0,
        }
    }

    pub fn next_node_key(&mut self, ty: IndexType, index: u8) -> u64 {
        let counter = self.max_node_keys.entry((ty, index)).or_insert(0);
        let key = *counter;
        *counter += 1;
        key
    }

    pub fn max_node_key(&self, ty: IndexType, index: u8) -> u64 {
        self.max_node_keys.get(&(ty, index)).copied().unwrap_or(0)
    }

    /// A frozen replica for a commit snapshot: every top-level index
    /// reference is isolated from subsequent writer mutation.
    pub fn deep_copy(&self) -> Self {
        Self {
            revision: self.revision,
            index_roots: self
                .index_roots
                .iter()
                .map(|(k, r)| (*k, r.snapshot_copy()))
                .collect(),
            max_node_keys: self.max_node_keys.clone(),
            index_tree_heights: self.index_tree_heights.clone(),
            user: self.user.clone(),
            message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// The file header: points at the most-recently-committed revision
/// root. A successful commit atomically rewrites this reference last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UberPage {
    pub latest_revision: Revision,
    pub revision_root_ref: Option<PageReference>,
}

impl UberPage {
    pub fn bootstrap() -> Self {
        Self {
            latest_revision: Revision(0),
            revision_root_ref: None,
        }
    }

    pub fn deep_copy(&self) -> Self {
        Self {
            latest_revision: self.latest_revision,
            revision_root_ref: self.revision_root_ref.as_ref().map(|r| r.snapshot_copy()),
        }
    }
}
