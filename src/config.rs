//! Resource-level configuration recognized by the writer.
//!
//! This is intentionally a plain value type: loading it from a file or
//! CLI flags is out of scope for the storage core.

/// Fragment-combine policy used when reconstructing a leaf page from
/// the disk-key chain of prior-revision fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersioningType {
    /// Every fragment is a full copy of the leaf; combining just reads
    /// the newest fragment.
    Full,
    /// Each fragment stores only the records that differ from the
    /// previous full fragment; combining overlays at most two pages.
    Differential,
    /// Each fragment stores only the records written in that
    /// revision; combining overlays every fragment back to the last
    /// full copy.
    #[default]
    Incremental,
    /// Like incremental, but bounded by a sliding window of the last
    /// `max_number_of_revisions_to_restore` fragments regardless of
    /// whether a full copy is ever reached.
    Sliding,
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub versioning_type: VersioningType,
    pub max_number_of_revisions_to_restore: usize,
    pub are_dewey_ids_stored: bool,
    pub with_path_summary: bool,
    pub store_node_history: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            versioning_type: VersioningType::default(),
            max_number_of_revisions_to_restore: 4,
            are_dewey_ids_stored: false,
            with_path_summary: true,
            store_node_history: false,
        }
    }
}
