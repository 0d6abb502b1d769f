use crate::page::PageId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the storage core.
///
/// Variants mirror the error-kind table of the page-level storage
/// design: I/O failures, missing pages, buffer-frame races, HOT-trie
/// split failures, trie depth overflow, and use-after-close bugs.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("serialization error")]
    Serialization(#[from] Box<bincode::ErrorKind>),

    #[error("page `{0}` not found")]
    PageNotFound(PageId),

    #[error("guard held on page `{0}` whose buffer frame was reused")]
    FrameReused(PageId),

    #[error("leaf page cannot be split further")]
    UnsplittablePage,

    #[error("trie depth exceeded configured maximum of `{0}`")]
    TreeHeightExceeded(usize),

    #[error("operation attempted on a closed transaction")]
    AlreadyClosed,

    #[error("revision `{0}` does not exist")]
    RevisionNotFound(u64),

    #[error("cannot truncate to revision `{0}`, it is not older than the current revision `{1}`")]
    InvalidTruncation(u64, u64),
}
