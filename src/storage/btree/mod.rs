#![forbid(unsafe_code)]

//! Persistent B+ tree whose leaves are JSON page files.

/// Leaf pages and the page store.
pub mod page;
mod stats;
mod tree;

pub use page::{ChangeSession, LeafPage, PageChanges, PageStore, PAGE_FORMAT_VERSION};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, NodeDescriptor, TreeDescriptor, DESCRIPTOR_VERSION, MIN_PAGE_SIZE};

#[cfg(test)]
mod tests;
