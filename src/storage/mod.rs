//! Persistent ordered storage.
//!
//! Composite keys and the page-backed B+ tree that orders them.

/// B+ tree over JSON leaf pages.
pub mod btree;

/// Composite ordered keys.
pub mod key;

pub use btree::{BTree, PageStore, TreeDescriptor};
pub use key::{Direction, Key, KeyComponent, KeyPart};
