//! Folio: an incremental content indexer.
//!
//! Items flow in from a [`index::ChangeSource`] as change events. Each
//! [`index::ItemIndex`] filters them by item-id pattern, queues them durably,
//! and maintains a paged B+ tree of composite keys derived from item metadata.
//! Page-change notifications tell a publisher which page files to re-upload.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod index;
pub mod primitives;
pub mod queue;
pub mod storage;
pub mod types;

pub use admin::FolioConfig;
pub use index::{
    IndexContext, IndexDefinition, IndexRegistry, ItemIndex, KeySpec, PageChangeNotification,
};
pub use queue::{DurableEventQueue, PendingEvent, StateFile};
pub use storage::{BTree, Direction, Key, KeyComponent};
pub use types::{FolioError, PageNo, Result};
