#![forbid(unsafe_code)]

//! Item indexes: key derivation, item-id patterns, collaborator interfaces,
//! the per-index coordinator, and the registry owning every index of a source.

mod coordinator;
mod definition;
mod keyspec;
mod pattern;
mod registry;
mod source;

pub use coordinator::{IndexContext, IndexMetadata, ItemIndex, PageSummary};
pub use definition::{IndexDefinition, IndexKind};
pub use keyspec::{derive_keys, KeySpec, ValueKind};
pub use pattern::{compile_all, GlobPattern};
pub use registry::{IndexRegistry, INDEX_FIELD};
pub use source::{
    drain_changes, ChangeBatch, ChangeSource, ChannelSink, MemorySource, MetadataProvider,
    NullSink, PageChangeNotification, PageChangeSink,
};
