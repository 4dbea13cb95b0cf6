use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::arena::{Arena, Node, NodeBody, NodeIdx};
use super::{validate_page_size, BTree};
use crate::storage::btree::page::PageStore;
use crate::storage::btree::stats::BTreeStats;
use crate::storage::key::Key;
use crate::types::{FolioError, PageNo, Result};

/// Version tag of [`TreeDescriptor`].
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Serializable structure of a tree; leaf content stays in the page files.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TreeDescriptor {
    /// Format version, currently [`DESCRIPTOR_VERSION`].
    pub version: u32,
    /// Page size the tree was built with.
    pub page_size: usize,
    /// The root interior node.
    pub root: NodeDescriptor,
}

/// One node of a [`TreeDescriptor`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NodeDescriptor {
    /// Interior node with `keys.len() + 1` children.
    Internal {
        /// Separator keys.
        keys: Vec<Key>,
        /// Child nodes in key order.
        childs: Vec<NodeDescriptor>,
    },
    /// Leaf stored in page file `page`.
    Leaf {
        /// Page number.
        page: PageNo,
        /// Entry count at the time of the descriptor.
        count: usize,
        /// Content hash of the page file.
        hash: String,
    },
}

impl<V> BTree<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Flushes dirty pages and describes the tree structure.
    pub fn to_descriptor(&mut self) -> Result<TreeDescriptor> {
        self.flush()?;
        Ok(TreeDescriptor {
            version: DESCRIPTOR_VERSION,
            page_size: self.page_size,
            root: self.describe(self.root)?,
        })
    }

    fn describe(&self, idx: NodeIdx) -> Result<NodeDescriptor> {
        match &self.arena.node(idx)?.body {
            NodeBody::Leaf { page } => {
                let leaf = self.store.page(*page)?;
                Ok(NodeDescriptor::Leaf {
                    page: *page,
                    count: leaf.len(),
                    hash: leaf.hash().to_owned(),
                })
            }
            NodeBody::Internal { keys, children } => Ok(NodeDescriptor::Internal {
                keys: keys.clone(),
                childs: children
                    .iter()
                    .map(|child| self.describe(*child))
                    .collect::<Result<_>>()?,
            }),
        }
    }

    /// Reopens a tree from `descriptor`, reading pages from `dir` on demand.
    pub fn from_descriptor(descriptor: TreeDescriptor, dir: impl Into<PathBuf>) -> Result<Self> {
        if descriptor.version != DESCRIPTOR_VERSION {
            return Err(FolioError::format(format!(
                "unsupported tree descriptor version {} (expected {DESCRIPTOR_VERSION})",
                descriptor.version
            )));
        }
        validate_page_size(descriptor.page_size)?;
        if matches!(descriptor.root, NodeDescriptor::Leaf { .. }) {
            return Err(FolioError::format("tree descriptor root must be an interior node"));
        }
        let mut store = PageStore::open(dir)?;
        let mut arena = Arena::default();
        let root = build(&mut arena, &mut store, descriptor.root, None)?;
        debug!(
            target: "folio::btree",
            dir = %store.dir().display(),
            pages = store.page_count(),
            "reopened tree"
        );
        Ok(Self {
            page_size: descriptor.page_size,
            arena,
            root,
            store,
            stats: Arc::new(BTreeStats::default()),
        })
    }
}

fn build<V>(
    arena: &mut Arena,
    store: &mut PageStore<V>,
    node: NodeDescriptor,
    parent: Option<NodeIdx>,
) -> Result<NodeIdx>
where
    V: Serialize + DeserializeOwned,
{
    match node {
        NodeDescriptor::Leaf { page, count, hash } => {
            store.register(page, count, hash)?;
            Ok(arena.alloc(Node::leaf(parent, page)))
        }
        NodeDescriptor::Internal { keys, childs } => {
            if childs.len() != keys.len() + 1 {
                return Err(FolioError::format(format!(
                    "interior node has {} keys but {} children",
                    keys.len(),
                    childs.len()
                )));
            }
            let idx = arena.alloc(Node::internal(parent, keys, Vec::with_capacity(childs.len())));
            for child in childs {
                let child_idx = build(arena, store, child, Some(idx))?;
                arena.internal_mut(idx)?.1.push(child_idx);
            }
            Ok(idx)
        }
    }
}
