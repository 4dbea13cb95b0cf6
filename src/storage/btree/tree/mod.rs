//! The B+ tree proper: interior nodes live in an in-memory arena, leaves are
//! pages of a [`PageStore`].
//!
//! The root is always an interior node. A fresh tree is a root without keys
//! whose single child is an empty leaf.

mod arena;
mod descriptor;
mod maintenance;
mod verify;

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use self::arena::{Arena, Node, NodeBody, NodeIdx};
use super::page::{ChangeSession, LeafPage, PageChanges, PageStore};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::primitives::io::remove_dir_if_exists;
use crate::storage::key::Key;
use crate::types::{FolioError, PageNo, Result};

pub use descriptor::{NodeDescriptor, TreeDescriptor, DESCRIPTOR_VERSION};

/// Smallest page size that still allows a split to produce two non-empty halves.
pub const MIN_PAGE_SIZE: usize = 2;

/// Ordered map from [`Key`] to `V` backed by persisted leaf pages.
pub struct BTree<V> {
    page_size: usize,
    arena: Arena,
    root: NodeIdx,
    store: PageStore<V>,
    stats: Arc<BTreeStats>,
}

impl<V> BTree<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Creates an empty tree whose pages live in `dir`. Any previous content of
    /// `dir` is discarded.
    pub fn create(dir: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let dir = dir.into();
        remove_dir_if_exists(&dir)?;
        let mut store = PageStore::open(dir)?;
        let page = store.allocate()?;
        let mut arena = Arena::default();
        let root = arena.alloc(Node::internal(None, Vec::new(), Vec::new()));
        let leaf = arena.alloc(Node::leaf(Some(root), page));
        arena.internal_mut(root)?.1.push(leaf);
        let mut tree = Self {
            page_size,
            arena,
            root,
            store,
            stats: Arc::new(BTreeStats::default()),
        };
        tree.flush()?;
        debug!(
            target: "folio::btree",
            dir = %tree.store.dir().display(),
            page_size,
            "created tree"
        );
        Ok(tree)
    }

    /// Maximum entries per leaf and keys per interior node.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn min_fill(&self) -> usize {
        self.page_size / 2
    }

    /// Number of levels, counting the leaf level.
    pub fn height(&self) -> Result<usize> {
        let mut height = 1;
        let mut current = self.root;
        while let NodeBody::Internal { children, .. } = &self.arena.node(current)?.body {
            height += 1;
            current = *children
                .first()
                .ok_or_else(|| FolioError::format("interior node without children"))?;
        }
        Ok(height)
    }

    /// Total number of entries, from cached page counts.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for page in self.leaf_pages()? {
            total += self.store.page_len(page)?;
        }
        Ok(total)
    }

    /// True when the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Leaf page numbers in key order.
    pub fn leaf_pages(&self) -> Result<Vec<PageNo>> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(idx) = stack.pop() {
            match &self.arena.node(idx)?.body {
                NodeBody::Leaf { page } => pages.push(*page),
                NodeBody::Internal { children, .. } => stack.extend(children.iter().rev()),
            }
        }
        Ok(pages)
    }

    /// Page metadata without loading content.
    pub fn page_info(&self, page: PageNo) -> Result<&LeafPage<V>> {
        self.store.page(page)
    }

    /// Returns the leaf that would contain `key`, loading it if needed.
    pub fn search(&mut self, key: &Key) -> Result<&LeafPage<V>> {
        let leaf = self.find_leaf(key)?;
        let page = self.page_of(leaf)?;
        self.stats.inc_leaf_searches();
        self.store.load(page)
    }

    /// Value stored under `key`.
    pub fn get(&mut self, key: &Key) -> Result<Option<V>> {
        Ok(self.search(key)?.get(key).cloned())
    }

    /// True if `key` is present.
    pub fn contains(&mut self, key: &Key) -> Result<bool> {
        Ok(self.search(key)?.contains_key(key))
    }

    /// Inserts `key`, replacing and returning the previous value of an existing key.
    pub fn insert(&mut self, key: Key, value: V) -> Result<Option<V>> {
        let leaf = self.find_leaf(&key)?;
        let page = self.page_of(leaf)?;
        self.stats.inc_leaf_searches();
        if let Some(pos) = self.store.load(page)?.position(&key) {
            let entries = self.store.page_mut(page)?.entries_mut();
            let previous = std::mem::replace(&mut entries[pos].1, value);
            return Ok(Some(previous));
        }
        let overflow = {
            let entries = self.store.page_mut(page)?.entries_mut();
            let pos = entries.partition_point(|(k, _)| *k <= key);
            entries.insert(pos, (key, value));
            entries.len() > self.page_size
        };
        if overflow {
            self.split_leaf(leaf)?;
        }
        Ok(None)
    }

    /// Every entry in key order. Loads all pages.
    pub fn scan(&mut self) -> Result<Vec<(Key, V)>> {
        let mut out = Vec::new();
        for page in self.leaf_pages()? {
            out.extend(self.store.load(page)?.entries().iter().cloned());
        }
        Ok(out)
    }

    /// Writes every page modified since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    /// Unloads every resident page.
    pub fn cleanup(&mut self) -> Result<()> {
        self.store.cleanup()
    }

    /// Bounds the number of resident pages.
    pub fn set_max_loaded_pages(&mut self, max: Option<usize>) {
        self.store.set_max_loaded_pages(max);
    }

    /// Starts recording written and removed pages.
    pub fn track_changes(&mut self) -> ChangeSession {
        self.store.track_changes()
    }

    /// Ends a change-tracking session.
    pub fn stop_tracking(&mut self, session: ChangeSession) -> PageChanges {
        self.store.stop_tracking(session)
    }

    /// The underlying page store.
    pub fn store(&self) -> &PageStore<V> {
        &self.store
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the current statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emit the current statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Deletes every page file along with the directory.
    pub fn destroy(self) -> Result<()> {
        self.store.destroy()
    }

    fn page_of(&self, leaf: NodeIdx) -> Result<PageNo> {
        self.arena
            .leaf_page(leaf)?
            .ok_or_else(|| FolioError::format(format!("node {leaf} is not a leaf")))
    }

    fn parent_of(&self, idx: NodeIdx) -> Result<Option<NodeIdx>> {
        Ok(self.arena.node(idx)?.parent)
    }

    fn find_leaf(&self, key: &Key) -> Result<NodeIdx> {
        let mut current = self.root;
        loop {
            match &self.arena.node(current)?.body {
                NodeBody::Leaf { .. } => return Ok(current),
                NodeBody::Internal { keys, children } => {
                    self.stats.inc_internal_searches();
                    let slot = child_slot(keys, key);
                    current = *children.get(slot).ok_or_else(|| {
                        FolioError::format(format!(
                            "interior node {current} has {} keys but {} children",
                            keys.len(),
                            children.len()
                        ))
                    })?;
                }
            }
        }
    }

    fn split_leaf(&mut self, leaf: NodeIdx) -> Result<()> {
        let page = self.page_of(leaf)?;
        let upper = {
            let entries = self.store.page_mut(page)?.entries_mut();
            let mid = entries.len() / 2;
            entries.split_off(mid)
        };
        let separator = upper
            .first()
            .map(|(k, _)| k.clone())
            .ok_or_else(|| FolioError::format("split produced an empty upper half"))?;
        let new_page = self.store.allocate()?;
        self.store.put_entries(new_page, upper)?;
        let parent = self
            .parent_of(leaf)?
            .ok_or_else(|| FolioError::format("leaf without parent"))?;
        let sibling = self.arena.alloc(Node::leaf(Some(parent), new_page));
        self.stats.inc_leaf_splits();
        debug!(
            target: "folio::btree",
            %page,
            %new_page,
            separator = %separator,
            "split leaf"
        );
        self.insert_into_parent(parent, leaf, separator, sibling)
    }

    /// Links `right` after `left` in `parent`, splitting interior nodes upward as
    /// long as they overflow.
    fn insert_into_parent(
        &mut self,
        mut parent: NodeIdx,
        mut left: NodeIdx,
        mut separator: Key,
        mut right: NodeIdx,
    ) -> Result<()> {
        loop {
            let pos = self.arena.child_position(parent, left)?;
            let overflow = {
                let (keys, children) = self.arena.internal_mut(parent)?;
                keys.insert(pos, separator);
                children.insert(pos + 1, right);
                keys.len() > self.page_size
            };
            if !overflow {
                return Ok(());
            }
            let (promoted, new_node) = self.split_internal(parent)?;
            match self.parent_of(parent)? {
                Some(grand) => {
                    self.arena.set_parent(new_node, Some(grand))?;
                    left = parent;
                    right = new_node;
                    separator = promoted;
                    parent = grand;
                }
                None => {
                    let new_root = self.arena.alloc(Node::internal(
                        None,
                        vec![promoted],
                        vec![parent, new_node],
                    ));
                    self.arena.set_parent(parent, Some(new_root))?;
                    self.arena.set_parent(new_node, Some(new_root))?;
                    self.root = new_root;
                    self.stats.inc_root_grows();
                    debug!(target: "folio::btree", height = self.height()?, "tree grew");
                    return Ok(());
                }
            }
        }
    }

    /// Splits an overflowing interior node at its midpoint. The midpoint key is
    /// returned for promotion together with the new right node, which is left
    /// without a parent.
    fn split_internal(&mut self, node: NodeIdx) -> Result<(Key, NodeIdx)> {
        let (promoted, right_keys, right_children) = {
            let (keys, children) = self.arena.internal_mut(node)?;
            let mid = keys.len() / 2;
            let right_keys = keys.split_off(mid + 1);
            let promoted = keys
                .pop()
                .ok_or_else(|| FolioError::format("split of an empty interior node"))?;
            let right_children = children.split_off(mid + 1);
            (promoted, right_keys, right_children)
        };
        let moved = right_children.clone();
        let right = self
            .arena
            .alloc(Node::internal(None, right_keys, right_children));
        for child in moved {
            self.arena.set_parent(child, Some(right))?;
        }
        self.stats.inc_internal_splits();
        Ok((promoted, right))
    }
}

/// Child slot to descend into for `key`.
///
/// `key < k0` goes to child 0, `key >= k(n-1)` to child n, otherwise to the
/// child `i` with `k(i-1) <= key < k(i)`. A node without keys has a single child.
fn child_slot(keys: &[Key], key: &Key) -> usize {
    let n = keys.len();
    if n == 0 || *key < keys[0] {
        return 0;
    }
    if *key >= keys[n - 1] {
        return n;
    }
    (1..n)
        .find(|&i| keys[i - 1] <= *key && *key < keys[i])
        .unwrap_or(n)
}

fn validate_page_size(page_size: usize) -> Result<()> {
    if page_size < MIN_PAGE_SIZE {
        return Err(FolioError::config(format!(
            "page size {page_size} is below the minimum of {MIN_PAGE_SIZE}"
        )));
    }
    Ok(())
}
