use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::arena::{NodeBody, NodeIdx};
use super::BTree;
use crate::storage::key::Key;
use crate::types::{FolioError, Result};

impl<V> BTree<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Removes `key` and returns its value. Fails with `NotFound` when absent.
    pub fn remove(&mut self, key: &Key) -> Result<V> {
        let leaf = self.find_leaf(key)?;
        let page = self.page_of(leaf)?;
        self.stats.inc_leaf_searches();
        let pos = self
            .store
            .load(page)?
            .position(key)
            .ok_or_else(|| FolioError::not_found(format!("key {key}")))?;
        let ((old_key, value), new_first) = {
            let entries = self.store.page_mut(page)?.entries_mut();
            let removed = entries.remove(pos);
            let new_first = if pos == 0 {
                entries.first().map(|(k, _)| k.clone())
            } else {
                None
            };
            (removed, new_first)
        };
        if let Some(new_first) = new_first {
            self.replace_separator(leaf, &old_key, &new_first)?;
        }
        self.rebalance_leaf(leaf)?;
        Ok(value)
    }

    /// Rewrites every ancestor key equal to `old` so that it reads `new`.
    fn replace_separator(&mut self, from: NodeIdx, old: &Key, new: &Key) -> Result<()> {
        let mut current = self.parent_of(from)?;
        while let Some(idx) = current {
            let (keys, _) = self.arena.internal_mut(idx)?;
            for key in keys.iter_mut().filter(|k| **k == *old) {
                *key = new.clone();
            }
            current = self.parent_of(idx)?;
        }
        Ok(())
    }

    fn rebalance_leaf(&mut self, leaf: NodeIdx) -> Result<()> {
        let page = self.page_of(leaf)?;
        let min = self.min_fill();
        if self.store.page_len(page)? >= min {
            return Ok(());
        }
        let Some(parent) = self.parent_of(leaf)? else {
            return Ok(());
        };
        let pos = self.arena.child_position(parent, leaf)?;
        let (left, right) = {
            let (_, children) = self.arena.internal(parent)?;
            let left = pos.checked_sub(1).map(|p| children[p]);
            (left, children.get(pos + 1).copied())
        };
        if left.is_none() && right.is_none() {
            // Sole leaf under the root.
            return Ok(());
        }

        if let Some(right) = right {
            let right_page = self.page_of(right)?;
            if self.store.page_len(right_page)? > min {
                let moved = self.store.page_mut(right_page)?.entries_mut().remove(0);
                self.store.page_mut(page)?.entries_mut().push(moved);
                let right_first = self
                    .store
                    .page(right_page)?
                    .entries()
                    .first()
                    .map(|(k, _)| k.clone())
                    .ok_or_else(|| FolioError::format("borrow emptied the right sibling"))?;
                self.arena.internal_mut(parent)?.0[pos] = right_first;
                self.stats.inc_leaf_borrows();
                return Ok(());
            }
        }

        if let Some(left) = left {
            let left_page = self.page_of(left)?;
            if self.store.page_len(left_page)? > min {
                let moved = self
                    .store
                    .page_mut(left_page)?
                    .entries_mut()
                    .pop()
                    .ok_or_else(|| FolioError::format("borrow from an empty left sibling"))?;
                let separator = moved.0.clone();
                self.store.page_mut(page)?.entries_mut().insert(0, moved);
                self.arena.internal_mut(parent)?.0[pos - 1] = separator;
                self.stats.inc_leaf_borrows();
                return Ok(());
            }
        }

        if let Some(right) = right {
            let right_page = self.page_of(right)?;
            let moved = self.store.take_entries(right_page)?;
            self.store.page_mut(page)?.entries_mut().extend(moved);
            {
                let (keys, children) = self.arena.internal_mut(parent)?;
                keys.remove(pos);
                children.remove(pos + 1);
            }
            self.arena.release(right)?;
            self.store.deallocate(right_page)?;
            debug!(target: "folio::btree", into = %page, freed = %right_page, "merged leaves");
        } else if let Some(left) = left {
            let left_page = self.page_of(left)?;
            let moved = self.store.take_entries(page)?;
            self.store.page_mut(left_page)?.entries_mut().extend(moved);
            {
                let (keys, children) = self.arena.internal_mut(parent)?;
                keys.remove(pos - 1);
                children.remove(pos);
            }
            self.arena.release(leaf)?;
            self.store.deallocate(page)?;
            debug!(target: "folio::btree", into = %left_page, freed = %page, "merged leaves");
        }
        self.stats.inc_leaf_merges();
        self.rebalance_internal(parent)
    }

    /// Restores the fill of interior nodes from `start` up to the root.
    fn rebalance_internal(&mut self, start: NodeIdx) -> Result<()> {
        let min = self.min_fill();
        let mut node = start;
        loop {
            if node == self.root {
                return self.collapse_root();
            }
            if self.arena.internal(node)?.0.len() >= min {
                return Ok(());
            }
            let parent = self
                .parent_of(node)?
                .ok_or_else(|| FolioError::format("interior node without parent"))?;
            let pos = self.arena.child_position(parent, node)?;
            let (left, right) = {
                let (_, children) = self.arena.internal(parent)?;
                let left = pos.checked_sub(1).map(|p| children[p]);
                (left, children.get(pos + 1).copied())
            };

            if let Some(right) = right {
                if self.arena.internal(right)?.0.len() > min {
                    self.rotate_from_right(parent, pos, node, right)?;
                    return Ok(());
                }
            }
            if let Some(left) = left {
                if self.arena.internal(left)?.0.len() > min {
                    self.rotate_from_left(parent, pos, node, left)?;
                    return Ok(());
                }
            }

            match (left, right) {
                (_, Some(right)) => self.merge_internal(parent, pos, node, right)?,
                (Some(left), None) => self.merge_internal(parent, pos - 1, left, node)?,
                (None, None) => return Ok(()),
            }
            node = parent;
        }
    }

    fn rotate_from_right(
        &mut self,
        parent: NodeIdx,
        pos: usize,
        node: NodeIdx,
        right: NodeIdx,
    ) -> Result<()> {
        let (lifted, moved_child) = {
            let (keys, children) = self.arena.internal_mut(right)?;
            (keys.remove(0), children.remove(0))
        };
        let lowered = std::mem::replace(&mut self.arena.internal_mut(parent)?.0[pos], lifted);
        {
            let (keys, children) = self.arena.internal_mut(node)?;
            keys.push(lowered);
            children.push(moved_child);
        }
        self.arena.set_parent(moved_child, Some(node))?;
        self.stats.inc_internal_borrows();
        Ok(())
    }

    fn rotate_from_left(
        &mut self,
        parent: NodeIdx,
        pos: usize,
        node: NodeIdx,
        left: NodeIdx,
    ) -> Result<()> {
        let (lifted, moved_child) = {
            let (keys, children) = self.arena.internal_mut(left)?;
            let key = keys
                .pop()
                .ok_or_else(|| FolioError::format("rotation from an empty node"))?;
            let child = children
                .pop()
                .ok_or_else(|| FolioError::format("rotation from a childless node"))?;
            (key, child)
        };
        let lowered = std::mem::replace(&mut self.arena.internal_mut(parent)?.0[pos - 1], lifted);
        {
            let (keys, children) = self.arena.internal_mut(node)?;
            keys.insert(0, lowered);
            children.insert(0, moved_child);
        }
        self.arena.set_parent(moved_child, Some(node))?;
        self.stats.inc_internal_borrows();
        Ok(())
    }

    /// Folds `right` into `left`, pulling down the separator at `sep` of `parent`.
    fn merge_internal(
        &mut self,
        parent: NodeIdx,
        sep: usize,
        left: NodeIdx,
        right: NodeIdx,
    ) -> Result<()> {
        let separator = {
            let (keys, children) = self.arena.internal_mut(parent)?;
            children.remove(sep + 1);
            keys.remove(sep)
        };
        let released = self.arena.release(right)?;
        let NodeBody::Internal { keys, children } = released.body else {
            return Err(FolioError::format("merged sibling is not an interior node"));
        };
        for child in &children {
            self.arena.set_parent(*child, Some(left))?;
        }
        let (left_keys, left_children) = self.arena.internal_mut(left)?;
        left_keys.push(separator);
        left_keys.extend(keys);
        left_children.extend(children);
        self.stats.inc_internal_merges();
        Ok(())
    }

    /// Replaces a key-less root by its only child when that child is interior.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let child = {
                let (keys, children) = self.arena.internal(self.root)?;
                if !keys.is_empty() || children.len() != 1 {
                    return Ok(());
                }
                children[0]
            };
            if self.arena.leaf_page(child)?.is_some() {
                return Ok(());
            }
            let old = self.root;
            self.arena.set_parent(child, None)?;
            self.root = child;
            self.arena.release(old)?;
            self.stats.inc_root_collapses();
            debug!(target: "folio::btree", height = self.height()?, "tree shrank");
        }
    }
}
