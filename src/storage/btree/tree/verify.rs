use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::arena::{NodeBody, NodeIdx};
use super::BTree;
use crate::storage::key::Key;
use crate::types::{FolioError, PageNo, Result};

struct Frame {
    node: NodeIdx,
    parent: Option<NodeIdx>,
    lower: Option<Key>,
    upper: Option<Key>,
    depth: usize,
}

impl<V> BTree<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Checks the structural invariants of the tree, loading every page.
    ///
    /// Verified: page files against their recorded count and hash, uniform
    /// leaf depth, child/key counts, node fill, parent links, separator bounds
    /// and leaf ordering. The first violation is returned as a `Format` error.
    pub fn verify(&mut self) -> Result<()> {
        let min = self.min_fill();
        let root_children = self.arena.internal(self.root)?.1.len();
        let mut stack = vec![Frame {
            node: self.root,
            parent: None,
            lower: None,
            upper: None,
            depth: 0,
        }];
        let mut leaf_depth = None;
        let mut seen_pages = BTreeSet::new();

        while let Some(frame) = stack.pop() {
            let node = self.arena.node(frame.node)?;
            if node.parent != frame.parent {
                return Err(violation(format!(
                    "node {} has parent {:?}, expected {:?}",
                    frame.node, node.parent, frame.parent
                )));
            }
            match &node.body {
                NodeBody::Internal { keys, children } => {
                    if children.len() != keys.len() + 1 {
                        return Err(violation(format!(
                            "node {} has {} keys and {} children",
                            frame.node,
                            keys.len(),
                            children.len()
                        )));
                    }
                    if keys.len() > self.page_size {
                        return Err(violation(format!("node {} overflows", frame.node)));
                    }
                    if frame.node != self.root && keys.len() < min {
                        return Err(violation(format!("node {} underflows", frame.node)));
                    }
                    if keys.windows(2).any(|w| w[0] >= w[1]) {
                        return Err(violation(format!("node {} keys out of order", frame.node)));
                    }
                    for key in keys {
                        check_bounds(key, frame.lower.as_ref(), frame.upper.as_ref())?;
                    }
                    for (slot, child) in children.iter().enumerate() {
                        stack.push(Frame {
                            node: *child,
                            parent: Some(frame.node),
                            lower: if slot == 0 {
                                frame.lower.clone()
                            } else {
                                Some(keys[slot - 1].clone())
                            },
                            upper: if slot == keys.len() {
                                frame.upper.clone()
                            } else {
                                Some(keys[slot].clone())
                            },
                            depth: frame.depth + 1,
                        });
                    }
                }
                NodeBody::Leaf { page } => {
                    let page = *page;
                    match leaf_depth {
                        None => leaf_depth = Some(frame.depth),
                        Some(depth) if depth != frame.depth => {
                            return Err(violation(format!(
                                "leaf page {page} at depth {} but others at {depth}",
                                frame.depth
                            )));
                        }
                        Some(_) => {}
                    }
                    if !seen_pages.insert(page) {
                        return Err(violation(format!("page {page} linked twice")));
                    }
                    if let Some(found) = self.store.check_file(page)? {
                        return Err(violation(format!("page {page}: {found}")));
                    }
                    let sole_leaf = frame.parent == Some(self.root) && root_children == 1;
                    let leaf = self.store.load(page)?;
                    if leaf.len() > self.page_size {
                        return Err(violation(format!("page {page} overflows")));
                    }
                    if !sole_leaf && leaf.len() < min {
                        return Err(violation(format!("page {page} underflows")));
                    }
                    let keys: Vec<&Key> = leaf.keys().collect();
                    if keys.windows(2).any(|w| w[0] >= w[1]) {
                        return Err(violation(format!("page {page} keys out of order")));
                    }
                    for key in keys {
                        check_bounds(key, frame.lower.as_ref(), frame.upper.as_ref())?;
                    }
                }
            }
        }

        if seen_pages.len() != self.store.page_count() {
            return Err(violation(format!(
                "{} pages allocated but {} linked",
                self.store.page_count(),
                seen_pages.len()
            )));
        }
        Ok(())
    }

    /// Leaf pages whose files no longer match the count and hash the tree
    /// recorded for them, with what differs. Nothing is loaded.
    pub fn stale_pages(&self) -> Result<Vec<(PageNo, String)>> {
        let mut stale = Vec::new();
        for leaf in self.store.pages() {
            if let Some(found) = self.store.check_file(leaf.number())? {
                stale.push((leaf.number(), found));
            }
        }
        Ok(stale)
    }
}

fn check_bounds(key: &Key, lower: Option<&Key>, upper: Option<&Key>) -> Result<()> {
    if let Some(lower) = lower {
        if key < lower {
            return Err(violation(format!("key {key} below bound {lower}")));
        }
    }
    if let Some(upper) = upper {
        if key >= upper {
            return Err(violation(format!("key {key} not below bound {upper}")));
        }
    }
    Ok(())
}

fn violation(msg: String) -> FolioError {
    FolioError::Format(format!("tree invariant violated: {msg}"))
}
