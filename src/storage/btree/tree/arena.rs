use crate::storage::key::Key;
use crate::types::{FolioError, PageNo, Result};

/// Index of a node inside the [`Arena`].
pub(crate) type NodeIdx = usize;

#[derive(Debug)]
pub(crate) enum NodeBody {
    Internal {
        keys: Vec<Key>,
        children: Vec<NodeIdx>,
    },
    Leaf {
        page: PageNo,
    },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) parent: Option<NodeIdx>,
    pub(crate) body: NodeBody,
}

impl Node {
    pub(crate) fn internal(parent: Option<NodeIdx>, keys: Vec<Key>, children: Vec<NodeIdx>) -> Self {
        Self {
            parent,
            body: NodeBody::Internal { keys, children },
        }
    }

    pub(crate) fn leaf(parent: Option<NodeIdx>, page: PageNo) -> Self {
        Self {
            parent,
            body: NodeBody::Leaf { page },
        }
    }
}

/// Slot storage for tree nodes; parents are referenced by index, never by pointer.
#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<NodeIdx>,
}

impl Arena {
    pub(crate) fn alloc(&mut self, node: Node) -> NodeIdx {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    pub(crate) fn release(&mut self, idx: NodeIdx) -> Result<Node> {
        let node = self
            .slots
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or_else(|| dangling(idx))?;
        self.free.push(idx);
        Ok(node)
    }

    pub(crate) fn node(&self, idx: NodeIdx) -> Result<&Node> {
        self.slots
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| dangling(idx))
    }

    pub(crate) fn node_mut(&mut self, idx: NodeIdx) -> Result<&mut Node> {
        self.slots
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| dangling(idx))
    }

    pub(crate) fn set_parent(&mut self, idx: NodeIdx, parent: Option<NodeIdx>) -> Result<()> {
        self.node_mut(idx)?.parent = parent;
        Ok(())
    }

    pub(crate) fn internal(&self, idx: NodeIdx) -> Result<(&Vec<Key>, &Vec<NodeIdx>)> {
        match &self.node(idx)?.body {
            NodeBody::Internal { keys, children } => Ok((keys, children)),
            NodeBody::Leaf { .. } => Err(FolioError::format(format!(
                "node {idx} is a leaf, expected interior node"
            ))),
        }
    }

    pub(crate) fn internal_mut(
        &mut self,
        idx: NodeIdx,
    ) -> Result<(&mut Vec<Key>, &mut Vec<NodeIdx>)> {
        match &mut self.node_mut(idx)?.body {
            NodeBody::Internal { keys, children } => Ok((keys, children)),
            NodeBody::Leaf { .. } => Err(FolioError::format(format!(
                "node {idx} is a leaf, expected interior node"
            ))),
        }
    }

    pub(crate) fn leaf_page(&self, idx: NodeIdx) -> Result<Option<PageNo>> {
        match &self.node(idx)?.body {
            NodeBody::Leaf { page } => Ok(Some(*page)),
            NodeBody::Internal { .. } => Ok(None),
        }
    }

    /// Position of `child` among the children of `parent`.
    pub(crate) fn child_position(&self, parent: NodeIdx, child: NodeIdx) -> Result<usize> {
        let (_, children) = self.internal(parent)?;
        children
            .iter()
            .position(|c| *c == child)
            .ok_or_else(|| FolioError::format(format!("node {child} missing from parent {parent}")))
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

fn dangling(idx: NodeIdx) -> FolioError {
    FolioError::format(format!("dangling tree node {idx}"))
}
