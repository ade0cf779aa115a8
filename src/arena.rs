//! Index arena holding every node of one document.
//!
//! Parent, child and sibling relations are stored as indices into the arena,
//! so relinking a node is a constant-time update of a few fields.
use crate::{
    error::{XmlErrorKind, XmlResult, bail},
    node::{Expansion, NodeKind},
};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ARENA: AtomicU32 = AtomicU32::new(1);

/// A handle to a node in a [`Document`](crate::Document).
///
/// Handles are stamped with the document that created them; using one on
/// another document is rejected with a `ForeignNode` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    arena: u32,
    index: usize,
}
impl NodeId {
    /// Position of the node in its document's arena.
    #[must_use]
    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NodeData {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    pub first_child: Option<NodeId>,
    pub last_child: Option<NodeId>,
    pub expansion: Expansion,
}

#[derive(Debug)]
pub(crate) struct Arena {
    id: u32,
    nodes: Vec<NodeData>,
}
impl Arena {
    pub fn new() -> Self {
        Self {
            id: NEXT_ARENA.fetch_add(1, Ordering::Relaxed),
            nodes: vec![],
        }
    }

    /// Adds a detached node to the arena.
    pub fn alloc(&mut self, kind: NodeKind, expansion: Expansion) -> NodeId {
        let index = self.nodes.len();
        self.nodes.push(NodeData {
            kind,
            parent: None,
            prev: None,
            next: None,
            first_child: None,
            last_child: None,
            expansion,
        });
        NodeId {
            arena: self.id,
            index,
        }
    }

    /// Validates that the handle belongs to this arena.
    pub fn check(&self, id: NodeId) -> XmlResult<NodeId> {
        if id.arena != self.id || id.index() >= self.nodes.len() {
            bail!(XmlErrorKind::ForeignNode(format!(
                "node {} belongs to another document",
                id.index
            )));
        }
        Ok(id)
    }

    /// Access a node. The handle must have been checked or created by this arena.
    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn expansion(&self, id: NodeId) -> Expansion {
        self.node(id).expansion
    }

    pub fn set_expansion(&mut self, id: NodeId, expansion: Expansion) {
        self.node_mut(id).expansion = expansion;
    }

    /// Marks a container as modified, so it can no longer be streamed untouched.
    pub fn touch(&mut self, id: NodeId) {
        if self.expansion(id) == Expansion::Untouched {
            self.set_expansion(id, Expansion::PartiallyExpanded);
        }
    }

    /// Returns true if `ancestor` is `node` or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.node(id).parent;
        }
        false
    }

    /// Links a detached node as the last child of `parent`.
    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        let last = self.node(parent).last_child;
        {
            let node = self.node_mut(child);
            node.parent = Some(parent);
            node.prev = last;
            node.next = None;
        }

        match last {
            Some(last) => self.node_mut(last).next = Some(child),
            None => self.node_mut(parent).first_child = Some(child),
        }
        self.node_mut(parent).last_child = Some(child);
    }

    /// Links a detached node immediately before `reference`, which must have a parent.
    pub fn insert_before(&mut self, reference: NodeId, child: NodeId) {
        let Some(parent) = self.node(reference).parent else {
            return;
        };
        let prev = self.node(reference).prev;
        {
            let node = self.node_mut(child);
            node.parent = Some(parent);
            node.prev = prev;
            node.next = Some(reference);
        }

        self.node_mut(reference).prev = Some(child);
        match prev {
            Some(prev) => self.node_mut(prev).next = Some(child),
            None => self.node_mut(parent).first_child = Some(child),
        }
    }

    /// Unlinks a node from its parent and siblings. No-op for detached nodes.
    pub fn unlink(&mut self, id: NodeId) {
        let (parent, prev, next) = {
            let node = self.node(id);
            (node.parent, node.prev, node.next)
        };
        let Some(parent) = parent else {
            return;
        };

        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.node_mut(parent).first_child = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.node_mut(parent).last_child = prev,
        }

        let node = self.node_mut(id);
        node.parent = None;
        node.prev = None;
        node.next = None;
    }
}
