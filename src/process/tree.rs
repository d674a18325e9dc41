//! The process tree, rooted at init (PID 1). Modeled as an arena of
//! nodes addressed by index rather than parent/child `Rc` pointers, per
//! spec §9's note to avoid ownership cycles.

use alloc::vec::Vec;

use crate::process::Pid;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeId(pub usize);

struct Node {
    pid: Pid,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed tree of process nodes. Node slots are never reused
/// mid-lifetime (tree entries are reclaimed by the reaper alongside the
/// rest of the descriptor), so `NodeId`s stay valid as long as the
/// owning process is in the table.
pub struct ProcessTree {
    nodes: Vec<Option<Node>>,
    root: Option<NodeId>,
}

impl ProcessTree {
    pub fn new() -> Self {
        ProcessTree {
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Insert the root (init, PID 1) with no parent.
    pub fn insert_root(&mut self, pid: Pid) -> NodeId {
        let id = self.push(Node {
            pid,
            parent: None,
            children: Vec::new(),
        });
        self.root = Some(id);
        id
    }

    /// Attach a new child under `parent`.
    pub fn insert_child(&mut self, pid: Pid, parent: NodeId) -> NodeId {
        let id = self.push(Node {
            pid,
            parent: Some(parent),
            children: Vec::new(),
        });
        if let Some(p) = self.node_mut(parent) {
            p.children.push(id);
        }
        id
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(Some(node));
        NodeId(self.nodes.len() - 1)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub fn parent_of(&self, id: NodeId) -> Option<Pid> {
        self.node(id)
            .and_then(|n| n.parent)
            .and_then(|p| self.node(p))
            .map(|p| p.pid)
    }

    pub fn children_of(&self, id: NodeId) -> Vec<Pid> {
        self.node(id)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| self.node(*c).map(|c| c.pid))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn first_child(&self, id: NodeId) -> Option<Pid> {
        self.node(id)
            .and_then(|n| n.children.first())
            .and_then(|c| self.node(*c))
            .map(|c| c.pid)
    }

    /// Remove a node from the tree entirely (called by the reaper).
    /// Re-parents its children onto its own parent, matching init
    /// inheriting orphans in classic Unix semantics.
    pub fn remove(&mut self, id: NodeId) {
        let (parent, children) = match self.node(id) {
            Some(n) => (n.parent, n.children.clone()),
            None => return,
        };
        if let Some(parent_id) = parent {
            if let Some(p) = self.node_mut(parent_id) {
                p.children.retain(|c| *c != id);
                p.children.extend(children.iter().copied());
            }
        }
        for child in children {
            if let Some(c) = self.node_mut(child) {
                c.parent = parent;
            }
        }
        self.nodes[id.0] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_inherits_parent_group_relationship() {
        let mut tree = ProcessTree::new();
        let root = tree.insert_root(1);
        let child = tree.insert_child(2, root);
        assert_eq!(tree.parent_of(child), Some(1));
        assert_eq!(tree.children_of(root), alloc::vec![2]);
        assert_eq!(tree.first_child(root), Some(2));
    }

    #[test]
    fn remove_reparents_children_to_grandparent() {
        let mut tree = ProcessTree::new();
        let root = tree.insert_root(1);
        let mid = tree.insert_child(2, root);
        let leaf = tree.insert_child(3, mid);
        tree.remove(mid);
        assert_eq!(tree.parent_of(leaf), Some(1));
        assert_eq!(tree.children_of(root), alloc::vec![3]);
    }
}
