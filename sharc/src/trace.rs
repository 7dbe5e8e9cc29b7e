//! The proof-trace graph: a DAG recording how each symbolic heap was obtained
//! from its predecessors.
//!
//! Nodes are reference-counted and hold parent links only (no child vectors),
//! so the graph can be shared freely across heaps and locations without
//! ownership cycles. Heaps cloned as plain value copies keep sharing their
//! node; heaps produced by an actual analysis step hang a fresh node under
//! the old one, optionally carrying the object-id mapping the step induced.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::{NotFoundAction, TwoWayMapper};
use crate::heap::SymHeap;
use std::collections::VecDeque;
use std::rc::Rc;

/// What kind of step a node records
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    /// The initial heap of a function
    Root,
    /// An ordinary analysis step (instruction, abstraction, concretization)
    Step(&'static str),
    /// A value copy of the parent heap; collapsible via [`waive_clone`]
    CloneOf,
}

/// One node of the trace graph
pub struct Node {
    kind: NodeKind,
    parents: Vec<Rc<Node>>,
    /// Object ids of the parent heap mapped to object ids of this heap;
    /// identity outside the recorded exceptions
    obj_map: Option<TwoWayMapper<i32>>,
}

impl Node {
    pub fn root() -> Rc<Node> {
        Rc::new(Node {
            kind: NodeKind::Root,
            parents: vec![],
            obj_map: None,
        })
    }

    /// A new step node under `parent`
    pub fn step(label: &'static str, parent: &Rc<Node>, obj_map: Option<TwoWayMapper<i32>>) -> Rc<Node> {
        Rc::new(Node {
            kind: NodeKind::Step(label),
            parents: vec![parent.clone()],
            obj_map,
        })
    }

    /// A step node joining several parents (e.g. a CFG join point)
    pub fn join(label: &'static str, parents: Vec<Rc<Node>>) -> Rc<Node> {
        Rc::new(Node {
            kind: NodeKind::Step(label),
            parents,
            obj_map: None,
        })
    }

    /// A clone node under `parent`, recording a plain value copy
    pub fn clone_of(parent: &Rc<Node>) -> Rc<Node> {
        Rc::new(Node {
            kind: NodeKind::CloneOf,
            parents: vec![parent.clone()],
            obj_map: None,
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn parents(&self) -> &[Rc<Node>] {
        &self.parents
    }

    pub fn obj_map(&self) -> Option<&TwoWayMapper<i32>> {
        self.obj_map.as_ref()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "trace::Node({:?}, {} parent(s))", self.kind, self.parents.len())
    }
}

fn key(n: &Rc<Node>) -> usize {
    Rc::as_ptr(n) as usize
}

/// Detach a clone node from a heap that turned out to be a plain value copy,
/// re-pointing the heap at the clone's parent. A no-op for any other node.
pub fn waive_clone(sh: &mut SymHeap) {
    let tr = sh.trace().clone();
    if tr.kind() == NodeKind::CloneOf {
        if let [parent] = tr.parents() {
            sh.set_trace(parent.clone());
        }
    }
}

/// Resolve the object-id mapping accumulated along the trace between the heap
/// at `src` and the heap at `dst` (an ancestor-to-descendant pair). Identity
/// outside the exceptions recorded by the steps in between; plain identity
/// when `src` is not an ancestor of `dst`.
pub fn resolve_id_mapping(src: &Rc<Node>, dst: &Rc<Node>) -> TwoWayMapper<i32> {
    let identity = || TwoWayMapper::new(NotFoundAction::MapToSelf);
    if Rc::ptr_eq(src, dst) {
        return identity();
    }

    // BFS upward from dst until src, keeping child back-links so the path can
    // be replayed top-down afterwards
    let mut back: UnorderedMap<usize, Rc<Node>> = Default::default();
    let mut seen: UnorderedSet<usize> = Default::default();
    let mut wl: VecDeque<Rc<Node>> = VecDeque::new();
    wl.push_back(dst.clone());
    seen.insert(key(dst));
    let mut found = false;
    while let Some(n) = wl.pop_front() {
        if Rc::ptr_eq(&n, src) {
            found = true;
            break;
        }
        for p in n.parents() {
            if seen.insert(key(p)) {
                back.insert(key(p), n.clone());
                wl.push_back(p.clone());
            }
        }
    }
    if !found {
        return identity();
    }

    let mut map = identity();
    let mut cur = src.clone();
    while !Rc::ptr_eq(&cur, dst) {
        let child = back
            .get(&key(&cur))
            .expect("broken back-link chain in trace walk")
            .clone();
        if let Some(m) = child.obj_map() {
            map = map.compose(m);
        }
        cur = child;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_mapping_composes_down_the_trace() {
        let root = Node::root();
        let mut m1 = TwoWayMapper::new(NotFoundAction::MapToSelf);
        m1.insert(1, 2);
        let a = Node::step("s1", &root, Some(m1));
        let mut m2 = TwoWayMapper::new(NotFoundAction::MapToSelf);
        m2.insert(2, 3);
        let b = Node::step("s2", &a, Some(m2));

        let m = resolve_id_mapping(&root, &b);
        assert_eq!(m.map_left(1), vec![3]);
        assert_eq!(m.map_left(42), vec![42]);

        // unrelated nodes resolve to identity
        let other = Node::root();
        assert_eq!(resolve_id_mapping(&other, &b).map_left(1), vec![1]);
    }
}
