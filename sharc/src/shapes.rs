//! Detection of container shapes: maximal list chains annotated per heap.
//!
//! A shape names an `entry` object, a logical `length` (a DLS pair counts as
//! one node) and the selector binding the chain is threaded through. Shapes
//! feed the fixed-point assembler, which relates them across trace edges.

use crate::heap::{ObjId, ObjKind, StorageClass, SymHeap, OBJ_INVALID};
use crate::storage::TypeId;

/// Selector binding of a detected chain
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ShapeBinding {
    pub head: i64,
    pub next: i64,
    pub prev: i64,
}

/// One detected container shape
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Shape {
    pub entry: ObjId,
    pub length: usize,
    pub binding: ShapeBinding,
}

/// Derive the chain binding from one segment end
fn binding_of_seg(sh: &SymHeap, o: ObjId) -> Option<(ShapeBinding, TypeId)> {
    let seg = sh.seg_data(o)?;
    let ty = sh.estimated_type(o)?;
    let binding = match (sh.kind_of(o), seg.peer) {
        (ObjKind::Sls, _) => ShapeBinding {
            head: seg.head,
            next: seg.binder.off,
            prev: seg.binder.off,
        },
        (ObjKind::Dls, Some(peer)) => {
            // the two ends carry mirrored descriptors; normalize so both
            // produce the same binding regardless of which end we asked
            let (next, prev) = if seg.binder.off < peer.off {
                (seg.binder.off, peer.off)
            } else {
                (peer.off, seg.binder.off)
            };
            ShapeBinding {
                head: seg.head,
                next,
                prev,
            }
        }
        _ => return None,
    };
    Some((binding, ty))
}

/// The DLS front end of a pair (the end whose outgoing selector differs from
/// the chain's next selector); any other object is its own representative.
fn canonical_node(sh: &SymHeap, o: ObjId, next_off: i64) -> ObjId {
    if sh.kind_of(o) != ObjKind::Dls {
        return o;
    }
    match sh.seg_data(o) {
        Some(seg) if seg.binder.off == next_off => sh.peer_of(o),
        _ => o,
    }
}

/// The logical successor of a chain node, if any
fn next_of(sh: &SymHeap, o: ObjId, next_off: i64) -> ObjId {
    let hop = if sh.kind_of(o) == ObjKind::Dls {
        // cross the pair, then leave through the back end
        sh.peer_of(o)
    } else {
        o
    };
    match sh.try_value_of_ptr(hop, next_off) {
        Some(v) => sh.points_to(v),
        None => OBJ_INVALID,
    }
}

/// Enumerate the maximal list-segment chains of one heap.
///
/// Chains are anchored at segments: every maximal walk over same-typed nodes
/// that contains at least one abstract segment yields a shape. Deterministic:
/// candidate bindings and entries are visited in arena order.
pub fn detect_local_shapes(sh: &SymHeap) -> Vec<Shape> {
    let mut bindings: Vec<(ShapeBinding, TypeId)> = vec![];
    for o in sh.gather_root_objs() {
        if let Some(bt) = binding_of_seg(sh, o) {
            if !bindings.contains(&bt) {
                bindings.push(bt);
            }
        }
    }

    let mut shapes: Vec<Shape> = vec![];
    for (binding, ty) in bindings {
        // the member set: canonical nodes of matching type
        let mut members_dedup: Vec<ObjId> = sh
            .gather_root_objs()
            .into_iter()
            .filter(|&o| sh.storage_class(o) == StorageClass::OnHeap)
            .filter(|&o| sh.estimated_type(o) == Some(ty))
            .map(|o| canonical_node(sh, o, binding.next))
            .collect();
        members_dedup.sort();
        members_dedup.dedup();

        // entries: member nodes no other member links to
        let mut has_pred: Vec<ObjId> = vec![];
        for &o in &members_dedup {
            let n = next_of(sh, o, binding.next);
            let n = canonical_node(sh, n, binding.next);
            if members_dedup.contains(&n) {
                has_pred.push(n);
            }
        }

        for &entry in &members_dedup {
            if has_pred.contains(&entry) {
                continue;
            }
            // walk the chain, counting logical nodes
            let mut len = 0usize;
            let mut any_abstract = false;
            let mut visited: Vec<ObjId> = vec![];
            let mut cur = entry;
            while members_dedup.contains(&cur) && !visited.contains(&cur) {
                visited.push(cur);
                len += 1;
                any_abstract |= sh.kind_of(cur).is_abstract();
                cur = canonical_node(sh, next_of(sh, cur, binding.next), binding.next);
            }
            if len == 0 || !any_abstract {
                continue;
            }
            let shape = Shape {
                entry,
                length: len,
                binding,
            };
            if !shapes.contains(&shape) {
                shapes.push(shape);
            }
        }
    }
    shapes
}

/// The raw object ids underlying a shape (both ends of every DLS pair)
pub fn obj_set_of_shape(sh: &SymHeap, shape: &Shape) -> Vec<i32> {
    let mut out = vec![];
    let mut cur = shape.entry;
    for _ in 0..shape.length {
        out.push(cur.0);
        if sh.kind_of(cur) == ObjKind::Dls {
            let p = sh.peer_of(cur);
            if p != cur {
                out.push(p.0);
            }
        }
        cur = canonical_node(
            sh,
            next_of(sh, cur, shape.binding.next),
            shape.binding.next,
        );
    }
    out.sort();
    out.dedup();
    out
}
