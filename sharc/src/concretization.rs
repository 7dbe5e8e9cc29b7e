//! Unfolding a list segment on demand.
//!
//! Called by the executor right before it dereferences a pointer whose target
//! is abstract. The segment's meaning is preserved by a case split: a
//! possibly-empty segment contributes a clone with the segment spliced out,
//! and the segment itself is unrolled in place into one concrete head node
//! followed by the remaining (shortened) segment.

use crate::containers::{NotFoundAction, TwoWayMapper};
use crate::heap::{EngineError, ObjId, ObjKind, SymHeap};
use crate::log::*;
use crate::trace;

/// Splice the segment out of a clone of `sh` if it may be empty, pushing the
/// clone onto `out`. When the segment is proven non-empty instead, the
/// explicit proof predicate is dropped from the continuation (the unrolled
/// head will carry it implicitly).
fn splice_out_segment_if_needed(
    sh: &mut SymHeap,
    obj: ObjId,
    peer: ObjId,
    out: &mut Vec<SymHeap>,
) -> Result<(), EngineError> {
    let addr_self = sh.addr_of(obj, 0);
    let peer_seg = sh
        .seg_data(peer)
        .ok_or(EngineError::Internal("splice-out of a concrete object"))?;
    let val_next = sh.value_of_ptr(peer, peer_seg.head + peer_seg.binder.off);

    if sh.prove_eq(addr_self, val_next) == Some(true) {
        // a self loop would make the unrolling meaningless
        return Err(EngineError::Internal("segment whose next is its own address"));
    }

    let proven = sh.seg_min_len(obj) >= 1 || sh.prove_eq(addr_self, val_next) == Some(false);
    if proven {
        // the segment is guaranteed non-empty now, but the concretization
        // makes the remainder possibly empty
        sh.del_neq(addr_self, val_next);
        return Ok(());
    }

    // possibly empty: materialize the variant with the segment gone
    let mut empty = sh.clone();
    empty.set_trace(trace::Node::step("concretize-empty", sh.trace(), None));
    if obj != peer {
        // a DLS; the back end goes first, its address re-routed backwards
        let seg = empty
            .seg_data(obj)
            .ok_or(EngineError::Internal("splice-out of a concrete object"))?;
        let val_prev = empty.value_of_ptr(obj, seg.head + seg.binder.off);
        let peer_addr = empty.addr_of(peer, 0);
        empty.val_replace(peer_addr, val_prev);
        empty.destroy(peer)?;
    }
    empty.val_replace(addr_self, val_next);
    empty.destroy(obj)?;
    out.push(empty);
    Ok(())
}

/// Concretize the segment `obj` of `sh` in place, returning the additional
/// case-split variants (the possibly-empty one, when it exists). The heap
/// left in `sh` carries the unrolled non-empty continuation.
pub fn concretize(sh: &mut SymHeap, obj: ObjId) -> Result<Vec<SymHeap>, EngineError> {
    let kind = sh.kind_of(obj);
    let peer = match kind {
        ObjKind::Sls => obj,
        ObjKind::Dls => sh.peer_of(obj),
        _ => return Err(EngineError::Internal("concretization of a concrete object")),
    };
    debug!("concretizing a segment"; "obj" => obj.0, "kind" => ?kind);

    let mut out = vec![];
    splice_out_segment_if_needed(sh, obj, peer, &mut out)?;

    let orig_min = sh.seg_min_len(obj);

    // duplicate self as the remaining abstract object
    let dup = sh.obj_dup(obj)?;
    let dup_addr = sh.addr_of(dup, 0);
    if kind == ObjKind::Dls {
        // the back end's cross-link now reaches the duplicate
        let pseg = sh.seg_data(peer).unwrap();
        let psel = pseg.peer.unwrap();
        sh.write_field(peer, pseg.head + psel.off, psel.ty, dup_addr)?;
    }

    // concretize self and recover the list
    let seg = sh.seg_data(obj).unwrap();
    let next_sel = match kind {
        ObjKind::Sls => seg.binder,
        _ => seg.peer.unwrap(),
    };
    let next_off = seg.head + next_sel.off;
    sh.set_concrete(obj)?;
    sh.write_field(obj, next_off, next_sel.ty, dup_addr)?;

    if kind == ObjKind::Dls {
        // re-establish the back-link into the concrete head
        let dseg = sh.seg_data(dup).unwrap();
        let obj_addr = sh.addr_of(obj, 0);
        sh.write_field(dup, dseg.head + dseg.binder.off, dseg.binder.ty, obj_addr)?;
    }

    // the remainder stands for one node less
    sh.set_seg_min_len(dup, orig_min.saturating_sub(1));
    if kind == ObjKind::Dls {
        let dpeer = sh.peer_of(dup);
        if dpeer != dup {
            sh.set_seg_min_len(dpeer, orig_min.saturating_sub(1));
        }
    }

    let mut map = TwoWayMapper::new(NotFoundAction::MapToSelf);
    map.insert(obj.0, obj.0);
    map.insert(obj.0, dup.0);
    sh.set_trace(trace::Node::step("concretize", sh.trace(), Some(map)));

    Ok(out)
}
