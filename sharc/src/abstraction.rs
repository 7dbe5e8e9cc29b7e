//! Folding concrete list prefixes/suffixes into SLS/DLS segments.
//!
//! The join operator of the analysis: given a heap, find the longest chain of
//! objects linked through a fixed selector tuple, check it against the
//! per-kind trigger threshold, and collapse the eligible middle portion into
//! a single segment, replacing field values that differ across the chain by
//! fresh unknowns so no concrete model is lost.

use crate::config::CONFIG;
use crate::containers::{NotFoundAction, TwoWayMapper};
use crate::heap::{
    EngineError, ObjId, ObjKind, SegData, Selector, StorageClass, SymHeap, UnknownOrigin, ValId,
    OBJ_INVALID, VAL_INVALID,
};
use crate::log::*;
use crate::storage::{Storage, TypeId, TypeKind};
use crate::trace;
use itertools::Itertools;

/// Common configuration template for abstraction triggering
struct AbstractionThreshold {
    spare_prefix: usize,
    inner_seg_len: usize,
    spare_suffix: usize,
}

/// Abstraction trigger threshold for SLS
static SLS_THRESHOLD: AbstractionThreshold = AbstractionThreshold {
    spare_prefix: 1,
    inner_seg_len: 1,
    spare_suffix: 0,
};

/// Abstraction trigger threshold for DLS
static DLS_THRESHOLD: AbstractionThreshold = AbstractionThreshold {
    spare_prefix: 0,
    inner_seg_len: 1,
    spare_suffix: 1,
};

/// A candidate "next"/"prev" selector, remembered together with the item
/// index chain that reached it (the chain gives the deterministic
/// lexicographic tie-break order).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SelectorChain {
    pub ic: Vec<usize>,
    pub sel: Selector,
}

/// Flatten the leaf (non-struct) items of `ty`, pre-order over nested
/// structs, with absolute offsets.
fn flatten_leaves(
    stor: &Storage,
    ty: TypeId,
    base: i64,
    ic: &mut Vec<usize>,
    out: &mut Vec<(Vec<usize>, i64, TypeId)>,
) {
    for (i, item) in stor.type_of(ty).items.iter().enumerate() {
        ic.push(i);
        let off = base + item.off;
        if stor.type_of(item.ty).kind == TypeKind::Struct {
            flatten_leaves(stor, item.ty, off, ic, out);
        } else {
            out.push((ic.clone(), off, item.ty));
        }
        ic.pop();
    }
}

/// Whether any live pointer targets a non-zero offset inside `o`; such an
/// object cannot be folded without breaking the segment's opacity.
fn does_anyone_point_inside(sh: &SymHeap, o: ObjId) -> bool {
    sh.interned_addrs_of(o)
        .into_iter()
        .any(|(off, v)| off != 0 && sh.used_by_count(v) > 0)
}

/// Test one pointer field of `obj` as a candidate "next" selector for a
/// segment of the given arity (1 for SLS, 2 for DLS).
fn probe_field(sh: &SymHeap, obj: ObjId, off: i64, arity: u32) -> bool {
    let addr = match sh.try_addr_of(obj, 0) {
        Some(a) => a,
        None => return false,
    };
    let v = match sh.try_value_of_ptr(obj, off) {
        Some(v) => v,
        None => return false,
    };
    if v.0 <= 0 || v == addr {
        return false;
    }
    let tgt = sh.points_to(v);
    if tgt == OBJ_INVALID || !sh.valid(tgt) {
        return false;
    }
    // only same-typed heap objects can be chained
    if sh.estimated_type(tgt).is_none() || sh.estimated_type(tgt) != sh.estimated_type(obj) {
        return false;
    }
    if sh.storage_class(tgt) != StorageClass::OnHeap || sh.prog_var_of(tgt).is_some() {
        return false;
    }
    if sh.used_by_count(v) != arity {
        return false;
    }
    !does_anyone_point_inside(sh, tgt)
}

/// Gather all candidate selector chains of `obj` for the given arity
fn dig_list_selectors(sh: &SymHeap, obj: ObjId, arity: u32) -> Vec<SelectorChain> {
    let ty = match sh.estimated_type(obj) {
        Some(ty) => ty,
        None => return vec![],
    };
    let stor = sh.stor();
    if stor.type_of(ty).kind != TypeKind::Struct {
        return vec![];
    }
    let mut leaves = vec![];
    flatten_leaves(stor, ty, 0, &mut vec![], &mut leaves);
    leaves
        .into_iter()
        .filter(|(_, _, ity)| stor.type_of(*ity).kind == TypeKind::Ptr)
        .filter(|(_, off, _)| probe_field(sh, obj, *off, arity))
        .map(|(ic, off, ity)| SelectorChain {
            ic,
            sel: Selector { off, ty: ity },
        })
        .collect()
}

/// Whether `obj` is a plausible segment entry at all
fn probe(sh: &SymHeap, obj: ObjId, arity: u32) -> bool {
    if does_anyone_point_inside(sh, obj) {
        return false;
    }
    !dig_list_selectors(sh, obj, arity).is_empty()
}

/// Follow `next` from `entry`, counting how many nodes could be folded.
///
/// A set of visited objects bounds the walk on cyclic structures. An already
/// existing DLS on the path is jumped through via its peer and counted as one
/// node; a path containing any DLS is accepted only when it starts at one.
fn discover_seg(
    sh: &SymHeap,
    entry: ObjId,
    arity: u32,
    next: Selector,
    prev: Option<Selector>,
) -> usize {
    let mut path: Vec<i32> = vec![];
    let mut dls_on_path = 0usize;
    let mut obj = entry;
    loop {
        if path.contains(&obj.0) {
            break;
        }
        path.push(obj.0);

        match sh.kind_of(obj) {
            ObjKind::Dls => {
                if prev.is_none() {
                    // an SLS probe ran into a DLS; wait for the DLS pass
                    break;
                }
                let seg = sh.seg_data(obj).expect("DLS without segment data");
                let peer_sel = seg.peer.expect("DLS without a peer selector");
                let prev_off = prev.unwrap().off;
                if peer_sel.off != next.off && peer_sel.off != prev_off {
                    // completely incompatible DLS, it gives us no go
                    break;
                }
                let p = sh.peer_of(obj);
                if p == obj || path.contains(&p.0) {
                    // we came from the wrong side this time
                    break;
                }
                path.push(p.0);
                dls_on_path += 1;
                obj = p;
            }
            ObjKind::Sls => {
                let seg = sh.seg_data(obj).expect("SLS without segment data");
                if seg.binder.off != next.off {
                    break;
                }
            }
            ObjKind::Region => {}
            _ => break,
        }

        if !probe_field(sh, obj, next.off, arity) {
            // we can't go further
            break;
        }
        let v = sh.try_value_of_ptr(obj, next.off).unwrap();
        let nxt = sh.points_to(v);
        if !sh.valid(nxt) {
            break;
        }
        if let Some(prev) = prev {
            // verify the back-link at every step
            let self_addr = sh.try_addr_of(obj, 0);
            let back = sh.try_value_of_ptr(nxt, prev.off);
            if self_addr.is_none() || back != self_addr {
                break;
            }
        }
        obj = nxt;
    }

    if dls_on_path > 0 && sh.kind_of(entry) != ObjKind::Dls {
        return 0;
    }

    // the chain length in linkable objects; each DLS pair occupies two path
    // slots but counts as one
    path.len() - dls_on_path
}

/// The best `(length, next, prev)` tuple over all selector pairs of one entry
fn discover_best(
    sh: &SymHeap,
    obj: ObjId,
    kind: ObjKind,
    chains: &[SelectorChain],
) -> Option<(usize, Selector, Option<Selector>)> {
    match kind {
        ObjKind::Sls => {
            let mut best: Option<(usize, Selector)> = None;
            for c in chains {
                let len = discover_seg(sh, obj, 1, c.sel, None);
                if len > 1 {
                    trace!("found an SLS candidate"; "len" => len, "off" => c.sel.off);
                }
                if len > best.map(|(l, _)| l).unwrap_or(0) {
                    best = Some((len, c.sel));
                }
            }
            best.map(|(len, next)| (len, next, None))
        }
        ObjKind::Dls => {
            if chains.len() < 2 {
                trace!("not enough selectors for a DLS");
                return None;
            }
            let mut best: Option<(usize, Selector, Selector)> = None;
            for (ni, pi) in (0..chains.len()).cartesian_product(0..chains.len()) {
                if ni == pi {
                    // a DLS demands two distinct selectors
                    continue;
                }
                let len = discover_seg(sh, obj, 2, chains[ni].sel, Some(chains[pi].sel));
                if len > 0 {
                    trace!("found a DLS candidate"; "len" => len, "next" => chains[ni].sel.off, "prev" => chains[pi].sel.off);
                }
                if len > best.map(|(l, _, _)| l).unwrap_or(0) {
                    best = Some((len, chains[ni].sel, chains[pi].sel));
                }
            }
            best.map(|(len, next, prev)| (len, next, Some(prev)))
        }
        _ => None,
    }
}

/// The object one `next` hop away from `obj`
fn next_obj(sh: &SymHeap, obj: ObjId, next_off: i64) -> Result<ObjId, EngineError> {
    let v = sh
        .try_value_of_ptr(obj, next_off)
        .ok_or(EngineError::Internal("chain walk over a missing next field"))?;
    let nxt = sh.points_to(v);
    if !sh.valid(nxt) {
        return Err(EngineError::Internal("chain walk into an invalid object"));
    }
    Ok(nxt)
}

/// For each sub-field of `src` and `dst` in parallel, replace values that are
/// not provably equal by a fresh unknown in `dst`. The segment's binder and
/// peer pointers are preserved across the sweep.
fn abstract_non_matching_values(
    sh: &mut SymHeap,
    src: ObjId,
    dst: ObjId,
) -> Result<(), EngineError> {
    let seg = sh
        .seg_data(dst)
        .ok_or(EngineError::Internal("value abstraction into a concrete object"))?;

    // the binder and peer pointers must survive the sweep
    let bind_off = seg.head + seg.binder.off;
    let bind_val = sh.value_of_ptr(dst, bind_off);
    let peer = seg.peer.map(|p| (seg.head + p.off, p.ty));
    let peer_val = peer.map(|(off, _)| sh.value_of_ptr(dst, off));

    let ty = sh
        .estimated_type(dst)
        .ok_or(EngineError::Internal("segment without an estimated type"))?;
    let stor = sh.stor().clone();
    let mut leaves = vec![];
    flatten_leaves(&stor, ty, 0, &mut vec![], &mut leaves);

    for (_, off, ity) in leaves {
        let is_ptr = stor.type_of(ity).kind == TypeKind::Ptr;
        let (vs, vd) = if is_ptr {
            (sh.try_value_of_ptr(src, off), sh.try_value_of_ptr(dst, off))
        } else {
            (
                sh.try_read_field(src, off, ity),
                sh.try_read_field(dst, off, ity),
            )
        };
        let equal = match (vs, vd) {
            (None, None) => true,
            (Some(a), Some(b)) => sh.prove_eq(a, b) == Some(true),
            _ => false,
        };
        if equal {
            continue;
        }
        // a placeholder covering both possibilities
        let u = sh.create_unknown(UnknownOrigin::Unknown);
        sh.write_field(dst, off, ity, u)?;
    }

    // now restore the possibly smashed binder and peer
    sh.write_field(dst, bind_off, seg.binder.ty, bind_val)?;
    if let (Some((off, pty)), Some(pv)) = (peer, peer_val) {
        sh.write_field(dst, off, pty, pv)?;
    }
    Ok(())
}

/// Make sure `obj` is an SLS bound through `next`; a concrete object is
/// transitioned and its non-emptiness recorded as an address-vs-next neq.
/// Returns whether the heap changed.
fn ensure_sls(sh: &mut SymHeap, obj: ObjId, next: Selector) -> Result<bool, EngineError> {
    match sh.kind_of(obj) {
        ObjKind::Sls => {
            let seg = sh.seg_data(obj).unwrap();
            if seg.binder.off == next.off {
                return Ok(false);
            }
            Err(EngineError::Internal("SLS binder mismatch"))
        }
        ObjKind::Region => {
            sh.abstract_as_seg(
                obj,
                ObjKind::Sls,
                SegData {
                    head: 0,
                    binder: next,
                    peer: None,
                    min_len: 1,
                },
            )?;
            let addr = sh.addr_of(obj, 0);
            let nv = sh.seg_next_value(obj);
            if addr == VAL_INVALID || nv == VAL_INVALID {
                return Err(EngineError::Internal("SLS without address or next value"));
            }
            sh.add_neq(addr, nv)?;
            Ok(true)
        }
        _ => Err(EngineError::Internal("SLS chain ran into a foreign segment")),
    }
}

/// One SLS abstraction step: fold `*cur` into its successor segment
fn sls_abstraction_step(
    sh: &mut SymHeap,
    cur: &mut ObjId,
    next: Selector,
    obj_map: &mut TwoWayMapper<i32>,
) -> Result<(), EngineError> {
    let v = sh.value_of_ptr(*cur, next.off);
    if v.0 <= 0 || sh.used_by_count(v) != 1 {
        // this looks like a discovery failure
        return Err(EngineError::Internal("SLS step over a shared next value"));
    }
    let nxt = sh.points_to(v);
    if !sh.valid(nxt) {
        return Err(EngineError::Internal("SLS step into an invalid object"));
    }
    ensure_sls(sh, nxt, next)?;
    abstract_non_matching_values(sh, *cur, nxt)?;
    obj_map.insert(cur.0, nxt.0);
    sh.obj_replace(*cur, nxt)?;
    *cur = nxt;
    Ok(())
}

/// Record the cross-neq making a DLS non-empty: the value stored before the
/// segment differs from the value stored after it. Skipped (with the
/// min-length still carrying the proof) when the two provably coincide.
fn dls_store_cross_neq(sh: &mut SymHeap, front: ObjId, back: ObjId) -> Result<(), EngineError> {
    let fseg = sh.seg_data(front).unwrap();
    let bseg = sh.seg_data(back).unwrap();
    let val_prev = sh.value_of_ptr(front, fseg.head + fseg.binder.off);
    let val_next = sh.value_of_ptr(back, bseg.head + bseg.binder.off);
    match sh.add_neq(val_prev, val_next) {
        Ok(()) => Ok(()),
        Err(EngineError::Contradiction) => {
            // both ends lead to the same value (e.g. a null-terminated
            // standalone list); the min-length keeps the non-emptiness proof
            debug!("cross-neq collapsed, keeping min-length only");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Turn two adjacent concrete objects into a fresh DLS pair
fn dls_create(
    sh: &mut SymHeap,
    o1: ObjId,
    o2: ObjId,
    next: Selector,
    prev: Selector,
) -> Result<(), EngineError> {
    sh.abstract_as_seg(
        o1,
        ObjKind::Dls,
        SegData {
            head: 0,
            binder: prev,
            peer: Some(next),
            min_len: 1,
        },
    )?;
    sh.abstract_as_seg(
        o2,
        ObjKind::Dls,
        SegData {
            head: 0,
            binder: next,
            peer: Some(prev),
            min_len: 1,
        },
    )?;
    abstract_non_matching_values(sh, o1, o2)?;
    abstract_non_matching_values(sh, o2, o1)?;
    // a just created DLS is said to be non-empty
    dls_store_cross_neq(sh, o1, o2)
}

/// Fold the concrete `var` into the DLS whose front end is `dls`; forward
/// gobbles the node after the back end, backward the node before the front.
fn dls_gobble(
    sh: &mut SymHeap,
    dls: ObjId,
    var: ObjId,
    backward: bool,
    obj_map: &mut TwoWayMapper<i32>,
) -> Result<(), EngineError> {
    if sh.kind_of(dls) != ObjKind::Dls || sh.kind_of(var) != ObjKind::Region {
        return Err(EngineError::Internal("gobble over mismatched kinds"));
    }
    let end = if backward { dls } else { sh.peer_of(dls) };
    abstract_non_matching_values(sh, var, end)?;

    // the outgoing pointer of the consumed node becomes the segment's own
    let seg = sh.seg_data(end).unwrap();
    let bind_off = seg.head + seg.binder.off;
    let v = sh.value_of_ptr(var, bind_off);
    sh.write_field(end, bind_off, seg.binder.ty, v)?;

    obj_map.insert(var.0, end.0);
    sh.obj_replace(var, end)
}

/// Merge two adjacent DLS into one.
///
/// Disequalities naming the vanishing pair cannot be carried over reliably,
/// so every predicate touching its addresses or outgoing values is dropped
/// and the surviving segment's cross-neq is re-established from its
/// min-length.
fn dls_merge(
    sh: &mut SymHeap,
    seg1: ObjId,
    seg2: ObjId,
    obj_map: &mut TwoWayMapper<i32>,
) -> Result<ObjId, EngineError> {
    let p1 = sh.peer_of(seg1);
    let p2 = sh.peer_of(seg2);
    let m1 = sh.seg_min_len(seg1);
    let m2 = sh.seg_min_len(seg2);

    // the merged segment keeps the first segment's backward pointer
    let fseg = sh.seg_data(seg1).unwrap();
    let val_prev = sh.value_of_ptr(seg1, fseg.head + fseg.binder.off);

    abstract_non_matching_values(sh, seg1, seg2)?;
    abstract_non_matching_values(sh, seg2, seg1)?;
    abstract_non_matching_values(sh, p1, p2)?;
    abstract_non_matching_values(sh, p2, p1)?;

    for o in [seg1, p1] {
        let mut doomed: Vec<ValId> = vec![];
        if let Some(addr) = sh.try_addr_of(o, 0) {
            doomed.push(addr);
        }
        if let Some(seg) = sh.seg_data(o) {
            if let Some(v) = sh.try_value_of_ptr(o, seg.head + seg.binder.off) {
                doomed.push(v);
            }
        }
        for v in doomed {
            for r in sh.gather_related_values(v) {
                sh.del_neq(v, r);
            }
        }
    }

    obj_map.insert(seg1.0, seg2.0);
    obj_map.insert(p1.0, p2.0);
    sh.obj_replace(seg1, seg2)?;
    sh.obj_replace(p1, p2)?;

    let sseg = sh.seg_data(seg2).unwrap();
    sh.write_field(seg2, sseg.head + sseg.binder.off, sseg.binder.ty, val_prev)?;

    let min = m1.max(m2);
    sh.set_seg_min_len(seg2, min);
    sh.set_seg_min_len(p2, min);
    if min >= 1 {
        dls_store_cross_neq(sh, seg2, p2)?;
    }
    Ok(seg2)
}

/// One DLS abstraction step, dispatching over the kinds of the two
/// neighbours under the cursor.
fn dls_abstraction_step(
    sh: &mut SymHeap,
    cur: &mut ObjId,
    next: Selector,
    prev: Selector,
    obj_map: &mut TwoWayMapper<i32>,
) -> Result<(), EngineError> {
    let o1 = *cur;
    match sh.kind_of(o1) {
        ObjKind::Dls => {
            let back = sh.peer_of(o1);
            let o2 = next_obj(sh, back, next.off)?;
            match sh.kind_of(o2) {
                ObjKind::Region => dls_gobble(sh, o1, o2, /* backward */ false, obj_map),
                ObjKind::Dls => {
                    *cur = dls_merge(sh, o1, o2, obj_map)?;
                    Ok(())
                }
                _ => Err(EngineError::Internal("DLS step into a foreign segment")),
            }
        }
        ObjKind::Region => {
            let o2 = next_obj(sh, o1, next.off)?;
            match sh.kind_of(o2) {
                ObjKind::Region => dls_create(sh, o1, o2, next, prev),
                ObjKind::Dls => {
                    dls_gobble(sh, o2, o1, /* backward */ true, obj_map)?;
                    *cur = o2;
                    Ok(())
                }
                _ => Err(EngineError::Internal("DLS step into a foreign segment")),
            }
        }
        _ => Err(EngineError::Internal("DLS step from a foreign segment")),
    }
}

/// Check the threshold and, if passed, run the per-step folding over the
/// eligible middle of the chain. Returns whether the heap changed.
fn consider_seg_abstraction(
    sh: &mut SymHeap,
    entry: ObjId,
    kind: ObjKind,
    next: Selector,
    prev: Option<Selector>,
    len_total: usize,
    obj_map: &mut TwoWayMapper<i32>,
) -> Result<bool, EngineError> {
    let at = match kind {
        ObjKind::Sls => &SLS_THRESHOLD,
        ObjKind::Dls => &DLS_THRESHOLD,
        _ => return Err(EngineError::Internal("threshold for a non-segment kind")),
    };
    let threshold = at.spare_prefix + at.inner_seg_len + at.spare_suffix;
    if len_total < threshold {
        debug!("longest chain is under the threshold";
               "len" => len_total, "threshold" => threshold);
        return Ok(false);
    }

    // the abstracted portion covers everything between the spare prefix and
    // the spare suffix
    let portion = len_total - at.spare_prefix - at.spare_suffix;
    let mut obj = entry;
    for _ in 0..at.spare_prefix {
        obj = next_obj(sh, obj, next.off)?;
    }

    match kind {
        ObjKind::Sls => {
            if portion == 1 {
                // nothing to merge; a single node transitions in place
                let changed = ensure_sls(sh, obj, next)?;
                if changed {
                    debug!("successfully abstracted an SLS");
                }
                return Ok(changed);
            }
            for _ in 0..portion - 1 {
                sls_abstraction_step(sh, &mut obj, next, obj_map)?;
            }
            debug!("successfully abstracted an SLS");
        }
        ObjKind::Dls => {
            if portion == 1 {
                // the two-ended representation cannot summarize a lone node
                debug!("DLS portion too short for the pair representation");
                return Ok(false);
            }
            let prev = prev.expect("DLS abstraction without a prev selector");
            for _ in 0..portion - 1 {
                dls_abstraction_step(sh, &mut obj, next, prev, obj_map)?;
            }
            debug!("successfully abstracted a DLS");
        }
        _ => unreachable!(),
    }
    Ok(true)
}

/// Pick the best entry/selector combination among `entries` and abstract it
fn consider_abstraction(
    sh: &mut SymHeap,
    kind: ObjKind,
    entries: &[ObjId],
    obj_map: &mut TwoWayMapper<i32>,
) -> Result<bool, EngineError> {
    let arity = match kind {
        ObjKind::Sls => 1,
        ObjKind::Dls => 2,
        _ => return Err(EngineError::Internal("abstraction of a non-segment kind")),
    };

    let mut best: Option<(usize, ObjId, Selector, Option<Selector>)> = None;
    for &obj in entries {
        let chains = dig_list_selectors(sh, obj, arity);
        if chains.is_empty() {
            continue;
        }
        if let Some((len, next, prev)) = discover_best(sh, obj, kind, &chains) {
            // ties break towards the earlier entry and the lexicographically
            // smaller selector chain, both of which come first here
            if len > best.map(|(l, _, _, _)| l).unwrap_or(0) {
                best = Some((len, obj, next, prev));
            }
        }
    }

    match best {
        Some((len, entry, next, prev)) => {
            consider_seg_abstraction(sh, entry, kind, next, prev, len, obj_map)
        }
        None => Ok(false),
    }
}

/// One round of entry discovery and folding; returns whether anything changed
fn abstract_if_needed_loop(
    sh: &mut SymHeap,
    obj_map: &mut TwoWayMapper<i32>,
) -> Result<bool, EngineError> {
    let mut sls_entries = vec![];
    let mut dls_entries = vec![];

    for obj in sh.gather_root_objs() {
        if sh.prog_var_of(obj).is_some() || sh.storage_class(obj) != StorageClass::OnHeap {
            // a list segment through non-heap objects makes no sense
            continue;
        }
        let addr = match sh.try_addr_of(obj, 0) {
            Some(a) => a,
            None => continue,
        };
        match sh.used_by_count(addr) {
            0 => {
                warn!("abstraction pass encountered an unused root"; "obj" => obj.0);
            }
            1 => {
                if CONFIG.enable_sls_abstraction && probe(sh, obj, 1) {
                    sls_entries.push(obj);
                }
            }
            2 => {
                if CONFIG.enable_dls_abstraction && probe(sh, obj, 2) {
                    dls_entries.push(obj);
                }
            }
            _ => {}
        }
    }

    if !sls_entries.is_empty() && consider_abstraction(sh, ObjKind::Sls, &sls_entries, obj_map)? {
        return Ok(true);
    }
    if !dls_entries.is_empty() && consider_abstraction(sh, ObjKind::Dls, &dls_entries, obj_map)? {
        return Ok(true);
    }
    Ok(false)
}

/// Fold list segments until no candidate passes its threshold. The heap's
/// trace gets one step node recording the folded object ids.
pub fn abstract_if_needed(sh: &mut SymHeap) -> Result<(), EngineError> {
    let mut obj_map = TwoWayMapper::new(NotFoundAction::MapToSelf);
    let mut changed = false;
    while abstract_if_needed_loop(sh, &mut obj_map)? {
        changed = true;
        if CONFIG.self_check {
            self_check(sh)?;
        }
    }
    if changed {
        let node = trace::Node::step("abstract", sh.trace(), Some(obj_map));
        sh.set_trace(node);
    }
    Ok(())
}

/// Cheap structural re-validation, run only when configured
fn self_check(sh: &SymHeap) -> Result<(), EngineError> {
    for o in sh.gather_root_objs() {
        match sh.kind_of(o) {
            ObjKind::Sls | ObjKind::Dls => {
                if sh.seg_data(o).is_none() {
                    return Err(EngineError::Internal("segment without binding data"));
                }
            }
            _ => {}
        }
        for (_, v) in sh.live_fields(o) {
            if v == VAL_INVALID {
                return Err(EngineError::Internal("live field holding VAL_INVALID"));
            }
            if v.0 > 0 && sh.used_by_count(v) == 0 {
                return Err(EngineError::Internal("usage count out of sync"));
            }
        }
    }
    Ok(())
}
