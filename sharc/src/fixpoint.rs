//! The fixed-point assembler: once a function's per-instruction heap sets
//! have stabilized, lay them out as a global graph of locations, thread trace
//! edges between related heaps, and relate the container shapes living on
//! either side of every edge.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::{NotFoundAction, TwoWayMapper};
use crate::heap::{ObjId, SymHeap, VAL_NULL};
use crate::log::*;
use crate::shapes::{detect_local_shapes, obj_set_of_shape, Shape};
use crate::state::{StateByInsn, SymHeapUnion};
use crate::storage::{InsnCode, Storage};
use crate::trace;
use std::collections::VecDeque;
use std::rc::Rc;

/// `(location index, heap index)` addressing one heap of the global state
pub type HeapIdent = (usize, usize);

/// A control-flow edge between two locations
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CfgEdge {
    pub target_loc: usize,
    /// Tagged by the front-end on edges that close a natural loop
    pub closes_loop: bool,
}

/// A trace edge: the destination heap was derived from the source heap
pub struct TraceEdge {
    pub src: HeapIdent,
    pub dst: HeapIdent,
    /// Source object ids related to destination object ids
    pub obj_map: TwoWayMapper<i32>,
    /// Source shape indexes related to destination shape indexes
    pub shape_map: TwoWayMapper<usize>,
}

/// Everything the assembler knows about one location (one instruction)
pub struct LocalState {
    /// Index of the instruction in [`Storage::instructions`]
    pub insn: usize,
    pub heap_list: SymHeapUnion,
    pub cfg_in_edges: Vec<CfgEdge>,
    pub cfg_out_edges: Vec<CfgEdge>,
    /// Per heap: indexes into [`GlobalState::edges`]
    pub trace_in_edges: Vec<Vec<usize>>,
    pub trace_out_edges: Vec<Vec<usize>>,
    /// Per heap: the container shapes detected on it
    pub shape_lists: Vec<Vec<Shape>>,
}

/// The assembled result for one function
pub struct GlobalState {
    pub locs: Vec<LocalState>,
    pub edges: Vec<TraceEdge>,
}

impl GlobalState {
    pub fn heap_by_ident(&self, ident: HeapIdent) -> &SymHeap {
        &self.locs[ident.0].heap_list[ident.1]
    }

    pub fn shape_by_ident(&self, ident: (HeapIdent, usize)) -> &Shape {
        &self.locs[ident.0 .0].shape_lists[ident.0 .1][ident.1]
    }
}

/// Conditional and unconditional jumps carry no state of their own and are
/// skipped when laying out locations.
fn is_transparent_insn(code: InsnCode) -> bool {
    matches!(code, InsnCode::Cond | InsnCode::Jmp)
}

/// Build the location skeleton: one location per non-transparent instruction,
/// in traversal order over the CFG, heap lists loaded from the fixed point.
fn load_heaps(
    stor: &Storage,
    fnc: usize,
    state_map: &StateByInsn,
) -> (Vec<LocalState>, UnorderedMap<usize, usize>) {
    let mut locs: Vec<LocalState> = vec![];
    let mut insn_lookup: UnorderedMap<usize, usize> = Default::default();

    let f = &stor.functions[fnc];
    let mut wl: VecDeque<usize> = VecDeque::new();
    let mut seen: UnorderedSet<usize> = Default::default();
    wl.push_back(f.entry);
    seen.insert(f.entry);

    while let Some(bb) = wl.pop_front() {
        let mut prev_loc_in_block: Option<usize> = None;
        for &insn_idx in &stor.blocks[bb] {
            let insn = &stor.instructions[insn_idx];
            for &tgt in &insn.targets {
                if seen.insert(tgt) {
                    wl.push_back(tgt);
                }
            }
            if is_transparent_insn(insn.code) {
                // skip instructions we do not want in the result
                continue;
            }

            let loc_idx = locs.len();
            if let Some(prev) = prev_loc_in_block {
                locs[prev].cfg_out_edges.push(CfgEdge {
                    target_loc: loc_idx,
                    closes_loop: false,
                });
            }
            prev_loc_in_block = Some(loc_idx);

            let mut heap_list = state_map.get(insn_idx).cloned().unwrap_or_default();
            heap_list.waive_clone_operation();
            let sh_cnt = heap_list.len();

            insn_lookup.insert(insn_idx, loc_idx);
            locs.push(LocalState {
                insn: insn_idx,
                heap_list,
                cfg_in_edges: vec![],
                cfg_out_edges: vec![],
                trace_in_edges: vec![vec![]; sh_cnt],
                trace_out_edges: vec![vec![]; sh_cnt],
                shape_lists: vec![vec![]; sh_cnt],
            });
        }
    }

    (locs, insn_lookup)
}

/// Wire the block-level control flow into location-level edges, tag
/// loop-closing edges, and mirror everything backwards.
fn finalize_flow(stor: &Storage, locs: &mut Vec<LocalState>, insn_lookup: &UnorderedMap<usize, usize>) {
    for loc_idx in 0..locs.len() {
        if !locs[loc_idx].cfg_out_edges.is_empty() {
            // non-terminal instructions were already wired while loading
            continue;
        }
        let insn_idx = locs[loc_idx].insn;
        let bb = match stor.block_of_insn(insn_idx) {
            Some(bb) => bb,
            None => continue,
        };
        // jump to the terminal instruction (in most cases it is this one)
        let term_idx = *stor.blocks[bb].last().unwrap();
        let term = &stor.instructions[term_idx];

        let mut out_edges = vec![];
        for (tgt_pos, &tgt_bb) in term.targets.iter().enumerate() {
            // skip trivial basic blocks containing only a single jump
            let mut bb = tgt_bb;
            loop {
                let front = stor.blocks[bb][0];
                let fi = &stor.instructions[front];
                if fi.code == InsnCode::Jmp && fi.targets.len() == 1 {
                    bb = fi.targets[0];
                } else {
                    break;
                }
            }
            let dst_loc = stor.blocks[bb]
                .iter()
                .find_map(|i| insn_lookup.get(i).copied());
            match dst_loc {
                Some(dst_loc) => out_edges.push(CfgEdge {
                    target_loc: dst_loc,
                    closes_loop: term.loop_closing_targets.contains(&tgt_pos),
                }),
                None => {
                    warn!("control-flow edge into a block with no locations";
                          "block" => bb);
                }
            }
        }
        locs[loc_idx].cfg_out_edges = out_edges;
    }

    // initialize backward control-flow edges
    for src_idx in 0..locs.len() {
        let outs = locs[src_idx].cfg_out_edges.clone();
        for oe in outs {
            locs[oe.target_loc].cfg_in_edges.push(CfgEdge {
                target_loc: src_idx,
                closes_loop: oe.closes_loop,
            });
        }
    }
}

/// Index from trace nodes to the heaps currently holding them, for the
/// locations feeding one destination location.
struct TraceIndex {
    lookup: UnorderedMap<usize, HeapIdent>,
}

impl TraceIndex {
    fn new() -> Self {
        Self {
            lookup: Default::default(),
        }
    }

    fn index_trace_of(&mut self, locs: &[LocalState], loc_idx: usize) {
        for sh_idx in 0..locs[loc_idx].heap_list.len() {
            let sh = &locs[loc_idx].heap_list[sh_idx];
            let key = Rc::as_ptr(sh.trace()) as usize;
            // never re-target an already indexed trace node
            let prev = self.lookup.insert(key, (loc_idx, sh_idx));
            debug_assert!(prev.is_none() || prev == Some((loc_idx, sh_idx)));
        }
    }

    /// Walk ancestors breadth-first until an indexed node is found on each
    /// branch; every hit is a nearest predecessor.
    fn nearest_predecessors_of(&self, sh: &SymHeap) -> Vec<HeapIdent> {
        let mut out: Vec<HeapIdent> = vec![];
        let mut seen: UnorderedSet<usize> = Default::default();
        let mut wl: VecDeque<Rc<trace::Node>> = VecDeque::new();
        wl.push_back(sh.trace().clone());
        seen.insert(Rc::as_ptr(sh.trace()) as usize);
        while let Some(node) = wl.pop_front() {
            let key = Rc::as_ptr(&node) as usize;
            if let Some(&ident) = self.lookup.get(&key) {
                if !out.contains(&ident) {
                    out.push(ident);
                }
                continue;
            }
            for p in node.parents() {
                if seen.insert(Rc::as_ptr(p) as usize) {
                    wl.push_back(p.clone());
                }
            }
        }
        out
    }
}

/// Create one trace edge per (destination heap, nearest predecessor) pair
fn create_trace_edges(locs: &mut Vec<LocalState>, edges: &mut Vec<TraceEdge>) {
    for dst_loc in 0..locs.len() {
        let mut index = TraceIndex::new();
        for ie_pos in 0..locs[dst_loc].cfg_in_edges.len() {
            let src_loc = locs[dst_loc].cfg_in_edges[ie_pos].target_loc;
            index.index_trace_of(locs, src_loc);
        }

        let heap_cnt = locs[dst_loc].heap_list.len();
        for dst_sh in 0..heap_cnt {
            let mut preds = index.nearest_predecessors_of(&locs[dst_loc].heap_list[dst_sh]);
            // deterministic emission: predecessors in CFG-in-edge order, then
            // by heap index
            let in_order: Vec<usize> = locs[dst_loc]
                .cfg_in_edges
                .iter()
                .map(|e| e.target_loc)
                .collect();
            preds.sort_by_key(|&(l, h)| {
                (
                    in_order.iter().position(|&x| x == l).unwrap_or(usize::MAX),
                    h,
                )
            });

            for src in preds {
                let obj_map = trace::resolve_id_mapping(
                    locs[src.0].heap_list[src.1].trace(),
                    locs[dst_loc].heap_list[dst_sh].trace(),
                );
                let te_idx = edges.len();
                edges.push(TraceEdge {
                    src,
                    dst: (dst_loc, dst_sh),
                    obj_map,
                    shape_map: TwoWayMapper::new(NotFoundAction::ReturnNothing),
                });
                locs[dst_loc].trace_in_edges[dst_sh].push(te_idx);
                locs[src.0].trace_out_edges[src.1].push(te_idx);
            }
        }
    }
}

/// Run the local container-shape pass on every heap
fn detect_cont_shapes(locs: &mut Vec<LocalState>) {
    for loc in locs.iter_mut() {
        for sh_idx in 0..loc.heap_list.len() {
            loc.shape_lists[sh_idx] = detect_local_shapes(&loc.heap_list[sh_idx]);
        }
    }
}

/// Whether `obj_map` maps the source object set onto the destination set and
/// vice versa (a bijection on the shapes' underlying objects)
fn check_shape_mapping(src_objs: &[i32], dst_objs: &[i32], obj_map: &TwoWayMapper<i32>) -> bool {
    let img = obj_map.project_left(src_objs.iter().copied());
    if img != dst_objs {
        return false;
    }
    let pre = obj_map.project_right(dst_objs.iter().copied());
    pre == src_objs
}

/// Relate source shapes to destination shapes across one trace edge
fn detect_shape_mapping_core(
    edge: &TraceEdge,
    sh_src: &SymHeap,
    sh_dst: &SymHeap,
    src_shapes: &[Shape],
    dst_shapes: &[Shape],
) -> TwoWayMapper<usize> {
    let mut map = TwoWayMapper::new(NotFoundAction::ReturnNothing);

    let mut index: Vec<(Vec<i32>, usize)> = vec![];
    for (src_idx, shape) in src_shapes.iter().enumerate() {
        let key_src = obj_set_of_shape(sh_src, shape);
        // translate the object ids using the mapping stored in the edge
        let key = edge.obj_map.project_left(key_src.iter().copied());
        debug_assert!(
            index.iter().all(|(k, _)| *k != key),
            "shape key redefinition"
        );
        index.push((key, src_idx));
    }

    for (dst_idx, shape) in dst_shapes.iter().enumerate() {
        let key_dst = obj_set_of_shape(sh_dst, shape);
        let src_idx = match index.iter().find(|(k, _)| *k == key_dst) {
            Some((_, i)) => *i,
            None => continue,
        };
        let key_src = obj_set_of_shape(sh_src, &src_shapes[src_idx]);
        if !check_shape_mapping(&key_src, &key_dst, &edge.obj_map) {
            // the mapping is not a bijection on these objects
            continue;
        }
        map.insert(src_idx, dst_idx);
    }
    map
}

/// Recompute the shape mapping of every trace edge
fn detect_shape_mapping(gs: &mut GlobalState) {
    let mut computed: Vec<(usize, TwoWayMapper<usize>)> = vec![];
    for (te_idx, te) in gs.edges.iter().enumerate() {
        let sh_src = gs.heap_by_ident(te.src);
        let sh_dst = gs.heap_by_ident(te.dst);
        let src_shapes = &gs.locs[te.src.0].shape_lists[te.src.1];
        let dst_shapes = &gs.locs[te.dst.0].shape_lists[te.dst.1];
        computed.push((
            te_idx,
            detect_shape_mapping_core(te, sh_src, sh_dst, src_shapes, dst_shapes),
        ));
    }
    for (te_idx, map) in computed {
        gs.edges[te_idx].shape_map = map;
    }
}

/// Try to establish a length-1 shape in a predecessor heap by reverse-mapping
/// the entry object: the ancestor object must still exist, agree in size and
/// estimated type, and have both its next and prev fields null.
fn detect_single_prev_shape(
    shape: &Shape,
    dst_size: crate::heap::IntRange,
    dst_ty: Option<crate::storage::TypeDesc>,
    sh_src: &SymHeap,
    obj_src: ObjId,
) -> Option<Shape> {
    let b = shape.binding;
    if sh_src.try_value_of_ptr(obj_src, b.next) != Some(VAL_NULL) {
        // null terminator missing
        return None;
    }
    if sh_src.try_value_of_ptr(obj_src, b.prev) != Some(VAL_NULL) {
        return None;
    }
    if sh_src.obj_size(obj_src) != dst_size {
        // object size mismatch
        return None;
    }
    if let (Some(dst_ty), Some(src_ty)) = (&dst_ty, sh_src.estimated_type(obj_src)) {
        if *dst_ty != *sh_src.stor().type_of(src_ty) {
            // estimated type-info mismatch
            return None;
        }
    }
    Some(Shape {
        entry: obj_src,
        length: 1,
        binding: b,
    })
}

/// Walk the trace backwards from an unmapped destination shape, implying
/// length-1 shapes in predecessors where the evidence allows it.
fn detect_prev_shapes(
    gs: &mut GlobalState,
    dst_loc: usize,
    dst_sh: usize,
    dst_cs: usize,
) -> bool {
    let dst_shape = gs.locs[dst_loc].shape_lists[dst_sh][dst_cs];
    if dst_shape.length != 1 {
        // only shapes consisting of exactly one object are supported for now
        return false;
    }
    let entry = dst_shape.entry;
    let b = dst_shape.binding;
    let (dst_size, dst_ty) = {
        let sh_dst = &gs.locs[dst_loc].heap_list[dst_sh];
        if sh_dst.try_value_of_ptr(entry, b.next) != Some(VAL_NULL)
            || sh_dst.try_value_of_ptr(entry, b.prev) != Some(VAL_NULL)
        {
            // only shapes terminated by null are supported for now
            return false;
        }
        (
            sh_dst.obj_size(entry),
            sh_dst
                .estimated_type(entry)
                .map(|t| sh_dst.stor().type_of(t).clone()),
        )
    };

    let mut found_any = false;
    let mut obj = entry;
    let mut cur: HeapIdent = (dst_loc, dst_sh);
    let mut visited: Vec<HeapIdent> = vec![cur];
    loop {
        let in_edges = &gs.locs[cur.0].trace_in_edges[cur.1];
        if in_edges.len() != 1 {
            // only heaps with exactly one predecessor are supported for now
            break;
        }
        let te_idx = in_edges[0];
        let (src_ident, mapped) = {
            let te = &gs.edges[te_idx];
            (te.src, te.obj_map.map_right(obj.0))
        };
        if mapped.len() != 1 {
            // only bijective object mapping is supported for now
            break;
        }
        obj = ObjId(mapped[0]);
        if !gs.heap_by_ident(src_ident).valid(obj) {
            // the traced object no longer exists in the predecessor heap
            break;
        }

        // jump to the predecessor; bail out on a cyclic trace
        if visited.contains(&src_ident) {
            break;
        }
        visited.push(src_ident);
        cur = src_ident;
        let new_shape = detect_single_prev_shape(
            &dst_shape,
            dst_size,
            dst_ty.clone(),
            gs.heap_by_ident(cur),
            obj,
        );
        let new_shape = match new_shape {
            Some(s) => s,
            None => continue,
        };
        let shape_list = &mut gs.locs[cur.0].shape_lists[cur.1];
        if shape_list.contains(&new_shape) {
            // the shape has already been detected before
            continue;
        }
        shape_list.push(new_shape);
        found_any = true;
        debug!("backward inference appended a container shape"; "loc" => cur.0);
    }
    found_any
}

/// Look for destination shapes with no mapped predecessor and try to imply
/// shapes backwards along the trace.
fn imply_cont_shapes_from_trace(gs: &mut GlobalState) -> bool {
    let mut found_any = false;

    let mut targets: Vec<(usize, usize, usize)> = vec![];
    for dst_loc in 0..gs.locs.len() {
        for dst_sh in 0..gs.locs[dst_loc].heap_list.len() {
            let cs_cnt = gs.locs[dst_loc].shape_lists[dst_sh].len();
            for dst_cs in 0..cs_cnt {
                let mapped = gs.locs[dst_loc].trace_in_edges[dst_sh]
                    .iter()
                    .any(|&te_idx| !gs.edges[te_idx].shape_map.map_right(dst_cs).is_empty());
                if !mapped {
                    targets.push((dst_loc, dst_sh, dst_cs));
                }
            }
        }
    }

    for (dst_loc, dst_sh, dst_cs) in targets {
        if detect_prev_shapes(gs, dst_loc, dst_sh, dst_cs) {
            found_any = true;
        }
    }
    found_any
}

/// Assemble the [`GlobalState`] of one function from its per-instruction
/// fixed point. Terminates because both the location set and every heap set
/// are finite after abstraction.
pub fn compute_state_of(stor: &Rc<Storage>, fnc: usize, state_map: &StateByInsn) -> GlobalState {
    let (mut locs, insn_lookup) = load_heaps(stor, fnc, state_map);
    finalize_flow(stor, &mut locs, &insn_lookup);

    let mut edges = vec![];
    create_trace_edges(&mut locs, &mut edges);

    let mut gs = GlobalState { locs, edges };

    detect_cont_shapes(&mut gs.locs);
    detect_shape_mapping(&mut gs);

    if imply_cont_shapes_from_trace(&mut gs) {
        // new shapes were implied; chances are new mappings exist as well
        detect_shape_mapping(&mut gs);
    }
    gs
}
