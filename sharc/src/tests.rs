//! Cross-module tests exercising the analyzer core end to end.

#[cfg(test)]
use crate::abstraction::abstract_if_needed;
#[cfg(test)]
use crate::concretization::concretize;
#[cfg(test)]
use crate::heap::{
    CustomValue, IntRange, ObjKind, SymHeap, UnknownOrigin, VAL_NULL,
};
#[cfg(test)]
use crate::isomorphism::are_equal;
#[cfg(test)]
use crate::report::DefectKind;
#[cfg(test)]
use crate::scenarios::{
    build_fixed_point, dll_program, entry_heap, free_all, list_heap, push_node, sll_program,
};
#[cfg(test)]
use crate::state::SymHeapUnion;
#[cfg(test)]
use crate::storage::{Storage, TypeDesc, TypeItem};

#[cfg(test)]
fn count_kind(sh: &SymHeap, kind: ObjKind) -> usize {
    sh.gather_root_objs()
        .into_iter()
        .filter(|&o| sh.kind_of(o) == kind)
        .count()
}

#[cfg(test)]
fn heap_objs(sh: &SymHeap) -> usize {
    sh.gather_root_objs()
        .into_iter()
        .filter(|&o| sh.storage_class(o) == crate::heap::StorageClass::OnHeap)
        .count()
}

#[test]
fn equality_is_reflexive() {
    let p = sll_program();
    for n in 0..4 {
        let sh = list_heap(&p, n).unwrap();
        assert!(are_equal(&sh, &sh));
    }
}

#[test]
fn equality_is_symmetric() {
    let p = sll_program();
    let a = list_heap(&p, 2).unwrap();
    let b = list_heap(&p, 2).unwrap();
    let c = list_heap(&p, 3).unwrap();
    assert!(are_equal(&a, &b));
    assert!(are_equal(&b, &a));
    assert!(!are_equal(&a, &c));
    assert!(!are_equal(&c, &a));
}

#[test]
fn union_deduplicates() {
    let p = sll_program();
    let a = list_heap(&p, 2).unwrap();
    let b = list_heap(&p, 2).unwrap();
    let mut u = SymHeapUnion::new();
    assert!(u.insert(a));
    assert!(!u.insert(b));
    assert_eq!(u.len(), 1);
}

#[test]
fn isomorphism_survives_value_renaming() {
    // identical structure, renumbered internal value ids
    let p = sll_program();
    let a = list_heap(&p, 2).unwrap();

    let mut b = SymHeap::new(p.stor.clone());
    // burn a few value ids first so every later id differs from its twin
    for _ in 0..5 {
        b.create_unknown(UnknownOrigin::Assigned);
    }
    let lobj = b.create_stack_obj(p.list_var);
    b.write_field(lobj, 0, p.node_ptr, VAL_NULL).unwrap();
    push_node(&p, &mut b).unwrap();
    push_node(&p, &mut b).unwrap();

    assert!(are_equal(&a, &b));
    let mut u = SymHeapUnion::new();
    u.insert(a);
    u.insert(b);
    assert_eq!(u.len(), 1);
}

#[test]
fn threshold_respected() {
    // one node stays concrete; two nodes yield an SLS plus its concrete
    // predecessor
    let p = sll_program();

    let mut one = list_heap(&p, 1).unwrap();
    abstract_if_needed(&mut one).unwrap();
    assert_eq!(count_kind(&one, ObjKind::Sls), 0);

    let mut two = list_heap(&p, 2).unwrap();
    abstract_if_needed(&mut two).unwrap();
    assert_eq!(count_kind(&two, ObjKind::Sls), 1);
    assert_eq!(count_kind(&two, ObjKind::Region), 2); // stack var + prefix node
}

#[test]
fn sls_min_length_has_neq() {
    let p = sll_program();
    let mut sh = list_heap(&p, 3).unwrap();
    abstract_if_needed(&mut sh).unwrap();
    let seg = sh
        .gather_root_objs()
        .into_iter()
        .find(|&o| sh.kind_of(o) == ObjKind::Sls)
        .expect("no SLS after folding three nodes");
    assert_eq!(sh.seg_min_len(seg), 1);
    let addr = sh.try_addr_of(seg, 0).unwrap();
    let next = sh.seg_next_value(seg);
    assert!(sh.has_neq(addr, next));
    assert_eq!(sh.prove_eq(addr, next), Some(false));
}

#[test]
fn concretize_after_abstract_covers_the_original() {
    // folding three nodes and exhaustively unrolling
    // again reaches a heap isomorphic to the original
    let p = sll_program();
    let orig = list_heap(&p, 3).unwrap();

    let mut sh = orig.clone();
    abstract_if_needed(&mut sh).unwrap();
    let seg = sh
        .gather_root_objs()
        .into_iter()
        .find(|&o| sh.kind_of(o) == ObjKind::Sls)
        .unwrap();

    // first unroll: the segment is non-empty, so no empty variant comes out
    let variants = concretize(&mut sh, seg).unwrap();
    assert!(variants.is_empty());
    let dup = sh
        .gather_root_objs()
        .into_iter()
        .find(|&o| sh.kind_of(o) == ObjKind::Sls)
        .expect("the unrolled remainder must stay a segment");
    assert_eq!(sh.seg_min_len(dup), 0); // min length decreased by the unroll

    // second unroll: now possibly empty; the empty variant is the two-node
    // instance of the summarized family
    let variants = concretize(&mut sh, dup).unwrap();
    assert_eq!(variants.len(), 1);
    assert_eq!(count_kind(&variants[0], ObjKind::Sls), 0);
    assert!(are_equal(&variants[0], &list_heap(&p, 2).unwrap()));

    // third unroll reaches the original three-node heap
    let dup2 = sh
        .gather_root_objs()
        .into_iter()
        .find(|&o| sh.kind_of(o) == ObjKind::Sls)
        .unwrap();
    assert_eq!(sh.seg_min_len(dup2), 0);
    let variants = concretize(&mut sh, dup2).unwrap();
    assert_eq!(variants.len(), 1);
    let empty = &variants[0];
    assert_eq!(count_kind(empty, ObjKind::Sls), 0);
    assert!(are_equal(empty, &orig));
}

#[test]
fn sll_build_reaches_fixed_point() {
    // the allocation loop converges onto prefix + segment
    let p = sll_program();
    let smap = build_fixed_point(&p).unwrap();
    let body = smap.get(p.body_insn).expect("no states at the loop body");
    // 1 concrete node, then concrete + SLS; further iterations fold back
    assert_eq!(body.len(), 2);
    let folded = body
        .iter()
        .find(|sh| count_kind(sh, ObjKind::Sls) == 1)
        .expect("no folded state at the loop body");
    assert_eq!(
        folded
            .gather_root_objs()
            .into_iter()
            .filter(|&o| folded.kind_of(o) == ObjKind::Sls)
            .map(|o| folded.seg_min_len(o))
            .next(),
        Some(1)
    );
}

#[test]
fn sll_build_then_free_leaks_nothing() {
    let p = sll_program();
    let smap = build_fixed_point(&p).unwrap();
    let exit = smap.get(p.exit_insn).unwrap();
    for sh in exit.iter() {
        let done = free_all(&p, sh.clone()).unwrap();
        assert!(!done.is_empty());
        for final_sh in done.iter() {
            assert_eq!(heap_objs(final_sh), 0);
            assert!(final_sh.collect_junk().is_empty());
        }
    }
}

#[test]
fn sll_leaks_when_scope_dies() {
    // never freeing; at exit the whole list is junk once the variable is
    // out of scope
    let p = sll_program();
    let smap = build_fixed_point(&p).unwrap();
    let exit = smap.get(p.exit_insn).unwrap();
    let folded = exit
        .iter()
        .find(|sh| count_kind(sh, ObjKind::Sls) == 1)
        .expect("no folded state at the exit");
    let mut sh = folded.clone();
    let lobj = sh.obj_by_var(p.list_var);
    sh.destroy(lobj).unwrap();
    assert!(!sh.collect_junk().is_empty());
}

#[test]
fn dll_build_folds_into_dls() {
    let p = dll_program();
    let smap = build_fixed_point(&p).unwrap();
    let body = smap.get(p.body_insn).unwrap();
    let folded = body
        .iter()
        .find(|sh| count_kind(sh, ObjKind::Dls) > 0)
        .expect("no DLS state at the loop body");
    // the legacy representation keeps two mutually linked ends
    assert_eq!(count_kind(folded, ObjKind::Dls), 2);
}

#[test]
fn dls_back_link_holds_after_unrolling() {
    let p = dll_program();
    let smap = build_fixed_point(&p).unwrap();
    let body = smap.get(p.body_insn).unwrap();
    let folded = body
        .iter()
        .find(|sh| count_kind(sh, ObjKind::Dls) > 0)
        .unwrap();
    let mut sh = folded.clone();
    let lobj = sh.obj_by_var(p.list_var);
    let head = sh.read_field(lobj, 0, p.node_ptr);
    let tgt = sh.points_to(head);

    let node = if sh.kind_of(tgt).is_abstract() {
        concretize(&mut sh, tgt).unwrap();
        tgt
    } else {
        tgt
    };
    // prev(next(o)) == addr(o) whenever the next target is concrete
    let next = sh.value_of_ptr(node, p.next_off);
    let succ = sh.points_to(next);
    assert!(sh.valid(succ));
    let back = sh.value_of_ptr(succ, p.prev_off.unwrap());
    assert_eq!(back, sh.addr_of(node, 0));
}

#[test]
fn dll_delete_at_arbitrary_position() {
    // concretization splits the cases, deletion bypasses the links, and
    // the walk frees everything without spurious invalid dereferences
    let p = dll_program();
    let smap = build_fixed_point(&p).unwrap();
    let exit = smap.get(p.exit_insn).unwrap();
    let folded = exit
        .iter()
        .find(|sh| count_kind(sh, ObjKind::Dls) > 0)
        .expect("no DLS state at the exit");

    let done = free_all(&p, folded.clone()).unwrap();
    assert!(!done.is_empty());
    for final_sh in done.iter() {
        assert_eq!(heap_objs(final_sh), 0);
        assert!(final_sh.collect_junk().is_empty());
    }
}

#[test]
fn container_of_aliasing() {
    // a node embedded inside an outer struct; offset arithmetic aliases
    let mut stor = Storage::new();
    let ptr = stor.ptr_type();
    let hdr = stor.intern_type(TypeDesc::int(8));
    let node_ty = stor.intern_type(TypeDesc::strukt(
        16,
        vec![
            TypeItem {
                off: 0,
                ty: ptr,
                name: Some("next".into()),
            },
            TypeItem {
                off: 8,
                ty: hdr,
                name: Some("data".into()),
            },
        ],
    ));
    let outer_ty = stor.intern_type(TypeDesc::strukt(
        24,
        vec![
            TypeItem {
                off: 0,
                ty: hdr,
                name: Some("refcnt".into()),
            },
            TypeItem {
                off: 8,
                ty: node_ty,
                name: Some("link".into()),
            },
        ],
    ));
    let stor = std::rc::Rc::new(stor);

    let mut sh = SymHeap::new(stor);
    let outer = sh.create_heap_obj(IntRange::singular(24), Some(outer_ty));

    // the interned pointer into the embedded node
    let inner_ptr = sh.addr_of(outer, 8);
    assert_eq!(inner_ptr, sh.addr_of(outer, 8));

    // offset-zero aliasing: the outer struct and its first field share an
    // address identity
    assert_eq!(sh.addr_of(outer, 0), sh.addr_of(outer, 0));

    // freeing through the embedded pointer is a defect, not a free
    assert_eq!(
        sh.check_free_target(inner_ptr),
        Err(DefectKind::DoubleFree)
    );
    // freeing the true root is fine
    let root_ptr = sh.addr_of(outer, 0);
    assert_eq!(sh.check_free_target(root_ptr), Ok(Some(outer)));

    // a stack address is no free target either
    let p = sll_program();
    let mut sh2 = entry_heap(&p).unwrap();
    let lobj = sh2.obj_by_var(p.list_var);
    let stack_ptr = sh2.addr_of(lobj, 0);
    assert_eq!(
        sh2.check_free_target(stack_ptr),
        Err(DefectKind::DoubleFree)
    );
}

#[test]
fn null_and_invalid_dereference_detection() {
    let p = sll_program();
    let mut sh = entry_heap(&p).unwrap();
    assert_eq!(
        sh.check_deref_target(VAL_NULL),
        Err(DefectKind::NullDeref)
    );

    let node = push_node(&p, &mut sh).unwrap();
    let addr = sh.addr_of(node, 0);
    assert!(sh.check_deref_target(addr).is_ok());
    sh.destroy(node).unwrap();
    assert_eq!(sh.check_deref_target(addr), Err(DefectKind::InvalidDeref));

    // reads through the dangling pointer produce a failed-deref unknown
    let v = sh.read_field(node, 0, p.node_ptr);
    assert_eq!(sh.unknown_origin(v), Some(UnknownOrigin::DerefFailed));
}

#[test]
fn custom_values_compare_by_payload() {
    let p = sll_program();
    let mut sh = SymHeap::new(p.stor.clone());
    let a = sh.create_custom(CustomValue::Int(IntRange::singular(42)));
    let b = sh.create_custom(CustomValue::Int(IntRange::singular(42)));
    let c = sh.create_custom(CustomValue::Int(IntRange::singular(7)));
    assert_eq!(a, b); // interned
    assert_eq!(sh.prove_eq(a, c), Some(false));
    let f = sh.create_custom(CustomValue::Fnc(3));
    assert_eq!(sh.prove_eq(a, f), Some(false));
}

#[test]
fn fixed_point_assembler_builds_the_graph() {
    use crate::fixpoint::compute_state_of;

    let p = sll_program();
    let smap = build_fixed_point(&p).unwrap();
    let gs = compute_state_of(&p.stor, p.fnc, &smap);

    // Label, Assign, Ret survive; Jmp and Cond are transparent
    assert_eq!(gs.locs.len(), 3);
    assert_eq!(gs.locs[0].insn, p.entry_insn);
    assert_eq!(gs.locs[1].insn, p.body_insn);
    assert_eq!(gs.locs[2].insn, p.exit_insn);

    // entry -> body, body -> body (loop), body -> exit
    let body_out = &gs.locs[1].cfg_out_edges;
    assert_eq!(body_out.len(), 2);
    assert!(body_out.iter().any(|e| e.target_loc == 1 && e.closes_loop));
    assert!(body_out.iter().any(|e| e.target_loc == 2 && !e.closes_loop));
    assert_eq!(gs.locs[1].cfg_in_edges.len(), 2);

    // every body heap descends from a predecessor heap
    assert!(!gs.edges.is_empty());
    for (h, edges) in gs.locs[1].trace_in_edges.iter().enumerate() {
        assert!(
            !edges.is_empty(),
            "body heap #{} has no trace predecessor",
            h
        );
    }

    // the folded states carry container shapes
    let shapes: usize = gs.locs[1].shape_lists.iter().map(|l| l.len()).sum();
    assert!(shapes > 0, "no container shape detected at the loop body");
}

#[test]
fn backward_shape_inference_implies_predecessor_shapes() {
    use crate::fixpoint::compute_state_of;
    use crate::heap::{SegData, Selector};
    use crate::state::StateByInsn;
    use crate::storage::{Insn, InsnCode, SrcLoc};
    use crate::trace;
    use std::rc::Rc;

    // straight-line CFG (Label; Jmp -> Ret), so the exit location cannot
    // shadow its trace predecessors with itself
    let mut stor = Storage::new();
    let ptr = stor.ptr_type();
    let data = stor.intern_type(TypeDesc::int(8));
    let node_ty = stor.intern_type(TypeDesc::strukt(
        16,
        vec![
            TypeItem {
                off: 0,
                ty: ptr,
                name: Some("next".into()),
            },
            TypeItem {
                off: 8,
                ty: data,
                name: Some("data".into()),
            },
        ],
    ));
    let var = stor.add_var("x", ptr, false);
    stor.begin_function("f");
    stor.begin_block();
    let l0 = stor.add_insn(Insn {
        code: InsnCode::Label,
        operands: vec![],
        targets: vec![],
        loop_closing_targets: vec![],
        loc: SrcLoc::default(),
    });
    stor.add_insn(Insn {
        code: InsnCode::Jmp,
        operands: vec![],
        targets: vec![1],
        loop_closing_targets: vec![],
        loc: SrcLoc::default(),
    });
    stor.begin_block();
    let l1 = stor.add_insn(Insn {
        code: InsnCode::Ret,
        operands: vec![],
        targets: vec![],
        loop_closing_targets: vec![],
        loc: SrcLoc::default(),
    });
    stor.end_function();
    let stor = Rc::new(stor);

    // predecessor heap: one lone null-terminated node
    let mut a = SymHeap::new(stor.clone());
    let vobj = a.create_stack_obj(var);
    let n = a.create_heap_obj(IntRange::singular(16), Some(node_ty));
    a.write_field(n, 0, ptr, VAL_NULL).unwrap();
    let addr = a.addr_of(n, 0);
    a.write_field(vobj, 0, ptr, addr).unwrap();

    // successor heap: the same node summarized into a possibly-empty segment
    let mut b = a.clone();
    b.set_trace(trace::Node::step("fold", a.trace(), None));
    b.abstract_as_seg(
        n,
        ObjKind::Sls,
        SegData {
            head: 0,
            binder: Selector { off: 0, ty: ptr },
            peer: None,
            min_len: 0,
        },
    )
    .unwrap();

    let mut smap = StateByInsn::new();
    smap.insert(l0, a);
    smap.insert(l1, b);
    let gs = compute_state_of(&stor, 0, &smap);

    assert_eq!(gs.locs.len(), 2);
    // the segment at the exit produced a shape...
    assert_eq!(gs.locs[1].shape_lists[0].len(), 1);
    // ...and backward inference implied its length-1 twin at the entry
    assert_eq!(gs.locs[0].shape_lists[0].len(), 1);
    assert!(gs.edges.iter().any(|te| !te.shape_map.is_empty()));
}

#[test]
fn shape_mapping_relates_segments_across_the_loop() {
    use crate::fixpoint::compute_state_of;

    let p = sll_program();
    let smap = build_fixed_point(&p).unwrap();
    let gs = compute_state_of(&p.stor, p.fnc, &smap);

    // at least one trace edge maps a source shape onto a destination shape
    let mapped = gs
        .edges
        .iter()
        .any(|te| !te.shape_map.is_empty());
    assert!(mapped, "no shape survived the mapping across trace edges");
}
