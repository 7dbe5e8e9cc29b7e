//! Scripted list-manipulation scenarios.
//!
//! The instruction-stepping executor lives outside this crate, so the demo
//! driver and the tests script the heap mutations an executor would perform:
//! allocate and link nodes, run the fold after every step, concretize before
//! every dereference of a segment, and record the per-instruction states a
//! fixed point would contain. No instruction is ever interpreted here.

use crate::abstraction::abstract_if_needed;
use crate::concretization::concretize;
use crate::heap::{EngineError, IntRange, ObjId, SymHeap, VAL_NULL};
use crate::state::{StateByInsn, SymHeapUnion};
use crate::storage::{
    Insn, InsnCode, Operand, ProgVar, SrcLoc, Storage, TypeDesc, TypeId, TypeItem,
};
use crate::trace;
use std::rc::Rc;

/// One list-building program: a node type, list-head (and, for doubly-linked
/// lists, list-tail) variables and a three-block CFG (entry, allocation loop,
/// exit).
pub struct ListProgram {
    pub stor: Rc<Storage>,
    pub node_ty: TypeId,
    pub node_ptr: TypeId,
    pub node_size: i64,
    pub next_off: i64,
    /// `None` for singly-linked nodes
    pub prev_off: Option<i64>,
    pub data_off: i64,
    pub data_ty: TypeId,
    pub list_var: ProgVar,
    /// The tail variable of a doubly-linked builder (which appends at the
    /// back, keeping every interior node reachable from both sides)
    pub tail_var: Option<ProgVar>,
    pub fnc: usize,
    pub entry_insn: usize,
    pub body_insn: usize,
    pub exit_insn: usize,
}

fn loc(line: u32) -> SrcLoc {
    SrcLoc { line, column: 1 }
}

fn build_program(with_prev: bool) -> ListProgram {
    let mut stor = Storage::new();
    let node_ptr = stor.ptr_type();
    let data_ty = stor.intern_type(TypeDesc::int(8));

    let mut items = vec![TypeItem {
        off: 0,
        ty: node_ptr,
        name: Some("next".into()),
    }];
    let mut off = 8;
    if with_prev {
        items.push(TypeItem {
            off,
            ty: node_ptr,
            name: Some("prev".into()),
        });
        off += 8;
    }
    let data_off = off;
    items.push(TypeItem {
        off,
        ty: data_ty,
        name: Some("data".into()),
    });
    let node_size = off + 8;
    let node_ty = stor.intern_type(TypeDesc::strukt(node_size, items));

    let list_var = stor.add_var("list", node_ptr, false);
    let tail_var = with_prev.then(|| stor.add_var("tail", node_ptr, false));

    stor.begin_function(if with_prev { "build_dll" } else { "build_sll" });
    stor.begin_block();
    let entry_insn = stor.add_insn(Insn {
        code: InsnCode::Label,
        operands: vec![],
        targets: vec![],
        loop_closing_targets: vec![],
        loc: loc(1),
    });
    stor.add_insn(Insn {
        code: InsnCode::Jmp,
        operands: vec![],
        targets: vec![1],
        loop_closing_targets: vec![],
        loc: loc(1),
    });
    stor.begin_block();
    let body_insn = stor.add_insn(Insn {
        code: InsnCode::Assign,
        operands: vec![Operand::Var(list_var)],
        targets: vec![],
        loop_closing_targets: vec![],
        loc: loc(3),
    });
    stor.add_insn(Insn {
        code: InsnCode::Cond,
        operands: vec![],
        targets: vec![1, 2],
        loop_closing_targets: vec![0],
        loc: loc(4),
    });
    stor.begin_block();
    let exit_insn = stor.add_insn(Insn {
        code: InsnCode::Ret,
        operands: vec![Operand::Var(list_var)],
        targets: vec![],
        loop_closing_targets: vec![],
        loc: loc(6),
    });
    stor.end_function();

    ListProgram {
        stor: Rc::new(stor),
        node_ty,
        node_ptr,
        node_size,
        next_off: 0,
        prev_off: with_prev.then(|| 8),
        data_off,
        data_ty,
        list_var,
        tail_var,
        fnc: 0,
        entry_insn,
        body_insn,
        exit_insn,
    }
}

/// A singly-linked list builder program
pub fn sll_program() -> ListProgram {
    build_program(false)
}

/// A doubly-linked list builder program
pub fn dll_program() -> ListProgram {
    build_program(true)
}

/// The starting heap: the list variable(s) allocated and null
pub fn entry_heap(p: &ListProgram) -> Result<SymHeap, EngineError> {
    let mut sh = SymHeap::new(p.stor.clone());
    let lobj = sh.create_stack_obj(p.list_var);
    sh.write_field(lobj, 0, p.node_ptr, VAL_NULL)?;
    if let Some(tail_var) = p.tail_var {
        let tobj = sh.create_stack_obj(tail_var);
        sh.write_field(tobj, 0, p.node_ptr, VAL_NULL)?;
    }
    Ok(sh)
}

/// Attach one fresh node to the list of `sh` (the body of the allocation
/// loop). Singly-linked programs prepend at the head; doubly-linked ones
/// append at the tail, maintaining the back-link.
pub fn push_node(p: &ListProgram, sh: &mut SymHeap) -> Result<ObjId, EngineError> {
    let lobj = sh.obj_by_var(p.list_var);
    let node = sh.create_heap_obj(IntRange::singular(p.node_size), Some(p.node_ty));
    let addr = sh.addr_of(node, 0);

    let (prev_off, tail_var) = match (p.prev_off, p.tail_var) {
        (Some(prev_off), Some(tail_var)) => (prev_off, tail_var),
        _ => {
            // singly-linked: node->next = list; list = node
            let old_head = sh.read_field(lobj, 0, p.node_ptr);
            sh.write_field(node, p.next_off, p.node_ptr, old_head)?;
            sh.write_field(lobj, 0, p.node_ptr, addr)?;
            return Ok(node);
        }
    };

    // doubly-linked: node->next = null; node->prev = tail;
    // (tail ? tail->next : list) = node; tail = node
    let tobj = sh.obj_by_var(tail_var);
    let old_tail = sh.read_field(tobj, 0, p.node_ptr);
    sh.write_field(node, p.next_off, p.node_ptr, VAL_NULL)?;
    sh.write_field(node, prev_off, p.node_ptr, old_tail)?;
    let old_tgt = sh.points_to(old_tail);
    if sh.valid(old_tgt) {
        sh.write_field(old_tgt, p.next_off, p.node_ptr, addr)?;
    } else {
        sh.write_field(lobj, 0, p.node_ptr, addr)?;
    }
    sh.write_field(tobj, 0, p.node_ptr, addr)?;
    Ok(node)
}

/// Build a concrete `n`-node list without running the fold
pub fn list_heap(p: &ListProgram, n: usize) -> Result<SymHeap, EngineError> {
    let mut sh = entry_heap(p)?;
    for _ in 0..n {
        push_node(p, &mut sh)?;
    }
    Ok(sh)
}

/// Run the allocation loop to its fixed point, folding after every step, and
/// record the per-instruction states the executor would have accumulated.
pub fn build_fixed_point(p: &ListProgram) -> Result<StateByInsn, EngineError> {
    let mut smap = StateByInsn::new();

    let sh0 = entry_heap(p)?;
    smap.insert(p.entry_insn, sh0.clone());

    let mut frontier = vec![sh0];
    while let Some(sh) = frontier.pop() {
        let mut nh = sh.clone();
        nh.set_trace(trace::Node::step("alloc-node", sh.trace(), None));
        push_node(p, &mut nh)?;
        abstract_if_needed(&mut nh)?;
        if smap.insert(p.body_insn, nh.clone()) {
            frontier.push(nh);
        }
    }

    // every state observed at the loop body also flows to the exit
    let body = smap.get(p.body_insn).cloned().unwrap_or_default();
    for sh in body.iter() {
        let mut eh = sh.clone();
        eh.set_trace(trace::Node::step("leave-loop", sh.trace(), None));
        smap.insert(p.exit_insn, eh);
    }

    Ok(smap)
}

/// Walk the list of `sh` front to back, freeing every node; segments are
/// concretized before each dereference and every case split is followed.
/// Returns the set of terminal heaps.
pub fn free_all(p: &ListProgram, sh: SymHeap) -> Result<SymHeapUnion, EngineError> {
    let mut done = SymHeapUnion::new();
    let mut visited = SymHeapUnion::new();
    let mut todo = vec![sh];

    while let Some(mut sh) = todo.pop() {
        if !visited.insert(sh.clone()) {
            continue;
        }
        let lobj = sh.obj_by_var(p.list_var);
        let head = sh.read_field(lobj, 0, p.node_ptr);
        if head == VAL_NULL {
            done.insert(sh);
            continue;
        }
        let tgt = sh.points_to(head);
        if !sh.valid(tgt) {
            return Err(EngineError::Internal("list head does not point at a node"));
        }
        if sh.kind_of(tgt).is_abstract() {
            let variants = concretize(&mut sh, tgt)?;
            todo.extend(variants);
            todo.push(sh);
            continue;
        }
        // node = list; list = node->next; free(node)
        let next = sh.value_of_ptr(tgt, p.next_off);
        sh.write_field(lobj, 0, p.node_ptr, next)?;
        sh.destroy(tgt)?;
        let tr = sh.trace().clone();
        sh.set_trace(trace::Node::step("free-node", &tr, None));
        todo.push(sh);
    }

    Ok(done)
}
