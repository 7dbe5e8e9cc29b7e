//! Heap equality: isomorphism modulo a bijective renaming of value ids.
//!
//! Two heaps are equal when a partial bijection over their value identifiers
//! maps one onto the other, starting from the program-visible variables and
//! closing over pointer targets, composite fields and disequalities. The
//! check is what keeps state unions finite, so it must never diverge: value
//! pairs are scheduled at most once.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::heap::{ObjId, SymHeap, ValId};
use crate::storage::TypeKind;
use std::collections::VecDeque;

/// The running state of one equality check
struct Cmp<'a> {
    h1: &'a SymHeap,
    h2: &'a SymHeap,
    /// Canonically-ordered substitution: the smaller id of each matched pair
    /// maps to the larger one (bijection discipline; a direction-less check
    /// would quietly accept non-injective renamings)
    subst: UnorderedMap<ValId, ValId>,
    /// Directional bindings, both ways, making the renaming a true bijection
    fwd: UnorderedMap<ValId, ValId>,
    rev: UnorderedMap<ValId, ValId>,
    wl: VecDeque<(ValId, ValId)>,
    scheduled: UnorderedSet<(ValId, ValId)>,
}

/// Coarse classification of a value; classes must match before any deeper
/// comparison is attempted.
#[derive(PartialEq, Eq, Debug)]
enum ValClass {
    Sentinel,
    PointerConcrete,
    PointerAbstract,
    PointerDangling,
    Unknown(crate::heap::UnknownOrigin),
    Custom,
    Composite,
}

fn classify(h: &SymHeap, v: ValId) -> ValClass {
    if v.0 <= 0 {
        return ValClass::Sentinel;
    }
    if let Some((root, _)) = h.ptr_target(v) {
        if !h.valid(root) {
            return ValClass::PointerDangling;
        }
        return if h.kind_of(root).is_abstract() {
            ValClass::PointerAbstract
        } else {
            ValClass::PointerConcrete
        };
    }
    if let Some(origin) = h.unknown_origin(v) {
        return ValClass::Unknown(origin);
    }
    if h.custom_of(v).is_some() {
        return ValClass::Custom;
    }
    if h.composite_obj(v).is_some() {
        return ValClass::Composite;
    }
    ValClass::Sentinel
}

impl<'a> Cmp<'a> {
    fn schedule(&mut self, v1: ValId, v2: ValId) {
        if self.scheduled.insert((v1, v2)) {
            self.wl.push_back((v1, v2));
        }
    }

    /// Match a single value pair against the substitution built so far
    fn match_values(&mut self, v1: ValId, v2: ValId) -> bool {
        if v1.0 <= 0 || v2.0 <= 0 {
            // sentinels must match by identity
            return v1 == v2;
        }
        let c1 = classify(self.h1, v1);
        let c2 = classify(self.h2, v2);
        if c1 != c2 {
            return false;
        }
        if c1 == ValClass::Custom {
            // custom values compare by payload, outside the renaming
            return self.h1.custom_of(v1) == self.h2.custom_of(v2);
        }

        // canonical order before the lookup keeps the substitution bijective
        let (a, b) = if v1 <= v2 { (v1, v2) } else { (v2, v1) };
        match self.subst.get(&a) {
            Some(&bound) => {
                if bound != b {
                    return false;
                }
            }
            None => {
                self.subst.insert(a, b);
            }
        }
        match self.fwd.get(&v1) {
            Some(&bound) => {
                if bound != v2 {
                    return false;
                }
            }
            None => {
                self.fwd.insert(v1, v2);
            }
        }
        match self.rev.get(&v2) {
            Some(&bound) => {
                if bound != v1 {
                    return false;
                }
            }
            None => {
                self.rev.insert(v2, v1);
            }
        }
        true
    }

    /// The disequality neighbourhoods of a matched pair must agree in size
    fn match_preds(&self, v1: ValId, v2: ValId) -> bool {
        self.h1.gather_related_values(v1).len() == self.h2.gather_related_values(v2).len()
    }

    /// Compare the object-level attributes of two pointer targets
    fn cmp_objects(&self, o1: ObjId, o2: ObjId) -> bool {
        let (h1, h2) = (self.h1, self.h2);
        if h1.kind_of(o1) != h2.kind_of(o2) {
            return false;
        }
        if h1.storage_class(o1) != h2.storage_class(o2) {
            return false;
        }
        if h1.obj_size(o1) != h2.obj_size(o2) {
            return false;
        }
        if h1.proto_level(o1) != h2.proto_level(o2) {
            return false;
        }
        if h1.prog_var_of(o1) != h2.prog_var_of(o2) {
            return false;
        }
        match (h1.estimated_type(o1), h2.estimated_type(o2)) {
            (Some(t1), Some(t2)) => {
                if h1.stor().type_of(t1) != h2.stor().type_of(t2) {
                    return false;
                }
            }
            (None, None) => {}
            _ => return false,
        }
        match (h1.seg_data(o1), h2.seg_data(o2)) {
            (Some(s1), Some(s2)) => {
                if s1.head != s2.head
                    || s1.binder.off != s2.binder.off
                    || s1.peer.map(|p| p.off) != s2.peer.map(|p| p.off)
                    || s1.min_len != s2.min_len
                {
                    return false;
                }
            }
            (None, None) => {}
            _ => return false,
        }
        true
    }

    /// Schedule the stored contents of two objects pairwise. The live-field
    /// and uniform-block skeletons must agree exactly.
    fn schedule_obj_contents(&mut self, o1: ObjId, o2: ObjId) -> bool {
        let f1 = self.h1.live_fields(o1);
        let f2 = self.h2.live_fields(o2);
        if f1.len() != f2.len() {
            return false;
        }
        for (((off1, ty1), v1), ((off2, ty2), v2)) in f1.into_iter().zip(f2) {
            if off1 != off2 {
                return false;
            }
            if self.h1.stor().type_of(ty1) != self.h2.stor().type_of(ty2) {
                return false;
            }
            self.schedule(v1, v2);
        }
        let u1 = self.h1.uniform_blocks(o1);
        let u2 = self.h2.uniform_blocks(o2);
        if u1.len() != u2.len() {
            return false;
        }
        for ((off1, b1), (off2, b2)) in u1.into_iter().zip(u2) {
            if off1 != off2 || b1.size != b2.size {
                return false;
            }
            self.schedule(b1.template, b2.template);
        }
        true
    }

    fn run(&mut self) -> bool {
        while let Some((v1, v2)) = self.wl.pop_front() {
            if !self.match_preds(v1, v2) {
                return false;
            }
            if !self.match_values(v1, v2) {
                return false;
            }
            if v1.0 <= 0 {
                continue;
            }
            match classify(self.h1, v1) {
                ValClass::Custom | ValClass::Unknown(_) | ValClass::PointerDangling => {
                    // nothing further to dig
                    continue;
                }
                ValClass::Composite => {
                    let c1 = self.h1.composite_obj(v1).unwrap();
                    let c2 = self.h2.composite_obj(v2).unwrap();
                    if !self.cmp_objects(c1, c2) {
                        return false;
                    }
                    if !self.dig_composite(c1, c2) {
                        return false;
                    }
                }
                ValClass::PointerConcrete | ValClass::PointerAbstract => {
                    let (r1, off1) = self.h1.ptr_target(v1).unwrap();
                    let (r2, off2) = self.h2.ptr_target(v2).unwrap();
                    if off1 != off2 {
                        return false;
                    }
                    if !self.cmp_objects(r1, r2) {
                        return false;
                    }
                    if !self.schedule_obj_contents(r1, r2) {
                        return false;
                    }
                }
                ValClass::Sentinel => {}
            }
        }
        true
    }

    /// Recurse into a composite pair by the declared struct layout
    fn dig_composite(&mut self, o1: ObjId, o2: ObjId) -> bool {
        let ty1 = match self.h1.estimated_type(o1) {
            Some(t) => t,
            None => return self.schedule_obj_contents(o1, o2),
        };
        let desc = self.h1.stor().type_of(ty1).clone();
        if desc.kind != TypeKind::Struct {
            return self.schedule_obj_contents(o1, o2);
        }
        // struct fields in declaration order; leaves compared as values
        for item in &desc.items {
            let item_kind = self.h1.stor().type_of(item.ty).kind;
            if item_kind == TypeKind::Struct {
                // flattened layout: nested items resolve through the same
                // object at shifted offsets, which schedule_obj_contents
                // already covers
                continue;
            }
            let v1 = self.h1.try_read_field(o1, item.off, item.ty);
            let v2 = self.h2.try_read_field(o2, item.off, item.ty);
            match (v1, v2) {
                (Some(v1), Some(v2)) => self.schedule(v1, v2),
                (None, None) => {}
                _ => return false,
            }
        }
        self.schedule_obj_contents(o1, o2)
    }

    /// The final pass over stored disequalities: counts must match and every
    /// pair with both endpoints renamed must map onto a stored pair.
    fn check_neqs(&self) -> bool {
        if self.h1.neq_count() != self.h2.neq_count() {
            return false;
        }
        for (a, b) in self.h1.gather_neqs() {
            let map = |v: ValId| -> Option<ValId> {
                if v.0 <= 0 {
                    Some(v)
                } else {
                    self.fwd.get(&v).copied()
                }
            };
            if let (Some(a2), Some(b2)) = (map(a), map(b)) {
                if !self.h2.has_neq(a2, b2) {
                    return false;
                }
            }
        }
        true
    }
}

/// Decide isomorphism of two heaps. An equivalence: reflexive, symmetric,
/// transitive on the heaps one analysis produces.
pub fn are_equal(h1: &SymHeap, h2: &SymHeap) -> bool {
    let vars1 = h1.gather_program_vars();
    let vars2 = h2.gather_program_vars();
    if vars1.len() != vars2.len() {
        return false;
    }
    if vars1
        .iter()
        .zip(vars2.iter())
        .any(|((var1, _), (var2, _))| var1 != var2)
    {
        // different sets of program variables; no chance of isomorphism
        return false;
    }

    let mut cmp = Cmp {
        h1,
        h2,
        subst: Default::default(),
        fwd: Default::default(),
        rev: Default::default(),
        wl: Default::default(),
        scheduled: Default::default(),
    };

    for ((_, o1), (_, o2)) in vars1.into_iter().zip(vars2) {
        if !cmp.cmp_objects(o1, o2) {
            return false;
        }
        if !cmp.schedule_obj_contents(o1, o2) {
            return false;
        }
    }

    cmp.run() && cmp.check_neqs()
}
