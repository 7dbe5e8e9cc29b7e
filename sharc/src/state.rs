//! Per-location sets of symbolic heaps.

use crate::containers::unordered::UnorderedMap;
use crate::heap::SymHeap;
use crate::isomorphism::are_equal;
use crate::log::*;
use crate::trace;

/// An ordered set of symbolic heaps, deduplicated up to isomorphism.
///
/// Insertion order is preserved and observable through indices; `insert`
/// appends at the tail. Once a heap enters the union it is never removed.
#[derive(Clone, Default)]
pub struct SymHeapUnion {
    heaps: Vec<SymHeap>,
}

impl SymHeapUnion {
    pub fn new() -> Self {
        Self { heaps: vec![] }
    }

    pub fn len(&self) -> usize {
        self.heaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }

    /// The index of a heap isomorphic to `sh`, if the union holds one
    pub fn lookup(&self, sh: &SymHeap) -> Option<usize> {
        self.heaps.iter().position(|h| are_equal(h, sh))
    }

    /// Append `sh` unless an isomorphic heap is already present. Returns
    /// whether the union grew.
    // TODO: discard heaps subsumed by an already-present one (entailment),
    // not only exact isomorphic duplicates
    pub fn insert(&mut self, sh: SymHeap) -> bool {
        if let Some(idx) = self.lookup(&sh) {
            trace!("state union already covers the inserted heap"; "idx" => idx);
            return false;
        }
        self.heaps.push(sh);
        true
    }

    /// Merge every heap of `other` into `self`
    pub fn insert_union(&mut self, other: SymHeapUnion) -> bool {
        let mut grew = false;
        for sh in other.heaps {
            grew |= self.insert(sh);
        }
        grew
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymHeap> {
        self.heaps.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SymHeap> {
        self.heaps.iter_mut()
    }

    /// Collapse clone trace nodes on every member heap (used when loading a
    /// fixed point into the assembler, where value copies must keep sharing
    /// the original trace node).
    pub fn waive_clone_operation(&mut self) {
        for sh in &mut self.heaps {
            trace::waive_clone(sh);
        }
    }
}

impl std::ops::Index<usize> for SymHeapUnion {
    type Output = SymHeap;
    fn index(&self, idx: usize) -> &SymHeap {
        &self.heaps[idx]
    }
}

impl std::ops::IndexMut<usize> for SymHeapUnion {
    fn index_mut(&mut self, idx: usize) -> &mut SymHeap {
        &mut self.heaps[idx]
    }
}

/// The per-instruction fixed point the executor hands to the assembler:
/// for each instruction index, the set of heaps observed just before it.
#[derive(Default)]
pub struct StateByInsn {
    map: UnorderedMap<usize, SymHeapUnion>,
}

impl StateByInsn {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record `sh` at instruction `insn`; returns whether the set grew
    pub fn insert(&mut self, insn: usize, sh: SymHeap) -> bool {
        self.map.entry(insn).or_default().insert(sh)
    }

    pub fn get(&self, insn: usize) -> Option<&SymHeapUnion> {
        self.map.get(&insn)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
