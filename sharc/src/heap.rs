//! The symbolic heap: a typed graph of values and objects over-approximating
//! a set of concrete program heaps.
//!
//! Entities live in arenas and are addressed by stable positive integer ids;
//! non-positive ids are sentinels. All relations (live fields, usage counts,
//! disequalities, interned addresses) are indexed outside the entities, so the
//! graph may be freely cyclic and cloning a heap is plain arena duplication.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::storage::{ProgVar, Storage, TypeId, TypeKind};
use crate::trace;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Id of a value within one [`SymHeap`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ValId(pub i32);

/// Id of an object within one [`SymHeap`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ObjId(pub i32);

/// The null pointer (also integral zero)
pub const VAL_NULL: ValId = ValId(0);
/// The boolean true value
pub const VAL_TRUE: ValId = ValId(-1);
/// Result of an operation that produced no usable value
pub const VAL_INVALID: ValId = ValId(-2);

/// The per-function return destination
pub const OBJ_RETURN: ObjId = ObjId(0);
/// No object
pub const OBJ_INVALID: ObjId = ObjId(-1);

impl ValId {
    pub fn is_sentinel(self) -> bool {
        self.0 <= 0
    }
}

/// An integer range `[lo, hi]` with an alignment hint. Singular when
/// `lo == hi`. Doubles as the size range of objects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct IntRange {
    pub lo: i64,
    pub hi: i64,
    pub align: i64,
}

impl IntRange {
    pub fn singular(n: i64) -> Self {
        IntRange {
            lo: n,
            hi: n,
            align: 1,
        }
    }

    pub fn is_singular(&self) -> bool {
        self.lo == self.hi
    }

    /// The singular member, if there is exactly one
    pub fn as_singular(&self) -> Option<i64> {
        self.is_singular().then(|| self.lo)
    }

    /// Whether the two ranges share no member
    pub fn disjoint_from(&self, other: &IntRange) -> bool {
        self.hi < other.lo || other.hi < self.lo
    }
}

/// Where an unknown value came from. Two unknowns are equal only to
/// themselves; the origin survives for diagnostics and safety checks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum UnknownOrigin {
    /// Havoc'd by an opaque assignment
    Assigned,
    /// No origin information at all
    Unknown,
    /// Produced by a read straddling differently-typed live fields
    Reinterpret,
    /// Produced by a read through a destroyed or invalid target
    DerefFailed,
    /// Uninitialized automatic (or static) storage
    Stack,
    /// Uninitialized heap storage
    Heap,
}

/// A custom (interpreted) value
#[derive(Clone, Debug)]
pub enum CustomValue {
    Int(IntRange),
    Real(f64),
    Fnc(u32),
    Str(String),
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        use CustomValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a == b,
            (Real(a), Real(b)) => a.to_bits() == b.to_bits(),
            (Fnc(a), Fnc(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum ValueCore {
    Pointer { root: ObjId, off: IntRange },
    Unknown { origin: UnknownOrigin },
    Custom(CustomValue),
    Composite { obj: ObjId },
}

/// Storage class of an object
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum StorageClass {
    Static,
    OnStack,
    OnHeap,
    Invalid,
    Unknown,
}

/// Segment discriminator of an object
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum ObjKind {
    /// A concrete region (exactly one concrete object)
    Region,
    /// Singly-linked list segment
    Sls,
    /// Doubly-linked list segment (one end of the peer pair)
    Dls,
    /// Either a single object or null
    ObjOrNull,
    /// A possibly-empty proxy reaching through to its target
    SeeThrough,
    /// A see-through proxy with two outgoing links
    SeeThrough2n,
}

impl ObjKind {
    pub fn is_abstract(self) -> bool {
        !matches!(self, ObjKind::Region)
    }
}

/// A selector: a field position inside an object
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Selector {
    pub off: i64,
    pub ty: TypeId,
}

/// Binding of a segment's internal pointers.
///
/// Each DLS end stores its own outward `binder` selector and the `peer`
/// selector crossing to the opposite end; the two ends of one segment carry
/// mirrored descriptors. SLS segments have no peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SegData {
    /// Offset of the list node within the object (0 for plain nodes)
    pub head: i64,
    /// Outgoing selector of this end
    pub binder: Selector,
    /// Selector crossing to the opposite end (DLS only)
    pub peer: Option<Selector>,
    /// Lower bound on the number of concrete nodes represented
    pub min_len: u8,
}

/// A range of an object filled with copies of a single template value
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UniBlock {
    pub size: i64,
    pub template: ValId,
}

#[derive(Clone)]
struct HeapObj {
    storage: StorageClass,
    ty: Option<TypeId>,
    size: IntRange,
    kind: ObjKind,
    seg: Option<SegData>,
    proto_level: u32,
    var: Option<ProgVar>,
    fields: BTreeMap<(i64, TypeId), ValId>,
    uniform: BTreeMap<i64, UniBlock>,
}

/// A contract violation inside the engine, or an infeasible state.
///
/// `Internal` marks a bug in the analyzer (never in the analyzed program) and
/// is fatal for the current function; `Contradiction` marks a state that
/// became infeasible and should simply be dropped by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EngineError {
    Internal(&'static str),
    Contradiction,
}

/// The symbolic heap. Logically a value type: clone on fork, mutate in place.
#[derive(Clone)]
pub struct SymHeap {
    stor: Rc<Storage>,
    vals: Vec<ValueCore>,
    objs: Vec<Option<HeapObj>>,
    addr_index: UnorderedMap<(i32, i64), ValId>,
    comp_index: UnorderedMap<i32, ValId>,
    usage: UnorderedMap<ValId, u32>,
    neqs: UnorderedSet<(ValId, ValId)>,
    vars: UnorderedMap<ProgVar, ObjId>,
    ret: Option<ObjId>,
    trace: Rc<trace::Node>,
}

fn norm_pair(a: ValId, b: ValId) -> (ValId, ValId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl SymHeap {
    pub fn new(stor: Rc<Storage>) -> Self {
        Self {
            stor,
            vals: vec![],
            objs: vec![],
            addr_index: Default::default(),
            comp_index: Default::default(),
            usage: Default::default(),
            neqs: Default::default(),
            vars: Default::default(),
            ret: None,
            trace: trace::Node::root(),
        }
    }

    pub fn stor(&self) -> &Rc<Storage> {
        &self.stor
    }

    pub fn trace(&self) -> &Rc<trace::Node> {
        &self.trace
    }

    pub fn set_trace(&mut self, node: Rc<trace::Node>) {
        self.trace = node;
    }

    // ---------------------------------------------------------- entity access

    fn resolve(&self, o: ObjId) -> Option<usize> {
        let o = if o == OBJ_RETURN { self.ret? } else { o };
        if o.0 <= 0 {
            return None;
        }
        let idx = (o.0 - 1) as usize;
        match self.objs.get(idx) {
            Some(Some(_)) => Some(idx),
            _ => None,
        }
    }

    fn obj(&self, o: ObjId) -> Option<&HeapObj> {
        self.resolve(o).map(|i| self.objs[i].as_ref().unwrap())
    }

    fn obj_mut(&mut self, o: ObjId) -> Option<&mut HeapObj> {
        let i = self.resolve(o)?;
        self.objs[i].as_mut()
    }

    fn core(&self, v: ValId) -> Option<&ValueCore> {
        if v.0 <= 0 {
            return None;
        }
        self.vals.get((v.0 - 1) as usize)
    }

    fn alloc_val(&mut self, core: ValueCore) -> ValId {
        self.vals.push(core);
        ValId(self.vals.len() as i32)
    }

    fn alloc_obj(&mut self, obj: HeapObj) -> ObjId {
        self.objs.push(Some(obj));
        ObjId(self.objs.len() as i32)
    }

    /// Whether `o` refers to a live object of this heap
    pub fn valid(&self, o: ObjId) -> bool {
        self.resolve(o).is_some()
    }

    /// Number of live entities; the cost driver for heap cloning
    pub fn entity_count(&self) -> usize {
        self.vals.len() + self.objs.iter().flatten().count()
    }

    // ------------------------------------------------------- object lifecycle

    /// Allocate a fresh heap-class object of the given size
    pub fn create_heap_obj(&mut self, size: IntRange, ty: Option<TypeId>) -> ObjId {
        self.alloc_obj(HeapObj {
            storage: StorageClass::OnHeap,
            ty,
            size,
            kind: ObjKind::Region,
            seg: None,
            proto_level: 0,
            var: None,
            fields: Default::default(),
            uniform: Default::default(),
        })
    }

    fn create_var_obj(&mut self, var: ProgVar, storage: StorageClass) -> ObjId {
        let ty = self.stor.var_info(var).ty;
        let size = IntRange::singular(self.stor.type_of(ty).size);
        let o = self.alloc_obj(HeapObj {
            storage,
            ty: Some(ty),
            size,
            kind: ObjKind::Region,
            seg: None,
            proto_level: 0,
            var: Some(var),
            fields: Default::default(),
            uniform: Default::default(),
        });
        self.vars.insert(var, o);
        o
    }

    /// Allocate the automatic-storage object backing a program variable
    pub fn create_stack_obj(&mut self, var: ProgVar) -> ObjId {
        self.create_var_obj(var, StorageClass::OnStack)
    }

    /// Allocate the static-storage object backing a program variable
    pub fn create_static_obj(&mut self, var: ProgVar) -> ObjId {
        self.create_var_obj(var, StorageClass::Static)
    }

    /// Materialize the per-function return destination ([`OBJ_RETURN`])
    pub fn materialize_return(&mut self, ty: TypeId) -> ObjId {
        let size = IntRange::singular(self.stor.type_of(ty).size);
        let o = self.alloc_obj(HeapObj {
            storage: StorageClass::OnStack,
            ty: Some(ty),
            size,
            kind: ObjKind::Region,
            seg: None,
            proto_level: 0,
            var: None,
            fields: Default::default(),
            uniform: Default::default(),
        });
        self.ret = Some(o);
        OBJ_RETURN
    }

    /// Destroy `o`. Its id becomes invalid; addresses held elsewhere keep
    /// existing but read through to `Unknown/DerefFailed`.
    pub fn destroy(&mut self, o: ObjId) -> Result<(), EngineError> {
        let idx = self
            .resolve(o)
            .ok_or(EngineError::Internal("destroy of an invalid object"))?;
        let obj = self.objs[idx].take().unwrap();
        for (_, v) in obj.fields {
            self.dec_usage(v);
        }
        for (_, ub) in obj.uniform {
            self.dec_usage(ub.template);
        }
        if let Some(var) = obj.var {
            self.vars.remove(&var);
        }
        if self.ret == Some(ObjId(idx as i32 + 1)) {
            self.ret = None;
        }
        Ok(())
    }

    // ---------------------------------------------------------------- usage

    fn inc_usage(&mut self, v: ValId) {
        if v.0 > 0 {
            *self.usage.entry(v).or_insert(0) += 1;
        }
    }

    fn dec_usage(&mut self, v: ValId) {
        if v.0 > 0 {
            match self.usage.get_mut(&v) {
                Some(n) if *n > 1 => *n -= 1,
                Some(_) => {
                    self.usage.remove(&v);
                }
                None => debug_assert!(false, "usage underflow"),
            }
        }
    }

    /// How many live fields store exactly `v` (identity, not equality)
    pub fn used_by_count(&self, v: ValId) -> u32 {
        self.usage.get(&v).copied().unwrap_or(0)
    }

    // ------------------------------------------------------------- addresses

    /// The interned address of `o + off`. Returns [`VAL_INVALID`] once `o` has
    /// been destroyed.
    pub fn addr_of(&mut self, o: ObjId, off: i64) -> ValId {
        if !self.valid(o) {
            return VAL_INVALID;
        }
        let key = (o.0, off);
        if let Some(&v) = self.addr_index.get(&key) {
            return v;
        }
        let v = self.alloc_val(ValueCore::Pointer {
            root: o,
            off: IntRange::singular(off),
        });
        self.addr_index.insert(key, v);
        v
    }

    /// The interned address of `o + off`, if it was ever created
    pub fn try_addr_of(&self, o: ObjId, off: i64) -> Option<ValId> {
        self.addr_index.get(&(o.0, off)).copied()
    }

    /// Allocate a pointer value with a non-singular offset range
    pub fn create_ptr_range(&mut self, root: ObjId, off: IntRange) -> ValId {
        if let Some(off) = off.as_singular() {
            return self.addr_of(root, off);
        }
        self.alloc_val(ValueCore::Pointer { root, off })
    }

    /// Allocate a fresh unknown value of the given origin
    pub fn create_unknown(&mut self, origin: UnknownOrigin) -> ValId {
        self.alloc_val(ValueCore::Unknown { origin })
    }

    /// Allocate (or reuse) a custom value
    pub fn create_custom(&mut self, c: CustomValue) -> ValId {
        // custom values are interned by payload so that identical constants
        // share an id
        for (i, core) in self.vals.iter().enumerate() {
            if let ValueCore::Custom(existing) = core {
                if *existing == c {
                    return ValId(i as i32 + 1);
                }
            }
        }
        self.alloc_val(ValueCore::Custom(c))
    }

    /// The interned composite value standing for the whole of object `o`
    pub fn value_of_composite(&mut self, o: ObjId) -> ValId {
        if !self.valid(o) {
            return VAL_INVALID;
        }
        if let Some(&v) = self.comp_index.get(&o.0) {
            return v;
        }
        let v = self.alloc_val(ValueCore::Composite { obj: o });
        self.comp_index.insert(o.0, v);
        v
    }

    /// Root and offset of a pointer value
    pub fn ptr_target(&self, v: ValId) -> Option<(ObjId, IntRange)> {
        match self.core(v)? {
            ValueCore::Pointer { root, off } => Some((*root, *off)),
            _ => None,
        }
    }

    /// The root object a value points at (offset 0 only); [`OBJ_INVALID`]
    /// otherwise
    pub fn points_to(&self, v: ValId) -> ObjId {
        match self.ptr_target(v) {
            Some((root, off)) if off.as_singular() == Some(0) => root,
            _ => OBJ_INVALID,
        }
    }

    /// Origin tag of an unknown value
    pub fn unknown_origin(&self, v: ValId) -> Option<UnknownOrigin> {
        match self.core(v)? {
            ValueCore::Unknown { origin } => Some(*origin),
            _ => None,
        }
    }

    /// Payload of a custom value
    pub fn custom_of(&self, v: ValId) -> Option<&CustomValue> {
        match self.core(v)? {
            ValueCore::Custom(c) => Some(c),
            _ => None,
        }
    }

    /// The object a composite value stands for
    pub fn composite_obj(&self, v: ValId) -> Option<ObjId> {
        match self.core(v)? {
            ValueCore::Composite { obj } => Some(*obj),
            _ => None,
        }
    }

    // ----------------------------------------------------------- field access

    fn field_size(&self, ty: TypeId) -> i64 {
        self.stor.type_of(ty).size
    }

    /// The value stored at `(o, off, ty)`, if a matching live field exists.
    /// Never materializes anything.
    pub fn try_read_field(&self, o: ObjId, off: i64, ty: TypeId) -> Option<ValId> {
        self.obj(o)?.fields.get(&(off, ty)).copied()
    }

    /// Read the field `(o, off, ty)`, materializing a value if none is live
    /// yet: the uniform-block template when the read lies fully inside a
    /// block, `Unknown/Reinterpret` when it straddles differently-typed live
    /// fields, `Unknown/DerefFailed` through a dead object, and an
    /// uninitialized-storage unknown otherwise.
    pub fn read_field(&mut self, o: ObjId, off: i64, ty: TypeId) -> ValId {
        if !self.valid(o) {
            return self.create_unknown(UnknownOrigin::DerefFailed);
        }
        if let Some(v) = self.try_read_field(o, off, ty) {
            return v;
        }
        let size = self.field_size(ty);
        let (straddles, uni, storage) = {
            let obj = self.obj(o).unwrap();
            let straddles = obj.fields.iter().any(|(&(foff, fty), _)| {
                let fsize = self.field_size(fty);
                foff < off + size && off < foff + fsize
            });
            let uni = obj
                .uniform
                .iter()
                .find(|(&boff, ub)| boff <= off && off + size <= boff + ub.size)
                .map(|(_, ub)| ub.template);
            (straddles, uni, obj.storage)
        };
        if straddles {
            let v = self.create_unknown(UnknownOrigin::Reinterpret);
            self.set_field_raw(o, off, ty, v);
            return v;
        }

        if let Some(template) = uni {
            self.set_field_raw(o, off, ty, template);
            return template;
        }

        if self.stor.type_of(ty).kind == TypeKind::Struct {
            return self.value_of_composite(o);
        }

        let origin = match storage {
            StorageClass::OnHeap => UnknownOrigin::Heap,
            StorageClass::OnStack | StorageClass::Static => UnknownOrigin::Stack,
            _ => UnknownOrigin::Unknown,
        };
        let v = self.create_unknown(origin);
        self.set_field_raw(o, off, ty, v);
        v
    }

    /// Read a pointer-typed field at `o + off`; falls back to the generic
    /// pointer type when no typed field is live there.
    pub fn value_of_ptr(&mut self, o: ObjId, off: i64) -> ValId {
        let found = self.obj(o).and_then(|obj| {
            obj.fields
                .iter()
                .find(|(&(foff, fty), _)| {
                    foff == off && self.stor.type_of(fty).kind == TypeKind::Ptr
                })
                .map(|(_, &v)| v)
        });
        if let Some(v) = found {
            return v;
        }
        let ty = self.stor.ptr_type();
        self.read_field(o, off, ty)
    }

    /// Like [`Self::value_of_ptr`] but never materializes
    pub fn try_value_of_ptr(&self, o: ObjId, off: i64) -> Option<ValId> {
        let obj = self.obj(o)?;
        obj.fields
            .iter()
            .find(|(&(foff, fty), _)| foff == off && self.stor.type_of(fty).kind == TypeKind::Ptr)
            .map(|(_, &v)| v)
    }

    /// Insert without any overlap handling
    fn set_field_raw(&mut self, o: ObjId, off: i64, ty: TypeId, v: ValId) {
        self.inc_usage(v);
        let prev = self
            .obj_mut(o)
            .expect("set_field_raw on an invalid object")
            .fields
            .insert((off, ty), v);
        if let Some(prev) = prev {
            self.dec_usage(prev);
        }
    }

    /// Write `v` into the field `(o, off, ty)`. Live fields whose bytes
    /// overlap the written range are invalidated; uniform blocks are split
    /// around it.
    pub fn write_field(&mut self, o: ObjId, off: i64, ty: TypeId, v: ValId) -> Result<(), EngineError> {
        if !self.valid(o) {
            return Err(EngineError::Internal("write through an invalid object"));
        }
        if v == VAL_INVALID {
            return Err(EngineError::Internal("write of VAL_INVALID"));
        }
        let size = self.field_size(ty);

        let doomed: Vec<(i64, TypeId)> = self
            .obj(o)
            .unwrap()
            .fields
            .keys()
            .copied()
            .filter(|&(foff, fty)| {
                (foff, fty) != (off, ty) && {
                    let fsize = self.field_size(fty);
                    foff < off + size && off < foff + fsize
                }
            })
            .collect();
        for key in doomed {
            let old = self.obj_mut(o).unwrap().fields.remove(&key).unwrap();
            self.dec_usage(old);
        }

        self.split_uniform(o, off, size);
        self.set_field_raw(o, off, ty, v);
        Ok(())
    }

    fn split_uniform(&mut self, o: ObjId, off: i64, size: i64) {
        let hits: Vec<(i64, UniBlock)> = self
            .obj(o)
            .unwrap()
            .uniform
            .iter()
            .filter(|(&boff, ub)| boff < off + size && off < boff + ub.size)
            .map(|(&boff, &ub)| (boff, ub))
            .collect();
        for (boff, ub) in hits {
            self.obj_mut(o).unwrap().uniform.remove(&boff);
            self.dec_usage(ub.template);
            if boff < off {
                let left = UniBlock {
                    size: off - boff,
                    template: ub.template,
                };
                self.inc_usage(ub.template);
                self.obj_mut(o).unwrap().uniform.insert(boff, left);
            }
            let bend = boff + ub.size;
            let wend = off + size;
            if wend < bend {
                let right = UniBlock {
                    size: bend - wend,
                    template: ub.template,
                };
                self.inc_usage(ub.template);
                self.obj_mut(o).unwrap().uniform.insert(wend, right);
            }
        }
    }

    /// Fill `[off, off+size)` of `o` with copies of `template` (the compact
    /// representation of zeroed or memset storage). Overlapping live fields
    /// are invalidated.
    pub fn write_uniform_block(
        &mut self,
        o: ObjId,
        off: i64,
        size: i64,
        template: ValId,
    ) -> Result<(), EngineError> {
        if !self.valid(o) {
            return Err(EngineError::Internal("uniform write through an invalid object"));
        }
        let doomed: Vec<(i64, TypeId)> = self
            .obj(o)
            .unwrap()
            .fields
            .keys()
            .copied()
            .filter(|&(foff, fty)| {
                let fsize = self.field_size(fty);
                foff < off + size && off < foff + fsize
            })
            .collect();
        for key in doomed {
            let old = self.obj_mut(o).unwrap().fields.remove(&key).unwrap();
            self.dec_usage(old);
        }
        self.split_uniform(o, off, size);
        self.inc_usage(template);
        self.obj_mut(o)
            .unwrap()
            .uniform
            .insert(off, UniBlock { size, template });
        Ok(())
    }

    /// All live fields of `o`, in (offset, type) order
    pub fn live_fields(&self, o: ObjId) -> Vec<((i64, TypeId), ValId)> {
        match self.obj(o) {
            Some(obj) => obj.fields.iter().map(|(&k, &v)| (k, v)).collect(),
            None => vec![],
        }
    }

    /// All uniform blocks of `o`, in offset order
    pub fn uniform_blocks(&self, o: ObjId) -> Vec<(i64, UniBlock)> {
        match self.obj(o) {
            Some(obj) => obj.uniform.iter().map(|(&k, &v)| (k, v)).collect(),
            None => vec![],
        }
    }

    /// All interned in-object addresses of `o` as `(offset, value)` pairs
    pub fn interned_addrs_of(&self, o: ObjId) -> Vec<(i64, ValId)> {
        let mut out: Vec<(i64, ValId)> = self
            .addr_index
            .iter()
            .filter(|(&(oid, _), _)| oid == o.0)
            .map(|(&(_, off), &v)| (off, v))
            .collect();
        out.sort();
        out
    }

    // ------------------------------------------------------ object properties

    pub fn kind_of(&self, o: ObjId) -> ObjKind {
        self.obj(o).map(|x| x.kind).unwrap_or(ObjKind::Region)
    }

    pub fn storage_class(&self, o: ObjId) -> StorageClass {
        self.obj(o).map(|x| x.storage).unwrap_or(StorageClass::Invalid)
    }

    pub fn estimated_type(&self, o: ObjId) -> Option<TypeId> {
        self.obj(o)?.ty
    }

    pub fn set_estimated_type(&mut self, o: ObjId, ty: TypeId) {
        if let Some(obj) = self.obj_mut(o) {
            obj.ty = Some(ty);
        }
    }

    pub fn obj_size(&self, o: ObjId) -> IntRange {
        self.obj(o).map(|x| x.size).unwrap_or(IntRange::singular(0))
    }

    pub fn prog_var_of(&self, o: ObjId) -> Option<ProgVar> {
        self.obj(o)?.var
    }

    pub fn proto_level(&self, o: ObjId) -> u32 {
        self.obj(o).map(|x| x.proto_level).unwrap_or(0)
    }

    pub fn set_proto_level(&mut self, o: ObjId, level: u32) {
        if let Some(obj) = self.obj_mut(o) {
            obj.proto_level = level;
        }
    }

    /// The object backing a program variable, or [`OBJ_INVALID`]
    pub fn obj_by_var(&self, var: ProgVar) -> ObjId {
        self.vars.get(&var).copied().unwrap_or(OBJ_INVALID)
    }

    /// All program-visible variables with their backing objects, sorted by uid
    pub fn gather_program_vars(&self) -> Vec<(ProgVar, ObjId)> {
        let mut out: Vec<(ProgVar, ObjId)> = self.vars.iter().map(|(&k, &v)| (k, v)).collect();
        out.sort();
        out
    }

    /// All live root objects, in arena order
    pub fn gather_root_objs(&self) -> Vec<ObjId> {
        self.objs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_some())
            .map(|(i, _)| ObjId(i as i32 + 1))
            .collect()
    }

    // ------------------------------------------------------ equality reasoning

    /// Decide whether `v1` and `v2` are equal: `Some(true)` when provably
    /// equal, `Some(false)` when a disequality holds (stored, or implied by
    /// the structure), `None` otherwise.
    pub fn prove_eq(&self, v1: ValId, v2: ValId) -> Option<bool> {
        if v1 == v2 {
            return Some(true);
        }
        if self.neqs.contains(&norm_pair(v1, v2)) {
            return Some(false);
        }
        if v1.0 <= 0 && v2.0 <= 0 {
            // distinct sentinels never alias
            return Some(false);
        }
        if v1.0 <= 0 || v2.0 <= 0 {
            let (s, p) = if v1.0 <= 0 { (v1, v2) } else { (v2, v1) };
            if s == VAL_NULL {
                if let Some((root, _)) = self.ptr_target(p) {
                    // the address of a live concrete region is non-null; an
                    // abstract segment's address may collapse to its next
                    // value, so stay agnostic there
                    if self.valid(root) && !self.kind_of(root).is_abstract() {
                        return Some(false);
                    }
                }
            }
            return None;
        }
        match (self.core(v1), self.core(v2)) {
            (Some(ValueCore::Custom(a)), Some(ValueCore::Custom(b))) => match (a, b) {
                (CustomValue::Int(ra), CustomValue::Int(rb)) => {
                    if ra.as_singular().is_some() && ra == rb {
                        Some(true)
                    } else if ra.disjoint_from(rb) {
                        Some(false)
                    } else {
                        None
                    }
                }
                _ => Some(a == b),
            },
            (
                Some(ValueCore::Pointer { root: r1, off: o1 }),
                Some(ValueCore::Pointer { root: r2, off: o2 }),
            ) => {
                if r1 == r2 {
                    if o1.as_singular().is_some() && o1 == o2 {
                        Some(true)
                    } else if o1.disjoint_from(o2) {
                        Some(false)
                    } else {
                        None
                    }
                } else if self.valid(*r1)
                    && self.valid(*r2)
                    && !self.kind_of(*r1).is_abstract()
                    && !self.kind_of(*r2).is_abstract()
                {
                    // two distinct concrete allocations never alias
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Record the disequality `v1 != v2`. Inserting a contradiction (a value
    /// against itself, or against something already proven equal) fails.
    pub fn add_neq(&mut self, v1: ValId, v2: ValId) -> Result<(), EngineError> {
        if v1 == VAL_INVALID || v2 == VAL_INVALID {
            return Err(EngineError::Internal("neq over VAL_INVALID"));
        }
        if self.prove_eq(v1, v2) == Some(true) {
            return Err(EngineError::Contradiction);
        }
        self.neqs.insert(norm_pair(v1, v2));
        Ok(())
    }

    /// Drop the stored disequality `v1 != v2`, if present
    pub fn del_neq(&mut self, v1: ValId, v2: ValId) {
        self.neqs.remove(&norm_pair(v1, v2));
    }

    /// Whether the disequality `v1 != v2` is stored explicitly
    pub fn has_neq(&self, v1: ValId, v2: ValId) -> bool {
        self.neqs.contains(&norm_pair(v1, v2))
    }

    /// All values related to `v` by a stored disequality, sorted
    pub fn gather_related_values(&self, v: ValId) -> Vec<ValId> {
        let mut out: Vec<ValId> = self
            .neqs
            .iter()
            .filter_map(|&(a, b)| {
                if a == v {
                    Some(b)
                } else if b == v {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        out.sort();
        out
    }

    /// Number of stored disequalities
    pub fn neq_count(&self) -> usize {
        self.neqs.len()
    }

    /// All stored disequalities as normalized pairs, sorted
    pub fn gather_neqs(&self) -> Vec<(ValId, ValId)> {
        let mut out: Vec<(ValId, ValId)> = self.neqs.iter().copied().collect();
        out.sort();
        out
    }

    // ----------------------------------------------------------- replacement

    /// Substitute every occurrence of `old` (live fields, uniform templates,
    /// predicates) by `new`.
    pub fn val_replace(&mut self, old: ValId, new: ValId) {
        if old == new {
            return;
        }
        let objs: Vec<ObjId> = self.gather_root_objs();
        for o in objs {
            let hits: Vec<(i64, TypeId)> = self
                .obj(o)
                .unwrap()
                .fields
                .iter()
                .filter(|(_, &v)| v == old)
                .map(|(&k, _)| k)
                .collect();
            for key in hits {
                self.obj_mut(o).unwrap().fields.insert(key, new);
                self.dec_usage(old);
                self.inc_usage(new);
            }
            let uhits: Vec<i64> = self
                .obj(o)
                .unwrap()
                .uniform
                .iter()
                .filter(|(_, ub)| ub.template == old)
                .map(|(&k, _)| k)
                .collect();
            for boff in uhits {
                self.obj_mut(o).unwrap().uniform.get_mut(&boff).unwrap().template = new;
                self.dec_usage(old);
                self.inc_usage(new);
            }
        }
        let remapped: Vec<(ValId, ValId)> = self
            .neqs
            .iter()
            .filter(|&&(a, b)| a == old || b == old)
            .copied()
            .collect();
        for (a, b) in remapped {
            self.neqs.remove(&(a, b));
            let a2 = if a == old { new } else { a };
            let b2 = if b == old { new } else { b };
            if a2 != b2 {
                self.neqs.insert(norm_pair(a2, b2));
            } else {
                trace!("val_replace dropped a reflexive neq"; "old" => old.0, "new" => new.0);
            }
        }
    }

    /// Replace `old` by `new` everywhere: every address into `old` is
    /// replaced by the matching address into `new`, then `old` is destroyed.
    /// Both must be live roots.
    pub fn obj_replace(&mut self, old: ObjId, new: ObjId) -> Result<(), EngineError> {
        if !self.valid(old) || !self.valid(new) {
            return Err(EngineError::Internal("obj_replace over an invalid object"));
        }
        if old == new {
            return Err(EngineError::Internal("obj_replace of an object with itself"));
        }
        for (off, old_addr) in self.interned_addrs_of(old) {
            let new_addr = self.addr_of(new, off);
            self.val_replace(old_addr, new_addr);
        }
        let comp = self.comp_index.get(&old.0).copied();
        if let Some(comp) = comp {
            let new_comp = self.value_of_composite(new);
            self.val_replace(comp, new_comp);
        }
        self.destroy(old)
    }

    /// Duplicate `o` (same field values, fresh identity and address)
    pub fn obj_dup(&mut self, o: ObjId) -> Result<ObjId, EngineError> {
        let obj = self
            .obj(o)
            .ok_or(EngineError::Internal("obj_dup of an invalid object"))?
            .clone();
        let vals: Vec<ValId> = obj
            .fields
            .values()
            .copied()
            .chain(obj.uniform.values().map(|ub| ub.template))
            .collect();
        let mut dup = obj;
        dup.var = None;
        let d = self.alloc_obj(dup);
        for v in vals {
            self.inc_usage(v);
        }
        Ok(d)
    }

    // -------------------------------------------------------------- segments

    /// Transition a concrete region into a list segment with the given
    /// binding; a fresh segment is non-empty by construction.
    pub fn abstract_as_seg(
        &mut self,
        o: ObjId,
        kind: ObjKind,
        seg: SegData,
    ) -> Result<(), EngineError> {
        if !kind.is_abstract() {
            return Err(EngineError::Internal("abstract_as_seg into a concrete kind"));
        }
        if kind == ObjKind::Dls && seg.peer.is_none() {
            return Err(EngineError::Internal("DLS without a peer selector"));
        }
        let obj = self
            .obj_mut(o)
            .ok_or(EngineError::Internal("abstract_as_seg of an invalid object"))?;
        if obj.kind != ObjKind::Region {
            return Err(EngineError::Internal("abstract_as_seg of an abstract object"));
        }
        obj.kind = kind;
        obj.seg = Some(seg);
        Ok(())
    }

    /// Make a segment concrete again (the last step of unrolling)
    pub fn set_concrete(&mut self, o: ObjId) -> Result<(), EngineError> {
        let obj = self
            .obj_mut(o)
            .ok_or(EngineError::Internal("set_concrete of an invalid object"))?;
        if obj.kind == ObjKind::Region {
            return Err(EngineError::Internal("set_concrete of a concrete object"));
        }
        obj.kind = ObjKind::Region;
        obj.seg = None;
        Ok(())
    }

    pub fn seg_data(&self, o: ObjId) -> Option<SegData> {
        self.obj(o)?.seg
    }

    /// Lower bound on the number of concrete nodes `o` stands for; a concrete
    /// region stands for exactly one.
    pub fn seg_min_len(&self, o: ObjId) -> u8 {
        match self.obj(o) {
            Some(obj) => obj.seg.map(|s| s.min_len).unwrap_or(1),
            None => 0,
        }
    }

    pub fn set_seg_min_len(&mut self, o: ObjId, min_len: u8) {
        if let Some(obj) = self.obj_mut(o) {
            if let Some(seg) = obj.seg.as_mut() {
                seg.min_len = min_len;
            }
        }
    }

    /// The opposite end of a DLS, or `o` itself for every other kind
    pub fn peer_of(&self, o: ObjId) -> ObjId {
        let seg = match self.seg_data(o) {
            Some(seg) if self.kind_of(o) == ObjKind::Dls => seg,
            _ => return o,
        };
        let peer_sel = match seg.peer {
            Some(s) => s,
            None => return o,
        };
        match self.try_read_field(o, seg.head + peer_sel.off, peer_sel.ty) {
            Some(v) => {
                let tgt = self.points_to(v);
                if tgt == OBJ_INVALID {
                    o
                } else {
                    tgt
                }
            }
            None => o,
        }
    }

    /// Value of the outgoing (binder) pointer of segment end `o`
    pub fn seg_next_value(&mut self, o: ObjId) -> ValId {
        match self.seg_data(o) {
            Some(seg) => self.read_field(o, seg.head + seg.binder.off, seg.binder.ty),
            None => VAL_INVALID,
        }
    }

    // -------------------------------------------------------------- leak scan

    /// Heap-class objects unreachable from any stack/static root (the leak
    /// scan run after destructive operations).
    pub fn collect_junk(&self) -> Vec<ObjId> {
        let mut reached: UnorderedSet<i32> = Default::default();
        let mut worklist: Vec<ObjId> = self
            .gather_root_objs()
            .into_iter()
            .filter(|&o| {
                matches!(
                    self.storage_class(o),
                    StorageClass::OnStack | StorageClass::Static
                )
            })
            .collect();
        for o in &worklist {
            reached.insert(o.0);
        }
        while let Some(o) = worklist.pop() {
            for (_, v) in self.live_fields(o) {
                if let Some((root, _)) = self.ptr_target(v) {
                    if self.valid(root) && reached.insert(root.0) {
                        worklist.push(root);
                    }
                }
            }
        }
        self.gather_root_objs()
            .into_iter()
            .filter(|&o| self.storage_class(o) == StorageClass::OnHeap && !reached.contains(&o.0))
            .collect()
    }

    /// Validate the target of a `free()` call, classifying the defect when
    /// there is one. `free(NULL)` is a legal no-op signalled by `Ok(None)`.
    pub fn check_free_target(&self, v: ValId) -> Result<Option<ObjId>, crate::report::DefectKind> {
        use crate::report::DefectKind;
        if v == VAL_NULL {
            return Ok(None);
        }
        match self.ptr_target(v) {
            Some((root, off)) => {
                if !self.valid(root) {
                    return Err(DefectKind::DoubleFree);
                }
                if off.as_singular() != Some(0) {
                    return Err(DefectKind::DoubleFree);
                }
                if self.storage_class(root) != StorageClass::OnHeap {
                    return Err(DefectKind::DoubleFree);
                }
                Ok(Some(root))
            }
            None => Err(DefectKind::InvalidDeref),
        }
    }

    /// Classify a dereference of `v` before the executor reads through it
    pub fn check_deref_target(&self, v: ValId) -> Result<(ObjId, i64), crate::report::DefectKind> {
        use crate::report::DefectKind;
        if self.prove_eq(v, VAL_NULL) == Some(true) {
            return Err(DefectKind::NullDeref);
        }
        match self.ptr_target(v) {
            Some((root, off)) => {
                if !self.valid(root) {
                    return Err(DefectKind::InvalidDeref);
                }
                match off.as_singular() {
                    Some(off) => Ok((root, off)),
                    None => Err(DefectKind::InvalidDeref),
                }
            }
            None => Err(DefectKind::InvalidDeref),
        }
    }
}

impl std::fmt::Debug for SymHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut m = f.debug_map();
        for o in self.gather_root_objs() {
            let obj = self.obj(o).unwrap();
            m.entry(
                &format_args!("#{} {:?}/{:?}", o.0, obj.storage, obj.kind),
                &format_args!(
                    "fields={:?} seg={:?} var={:?}",
                    obj.fields, obj.seg, obj.var
                ),
            );
        }
        m.entry(&"neqs", &format_args!("{:?}", self.gather_neqs()));
        m.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::sll_program;

    #[test]
    fn addresses_are_interned() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let a = sh.addr_of(o, 0);
        let b = sh.addr_of(o, 0);
        let c = sh.addr_of(o, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(sh.points_to(a), o);
        assert_eq!(sh.points_to(c), OBJ_INVALID); // non-zero offset
    }

    #[test]
    fn usage_counts_track_identity() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let t = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let a = sh.addr_of(t, 0);
        assert_eq!(sh.used_by_count(a), 0);
        sh.write_field(o, 0, p.node_ptr, a).unwrap();
        assert_eq!(sh.used_by_count(a), 1);
        sh.write_field(o, 0, p.node_ptr, VAL_NULL).unwrap();
        assert_eq!(sh.used_by_count(a), 0);
    }

    #[test]
    fn overlapping_write_invalidates() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let t = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let a = sh.addr_of(t, 0);
        sh.write_field(o, 0, p.node_ptr, a).unwrap();

        // an 8-byte write at offset 4 straddles the pointer field
        let v = sh.create_custom(CustomValue::Int(IntRange::singular(7)));
        sh.write_field(o, 4, p.data_ty, v).unwrap();
        assert_eq!(sh.try_read_field(o, 0, p.node_ptr), None);
        assert_eq!(sh.used_by_count(a), 0);

        // a fresh read across the smashed layout reinterprets
        let r = sh.read_field(o, 0, p.node_ptr);
        assert_eq!(sh.unknown_origin(r), Some(UnknownOrigin::Reinterpret));
    }

    #[test]
    fn uniform_blocks_serve_and_split() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let zero = sh.create_custom(CustomValue::Int(IntRange::singular(0)));
        sh.write_uniform_block(o, 0, 16, zero).unwrap();

        // a read fully inside the block yields the template
        assert_eq!(sh.read_field(o, 8, p.data_ty), zero);

        // a write splits the block around the written range
        let t = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let a = sh.addr_of(t, 0);
        sh.write_field(o, 0, p.node_ptr, a).unwrap();
        let blocks = sh.uniform_blocks(o);
        assert!(blocks.iter().all(|&(off, _)| off >= 8));
    }

    #[test]
    fn reads_after_destroy_fail_gracefully() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        sh.destroy(o).unwrap();
        assert!(!sh.valid(o));
        assert_eq!(sh.addr_of(o, 0), VAL_INVALID);
        let v = sh.read_field(o, 0, p.node_ptr);
        assert_eq!(sh.unknown_origin(v), Some(UnknownOrigin::DerefFailed));
        assert_eq!(sh.destroy(o), Err(EngineError::Internal("destroy of an invalid object")));
    }

    #[test]
    fn neq_contradictions_are_rejected() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let a = sh.addr_of(o, 0);
        assert_eq!(sh.add_neq(a, a), Err(EngineError::Contradiction));
        sh.add_neq(a, VAL_NULL).unwrap();
        assert_eq!(sh.prove_eq(a, VAL_NULL), Some(false));
        sh.del_neq(a, VAL_NULL);
        // a live concrete region still cannot sit at null
        assert_eq!(sh.prove_eq(a, VAL_NULL), Some(false));
    }

    #[test]
    fn val_replace_rewrites_fields_and_predicates() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let u1 = sh.create_unknown(UnknownOrigin::Assigned);
        let u2 = sh.create_unknown(UnknownOrigin::Assigned);
        sh.write_field(o, 8, p.data_ty, u1).unwrap();
        sh.add_neq(u1, VAL_NULL).unwrap();

        sh.val_replace(u1, u2);
        assert_eq!(sh.try_read_field(o, 8, p.data_ty), Some(u2));
        assert_eq!(sh.used_by_count(u1), 0);
        assert_eq!(sh.used_by_count(u2), 1);
        assert!(sh.has_neq(u2, VAL_NULL));
        assert!(!sh.has_neq(u1, VAL_NULL));
    }

    #[test]
    fn obj_replace_redirects_addresses() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let keeper = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let old = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let new = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        let old_addr = sh.addr_of(old, 0);
        sh.write_field(keeper, 0, p.node_ptr, old_addr).unwrap();

        sh.obj_replace(old, new).unwrap();
        assert!(!sh.valid(old));
        let v = sh.try_read_field(keeper, 0, p.node_ptr).unwrap();
        assert_eq!(sh.points_to(v), new);
    }

    #[test]
    fn heap_clone_is_independent() {
        let p = sll_program();
        let mut sh = SymHeap::new(p.stor.clone());
        let o = sh.create_heap_obj(IntRange::singular(16), Some(p.node_ty));
        sh.write_field(o, 0, p.node_ptr, VAL_NULL).unwrap();

        let snapshot = sh.clone();
        sh.destroy(o).unwrap();
        assert!(!sh.valid(o));
        assert!(snapshot.valid(o));
        assert_eq!(snapshot.try_read_field(o, 0, p.node_ptr), Some(VAL_NULL));
    }
}
