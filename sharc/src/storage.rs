//! Read-only program representation handed over by the front-end.
//!
//! The analyzer never parses source code itself; it consumes a [`Storage`]
//! handle carrying functions, their control-flow graphs, a three-address-code
//! instruction stream, and structural type descriptors. The builder methods
//! here exist for the front-end (and for tests) to populate the handle; the
//! core only ever reads it back.

use crate::containers::InsertionOrderedSet;

/// An index into the [`Storage`] type intern table.
///
/// Types are interned structurally, so two `TypeId`s are equal exactly when
/// the type descriptors they refer to are structurally identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TypeId(pub usize);

/// Primitive kind of a type descriptor
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum TypeKind {
    Ptr,
    Int,
    Bool,
    Struct,
    Array,
    Fnc,
    Real,
    String,
    Void,
}

/// One item of a struct layout
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TypeItem {
    /// Byte offset of the item within the enclosing struct
    pub off: i64,
    pub ty: TypeId,
    pub name: Option<String>,
}

/// A structural type descriptor
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TypeDesc {
    pub kind: TypeKind,
    /// Size in bytes; 0 for void and function types
    pub size: i64,
    /// Layout items; non-empty only for [`TypeKind::Struct`]
    pub items: Vec<TypeItem>,
    /// Pointee/element type for pointers and arrays. Pointers may stay opaque
    /// (`None`), the way front-ends emit forward-declared and void pointers.
    pub target: Option<TypeId>,
}

impl TypeDesc {
    pub fn int(size: i64) -> Self {
        TypeDesc {
            kind: TypeKind::Int,
            size,
            items: vec![],
            target: None,
        }
    }

    pub fn ptr(target: Option<TypeId>, size: i64) -> Self {
        TypeDesc {
            kind: TypeKind::Ptr,
            size,
            items: vec![],
            target,
        }
    }

    pub fn strukt(size: i64, items: Vec<TypeItem>) -> Self {
        TypeDesc {
            kind: TypeKind::Struct,
            size,
            items,
        target: None,
        }
    }
}

/// Uid of a program variable, unique across the whole [`Storage`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ProgVar(pub u32);

/// Metadata of one program variable
#[derive(Clone, Debug)]
pub struct VarInfo {
    pub uid: ProgVar,
    pub name: String,
    pub ty: TypeId,
    /// `true` for file-scope variables, `false` for automatic storage
    pub is_static: bool,
}

/// A source location instructions and defect reports point at
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Default)]
pub struct SrcLoc {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Instruction codes of the three-address-code stream
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum InsnCode {
    Assign,
    Call,
    /// Two-way conditional branch; `targets[0]` taken on true
    Cond,
    /// Unconditional jump to `targets[0]`
    Jmp,
    Ret,
    Abort,
    Label,
}

/// An operand of an instruction. The executor interprets these; the core only
/// carries them through.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    Var(ProgVar),
    LitInt(i64),
    LitStr(String),
    Fnc(u32),
    None,
}

/// One instruction of the stream
#[derive(Clone, Debug)]
pub struct Insn {
    pub code: InsnCode,
    pub operands: Vec<Operand>,
    /// Successor basic blocks, for terminal instructions
    pub targets: Vec<usize>,
    /// Indexes into `targets` whose edges close a natural loop
    pub loop_closing_targets: Vec<usize>,
    pub loc: SrcLoc,
}

/// A function with its control-flow graph of basic blocks
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    /// Indexes into [`Storage::blocks`]
    pub blocks: Vec<usize>,
    /// Entry block (an index into [`Storage::blocks`])
    pub entry: usize,
}

/// The read-only handle the front-end populates and the core consumes.
///
/// Instructions and basic blocks live in global arenas, with functions and
/// blocks holding plain indexes into them.
pub struct Storage {
    types: InsertionOrderedSet<TypeDesc>,
    pub instructions: Vec<Insn>,
    /// Each block is a sequence of instruction indexes
    pub blocks: Vec<Vec<usize>>,
    pub functions: Vec<Function>,
    vars: Vec<VarInfo>,
    generic_ptr: TypeId,
    open_function: Option<Function>,
    open_block: Option<Vec<usize>>,
}

impl Storage {
    pub fn new() -> Self {
        let mut types = InsertionOrderedSet::new();
        let generic_ptr = TypeId(types.insert(TypeDesc::ptr(None, PTR_SIZE)));
        Self {
            types,
            instructions: vec![],
            blocks: vec![],
            functions: vec![],
            vars: vec![],
            generic_ptr,
            open_function: None,
            open_block: None,
        }
    }

    /// Intern `ty`, returning its stable id. Interning is structural:
    /// re-inserting an identical descriptor returns the original id.
    pub fn intern_type(&mut self, ty: TypeDesc) -> TypeId {
        TypeId(self.types.insert(ty))
    }

    /// Look a type descriptor back up
    pub fn type_of(&self, id: TypeId) -> &TypeDesc {
        self.types.get(id.0).expect("dangling TypeId")
    }

    /// The generic (opaque) data pointer type; always interned
    pub fn ptr_type(&self) -> TypeId {
        self.generic_ptr
    }

    /// Register a program variable
    pub fn add_var(&mut self, name: &str, ty: TypeId, is_static: bool) -> ProgVar {
        let uid = ProgVar(self.vars.len() as u32);
        self.vars.push(VarInfo {
            uid,
            name: name.to_string(),
            ty,
            is_static,
        });
        uid
    }

    pub fn var_info(&self, var: ProgVar) -> &VarInfo {
        &self.vars[var.0 as usize]
    }

    pub fn vars(&self) -> impl Iterator<Item = &VarInfo> {
        self.vars.iter()
    }

    /// Open a new function for appending blocks
    pub fn begin_function(&mut self, name: &str) {
        assert!(
            self.open_function.is_none(),
            "Attempted to begin a function while another is still open"
        );
        self.open_function = Some(Function {
            name: name.to_string(),
            blocks: vec![],
            entry: self.blocks.len(),
        });
    }

    /// Open a new basic block in the currently open function, returning the
    /// block id terminal instructions may target.
    pub fn begin_block(&mut self) -> usize {
        assert!(self.open_function.is_some(), "No function is open");
        self.flush_block();
        self.open_block = Some(vec![]);
        self.blocks.len() + self.pending_block_count() - 1
    }

    fn pending_block_count(&self) -> usize {
        usize::from(self.open_block.is_some())
    }

    fn flush_block(&mut self) {
        if let Some(insns) = self.open_block.take() {
            let id = self.blocks.len();
            self.blocks.push(insns);
            self.open_function
                .as_mut()
                .expect("No function is open")
                .blocks
                .push(id);
        }
    }

    /// Append an instruction to the currently open block, returning its index.
    pub fn add_insn(&mut self, insn: Insn) -> usize {
        let idx = self.instructions.len();
        self.instructions.push(insn);
        self.open_block
            .as_mut()
            .expect("No block is open")
            .push(idx);
        idx
    }

    /// Close the currently open function
    pub fn end_function(&mut self) {
        self.flush_block();
        let f = self.open_function.take().expect("No function is open");
        self.functions.push(f);
    }

    /// The basic block an instruction belongs to
    pub fn block_of_insn(&self, insn: usize) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.contains(&insn))
    }

    /// Whether `code` terminates a basic block
    pub fn is_term_code(code: InsnCode) -> bool {
        matches!(
            code,
            InsnCode::Cond | InsnCode::Jmp | InsnCode::Ret | InsnCode::Abort
        )
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte width of data pointers the front-end emits
pub const PTR_SIZE: i64 = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_intern_structurally() {
        let mut stor = Storage::new();
        let a = stor.intern_type(TypeDesc::int(4));
        let b = stor.intern_type(TypeDesc::int(4));
        let c = stor.intern_type(TypeDesc::int(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(stor.type_of(c).size, 8);
    }

    #[test]
    fn function_builder_tracks_blocks() {
        let mut stor = Storage::new();
        stor.begin_function("f");
        let b0 = stor.begin_block();
        stor.add_insn(Insn {
            code: InsnCode::Label,
            operands: vec![],
            targets: vec![],
            loop_closing_targets: vec![],
            loc: SrcLoc::default(),
        });
        let b1 = stor.begin_block();
        stor.add_insn(Insn {
            code: InsnCode::Ret,
            operands: vec![],
            targets: vec![],
            loop_closing_targets: vec![],
            loc: SrcLoc::default(),
        });
        stor.end_function();
        assert_eq!(b0, 0);
        assert_eq!(b1, 1);
        assert_eq!(stor.functions[0].blocks, vec![0, 1]);
        assert_eq!(stor.block_of_insn(1), Some(1));
    }
}
