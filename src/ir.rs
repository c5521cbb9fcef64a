//! A statically-typed SSA module IR for whole-program pointer analysis.
//!
//! The analysis is flow-insensitive, so a function body is a flat list of
//! instructions; basic blocks and control flow carry no information the
//! analysis could use.

use crate::containers::unordered::UnorderedMap;
use std::collections::BTreeSet;

/// Identity of a function within its [`Module`], stable across a run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FuncId(pub usize);

/// Identity of a global variable within its [`Module`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct GlobalId(pub usize);

/// Identity of an SSA local within its function. Formal parameters occupy
/// the first `params.len()` ids of their function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LocalId(pub usize);

/// A module-level symbol whose address can be classified into a node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum GlobalSym {
    Var(GlobalId),
    Func(FuncId),
}

impl GlobalSym {
    pub fn as_func(&self) -> Option<FuncId> {
        match self {
            GlobalSym::Func(f) => Some(*f),
            GlobalSym::Var(_) => None,
        }
    }
}

/// Primitive IR types, as recorded in node type records.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Ty {
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Ptr,
}

impl Ty {
    /// Size of a value of this type, in bytes. Pointers are 8 bytes wide.
    pub fn size_bytes(self) -> usize {
        match self {
            Ty::I1 | Ty::I8 => 1,
            Ty::I16 => 2,
            Ty::I32 | Ty::F32 => 4,
            Ty::I64 | Ty::F64 | Ty::Ptr => 8,
        }
    }

    pub fn is_pointer(self) -> bool {
        matches!(self, Ty::Ptr)
    }
}

/// Symbol visibility. `Internal` symbols cannot be named from outside the
/// module; everything else is assumed visible.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Linkage {
    Internal,
    External,
}

/// A module-level variable. A declaration is defined in some other module.
#[derive(Debug)]
pub struct GlobalVar {
    pub name: String,
    pub linkage: Linkage,
    pub is_declaration: bool,
    /// Optional pointer initializer (another global or a function).
    pub init: Option<Operand>,
}

/// A formal parameter.
#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: Ty,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    /// `true` when the body lives in another module.
    pub is_declaration: bool,
    pub is_vararg: bool,
    pub params: Vec<Param>,
    pub insns: Vec<Insn>,
    /// [`LocalId`] to source-level name; parameters occupy the prefix.
    local_names: Vec<String>,
}

impl Function {
    /// Look up a local by its source-level name.
    pub fn local(&self, name: &str) -> Option<LocalId> {
        self.local_names.iter().position(|n| n == name).map(LocalId)
    }

    pub fn local_name(&self, l: LocalId) -> &str {
        &self.local_names[l.0]
    }

    pub fn num_locals(&self) -> usize {
        self.local_names.len()
    }
}

/// An instruction operand.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operand {
    Local(LocalId),
    Global(GlobalId),
    Func(FuncId),
    NullPtr,
    Undef,
}

/// Offset argument of a [`Insn::Gep`]. An unknown offset marks the base
/// object as indexable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GepOffset {
    Const(usize),
    Unknown,
}

/// An IR instruction. Only the operations the pointer analysis observes are
/// representable; arithmetic on non-pointers never reaches the analysis.
#[derive(Clone, Debug)]
pub enum Insn {
    /// Allocate `size` bytes of stack memory; `dst` holds its address.
    Alloca { dst: LocalId, size: usize },
    /// Allocate `size` bytes of heap memory; `dst` holds its address.
    HeapAlloc { dst: LocalId, size: usize },
    /// `dst = *(ptr)`, reading a value of type `ty`.
    Load { dst: LocalId, ptr: Operand, ty: Ty },
    /// `*(ptr) = val`, writing a value of type `ty`.
    Store { val: Operand, ptr: Operand, ty: Ty },
    /// `dst = &base[offset]`.
    Gep {
        dst: LocalId,
        base: Operand,
        offset: GepOffset,
    },
    /// Type-preserving value copy (bitcast and friends).
    Cast { dst: LocalId, src: Operand },
    /// A pointer manufactured from an integer; provenance unknown.
    IntToPtr { dst: LocalId },
    /// A pointer observed escaping into an integer.
    PtrToInt { src: Operand },
    /// Direct or indirect call. `dst` is present when the result is a
    /// pointer.
    Call {
        dst: Option<LocalId>,
        callee: Operand,
        args: Vec<Operand>,
    },
    Ret { val: Option<Operand> },
}

impl Insn {
    /// The SSA local this instruction defines, if any.
    pub fn def(&self) -> Option<LocalId> {
        match self {
            Insn::Alloca { dst, .. }
            | Insn::HeapAlloc { dst, .. }
            | Insn::Load { dst, .. }
            | Insn::Gep { dst, .. }
            | Insn::Cast { dst, .. }
            | Insn::IntToPtr { dst } => Some(*dst),
            Insn::Call { dst, .. } => *dst,
            Insn::Store { .. } | Insn::PtrToInt { .. } | Insn::Ret { .. } => None,
        }
    }
}

/// Identity of a call site: the owning function and the instruction's index
/// in its body. Stable for the lifetime of the module.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SiteRef {
    pub func: FuncId,
    pub insn: usize,
}

/// Identity of a value as used by scalar maps: SSA locals, globals and
/// function addresses. Constants never appear here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Value {
    Local { func: FuncId, local: LocalId },
    Global(GlobalId),
    Func(FuncId),
}

/// The whole program under analysis.
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVar>,
    func_by_name: UnorderedMap<String, FuncId>,
    global_by_name: UnorderedMap<String, GlobalId>,
    building: Option<FuncId>,
}

impl Module {
    /// A new, empty module
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
            globals: Vec::new(),
            func_by_name: Default::default(),
            global_by_name: Default::default(),
            building: None,
        }
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        linkage: Linkage,
        is_declaration: bool,
        init: Option<Operand>,
    ) -> GlobalId {
        let name = name.into();
        assert!(
            !self.global_by_name.contains_key(&name),
            "Duplicate global @{}",
            name
        );
        let id = GlobalId(self.globals.len());
        self.global_by_name.insert(name.clone(), id);
        self.globals.push(GlobalVar {
            name,
            linkage,
            is_declaration,
            init,
        });
        id
    }

    /// Register a function defined in some other module. Only its signature
    /// participates in the analysis.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<Param>,
        is_vararg: bool,
    ) -> FuncId {
        let id = self.push_function(name, params, Linkage::External, is_vararg);
        self.functions[id.0].is_declaration = true;
        id
    }

    /// Register a function signature without starting its body, so that
    /// bodies parsed later can refer forward to it. Pair with
    /// [`Self::begin_body`].
    pub fn add_function_signature(
        &mut self,
        name: impl Into<String>,
        params: Vec<Param>,
        linkage: Linkage,
        is_vararg: bool,
        is_declaration: bool,
    ) -> FuncId {
        let id = self.push_function(name, params, linkage, is_vararg);
        self.functions[id.0].is_declaration = is_declaration;
        id
    }

    /// Begin adding instructions to a function registered through
    /// [`Self::add_function_signature`].
    pub fn begin_body(&mut self, f: FuncId) {
        assert!(
            self.building.is_none(),
            "Should have called `end_function` before beginning another body"
        );
        assert!(
            !self.functions[f.0].is_declaration,
            "Declarations have no body"
        );
        self.building = Some(f);
    }

    /// Attach a pointer initializer to a global after the fact, once the
    /// symbol it refers to exists.
    pub fn set_global_init(&mut self, g: GlobalId, init: Operand) {
        let gv = &mut self.globals[g.0];
        assert!(gv.init.is_none(), "Global @{} already initialized", gv.name);
        gv.init = Some(init);
    }

    /// Begin adding instructions for a new function. Expected to be paired
    /// with [`Self::end_function`].
    pub fn begin_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<Param>,
        linkage: Linkage,
        is_vararg: bool,
    ) -> FuncId {
        assert!(
            self.building.is_none(),
            "Should have called `end_function` before calling `begin_function` again"
        );
        let id = self.push_function(name, params, linkage, is_vararg);
        self.building = Some(id);
        id
    }

    fn push_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<Param>,
        linkage: Linkage,
        is_vararg: bool,
    ) -> FuncId {
        let name = name.into();
        assert!(
            !self.func_by_name.contains_key(&name),
            "Duplicate function @{}",
            name
        );
        let id = FuncId(self.functions.len());
        self.func_by_name.insert(name.clone(), id);
        let local_names = params.iter().map(|p| p.name.clone()).collect();
        self.functions.push(Function {
            name,
            linkage,
            is_declaration: false,
            is_vararg,
            params,
            insns: Vec::new(),
            local_names,
        });
        id
    }

    /// Register a fresh SSA local in the function currently being built.
    pub fn fresh_local(&mut self, name: impl Into<String>) -> LocalId {
        let f = self.building.expect("No function is being built");
        let func = &mut self.functions[f.0];
        let name = name.into();
        assert!(
            func.local(&name).is_none(),
            "Duplicate local %{} in @{}",
            name,
            func.name
        );
        let id = LocalId(func.local_names.len());
        func.local_names.push(name);
        id
    }

    /// Append an instruction to the function currently being built.
    pub fn push(&mut self, insn: Insn) {
        let f = self.building.expect("No function is being built");
        self.functions[f.0].insns.push(insn);
    }

    pub fn end_function(&mut self) {
        assert!(self.building.take().is_some(), "No function is being built");
    }

    /// The function currently being built, if any.
    pub fn building_function(&self) -> Option<FuncId> {
        self.building
    }

    pub fn function(&self, f: FuncId) -> &Function {
        &self.functions[f.0]
    }

    pub fn global(&self, g: GlobalId) -> &GlobalVar {
        &self.globals[g.0]
    }

    pub fn func_id(&self, name: &str) -> Option<FuncId> {
        self.func_by_name.get(name).copied()
    }

    pub fn global_id(&self, name: &str) -> Option<GlobalId> {
        self.global_by_name.get(name).copied()
    }

    /// Iterate over the functions together with their ids, in id order.
    pub fn functions_iter(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions.iter().enumerate().map(|(i, f)| (FuncId(i), f))
    }

    pub fn globals_iter(&self) -> impl Iterator<Item = (GlobalId, &GlobalVar)> {
        self.globals
            .iter()
            .enumerate()
            .map(|(i, g)| (GlobalId(i), g))
    }

    /// All call sites of defined functions, in deterministic order.
    pub fn call_sites_iter(&self) -> impl Iterator<Item = (SiteRef, &Insn)> {
        self.functions_iter()
            .filter(|(_, f)| !f.is_declaration)
            .flat_map(|(fid, f)| {
                f.insns
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| matches!(i, Insn::Call { .. }))
                    .map(move |(idx, i)| (SiteRef { func: fid, insn: idx }, i))
            })
    }

    /// Resolve `fname`'s local `lname` to a scalar-map key.
    pub fn local_value(&self, fname: &str, lname: &str) -> Option<Value> {
        let func = self.func_id(fname)?;
        let local = self.function(func).local(lname)?;
        Some(Value::Local { func, local })
    }

    /// A printable name for a scalar-map key.
    pub fn value_name(&self, v: Value) -> String {
        match v {
            Value::Local { func, local } => format!(
                "{}:%{}",
                self.function(func).name,
                self.function(func).local_name(local)
            ),
            Value::Global(g) => format!("@{}", self.global(g).name),
            Value::Func(f) => format!("@{}", self.function(f).name),
        }
    }

    /// Functions whose address is observed anywhere other than a direct
    /// callee position. Only these can flow into indirect call targets.
    pub fn address_taken_functions(&self) -> BTreeSet<FuncId> {
        let mut taken = BTreeSet::new();
        for g in &self.globals {
            if let Some(Operand::Func(f)) = g.init {
                taken.insert(f);
            }
        }
        let mut visit = |op: &Operand| {
            if let Operand::Func(f) = op {
                taken.insert(*f);
            }
        };
        for f in &self.functions {
            for insn in &f.insns {
                match insn {
                    Insn::Load { ptr, .. } => visit(ptr),
                    Insn::Store { val, ptr, .. } => {
                        visit(val);
                        visit(ptr);
                    }
                    Insn::Gep { base, .. } => visit(base),
                    Insn::Cast { src, .. } => visit(src),
                    Insn::PtrToInt { src } => visit(src),
                    Insn::Call { args, .. } => {
                        // The callee operand is deliberately not visited: a
                        // direct call does not take the callee's address.
                        for a in args {
                            visit(a);
                        }
                    }
                    Insn::Ret { val: Some(op) } => visit(op),
                    Insn::Alloca { .. }
                    | Insn::HeapAlloc { .. }
                    | Insn::IntToPtr { .. }
                    | Insn::Ret { val: None } => {}
                }
            }
        }
        taken
    }

    /// Confirms the validity of the module.
    pub fn try_confirm_valid(&self) -> Result<(), String> {
        assert!(self.building.is_none(), "A function is still being built");
        for (_, f) in self.functions_iter() {
            if f.is_declaration && !f.insns.is_empty() {
                return Err(format!("Declaration @{} has a body", f.name));
            }
            let mut defined = vec![false; f.num_locals()];
            for b in defined.iter_mut().take(f.params.len()) {
                *b = true;
            }
            let check_op = |op: &Operand| -> Result<(), String> {
                match op {
                    Operand::Local(l) => {
                        if l.0 >= f.num_locals() {
                            return Err(format!("Out-of-range local in @{}", f.name));
                        }
                    }
                    Operand::Global(g) => {
                        if g.0 >= self.globals.len() {
                            return Err(format!("Out-of-range global in @{}", f.name));
                        }
                    }
                    Operand::Func(cf) => {
                        if cf.0 >= self.functions.len() {
                            return Err(format!("Out-of-range function in @{}", f.name));
                        }
                    }
                    Operand::NullPtr | Operand::Undef => {}
                }
                Ok(())
            };
            for insn in &f.insns {
                match insn {
                    Insn::Load { ptr, .. } => check_op(ptr)?,
                    Insn::Store { val, ptr, .. } => {
                        check_op(val)?;
                        check_op(ptr)?;
                    }
                    Insn::Gep { base, .. } => check_op(base)?,
                    Insn::Cast { src, .. } => check_op(src)?,
                    Insn::PtrToInt { src } => check_op(src)?,
                    Insn::Call { callee, args, .. } => {
                        check_op(callee)?;
                        for a in args {
                            check_op(a)?;
                        }
                    }
                    Insn::Ret { val: Some(op) } => check_op(op)?,
                    _ => {}
                }
                if let Some(d) = insn.def() {
                    if d.0 >= f.num_locals() {
                        return Err(format!("Out-of-range definition in @{}", f.name));
                    }
                    if defined[d.0] {
                        return Err(format!(
                            "Local %{} defined twice in @{}; module is not in SSA form",
                            f.local_name(d),
                            f.name
                        ));
                    }
                    defined[d.0] = true;
                }
            }
        }
        Ok(())
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
