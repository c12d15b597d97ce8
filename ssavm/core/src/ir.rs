//! The typed SSA IR the interpreter executes.
//!
//! The module/function/block/instruction model is assumed to be materialized
//! by an external loader; this crate only defines the queryable shape. Every
//! enum is serde-tagged so whole modules round-trip through JSON (see
//! `ssavm-run`). Instructions form a closed sum, dispatched by exhaustive
//! matching.

use crate::apint::ApInt;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

/// Target description: byte order and pointer width. The defaults match the
/// layouts the oracle side expects (little-endian, 64-bit pointers).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataLayout {
    pub little_endian: bool,
    pub ptr_bytes: u64,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self { little_endian: true, ptr_bytes: 8 }
    }
}

fn align_to(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Type {
    Void,
    Int { bits: u32 },
    Float,
    Double,
    Ptr,
    Vector { elem: Box<Type>, lanes: u32 },
    Array { elem: Box<Type>, len: u64 },
    Struct { fields: Vec<Type> },
    /// Opaque target extension type; memory operations see its layout type.
    TargetExt { name: String, layout: Box<Type> },
}

impl Type {
    pub fn int(bits: u32) -> Type {
        Type::Int { bits }
    }

    pub fn vector(elem: Type, lanes: u32) -> Type {
        Type::Vector { elem: Box::new(elem), lanes }
    }

    pub fn array(elem: Type, len: u64) -> Type {
        Type::Array { elem: Box::new(elem), len }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Vector { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float)
    }

    pub fn is_double(&self) -> bool {
        matches!(self, Type::Double)
    }

    /// Element type of a vector, or the type itself for scalars.
    pub fn scalar_type(&self) -> &Type {
        match self {
            Type::Vector { elem, .. } => elem,
            other => other,
        }
    }

    pub fn lanes(&self) -> u32 {
        match self {
            Type::Vector { lanes, .. } => *lanes,
            _ => 1,
        }
    }

    /// Bit size of a scalar or vector-element payload; zero for everything
    /// that has no fixed scalar bit pattern.
    pub fn scalar_bits(&self, layout: &DataLayout) -> u32 {
        match self.scalar_type() {
            Type::Int { bits } => *bits,
            Type::Float => 32,
            Type::Double => 64,
            Type::Ptr => (layout.ptr_bytes * 8) as u32,
            _ => 0,
        }
    }

    /// Memory instructions address the layout type of a target extension
    /// type, never the opaque wrapper.
    pub fn lowered(&self) -> &Type {
        match self {
            Type::TargetExt { layout, .. } => layout.lowered(),
            other => other,
        }
    }

    /// Bytes written by a store of this type.
    pub fn store_size(&self, layout: &DataLayout) -> u64 {
        match self {
            Type::Void => 0,
            Type::Int { bits } => (*bits as u64).div_ceil(8),
            Type::Float => 4,
            Type::Double => 8,
            Type::Ptr => layout.ptr_bytes,
            Type::Vector { elem, lanes } => elem.store_size(layout) * *lanes as u64,
            Type::Array { elem, len } => elem.alloc_size(layout) * len,
            Type::Struct { fields } => struct_layout(fields, layout).size,
            Type::TargetExt { layout: inner, .. } => inner.store_size(layout),
        }
    }

    pub fn abi_align(&self, layout: &DataLayout) -> u64 {
        match self {
            Type::Void => 1,
            Type::Int { .. } | Type::Float | Type::Double => {
                self.store_size(layout).next_power_of_two().min(8)
            }
            Type::Ptr => layout.ptr_bytes,
            Type::Vector { .. } => self.store_size(layout).next_power_of_two().min(16),
            Type::Array { elem, .. } => elem.abi_align(layout),
            Type::Struct { fields } => struct_layout(fields, layout).align,
            Type::TargetExt { layout: inner, .. } => inner.abi_align(layout),
        }
    }

    /// Stride between consecutive elements of this type in memory.
    pub fn alloc_size(&self, layout: &DataLayout) -> u64 {
        align_to(self.store_size(layout).max(1), self.abi_align(layout))
    }
}

pub struct StructLayout {
    pub offsets: Vec<u64>,
    pub size: u64,
    pub align: u64,
}

pub fn struct_layout(fields: &[Type], layout: &DataLayout) -> StructLayout {
    let mut offsets = Vec::with_capacity(fields.len());
    let mut offset = 0u64;
    let mut align = 1u64;
    for field in fields {
        let field_align = field.abi_align(layout);
        align = align.max(field_align);
        offset = align_to(offset, field_align);
        offsets.push(offset);
        offset += field.store_size(layout);
    }
    StructLayout { offsets, size: align_to(offset, align), align }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
    #[serde(default)]
    pub vararg: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntPredicate {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatPredicate {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    Uno,
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinAlu {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToUi,
    FpToSi,
    UiToFp,
    SiToFp,
    PtrToInt,
    IntToPtr,
    BitCast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrinsicOp {
    Fabs,
    Fmuladd,
    Fshl,
    Fshr,
}

/// A constant. Integer, float and aggregate constants carry their own type;
/// `Null`, global and function references are pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Const {
    Int { value: ApInt },
    Float { value: f32 },
    Double { value: f64 },
    Null,
    Agg { elems: Vec<Const> },
    Global { id: GlobalId },
    Func { id: FuncId },
    BlockAddress { func: FuncId, block: BlockId },
    Expr { expr: Box<ConstExpr> },
}

impl Const {
    pub fn int(bits: u32, value: u64) -> Const {
        Const::Int { value: ApInt::from_u64(bits, value) }
    }

    pub fn int_signed(bits: u32, value: i64) -> Const {
        Const::Int { value: ApInt::from_i64(bits, value) }
    }
}

/// Foldable constant expressions; the evaluator reuses the instruction
/// kernels on these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstExpr {
    Cast { op: CastOp, src: Const, src_ty: Type, to: Type },
    Gep { base: Const, source_ty: Type, indices: Vec<Const> },
    ICmp { pred: IntPredicate, ty: Type, lhs: Const, rhs: Const },
    FCmp { pred: FloatPredicate, ty: Type, lhs: Const, rhs: Const },
    Select { cond: Const, cond_ty: Type, on_true: Const, on_false: Const },
    Bin { op: BinAlu, ty: Type, lhs: Const, rhs: Const },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operand {
    Value { id: ValueId, ty: Type },
    Const { value: Const },
}

impl Operand {
    pub fn value(id: ValueId, ty: Type) -> Operand {
        Operand::Value { id, ty }
    }

    pub fn int(bits: u32, value: u64) -> Operand {
        Operand::Const { value: Const::int(bits, value) }
    }
}

/// Debug location attached to an instruction, captured into error traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub dir: String,
    pub file: String,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstKind {
    Bin { op: BinAlu, ty: Type, lhs: Operand, rhs: Operand },
    FNeg { ty: Type, src: Operand },
    ICmp { pred: IntPredicate, ty: Type, lhs: Operand, rhs: Operand },
    FCmp { pred: FloatPredicate, ty: Type, lhs: Operand, rhs: Operand },
    Select { cond_ty: Type, cond: Operand, on_true: Operand, on_false: Operand },
    Cast { cast: CastOp, src_ty: Type, src: Operand, to: Type },
    Gep { base: Operand, source_ty: Type, indices: Vec<Operand> },
    Load { ptr: Operand, ty: Type },
    Store { value: Operand, value_ty: Type, ptr: Operand },
    Alloca { ty: Type, count: Operand, align: u64 },
    Call {
        callee: Operand,
        sig: Signature,
        args: Vec<Operand>,
        /// Set for invokes: the successor taken on a normal return.
        #[serde(default)]
        normal: Option<BlockId>,
    },
    Intrinsic { intr: IntrinsicOp, ty: Type, args: Vec<Operand> },
    VaStart { list: Operand },
    VaArg { list: Operand, ty: Type },
    VaCopy { dst: Operand, src: Operand },
    VaEnd { list: Operand },
    ExtractValue { agg: Operand, indices: Vec<u32> },
    InsertValue { agg: Operand, value: Operand, indices: Vec<u32> },
    ExtractElement { vector: Operand, index: Operand },
    InsertElement { vector: Operand, value: Operand, index: Operand },
    ShuffleVector { a: Operand, b: Operand, mask: Vec<i32> },
    Phi { ty: Type, incoming: Vec<(BlockId, Operand)> },
    Br { dest: BlockId },
    CondBr { cond: Operand, on_true: BlockId, on_false: BlockId },
    Switch { cond: Operand, cond_ty: Type, cases: Vec<(Const, BlockId)>, default: BlockId },
    IndirectBr { addr: Operand, dests: Vec<BlockId> },
    Ret { value: Option<Operand>, ty: Type },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    #[serde(default)]
    pub result: Option<ValueId>,
    pub kind: InstKind,
    #[serde(default)]
    pub loc: Option<SourceLoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub insts: Vec<Inst>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub sig: Signature,
    /// SSA ids bound to the declared parameters, in order.
    pub params: Vec<ValueId>,
    /// Empty for declarations; externally handled calls go to the oracle.
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0 as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    #[serde(default)]
    pub init: Option<Const>,
}

/// One entry of a module-level appending constructor/destructor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtorEntry {
    pub priority: u32,
    pub func: FuncId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub functions: Vec<Function>,
    #[serde(default)]
    pub globals: Vec<Global>,
    #[serde(default)]
    pub ctors: Vec<CtorEntry>,
    #[serde(default)]
    pub dtors: Vec<CtorEntry>,
    #[serde(default)]
    pub layout: DataLayout,
}

impl Module {
    pub fn func(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn global(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(id.0 as usize)
    }

    pub fn add_function(&mut self, func: Function) -> FuncId {
        self.functions.push(func);
        FuncId(self.functions.len() as u32 - 1)
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        self.globals.push(global);
        GlobalId(self.globals.len() as u32 - 1)
    }

    /// Constructors in invocation order: ascending priority, ties in
    /// appearance order.
    pub fn static_constructors(&self) -> Vec<FuncId> {
        let mut entries = self.ctors.clone();
        entries.sort_by_key(|e| e.priority);
        entries.into_iter().map(|e| e.func).collect()
    }

    /// Destructors in invocation order: descending priority, ties in
    /// appearance order.
    pub fn static_destructors(&self) -> Vec<FuncId> {
        let mut entries = self.dtors.clone();
        entries.sort_by_key(|e| std::cmp::Reverse(e.priority));
        entries.into_iter().map(|e| e.func).collect()
    }
}

/// Assembles one function, handing out SSA ids as instructions are appended.
pub struct FunctionBuilder {
    name: String,
    sig: Signature,
    params: Vec<ValueId>,
    blocks: Vec<Block>,
    current: BlockId,
    next_value: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        let params: Vec<ValueId> = (0..sig.params.len() as u32).map(ValueId).collect();
        Self {
            name: name.into(),
            sig,
            next_value: params.len() as u32,
            params,
            blocks: vec![Block { insts: Vec::new() }],
            current: BlockId(0),
        }
    }

    pub fn param(&self, index: usize) -> Operand {
        Operand::Value { id: self.params[index], ty: self.sig.params[index].clone() }
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block { insts: Vec::new() });
        BlockId(self.blocks.len() as u32 - 1)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Append an instruction that produces a value; returns its SSA id.
    pub fn push(&mut self, kind: InstKind) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.blocks[self.current.0 as usize]
            .insts
            .push(Inst { result: Some(id), kind, loc: None });
        id
    }

    pub fn push_at(&mut self, kind: InstKind, loc: SourceLoc) -> ValueId {
        let id = self.push(kind);
        let block = &mut self.blocks[self.current.0 as usize];
        if let Some(inst) = block.insts.last_mut() {
            inst.loc = Some(loc);
        }
        id
    }

    /// Append an instruction with no result (stores, terminators, void calls).
    pub fn push_void(&mut self, kind: InstKind) {
        self.blocks[self.current.0 as usize]
            .insts
            .push(Inst { result: None, kind, loc: None });
    }

    pub fn finish(self) -> Function {
        Function { name: self.name, sig: self.sig, params: self.params, blocks: self.blocks }
    }
}

fn fmt_operand(op: &Operand, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match op {
        Operand::Value { id, .. } => write!(f, "%{}", id.0),
        Operand::Const { value } => fmt_const(value, f),
    }
}

fn fmt_const(c: &Const, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match c {
        Const::Int { value } => write!(f, "{value:?}"),
        Const::Float { value } => write!(f, "float {value}"),
        Const::Double { value } => write!(f, "double {value}"),
        Const::Null => write!(f, "null"),
        Const::Agg { elems } => {
            write!(f, "{{")?;
            for (i, e) in elems.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_const(e, f)?;
            }
            write!(f, "}}")
        }
        Const::Global { id } => write!(f, "@g{}", id.0),
        Const::Func { id } => write!(f, "@f{}", id.0),
        Const::BlockAddress { func, block } => write!(f, "blockaddress(@f{}, b{})", func.0, block.0),
        Const::Expr { .. } => write!(f, "constexpr"),
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "%{} = ", result.0)?;
        }
        match &self.kind {
            InstKind::Bin { op, lhs, rhs, .. } => {
                write!(f, "{op:?} ")?;
                fmt_operand(lhs, f)?;
                write!(f, ", ")?;
                fmt_operand(rhs, f)
            }
            InstKind::FNeg { src, .. } => {
                write!(f, "fneg ")?;
                fmt_operand(src, f)
            }
            InstKind::ICmp { pred, lhs, rhs, .. } => {
                write!(f, "icmp {pred:?} ")?;
                fmt_operand(lhs, f)?;
                write!(f, ", ")?;
                fmt_operand(rhs, f)
            }
            InstKind::FCmp { pred, lhs, rhs, .. } => {
                write!(f, "fcmp {pred:?} ")?;
                fmt_operand(lhs, f)?;
                write!(f, ", ")?;
                fmt_operand(rhs, f)
            }
            InstKind::Select { cond, on_true, on_false, .. } => {
                write!(f, "select ")?;
                fmt_operand(cond, f)?;
                write!(f, ", ")?;
                fmt_operand(on_true, f)?;
                write!(f, ", ")?;
                fmt_operand(on_false, f)
            }
            InstKind::Cast { cast, src, .. } => {
                write!(f, "{cast:?} ")?;
                fmt_operand(src, f)
            }
            InstKind::Gep { base, indices, .. } => {
                write!(f, "getelementptr ")?;
                fmt_operand(base, f)?;
                for idx in indices {
                    write!(f, ", ")?;
                    fmt_operand(idx, f)?;
                }
                Ok(())
            }
            InstKind::Load { ptr, .. } => {
                write!(f, "load ")?;
                fmt_operand(ptr, f)
            }
            InstKind::Store { value, ptr, .. } => {
                write!(f, "store ")?;
                fmt_operand(value, f)?;
                write!(f, ", ")?;
                fmt_operand(ptr, f)
            }
            InstKind::Alloca { count, .. } => {
                write!(f, "alloca x ")?;
                fmt_operand(count, f)
            }
            InstKind::Call { callee, args, normal, .. } => {
                write!(f, "{} ", if normal.is_some() { "invoke" } else { "call" })?;
                fmt_operand(callee, f)?;
                write!(f, "(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_operand(a, f)?;
                }
                write!(f, ")")
            }
            InstKind::Intrinsic { intr, args, .. } => {
                write!(f, "{intr:?}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_operand(a, f)?;
                }
                write!(f, ")")
            }
            InstKind::VaStart { list } => {
                write!(f, "va_start ")?;
                fmt_operand(list, f)
            }
            InstKind::VaArg { list, .. } => {
                write!(f, "va_arg ")?;
                fmt_operand(list, f)
            }
            InstKind::VaCopy { dst, src } => {
                write!(f, "va_copy ")?;
                fmt_operand(dst, f)?;
                write!(f, ", ")?;
                fmt_operand(src, f)
            }
            InstKind::VaEnd { list } => {
                write!(f, "va_end ")?;
                fmt_operand(list, f)
            }
            InstKind::ExtractValue { agg, indices } => {
                write!(f, "extractvalue ")?;
                fmt_operand(agg, f)?;
                write!(f, " {indices:?}")
            }
            InstKind::InsertValue { agg, value, indices } => {
                write!(f, "insertvalue ")?;
                fmt_operand(agg, f)?;
                write!(f, ", ")?;
                fmt_operand(value, f)?;
                write!(f, " {indices:?}")
            }
            InstKind::ExtractElement { vector, index } => {
                write!(f, "extractelement ")?;
                fmt_operand(vector, f)?;
                write!(f, ", ")?;
                fmt_operand(index, f)
            }
            InstKind::InsertElement { vector, value, index } => {
                write!(f, "insertelement ")?;
                fmt_operand(vector, f)?;
                write!(f, ", ")?;
                fmt_operand(value, f)?;
                write!(f, ", ")?;
                fmt_operand(index, f)
            }
            InstKind::ShuffleVector { a, b, mask } => {
                write!(f, "shufflevector ")?;
                fmt_operand(a, f)?;
                write!(f, ", ")?;
                fmt_operand(b, f)?;
                write!(f, ", {mask:?}")
            }
            InstKind::Phi { incoming, .. } => {
                write!(f, "phi")?;
                for (block, op) in incoming {
                    write!(f, " [b{}: ", block.0)?;
                    fmt_operand(op, f)?;
                    write!(f, "]")?;
                }
                Ok(())
            }
            InstKind::Br { dest } => write!(f, "br b{}", dest.0),
            InstKind::CondBr { cond, on_true, on_false } => {
                write!(f, "br ")?;
                fmt_operand(cond, f)?;
                write!(f, ", b{}, b{}", on_true.0, on_false.0)
            }
            InstKind::Switch { cond, default, cases, .. } => {
                write!(f, "switch ")?;
                fmt_operand(cond, f)?;
                write!(f, ", default b{} ({} cases)", default.0, cases.len())
            }
            InstKind::IndirectBr { addr, .. } => {
                write!(f, "indirectbr ")?;
                fmt_operand(addr, f)
            }
            InstKind::Ret { value: Some(v), .. } => {
                write!(f, "ret ")?;
                fmt_operand(v, f)
            }
            InstKind::Ret { value: None, .. } => write!(f, "ret void"),
            InstKind::Unreachable => write!(f, "unreachable"),
        }
    }
}
