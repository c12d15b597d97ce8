//! The interpreter proper: thread table, step protocol, instruction
//! dispatch, the call handshake and the error latch.
//!
//! There is no scheduler. The external driver picks a thread and advances it
//! one instruction at a time through [`Machine::step_thread`]; calls that
//! resolve to the oracle suspend the thread until the driver delivers the
//! pending return value on the next step.

use crate::apint::ApInt;
use crate::interp::eval;
use crate::interp::frame::{Frame, InstPos, Thread};
use crate::ir::{
    BlockId, CastOp, Const, ConstExpr, FuncId, GlobalId, Inst, InstKind, Module, Operand,
    Signature, Type, ValueId,
};
use crate::oracle::{ErrorTrace, Oracle};
use crate::value::{OraclePtr, Payload, Value, NULL_PROVENANCE};
use crate::{CoreError, Result};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Synthetic address ranges handed out for function and block references.
/// The oracle never allocates this high, so the two spaces cannot collide.
const FUNC_ADDR_BASE: u64 = 0xF0F0_0000_0000_0000;
const BLOCK_ADDR_BASE: u64 = 0xF1F1_0000_0000_0000;

/// Why [`Machine::run_thread`] handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The frame stack emptied; the exit value is available.
    Finished,
    /// An externally-handled call wants its return value on the next step.
    Suspended,
    /// The oracle reported a memory error; the flag is latched.
    Faulted,
}

type ArgVec = SmallVec<[Value; 8]>;

pub struct Machine<O: Oracle> {
    module: Module,
    oracle: O,
    threads: HashMap<u64, Thread>,
    current: u64,
    error: bool,
    stack_trace: Vec<ErrorTrace>,
    at_exit: Vec<FuncId>,
    globals: HashMap<GlobalId, OraclePtr>,
    funcs_by_addr: HashMap<u64, FuncId>,
    blocks_by_addr: HashMap<u64, (FuncId, BlockId)>,
}

impl<O: Oracle> Machine<O> {
    pub fn new(module: Module, oracle: O) -> Machine<O> {
        let mut funcs_by_addr = HashMap::new();
        let mut blocks_by_addr = HashMap::new();
        for (fi, func) in module.functions.iter().enumerate() {
            let f = FuncId(fi as u32);
            funcs_by_addr.insert(func_addr(f), f);
            for bi in 0..func.blocks.len() {
                let b = BlockId(bi as u32);
                blocks_by_addr.insert(block_addr(f, b), (f, b));
            }
        }
        Machine {
            module,
            oracle,
            threads: HashMap::new(),
            current: 0,
            error: false,
            stack_trace: Vec::new(),
            at_exit: Vec::new(),
            globals: HashMap::new(),
            funcs_by_addr,
            blocks_by_addr,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut O {
        &mut self.oracle
    }

    pub fn error_flag(&self) -> bool {
        self.error
    }

    pub fn clear_error(&mut self) {
        self.error = false;
        self.stack_trace.clear();
    }

    pub fn stack_trace(&self) -> &[ErrorTrace] {
        &self.stack_trace
    }

    pub fn func_addr(&self, func: FuncId) -> u64 {
        func_addr(func)
    }

    pub fn block_address(&self, func: FuncId, block: BlockId) -> u64 {
        block_addr(func, block)
    }

    pub fn register_at_exit(&mut self, func: FuncId) {
        self.at_exit.push(func);
    }

    /// Allocate and register every module global with the oracle, then store
    /// the initializers. Two passes, so initializers may reference any global.
    pub fn init_globals(&mut self) -> Result<()> {
        let layout = self.module.layout;
        for gi in 0..self.module.globals.len() {
            let id = GlobalId(gi as u32);
            let (name, ty) = {
                let g = &self.module.globals[gi];
                (g.name.clone(), g.ty.clone())
            };
            let size = ty.alloc_size(&layout);
            let align = ty.abi_align(&layout);
            let ptr = self.oracle.malloc(size, align, false);
            if ptr.addr == 0 {
                return Err(CoreError::Malformed(format!("oracle refused global '{name}'")));
            }
            if self.oracle.register_global(&name, size, ptr) {
                return Err(CoreError::Malformed(format!(
                    "oracle rejected registration of global '{name}'"
                )));
            }
            if self.oracle.memset(ptr, 0, size) {
                return Err(CoreError::Malformed(format!(
                    "oracle failed to zero global '{name}'"
                )));
            }
            self.globals.insert(id, ptr);
            debug!(global = %name, addr = ptr.addr, size, "registered global");
        }
        for gi in 0..self.module.globals.len() {
            let id = GlobalId(gi as u32);
            let Some(init) = self.module.globals[gi].init.clone() else { continue };
            let ty = self.module.globals[gi].ty.clone();
            let ptr = self.globals[&id];
            let value = self.eval_const(&init)?;
            let lowered = ty.lowered().clone();
            let size = lowered.store_size(&layout);
            let align = lowered.abi_align(&layout);
            if self.oracle.store(&value, ptr, &lowered, size, align) {
                return Err(CoreError::Malformed(format!(
                    "oracle rejected initializer of global '{}'",
                    self.module.globals[gi].name
                )));
            }
        }
        Ok(())
    }

    // ---- thread manager ----

    /// Create a thread and push its entry frame. Arguments beyond the entry
    /// function's declared arity are dropped; the full list is kept on the
    /// thread for later inspection.
    pub fn create_thread(&mut self, id: u64, func: FuncId, args: Vec<Value>) -> Result<()> {
        let arity = self
            .module
            .func(func)
            .ok_or_else(|| CoreError::Malformed(format!("no function f{}", func.0)))?
            .sig
            .params
            .len();
        self.threads.insert(id, Thread::new(id, args.clone()));
        let previous = self.current;
        self.current = id;
        let take = args.len().min(arity);
        let result = self.call_function(func, &args[..take]);
        self.current = previous;
        result
    }

    pub fn has_thread(&self, id: u64) -> bool {
        self.threads.contains_key(&id)
    }

    pub fn thread_exit_value(&self, id: u64) -> Option<&Value> {
        self.threads.get(&id)?.exit.as_ref()
    }

    /// Whether the thread's next step must supply a pending return value.
    pub fn thread_awaiting_return(&self, id: u64) -> bool {
        self.threads
            .get(&id)
            .and_then(|t| t.frames.last())
            .is_some_and(|f| f.must_resolve_pending_return)
    }

    /// Drop a thread and every frame it owns; each frame's oracle allocas are
    /// released LIFO, top frame first.
    pub fn terminate_thread(&mut self, id: u64) -> Result<()> {
        let mut thread =
            self.threads.remove(&id).ok_or(CoreError::NoSuchThread(id))?;
        while let Some(mut frame) = thread.frames.pop() {
            while let Some(ptr) = frame.oracle_allocas.pop() {
                self.oracle.free(ptr);
            }
        }
        Ok(())
    }

    /// Advance a thread by one instruction. `pending` delivers the return
    /// value of an externally-handled call and is required exactly when the
    /// previous step suspended on one. Returns whether the frame stack is
    /// empty afterwards.
    pub fn step_thread(&mut self, id: u64, pending: Option<Value>) -> Result<bool> {
        if !self.threads.contains_key(&id) {
            return Err(CoreError::NoSuchThread(id));
        }
        self.current = id;
        if self.error {
            // A faulted machine never advances; the driver must observe and
            // clear the flag first.
            return Ok(self.cur_thread()?.frames.is_empty());
        }
        let expects_return = self.top()?.must_resolve_pending_return;
        if expects_return {
            let value = pending.ok_or_else(|| {
                CoreError::Protocol("pending return required after external call".into())
            })?;
            self.resolve_pending_return(value)?;
        } else if pending.is_some() {
            return Err(CoreError::Protocol(
                "pending return supplied but no call is outstanding".into(),
            ));
        }

        let (func, pos) = {
            let frame = self.top()?;
            (frame.func, InstPos { block: frame.block, index: frame.cursor })
        };
        let inst = self.inst_at(func, pos)?.clone();
        self.top_mut()?.cursor += 1;
        trace!(thread = id, %inst, "step");
        self.dispatch(&inst, pos)?;
        Ok(self.cur_thread()?.frames.is_empty())
    }

    /// Step the thread until it finishes, faults or suspends on an external
    /// call.
    pub fn run_thread(&mut self, id: u64) -> Result<ExitReason> {
        loop {
            if self.error {
                return Ok(ExitReason::Faulted);
            }
            {
                self.current = id;
                if !self.cur_thread()?.frames.is_empty()
                    && self.top()?.must_resolve_pending_return
                {
                    return Ok(ExitReason::Suspended);
                }
            }
            if self.step_thread(id, None)? {
                return Ok(ExitReason::Finished);
            }
        }
    }

    /// Invoke functions registered through `atexit`, most recent first.
    pub fn run_at_exit_handlers(&mut self) -> Result<()> {
        while let Some(func) = self.at_exit.pop() {
            self.call_function(func, &[])?;
            self.run_thread(self.current)?;
        }
        Ok(())
    }

    // ---- frame plumbing ----

    fn cur_thread(&self) -> Result<&Thread> {
        self.threads.get(&self.current).ok_or(CoreError::NoSuchThread(self.current))
    }

    fn cur_thread_mut(&mut self) -> Result<&mut Thread> {
        self.threads.get_mut(&self.current).ok_or(CoreError::NoSuchThread(self.current))
    }

    fn top(&self) -> Result<&Frame> {
        self.cur_thread()?.frames.last().ok_or(CoreError::EmptyStack)
    }

    fn top_mut(&mut self) -> Result<&mut Frame> {
        self.cur_thread_mut()?.frames.last_mut().ok_or(CoreError::EmptyStack)
    }

    fn inst_at(&self, func: FuncId, pos: InstPos) -> Result<&Inst> {
        self.module
            .func(func)
            .and_then(|f| f.block(pos.block))
            .and_then(|b| b.insts.get(pos.index))
            .ok_or_else(|| {
                CoreError::Malformed(format!(
                    "no instruction at f{} b{} #{}",
                    func.0, pos.block.0, pos.index
                ))
            })
    }

    fn set(&mut self, inst: &Inst, value: Value) -> Result<()> {
        if let Some(id) = inst.result {
            self.top_mut()?.values.insert(id, value);
        }
        Ok(())
    }

    // ---- operand resolution ----

    fn eval_operand(&mut self, op: &Operand) -> Result<Value> {
        match op {
            Operand::Value { id, ty } => {
                let value = self.top()?.values.get(id).cloned().ok_or_else(|| {
                    CoreError::Malformed(format!("use of undefined value %{}", id.0))
                })?;
                Ok(value.with_ty(ty.clone()))
            }
            Operand::Const { value } => self.eval_const(value),
        }
    }

    fn eval_const(&mut self, c: &Const) -> Result<Value> {
        match c {
            Const::Int { value } => {
                let bits = value.width();
                Ok(Value::int(value.clone()).with_ty(Type::int(bits)))
            }
            Const::Float { value } => Ok(Value::float(*value).with_ty(Type::Float)),
            Const::Double { value } => Ok(Value::double(*value).with_ty(Type::Double)),
            Const::Null => Ok(Value::ptr(OraclePtr::null()).with_ty(Type::Ptr)),
            Const::Agg { elems } => {
                let values =
                    elems.iter().map(|e| self.eval_const(e)).collect::<Result<Vec<_>>>()?;
                Ok(Value::agg(values))
            }
            Const::Global { id } => {
                let ptr = self.globals.get(id).copied().ok_or_else(|| {
                    CoreError::Malformed(format!("global g{} is not registered", id.0))
                })?;
                Ok(Value::ptr(ptr).with_ty(Type::Ptr))
            }
            Const::Func { id } => Ok(Value::ptr(OraclePtr {
                addr: func_addr(*id),
                prov: NULL_PROVENANCE,
            })
            .with_ty(Type::Ptr)),
            Const::BlockAddress { func, block } => Ok(Value::ptr(OraclePtr {
                addr: block_addr(*func, *block),
                prov: NULL_PROVENANCE,
            })
            .with_ty(Type::Ptr)),
            Const::Expr { expr } => self.eval_const_expr(expr),
        }
    }

    fn eval_const_expr(&mut self, expr: &ConstExpr) -> Result<Value> {
        let layout = self.module.layout;
        match expr {
            ConstExpr::Cast { op, src, src_ty, to } => {
                let value = self.eval_const(src)?;
                self.apply_cast(*op, &value, src_ty, to)
            }
            ConstExpr::Gep { base, source_ty, indices } => {
                let base = self.eval_const(base)?.as_ptr()?;
                let idxs = indices
                    .iter()
                    .map(|c| Ok(self.eval_const(c)?.as_int()?.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let delta = eval::gep_offset(source_ty, &idxs, &layout)?;
                Ok(Value::ptr(self.oracle.gep(base, delta)).with_ty(Type::Ptr))
            }
            ConstExpr::ICmp { pred, ty, lhs, rhs } => {
                let (l, r) = (self.eval_const(lhs)?, self.eval_const(rhs)?);
                eval::icmp(*pred, &l, &r, ty)
            }
            ConstExpr::FCmp { pred, ty, lhs, rhs } => {
                let (l, r) = (self.eval_const(lhs)?, self.eval_const(rhs)?);
                eval::fcmp(*pred, &l, &r, ty)
            }
            ConstExpr::Select { cond, cond_ty, on_true, on_false } => {
                let c = self.eval_const(cond)?;
                let (t, f) = (self.eval_const(on_true)?, self.eval_const(on_false)?);
                eval::select(&c, &t, &f, cond_ty)
            }
            ConstExpr::Bin { op, ty, lhs, rhs } => {
                let (l, r) = (self.eval_const(lhs)?, self.eval_const(rhs)?);
                eval::binop(*op, &l, &r, ty)
            }
        }
    }

    /// Casts, including the two that must consult the oracle.
    fn apply_cast(&mut self, op: CastOp, src: &Value, src_ty: &Type, to: &Type) -> Result<Value> {
        let layout = self.module.layout;
        match op {
            CastOp::PtrToInt => {
                let ptr = src.as_ptr()?;
                let n = self.oracle.ptr_to_int(ptr);
                let bits = to.scalar_bits(&layout);
                Ok(Value::int(ApInt::from_u64(64, n).zext_or_trunc(bits)))
            }
            CastOp::IntToPtr => {
                let n = src.as_int()?.zext_or_trunc(64).to_u64();
                Ok(Value::ptr(self.oracle.int_to_ptr(n)))
            }
            _ => eval::cast(op, src, src_ty, to, &layout),
        }
    }

    // ---- calls ----

    /// Push a frame for `func`. Declarations are handed to the oracle
    /// immediately: the placeholder frame is popped again and the caller is
    /// marked as awaiting an external return.
    fn call_function(&mut self, func: FuncId, args: &[Value]) -> Result<()> {
        let (params, is_decl, name, ret) = {
            let f = self
                .module
                .func(func)
                .ok_or_else(|| CoreError::Malformed(format!("no function f{}", func.0)))?;
            (f.params.clone(), f.is_declaration(), f.name.clone(), f.sig.ret.clone())
        };
        self.cur_thread_mut()?.frames.push(Frame::new(func));
        if is_decl {
            debug!(callee = %name, "external call by name");
            let failed = self.oracle.call_by_name(args, &name, &ret);
            self.cur_thread_mut()?.frames.pop();
            if failed {
                self.latch_error(None);
            } else if let Some(top) = self.cur_thread_mut()?.frames.last_mut() {
                top.must_resolve_pending_return = true;
            }
            return Ok(());
        }
        if args.len() < params.len() {
            return Err(CoreError::Malformed(format!(
                "function '{name}' called with {} of {} arguments",
                args.len(),
                params.len()
            )));
        }
        let frame = self.top_mut()?;
        for (param, arg) in params.iter().zip(args) {
            frame.values.insert(*param, arg.clone());
        }
        frame.varargs = args[params.len()..].to_vec();
        Ok(())
    }

    fn resolve_pending_return(&mut self, value: Value) -> Result<()> {
        let (func, caller_pos) = {
            let frame = self.top()?;
            let pos = frame.caller.ok_or_else(|| {
                CoreError::Protocol("pending return without an outstanding call".into())
            })?;
            (frame.func, pos)
        };
        let caller = self.inst_at(func, caller_pos)?.clone();
        {
            let frame = self.top_mut()?;
            frame.must_resolve_pending_return = false;
            frame.caller = None;
        }
        if let Some(result) = caller.result {
            self.top_mut()?.values.insert(result, value);
        }
        if let InstKind::Call { normal: Some(dest), .. } = caller.kind {
            self.switch_block(dest)?;
        }
        Ok(())
    }

    // ---- control flow ----

    /// Jump to `dest` and run its leading phi nodes atomically: all incoming
    /// values are read against the old frame state before any are written.
    fn switch_block(&mut self, dest: BlockId) -> Result<()> {
        let (func, prev) = {
            let frame = self.top()?;
            (frame.func, frame.block)
        };
        let phis: Vec<Inst> = self
            .module
            .func(func)
            .and_then(|f| f.block(dest))
            .ok_or_else(|| {
                CoreError::Malformed(format!("branch to missing block b{}", dest.0))
            })?
            .insts
            .iter()
            .take_while(|i| matches!(i.kind, InstKind::Phi { .. }))
            .cloned()
            .collect();
        {
            let frame = self.top_mut()?;
            frame.block = dest;
            frame.cursor = phis.len();
        }
        if phis.is_empty() {
            return Ok(());
        }
        let mut staged: Vec<(Option<ValueId>, Value)> = Vec::with_capacity(phis.len());
        for phi in &phis {
            let InstKind::Phi { incoming, .. } = &phi.kind else { unreachable!() };
            let op = incoming
                .iter()
                .find(|(block, _)| *block == prev)
                .map(|(_, op)| op)
                .ok_or_else(|| {
                    CoreError::Malformed(format!(
                        "phi in b{} has no entry for predecessor b{}",
                        dest.0, prev.0
                    ))
                })?;
            staged.push((phi.result, self.eval_operand(op)?));
        }
        for (result, value) in staged {
            if let Some(id) = result {
                self.top_mut()?.values.insert(id, value);
            }
        }
        Ok(())
    }

    // ---- dispatch ----

    fn dispatch(&mut self, inst: &Inst, pos: InstPos) -> Result<()> {
        let layout = self.module.layout;
        match &inst.kind {
            InstKind::Bin { op, ty, lhs, rhs } => {
                let (l, r) = (self.eval_operand(lhs)?, self.eval_operand(rhs)?);
                let out = eval::binop(*op, &l, &r, ty)?;
                self.set(inst, out)
            }
            InstKind::FNeg { ty, src } => {
                let s = self.eval_operand(src)?;
                let out = eval::fneg(&s, ty)?;
                self.set(inst, out)
            }
            InstKind::ICmp { pred, ty, lhs, rhs } => {
                let (l, r) = (self.eval_operand(lhs)?, self.eval_operand(rhs)?);
                let out = eval::icmp(*pred, &l, &r, ty)?;
                self.set(inst, out)
            }
            InstKind::FCmp { pred, ty, lhs, rhs } => {
                let (l, r) = (self.eval_operand(lhs)?, self.eval_operand(rhs)?);
                let out = eval::fcmp(*pred, &l, &r, ty)?;
                self.set(inst, out)
            }
            InstKind::Select { cond_ty, cond, on_true, on_false } => {
                let c = self.eval_operand(cond)?;
                let (t, f) = (self.eval_operand(on_true)?, self.eval_operand(on_false)?);
                let out = eval::select(&c, &t, &f, cond_ty)?;
                self.set(inst, out)
            }
            InstKind::Cast { cast, src_ty, src, to } => {
                let s = self.eval_operand(src)?;
                let out = self.apply_cast(*cast, &s, src_ty, to)?;
                self.set(inst, out.with_ty(to.clone()))
            }
            InstKind::Gep { base, source_ty, indices } => {
                let base = self.eval_operand(base)?.as_ptr()?;
                let idxs = indices
                    .iter()
                    .map(|op| Ok(self.eval_operand(op)?.as_int()?.clone()))
                    .collect::<Result<Vec<_>>>()?;
                let delta = eval::gep_offset(source_ty, &idxs, &layout)?;
                let out = self.oracle.gep(base, delta);
                self.set(inst, Value::ptr(out).with_ty(Type::Ptr))
            }
            InstKind::Load { ptr, ty } => {
                let target = self.eval_operand(ptr)?.as_ptr()?;
                let lowered = ty.lowered().clone();
                let size = lowered.store_size(&layout);
                let align = lowered.abi_align(&layout);
                let mut out = Value::default();
                if self.oracle.load(&mut out, target, &lowered, size, align) {
                    self.latch_error(Some(inst));
                    return Ok(());
                }
                self.set(inst, out.with_ty(ty.clone()))
            }
            InstKind::Store { value, value_ty, ptr } => {
                let v = self.eval_operand(value)?;
                let target = self.eval_operand(ptr)?.as_ptr()?;
                let lowered = value_ty.lowered().clone();
                let size = lowered.store_size(&layout);
                let align = lowered.abi_align(&layout);
                if self.oracle.store(&v, target, &lowered, size, align) {
                    self.latch_error(Some(inst));
                }
                Ok(())
            }
            InstKind::Alloca { ty, count, align } => {
                let n = self.eval_operand(count)?.as_int()?.to_u64();
                let size = (n * ty.alloc_size(&layout)).max(1);
                let ptr = self.oracle.malloc(size, (*align).max(1), false);
                if ptr.addr == 0 {
                    return Err(CoreError::Malformed("oracle returned a null allocation".into()));
                }
                trace!(addr = ptr.addr, size, "alloca");
                self.set(inst, Value::ptr(ptr).with_ty(Type::Ptr))?;
                self.top_mut()?.oracle_allocas.push(ptr);
                Ok(())
            }
            InstKind::VaStart { list } => {
                let slot = self.eval_operand(list)?.as_ptr()?;
                let depth = self.cur_thread()?.frames.len() as u32 - 1;
                let cursor = Value::pair(depth, 0);
                if self.store_va_slot(&cursor, slot) {
                    self.latch_error(Some(inst));
                }
                Ok(())
            }
            InstKind::VaArg { list, ty } => self.va_arg(inst, list, ty),
            InstKind::VaCopy { dst, src } => {
                let from = self.eval_operand(src)?.as_ptr()?;
                let to = self.eval_operand(dst)?.as_ptr()?;
                let mut slot = Value::default();
                if self.load_va_slot(&mut slot, from) || self.store_va_slot(&slot, to) {
                    self.latch_error(Some(inst));
                }
                Ok(())
            }
            InstKind::VaEnd { .. } => Ok(()),
            InstKind::ExtractValue { agg, indices } => {
                let a = self.eval_operand(agg)?;
                let out = eval::extract_value(&a, indices)?;
                self.set(inst, out)
            }
            InstKind::InsertValue { agg, value, indices } => {
                let a = self.eval_operand(agg)?;
                let v = self.eval_operand(value)?;
                let out = eval::insert_value(&a, v, indices)?;
                self.set(inst, out)
            }
            InstKind::ExtractElement { vector, index } => {
                let v = self.eval_operand(vector)?;
                let i = self.eval_operand(index)?;
                let out = eval::extract_element(&v, &i)?;
                self.set(inst, out)
            }
            InstKind::InsertElement { vector, value, index } => {
                let v = self.eval_operand(vector)?;
                let e = self.eval_operand(value)?;
                let i = self.eval_operand(index)?;
                let out = eval::insert_element(&v, e, &i)?;
                self.set(inst, out)
            }
            InstKind::ShuffleVector { a, b, mask } => {
                let av = self.eval_operand(a)?;
                let bv = self.eval_operand(b)?;
                let out = eval::shuffle(&av, &bv, mask)?;
                self.set(inst, out)
            }
            InstKind::Intrinsic { intr, ty, args } => {
                let vals =
                    args.iter().map(|a| self.eval_operand(a)).collect::<Result<Vec<_>>>()?;
                let out = eval::intrinsic(*intr, &vals, ty)?;
                self.set(inst, out)
            }
            InstKind::Phi { .. } => Err(CoreError::Malformed(
                "phi reached outside block entry".into(),
            )),
            InstKind::Br { dest } => self.switch_block(*dest),
            InstKind::CondBr { cond, on_true, on_false } => {
                let c = self.eval_operand(cond)?;
                let dest = if c.as_int()?.bit(0) { *on_true } else { *on_false };
                self.switch_block(dest)
            }
            InstKind::Switch { cond, cases, default, .. } => {
                let c = self.eval_operand(cond)?;
                let needle = c.as_int()?.clone();
                for (case, dest) in cases {
                    let candidate = self.eval_const(case)?;
                    if *candidate.as_int()? == needle {
                        return self.switch_block(*dest);
                    }
                }
                self.switch_block(*default)
            }
            InstKind::IndirectBr { addr, .. } => {
                let target = self.eval_operand(addr)?.as_ptr()?.addr;
                let (func, block) = *self.blocks_by_addr.get(&target).ok_or_else(|| {
                    CoreError::Malformed(format!("indirectbr to unknown address {target:#x}"))
                })?;
                if func != self.top()?.func {
                    return Err(CoreError::Malformed(
                        "indirectbr crosses a function boundary".into(),
                    ));
                }
                self.switch_block(block)
            }
            InstKind::Ret { value, ty } => {
                let result = match value {
                    Some(op) => Some(self.eval_operand(op)?),
                    None => None,
                };
                self.ret(result, ty)
            }
            InstKind::Unreachable => Err(CoreError::Unreachable),
            InstKind::Call { callee, sig, args, .. } => self.call(inst, pos, callee, sig, args),
        }
    }

    fn call(
        &mut self,
        inst: &Inst,
        pos: InstPos,
        callee: &Operand,
        sig: &Signature,
        args: &[Operand],
    ) -> Result<()> {
        self.top_mut()?.caller = Some(pos);
        let mut vals: ArgVec = SmallVec::with_capacity(args.len());
        for arg in args {
            vals.push(self.eval_operand(arg)?);
        }
        let target = self.eval_operand(callee)?;
        // Non-null provenance marks a pointer-typed function reference owned
        // by the oracle's world; everything else is a direct address.
        if !target.prov.is_null() {
            let ptr = target.as_ptr()?;
            debug!(addr = ptr.addr, "external call by pointer");
            let failed = self.oracle.call_by_pointer(ptr, &vals, &sig.ret);
            if failed {
                self.latch_error(Some(inst));
            } else {
                self.top_mut()?.must_resolve_pending_return = true;
            }
            return Ok(());
        }
        let addr = target.as_ptr()?.addr;
        let func = *self.funcs_by_addr.get(&addr).ok_or_else(|| {
            CoreError::Unsupported(format!("call target {addr:#x} does not name a function"))
        })?;
        self.call_function(func, &vals)
    }

    /// Pop the returning frame, release its allocas, and deliver the value to
    /// the caller's SSA slot — or to the thread's exit slot if the stack
    /// emptied. An invoke caller also branches to its normal successor.
    fn ret(&mut self, result: Option<Value>, ret_ty: &Type) -> Result<()> {
        let mut frame = self.cur_thread_mut()?.frames.pop().ok_or(CoreError::EmptyStack)?;
        while let Some(ptr) = frame.oracle_allocas.pop() {
            self.oracle.free(ptr);
        }
        if self.cur_thread()?.frames.is_empty() {
            let exit = if ret_ty.is_void() {
                Value::default()
            } else {
                result.unwrap_or_default()
            };
            self.cur_thread_mut()?.exit = Some(exit);
            return Ok(());
        }
        let (func, caller_pos) = {
            let caller_frame = self.top()?;
            match caller_frame.caller {
                Some(pos) => (caller_frame.func, pos),
                None => return Ok(()),
            }
        };
        let caller = self.inst_at(func, caller_pos)?.clone();
        if let (Some(id), Some(value)) = (caller.result, result) {
            self.top_mut()?.values.insert(id, value);
        }
        self.top_mut()?.caller = None;
        if let InstKind::Call { normal: Some(dest), .. } = caller.kind {
            self.switch_block(dest)?;
        }
        Ok(())
    }

    // ---- varargs ----

    fn va_slot_ty() -> Type {
        Type::int(64)
    }

    fn store_va_slot(&mut self, value: &Value, at: OraclePtr) -> bool {
        self.oracle.store(value, at, &Self::va_slot_ty(), 8, 8)
    }

    fn load_va_slot(&mut self, out: &mut Value, at: OraclePtr) -> bool {
        self.oracle.load(out, at, &Self::va_slot_ty(), 8, 8)
    }

    fn va_arg(&mut self, inst: &Inst, list: &Operand, ty: &Type) -> Result<()> {
        let slot = self.eval_operand(list)?.as_ptr()?;
        let mut raw = Value::default();
        if self.load_va_slot(&mut raw, slot) {
            self.latch_error(Some(inst));
            return Ok(());
        }
        let (frame_idx, arg_idx) = pair_encoding(&raw)?;
        let frames = &self.cur_thread()?.frames;
        let owner = frames.get(frame_idx as usize).ok_or_else(|| {
            CoreError::Malformed(format!(
                "va_list frame index {frame_idx} out of range for stack of {}",
                frames.len()
            ))
        })?;
        let arg = owner.varargs.get(arg_idx as usize).cloned().ok_or_else(|| {
            CoreError::Malformed(format!(
                "va_list argument index {arg_idx} out of range for {} varargs",
                owner.varargs.len()
            ))
        })?;
        self.set(inst, arg.with_ty(ty.clone()))?;
        let bumped = Value::pair(frame_idx, arg_idx + 1);
        if self.store_va_slot(&bumped, slot) {
            self.latch_error(Some(inst));
        }
        Ok(())
    }

    // ---- errors ----

    /// Latch the error flag and capture a stack trace: the faulting
    /// instruction's location first, then every outstanding call site from
    /// the top frame downwards. The oracle sees the trace plus the rendered
    /// faulting instruction.
    fn latch_error(&mut self, inst: Option<&Inst>) {
        if let Some(loc) = inst.and_then(|i| i.loc.as_ref()) {
            self.stack_trace.push(loc.into());
        }
        let callers: Vec<(FuncId, InstPos)> = self
            .cur_thread()
            .map(|t| {
                t.frames
                    .iter()
                    .rev()
                    .filter_map(|f| f.caller.map(|pos| (f.func, pos)))
                    .collect()
            })
            .unwrap_or_default();
        for (func, pos) in callers {
            if let Ok(call) = self.inst_at(func, pos) {
                if let Some(loc) = &call.loc {
                    self.stack_trace.push(loc.into());
                }
            }
        }
        let text = inst.map(|i| i.to_string()).unwrap_or_default();
        self.oracle.record_stack_trace(&self.stack_trace, &text);
        self.error = true;
        debug!(inst = %text, "memory error latched");
    }
}

fn func_addr(func: FuncId) -> u64 {
    FUNC_ADDR_BASE + (func.0 as u64) * 16
}

fn block_addr(func: FuncId, block: BlockId) -> u64 {
    BLOCK_ADDR_BASE + ((func.0 as u64) << 24 | block.0 as u64) * 8
}

fn pair_encoding(value: &Value) -> Result<(u32, u32)> {
    match &value.payload {
        Payload::Pair(first, second) => Ok((*first, *second)),
        Payload::Int(raw) => {
            let packed = raw.to_u64();
            Ok((packed as u32, (packed >> 32) as u32))
        }
        other => Err(CoreError::TypeMismatch(format!(
            "va_list slot holds {other:?}, not a packed pair"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinAlu, FunctionBuilder, Module, Signature};
    use crate::oracle::FlatMemory;

    fn ret_const_module(value: u64) -> (Module, FuncId) {
        let mut module = Module::default();
        let sig = Signature { params: vec![], ret: Type::int(32), vararg: false };
        let mut fb = FunctionBuilder::new("main", sig);
        fb.push_void(InstKind::Ret {
            value: Some(Operand::int(32, value)),
            ty: Type::int(32),
        });
        let f = module.add_function(fb.finish());
        (module, f)
    }

    #[test]
    fn ret_of_constant_fold() {
        // ret (add i32 2, 3) through a constant expression
        let mut module = Module::default();
        let sig = Signature { params: vec![], ret: Type::int(32), vararg: false };
        let mut fb = FunctionBuilder::new("main", sig);
        let folded = Const::Expr {
            expr: Box::new(ConstExpr::Bin {
                op: BinAlu::Add,
                ty: Type::int(32),
                lhs: Const::int(32, 2),
                rhs: Const::int(32, 3),
            }),
        };
        fb.push_void(InstKind::Ret {
            value: Some(Operand::Const { value: folded }),
            ty: Type::int(32),
        });
        let f = module.add_function(fb.finish());

        let mut m = Machine::new(module, FlatMemory::default());
        m.create_thread(1, f, vec![]).expect("create");
        assert!(m.step_thread(1, None).expect("step"));
        let exit = m.thread_exit_value(1).expect("exit");
        assert_eq!(exit.as_int().expect("int").to_u64(), 5);
    }

    #[test]
    fn stepping_missing_thread_is_an_error() {
        let (module, _) = ret_const_module(0);
        let mut m = Machine::new(module, FlatMemory::default());
        assert!(matches!(m.step_thread(9, None), Err(CoreError::NoSuchThread(9))));
    }

    #[test]
    fn unexpected_pending_return_is_a_protocol_error() {
        let (module, f) = ret_const_module(1);
        let mut m = Machine::new(module, FlatMemory::default());
        m.create_thread(1, f, vec![]).expect("create");
        let err = m.step_thread(1, Some(Value::default())).expect_err("protocol");
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[test]
    fn two_threads_keep_independent_exits() {
        let mut module = Module::default();
        let mut ids = vec![];
        for value in [11u64, 22] {
            let sig = Signature { params: vec![], ret: Type::int(32), vararg: false };
            let mut fb = FunctionBuilder::new(format!("t{value}"), sig);
            fb.push_void(InstKind::Ret {
                value: Some(Operand::int(32, value)),
                ty: Type::int(32),
            });
            ids.push(module.add_function(fb.finish()));
        }
        let mut m = Machine::new(module, FlatMemory::default());
        m.create_thread(1, ids[0], vec![]).expect("create");
        m.create_thread(2, ids[1], vec![]).expect("create");
        assert!(m.step_thread(2, None).expect("step"));
        assert!(m.step_thread(1, None).expect("step"));
        assert_eq!(m.thread_exit_value(1).expect("exit").as_int().expect("int").to_u64(), 11);
        assert_eq!(m.thread_exit_value(2).expect("exit").as_int().expect("int").to_u64(), 22);
    }
}
