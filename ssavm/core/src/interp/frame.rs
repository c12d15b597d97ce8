//! Activation records and logical threads.

use crate::ir::{BlockId, FuncId, ValueId};
use crate::value::{OraclePtr, Value};
use smallvec::SmallVec;
use std::collections::HashMap;

/// Position of an instruction inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstPos {
    pub block: BlockId,
    pub index: usize,
}

/// One stack frame: the SSA environment of a single invocation.
#[derive(Debug)]
pub struct Frame {
    pub func: FuncId,
    pub block: BlockId,
    /// Index of the next instruction to execute within `block`.
    pub cursor: usize,
    /// The call or invoke currently outstanding in this frame, if any.
    pub caller: Option<InstPos>,
    pub must_resolve_pending_return: bool,
    pub values: HashMap<ValueId, Value>,
    /// Arguments passed beyond the declared parameter list.
    pub varargs: Vec<Value>,
    /// Oracle allocations owned by this frame, released LIFO on pop.
    pub oracle_allocas: SmallVec<[OraclePtr; 4]>,
}

impl Frame {
    pub fn new(func: FuncId) -> Frame {
        Frame {
            func,
            block: BlockId(0),
            cursor: 0,
            caller: None,
            must_resolve_pending_return: false,
            values: HashMap::new(),
            varargs: Vec::new(),
            oracle_allocas: SmallVec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Thread {
    pub id: u64,
    /// Top of the stack (last element) is the executing frame.
    pub frames: Vec<Frame>,
    pub exit: Option<Value>,
    pub init_args: Vec<Value>,
}

impl Thread {
    pub fn new(id: u64, init_args: Vec<Value>) -> Thread {
        Thread { id, frames: Vec::new(), exit: None, init_args }
    }
}
