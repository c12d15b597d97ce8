pub mod apint;
pub mod interp;
pub mod ir;
pub mod oracle;
pub mod value;

use thiserror::Error;

pub use apint::ApInt;
pub use interp::frame::{Frame, Thread};
pub use interp::machine::{ExitReason, Machine};
pub use ir::{
    Block, BlockId, Const, DataLayout, FuncId, Function, FunctionBuilder, GlobalId, Inst, InstKind,
    Module, Operand, Signature, SourceLoc, Type, ValueId,
};
pub use oracle::{ErrorTrace, FlatMemory, Oracle};
pub use value::{OraclePtr, Provenance, Value, NULL_PROVENANCE};

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unsupported instruction: {0}")]
    Unsupported(String),
    #[error("invalid cast: {0}")]
    InvalidCast(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("thread {0} not found")]
    NoSuchThread(u64),
    #[error("frame stack is empty")]
    EmptyStack,
    #[error("pending-return protocol violation: {0}")]
    Protocol(String),
    #[error("invalid shuffle mask index {0}")]
    InvalidMask(i32),
    #[error("program executed an 'unreachable' instruction")]
    Unreachable,
    #[error("{0}")]
    Malformed(String),
}
