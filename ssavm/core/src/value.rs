//! Runtime values and pointer provenance.
//!
//! Every value that can hold an address carries a [`Provenance`] pair next to
//! the payload; `(0, 0)` means "no provenance" (plain integer or null). The
//! pair is opaque to the interpreter — only the oracle assigns meaning to it.

use crate::apint::ApInt;
use crate::ir::Type;
use crate::{CoreError, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Provenance {
    pub alloc_id: u64,
    pub tag: u64,
}

pub const NULL_PROVENANCE: Provenance = Provenance { alloc_id: 0, tag: 0 };

impl Provenance {
    pub fn is_null(&self) -> bool {
        *self == NULL_PROVENANCE
    }
}

/// The pointer triple exchanged with the oracle on every hook call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OraclePtr {
    pub addr: u64,
    pub prov: Provenance,
}

impl OraclePtr {
    pub fn null() -> OraclePtr {
        OraclePtr { addr: 0, prov: NULL_PROVENANCE }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    Int(ApInt),
    Float(f32),
    Double(f64),
    /// Address half of a pointer; provenance lives on the enclosing value.
    Ptr(u64),
    /// Two packed 32-bit indices; the varargs cursor encoding.
    Pair(u32, u32),
    Agg(Vec<Value>),
}

impl Payload {
    fn name(&self) -> &'static str {
        match self {
            Payload::Int(_) => "int",
            Payload::Float(_) => "float",
            Payload::Double(_) => "double",
            Payload::Ptr(_) => "ptr",
            Payload::Pair(..) => "pair",
            Payload::Agg(_) => "aggregate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Value {
    pub payload: Payload,
    pub prov: Provenance,
    /// IR type stamped on by operand resolution; `None` for values produced
    /// before a type is known (e.g. oracle scratch).
    pub ty: Option<Type>,
}

impl Default for Value {
    fn default() -> Self {
        Value::int(ApInt::zero(1))
    }
}

impl Value {
    pub fn int(value: ApInt) -> Value {
        Value { payload: Payload::Int(value), prov: NULL_PROVENANCE, ty: None }
    }

    pub fn from_bool(value: bool) -> Value {
        Value::int(ApInt::from_bool(value))
    }

    pub fn float(value: f32) -> Value {
        Value { payload: Payload::Float(value), prov: NULL_PROVENANCE, ty: None }
    }

    pub fn double(value: f64) -> Value {
        Value { payload: Payload::Double(value), prov: NULL_PROVENANCE, ty: None }
    }

    pub fn ptr(ptr: OraclePtr) -> Value {
        Value { payload: Payload::Ptr(ptr.addr), prov: ptr.prov, ty: None }
    }

    pub fn pair(first: u32, second: u32) -> Value {
        Value { payload: Payload::Pair(first, second), prov: NULL_PROVENANCE, ty: None }
    }

    pub fn agg(elems: Vec<Value>) -> Value {
        Value { payload: Payload::Agg(elems), prov: NULL_PROVENANCE, ty: None }
    }

    pub fn with_ty(mut self, ty: Type) -> Value {
        self.ty = Some(ty);
        self
    }

    pub fn as_int(&self) -> Result<&ApInt> {
        match &self.payload {
            Payload::Int(v) => Ok(v),
            other => Err(CoreError::TypeMismatch(format!("expected int, found {}", other.name()))),
        }
    }

    pub fn as_float(&self) -> Result<f32> {
        match self.payload {
            Payload::Float(v) => Ok(v),
            ref other => {
                Err(CoreError::TypeMismatch(format!("expected float, found {}", other.name())))
            }
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self.payload {
            Payload::Double(v) => Ok(v),
            ref other => {
                Err(CoreError::TypeMismatch(format!("expected double, found {}", other.name())))
            }
        }
    }

    /// Reconstitute the `(address, provenance)` pair of a pointer value.
    pub fn as_ptr(&self) -> Result<OraclePtr> {
        match self.payload {
            Payload::Ptr(addr) => Ok(OraclePtr { addr, prov: self.prov }),
            ref other => {
                Err(CoreError::TypeMismatch(format!("expected ptr, found {}", other.name())))
            }
        }
    }

    pub fn as_pair(&self) -> Result<(u32, u32)> {
        match self.payload {
            Payload::Pair(a, b) => Ok((a, b)),
            ref other => {
                Err(CoreError::TypeMismatch(format!("expected pair, found {}", other.name())))
            }
        }
    }

    pub fn as_agg(&self) -> Result<&[Value]> {
        match &self.payload {
            Payload::Agg(elems) => Ok(elems),
            other => {
                Err(CoreError::TypeMismatch(format!("expected aggregate, found {}", other.name())))
            }
        }
    }

    pub fn as_agg_mut(&mut self) -> Result<&mut Vec<Value>> {
        match &mut self.payload {
            Payload::Agg(elems) => Ok(elems),
            other => {
                Err(CoreError::TypeMismatch(format!("expected aggregate, found {}", other.name())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_round_trips_provenance() {
        let p = OraclePtr { addr: 0x4000, prov: Provenance { alloc_id: 7, tag: 99 } };
        let v = Value::ptr(p);
        assert_eq!(v.as_ptr().expect("ptr"), p);
    }

    #[test]
    fn mismatched_access_is_an_error() {
        let v = Value::float(1.5);
        assert!(v.as_int().is_err());
        assert!(v.as_ptr().is_err());
    }
}
