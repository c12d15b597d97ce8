//! The memory oracle boundary.
//!
//! Every memory effect of the interpreter — allocation, loads, stores,
//! pointer arithmetic, integer/pointer casts, external calls, global
//! registration, error reporting — funnels through the [`Oracle`] trait. The
//! interpreter owns no simulated memory of its own and never assigns meaning
//! to an address or a provenance tag.
//!
//! [`FlatMemory`] is the in-crate reference oracle: a flat byte buffer with
//! bump allocation, little-endian scalar encoding and enough bookkeeping to
//! drive the integration tests and the CLI.

use crate::apint::ApInt;
use crate::ir::{struct_layout, DataLayout, SourceLoc, Type};
use crate::value::{OraclePtr, Payload, Provenance, Value, NULL_PROVENANCE};
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::HashMap;
use tracing::trace;

/// One captured stack-trace entry: the source location of a call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorTrace {
    pub dir: String,
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl From<&SourceLoc> for ErrorTrace {
    fn from(loc: &SourceLoc) -> Self {
        ErrorTrace { dir: loc.dir.clone(), file: loc.file.clone(), line: loc.line, col: loc.col }
    }
}

/// Hook table presented by the external memory oracle. Boolean returns use
/// `true` for failure, matching the wire convention.
pub trait Oracle {
    fn malloc(&mut self, size: u64, align: u64, is_stack: bool) -> OraclePtr;

    fn free(&mut self, ptr: OraclePtr) -> bool;

    fn load(&mut self, out: &mut Value, ptr: OraclePtr, ty: &Type, size: u64, align: u64) -> bool;

    fn store(&mut self, value: &Value, ptr: OraclePtr, ty: &Type, size: u64, align: u64) -> bool;

    fn memset(&mut self, ptr: OraclePtr, byte: i32, len: u64) -> bool;

    fn memcpy(&mut self, ptr: OraclePtr, src: &[u8], len: u64) -> bool;

    fn int_to_ptr(&mut self, addr: u64) -> OraclePtr {
        OraclePtr { addr, prov: NULL_PROVENANCE }
    }

    fn ptr_to_int(&mut self, ptr: OraclePtr) -> u64 {
        ptr.addr
    }

    /// Apply a byte delta produced by address arithmetic. The oracle decides
    /// whether provenance survives the move.
    fn gep(&mut self, base: OraclePtr, delta: u64) -> OraclePtr {
        OraclePtr { addr: base.addr.wrapping_add(delta), prov: base.prov }
    }

    fn register_global(&mut self, name: &str, size: u64, ptr: OraclePtr) -> bool;

    /// A call resolved to an external declaration. The return value is
    /// delivered out-of-band on the next step of the suspended thread.
    fn call_by_name(&mut self, args: &[Value], name: &str, ret: &Type) -> bool;

    /// A call through a pointer-typed function reference.
    fn call_by_pointer(&mut self, target: OraclePtr, args: &[Value], ret: &Type) -> bool;

    fn record_stack_trace(&mut self, _traces: &[ErrorTrace], _last_inst: &str) {}
}

/// Counters over the hook traffic, readable by tests and the CLI.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OracleStats {
    pub mallocs: u64,
    pub frees: u64,
    pub loads: u64,
    pub stores: u64,
}

/// One external call observed by [`FlatMemory`].
#[derive(Debug, Clone)]
pub struct ExternalCall {
    pub name: Option<String>,
    pub target: Option<OraclePtr>,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    addr: u64,
    size: u64,
}

/// Reference oracle over a flat byte array.
///
/// Addresses are offsets into the buffer; address zero is never handed out.
/// Each allocation gets a fresh `alloc_id`; stored pointers keep their
/// provenance in a side table so a later load reconstitutes it.
pub struct FlatMemory {
    mem: Vec<u8>,
    next: u64,
    next_alloc_id: u64,
    live: HashMap<u64, Allocation>,
    ptr_provs: HashMap<u64, Provenance>,
    globals: HashMap<String, OraclePtr>,
    layout: DataLayout,
    fail_ranges: Vec<(u64, u64)>,
    fail_calls: bool,
    pub stats: OracleStats,
    /// `alloc_id`s in the order they were freed.
    pub freed: Vec<u64>,
    pub geps: Vec<(OraclePtr, u64)>,
    pub calls: Vec<ExternalCall>,
    pub last_trace: Option<(Vec<ErrorTrace>, String)>,
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::with_capacity(64 * 1024)
    }
}

impl FlatMemory {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            mem: vec![0; bytes],
            next: 8,
            next_alloc_id: 1,
            live: HashMap::new(),
            ptr_provs: HashMap::new(),
            globals: HashMap::new(),
            layout: DataLayout::default(),
            fail_ranges: Vec::new(),
            fail_calls: false,
            stats: OracleStats::default(),
            freed: Vec::new(),
            geps: Vec::new(),
            calls: Vec::new(),
            last_trace: None,
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub fn global_ptr(&self, name: &str) -> Option<OraclePtr> {
        self.globals.get(name).copied()
    }

    /// Make every access touching `[start, start + len)` report failure.
    pub fn poison_range(&mut self, start: u64, len: u64) {
        self.fail_ranges.push((start, len));
    }

    /// Make external-call hooks report failure.
    pub fn fail_calls(&mut self, fail: bool) {
        self.fail_calls = fail;
    }

    fn faulty(&self, addr: u64, len: u64) -> bool {
        if addr.checked_add(len).map_or(true, |end| end > self.mem.len() as u64) {
            return true;
        }
        self.fail_ranges
            .iter()
            .any(|&(start, flen)| addr < start + flen && start < addr + len.max(1))
    }

    fn write_int_bytes(&mut self, mag: &BigUint, at: u64, size: u64) {
        let mut bytes = mag.to_bytes_le();
        bytes.resize(size as usize, 0);
        if !self.layout.little_endian {
            bytes.reverse();
        }
        self.mem[at as usize..(at + size) as usize].copy_from_slice(&bytes);
    }

    fn read_int_bytes(&self, at: u64, size: u64) -> BigUint {
        let mut bytes = self.mem[at as usize..(at + size) as usize].to_vec();
        if !self.layout.little_endian {
            bytes.reverse();
        }
        BigUint::from_bytes_le(&bytes)
    }

    fn encode(&mut self, value: &Value, ty: &Type, at: u64) -> bool {
        let ty = ty.lowered();
        match (ty, &value.payload) {
            (Type::Int { bits }, Payload::Int(v)) => {
                let size = (*bits as u64).div_ceil(8);
                self.write_int_bytes(&BigUint::from_bytes_le(&v.to_bytes_le()), at, size);
                self.ptr_provs.remove(&at);
                false
            }
            // The varargs cursor travels as a 64-bit slot; store it verbatim.
            (Type::Int { bits: 64 }, Payload::Pair(a, b)) => {
                let packed = (*a as u64) | ((*b as u64) << 32);
                self.write_int_bytes(&BigUint::from(packed), at, 8);
                self.ptr_provs.remove(&at);
                false
            }
            (Type::Float, Payload::Float(v)) => {
                self.write_int_bytes(&BigUint::from(v.to_bits()), at, 4);
                false
            }
            (Type::Double, Payload::Double(v)) => {
                self.write_int_bytes(&BigUint::from(v.to_bits()), at, 8);
                false
            }
            (Type::Ptr, Payload::Ptr(addr)) => {
                self.write_int_bytes(&BigUint::from(*addr), at, self.layout.ptr_bytes);
                if value.prov.is_null() {
                    self.ptr_provs.remove(&at);
                } else {
                    self.ptr_provs.insert(at, value.prov);
                }
                false
            }
            (Type::Vector { elem, .. }, Payload::Agg(elems)) => {
                let layout = self.layout;
                let stride = elem.store_size(&layout);
                elems
                    .iter()
                    .enumerate()
                    .any(|(i, e)| self.encode(e, elem, at + stride * i as u64))
            }
            (Type::Array { elem, .. }, Payload::Agg(elems)) => {
                let layout = self.layout;
                let stride = elem.alloc_size(&layout);
                elems
                    .iter()
                    .enumerate()
                    .any(|(i, e)| self.encode(e, elem, at + stride * i as u64))
            }
            (Type::Struct { fields }, Payload::Agg(elems)) => {
                if elems.len() != fields.len() {
                    return true;
                }
                let layout = self.layout;
                let offsets = struct_layout(fields, &layout).offsets;
                elems
                    .iter()
                    .zip(fields)
                    .zip(offsets)
                    .any(|((e, fty), off)| self.encode(e, fty, at + off))
            }
            _ => true,
        }
    }

    fn decode(&self, ty: &Type, at: u64) -> Option<Value> {
        let ty = ty.lowered();
        match ty {
            Type::Int { bits } => {
                let size = (*bits as u64).div_ceil(8);
                let mag = self.read_int_bytes(at, size);
                Some(Value::int(ApInt::new(*bits, mag)))
            }
            Type::Float => {
                let bits = self.read_int_bytes(at, 4).iter_u32_digits().next().unwrap_or(0);
                Some(Value::float(f32::from_bits(bits)))
            }
            Type::Double => {
                let bits = self.read_int_bytes(at, 8).iter_u64_digits().next().unwrap_or(0);
                Some(Value::double(f64::from_bits(bits)))
            }
            Type::Ptr => {
                let addr =
                    self.read_int_bytes(at, self.layout.ptr_bytes).iter_u64_digits().next().unwrap_or(0);
                let prov = self.ptr_provs.get(&at).copied().unwrap_or(NULL_PROVENANCE);
                Some(Value::ptr(OraclePtr { addr, prov }))
            }
            Type::Vector { elem, lanes } => {
                let stride = elem.store_size(&self.layout);
                let elems = (0..*lanes as u64)
                    .map(|i| self.decode(elem, at + stride * i))
                    .collect::<Option<Vec<_>>>()?;
                Some(Value::agg(elems))
            }
            Type::Array { elem, len } => {
                let stride = elem.alloc_size(&self.layout);
                let elems = (0..*len)
                    .map(|i| self.decode(elem, at + stride * i))
                    .collect::<Option<Vec<_>>>()?;
                Some(Value::agg(elems))
            }
            Type::Struct { fields } => {
                let offsets = struct_layout(fields, &self.layout).offsets;
                let elems = fields
                    .iter()
                    .zip(offsets)
                    .map(|(fty, off)| self.decode(fty, at + off))
                    .collect::<Option<Vec<_>>>()?;
                Some(Value::agg(elems))
            }
            _ => None,
        }
    }
}

impl Oracle for FlatMemory {
    fn malloc(&mut self, size: u64, align: u64, _is_stack: bool) -> OraclePtr {
        let align = align.max(1).next_power_of_two();
        let addr = (self.next + align - 1) & !(align - 1);
        let size = size.max(1);
        if addr + size > self.mem.len() as u64 {
            return OraclePtr::null();
        }
        self.next = addr + size;
        let alloc_id = self.next_alloc_id;
        self.next_alloc_id += 1;
        self.live.insert(alloc_id, Allocation { addr, size });
        self.stats.mallocs += 1;
        trace!(alloc_id, addr, size, "oracle malloc");
        OraclePtr { addr, prov: Provenance { alloc_id, tag: alloc_id } }
    }

    fn free(&mut self, ptr: OraclePtr) -> bool {
        self.stats.frees += 1;
        self.freed.push(ptr.prov.alloc_id);
        trace!(alloc_id = ptr.prov.alloc_id, "oracle free");
        self.live.remove(&ptr.prov.alloc_id).is_none()
    }

    fn load(&mut self, out: &mut Value, ptr: OraclePtr, ty: &Type, size: u64, _align: u64) -> bool {
        self.stats.loads += 1;
        if self.faulty(ptr.addr, size) {
            return true;
        }
        match self.decode(ty, ptr.addr) {
            Some(v) => {
                *out = v;
                false
            }
            None => true,
        }
    }

    fn store(&mut self, value: &Value, ptr: OraclePtr, ty: &Type, size: u64, _align: u64) -> bool {
        self.stats.stores += 1;
        if self.faulty(ptr.addr, size) {
            return true;
        }
        self.encode(value, ty, ptr.addr)
    }

    fn memset(&mut self, ptr: OraclePtr, byte: i32, len: u64) -> bool {
        if self.faulty(ptr.addr, len) {
            return true;
        }
        let start = ptr.addr as usize;
        self.mem[start..start + len as usize].fill(byte as u8);
        false
    }

    fn memcpy(&mut self, ptr: OraclePtr, src: &[u8], len: u64) -> bool {
        if len as usize > src.len() || self.faulty(ptr.addr, len) {
            return true;
        }
        let start = ptr.addr as usize;
        self.mem[start..start + len as usize].copy_from_slice(&src[..len as usize]);
        false
    }

    fn int_to_ptr(&mut self, addr: u64) -> OraclePtr {
        let prov = self
            .live
            .iter()
            .find(|(_, a)| addr >= a.addr && addr < a.addr + a.size)
            .map(|(id, _)| Provenance { alloc_id: *id, tag: *id })
            .unwrap_or(NULL_PROVENANCE);
        OraclePtr { addr, prov }
    }

    fn gep(&mut self, base: OraclePtr, delta: u64) -> OraclePtr {
        self.geps.push((base, delta));
        OraclePtr { addr: base.addr.wrapping_add(delta), prov: base.prov }
    }

    fn register_global(&mut self, name: &str, _size: u64, ptr: OraclePtr) -> bool {
        self.globals.insert(name.to_string(), ptr);
        false
    }

    fn call_by_name(&mut self, args: &[Value], name: &str, _ret: &Type) -> bool {
        self.calls.push(ExternalCall {
            name: Some(name.to_string()),
            target: None,
            args: args.to_vec(),
        });
        self.fail_calls
    }

    fn call_by_pointer(&mut self, target: OraclePtr, args: &[Value], _ret: &Type) -> bool {
        self.calls.push(ExternalCall { name: None, target: Some(target), args: args.to_vec() });
        self.fail_calls
    }

    fn record_stack_trace(&mut self, traces: &[ErrorTrace], last_inst: &str) {
        self.last_trace = Some((traces.to_vec(), last_inst.to_string()));
    }
}
