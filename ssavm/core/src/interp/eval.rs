//! Operator kernels.
//!
//! Pure value-to-value computation: compares, arithmetic, shifts, casts, the
//! bitcast reshape, aggregate and vector surgery, GEP offset folding and the
//! few first-class intrinsics. Everything that touches memory or the oracle
//! lives in the machine; these functions never observe an address space.

use crate::apint::ApInt;
use crate::ir::{
    struct_layout, BinAlu, CastOp, DataLayout, FloatPredicate, IntPredicate, IntrinsicOp, Type,
};
use crate::value::{Payload, Value};
use crate::{CoreError, Result};

/// LLVM's shift-amount rule: amounts below the value width pass through,
/// anything else is masked by `next_power_of_two(width - 1) - 1`.
pub fn shift_amount(amount: u64, width: u32) -> u64 {
    if amount < width as u64 {
        return amount;
    }
    let mask = (width as u64).next_power_of_two() - 1;
    amount & mask
}

fn lanes<'v>(value: &'v Value, ty: &Type) -> Result<Vec<&'v Value>> {
    if ty.is_vector() {
        Ok(value.as_agg()?.iter().collect())
    } else {
        Ok(vec![value])
    }
}

fn rewrap(ty: &Type, mut values: Vec<Value>) -> Value {
    if ty.is_vector() {
        Value::agg(values)
    } else {
        values.swap_remove(0)
    }
}

fn icmp_scalar(pred: IntPredicate, lhs: &Value, rhs: &Value) -> Result<bool> {
    // Pointer compares use the stored address only; provenance is invisible
    // to comparison.
    let (a, b) = match (&lhs.payload, &rhs.payload) {
        (Payload::Int(a), Payload::Int(b)) => (a.clone(), b.clone()),
        (Payload::Ptr(a), Payload::Ptr(b)) => {
            (ApInt::from_u64(64, *a), ApInt::from_u64(64, *b))
        }
        _ => {
            return Err(CoreError::TypeMismatch("icmp needs two ints or two pointers".into()));
        }
    };
    Ok(match pred {
        IntPredicate::Eq => a == b,
        IntPredicate::Ne => a != b,
        IntPredicate::Ult => a.ult(&b),
        IntPredicate::Ule => a.ule(&b),
        IntPredicate::Ugt => a.ugt(&b),
        IntPredicate::Uge => a.uge(&b),
        IntPredicate::Slt => a.slt(&b),
        IntPredicate::Sle => a.sle(&b),
        IntPredicate::Sgt => a.sgt(&b),
        IntPredicate::Sge => a.sge(&b),
    })
}

pub fn icmp(pred: IntPredicate, lhs: &Value, rhs: &Value, ty: &Type) -> Result<Value> {
    let (ls, rs) = (lanes(lhs, ty)?, lanes(rhs, ty)?);
    if ls.len() != rs.len() {
        return Err(CoreError::TypeMismatch("icmp lane count mismatch".into()));
    }
    let out = ls
        .iter()
        .zip(&rs)
        .map(|(a, b)| icmp_scalar(pred, a, b).map(Value::from_bool))
        .collect::<Result<Vec<_>>>()?;
    Ok(rewrap(ty, out))
}

fn fp_scalar(value: &Value, ty: &Type) -> Result<f64> {
    match ty.scalar_type() {
        Type::Float => Ok(value.as_float()? as f64),
        Type::Double => value.as_double(),
        other => Err(CoreError::TypeMismatch(format!("fcmp on non-float type {other:?}"))),
    }
}

fn fcmp_scalar(pred: FloatPredicate, x: f64, y: f64) -> bool {
    let unordered = x.is_nan() || y.is_nan();
    match pred {
        FloatPredicate::False => false,
        FloatPredicate::True => true,
        FloatPredicate::Ord => !unordered,
        FloatPredicate::Uno => unordered,
        FloatPredicate::Oeq => x == y,
        FloatPredicate::Ogt => x > y,
        FloatPredicate::Oge => x >= y,
        FloatPredicate::Olt => x < y,
        FloatPredicate::Ole => x <= y,
        FloatPredicate::One => !unordered && x != y,
        FloatPredicate::Ueq => unordered || x == y,
        FloatPredicate::Ugt => unordered || x > y,
        FloatPredicate::Uge => unordered || x >= y,
        FloatPredicate::Ult => unordered || x < y,
        FloatPredicate::Ule => unordered || x <= y,
        FloatPredicate::Une => unordered || x != y,
    }
}

pub fn fcmp(pred: FloatPredicate, lhs: &Value, rhs: &Value, ty: &Type) -> Result<Value> {
    let (ls, rs) = (lanes(lhs, ty)?, lanes(rhs, ty)?);
    if ls.len() != rs.len() {
        return Err(CoreError::TypeMismatch("fcmp lane count mismatch".into()));
    }
    let out = ls
        .iter()
        .zip(&rs)
        .map(|(a, b)| {
            let x = fp_scalar(a, ty)?;
            let y = fp_scalar(b, ty)?;
            Ok(Value::from_bool(fcmp_scalar(pred, x, y)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(rewrap(ty, out))
}

fn binop_scalar(op: BinAlu, lhs: &Value, rhs: &Value, ty: &Type) -> Result<Value> {
    use BinAlu::*;
    match op {
        FAdd | FSub | FMul | FDiv | FRem => {
            let out = match ty.scalar_type() {
                Type::Float => {
                    let (x, y) = (lhs.as_float()?, rhs.as_float()?);
                    Value::float(match op {
                        FAdd => x + y,
                        FSub => x - y,
                        FMul => x * y,
                        FDiv => x / y,
                        _ => x % y,
                    })
                }
                Type::Double => {
                    let (x, y) = (lhs.as_double()?, rhs.as_double()?);
                    Value::double(match op {
                        FAdd => x + y,
                        FSub => x - y,
                        FMul => x * y,
                        FDiv => x / y,
                        _ => x % y,
                    })
                }
                other => {
                    return Err(CoreError::TypeMismatch(format!(
                        "float arithmetic on {other:?}"
                    )));
                }
            };
            Ok(out)
        }
        Shl | LShr | AShr => {
            let x = lhs.as_int()?;
            let amount = shift_amount(rhs.as_int()?.to_u64(), x.width());
            Ok(Value::int(match op {
                Shl => x.shl(amount),
                LShr => x.lshr(amount),
                _ => x.ashr(amount),
            }))
        }
        _ => {
            let (x, y) = (lhs.as_int()?, rhs.as_int()?);
            Ok(Value::int(match op {
                Add => x + y,
                Sub => x - y,
                Mul => x * y,
                UDiv => x.udiv(y),
                SDiv => x.sdiv(y),
                URem => x.urem(y),
                SRem => x.srem(y),
                And => x & y,
                Or => x | y,
                Xor => x ^ y,
                _ => unreachable!("handled above"),
            }))
        }
    }
}

pub fn binop(op: BinAlu, lhs: &Value, rhs: &Value, ty: &Type) -> Result<Value> {
    let (ls, rs) = (lanes(lhs, ty)?, lanes(rhs, ty)?);
    if ls.len() != rs.len() {
        return Err(CoreError::TypeMismatch("binary operator lane count mismatch".into()));
    }
    let out = ls
        .iter()
        .zip(&rs)
        .map(|(a, b)| binop_scalar(op, a, b, ty))
        .collect::<Result<Vec<_>>>()?;
    Ok(rewrap(ty, out))
}

pub fn fneg(src: &Value, ty: &Type) -> Result<Value> {
    let out = lanes(src, ty)?
        .iter()
        .map(|v| match ty.scalar_type() {
            Type::Float => Ok(Value::float(-v.as_float()?)),
            Type::Double => Ok(Value::double(-v.as_double()?)),
            other => Err(CoreError::TypeMismatch(format!("fneg on {other:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(rewrap(ty, out))
}

/// Scalar select picks on the condition's bit zero; vector select picks
/// lane-wise. The chosen value travels whole, provenance included.
pub fn select(cond: &Value, on_true: &Value, on_false: &Value, cond_ty: &Type) -> Result<Value> {
    if cond_ty.is_vector() {
        let cs = cond.as_agg()?;
        let (ts, fs) = (on_true.as_agg()?, on_false.as_agg()?);
        if cs.len() != ts.len() || ts.len() != fs.len() {
            return Err(CoreError::TypeMismatch("select lane count mismatch".into()));
        }
        let out = cs
            .iter()
            .zip(ts.iter().zip(fs))
            .map(|(c, (t, f))| {
                Ok(if c.as_int()?.is_zero() { f.clone() } else { t.clone() })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::agg(out))
    } else if cond.as_int()?.is_zero() {
        Ok(on_false.clone())
    } else {
        Ok(on_true.clone())
    }
}

fn int_lane(v: &Value) -> Result<ApInt> {
    match &v.payload {
        Payload::Int(i) => Ok(i.clone()),
        Payload::Float(f) => Ok(ApInt::float_to_bits(*f)),
        Payload::Double(d) => Ok(ApInt::double_to_bits(*d)),
        other => Err(CoreError::InvalidCast(format!("no bit pattern for {other:?}"))),
    }
}

fn lane_from_int(bits: ApInt, elem: &Type) -> Result<Value> {
    match elem {
        Type::Int { .. } => Ok(Value::int(bits)),
        Type::Float => Ok(Value::float(bits.bits_to_float())),
        Type::Double => Ok(Value::double(bits.bits_to_double())),
        other => Err(CoreError::InvalidCast(format!("bitcast into {other:?}"))),
    }
}

/// Bit-exact reshape between equal-total-width shapes: decompose the source
/// into integer lanes, concatenate in target byte order, repartition into
/// destination lanes and recompose.
fn bitcast(src: &Value, src_ty: &Type, to: &Type, layout: &DataLayout) -> Result<Value> {
    if !src_ty.is_vector() && !to.is_vector() {
        return match (src_ty, to) {
            (Type::Ptr, Type::Ptr) => Ok(src.clone()),
            (_, Type::Int { bits }) => {
                let raw = int_lane(src)?;
                if raw.width() != *bits {
                    return Err(CoreError::InvalidCast("bitcast width mismatch".into()));
                }
                Ok(Value::int(raw))
            }
            (_, Type::Float) | (_, Type::Double) => {
                let raw = int_lane(src)?;
                if raw.width() != to.scalar_bits(layout) {
                    return Err(CoreError::InvalidCast("bitcast width mismatch".into()));
                }
                lane_from_int(raw, to)
            }
            _ => Err(CoreError::InvalidCast(format!("bitcast {src_ty:?} to {to:?}"))),
        };
    }

    let src_bits = src_ty.scalar_bits(layout);
    let dst_bits = to.scalar_bits(layout);
    if src_bits == 0 || dst_bits == 0 {
        return Err(CoreError::InvalidCast("bitcast of unsized element".into()));
    }
    let src_lanes = lanes(src, src_ty)?;
    let src_n = src_lanes.len();
    let dst_n = (src_n as u64 * src_bits as u64 / dst_bits as u64) as usize;
    if src_n as u64 * src_bits as u64 != dst_n as u64 * dst_bits as u64
        || (to.is_vector() && dst_n != to.lanes() as usize)
        || (!to.is_vector() && dst_n != 1)
    {
        return Err(CoreError::InvalidCast("bitcast total width mismatch".into()));
    }

    let ints = src_lanes.iter().map(|v| int_lane(v)).collect::<Result<Vec<_>>>()?;

    let le = layout.little_endian;
    let mut out_ints = Vec::with_capacity(dst_n);
    if dst_n <= src_n {
        // Merge `ratio` narrow source lanes into each destination lane.
        let ratio = src_n / dst_n;
        for chunk in ints.chunks(ratio) {
            let mut elt = ApInt::zero(dst_bits);
            let mut shift = if le { 0i64 } else { (src_bits as i64) * (ratio as i64 - 1) };
            for lane in chunk {
                elt = &elt | &lane.zext(dst_bits).shl(shift as u64);
                shift += if le { src_bits as i64 } else { -(src_bits as i64) };
            }
            out_ints.push(elt);
        }
    } else {
        // Split each source lane into `ratio` destination lanes.
        let ratio = dst_n / src_n;
        for lane in &ints {
            let mut shift = if le { 0i64 } else { (dst_bits as i64) * (ratio as i64 - 1) };
            for _ in 0..ratio {
                out_ints.push(lane.lshr(shift as u64).trunc(dst_bits));
                shift += if le { dst_bits as i64 } else { -(dst_bits as i64) };
            }
        }
    }

    let elem = to.scalar_type().clone();
    let out = out_ints
        .into_iter()
        .map(|bits| lane_from_int(bits, &elem))
        .collect::<Result<Vec<_>>>()?;
    Ok(rewrap(to, out))
}

/// All casts except `ptrtoint`/`inttoptr`, which need the oracle and are
/// dispatched by the machine.
pub fn cast(
    op: CastOp,
    src: &Value,
    src_ty: &Type,
    to: &Type,
    layout: &DataLayout,
) -> Result<Value> {
    if matches!(op, CastOp::BitCast) {
        return bitcast(src, src_ty, to, layout);
    }
    let out = lanes(src, src_ty)?
        .iter()
        .map(|v| {
            let dst_bits = to.scalar_bits(layout);
            match op {
                CastOp::Trunc => Ok(Value::int(v.as_int()?.trunc(dst_bits))),
                CastOp::ZExt => Ok(Value::int(v.as_int()?.zext(dst_bits))),
                CastOp::SExt => Ok(Value::int(v.as_int()?.sext(dst_bits))),
                CastOp::FpTrunc => Ok(Value::float(v.as_double()? as f32)),
                CastOp::FpExt => Ok(Value::double(v.as_float()? as f64)),
                CastOp::FpToUi => {
                    let x = fp_scalar(v, src_ty)?;
                    Ok(Value::int(ApInt::from_f64_unsigned(dst_bits, x)))
                }
                CastOp::FpToSi => {
                    let x = fp_scalar(v, src_ty)?;
                    Ok(Value::int(ApInt::from_f64_signed(dst_bits, x)))
                }
                CastOp::UiToFp => {
                    let x = v.as_int()?.to_f64_unsigned();
                    match to.scalar_type() {
                        Type::Float => Ok(Value::float(x as f32)),
                        Type::Double => Ok(Value::double(x)),
                        other => Err(CoreError::InvalidCast(format!("uitofp to {other:?}"))),
                    }
                }
                CastOp::SiToFp => {
                    let x = v.as_int()?.to_f64_signed();
                    match to.scalar_type() {
                        Type::Float => Ok(Value::float(x as f32)),
                        Type::Double => Ok(Value::double(x)),
                        other => Err(CoreError::InvalidCast(format!("sitofp to {other:?}"))),
                    }
                }
                CastOp::PtrToInt | CastOp::IntToPtr => {
                    Err(CoreError::InvalidCast("pointer cast outside machine context".into()))
                }
                CastOp::BitCast => unreachable!("handled above"),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(rewrap(to, out))
}

fn index_signed(idx: &ApInt) -> i64 {
    let wide = if idx.width() < 64 { idx.sext(64) } else { idx.trunc(64) };
    wide.to_u64() as i64
}

/// Fold a typed index path into a byte delta. The first index strides over
/// the source type itself; struct indices select a field offset; sequence
/// indices scale by the element stride.
pub fn gep_offset(source_ty: &Type, indices: &[ApInt], layout: &DataLayout) -> Result<u64> {
    let mut total: u64 = 0;
    let mut iter = indices.iter();
    if let Some(first) = iter.next() {
        let stride = source_ty.alloc_size(layout) as i64;
        total = total.wrapping_add(stride.wrapping_mul(index_signed(first)) as u64);
    }
    let mut cur = source_ty;
    for idx in iter {
        match cur {
            Type::Struct { fields } => {
                let field = idx.to_u64() as usize;
                if field >= fields.len() {
                    return Err(CoreError::Malformed(format!(
                        "struct index {field} out of range"
                    )));
                }
                total = total.wrapping_add(struct_layout(fields, layout).offsets[field]);
                cur = &fields[field];
            }
            Type::Array { elem, .. } | Type::Vector { elem, .. } => {
                let stride = elem.alloc_size(layout) as i64;
                total = total.wrapping_add(stride.wrapping_mul(index_signed(idx)) as u64);
                cur = elem;
            }
            other => {
                return Err(CoreError::Malformed(format!("gep descends into {other:?}")));
            }
        }
    }
    Ok(total)
}

pub fn extract_value(agg: &Value, indices: &[u32]) -> Result<Value> {
    let mut cur = agg;
    for &i in indices {
        cur = cur
            .as_agg()?
            .get(i as usize)
            .ok_or_else(|| CoreError::Malformed(format!("extractvalue index {i} out of range")))?;
    }
    Ok(cur.clone())
}

pub fn insert_value(agg: &Value, value: Value, indices: &[u32]) -> Result<Value> {
    let mut dest = agg.clone();
    let mut cur = &mut dest;
    for &i in indices {
        cur = cur
            .as_agg_mut()?
            .get_mut(i as usize)
            .ok_or_else(|| CoreError::Malformed(format!("insertvalue index {i} out of range")))?;
    }
    *cur = value;
    Ok(dest)
}

pub fn extract_element(vector: &Value, index: &Value) -> Result<Value> {
    let idx = index.as_int()?.to_u64() as usize;
    vector
        .as_agg()?
        .get(idx)
        .cloned()
        .ok_or_else(|| CoreError::Malformed(format!("extractelement index {idx} out of range")))
}

pub fn insert_element(vector: &Value, value: Value, index: &Value) -> Result<Value> {
    let idx = index.as_int()?.to_u64() as usize;
    let mut dest = vector.clone();
    let elems = dest.as_agg_mut()?;
    if idx >= elems.len() {
        return Err(CoreError::Malformed(format!("insertelement index {idx} out of range")));
    }
    elems[idx] = value;
    Ok(dest)
}

/// Lane selection by mask over the concatenation of two vectors. Undefined
/// mask entries (negative) clamp to lane zero.
pub fn shuffle(a: &Value, b: &Value, mask: &[i32]) -> Result<Value> {
    let (av, bv) = (a.as_agg()?, b.as_agg()?);
    let mut out = Vec::with_capacity(mask.len());
    for &m in mask {
        let j = m.max(0) as usize;
        if j < av.len() {
            out.push(av[j].clone());
        } else if j < av.len() + bv.len() {
            out.push(bv[j - av.len()].clone());
        } else {
            return Err(CoreError::InvalidMask(m));
        }
    }
    Ok(Value::agg(out))
}

fn funnel_shift(args: &[Value], left: bool) -> Result<Value> {
    let hi = args[0].as_int()?;
    let lo = args[1].as_int()?;
    let amt = args[2].as_int()?;
    if hi.width() != lo.width() || lo.width() != amt.width() {
        return Err(CoreError::TypeMismatch("funnel shift width mismatch".into()));
    }
    let w = hi.width();
    let wide = hi.concat(lo);
    let r = amt.to_u64() % w as u64;
    let out = if left {
        wide.rotl(r).lshr(w as u64).trunc(w)
    } else {
        wide.rotr(r).trunc(w)
    };
    Ok(Value::int(out))
}

pub fn intrinsic(op: IntrinsicOp, args: &[Value], ty: &Type) -> Result<Value> {
    if ty.is_vector() {
        return Err(CoreError::Unsupported(format!("{op:?} on vectors")));
    }
    let needed = match op {
        IntrinsicOp::Fabs => 1,
        IntrinsicOp::Fmuladd | IntrinsicOp::Fshl | IntrinsicOp::Fshr => 3,
    };
    if args.len() < needed {
        return Err(CoreError::Malformed(format!("{op:?} needs {needed} operands")));
    }
    match op {
        IntrinsicOp::Fabs => match ty {
            Type::Float => Ok(Value::float(args[0].as_float()?.abs())),
            Type::Double => Ok(Value::double(args[0].as_double()?.abs())),
            Type::Int { .. } => Ok(Value::int(args[0].as_int()?.abs())),
            other => Err(CoreError::TypeMismatch(format!("fabs on {other:?}"))),
        },
        IntrinsicOp::Fmuladd => match ty {
            Type::Float => {
                let (a, b, c) =
                    (args[0].as_float()?, args[1].as_float()?, args[2].as_float()?);
                Ok(Value::float(a.mul_add(b, c)))
            }
            Type::Double => {
                let (a, b, c) =
                    (args[0].as_double()?, args[1].as_double()?, args[2].as_double()?);
                Ok(Value::double(a.mul_add(b, c)))
            }
            other => Err(CoreError::TypeMismatch(format!("fmuladd on {other:?}"))),
        },
        IntrinsicOp::Fshl => funnel_shift(args, true),
        IntrinsicOp::Fshr => funnel_shift(args, false),
    }
}
