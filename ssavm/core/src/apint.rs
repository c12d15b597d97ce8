//! Fixed-width integers over an arbitrary bit width.
//!
//! Every value is kept masked to its width; arithmetic wraps, division
//! truncates toward zero, and signed operations reinterpret the stored
//! magnitude in two's complement. Widths of 1 through several hundred bits
//! are all handled uniformly.

use num_bigint::{BigInt, BigUint};
use num_traits::{FromPrimitive, One, ToPrimitive, Zero};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, BitAnd, BitOr, BitXor, Mul, Sub};

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ApInt {
    bits: u32,
    mag: BigUint,
}

fn mask(bits: u32) -> BigUint {
    (BigUint::one() << bits as usize) - BigUint::one()
}

impl ApInt {
    pub fn new(bits: u32, mag: BigUint) -> Self {
        debug_assert!(bits > 0, "zero-width integer");
        let mag = mag & mask(bits);
        Self { bits, mag }
    }

    pub fn zero(bits: u32) -> Self {
        Self::new(bits, BigUint::zero())
    }

    pub fn all_ones(bits: u32) -> Self {
        Self::new(bits, mask(bits))
    }

    pub fn from_u64(bits: u32, value: u64) -> Self {
        Self::new(bits, BigUint::from(value))
    }

    pub fn from_u128(bits: u32, value: u128) -> Self {
        Self::new(bits, BigUint::from(value))
    }

    pub fn from_i64(bits: u32, value: i64) -> Self {
        Self::from_bigint(bits, BigInt::from(value))
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_u64(1, value as u64)
    }

    fn from_bigint(bits: u32, value: BigInt) -> Self {
        let modulus = BigInt::one() << bits as usize;
        let mut rem = value % &modulus;
        if rem.sign() == num_bigint::Sign::Minus {
            rem += &modulus;
        }
        Self::new(bits, rem.to_biguint().unwrap_or_default())
    }

    pub fn width(&self) -> u32 {
        self.bits
    }

    pub fn is_zero(&self) -> bool {
        self.mag.is_zero()
    }

    /// Bit `i`, where bit 0 is the least significant.
    pub fn bit(&self, i: u32) -> bool {
        self.mag.bit(i as u64)
    }

    /// The low 64 bits of the magnitude.
    pub fn to_u64(&self) -> u64 {
        self.mag.iter_u64_digits().next().unwrap_or(0)
    }

    /// Little-endian magnitude bytes, trimmed of leading zeros.
    pub fn to_bytes_le(&self) -> Vec<u8> {
        self.mag.to_bytes_le()
    }

    pub fn from_bytes_le(bits: u32, bytes: &[u8]) -> ApInt {
        ApInt::new(bits, BigUint::from_bytes_le(bytes))
    }

    pub fn to_u128(&self) -> u128 {
        let mut digits = self.mag.iter_u64_digits();
        let lo = digits.next().unwrap_or(0) as u128;
        let hi = digits.next().unwrap_or(0) as u128;
        (hi << 64) | lo
    }

    fn to_signed(&self) -> BigInt {
        let v = BigInt::from(self.mag.clone());
        if self.bit(self.bits - 1) {
            v - (BigInt::one() << self.bits as usize)
        } else {
            v
        }
    }

    /// Two's-complement absolute value; the minimum value wraps onto itself.
    pub fn abs(&self) -> ApInt {
        use num_traits::Signed;
        ApInt::from_bigint(self.bits, self.to_signed().abs())
    }

    pub fn udiv(&self, rhs: &ApInt) -> ApInt {
        debug_assert_eq!(self.bits, rhs.bits);
        if rhs.is_zero() {
            return ApInt::all_ones(self.bits);
        }
        ApInt::new(self.bits, &self.mag / &rhs.mag)
    }

    pub fn urem(&self, rhs: &ApInt) -> ApInt {
        debug_assert_eq!(self.bits, rhs.bits);
        if rhs.is_zero() {
            return self.clone();
        }
        ApInt::new(self.bits, &self.mag % &rhs.mag)
    }

    pub fn sdiv(&self, rhs: &ApInt) -> ApInt {
        debug_assert_eq!(self.bits, rhs.bits);
        if rhs.is_zero() {
            return ApInt::all_ones(self.bits);
        }
        ApInt::from_bigint(self.bits, self.to_signed() / rhs.to_signed())
    }

    pub fn srem(&self, rhs: &ApInt) -> ApInt {
        debug_assert_eq!(self.bits, rhs.bits);
        if rhs.is_zero() {
            return self.clone();
        }
        ApInt::from_bigint(self.bits, self.to_signed() % rhs.to_signed())
    }

    pub fn shl(&self, amount: u64) -> ApInt {
        if amount >= self.bits as u64 {
            return ApInt::zero(self.bits);
        }
        ApInt::new(self.bits, &self.mag << amount as usize)
    }

    pub fn lshr(&self, amount: u64) -> ApInt {
        if amount >= self.bits as u64 {
            return ApInt::zero(self.bits);
        }
        ApInt::new(self.bits, &self.mag >> amount as usize)
    }

    pub fn ashr(&self, amount: u64) -> ApInt {
        if amount >= self.bits as u64 {
            return if self.bit(self.bits - 1) {
                ApInt::all_ones(self.bits)
            } else {
                ApInt::zero(self.bits)
            };
        }
        ApInt::from_bigint(self.bits, self.to_signed() >> amount as usize)
    }

    pub fn rotl(&self, amount: u64) -> ApInt {
        let w = self.bits as u64;
        let r = amount % w;
        if r == 0 {
            return self.clone();
        }
        ApInt::new(
            self.bits,
            ((&self.mag << r as usize) | (&self.mag >> (w - r) as usize)) & mask(self.bits),
        )
    }

    pub fn rotr(&self, amount: u64) -> ApInt {
        let w = self.bits as u64;
        self.rotl(w - (amount % w))
    }

    pub fn trunc(&self, bits: u32) -> ApInt {
        debug_assert!(bits <= self.bits);
        ApInt::new(bits, self.mag.clone())
    }

    pub fn zext(&self, bits: u32) -> ApInt {
        debug_assert!(bits >= self.bits);
        ApInt::new(bits, self.mag.clone())
    }

    pub fn sext(&self, bits: u32) -> ApInt {
        debug_assert!(bits >= self.bits);
        ApInt::from_bigint(bits, self.to_signed())
    }

    pub fn zext_or_trunc(&self, bits: u32) -> ApInt {
        if bits >= self.bits {
            self.zext(bits)
        } else {
            self.trunc(bits)
        }
    }

    /// Concatenate `self` (high half) with `lo` (low half) into a value of
    /// twice the width.
    pub fn concat(&self, lo: &ApInt) -> ApInt {
        debug_assert_eq!(self.bits, lo.bits);
        let wide = (&self.mag << lo.bits as usize) | &lo.mag;
        ApInt::new(self.bits + lo.bits, wide)
    }

    pub fn ult(&self, rhs: &ApInt) -> bool {
        self.mag < rhs.mag
    }

    pub fn ule(&self, rhs: &ApInt) -> bool {
        self.mag <= rhs.mag
    }

    pub fn ugt(&self, rhs: &ApInt) -> bool {
        self.mag > rhs.mag
    }

    pub fn uge(&self, rhs: &ApInt) -> bool {
        self.mag >= rhs.mag
    }

    pub fn slt(&self, rhs: &ApInt) -> bool {
        self.to_signed() < rhs.to_signed()
    }

    pub fn sle(&self, rhs: &ApInt) -> bool {
        self.to_signed() <= rhs.to_signed()
    }

    pub fn sgt(&self, rhs: &ApInt) -> bool {
        self.to_signed() > rhs.to_signed()
    }

    pub fn sge(&self, rhs: &ApInt) -> bool {
        self.to_signed() >= rhs.to_signed()
    }

    pub fn to_f64_unsigned(&self) -> f64 {
        self.mag.to_f64().unwrap_or(f64::INFINITY)
    }

    pub fn to_f64_signed(&self) -> f64 {
        let v = self.to_signed();
        v.to_f64().unwrap_or_else(|| {
            if v.sign() == num_bigint::Sign::Minus {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }
        })
    }

    /// Round toward zero, saturating at the bounds of the unsigned range.
    /// NaN converts to zero.
    pub fn from_f64_unsigned(bits: u32, value: f64) -> ApInt {
        if value.is_nan() || value <= 0.0 {
            return ApInt::zero(bits);
        }
        let t = value.trunc();
        match BigUint::from_f64(t) {
            Some(mag) if mag <= mask(bits) => ApInt::new(bits, mag),
            _ => ApInt::all_ones(bits),
        }
    }

    /// Round toward zero, saturating at the bounds of the signed range.
    /// NaN converts to zero.
    pub fn from_f64_signed(bits: u32, value: f64) -> ApInt {
        if value.is_nan() {
            return ApInt::zero(bits);
        }
        let min = -(BigInt::one() << (bits - 1) as usize);
        let max = (BigInt::one() << (bits - 1) as usize) - BigInt::one();
        match BigInt::from_f64(value.trunc()) {
            Some(v) if v < min => ApInt::from_bigint(bits, min),
            Some(v) if v > max => ApInt::from_bigint(bits, max),
            Some(v) => ApInt::from_bigint(bits, v),
            None => {
                let bound = if value < 0.0 { min } else { max };
                ApInt::from_bigint(bits, bound)
            }
        }
    }

    pub fn float_to_bits(value: f32) -> ApInt {
        ApInt::from_u64(32, value.to_bits() as u64)
    }

    pub fn double_to_bits(value: f64) -> ApInt {
        ApInt::from_u64(64, value.to_bits())
    }

    pub fn bits_to_float(&self) -> f32 {
        f32::from_bits(self.to_u64() as u32)
    }

    pub fn bits_to_double(&self) -> f64 {
        f64::from_bits(self.to_u64())
    }
}

macro_rules! impl_wrapping_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait for &ApInt {
            type Output = ApInt;
            fn $method(self, rhs: &ApInt) -> ApInt {
                debug_assert_eq!(self.bits, rhs.bits);
                ApInt::new(self.bits, &self.mag $op &rhs.mag)
            }
        }
    };
}

impl_wrapping_op!(Add, add, +);
impl_wrapping_op!(Mul, mul, *);
impl_wrapping_op!(BitAnd, bitand, &);
impl_wrapping_op!(BitOr, bitor, |);
impl_wrapping_op!(BitXor, bitxor, ^);

impl Sub for &ApInt {
    type Output = ApInt;
    fn sub(self, rhs: &ApInt) -> ApInt {
        debug_assert_eq!(self.bits, rhs.bits);
        let borrowed = (BigUint::one() << self.bits as usize) + &self.mag - &rhs.mag;
        ApInt::new(self.bits, borrowed)
    }
}

impl fmt::Debug for ApInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{} 0x{}", self.bits, self.mag.to_str_radix(16))
    }
}

impl fmt::Display for ApInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mag)
    }
}

impl Serialize for ApInt {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (self.bits, self.mag.to_str_radix(16)).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ApInt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (bits, hex): (u32, String) = Deserialize::deserialize(deserializer)?;
        if bits == 0 {
            return Err(D::Error::custom("zero-width integer"));
        }
        let mag = BigUint::parse_bytes(hex.as_bytes(), 16)
            .ok_or_else(|| D::Error::custom("bad integer digits"))?;
        Ok(ApInt::new(bits, mag))
    }
}
