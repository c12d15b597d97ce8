use proptest::prelude::*;
use ssavm_core::interp::eval::{self, shift_amount};
use ssavm_core::ir::{BinAlu, Type};
use ssavm_core::{ApInt, Value};

const WIDTHS: &[u32] = &[1, 3, 7, 8, 33, 64, 128];

fn widths() -> impl Strategy<Value = u32> {
    prop::sample::select(WIDTHS.to_vec())
}

proptest! {
    #[test]
    fn add_sub_round_trips(a in any::<u128>(), b in any::<u128>(), w in widths()) {
        let x = ApInt::from_u128(w, a);
        let y = ApInt::from_u128(w, b);
        prop_assert_eq!(&(&(&x + &y) - &y), &x);
    }

    #[test]
    fn udiv_urem_reconstruct_dividend(a in any::<u128>(), b in any::<u128>(), w in widths()) {
        let x = ApInt::from_u128(w, a);
        let y = ApInt::from_u128(w, b);
        prop_assume!(!y.is_zero());
        let q = x.udiv(&y);
        let r = x.urem(&y);
        prop_assert_eq!(&(&(&q * &y) + &r), &x);
        prop_assert!(r.ult(&y));
    }

    #[test]
    fn sdiv_srem_reconstruct_dividend(a in any::<u128>(), b in any::<u128>(), w in widths()) {
        let x = ApInt::from_u128(w, a);
        let y = ApInt::from_u128(w, b);
        prop_assume!(!y.is_zero());
        // Skip the one overflowing quotient (MIN / -1), which wraps.
        let signed_min = ApInt::from_u64(w, 1).shl((w - 1) as u64);
        prop_assume!(!(x == signed_min && y == ApInt::all_ones(w)));
        let q = x.sdiv(&y);
        let r = x.srem(&y);
        prop_assert_eq!(&(&(&q * &y) + &r), &x);
    }

    #[test]
    fn shift_amounts_mask_uniformly(x in any::<u64>(), s in 0u64..512) {
        // For width 32 the kernel behaves as `s & 31` whenever s >= 32.
        let v = ApInt::from_u64(32, x);
        let lhs = Value::int(v.clone());
        let rhs = Value::int(ApInt::from_u64(32, s));
        let out = eval::binop(BinAlu::Shl, &lhs, &rhs, &Type::int(32)).expect("shl");
        let expected = v.shl(shift_amount(s, 32));
        prop_assert_eq!(out.as_int().expect("int"), &expected);
        if s >= 32 {
            prop_assert_eq!(shift_amount(s, 32), s & 31);
        }
    }

    #[test]
    fn zext_then_trunc_is_identity(a in any::<u128>(), w in widths()) {
        let x = ApInt::from_u128(w, a);
        prop_assert_eq!(&x.zext(w + 17).trunc(w), &x);
    }
}

#[test]
fn shl_thirty_three_equals_shl_one() {
    let x = ApInt::from_u64(32, 0x8000_0001);
    assert_eq!(x.shl(shift_amount(33, 32)), x.shl(1));
}
