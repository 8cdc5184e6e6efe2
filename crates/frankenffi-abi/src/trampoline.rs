//! Raw native call issue.
//!
//! Every call funnels through [`call`], which picks the fixed-arity function
//! pointer type matching the prepared register images and reads the return
//! register back according to the declared return class.

use crate::descriptor::RetClass;
use crate::value::NativeValue;

/// Call the C function at `address`.
///
/// Returns `None` when the image lengths exceed the register budget.
///
/// # Safety
///
/// `address` must point to a C function whose integer-class parameters are
/// exactly `ints.len()` values and whose float-class parameters are exactly
/// `floats.len()` values, with a return of class `ret`. Any pointers encoded
/// in `ints` must stay valid for the duration of the call.
pub(crate) unsafe fn call(
    address: usize,
    ints: &[u64],
    floats: &[f64],
    ret: RetClass,
) -> Option<NativeValue> {
    match ret {
        RetClass::Void => {
            // SAFETY: forwarded caller contract.
            unsafe { call_void(address, ints, floats) }?;
            Some(NativeValue::Void)
        }
        RetClass::Int(kind) => {
            // SAFETY: forwarded caller contract.
            let raw = unsafe { call_int(address, ints, floats) }?;
            Some(NativeValue::from_int_bits(kind, raw))
        }
        RetClass::Float(kind) => {
            // SAFETY: forwarded caller contract.
            let raw = unsafe { call_float(address, ints, floats) }?;
            Some(NativeValue::from_float_bits(kind, raw))
        }
    }
}

unsafe fn call_void(address: usize, ints: &[u64], floats: &[f64]) -> Option<()> {
    dispatch_call!(address => (); ints, floats)
}

unsafe fn call_int(address: usize, ints: &[u64], floats: &[f64]) -> Option<u64> {
    dispatch_call!(address => u64; ints, floats)
}

unsafe fn call_float(address: usize, ints: &[u64], floats: &[f64]) -> Option<f64> {
    dispatch_call!(address => f64; ints, floats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use frankenffi_membrane::Primitive;
    use std::sync::atomic::{AtomicU64, Ordering};

    extern "C" fn interleaved(a: i32, x: f64, b: u8, y: f32) -> f64 {
        f64::from(a) * x + f64::from(b) + f64::from(y)
    }

    extern "C" fn six_ints(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64) -> u64 {
        a + 10 * b + 100 * c + 1_000 * d + 10_000 * e + 100_000 * f
    }

    extern "C" fn halve(x: f32) -> f32 {
        x / 2.0
    }

    static SEEN: AtomicU64 = AtomicU64::new(0);

    extern "C" fn record(v: u64) {
        SEEN.store(v, Ordering::SeqCst);
    }

    extern "C" fn negative() -> i16 {
        -5
    }

    #[test]
    fn interleaved_classes_reach_their_registers() {
        let y = f64::from_bits(u64::from(0.5_f32.to_bits()));
        let out = unsafe {
            call(
                interleaved as usize,
                &[(-3_i64) as u64, 4],
                &[2.0, y],
                RetClass::Float(Primitive::F64),
            )
        };
        assert_eq!(out, Some(NativeValue::F64(-6.0 + 4.0 + 0.5)));
    }

    #[test]
    fn full_integer_budget() {
        let out = unsafe {
            call(
                six_ints as usize,
                &[1, 2, 3, 4, 5, 6],
                &[],
                RetClass::Int(Primitive::U64),
            )
        };
        assert_eq!(out, Some(NativeValue::U64(654_321)));
    }

    #[test]
    fn f32_return_is_read_from_low_half() {
        let x = f64::from_bits(u64::from(3.0_f32.to_bits()));
        let out = unsafe { call(halve as usize, &[], &[x], RetClass::Float(Primitive::F32)) };
        assert_eq!(out, Some(NativeValue::F32(1.5)));
    }

    #[test]
    fn void_and_narrow_returns() {
        let out = unsafe { call(record as usize, &[77], &[], RetClass::Void) };
        assert_eq!(out, Some(NativeValue::Void));
        assert_eq!(SEEN.load(Ordering::SeqCst), 77);

        let out = unsafe { call(negative as usize, &[], &[], RetClass::Int(Primitive::I16)) };
        assert_eq!(out, Some(NativeValue::I16(-5)));
    }

    #[test]
    fn oversized_shapes_are_refused() {
        let out = unsafe { call(negative as usize, &[0; 7], &[], RetClass::Void) };
        assert_eq!(out, None);
        let out = unsafe { call(negative as usize, &[], &[0.0; 5], RetClass::Void) };
        assert_eq!(out, None);
    }
}
