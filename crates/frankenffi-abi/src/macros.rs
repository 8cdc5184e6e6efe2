//! Helper macros for shape-specialised native calls.
//!
//! `native_call!` reinterprets an address as an `extern "C"` function pointer
//! with `N` integer-class (`u64`) parameters followed by `M` float-class
//! (`f64`) parameters and calls it. Because the two classes are assigned
//! from separate register files, that ordering reaches the same registers as
//! any interleaving the real prototype uses.
//!
//! `dispatch_call!` expands to a `match` over every supported `(N, M)` pair.

/// Call `$addr` with the given register images. Must be used inside an
/// `unsafe fn` whose contract covers the call.
macro_rules! native_call {
    (@int $x:tt) => { u64 };
    (@float $x:tt) => { f64 };

    ($addr:expr => $ret:ty; [$($i:ident)*] [$($f:ident)*]) => {{
        // SAFETY: the caller guarantees `$addr` is a C function with this
        // register shape and return class.
        let func: unsafe extern "C" fn(
            $(native_call!(@int $i),)*
            $(native_call!(@float $f),)*
        ) -> $ret = unsafe { std::mem::transmute::<usize, _>($addr) };
        unsafe { func($(*$i,)* $(*$f,)*) }
    }};
}

/// Match `$ints: &[u64]` and `$floats: &[f64]` onto a fixed-arity call.
/// Yields `None` for shapes outside the register budget.
macro_rules! dispatch_call {
    ($addr:expr => $ret:ty; $ints:expr, $floats:expr) => {
        dispatch_call!(@ints $addr => $ret; $ints, $floats;
            [] [i0] [i0 i1] [i0 i1 i2] [i0 i1 i2 i3] [i0 i1 i2 i3 i4] [i0 i1 i2 i3 i4 i5])
    };

    (@ints $addr:expr => $ret:ty; $ints:expr, $floats:expr; $([$($i:ident)*])*) => {
        match $ints {
            $( [$($i),*] => dispatch_call!(@floats $addr => $ret; [$($i)*]; $floats), )*
            _ => None,
        }
    };

    (@floats $addr:expr => $ret:ty; [$($i:ident)*]; $floats:expr) => {
        match $floats {
            [] => Some(native_call!($addr => $ret; [$($i)*] [])),
            [f0] => Some(native_call!($addr => $ret; [$($i)*] [f0])),
            [f0, f1] => Some(native_call!($addr => $ret; [$($i)*] [f0 f1])),
            [f0, f1, f2] => Some(native_call!($addr => $ret; [$($i)*] [f0 f1 f2])),
            [f0, f1, f2, f3] => Some(native_call!($addr => $ret; [$($i)*] [f0 f1 f2 f3])),
            _ => None,
        }
    };
}

#[allow(unused_imports)]
pub(crate) use dispatch_call;
#[allow(unused_imports)]
pub(crate) use native_call;
