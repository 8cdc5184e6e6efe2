//! # frankenffi-abi
//!
//! Foreign function binding layer: the only crate that calls into native code.
//!
//! # Architecture
//!
//! ```text
//! Linker::resolve -> bind (descriptor validated once) -> prepare (args, leases) -> call
//! ```
//!
//! Descriptors are limited to primitives and addresses. Integer-class and
//! float-class arguments travel in their own register files, which is the
//! System V x86-64 and AAPCS64 convention; other targets reject every
//! descriptor at bind time.

#[macro_use]
mod macros;

pub mod binding;
pub mod descriptor;
pub mod loader;
mod trampoline;
pub mod value;

pub use binding::{NativeBinding, PreparedCall, bind};
pub use descriptor::{
    ArgClass, CallShape, FunctionDescriptor, MAX_FLOAT_ARGS, MAX_INT_ARGS, RetClass,
    ReturnLayout, ScalarLayout, ValueLayout,
};
pub use loader::{Library, Linker, NativeSymbol, SymbolOrigin, resolve};
pub use value::{NativeArg, NativeValue};
