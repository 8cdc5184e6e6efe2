//! Validated native bindings and invocation.
//!
//! Validation is staged: [`bind`] checks the descriptor once, and every
//! invocation checks arity, argument kinds and segment liveness before any
//! native code runs. A [`PreparedCall`] is the result of those checks: it
//! owns the register images and the segment leases, so it can be moved to
//! another thread and issued there.

use std::fmt;
use std::sync::Arc;

use frankenffi_membrane::metrics::{FfiMetrics, global_metrics};
use frankenffi_membrane::{FfiError, FfiResult, SegmentLease};

use crate::descriptor::{ArgClass, CallShape, FunctionDescriptor, ValueLayout};
use crate::loader::NativeSymbol;
use crate::trampoline;
use crate::value::{NativeArg, NativeValue};

struct BindingInner {
    symbol: NativeSymbol,
    descriptor: FunctionDescriptor,
    shape: CallShape,
}

/// Immutable pairing of a symbol with a validated descriptor.
#[derive(Clone)]
pub struct NativeBinding {
    inner: Arc<BindingInner>,
}

/// Validate `descriptor` and pair it with `symbol`.
pub fn bind(symbol: &NativeSymbol, descriptor: FunctionDescriptor) -> FfiResult<NativeBinding> {
    let metrics = global_metrics();
    let shape = match descriptor.validate(symbol.name()) {
        Ok(shape) => shape,
        Err(err) => {
            FfiMetrics::inc(&metrics.bindings_rejected);
            return Err(err);
        }
    };
    FfiMetrics::inc(&metrics.bindings_created);
    Ok(NativeBinding {
        inner: Arc::new(BindingInner {
            symbol: symbol.clone(),
            descriptor,
            shape,
        }),
    })
}

impl NativeBinding {
    #[must_use]
    pub fn symbol(&self) -> &NativeSymbol {
        &self.inner.symbol
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.symbol.name()
    }

    #[must_use]
    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.inner.descriptor
    }

    #[must_use]
    pub fn shape(&self) -> &CallShape {
        &self.inner.shape
    }

    /// Check and marshal `args` without calling.
    pub fn prepare(&self, args: &[NativeArg]) -> FfiResult<PreparedCall> {
        self.prepare_inner(args).inspect_err(|_| {
            FfiMetrics::inc(&global_metrics().invocations_rejected);
        })
    }

    /// Check, marshal and call.
    pub fn invoke(&self, args: &[NativeArg]) -> FfiResult<NativeValue> {
        self.prepare(args)?.call()
    }

    fn prepare_inner(&self, args: &[NativeArg]) -> FfiResult<PreparedCall> {
        let layouts = self.inner.descriptor.args();
        if args.len() != layouts.len() {
            return Err(FfiError::ArityMismatch {
                symbol: self.name().to_string(),
                expected: layouts.len(),
                actual: args.len(),
            });
        }

        for (index, (arg, layout)) in args.iter().zip(layouts).enumerate() {
            let matches = match layout {
                ValueLayout::Scalar(scalar) => arg.primitive() == Some(scalar.kind),
                ValueLayout::Address(_) => matches!(arg, NativeArg::Segment(_) | NativeArg::Null),
                ValueLayout::Struct(_) | ValueLayout::Function(_) => false,
            };
            if !matches {
                return Err(FfiError::type_mismatch(
                    format!("`{}`", self.name()),
                    index,
                    layout,
                    arg.type_name(),
                ));
            }
        }

        let shape = &self.inner.shape;
        let mut ints = Vec::with_capacity(shape.ints);
        let mut floats = Vec::with_capacity(shape.floats);
        let mut leases = Vec::new();
        for ((arg, layout), class) in args.iter().zip(layouts).zip(&shape.classes) {
            match (arg, class) {
                (NativeArg::Segment(segment), _) => {
                    let lease = segment.lease()?;
                    if let ValueLayout::Address(Some(pointee)) = layout {
                        segment.check_range(0, pointee.size())?;
                    }
                    ints.push(lease.address() as u64);
                    leases.push(lease);
                }
                (NativeArg::Null, _) => ints.push(0),
                (_, ArgClass::Int) => ints.push(arg.int_bits()),
                (_, ArgClass::Float) => floats.push(arg.float_bits()),
            }
        }

        Ok(PreparedCall {
            binding: self.clone(),
            ints,
            floats,
            leases,
        })
    }
}

impl fmt::Debug for NativeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBinding")
            .field("symbol", &self.inner.symbol)
            .field("descriptor", &self.inner.descriptor.to_string())
            .finish()
    }
}

impl fmt::Display for NativeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name(), self.inner.descriptor)
    }
}

/// A fully checked call, holding leases on its segment arguments.
pub struct PreparedCall {
    binding: NativeBinding,
    ints: Vec<u64>,
    floats: Vec<f64>,
    leases: Vec<SegmentLease>,
}

impl PreparedCall {
    #[must_use]
    pub fn binding(&self) -> &NativeBinding {
        &self.binding
    }

    /// Issue the native call. Leases are released when this returns.
    pub fn call(self) -> FfiResult<NativeValue> {
        let inner = &self.binding.inner;
        FfiMetrics::inc(&global_metrics().native_calls);
        // SAFETY: the symbol's descriptor was validated at bind time and the
        // register images were built from it; every pointer argument is a
        // leased segment whose storage cannot be released before `self` drops.
        let value = unsafe {
            trampoline::call(
                inner.symbol.address(),
                &self.ints,
                &self.floats,
                inner.shape.ret,
            )
        };
        drop(self.leases);
        value.ok_or_else(|| {
            FfiError::invalid_descriptor(inner.symbol.name(), "call shape exceeds the register budget")
        })
    }
}

impl fmt::Debug for PreparedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedCall")
            .field("binding", &self.binding.to_string())
            .field("ints", &self.ints.len())
            .field("floats", &self.floats.len())
            .field("leases", &self.leases.len())
            .finish()
    }
}
