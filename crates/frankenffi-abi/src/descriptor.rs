//! Native function descriptors and bind-time validation.
//!
//! A [`FunctionDescriptor`] states the exact argument and return layouts of a
//! native function; nothing is ever inferred. [`FunctionDescriptor::validate`]
//! checks it once and yields the [`CallShape`] the trampoline dispatches on.

use std::fmt;

use frankenffi_membrane::{FfiError, FfiResult, MemoryLayout, Primitive, StructLayout};

/// Integer-class arguments passed in general-purpose registers.
pub const MAX_INT_ARGS: usize = 6;
/// Float-class arguments passed in vector registers.
pub const MAX_FLOAT_ARGS: usize = 4;

/// Whether this target's C calling convention is one the trampoline speaks.
pub const NATIVE_CALLS_SUPPORTED: bool = cfg!(any(
    all(target_arch = "x86_64", unix),
    all(target_arch = "aarch64", unix)
));

/// A primitive with its declared byte size and alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScalarLayout {
    pub kind: Primitive,
    pub byte_size: usize,
    pub byte_align: usize,
}

impl ScalarLayout {
    /// Natural size and alignment of `kind`.
    #[must_use]
    pub const fn natural(kind: Primitive) -> Self {
        Self {
            kind,
            byte_size: kind.size(),
            byte_align: kind.align(),
        }
    }

    /// Explicit size and alignment, checked at bind time.
    #[must_use]
    pub const fn new(kind: Primitive, byte_size: usize, byte_align: usize) -> Self {
        Self {
            kind,
            byte_size,
            byte_align,
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.kind == Primitive::Address {
            return Err("addresses must be declared with ValueLayout::Address".into());
        }
        if self.byte_size != self.kind.size() {
            return Err(format!(
                "{} declared with size {} (natural size {})",
                self.kind,
                self.byte_size,
                self.kind.size()
            ));
        }
        if !self.byte_align.is_power_of_two() {
            return Err(format!(
                "{} alignment {} is not a power of two",
                self.kind, self.byte_align
            ));
        }
        if self.byte_align > self.byte_size || self.byte_size % self.byte_align != 0 {
            return Err(format!(
                "{} alignment {} incompatible with size {}",
                self.kind, self.byte_align, self.byte_size
            ));
        }
        Ok(())
    }
}

/// Layout of a single argument or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueLayout {
    Scalar(ScalarLayout),
    /// Native pointer, optionally annotated with the pointee layout.
    Address(Option<MemoryLayout>),
    /// Struct passed by value. Always rejected at bind time.
    Struct(StructLayout),
    /// Function pointer (callback). Always rejected at bind time.
    Function(Box<FunctionDescriptor>),
}

impl ValueLayout {
    #[must_use]
    pub const fn scalar(kind: Primitive) -> Self {
        Self::Scalar(ScalarLayout::natural(kind))
    }

    /// Untyped pointer.
    #[must_use]
    pub const fn address() -> Self {
        Self::Address(None)
    }

    /// Pointer whose pointee must span at least `layout.size()` bytes.
    #[must_use]
    pub fn address_of(layout: impl Into<MemoryLayout>) -> Self {
        Self::Address(Some(layout.into()))
    }

    fn class(&self) -> Option<ArgClass> {
        match self {
            Self::Scalar(s) if s.kind.is_float() => Some(ArgClass::Float),
            Self::Scalar(_) | Self::Address(_) => Some(ArgClass::Int),
            Self::Struct(_) | Self::Function(_) => None,
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Self::Scalar(s) => s.check(),
            Self::Address(_) => Ok(()),
            Self::Struct(layout) => Err(format!(
                "struct {} passed by value is not supported",
                MemoryLayout::Struct(layout.clone())
            )),
            Self::Function(_) => Err("function-valued arguments (callbacks) are not supported".into()),
        }
    }
}

impl From<Primitive> for ValueLayout {
    fn from(kind: Primitive) -> Self {
        match kind {
            Primitive::Address => Self::Address(None),
            other => Self::scalar(other),
        }
    }
}

impl fmt::Display for ValueLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "{}", s.kind),
            Self::Address(None) => f.write_str("address"),
            Self::Address(Some(layout)) => write!(f, "address<{layout}>"),
            Self::Struct(s) => write!(f, "{}", MemoryLayout::Struct(s.clone())),
            Self::Function(d) => write!(f, "fn{d}"),
        }
    }
}

/// Return layout: nothing, or a single value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReturnLayout {
    Void,
    Value(ValueLayout),
}

impl fmt::Display for ReturnLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Value(v) => write!(f, "{v}"),
        }
    }
}

/// Ordered argument layouts plus return layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionDescriptor {
    args: Vec<ValueLayout>,
    ret: ReturnLayout,
}

impl FunctionDescriptor {
    /// Descriptor of a function returning `ret`.
    #[must_use]
    pub fn returning(
        ret: impl Into<ValueLayout>,
        args: impl IntoIterator<Item = ValueLayout>,
    ) -> Self {
        Self {
            args: args.into_iter().collect(),
            ret: ReturnLayout::Value(ret.into()),
        }
    }

    /// Descriptor of a function returning nothing.
    #[must_use]
    pub fn void(args: impl IntoIterator<Item = ValueLayout>) -> Self {
        Self {
            args: args.into_iter().collect(),
            ret: ReturnLayout::Void,
        }
    }

    #[must_use]
    pub fn args(&self) -> &[ValueLayout] {
        &self.args
    }

    #[must_use]
    pub fn ret(&self) -> &ReturnLayout {
        &self.ret
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Check every layout and derive the register shape of the call.
    pub fn validate(&self, symbol: &str) -> FfiResult<CallShape> {
        let reject = |reason: String| FfiError::invalid_descriptor(symbol, reason);
        if !NATIVE_CALLS_SUPPORTED {
            return Err(reject(format!(
                "native calls are not supported on {}",
                std::env::consts::ARCH
            )));
        }

        let mut classes = Vec::with_capacity(self.args.len());
        let (mut ints, mut floats) = (0_usize, 0_usize);
        for (index, arg) in self.args.iter().enumerate() {
            arg.check().map_err(|why| reject(format!("argument {index}: {why}")))?;
            let class = arg
                .class()
                .ok_or_else(|| reject(format!("argument {index}: unsupported layout {arg}")))?;
            match class {
                ArgClass::Int => ints += 1,
                ArgClass::Float => floats += 1,
            }
            classes.push(class);
        }
        if ints > MAX_INT_ARGS {
            return Err(reject(format!(
                "{ints} integer-class arguments exceed the register budget of {MAX_INT_ARGS}"
            )));
        }
        if floats > MAX_FLOAT_ARGS {
            return Err(reject(format!(
                "{floats} float-class arguments exceed the register budget of {MAX_FLOAT_ARGS}"
            )));
        }

        let ret = match &self.ret {
            ReturnLayout::Void => RetClass::Void,
            ReturnLayout::Value(value) => {
                value.check().map_err(|why| reject(format!("return: {why}")))?;
                match value {
                    ValueLayout::Scalar(s) if s.kind.is_float() => RetClass::Float(s.kind),
                    ValueLayout::Scalar(s) => RetClass::Int(s.kind),
                    _ => RetClass::Int(Primitive::Address),
                }
            }
        };

        Ok(CallShape {
            classes,
            ints,
            floats,
            ret,
        })
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Register file an argument travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgClass {
    Int,
    Float,
}

/// How the return register is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetClass {
    Void,
    Int(Primitive),
    Float(Primitive),
}

/// Precomputed register shape of a validated descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallShape {
    pub classes: Vec<ArgClass>,
    pub ints: usize,
    pub floats: usize,
    pub ret: RetClass,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(result: FfiResult<CallShape>) -> String {
        match result.unwrap_err() {
            FfiError::InvalidDescriptor { reason, .. } => reason,
            other => panic!("expected InvalidDescriptor, got {other:?}"),
        }
    }

    #[test]
    fn mixed_shape_counts_register_classes() {
        let desc = FunctionDescriptor::returning(
            Primitive::F64,
            [
                ValueLayout::scalar(Primitive::I32),
                ValueLayout::scalar(Primitive::F32),
                ValueLayout::address(),
            ],
        );
        let shape = desc.validate("mixed").unwrap();
        assert_eq!(
            shape.classes,
            vec![ArgClass::Int, ArgClass::Float, ArgClass::Int]
        );
        assert_eq!((shape.ints, shape.floats), (2, 1));
        assert_eq!(shape.ret, RetClass::Float(Primitive::F64));
    }

    #[test]
    fn scalar_size_must_be_natural() {
        let desc = FunctionDescriptor::void([ValueLayout::Scalar(ScalarLayout::new(
            Primitive::I32,
            8,
            4,
        ))]);
        assert!(reason(desc.validate("f")).contains("natural size 4"));
    }

    #[test]
    fn alignment_rules_are_enforced() {
        for (align, needle) in [(3, "power of two"), (16, "incompatible"), (0, "power of two")] {
            let desc = FunctionDescriptor::void([ValueLayout::Scalar(ScalarLayout::new(
                Primitive::I64,
                8,
                align,
            ))]);
            let why = reason(desc.validate("f"));
            assert!(why.contains(needle), "align {align}: {why}");
        }
        let relaxed = FunctionDescriptor::void([ValueLayout::Scalar(ScalarLayout::new(
            Primitive::I64,
            8,
            4,
        ))]);
        assert!(relaxed.validate("f").is_ok());
    }

    #[test]
    fn by_value_structs_and_callbacks_are_rejected() {
        let point = StructLayout::builder()
            .field("x", Primitive::I32)
            .field("y", Primitive::I32)
            .build()
            .unwrap();
        let by_value = FunctionDescriptor::void([ValueLayout::Struct(point.clone())]);
        assert!(reason(by_value.validate("draw")).contains("by value"));

        let returns_struct =
            FunctionDescriptor::returning(ValueLayout::Struct(point.clone()), []);
        assert!(reason(returns_struct.validate("origin")).starts_with("return"));

        let callback = FunctionDescriptor::void([ValueLayout::Function(Box::new(
            FunctionDescriptor::void([]),
        ))]);
        assert!(reason(callback.validate("qsort")).contains("callbacks"));

        // A pointer to the struct is fine.
        let by_ref = FunctionDescriptor::void([ValueLayout::address_of(point)]);
        assert!(by_ref.validate("draw").is_ok());
    }

    #[test]
    fn register_budget_is_enforced() {
        let ints = FunctionDescriptor::void(vec![ValueLayout::scalar(Primitive::U64); 7]);
        assert!(reason(ints.validate("wide")).contains("integer-class"));
        let floats = FunctionDescriptor::void(vec![ValueLayout::scalar(Primitive::F64); 5]);
        assert!(reason(floats.validate("wide")).contains("float-class"));
        let full = FunctionDescriptor::void(
            std::iter::repeat_n(ValueLayout::scalar(Primitive::U64), 6)
                .chain(std::iter::repeat_n(ValueLayout::scalar(Primitive::F32), 4)),
        );
        assert!(full.validate("full").is_ok());
    }

    #[test]
    fn address_primitive_must_use_address_layout() {
        let desc = FunctionDescriptor::void([ValueLayout::Scalar(ScalarLayout::natural(
            Primitive::Address,
        ))]);
        assert!(reason(desc.validate("f")).contains("ValueLayout::Address"));
        assert_eq!(ValueLayout::from(Primitive::Address), ValueLayout::address());
    }

    #[test]
    fn descriptors_render_readably() {
        let desc = FunctionDescriptor::returning(
            Primitive::U64,
            [ValueLayout::address(), ValueLayout::scalar(Primitive::I32)],
        );
        assert_eq!(desc.to_string(), "(address, i32) -> u64");
        assert_eq!(FunctionDescriptor::void([]).to_string(), "() -> void");
    }
}
