//! Structural layouts for native memory.
//!
//! Layouts describe how bytes in a segment are interpreted: primitive
//! scalars, C-style structs with natural alignment, explicit padding and
//! fixed-length sequences. Field paths use `.` for struct members and `[i]`
//! for sequence elements, e.g. `"header.len"` or `"items[2].amount"`.

use std::fmt;

use crate::error::FfiError;

/// Primitive value kinds understood by segments and native descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Native pointer-sized address.
    Address,
}

impl Primitive {
    /// Natural size in bytes.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Address => std::mem::size_of::<usize>(),
        }
    }

    /// Natural alignment in bytes.
    #[must_use]
    pub const fn align(self) -> usize {
        self.size()
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::F32 | Self::F64
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Address => "address",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed scalar read from or written to native memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Address(usize),
}

impl ScalarValue {
    #[must_use]
    pub const fn primitive(self) -> Primitive {
        match self {
            Self::I8(_) => Primitive::I8,
            Self::U8(_) => Primitive::U8,
            Self::I16(_) => Primitive::I16,
            Self::U16(_) => Primitive::U16,
            Self::I32(_) => Primitive::I32,
            Self::U32(_) => Primitive::U32,
            Self::I64(_) => Primitive::I64,
            Self::U64(_) => Primitive::U64,
            Self::F32(_) => Primitive::F32,
            Self::F64(_) => Primitive::F64,
            Self::Address(_) => Primitive::Address,
        }
    }

    /// Native-endian encoding; only the first `primitive().size()` bytes are meaningful.
    #[must_use]
    pub fn to_ne_bytes(self) -> [u8; 8] {
        let mut out = [0_u8; 8];
        match self {
            Self::I8(v) => out[..1].copy_from_slice(&v.to_ne_bytes()),
            Self::U8(v) => out[..1].copy_from_slice(&v.to_ne_bytes()),
            Self::I16(v) => out[..2].copy_from_slice(&v.to_ne_bytes()),
            Self::U16(v) => out[..2].copy_from_slice(&v.to_ne_bytes()),
            Self::I32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            Self::U32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            Self::I64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Self::U64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Self::F32(v) => out[..4].copy_from_slice(&v.to_ne_bytes()),
            Self::F64(v) => out.copy_from_slice(&v.to_ne_bytes()),
            Self::Address(v) => {
                let bytes = v.to_ne_bytes();
                out[..bytes.len()].copy_from_slice(&bytes);
            }
        }
        out
    }

    /// Decode `kind` from native-endian bytes. `bytes` must hold at least `kind.size()` bytes.
    #[must_use]
    pub fn from_ne_bytes(kind: Primitive, bytes: &[u8]) -> Self {
        let mut raw = [0_u8; 8];
        raw[..kind.size()].copy_from_slice(&bytes[..kind.size()]);
        let b2 = [raw[0], raw[1]];
        let b4 = [raw[0], raw[1], raw[2], raw[3]];
        match kind {
            Primitive::I8 => Self::I8(raw[0] as i8),
            Primitive::U8 => Self::U8(raw[0]),
            Primitive::I16 => Self::I16(i16::from_ne_bytes(b2)),
            Primitive::U16 => Self::U16(u16::from_ne_bytes(b2)),
            Primitive::I32 => Self::I32(i32::from_ne_bytes(b4)),
            Primitive::U32 => Self::U32(u32::from_ne_bytes(b4)),
            Primitive::I64 => Self::I64(i64::from_ne_bytes(raw)),
            Primitive::U64 => Self::U64(u64::from_ne_bytes(raw)),
            Primitive::F32 => Self::F32(f32::from_ne_bytes(b4)),
            Primitive::F64 => Self::F64(f64::from_ne_bytes(raw)),
            Primitive::Address => {
                let mut addr = [0_u8; std::mem::size_of::<usize>()];
                let width = addr.len();
                addr.copy_from_slice(&raw[..width]);
                Self::Address(usize::from_ne_bytes(addr))
            }
        }
    }
}

/// Shape of a region of native memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLayout {
    Scalar(Primitive),
    /// Unnamed filler bytes with alignment 1.
    Padding(usize),
    Struct(StructLayout),
    Sequence {
        element: Box<MemoryLayout>,
        count: usize,
    },
}

impl MemoryLayout {
    #[must_use]
    pub fn sequence(element: impl Into<MemoryLayout>, count: usize) -> Self {
        Self::Sequence {
            element: Box::new(element.into()),
            count,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Scalar(p) => p.size(),
            Self::Padding(n) => *n,
            Self::Struct(s) => s.size,
            Self::Sequence { element, count } => element.size().saturating_mul(*count),
        }
    }

    #[must_use]
    pub fn align(&self) -> usize {
        match self {
            Self::Scalar(p) => p.align(),
            Self::Padding(_) => 1,
            Self::Struct(s) => s.align,
            Self::Sequence { element, .. } => element.align(),
        }
    }

    /// Resolve a field path to its offset, size and scalar kind.
    pub fn resolve(&self, path: &str) -> Result<FieldInfo, FfiError> {
        let unknown = || FfiError::UnknownField {
            path: path.to_string(),
        };
        let mut offset = 0_usize;
        let mut current = self;
        for step in parse_path(path).ok_or_else(unknown)? {
            match (step, current) {
                (PathStep::Field(name), Self::Struct(layout)) => {
                    let field = layout.field(name).ok_or_else(unknown)?;
                    offset = offset.checked_add(field.offset).ok_or_else(unknown)?;
                    current = &field.layout;
                }
                (PathStep::Index(index), Self::Sequence { element, count }) => {
                    if index >= *count {
                        return Err(unknown());
                    }
                    offset = element
                        .size()
                        .checked_mul(index)
                        .and_then(|step| offset.checked_add(step))
                        .ok_or_else(unknown)?;
                    current = element;
                }
                _ => return Err(unknown()),
            }
        }
        Ok(FieldInfo {
            offset,
            size: current.size(),
            kind: match current {
                Self::Scalar(p) => Some(*p),
                _ => None,
            },
        })
    }
}

impl From<Primitive> for MemoryLayout {
    fn from(p: Primitive) -> Self {
        Self::Scalar(p)
    }
}

impl From<StructLayout> for MemoryLayout {
    fn from(s: StructLayout) -> Self {
        Self::Struct(s)
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(p) => write!(f, "{p}"),
            Self::Padding(n) => write!(f, "pad({n})"),
            Self::Struct(s) => {
                f.write_str("{")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.layout)?;
                }
                f.write_str("}")
            }
            Self::Sequence { element, count } => write!(f, "[{element}; {count}]"),
        }
    }
}

/// Resolved location of a field inside a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub offset: usize,
    pub size: usize,
    /// Scalar kind, `None` for aggregate fields.
    pub kind: Option<Primitive>,
}

/// Named member of a [`StructLayout`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructField {
    pub name: String,
    pub offset: usize,
    pub layout: MemoryLayout,
}

/// C-style struct layout with natural member alignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    fields: Vec<StructField>,
    size: usize,
    align: usize,
}

impl StructLayout {
    #[must_use]
    pub fn builder() -> StructLayoutBuilder {
        StructLayoutBuilder::default()
    }

    #[must_use]
    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }
}

/// Incremental builder computing member offsets.
#[derive(Debug, Default)]
pub struct StructLayoutBuilder {
    members: Vec<(Option<String>, MemoryLayout)>,
}

impl StructLayoutBuilder {
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, layout: impl Into<MemoryLayout>) -> Self {
        self.members.push((Some(name.into()), layout.into()));
        self
    }

    #[must_use]
    pub fn padding(mut self, bytes: usize) -> Self {
        self.members.push((None, MemoryLayout::Padding(bytes)));
        self
    }

    /// Compute offsets; duplicate names are rejected.
    pub fn build(self) -> Result<StructLayout, FfiError> {
        let mut fields: Vec<StructField> = Vec::with_capacity(self.members.len());
        let mut offset = 0_usize;
        let mut align = 1_usize;
        for (name, layout) in self.members {
            let member_align = layout.align();
            offset = align_up(offset, member_align);
            align = align.max(member_align);
            let size = layout.size();
            if let Some(name) = name {
                if fields.iter().any(|f| f.name == name) {
                    return Err(FfiError::invalid_descriptor(
                        "<layout>",
                        format!("duplicate field `{name}`"),
                    ));
                }
                fields.push(StructField {
                    name,
                    offset,
                    layout,
                });
            }
            offset += size;
        }
        Ok(StructLayout {
            fields,
            size: align_up(offset, align),
            align,
        })
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathStep<'a> {
    Field(&'a str),
    Index(usize),
}

fn parse_path(path: &str) -> Option<Vec<PathStep<'_>>> {
    let mut steps = Vec::new();
    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if !name.is_empty() {
            steps.push(PathStep::Field(name));
        } else if rest.is_empty() {
            return None;
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let index = rest[1..close].parse().ok()?;
            steps.push(PathStep::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }
    Some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> StructLayout {
        StructLayout::builder()
            .field("x", Primitive::I32)
            .field("y", Primitive::I32)
            .build()
            .unwrap()
    }

    #[test]
    fn natural_alignment_inserts_padding() {
        let layout = StructLayout::builder()
            .field("tag", Primitive::U8)
            .field("amount", Primitive::F64)
            .field("flags", Primitive::U16)
            .build()
            .unwrap();
        assert_eq!(layout.field("tag").unwrap().offset, 0);
        assert_eq!(layout.field("amount").unwrap().offset, 8);
        assert_eq!(layout.field("flags").unwrap().offset, 16);
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.align(), 8);
    }

    #[test]
    fn explicit_padding_shifts_members() {
        let layout = StructLayout::builder()
            .field("a", Primitive::U8)
            .padding(3)
            .field("b", Primitive::U8)
            .build()
            .unwrap();
        assert_eq!(layout.field("b").unwrap().offset, 4);
        assert_eq!(layout.fields().len(), 2);
        assert_eq!(layout.size(), 5);
    }

    #[test]
    fn nested_paths_resolve() {
        let line = StructLayout::builder()
            .field("id", Primitive::U64)
            .field("points", MemoryLayout::sequence(point(), 3))
            .build()
            .unwrap();
        let layout = MemoryLayout::from(line);

        let info = layout.resolve("points[2].y").unwrap();
        assert_eq!(info.offset, 8 + 2 * 8 + 4);
        assert_eq!(info.size, 4);
        assert_eq!(info.kind, Some(Primitive::I32));

        let aggregate = layout.resolve("points[1]").unwrap();
        assert_eq!(aggregate.kind, None);
        assert_eq!(aggregate.size, 8);
    }

    #[test]
    fn bad_paths_are_unknown_fields() {
        let layout = MemoryLayout::from(point());
        for path in ["z", "x.y", "x[0]", "[0]", "", "x..y", "x[", "x[a]"] {
            let err = layout.resolve(path).unwrap_err();
            assert!(
                matches!(err, FfiError::UnknownField { .. }),
                "path {path:?} gave {err:?}"
            );
        }
        let seq = MemoryLayout::sequence(Primitive::U8, 4);
        assert!(seq.resolve("[3]").is_ok());
        assert!(seq.resolve("[4]").is_err());
    }

    #[test]
    fn oversized_sequence_offsets_are_unknown_fields() {
        let huge = MemoryLayout::sequence(MemoryLayout::sequence(Primitive::U64, usize::MAX), 4);
        assert_eq!(huge.size(), usize::MAX);
        assert_eq!(huge.resolve("[0][1]").unwrap().offset, 8);
        let err = huge.resolve("[3][0]").unwrap_err();
        assert!(matches!(err, FfiError::UnknownField { ref path } if path == "[3][0]"));
    }

    #[test]
    fn duplicate_field_rejected() {
        let err = StructLayout::builder()
            .field("a", Primitive::U8)
            .field("a", Primitive::U16)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate field `a`"));
    }

    #[test]
    fn scalar_bytes_round_trip_per_kind() {
        let samples = [
            ScalarValue::I8(-3),
            ScalarValue::U16(0xBEEF),
            ScalarValue::I32(-123_456),
            ScalarValue::U64(u64::MAX - 1),
            ScalarValue::F32(1.5),
            ScalarValue::F64(-2.25),
            ScalarValue::Address(0xDEAD_0000),
        ];
        for value in samples {
            let bytes = value.to_ne_bytes();
            assert_eq!(ScalarValue::from_ne_bytes(value.primitive(), &bytes), value);
        }
    }
}
