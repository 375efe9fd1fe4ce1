#![forbid(unsafe_code)]

use std::fmt;

use at_registry::{Domain, Registry, RegistryEntry, RegistryError, Selector};

/// Integers with a larger magnitude have no exact `f64` representation.
pub const MAX_EXACT_INTEGER: u64 = 1 << 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

impl ExecutionMode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
}

impl DType {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::Str => "str",
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
                | Self::U8
                | Self::U16
                | Self::U32
                | Self::U64
        )
    }

    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Str)
    }
}

/// Typed contiguous storage of an [`NdArray`], row-major.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayBuffer {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Str(Vec<String>),
}

impl ArrayBuffer {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::I8(values) => values.len(),
            Self::I16(values) => values.len(),
            Self::I32(values) => values.len(),
            Self::I64(values) => values.len(),
            Self::U8(values) => values.len(),
            Self::U16(values) => values.len(),
            Self::U32(values) => values.len(),
            Self::U64(values) => values.len(),
            Self::F32(values) => values.len(),
            Self::F64(values) => values.len(),
            Self::Str(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::I8(_) => DType::I8,
            Self::I16(_) => DType::I16,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::U8(_) => DType::U8,
            Self::U16(_) => DType::U16,
            Self::U32(_) => DType::U32,
            Self::U64(_) => DType::U64,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
            Self::Str(_) => DType::Str,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    buffer: ArrayBuffer,
    shape: Vec<usize>,
}

impl NdArray {
    /// An empty `shape` is a zero-dimensional array holding one element.
    pub fn new(buffer: ArrayBuffer, shape: Vec<usize>) -> Result<Self, ArgumentError> {
        let expected = checked_numel(&shape);
        if expected != Some(buffer.len()) {
            return Err(ArgumentError::ShapeDataMismatch {
                shape,
                len: buffer.len(),
            });
        }
        Ok(Self { buffer, shape })
    }

    pub fn from_f64(data: Vec<f64>, shape: Vec<usize>) -> Result<Self, ArgumentError> {
        Self::new(ArrayBuffer::F64(data), shape)
    }

    pub fn from_i64(data: Vec<i64>, shape: Vec<usize>) -> Result<Self, ArgumentError> {
        Self::new(ArrayBuffer::I64(data), shape)
    }

    #[must_use]
    pub fn vector_f64(data: Vec<f64>) -> Self {
        let shape = vec![data.len()];
        Self {
            buffer: ArrayBuffer::F64(data),
            shape,
        }
    }

    #[must_use]
    pub fn zero_dim_f64(value: f64) -> Self {
        Self {
            buffer: ArrayBuffer::F64(vec![value]),
            shape: Vec::new(),
        }
    }

    #[must_use]
    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.buffer.len()
    }
}

/// One dynamically typed value as handed over by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Float(f64),
    Int(i64),
    Text(String),
    Null,
    Entry(RegistryEntry),
    Opaque { type_name: String },
}

impl Element {
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Text(_) => "str",
            Self::Null => "null",
            Self::Entry(entry) => entry.domain().label(),
            Self::Opaque { type_name } => type_name.as_str(),
        }
    }
}

impl From<f64> for Element {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for Element {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Element {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Element {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<RegistryEntry> for Element {
    fn from(value: RegistryEntry) -> Self {
        Self::Entry(value)
    }
}

impl From<Selector> for Element {
    fn from(value: Selector) -> Self {
        match value {
            Selector::Id(id) => Self::Int(id),
            Selector::Name(name) => Self::Text(name),
            Selector::Entry(entry) => Self::Entry(entry),
            Selector::Unsupported { type_name } => Self::Opaque { type_name },
        }
    }
}

/// One caller-supplied argument before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericInput {
    Scalar(Element),
    Sequence(Vec<Element>),
    Array(NdArray),
}

impl NumericInput {
    pub fn from_scalar(value: impl Into<Element>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn from_sequence<I, E>(values: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Element>,
    {
        Self::Sequence(values.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn from_array(array: NdArray) -> Self {
        Self::Array(array)
    }

    #[must_use]
    pub fn from_selector(selector: Selector) -> Self {
        Self::Scalar(selector.into())
    }

    /// Container kind as seen by the caller. Zero-dimensional arrays count as
    /// scalars.
    #[must_use]
    pub fn origin(&self) -> OriginKind {
        match self {
            Self::Scalar(_) => OriginKind::Scalar,
            Self::Sequence(_) => OriginKind::List,
            Self::Array(array) if array.shape().is_empty() => OriginKind::Scalar,
            Self::Array(_) => OriginKind::Array,
        }
    }
}

impl From<f64> for NumericInput {
    fn from(value: f64) -> Self {
        Self::from_scalar(value)
    }
}

impl From<Vec<f64>> for NumericInput {
    fn from(values: Vec<f64>) -> Self {
        Self::from_sequence(values)
    }
}

impl From<NdArray> for NumericInput {
    fn from(array: NdArray) -> Self {
        Self::Array(array)
    }
}

impl From<Selector> for NumericInput {
    fn from(selector: Selector) -> Self {
        Self::from_selector(selector)
    }
}

/// Richness order: `Scalar < List < Array`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OriginKind {
    Scalar,
    List,
    Array,
}

impl OriginKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::List => "list",
            Self::Array => "array",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValues {
    Numeric(Vec<f64>),
    /// Scalar selectors hold an already resolved `Selector::Entry`; container
    /// elements stay unresolved until dispatch.
    Selector { domain: Domain, keys: Vec<Selector> },
}

impl ArgumentValues {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Selector { keys, .. } => keys.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalArgument {
    values: ArgumentValues,
    shape: Vec<usize>,
    origin: OriginKind,
    lossy_integers: usize,
}

impl CanonicalArgument {
    #[must_use]
    pub fn values(&self) -> &ArgumentValues {
        &self.values
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn origin(&self) -> OriginKind {
        self.origin
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    #[must_use]
    pub fn is_selector(&self) -> bool {
        matches!(self.values, ArgumentValues::Selector { .. })
    }

    /// Integers accepted in hardened mode although `f64` cannot hold them
    /// exactly.
    #[must_use]
    pub fn lossy_integers(&self) -> usize {
        self.lossy_integers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    InvalidArgumentType {
        type_name: String,
    },
    NonNumericElement {
        index: usize,
        type_name: String,
    },
    InvalidSelectorType {
        domain: Domain,
        type_name: String,
    },
    UnknownIdentifier {
        domain: Domain,
        identifier: String,
    },
    ShapeDataMismatch {
        shape: Vec<usize>,
        len: usize,
    },
    PrecisionLoss {
        index: usize,
        value: i128,
    },
    Registry(RegistryError),
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgumentType { type_name } => write!(
                f,
                "expected a number, a sequence of numbers or a numeric array, got {type_name}"
            ),
            Self::NonNumericElement { index, type_name } => {
                write!(f, "non-numeric element at index {index}: {type_name}")
            }
            Self::InvalidSelectorType { domain, type_name } => write!(
                f,
                "{} selector must be an id, a name or a {} descriptor, got {type_name}",
                domain.label(),
                domain.label()
            ),
            Self::UnknownIdentifier { domain, identifier } => {
                write!(f, "unknown {} identifier: {identifier}", domain.label())
            }
            Self::ShapeDataMismatch { shape, len } => write!(
                f,
                "array shape {shape:?} does not match buffer length {len}"
            ),
            Self::PrecisionLoss { index, value } => write!(
                f,
                "integer {value} at index {index} has no exact f64 representation"
            ),
            Self::Registry(error) => write!(f, "registry failure: {error}"),
        }
    }
}

impl std::error::Error for ArgumentError {}

impl From<RegistryError> for ArgumentError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownIdentifier { domain, identifier } => {
                Self::UnknownIdentifier { domain, identifier }
            }
            RegistryError::InvalidSelectorType { domain, type_name } => {
                Self::InvalidSelectorType { domain, type_name }
            }
            other => Self::Registry(other),
        }
    }
}

struct Upcast {
    mode: ExecutionMode,
    lossy: usize,
}

impl Upcast {
    fn new(mode: ExecutionMode) -> Self {
        Self { mode, lossy: 0 }
    }

    fn integer(&mut self, index: usize, value: i128) -> Result<f64, ArgumentError> {
        let converted = value as f64;
        // every integer up to 2^53 is exact; above it only some are
        if value.unsigned_abs() > u128::from(MAX_EXACT_INTEGER) && converted as i128 != value {
            match self.mode {
                ExecutionMode::Strict => {
                    return Err(ArgumentError::PrecisionLoss { index, value });
                }
                ExecutionMode::Hardened => self.lossy += 1,
            }
        }
        Ok(converted)
    }

    fn element(&mut self, index: usize, element: &Element) -> Option<Result<f64, ArgumentError>> {
        match element {
            Element::Float(value) => Some(Ok(*value)),
            Element::Int(value) => Some(self.integer(index, i128::from(*value))),
            _ => None,
        }
    }
}

/// Canonicalizes an argument in numeric role.
pub fn normalize_numeric(
    input: &NumericInput,
    mode: ExecutionMode,
) -> Result<CanonicalArgument, ArgumentError> {
    let mut upcast = Upcast::new(mode);
    let (values, shape) = match input {
        NumericInput::Scalar(element) => {
            let value = upcast.element(0, element).unwrap_or_else(|| {
                Err(ArgumentError::InvalidArgumentType {
                    type_name: element.type_name().to_string(),
                })
            })?;
            (vec![value], Vec::new())
        }
        NumericInput::Sequence(elements) => {
            let mut values = Vec::with_capacity(elements.len());
            for (index, element) in elements.iter().enumerate() {
                let value = upcast.element(index, element).unwrap_or_else(|| {
                    Err(ArgumentError::NonNumericElement {
                        index,
                        type_name: element.type_name().to_string(),
                    })
                })?;
                values.push(value);
            }
            (values, vec![elements.len()])
        }
        NumericInput::Array(array) => (
            array_to_f64(array.buffer(), &mut upcast)?,
            array.shape().to_vec(),
        ),
    };

    Ok(CanonicalArgument {
        values: ArgumentValues::Numeric(values),
        shape,
        origin: input.origin(),
        lossy_integers: upcast.lossy,
    })
}

/// Canonicalizes an argument in selector role. A scalar selector is resolved
/// right away; container elements are only type-checked here.
pub fn normalize_selector(
    input: &NumericInput,
    domain: Domain,
    registry: &Registry,
) -> Result<CanonicalArgument, ArgumentError> {
    let (mut keys, shape) = match input {
        NumericInput::Scalar(element) => (vec![selector_key(domain, element)?], Vec::new()),
        NumericInput::Sequence(elements) => (
            elements
                .iter()
                .map(|element| selector_key(domain, element))
                .collect::<Result<Vec<_>, _>>()?,
            vec![elements.len()],
        ),
        NumericInput::Array(array) => (
            array_to_selectors(domain, array.buffer())?,
            array.shape().to_vec(),
        ),
    };

    if shape.is_empty() {
        for key in &mut keys {
            *key = Selector::Entry(registry.resolve(domain, key)?);
        }
    }

    Ok(CanonicalArgument {
        values: ArgumentValues::Selector { domain, keys },
        shape,
        origin: input.origin(),
        lossy_integers: 0,
    })
}

fn selector_key(domain: Domain, element: &Element) -> Result<Selector, ArgumentError> {
    match element {
        Element::Int(id) => Ok(Selector::Id(*id)),
        Element::Text(name) => Ok(Selector::Name(name.clone())),
        Element::Entry(entry) if entry.domain() == domain => Ok(Selector::Entry(entry.clone())),
        other => Err(ArgumentError::InvalidSelectorType {
            domain,
            type_name: other.type_name().to_string(),
        }),
    }
}

fn array_to_f64(buffer: &ArrayBuffer, upcast: &mut Upcast) -> Result<Vec<f64>, ArgumentError> {
    let values: Vec<f64> = match buffer {
        ArrayBuffer::I8(values) => values.iter().copied().map(f64::from).collect(),
        ArrayBuffer::I16(values) => values.iter().copied().map(f64::from).collect(),
        ArrayBuffer::I32(values) => values.iter().copied().map(f64::from).collect(),
        ArrayBuffer::U8(values) => values.iter().copied().map(f64::from).collect(),
        ArrayBuffer::U16(values) => values.iter().copied().map(f64::from).collect(),
        ArrayBuffer::U32(values) => values.iter().copied().map(f64::from).collect(),
        ArrayBuffer::I64(values) => values
            .iter()
            .enumerate()
            .map(|(index, value)| upcast.integer(index, i128::from(*value)))
            .collect::<Result<_, _>>()?,
        ArrayBuffer::U64(values) => values
            .iter()
            .enumerate()
            .map(|(index, value)| upcast.integer(index, i128::from(*value)))
            .collect::<Result<_, _>>()?,
        ArrayBuffer::F32(values) => values.iter().copied().map(f64::from).collect(),
        ArrayBuffer::F64(values) => values.clone(),
        ArrayBuffer::Str(values) => {
            if values.is_empty() {
                Vec::new()
            } else {
                return Err(ArgumentError::NonNumericElement {
                    index: 0,
                    type_name: DType::Str.label().to_string(),
                });
            }
        }
    };
    Ok(values)
}

fn array_to_selectors(domain: Domain, buffer: &ArrayBuffer) -> Result<Vec<Selector>, ArgumentError> {
    let ids = |values: Vec<i64>| values.into_iter().map(Selector::Id).collect::<Vec<_>>();
    let keys: Vec<Selector> = match buffer {
        ArrayBuffer::I8(values) => ids(values.iter().copied().map(i64::from).collect()),
        ArrayBuffer::I16(values) => ids(values.iter().copied().map(i64::from).collect()),
        ArrayBuffer::I32(values) => ids(values.iter().copied().map(i64::from).collect()),
        ArrayBuffer::I64(values) => ids(values.clone()),
        ArrayBuffer::U8(values) => ids(values.iter().copied().map(i64::from).collect()),
        ArrayBuffer::U16(values) => ids(values.iter().copied().map(i64::from).collect()),
        ArrayBuffer::U32(values) => ids(values.iter().copied().map(i64::from).collect()),
        ArrayBuffer::U64(values) => {
            let mut converted = Vec::with_capacity(values.len());
            for value in values {
                let id = i64::try_from(*value).map_err(|_| ArgumentError::UnknownIdentifier {
                    domain,
                    identifier: value.to_string(),
                })?;
                converted.push(id);
            }
            ids(converted)
        }
        ArrayBuffer::Str(values) => values.iter().cloned().map(Selector::Name).collect(),
        ArrayBuffer::F32(_) | ArrayBuffer::F64(_) => {
            return Err(ArgumentError::InvalidSelectorType {
                domain,
                type_name: format!("{} array", buffer.dtype().label()),
            });
        }
    };
    Ok(keys)
}

/// Element count of `shape`; `None` on overflow. The empty shape holds one
/// element.
#[must_use]
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}
