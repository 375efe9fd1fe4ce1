#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use at_core::{ArrayBuffer, DType, Element, NdArray, NumericInput};
use at_dispatch::{CallOutput, ListNode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const CALL_SCHEMA_VERSION: u32 = 1;
const MAX_CALL_PAYLOAD_BYTES: usize = 1_048_576;
const CALL_REQUEST_FIELDS: [&str; 6] = [
    "schema_version",
    "op",
    "input",
    "material",
    "model",
    "cartesian_product",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireDType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Str,
}

impl From<DType> for WireDType {
    fn from(value: DType) -> Self {
        match value {
            DType::I8 => Self::Int8,
            DType::I16 => Self::Int16,
            DType::I32 => Self::Int32,
            DType::I64 => Self::Int64,
            DType::U8 => Self::Uint8,
            DType::U16 => Self::Uint16,
            DType::U32 => Self::Uint32,
            DType::U64 => Self::Uint64,
            DType::F32 => Self::Float32,
            DType::F64 => Self::Float64,
            DType::Str => Self::Str,
        }
    }
}

impl From<WireDType> for DType {
    fn from(value: WireDType) -> Self {
        match value {
            WireDType::Int8 => Self::I8,
            WireDType::Int16 => Self::I16,
            WireDType::Int32 => Self::I32,
            WireDType::Int64 => Self::I64,
            WireDType::Uint8 => Self::U8,
            WireDType::Uint16 => Self::U16,
            WireDType::Uint32 => Self::U32,
            WireDType::Uint64 => Self::U64,
            WireDType::Float32 => Self::F32,
            WireDType::Float64 => Self::F64,
            WireDType::Str => Self::Str,
        }
    }
}

/// `{"id": 7}` or `{"name": "tabata"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireSelector {
    Id(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireElement {
    Int(i64),
    /// JSON integers above `i64::MAX`; kept apart so they never pass as floats.
    Unsigned(u64),
    Float(f64),
    Text(String),
    Null,
    Selector(WireSelector),
    Opaque { opaque: String },
}

impl WireElement {
    pub fn into_element(self) -> Result<Element, SerializeError> {
        let element = match self {
            Self::Int(value) => Element::Int(value),
            Self::Unsigned(value) => {
                return Err(SerializeError::IncompatiblePayload {
                    reason: format!("integer {value} exceeds the int64 range"),
                });
            }
            Self::Float(value) => Element::Float(value),
            Self::Text(value) => Element::Text(value),
            Self::Null => Element::Null,
            Self::Selector(WireSelector::Id(id)) => Element::Int(id),
            Self::Selector(WireSelector::Name(name)) => Element::Text(name),
            Self::Opaque { opaque } => Element::Opaque { type_name: opaque },
        };
        Ok(element)
    }
}

impl From<&Element> for WireElement {
    fn from(value: &Element) -> Self {
        match value {
            Element::Float(value) => Self::Float(*value),
            Element::Int(value) => Self::Int(*value),
            Element::Text(value) => Self::Text(value.clone()),
            Element::Null => Self::Null,
            Element::Entry(entry) => Self::Selector(WireSelector::Id(entry.id())),
            Element::Opaque { type_name } => Self::Opaque {
                opaque: type_name.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireArray {
    pub dtype: WireDType,
    pub shape: Vec<usize>,
    pub data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireInput {
    Scalar(WireElement),
    Sequence(Vec<WireElement>),
    Array(WireArray),
}

impl WireInput {
    pub fn into_numeric_input(self) -> Result<NumericInput, SerializeError> {
        match self {
            Self::Scalar(element) => element.into_element().map(NumericInput::Scalar),
            Self::Sequence(elements) => elements
                .into_iter()
                .map(WireElement::into_element)
                .collect::<Result<Vec<_>, _>>()
                .map(NumericInput::Sequence),
            Self::Array(array) => decode_array(array).map(NumericInput::Array),
        }
    }
}

#[must_use]
pub fn encode_input(input: &NumericInput) -> WireInput {
    match input {
        NumericInput::Scalar(element) => WireInput::Scalar(element.into()),
        NumericInput::Sequence(elements) => {
            WireInput::Sequence(elements.iter().map(WireElement::from).collect())
        }
        NumericInput::Array(array) => WireInput::Array(WireArray {
            dtype: array.dtype().into(),
            shape: array.shape().to_vec(),
            data: encode_buffer(array.buffer()),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOp {
    ElectronRange,
    BetaFromEnergy,
    EnergyFromBeta,
}

impl CallOp {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ElectronRange => "electron_range",
            Self::BetaFromEnergy => "beta_from_energy",
            Self::EnergyFromBeta => "energy_from_beta",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallRequest {
    pub schema_version: u32,
    pub op: CallOp,
    pub input: WireInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<WireInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<WireInput>,
    #[serde(default)]
    pub cartesian_product: bool,
}

impl CallRequest {
    #[must_use]
    pub fn new(op: CallOp, input: WireInput) -> Self {
        Self {
            schema_version: CALL_SCHEMA_VERSION,
            op,
            input,
            material: None,
            model: None,
            cartesian_product: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCall {
    pub request: CallRequest,
    /// Top-level fields dropped by a hardened decode.
    pub ignored_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

pub fn decode_call_request(input: &str, mode: DecodeMode) -> Result<DecodedCall, SerializeError> {
    validate_payload_size(input)?;
    let decoded = match mode {
        DecodeMode::Strict => decode_call_request_strict(input)?,
        DecodeMode::Hardened => decode_call_request_hardened(input)?,
    };
    if decoded.request.schema_version != CALL_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: CALL_SCHEMA_VERSION,
            found: decoded.request.schema_version,
        });
    }
    Ok(decoded)
}

pub fn encode_call_request(request: &CallRequest) -> Result<String, SerializeError> {
    serde_json::to_string(request).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("call request encoding failed: {error}"),
    })
}

fn decode_call_request_strict(input: &str) -> Result<DecodedCall, SerializeError> {
    let request: CallRequest = serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })?;
    Ok(DecodedCall {
        request,
        ignored_fields: Vec::new(),
    })
}

fn decode_call_request_hardened(input: &str) -> Result<DecodedCall, SerializeError> {
    let mut raw: Value = serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
        diagnostic: bounded(
            format!(
                "{error}; payload_prefix={} ",
                bounded(input.replace('\n', " ").as_str(), 96)
            )
            .as_str(),
            220,
        ),
    })?;

    let obj = raw
        .as_object_mut()
        .ok_or_else(|| SerializeError::IncompatiblePayload {
            reason: "top-level call payload must be a JSON object".to_string(),
        })?;

    let allowed: BTreeSet<&str> = BTreeSet::from(CALL_REQUEST_FIELDS);
    let ignored_fields: Vec<String> = obj
        .keys()
        .filter(|key| !allowed.contains(key.as_str()))
        .cloned()
        .collect();
    for field in &ignored_fields {
        obj.remove(field);
    }

    let request: CallRequest =
        serde_json::from_value(raw).map_err(|error| SerializeError::IncompatiblePayload {
            reason: bounded(error.to_string().as_str(), 200),
        })?;
    Ok(DecodedCall {
        request,
        ignored_fields,
    })
}

/// JSON form of a call result: a number, nested arrays, or
/// `{"shape": [...], "data": [...]}`. NaN encodes as `null`.
#[must_use]
pub fn encode_output(output: &CallOutput) -> Value {
    match output {
        CallOutput::Scalar(value) => Value::from(*value),
        CallOutput::List(root) => encode_list(root),
        CallOutput::Array(array) => {
            let data: Vec<Value> = array.data().iter().copied().map(Value::from).collect();
            json!({ "shape": array.shape(), "data": data })
        }
    }
}

fn encode_list(node: &ListNode) -> Value {
    match node {
        ListNode::Leaf(value) => Value::from(*value),
        ListNode::Branch(children) => Value::Array(children.iter().map(encode_list).collect()),
    }
}

fn decode_array(array: WireArray) -> Result<NdArray, SerializeError> {
    let WireArray { dtype, shape, data } = array;
    let buffer = match dtype {
        WireDType::Int8 => ArrayBuffer::I8(convert(&data, dtype, |value| {
            value.as_i64().and_then(|v| i8::try_from(v).ok())
        })?),
        WireDType::Int16 => ArrayBuffer::I16(convert(&data, dtype, |value| {
            value.as_i64().and_then(|v| i16::try_from(v).ok())
        })?),
        WireDType::Int32 => ArrayBuffer::I32(convert(&data, dtype, |value| {
            value.as_i64().and_then(|v| i32::try_from(v).ok())
        })?),
        WireDType::Int64 => ArrayBuffer::I64(convert(&data, dtype, Value::as_i64)?),
        WireDType::Uint8 => ArrayBuffer::U8(convert(&data, dtype, |value| {
            value.as_u64().and_then(|v| u8::try_from(v).ok())
        })?),
        WireDType::Uint16 => ArrayBuffer::U16(convert(&data, dtype, |value| {
            value.as_u64().and_then(|v| u16::try_from(v).ok())
        })?),
        WireDType::Uint32 => ArrayBuffer::U32(convert(&data, dtype, |value| {
            value.as_u64().and_then(|v| u32::try_from(v).ok())
        })?),
        WireDType::Uint64 => ArrayBuffer::U64(convert(&data, dtype, Value::as_u64)?),
        WireDType::Float32 => ArrayBuffer::F32(convert(&data, dtype, float32_value)?),
        WireDType::Float64 => ArrayBuffer::F64(convert(&data, dtype, float_value)?),
        WireDType::Str => ArrayBuffer::Str(convert(&data, dtype, |value| {
            value.as_str().map(str::to_string)
        })?),
    };
    NdArray::new(buffer, shape).map_err(|error| SerializeError::IncompatiblePayload {
        reason: error.to_string(),
    })
}

// null stands for NaN in float payloads
fn float_value(value: &Value) -> Option<f64> {
    if value.is_null() {
        return Some(f64::NAN);
    }
    value.as_f64()
}

// finite values outside the f32 range are rejected, not rounded to infinity
fn float32_value(value: &Value) -> Option<f32> {
    let wide = float_value(value)?;
    if wide.is_finite() && !(f64::from(f32::MIN)..=f64::from(f32::MAX)).contains(&wide) {
        return None;
    }
    Some(wide as f32)
}

fn convert<T, F>(data: &[Value], dtype: WireDType, read: F) -> Result<Vec<T>, SerializeError>
where
    F: Fn(&Value) -> Option<T>,
{
    data.iter()
        .enumerate()
        .map(|(index, value)| {
            read(value).ok_or_else(|| SerializeError::IncompatiblePayload {
                reason: format!(
                    "array element {index} is not a valid {}: {}",
                    DType::from(dtype).label(),
                    bounded(value.to_string().as_str(), 48)
                ),
            })
        })
        .collect()
}

fn encode_buffer(buffer: &ArrayBuffer) -> Vec<Value> {
    match buffer {
        ArrayBuffer::I8(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::I16(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::I32(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::I64(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::U8(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::U16(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::U32(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::U64(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::F32(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::F64(values) => values.iter().copied().map(Value::from).collect(),
        ArrayBuffer::Str(values) => values.iter().cloned().map(Value::from).collect(),
    }
}

fn validate_payload_size(input: &str) -> Result<(), SerializeError> {
    let actual = input.len();
    if actual > MAX_CALL_PAYLOAD_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "call payload exceeds max bytes: actual={actual} max={MAX_CALL_PAYLOAD_BYTES}"
            ),
        });
    }
    Ok(())
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}
