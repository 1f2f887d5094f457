//! Datasets and attributes held in a container.

use std::collections::BTreeMap;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use serde::{Deserialize, Serialize};

use crate::value::{ArrayData, DataType};

/// Prefix marking a string attribute as a reference to a sibling dataset.
pub const REFERENCE_PREFIX: char = '@';

/// A small metadata value attached to a group or dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "json_float")] f64),
    Str(String),
    IntArray(Vec<i64>),
    FloatArray(#[serde(with = "json_float::seq")] Vec<f64>),
    StrArray(Vec<String>),
}

impl AttrValue {
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int_array(&self) -> Option<&[i64]> {
        match self {
            Self::IntArray(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str_array(&self) -> Option<&[String]> {
        match self {
            Self::StrArray(v) => Some(v),
            _ => None,
        }
    }

    /// Number of elements; scalars count as one.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) => 1,
            Self::IntArray(v) => v.len(),
            Self::FloatArray(v) => v.len(),
            Self::StrArray(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Target path if this attribute is an `@`-reference.
    #[must_use]
    pub fn reference(&self) -> Option<&str> {
        self.as_str().and_then(|s| s.strip_prefix(REFERENCE_PREFIX))
    }

    /// Converts an array attribute into a dataset buffer.
    #[must_use]
    pub fn to_array_data(&self) -> Option<ArrayData> {
        match self {
            Self::IntArray(v) => Some(ArrayData::Int(v.clone())),
            Self::FloatArray(v) => Some(ArrayData::Float(v.clone())),
            Self::StrArray(v) => Some(ArrayData::Str(v.clone())),
            _ => None,
        }
    }

    /// Converts a dataset buffer back into an array attribute.
    #[must_use]
    pub fn from_array_data(data: ArrayData) -> Option<Self> {
        match data {
            ArrayData::Int(v) => Some(Self::IntArray(v)),
            ArrayData::Float(v) => Some(Self::FloatArray(v)),
            ArrayData::Str(v) => Some(Self::StrArray(v)),
            ArrayData::Bool(_) | ArrayData::Bytes(_) => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// JSON has no literal for NaN or the infinities; those are written as the
/// strings `"NaN"`, `"inf"` and `"-inf"`. Finite values stay numbers.
mod json_float {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    impl From<f64> for Repr {
        fn from(v: f64) -> Self {
            if v.is_nan() {
                Self::Text("NaN".to_string())
            } else if v.is_infinite() {
                Self::Text(if v > 0.0 { "inf" } else { "-inf" }.to_string())
            } else {
                Self::Number(v)
            }
        }
    }

    impl Repr {
        fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
            match self {
                Self::Number(v) => Ok(v),
                Self::Text(t) => match t.as_str() {
                    "NaN" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(E::custom(format!("invalid float attribute {other:?}"))),
                },
            }
        }
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        Repr::from(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Repr::deserialize(deserializer)?.into_f64()
    }

    pub mod seq {
        use super::{Deserialize, Deserializer, Repr, Serialize, Serializer};

        #[allow(clippy::ptr_arg)]
        pub fn serialize<S: Serializer>(values: &Vec<f64>, serializer: S) -> Result<S::Ok, S::Error> {
            values
                .iter()
                .map(|&v| Repr::from(v))
                .collect::<Vec<_>>()
                .serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            Vec::<Repr>::deserialize(deserializer)?
                .into_iter()
                .map(Repr::into_f64)
                .collect()
        }
    }
}

/// Attributes of one group or dataset, by name.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Everything about a dataset except its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub attrs: Attributes,
}

/// A dataset with its payload loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub data: ArrayData,
    pub shape: Vec<usize>,
    pub attrs: Attributes,
}

impl Dataset {
    /// One-dimensional dataset covering the whole buffer.
    #[must_use]
    pub fn vector(data: ArrayData) -> Self {
        let shape = vec![data.len()];
        Self {
            data,
            shape,
            attrs: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    #[must_use]
    pub fn meta(&self) -> DatasetMeta {
        DatasetMeta {
            dtype: self.data.dtype(),
            shape: self.shape.clone(),
            attrs: self.attrs.clone(),
        }
    }
}

/// Encodes a buffer as little-endian bytes (strings as a JSON array).
pub fn encode_payload(data: &ArrayData) -> IoResult<Vec<u8>> {
    Ok(match data {
        ArrayData::Float(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        ArrayData::Int(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        ArrayData::Bool(v) => v.iter().map(|&b| u8::from(b)).collect(),
        ArrayData::Bytes(v) => v.clone(),
        ArrayData::Str(v) => serde_json::to_vec(v).map_err(|e| {
            IoError::new(ErrorKind::InvalidData, format!("string payload: {e}"))
        })?,
    })
}

/// Inverse of [`encode_payload`].
pub fn decode_payload(dtype: DataType, bytes: &[u8]) -> IoResult<ArrayData> {
    let misaligned = |width: usize| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("{} payload of {} bytes is not a multiple of {width}", dtype.name(), bytes.len()),
        )
    };
    Ok(match dtype {
        DataType::Float => {
            if bytes.len() % 8 != 0 {
                return Err(misaligned(8));
            }
            ArrayData::Float(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().unwrap_or([0; 8])))
                    .collect(),
            )
        }
        DataType::Int => {
            if bytes.len() % 8 != 0 {
                return Err(misaligned(8));
            }
            ArrayData::Int(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().unwrap_or([0; 8])))
                    .collect(),
            )
        }
        DataType::Bool => ArrayData::Bool(bytes.iter().map(|&b| b != 0).collect()),
        DataType::Bytes => ArrayData::Bytes(bytes.to_vec()),
        DataType::Str => ArrayData::Str(serde_json::from_slice(bytes).map_err(|e| {
            IoError::new(ErrorKind::InvalidData, format!("string payload: {e}"))
        })?),
    })
}
