//! Parameter values stored on composite objects.
//!
//! A parameter holds one of a small set of shapes: a scalar, a rectangular
//! n-dimensional array, or a per-object mapping of names to numbers. The
//! special-data codec dispatches on these tags; nothing inspects runtime
//! types.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, DbResult};

/// Element type of a flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float,
    Int,
    Bool,
    Str,
    Bytes,
}

impl DataType {
    /// Returns a human-readable type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Str => "str",
            Self::Bytes => "bytes",
        }
    }

    /// Returns true for types that take part in relative numeric diffs.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Str)
    }
}

/// A flat, homogeneously typed buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ArrayData {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
    /// Opaque bytes (input blobs); never produced by parameter packing.
    Bytes(Vec<u8>),
}

impl ArrayData {
    /// Creates an empty buffer of the given type.
    #[must_use]
    pub const fn empty(dtype: DataType) -> Self {
        match dtype {
            DataType::Float => Self::Float(Vec::new()),
            DataType::Int => Self::Int(Vec::new()),
            DataType::Bool => Self::Bool(Vec::new()),
            DataType::Str => Self::Str(Vec::new()),
            DataType::Bytes => Self::Bytes(Vec::new()),
        }
    }

    #[must_use]
    pub const fn dtype(&self) -> DataType {
        match self {
            Self::Float(_) => DataType::Float,
            Self::Int(_) => DataType::Int,
            Self::Bool(_) => DataType::Bool,
            Self::Str(_) => DataType::Str,
            Self::Bytes(_) => DataType::Bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Str(v) => v.len(),
            Self::Bytes(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies a sub-range into a new buffer of the same type.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds; callers validate offsets first.
    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Self {
        match self {
            Self::Float(v) => Self::Float(v[range].to_vec()),
            Self::Int(v) => Self::Int(v[range].to_vec()),
            Self::Bool(v) => Self::Bool(v[range].to_vec()),
            Self::Str(v) => Self::Str(v[range].to_vec()),
            Self::Bytes(v) => Self::Bytes(v[range].to_vec()),
        }
    }

    /// Appends `other`, which must have the same element type.
    ///
    /// Returns false (and appends nothing) on a type mismatch.
    pub fn extend_from(&mut self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.extend_from_slice(b),
            (Self::Int(a), Self::Int(b)) => a.extend_from_slice(b),
            (Self::Bool(a), Self::Bool(b)) => a.extend_from_slice(b),
            (Self::Str(a), Self::Str(b)) => a.extend_from_slice(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.extend_from_slice(b),
            _ => return false,
        }
        true
    }

    /// Converts integer buffers to float buffers; other types are unchanged.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn promote_to_float(self) -> Self {
        match self {
            Self::Int(v) => Self::Float(v.into_iter().map(|x| x as f64).collect()),
            other => other,
        }
    }

    /// Numeric view of the buffer; booleans map to 0/1, strings have none.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            Self::Float(v) => Some(v.clone()),
            Self::Int(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Self::Bool(v) => Some(v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect()),
            Self::Bytes(v) => Some(v.iter().map(|&b| f64::from(b)).collect()),
            Self::Str(_) => None,
        }
    }

    /// Returns element `i` as a scalar parameter value.
    #[must_use]
    pub fn scalar_at(&self, i: usize) -> Option<ParamValue> {
        match self {
            Self::Float(v) => v.get(i).copied().map(ParamValue::Float),
            Self::Int(v) => v.get(i).copied().map(ParamValue::Int),
            Self::Bool(v) => v.get(i).copied().map(ParamValue::Bool),
            Self::Str(v) => v.get(i).cloned().map(ParamValue::Str),
            Self::Bytes(v) => v.get(i).map(|&b| ParamValue::Int(i64::from(b))),
        }
    }
}

/// A rectangular n-dimensional array stored in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    shape: Vec<usize>,
    data: ArrayData,
}

impl NdArray {
    /// Creates an array, validating that `shape` covers `data` exactly.
    ///
    /// # Errors
    ///
    /// Returns an invalid-argument error if the element count of `shape`
    /// differs from the buffer length, or if `shape` is empty (use a scalar
    /// [`ParamValue`] instead).
    pub fn new(shape: Vec<usize>, data: ArrayData) -> DbResult<Self> {
        if shape.is_empty() {
            return Err(DatabaseError::invalid_argument(
                "array shape must have at least one dimension",
            ));
        }
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(DatabaseError::invalid_argument(format!(
                "shape {shape:?} needs {expected} elements, buffer has {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional float array.
    #[must_use]
    pub fn from_floats(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::Float(values),
        }
    }

    /// One-dimensional integer array.
    #[must_use]
    pub fn from_ints(values: Vec<i64>) -> Self {
        Self {
            shape: vec![values.len()],
            data: ArrayData::Int(values),
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub const fn data(&self) -> &ArrayData {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> ArrayData {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn from_parts_unchecked(shape: Vec<usize>, data: ArrayData) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }
}

/// The value of one parameter on one composite object.
///
/// # Examples
///
/// ```
/// use reactordb::{NdArray, ParamValue};
///
/// let power = ParamValue::Float(1.5e6);
/// let pins = ParamValue::Array(NdArray::from_floats(vec![1.0, 2.0, 3.0]));
///
/// assert!(power.shape().is_empty());
/// assert_eq!(pins.shape(), vec![3]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    Array(NdArray),
    Mapping(BTreeMap<String, f64>),
}

impl ParamValue {
    /// Shape of the value: empty for scalars, `[len]` for mappings.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Float(_) | Self::Int(_) | Self::Bool(_) | Self::Str(_) => Vec::new(),
            Self::Array(a) => a.shape().to_vec(),
            Self::Mapping(m) => vec![m.len()],
        }
    }

    /// Element type of the value's flattened payload.
    #[must_use]
    pub const fn dtype(&self) -> DataType {
        match self {
            Self::Float(_) | Self::Mapping(_) => DataType::Float,
            Self::Int(_) => DataType::Int,
            Self::Bool(_) => DataType::Bool,
            Self::Str(_) => DataType::Str,
            Self::Array(a) => a.data().dtype(),
        }
    }

    /// Flattened payload of the value.
    #[must_use]
    pub fn flatten(&self) -> ArrayData {
        match self {
            Self::Float(v) => ArrayData::Float(vec![*v]),
            Self::Int(v) => ArrayData::Int(vec![*v]),
            Self::Bool(v) => ArrayData::Bool(vec![*v]),
            Self::Str(v) => ArrayData::Str(vec![v.clone()]),
            Self::Array(a) => a.data().clone(),
            Self::Mapping(m) => ArrayData::Float(m.values().copied().collect()),
        }
    }

    #[must_use]
    pub const fn is_mapping(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_array(&self) -> Option<&NdArray> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_mapping(&self) -> Option<&BTreeMap<String, f64>> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Str(_) => "str",
            Self::Array(_) => "array",
            Self::Mapping(_) => "mapping",
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Array(NdArray::from_floats(v))
    }
}

impl From<NdArray> for ParamValue {
    fn from(v: NdArray) -> Self {
        Self::Array(v)
    }
}

impl From<BTreeMap<String, f64>> for ParamValue {
    fn from(v: BTreeMap<String, f64>) -> Self {
        Self::Mapping(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndarray_validates_shape() {
        assert!(NdArray::new(vec![2, 3], ArrayData::Float(vec![0.0; 6])).is_ok());
        assert!(NdArray::new(vec![2, 3], ArrayData::Float(vec![0.0; 5])).is_err());
        assert!(NdArray::new(vec![], ArrayData::Float(vec![1.0])).is_err());
    }

    #[test]
    fn test_param_shapes() {
        assert!(ParamValue::Int(3).shape().is_empty());
        let arr = NdArray::new(vec![2, 2], ArrayData::Int(vec![1, 2, 3, 4])).unwrap();
        assert_eq!(ParamValue::Array(arr).shape(), vec![2, 2]);

        let mut m = BTreeMap::new();
        m.insert("U235".to_string(), 0.05);
        m.insert("U238".to_string(), 0.95);
        assert_eq!(ParamValue::Mapping(m).shape(), vec![2]);
    }

    #[test]
    fn test_flatten_mapping_in_key_order() {
        let mut m = BTreeMap::new();
        m.insert("b".to_string(), 2.0);
        m.insert("a".to_string(), 1.0);
        assert_eq!(ParamValue::Mapping(m).flatten(), ArrayData::Float(vec![1.0, 2.0]));
    }

    #[test]
    fn test_array_data_extend_type_checked() {
        let mut a = ArrayData::Float(vec![1.0]);
        assert!(a.extend_from(&ArrayData::Float(vec![2.0])));
        assert!(!a.extend_from(&ArrayData::Int(vec![3])));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_promote_and_numeric_view() {
        let ints = ArrayData::Int(vec![1, 2]).promote_to_float();
        assert_eq!(ints, ArrayData::Float(vec![1.0, 2.0]));
        assert_eq!(ArrayData::Bool(vec![true, false]).to_f64(), Some(vec![1.0, 0.0]));
        assert!(ArrayData::Str(vec!["x".into()]).to_f64().is_none());
    }

    #[test]
    fn test_from_conversions() {
        assert_eq!(ParamValue::from(2.5), ParamValue::Float(2.5));
        assert_eq!(ParamValue::from(7_i32), ParamValue::Int(7));
        assert_eq!(ParamValue::from("fuel"), ParamValue::Str("fuel".into()));
        assert_eq!(ParamValue::from(vec![1.0, 2.0]).shape(), vec![2]);
    }
}
