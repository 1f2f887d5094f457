//! Packing of irregular parameter values.
//!
//! All objects of one type store a parameter as a single dataset. When the
//! per-object values are homogeneous (same shape, same element type, none
//! missing) they stack into one rectangular array and no metadata is
//! written. Otherwise the dataset is "special" and carries a
//! [`SpecialMeta`] envelope describing how to split it back up:
//!
//! - missing values are skipped and their positions recorded;
//! - values whose shapes differ are flattened one after another, with the
//!   offset and shape of each recorded (jagged);
//! - per-object mappings are packed as jagged values plus the flattened keys.

use crate::error::IntegrityError;
use crate::storage::{AttrValue, Attributes};
use crate::value::{ArrayData, DataType, NdArray, ParamValue};

const ATTR_SPECIAL: &str = "specialFormatting";
const ATTR_NONE_LOCATIONS: &str = "noneLocations";
const ATTR_JAGGED: &str = "jagged";
const ATTR_OFFSETS: &str = "offsets";
const ATTR_SHAPES: &str = "shapes";
const ATTR_SHAPES_NDIM: &str = "shapesNdim";
const ATTR_DICT: &str = "dict";
const ATTR_DICT_KEYS: &str = "dictKeys";

/// Offsets and shapes of jagged elements within the flat buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JaggedMeta {
    pub offsets: Vec<usize>,
    pub shapes: Vec<Vec<usize>>,
}

/// Side-car metadata of a specially formatted dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecialMeta {
    /// Positions (in object order) whose value is absent. Strictly increasing.
    pub none_locations: Vec<usize>,
    pub jagged: Option<JaggedMeta>,
    /// Keys of packed mappings, parallel to the flat buffer.
    pub dict_keys: Option<Vec<String>>,
}

/// Result of packing one parameter across a set of objects.
#[derive(Debug, Clone, PartialEq)]
pub struct Packed {
    pub data: ArrayData,
    pub shape: Vec<usize>,
    pub meta: Option<SpecialMeta>,
}

/// Packs the values of `param` for a list of objects.
///
/// Returns `Ok(None)` when every value is absent (nothing is written).
///
/// # Errors
/// - [`IntegrityError::JaggedShape`] if values differ in dimensionality
/// - [`IntegrityError::IncompatibleValues`] if strings, booleans and numbers
///   are mixed, or mappings appear next to non-mappings
///
/// # Examples
///
/// ```
/// use reactordb::special::{pack, unpack};
/// use reactordb::ParamValue;
///
/// let values = vec![Some(ParamValue::Float(1.0)), None, Some(ParamValue::Float(3.0))];
/// let packed = pack("power", &values).unwrap().unwrap();
/// assert_eq!(packed.meta.as_ref().unwrap().none_locations, vec![1]);
///
/// let back = unpack("power", packed.data, &packed.shape, packed.meta.as_ref(), 3).unwrap();
/// assert_eq!(back, values);
/// ```
pub fn pack(param: &str, values: &[Option<ParamValue>]) -> Result<Option<Packed>, IntegrityError> {
    let present: Vec<&ParamValue> = values.iter().flatten().collect();
    let Some(first) = present.first() else {
        return Ok(None);
    };

    let none_locations: Vec<usize> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.is_none().then_some(i))
        .collect();

    let dtype = common_dtype(param, &present)?;

    let mappings = present.iter().filter(|v| v.is_mapping()).count();
    if mappings > 0 && mappings < present.len() {
        return Err(IntegrityError::IncompatibleValues {
            param: param.to_string(),
            reason: "mappings mixed with non-mapping values".to_string(),
        });
    }

    let first_ndim = first.shape().len();
    if let Some(other) = present.iter().map(|v| v.shape().len()).find(|&n| n != first_ndim) {
        return Err(IntegrityError::JaggedShape {
            param: param.to_string(),
            first: first_ndim,
            other,
        });
    }

    let mut data = ArrayData::empty(dtype);
    for value in &present {
        let flat = value.flatten();
        let flat = if dtype == DataType::Float {
            flat.promote_to_float()
        } else {
            flat
        };
        if !data.extend_from(&flat) {
            return Err(IntegrityError::IncompatibleValues {
                param: param.to_string(),
                reason: format!("cannot combine {} with {}", dtype.name(), flat.dtype().name()),
            });
        }
    }

    if mappings > 0 {
        let mut keys = Vec::with_capacity(data.len());
        let mut offsets = Vec::with_capacity(present.len());
        let mut shapes = Vec::with_capacity(present.len());
        for value in &present {
            if let ParamValue::Mapping(m) = value {
                offsets.push(keys.len());
                shapes.push(vec![m.len()]);
                keys.extend(m.keys().cloned());
            }
        }
        return Ok(Some(Packed {
            shape: vec![data.len()],
            data,
            meta: Some(SpecialMeta {
                none_locations,
                jagged: Some(JaggedMeta { offsets, shapes }),
                dict_keys: Some(keys),
            }),
        }));
    }

    let first_shape = first.shape();
    if present.iter().all(|v| v.shape() == first_shape) {
        let mut shape = Vec::with_capacity(first_shape.len() + 1);
        shape.push(present.len());
        shape.extend_from_slice(&first_shape);
        let meta = (!none_locations.is_empty()).then(|| SpecialMeta {
            none_locations,
            jagged: None,
            dict_keys: None,
        });
        return Ok(Some(Packed { data, shape, meta }));
    }

    let mut offsets = Vec::with_capacity(present.len());
    let mut shapes = Vec::with_capacity(present.len());
    let mut cursor = 0;
    for value in &present {
        let shape = value.shape();
        offsets.push(cursor);
        cursor += shape.iter().product::<usize>();
        shapes.push(shape);
    }
    Ok(Some(Packed {
        shape: vec![data.len()],
        data,
        meta: Some(SpecialMeta {
            none_locations,
            jagged: Some(JaggedMeta { offsets, shapes }),
            dict_keys: None,
        }),
    }))
}

fn common_dtype(param: &str, present: &[&ParamValue]) -> Result<DataType, IntegrityError> {
    let mut dtype: Option<DataType> = None;
    for value in present {
        let next = value.dtype();
        dtype = Some(match (dtype, next) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(DataType::Int | DataType::Float), DataType::Int | DataType::Float) => {
                DataType::Float
            }
            (Some(a), b) => {
                return Err(IntegrityError::IncompatibleValues {
                    param: param.to_string(),
                    reason: format!("{} values mixed with {} values", a.name(), b.name()),
                })
            }
        });
    }
    Ok(dtype.unwrap_or(DataType::Float))
}

/// Reverses [`pack`], producing exactly `len` values in object order.
///
/// # Errors
/// Returns [`IntegrityError::Corrupted`] (naming `param`) when the buffer,
/// shape and metadata disagree.
pub fn unpack(
    param: &str,
    data: ArrayData,
    shape: &[usize],
    meta: Option<&SpecialMeta>,
    len: usize,
) -> Result<Vec<Option<ParamValue>>, IntegrityError> {
    let corrupted = |reason: String| IntegrityError::corrupted(param, reason);

    let none_locations = meta.map_or(&[][..], |m| m.none_locations.as_slice());
    if none_locations.windows(2).any(|w| w[0] >= w[1]) {
        return Err(corrupted("none locations are not strictly increasing".to_string()));
    }
    if none_locations.last().is_some_and(|&last| last >= len) {
        return Err(corrupted(format!("none location beyond {len} objects")));
    }
    let present = len - none_locations.len();

    let values = match meta.and_then(|m| m.jagged.as_ref()) {
        Some(jagged) => {
            let keys = meta.and_then(|m| m.dict_keys.as_deref());
            unpack_jagged(param, &data, jagged, keys, present)?
        }
        None => unpack_stacked(param, &data, shape, present)?,
    };

    let mut values = values.into_iter();
    let mut nones = none_locations.iter().peekable();
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        if nones.peek() == Some(&&i) {
            nones.next();
            out.push(None);
        } else {
            out.push(values.next());
        }
    }
    Ok(out)
}

fn unpack_stacked(
    param: &str,
    data: &ArrayData,
    shape: &[usize],
    present: usize,
) -> Result<Vec<ParamValue>, IntegrityError> {
    let Some((&rows, element_shape)) = shape.split_first() else {
        return Err(IntegrityError::corrupted(param, "dataset has no dimensions"));
    };
    if rows != present {
        return Err(IntegrityError::corrupted(
            param,
            format!("dataset holds {rows} values, expected {present}"),
        ));
    }
    let size: usize = element_shape.iter().product();
    if size * rows != data.len() {
        return Err(IntegrityError::corrupted(
            param,
            format!("shape {shape:?} does not cover {} elements", data.len()),
        ));
    }
    (0..rows)
        .map(|i| element(param, data, element_shape, i * size, size))
        .collect()
}

fn unpack_jagged(
    param: &str,
    data: &ArrayData,
    jagged: &JaggedMeta,
    dict_keys: Option<&[String]>,
    present: usize,
) -> Result<Vec<ParamValue>, IntegrityError> {
    if jagged.offsets.len() != present || jagged.shapes.len() != present {
        return Err(IntegrityError::corrupted(
            param,
            format!(
                "jagged metadata describes {} offsets and {} shapes, expected {present}",
                jagged.offsets.len(),
                jagged.shapes.len()
            ),
        ));
    }
    if let Some(keys) = dict_keys {
        if keys.len() != data.len() {
            return Err(IntegrityError::corrupted(
                param,
                format!("{} mapping keys for {} values", keys.len(), data.len()),
            ));
        }
    }

    jagged
        .offsets
        .iter()
        .zip(&jagged.shapes)
        .map(|(&offset, shape)| {
            let size = shape
                .iter()
                .try_fold(1_usize, |acc, &dim| acc.checked_mul(dim))
                .ok_or_else(|| IntegrityError::corrupted(param, format!("element shape {shape:?} overflows")))?;
            if offset.checked_add(size).filter(|&end| end <= data.len()).is_none() {
                return Err(IntegrityError::corrupted(
                    param,
                    format!("element at offset {offset} of size {size} overruns buffer"),
                ));
            }
            match dict_keys {
                Some(keys) => {
                    let values = data.slice(offset..offset + size).to_f64().ok_or_else(|| {
                        IntegrityError::corrupted(param, "mapping values are not numeric")
                    })?;
                    Ok(ParamValue::Mapping(
                        keys[offset..offset + size].iter().cloned().zip(values).collect(),
                    ))
                }
                None => element(param, data, shape, offset, size),
            }
        })
        .collect()
}

fn element(
    param: &str,
    data: &ArrayData,
    shape: &[usize],
    offset: usize,
    size: usize,
) -> Result<ParamValue, IntegrityError> {
    if shape.is_empty() {
        return data
            .scalar_at(offset)
            .ok_or_else(|| IntegrityError::corrupted(param, format!("no element at {offset}")));
    }
    Ok(ParamValue::Array(NdArray::from_parts_unchecked(
        shape.to_vec(),
        data.slice(offset..offset + size),
    )))
}

#[allow(clippy::cast_possible_wrap)]
fn to_ints(values: &[usize]) -> Vec<i64> {
    values.iter().map(|&v| v as i64).collect()
}

fn to_usizes(param: &str, attr: &str, values: &[i64]) -> Result<Vec<usize>, IntegrityError> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v).map_err(|_| {
                IntegrityError::corrupted(param, format!("attribute '{attr}' holds negative value {v}"))
            })
        })
        .collect()
}

impl SpecialMeta {
    /// Attribute names this envelope may occupy.
    pub const ATTRIBUTE_NAMES: [&'static str; 8] = [
        ATTR_SPECIAL,
        ATTR_NONE_LOCATIONS,
        ATTR_JAGGED,
        ATTR_OFFSETS,
        ATTR_SHAPES,
        ATTR_SHAPES_NDIM,
        ATTR_DICT,
        ATTR_DICT_KEYS,
    ];

    /// Renders the envelope as dataset attributes.
    #[must_use]
    pub fn to_attrs(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert(ATTR_SPECIAL.to_string(), AttrValue::Bool(true));
        attrs.insert(
            ATTR_NONE_LOCATIONS.to_string(),
            AttrValue::IntArray(to_ints(&self.none_locations)),
        );
        attrs.insert(ATTR_JAGGED.to_string(), AttrValue::Bool(self.jagged.is_some()));
        if let Some(jagged) = &self.jagged {
            let ndim = jagged.shapes.first().map_or(0, Vec::len);
            let flat: Vec<usize> = jagged.shapes.iter().flatten().copied().collect();
            attrs.insert(ATTR_OFFSETS.to_string(), AttrValue::IntArray(to_ints(&jagged.offsets)));
            attrs.insert(ATTR_SHAPES.to_string(), AttrValue::IntArray(to_ints(&flat)));
            attrs.insert(ATTR_SHAPES_NDIM.to_string(), AttrValue::Int(i64::try_from(ndim).unwrap_or(i64::MAX)));
        }
        attrs.insert(ATTR_DICT.to_string(), AttrValue::Bool(self.dict_keys.is_some()));
        if let Some(keys) = &self.dict_keys {
            attrs.insert(ATTR_DICT_KEYS.to_string(), AttrValue::StrArray(keys.clone()));
        }
        attrs
    }

    /// Reads the envelope back from (reference-resolved) attributes.
    ///
    /// Returns `Ok(None)` for a plain dataset.
    ///
    /// # Errors
    /// Returns [`IntegrityError::Corrupted`] if required attributes are
    /// missing or mistyped.
    pub fn from_attrs(param: &str, attrs: &Attributes) -> Result<Option<Self>, IntegrityError> {
        if attrs.get(ATTR_SPECIAL).and_then(AttrValue::as_bool) != Some(true) {
            return Ok(None);
        }

        let ints = |name: &str| -> Result<Vec<usize>, IntegrityError> {
            let raw = attrs
                .get(name)
                .and_then(AttrValue::as_int_array)
                .ok_or_else(|| {
                    IntegrityError::corrupted(param, format!("missing integer array attribute '{name}'"))
                })?;
            to_usizes(param, name, raw)
        };
        let flag = |name: &str| attrs.get(name).and_then(AttrValue::as_bool).unwrap_or(false);

        let none_locations = ints(ATTR_NONE_LOCATIONS)?;

        let jagged = if flag(ATTR_JAGGED) {
            let offsets = ints(ATTR_OFFSETS)?;
            let flat = ints(ATTR_SHAPES)?;
            let ndim = attrs
                .get(ATTR_SHAPES_NDIM)
                .and_then(AttrValue::as_int)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| IntegrityError::corrupted(param, "missing jagged shape rank"))?;
            let shapes = if ndim == 0 {
                vec![Vec::new(); offsets.len()]
            } else {
                if flat.len() % ndim != 0 {
                    return Err(IntegrityError::corrupted(
                        param,
                        format!("{} shape entries are not a multiple of rank {ndim}", flat.len()),
                    ));
                }
                flat.chunks(ndim).map(<[usize]>::to_vec).collect()
            };
            Some(JaggedMeta { offsets, shapes })
        } else {
            None
        };

        let dict_keys = if flag(ATTR_DICT) {
            let keys = attrs
                .get(ATTR_DICT_KEYS)
                .and_then(AttrValue::as_str_array)
                .ok_or_else(|| IntegrityError::corrupted(param, "missing mapping keys"))?;
            Some(keys.to_vec())
        } else {
            None
        };

        Ok(Some(Self {
            none_locations,
            jagged,
            dict_keys,
        }))
    }
}
