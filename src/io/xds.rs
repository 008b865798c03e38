// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dataset trees on disk.
//!
//! A dataset's attributes may hold arrays and other datasets, neither of which
//! fit in a store's JSON attributes. Arrays are written as tagged mappings
//!
//! ```json
//! {"__type": "numpy.ndarray", "__dtype": "float64", "__value": [[1.0, 2.0]]}
//! ```
//!
//! and top-level dataset attributes are written as child stores in
//! sub-directories named `_attrs_xds__<key>`. [`read_xds`] reverses both.

use std::path::Path;

use log::debug;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use walkdir::WalkDir;

use super::{
    error::{DecodeError, ZarrError},
    zarr::{self, Encoding, WriteMode},
};
use crate::{
    constants::{CHILD_STORE_PREFIX, CHILD_STORE_SEPARATOR, ENCODED_ARRAY_TYPE},
    dataset::{ArrayData, AttrValue, Attrs, Dataset},
};

const TYPE_KEY: &str = "__type";
const DTYPE_KEY: &str = "__dtype";
const VALUE_KEY: &str = "__value";

fn child_store_name(key: &str) -> String {
    format!("{}{}{}", CHILD_STORE_PREFIX, CHILD_STORE_SEPARATOR, key)
}

/// Is this mapping an encoded array?
fn is_encoded_array(map: &Attrs) -> bool {
    map.get(TYPE_KEY).and_then(AttrValue::as_str) == Some(ENCODED_ARRAY_TYPE)
        && map.contains_key(DTYPE_KEY)
        && map.contains_key(VALUE_KEY)
}

/// The shape of a nested list, following first elements.
fn nested_shape(value: &AttrValue) -> Vec<usize> {
    let mut shape = vec![];
    let mut current = value;
    while let AttrValue::List(list) = current {
        shape.push(list.len());
        match list.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    shape
}

/// Collect the leaves of a nested list in C order. Returns `false` if the list
/// doesn't have the given shape.
fn flatten<'a>(value: &'a AttrValue, shape: &[usize], out: &mut Vec<&'a AttrValue>) -> bool {
    match (shape.split_first(), value) {
        (None, AttrValue::List(_)) => false,
        (None, leaf) => {
            out.push(leaf);
            true
        }
        (Some((&n, rest)), AttrValue::List(list)) if list.len() == n => {
            list.iter().all(|e| flatten(e, rest, out))
        }
        _ => false,
    }
}

fn build<T>(
    key: &str,
    shape: &[usize],
    leaves: &[&AttrValue],
    convert: impl Fn(&AttrValue) -> Option<T>,
) -> Result<ArrayD<T>, DecodeError> {
    let values = leaves
        .iter()
        .map(|leaf| {
            convert(leaf).ok_or_else(|| DecodeError::BadEncodedValue {
                key: key.to_string(),
                reason: format!("holding unexpected element {:?}", leaf),
            })
        })
        .collect::<Result<Vec<T>, _>>()?;
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| DecodeError::BadEncodedValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn as_int(value: &AttrValue) -> Option<i64> {
    match value {
        AttrValue::Int(i) => Some(*i),
        _ => None,
    }
}

/// `null` reads as NaN.
fn as_float(value: &AttrValue) -> Option<f64> {
    match value {
        AttrValue::Null => Some(f64::NAN),
        other => other.as_f64(),
    }
}

/// Decode the `__value` of an encoded array with the given `__dtype`.
pub fn decode_array(key: &str, dtype: &str, value: &AttrValue) -> Result<ArrayData, DecodeError> {
    let shape = nested_shape(value);
    let mut leaves = vec![];
    if !flatten(value, &shape, &mut leaves) {
        return Err(DecodeError::BadEncodedValue {
            key: key.to_string(),
            reason: "ragged".into(),
        });
    }
    let data = match dtype {
        "bool" => ArrayData::Bool(build(key, &shape, &leaves, |v| match v {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        })?),
        "int8" | "int16" | "int32" => ArrayData::Int32(build(key, &shape, &leaves, |v| {
            as_int(v).and_then(|i| i32::try_from(i).ok())
        })?),
        "int64" | "uint8" | "uint16" | "uint32" => {
            ArrayData::Int64(build(key, &shape, &leaves, as_int)?)
        }
        "float32" => ArrayData::Float32(build(key, &shape, &leaves, |v| {
            as_float(v).map(|f| f as f32)
        })?),
        "float64" => ArrayData::Float64(build(key, &shape, &leaves, as_float)?),
        "str" => ArrayData::Str(build(key, &shape, &leaves, |v| {
            v.as_str().map(String::from)
        })?),
        other => {
            return Err(DecodeError::UnsupportedDtype {
                key: key.to_string(),
                dtype: other.to_string(),
            })
        }
    };
    Ok(data)
}

fn decode_value(path: &str, value: AttrValue) -> Result<AttrValue, DecodeError> {
    match value {
        AttrValue::Map(map) if is_encoded_array(&map) => {
            let dtype = map.get(DTYPE_KEY).and_then(AttrValue::as_str).ok_or_else(|| {
                DecodeError::BadEncodedValue {
                    key: path.to_string(),
                    reason: "missing a string dtype".into(),
                }
            })?;
            match map.get(VALUE_KEY) {
                Some(value) => Ok(AttrValue::Array(decode_array(path, dtype, value)?)),
                None => Err(DecodeError::BadEncodedValue {
                    key: path.to_string(),
                    reason: "missing".into(),
                }),
            }
        }
        AttrValue::Map(map) => Ok(AttrValue::Map(decode_attrs(map, path)?)),
        AttrValue::List(list) => Ok(AttrValue::List(
            list.into_iter()
                .map(|v| decode_value(path, v))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other),
    }
}

/// Recursively replace encoded arrays in `attrs` with real arrays. `path` is
/// the slash-joined key path of `attrs`, used in errors.
pub fn decode_attrs(attrs: Attrs, path: &str) -> Result<Attrs, DecodeError> {
    attrs
        .into_iter()
        .map(|(key, value)| {
            let key_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{}/{}", path, key)
            };
            Ok::<_, DecodeError>((key, decode_value(&key_path, value)?))
        })
        .collect()
}

fn nest<T>(array: ArrayViewD<T>, leaf: &impl Fn(&T) -> AttrValue) -> AttrValue {
    if array.ndim() == 0 {
        array.iter().map(leaf).next().unwrap_or(AttrValue::Null)
    } else {
        AttrValue::List(array.outer_iter().map(|sub| nest(sub, leaf)).collect())
    }
}

/// Encode an array as a tagged mapping.
pub fn encode_array(key: &str, data: &ArrayData) -> Result<AttrValue, ZarrError> {
    let value = match data {
        ArrayData::Bool(a) => nest(a.view(), &|&b| AttrValue::Bool(b)),
        ArrayData::Int32(a) => nest(a.view(), &|&i| AttrValue::from(i)),
        ArrayData::Int64(a) => nest(a.view(), &|&i| AttrValue::Int(i)),
        ArrayData::Float32(a) => nest(a.view(), &|&f| AttrValue::Float(f as f64)),
        ArrayData::Float64(a) => nest(a.view(), &|&f| AttrValue::Float(f)),
        ArrayData::Str(a) => nest(a.view(), &|s: &String| AttrValue::Str(s.clone())),
        ArrayData::Complex64(_) | ArrayData::Complex128(_) => {
            return Err(ZarrError::UnencodableAttr {
                key: key.to_string(),
                reason: "complex arrays can't be encoded".into(),
            })
        }
    };
    Ok(AttrValue::Map(crate::attrs! {
        TYPE_KEY => ENCODED_ARRAY_TYPE,
        DTYPE_KEY => data.dtype().name(),
        VALUE_KEY => value,
    }))
}

fn encode_value(key: &str, value: &AttrValue) -> Result<AttrValue, ZarrError> {
    match value {
        AttrValue::Array(data) => encode_array(key, data),
        AttrValue::Map(map) => Ok(AttrValue::Map(
            map.iter()
                .map(|(k, v)| Ok::<_, ZarrError>((k.clone(), encode_value(k, v)?)))
                .collect::<Result<_, ZarrError>>()?,
        )),
        AttrValue::List(list) => Ok(AttrValue::List(
            list.iter()
                .map(|v| encode_value(key, v))
                .collect::<Result<_, _>>()?,
        )),
        AttrValue::Dataset(_) => Err(ZarrError::UnencodableAttr {
            key: key.to_string(),
            reason: "only top-level attributes can hold datasets".into(),
        }),
        other => Ok(other.clone()),
    }
}

/// Split top-level dataset attributes out of `attrs`, and encode the arrays in
/// the rest.
pub fn encode_attrs(attrs: &Attrs) -> Result<(Attrs, Vec<(String, &Dataset)>), ZarrError> {
    let mut encoded = Attrs::new();
    let mut children = vec![];
    for (key, value) in attrs {
        match value {
            AttrValue::Dataset(child) => children.push((key.clone(), child.as_ref())),
            other => {
                encoded.insert(key.clone(), encode_value(key, other)?);
            }
        }
    }
    Ok((encoded, children))
}

/// Write a dataset and, recursively, the datasets in its attributes.
pub fn write_xds(
    dataset: &Dataset,
    path: &Path,
    mode: WriteMode,
    encoding: &Encoding,
) -> Result<(), ZarrError> {
    let (attrs, children) = encode_attrs(&dataset.attrs)?;
    let mut flat = Dataset {
        coords: dataset.coords.clone(),
        data_vars: dataset.data_vars.clone(),
        attrs,
    };
    for var in flat.coords.values_mut().chain(flat.data_vars.values_mut()) {
        let (var_attrs, var_children) = encode_attrs(&var.attrs)?;
        if let Some((key, _)) = var_children.first() {
            return Err(ZarrError::UnencodableAttr {
                key: key.clone(),
                reason: "variable attributes can't hold datasets".into(),
            });
        }
        var.attrs = var_attrs;
    }
    zarr::write_store(&flat, path, mode, encoding)?;

    for (key, child) in children {
        let child_path = path.join(child_store_name(&key));
        debug!("writing child store {}", child_path.display());
        // The parent was just (re)created, so the child can't exist yet.
        write_xds(child, &child_path, WriteMode::CreateNew, encoding)?;
    }
    Ok(())
}

/// Read the store at `path`, decoding encoded arrays in its attributes and
/// attaching its child stores as dataset attributes.
///
/// Only the immediate sub-directories of `path` are considered as child
/// stores; their own children are found by the recursive read. A
/// sub-directory named like a child store that can't be read fails the whole
/// read.
pub fn read_xds(path: &Path) -> Result<Dataset, DecodeError> {
    let mut dataset = zarr::read_store(path)?;
    dataset.attrs = decode_attrs(std::mem::take(&mut dataset.attrs), "")?;
    for (name, var) in dataset
        .coords
        .iter_mut()
        .chain(dataset.data_vars.iter_mut())
    {
        var.attrs = decode_attrs(std::mem::take(&mut var.attrs), name)?;
    }

    let prefix = child_store_name("");
    for entry in WalkDir::new(path)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let key = match entry.file_name().to_str().and_then(|n| n.strip_prefix(&prefix)) {
            Some(key) => key.to_string(),
            None => continue,
        };
        debug!("reading child store {} as {}", entry.path().display(), key);
        let child = read_xds(entry.path()).map_err(|e| DecodeError::BadChildStore {
            path: entry.path().to_path_buf(),
            source: Box::new(e),
        })?;
        dataset.attrs.insert(key, AttrValue::Dataset(Box::new(child)));
    }
    Ok(dataset)
}
