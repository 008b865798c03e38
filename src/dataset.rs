// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Labeled multi-dimensional containers.
//!
//! A [`Dataset`] holds named coordinate and data variables which share a set of
//! named dimensions, plus an arbitrarily nested attribute mapping. Array
//! values are held as an [`ArrayData`], a tagged union over the element types
//! that appear in measurement sets.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis};
use thiserror::Error;

use crate::{c32, c64};

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("variable {name} has {ndim} axes, but {num_dims} dimension names were given")]
    /// The number of dimension names does not match the array.
    BadDims {
        /// The variable name
        name: String,
        /// Number of axes of the array
        ndim: usize,
        /// Number of dimension names supplied
        num_dims: usize,
    },

    #[error("dimension {dim} of variable {name} has length {received}, but the dataset already has {dim}={expected}")]
    /// A dimension length disagrees with the existing variables.
    DimensionMismatch {
        /// The variable name
        name: String,
        /// The dimension name
        dim: String,
        /// The existing length
        expected: usize,
        /// The length of the new variable
        received: usize,
    },
}

/// The element type of an [`ArrayData`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Str,
}

impl DType {
    /// The numpy-style name of this type, e.g. `float64`.
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
            DType::Str => "str",
        }
    }
}

/// An n-dimensional array of one of the supported element types.
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayData {
    Bool(ArrayD<bool>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    Complex64(ArrayD<c32>),
    Complex128(ArrayD<c64>),
    Str(ArrayD<String>),
}

/// Apply an expression to the array inside any [`ArrayData`] variant.
macro_rules! map_array {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            ArrayData::Bool($arr) => $body,
            ArrayData::Int32($arr) => $body,
            ArrayData::Int64($arr) => $body,
            ArrayData::Float32($arr) => $body,
            ArrayData::Float64($arr) => $body,
            ArrayData::Complex64($arr) => $body,
            ArrayData::Complex128($arr) => $body,
            ArrayData::Str($arr) => $body,
        }
    };
}

/// Like `map_array`, but re-wrap the result in the same variant.
macro_rules! remap_array {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            ArrayData::Bool($arr) => ArrayData::Bool($body),
            ArrayData::Int32($arr) => ArrayData::Int32($body),
            ArrayData::Int64($arr) => ArrayData::Int64($body),
            ArrayData::Float32($arr) => ArrayData::Float32($body),
            ArrayData::Float64($arr) => ArrayData::Float64($body),
            ArrayData::Complex64($arr) => ArrayData::Complex64($body),
            ArrayData::Complex128($arr) => ArrayData::Complex128($body),
            ArrayData::Str($arr) => ArrayData::Str($body),
        }
    };
}

pub(crate) use remap_array;

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Bool(_) => DType::Bool,
            ArrayData::Int32(_) => DType::Int32,
            ArrayData::Int64(_) => DType::Int64,
            ArrayData::Float32(_) => DType::Float32,
            ArrayData::Float64(_) => DType::Float64,
            ArrayData::Complex64(_) => DType::Complex64,
            ArrayData::Complex128(_) => DType::Complex128,
            ArrayData::Str(_) => DType::Str,
        }
    }

    pub fn shape(&self) -> &[usize] {
        map_array!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        map_array!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the given indices along the first axis.
    ///
    /// Panics if the array is zero-dimensional or an index is out of bounds.
    pub fn select_rows(&self, rows: &[usize]) -> ArrayData {
        remap_array!(self, a => a.select(Axis(0), rows))
    }

    /// Take a single index along the first axis, dropping that axis.
    pub fn index_row(&self, row: usize) -> ArrayData {
        remap_array!(self, a => a.index_axis(Axis(0), row).to_owned())
    }

    /// Values as `f64`, if this is a real numeric array.
    pub fn as_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            ArrayData::Int32(a) => Some(a.iter().map(|&v| v as f64).collect()),
            ArrayData::Int64(a) => Some(a.iter().map(|&v| v as f64).collect()),
            ArrayData::Float32(a) => Some(a.iter().map(|&v| v as f64).collect()),
            ArrayData::Float64(a) => Some(a.iter().copied().collect()),
            _ => None,
        }
    }

    /// Values as `i64`, if this is an integer array.
    pub fn as_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            ArrayData::Int32(a) => Some(a.iter().map(|&v| v as i64).collect()),
            ArrayData::Int64(a) => Some(a.iter().copied().collect()),
            _ => None,
        }
    }

    pub fn as_str_vec(&self) -> Option<Vec<String>> {
        match self {
            ArrayData::Str(a) => Some(a.iter().cloned().collect()),
            _ => None,
        }
    }
}

macro_rules! impl_from_array {
    ($t:ty, $variant:ident) => {
        impl<D: ndarray::Dimension> From<ndarray::Array<$t, D>> for ArrayData {
            fn from(a: ndarray::Array<$t, D>) -> Self {
                ArrayData::$variant(a.into_dyn())
            }
        }
    };
}

impl_from_array!(bool, Bool);
impl_from_array!(i32, Int32);
impl_from_array!(i64, Int64);
impl_from_array!(f32, Float32);
impl_from_array!(f64, Float64);
impl_from_array!(c32, Complex64);
impl_from_array!(c64, Complex128);
impl_from_array!(String, Str);

/// Nested attribute values.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<AttrValue>),
    Array(ArrayData),
    Map(Attrs),
    /// A child dataset. These are persisted as separate stores next to their
    /// parent.
    Dataset(Box<Dataset>),
}

pub type Attrs = BTreeMap<String, AttrValue>;

impl AttrValue {
    pub fn as_map(&self) -> Option<&Attrs> {
        match self {
            AttrValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Non-finite floats read back from a store are the strings `"NaN"`,
    /// `"Infinity"` and `"-Infinity"`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Str(s) => match s.as_str() {
                "NaN" => Some(f64::NAN),
                "Infinity" => Some(f64::INFINITY),
                "-Infinity" => Some(f64::NEG_INFINITY),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl<T: Into<AttrValue>> From<Vec<T>> for AttrValue {
    fn from(v: Vec<T>) -> Self {
        AttrValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<Attrs> for AttrValue {
    fn from(v: Attrs) -> Self {
        AttrValue::Map(v)
    }
}

impl From<ArrayData> for AttrValue {
    fn from(v: ArrayData) -> Self {
        AttrValue::Array(v)
    }
}

impl From<Dataset> for AttrValue {
    fn from(v: Dataset) -> Self {
        AttrValue::Dataset(Box::new(v))
    }
}

/// Build an [`Attrs`] map from `key => value` pairs.
#[macro_export]
macro_rules! attrs {
    () => { $crate::dataset::Attrs::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::dataset::Attrs::new();
        $(map.insert($key.to_string(), $crate::dataset::AttrValue::from($value));)+
        map
    }};
}

/// A named array on named dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub data: ArrayData,
    pub attrs: Attrs,
}

impl Variable {
    pub fn new<S: AsRef<str>>(dims: &[S], data: ArrayData) -> Self {
        Self {
            dims: dims.iter().map(|d| d.as_ref().to_string()).collect(),
            data,
            attrs: Attrs::new(),
        }
    }

    pub fn with_attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

/// A set of variables sharing dimensions, plus nested attributes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    pub coords: BTreeMap<String, Variable>,
    pub data_vars: BTreeMap<String, Variable>,
    pub attrs: Attrs,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dataset with no variables and no attributes.
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty() && self.data_vars.is_empty() && self.attrs.is_empty()
    }

    /// Every dimension and its length.
    pub fn dims(&self) -> BTreeMap<String, usize> {
        let mut dims = BTreeMap::new();
        for var in self.coords.values().chain(self.data_vars.values()) {
            for (dim, &len) in var.dims.iter().zip(var.shape()) {
                dims.insert(dim.clone(), len);
            }
        }
        dims
    }

    fn check(&self, name: &str, var: &Variable) -> Result<(), DatasetError> {
        if var.dims.len() != var.data.ndim() {
            return Err(DatasetError::BadDims {
                name: name.to_string(),
                ndim: var.data.ndim(),
                num_dims: var.dims.len(),
            });
        }
        let dims = self.dims();
        for (dim, &len) in var.dims.iter().zip(var.shape()) {
            match dims.get(dim) {
                Some(&expected) if expected != len => {
                    return Err(DatasetError::DimensionMismatch {
                        name: name.to_string(),
                        dim: dim.clone(),
                        expected,
                        received: len,
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Add (or replace) a coordinate variable.
    pub fn add_coord(&mut self, name: &str, var: Variable) -> Result<(), DatasetError> {
        self.check(name, &var)?;
        self.data_vars.remove(name);
        self.coords.insert(name.to_string(), var);
        Ok(())
    }

    /// Add (or replace) a data variable.
    pub fn add_data_var(&mut self, name: &str, var: Variable) -> Result<(), DatasetError> {
        self.check(name, &var)?;
        self.coords.remove(name);
        self.data_vars.insert(name.to_string(), var);
        Ok(())
    }

    /// Look up a coordinate or data variable.
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.coords.get(name).or_else(|| self.data_vars.get(name))
    }
}
