// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read and write [`Dataset`]s as Zarr (v2) directory stores, with xarray's
//! conventions for dimension names and coordinates.
//!
//! A store is a group directory (`.zgroup`, `.zattrs`) with one array
//! directory per variable. Each array directory has a `.zarray` describing the
//! shape, chunking, dtype and compressor, a `.zattrs` holding the variable
//! attributes plus `_ARRAY_DIMENSIONS`, and one file per chunk named after the
//! chunk's grid position (`0.1.0`). Edge chunks are padded with the fill value.
//!
//! Attributes are plain JSON here. Arrays and datasets inside attributes must
//! be encoded by the caller (see [`crate::io::xds`]).

use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use itertools::Itertools;
use log::{debug, trace};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::error::ZarrError;
use crate::{
    c32, c64,
    config::ChunkSpec,
    dataset::{ArrayData, AttrValue, Attrs, DType, Dataset, Variable},
};

const ZARR_FORMAT: u8 = 2;
const DIMENSIONS_KEY: &str = "_ARRAY_DIMENSIONS";
const COORDINATES_KEY: &str = "coordinates";

/// How chunks are compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Compressor {
    None,
    Zlib { level: u32 },
}

impl Default for Compressor {
    fn default() -> Self {
        Compressor::Zlib { level: 2 }
    }
}

impl Compressor {
    fn to_meta(self) -> Value {
        match self {
            Compressor::None => Value::Null,
            Compressor::Zlib { level } => serde_json::json!({"id": "zlib", "level": level}),
        }
    }

    fn from_meta(meta: &Value) -> Result<Self, ZarrError> {
        match meta {
            Value::Null => Ok(Compressor::None),
            Value::Object(o) if o.get("id").and_then(Value::as_str) == Some("zlib") => {
                Ok(Compressor::Zlib {
                    level: o.get("level").and_then(Value::as_u64).unwrap_or(1) as u32,
                })
            }
            other => Err(ZarrError::UnsupportedCompressor(other.to_string())),
        }
    }

    fn compress(self, bytes: Vec<u8>) -> Result<Vec<u8>, ZarrError> {
        match self {
            Compressor::None => Ok(bytes),
            Compressor::Zlib { level } => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
                encoder.write_all(&bytes)?;
                Ok(encoder.finish()?)
            }
        }
    }

    fn decompress(self, bytes: Vec<u8>) -> Result<Vec<u8>, ZarrError> {
        match self {
            Compressor::None => Ok(bytes),
            Compressor::Zlib { .. } => {
                let mut out = vec![];
                ZlibDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

/// What to do if the store already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with [`ZarrError::AlreadyExists`].
    CreateNew,
    /// Remove the existing store first.
    Overwrite,
}

/// Per-variable storage settings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Encoding {
    pub chunks: ChunkSpec,
    pub compressor: Compressor,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArrayMeta {
    zarr_format: u8,
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: String,
    compressor: Value,
    fill_value: Value,
    order: String,
    filters: Option<Vec<Value>>,
    #[serde(default)]
    dimension_separator: Option<String>,
}

/// The zarr dtype string and item size of an array.
fn zarr_dtype(data: &ArrayData) -> (String, usize) {
    match data {
        ArrayData::Bool(_) => ("|b1".into(), 1),
        ArrayData::Int32(_) => ("<i4".into(), 4),
        ArrayData::Int64(_) => ("<i8".into(), 8),
        ArrayData::Float32(_) => ("<f4".into(), 4),
        ArrayData::Float64(_) => ("<f8".into(), 8),
        ArrayData::Complex64(_) => ("<c8".into(), 8),
        ArrayData::Complex128(_) => ("<c16".into(), 16),
        ArrayData::Str(a) => {
            let n = a.iter().map(|s| s.chars().count()).max().unwrap_or(1).max(1);
            (format!("<U{}", n), 4 * n)
        }
    }
}

fn parse_dtype(dtype: &str) -> Result<(DType, usize), ZarrError> {
    let parsed = match dtype {
        "|b1" => (DType::Bool, 1),
        "<i4" => (DType::Int32, 4),
        "<i8" => (DType::Int64, 8),
        "<f4" => (DType::Float32, 4),
        "<f8" => (DType::Float64, 8),
        "<c8" => (DType::Complex64, 8),
        "<c16" => (DType::Complex128, 16),
        _ => match dtype.strip_prefix("<U").and_then(|n| n.parse::<usize>().ok()) {
            Some(n) if n > 0 => (DType::Str, 4 * n),
            _ => return Err(ZarrError::UnsupportedDtype(dtype.to_string())),
        },
    };
    Ok(parsed)
}

fn fill_value(dtype: DType) -> Value {
    match dtype {
        DType::Bool => Value::Bool(false),
        DType::Int32 | DType::Int64 => Value::from(0),
        DType::Float32 | DType::Float64 => f64_to_json(f64::NAN),
        DType::Complex64 | DType::Complex128 => serde_json::json!(["NaN", "NaN"]),
        DType::Str => Value::from(""),
    }
}

/// JSON has no NaN or infinity, so these are written as the strings zarr uses
/// for fill values.
fn f64_to_json(f: f64) -> Value {
    match Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None if f.is_nan() => Value::from("NaN"),
        None if f > 0.0 => Value::from("Infinity"),
        None => Value::from("-Infinity"),
    }
}

fn json_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s == "Infinity" => f64::INFINITY,
        Value::String(s) if s == "-Infinity" => f64::NEG_INFINITY,
        _ => f64::NAN,
    }
}

/// The bytes of one element holding the fill value.
fn fill_bytes(dtype: DType, item_size: usize, fill: &Value) -> Vec<u8> {
    let pair = |v: &Value| match v {
        Value::Array(a) if a.len() == 2 => (json_f64(&a[0]), json_f64(&a[1])),
        other => (json_f64(other), 0.0),
    };
    match dtype {
        DType::Bool => vec![fill.as_bool().unwrap_or(false) as u8],
        DType::Int32 => (fill.as_i64().unwrap_or(0) as i32).to_le_bytes().to_vec(),
        DType::Int64 => fill.as_i64().unwrap_or(0).to_le_bytes().to_vec(),
        DType::Float32 => (json_f64(fill) as f32).to_le_bytes().to_vec(),
        DType::Float64 => json_f64(fill).to_le_bytes().to_vec(),
        DType::Complex64 => {
            let (re, im) = pair(fill);
            [(re as f32).to_le_bytes(), (im as f32).to_le_bytes()].concat()
        }
        DType::Complex128 => {
            let (re, im) = pair(fill);
            [re.to_le_bytes(), im.to_le_bytes()].concat()
        }
        DType::Str => vec![0; item_size],
    }
}

/// The elements of `data` in C order, as little-endian bytes.
fn to_bytes(data: &ArrayData, item_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * item_size);
    match data {
        ArrayData::Bool(a) => out.extend(a.iter().map(|&b| b as u8)),
        ArrayData::Int32(a) => a.iter().for_each(|v| out.extend(v.to_le_bytes())),
        ArrayData::Int64(a) => a.iter().for_each(|v| out.extend(v.to_le_bytes())),
        ArrayData::Float32(a) => a.iter().for_each(|v| out.extend(v.to_le_bytes())),
        ArrayData::Float64(a) => a.iter().for_each(|v| out.extend(v.to_le_bytes())),
        ArrayData::Complex64(a) => a.iter().for_each(|v| {
            out.extend(v.re.to_le_bytes());
            out.extend(v.im.to_le_bytes());
        }),
        ArrayData::Complex128(a) => a.iter().for_each(|v| {
            out.extend(v.re.to_le_bytes());
            out.extend(v.im.to_le_bytes());
        }),
        ArrayData::Str(a) => a.iter().for_each(|s| {
            let mut n = 0;
            for c in s.chars().take(item_size / 4) {
                out.extend((c as u32).to_le_bytes());
                n += 4;
            }
            out.resize(out.len() + item_size - n, 0);
        }),
    }
    out
}

fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn from_bytes(
    dtype: DType,
    item_size: usize,
    shape: &[usize],
    bytes: &[u8],
) -> Result<ArrayData, ZarrError> {
    let items = bytes.chunks_exact(item_size);
    let shape = IxDyn(shape);
    let bad_shape = |e: ndarray::ShapeError| ZarrError::BadMetadata {
        path: PathBuf::new(),
        message: e.to_string(),
    };
    let data = match dtype {
        DType::Bool => ArrayData::Bool(
            ArrayD::from_shape_vec(shape, items.map(|b| b[0] != 0).collect()).map_err(bad_shape)?,
        ),
        DType::Int32 => ArrayData::Int32(
            ArrayD::from_shape_vec(shape, items.map(|b| i32::from_le_bytes(le(b))).collect())
                .map_err(bad_shape)?,
        ),
        DType::Int64 => ArrayData::Int64(
            ArrayD::from_shape_vec(shape, items.map(|b| i64::from_le_bytes(le(b))).collect())
                .map_err(bad_shape)?,
        ),
        DType::Float32 => ArrayData::Float32(
            ArrayD::from_shape_vec(shape, items.map(|b| f32::from_le_bytes(le(b))).collect())
                .map_err(bad_shape)?,
        ),
        DType::Float64 => ArrayData::Float64(
            ArrayD::from_shape_vec(shape, items.map(|b| f64::from_le_bytes(le(b))).collect())
                .map_err(bad_shape)?,
        ),
        DType::Complex64 => ArrayData::Complex64(
            ArrayD::from_shape_vec(
                shape,
                items
                    .map(|b| c32::new(f32::from_le_bytes(le(b)), f32::from_le_bytes(le(&b[4..]))))
                    .collect(),
            )
            .map_err(bad_shape)?,
        ),
        DType::Complex128 => ArrayData::Complex128(
            ArrayD::from_shape_vec(
                shape,
                items
                    .map(|b| c64::new(f64::from_le_bytes(le(b)), f64::from_le_bytes(le(&b[8..]))))
                    .collect(),
            )
            .map_err(bad_shape)?,
        ),
        DType::Str => ArrayData::Str(
            ArrayD::from_shape_vec(
                shape,
                items
                    .map(|b| {
                        b.chunks_exact(4)
                            .map(|c| u32::from_le_bytes(le(c)))
                            .take_while(|&u| u != 0)
                            .map(|u| char::from_u32(u).unwrap_or(char::REPLACEMENT_CHARACTER))
                            .collect()
                    })
                    .collect(),
            )
            .map_err(bad_shape)?,
        ),
    };
    Ok(data)
}

fn c_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Every chunk position of an array, in C order.
fn chunk_grid(shape: &[usize], chunks: &[usize]) -> Vec<Vec<usize>> {
    match shape.len() {
        0 => vec![vec![]],
        1 => (0..(shape[0] + chunks[0] - 1) / chunks[0]).map(|i| vec![i]).collect(),
        _ => shape
            .iter()
            .zip(chunks)
            .map(|(&s, &c)| 0..(s + c - 1) / c)
            .multi_cartesian_product()
            .collect(),
    }
}

fn chunk_key(grid: &[usize]) -> String {
    if grid.is_empty() {
        "0".to_string()
    } else {
        grid.iter().join(".")
    }
}

/// The contiguous runs shared by an array and one of its chunks, as
/// `(array offset, chunk offset, length)` in elements.
fn chunk_runs(shape: &[usize], chunks: &[usize], grid: &[usize]) -> Vec<(usize, usize, usize)> {
    let ndim = shape.len();
    if ndim == 0 {
        return vec![(0, 0, 1)];
    }
    let start: Vec<usize> = grid.iter().zip(chunks).map(|(g, c)| g * c).collect();
    let extent: Vec<usize> = (0..ndim)
        .map(|i| chunks[i].min(shape[i] - start[i]))
        .collect();
    let array_strides = c_strides(shape);
    let chunk_strides = c_strides(chunks);
    let run = extent[ndim - 1];
    if ndim == 1 {
        return vec![(start[0], 0, run)];
    }
    extent[..ndim - 1]
        .iter()
        .map(|&e| 0..e)
        .multi_cartesian_product()
        .map(|outer| {
            let mut array_offset = start[ndim - 1];
            let mut chunk_offset = 0;
            for (i, o) in outer.into_iter().enumerate() {
                array_offset += (start[i] + o) * array_strides[i];
                chunk_offset += o * chunk_strides[i];
            }
            (array_offset, chunk_offset, run)
        })
        .collect()
}

fn attr_to_json(key: &str, value: &AttrValue) -> Result<Value, ZarrError> {
    let json = match value {
        AttrValue::Null => Value::Null,
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Int(i) => Value::from(*i),
        AttrValue::Float(f) => f64_to_json(*f),
        AttrValue::Str(s) => Value::String(s.clone()),
        AttrValue::List(l) => Value::Array(
            l.iter()
                .map(|v| attr_to_json(key, v))
                .collect::<Result<_, _>>()?,
        ),
        AttrValue::Map(m) => Value::Object(attrs_to_json(m)?),
        AttrValue::Array(_) => {
            return Err(ZarrError::UnencodableAttr {
                key: key.to_string(),
                reason: "arrays must be encoded before writing".into(),
            })
        }
        AttrValue::Dataset(_) => {
            return Err(ZarrError::UnencodableAttr {
                key: key.to_string(),
                reason: "datasets are stored as child stores".into(),
            })
        }
    };
    Ok(json)
}

/// Convert attributes to a JSON object.
pub fn attrs_to_json(attrs: &Attrs) -> Result<Map<String, Value>, ZarrError> {
    attrs
        .iter()
        .map(|(k, v)| Ok::<_, ZarrError>((k.clone(), attr_to_json(k, v)?)))
        .collect()
}

pub fn json_to_attr(value: Value) -> AttrValue {
    match value {
        Value::Null => AttrValue::Null,
        Value::Bool(b) => AttrValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AttrValue::Int(i),
            None => AttrValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => AttrValue::Str(s),
        Value::Array(a) => AttrValue::List(a.into_iter().map(json_to_attr).collect()),
        Value::Object(o) => AttrValue::Map(json_to_attrs(o)),
    }
}

pub fn json_to_attrs(object: Map<String, Value>) -> Attrs {
    object
        .into_iter()
        .map(|(k, v)| (k, json_to_attr(v)))
        .collect()
}

fn write_json(path: &Path, value: &Value) -> Result<(), ZarrError> {
    let mut file = File::create(path)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    Ok(())
}

fn read_json(path: &Path) -> Result<Value, ZarrError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

fn write_variable(
    dir: &Path,
    name: &str,
    var: &Variable,
    encoding: &Encoding,
) -> Result<(), ZarrError> {
    fs::create_dir(dir)?;
    let shape = var.shape().to_vec();
    let chunks = encoding.chunks.chunk_shape(&var.dims, &shape);
    let (dtype, item_size) = zarr_dtype(&var.data);
    let fill = fill_value(var.data.dtype());
    let meta = ArrayMeta {
        zarr_format: ZARR_FORMAT,
        shape: shape.clone(),
        chunks: chunks.clone(),
        dtype,
        compressor: encoding.compressor.to_meta(),
        fill_value: fill.clone(),
        order: "C".into(),
        filters: None,
        dimension_separator: Some(".".into()),
    };
    write_json(&dir.join(".zarray"), &serde_json::to_value(&meta)?)?;

    let mut attrs = attrs_to_json(&var.attrs)?;
    attrs.insert(DIMENSIONS_KEY.into(), serde_json::json!(var.dims));
    write_json(&dir.join(".zattrs"), &Value::Object(attrs))?;

    let bytes = to_bytes(&var.data, item_size);
    let fill = fill_bytes(var.data.dtype(), item_size, &fill);
    let chunk_len: usize = chunks.iter().product();
    let grid = chunk_grid(&shape, &chunks);
    trace!("writing {} as {} chunks of {:?}", name, grid.len(), chunks);
    for grid_idx in grid {
        let mut chunk = fill.repeat(chunk_len);
        for (a, c, n) in chunk_runs(&shape, &chunks, &grid_idx) {
            chunk[c * item_size..(c + n) * item_size]
                .copy_from_slice(&bytes[a * item_size..(a + n) * item_size]);
        }
        let chunk = encoding.compressor.compress(chunk)?;
        File::create(dir.join(chunk_key(&grid_idx)))?.write_all(&chunk)?;
    }
    Ok(())
}

fn read_variable(dir: &Path) -> Result<Variable, ZarrError> {
    let bad_meta = |message: String| ZarrError::BadMetadata {
        path: dir.to_path_buf(),
        message,
    };
    let meta: ArrayMeta = serde_json::from_value(read_json(&dir.join(".zarray"))?)?;
    if meta.order != "C" {
        return Err(bad_meta(format!("unsupported order {}", meta.order)));
    }
    if meta.chunks.len() != meta.shape.len() || meta.chunks.contains(&0) {
        return Err(bad_meta(format!(
            "chunks {:?} don't fit shape {:?}",
            meta.chunks, meta.shape
        )));
    }
    let (dtype, item_size) = parse_dtype(&meta.dtype)?;
    let compressor = Compressor::from_meta(&meta.compressor)?;
    let separator = meta.dimension_separator.as_deref().unwrap_or(".");

    let mut attrs = match dir.join(".zattrs") {
        p if p.exists() => match read_json(&p)? {
            Value::Object(o) => o,
            _ => return Err(bad_meta(".zattrs is not an object".into())),
        },
        _ => Map::new(),
    };
    let dims: Vec<String> = match attrs.remove(DIMENSIONS_KEY) {
        Some(dims) => serde_json::from_value(dims)?,
        None => return Err(bad_meta(format!("no {}", DIMENSIONS_KEY))),
    };

    let fill = fill_bytes(dtype, item_size, &meta.fill_value);
    let total: usize = meta.shape.iter().product();
    let mut bytes = fill.repeat(total);
    let chunk_bytes = meta.chunks.iter().product::<usize>() * item_size;
    for grid_idx in chunk_grid(&meta.shape, &meta.chunks) {
        let key = if grid_idx.is_empty() {
            "0".to_string()
        } else {
            grid_idx.iter().join(separator)
        };
        let chunk_path = dir.join(key);
        if !chunk_path.exists() {
            continue;
        }
        let mut raw = vec![];
        File::open(&chunk_path)?.read_to_end(&mut raw)?;
        let chunk = compressor.decompress(raw)?;
        if chunk.len() != chunk_bytes {
            return Err(ZarrError::BadChunk {
                path: chunk_path,
                expected: chunk_bytes,
                received: chunk.len(),
            });
        }
        for (a, c, n) in chunk_runs(&meta.shape, &meta.chunks, &grid_idx) {
            bytes[a * item_size..(a + n) * item_size]
                .copy_from_slice(&chunk[c * item_size..(c + n) * item_size]);
        }
    }
    let data = from_bytes(dtype, item_size, &meta.shape, &bytes).map_err(|e| match e {
        ZarrError::BadMetadata { message, .. } => bad_meta(message),
        e => e,
    })?;
    Ok(Variable {
        dims,
        data,
        attrs: json_to_attrs(attrs),
    })
}

/// Write `dataset` as a new store at `path`.
///
/// Non-dimension coordinates are listed under the group's `coordinates`
/// attribute so that they are read back as coordinates.
pub fn write_store(
    dataset: &Dataset,
    path: &Path,
    mode: WriteMode,
    encoding: &Encoding,
) -> Result<(), ZarrError> {
    if path.exists() {
        match mode {
            WriteMode::CreateNew => return Err(ZarrError::AlreadyExists(path.to_path_buf())),
            WriteMode::Overwrite => {
                debug!("removing existing store {}", path.display());
                fs::remove_dir_all(path)?;
            }
        }
    }
    fs::create_dir_all(path)?;
    write_json(
        &path.join(".zgroup"),
        &serde_json::json!({ "zarr_format": ZARR_FORMAT }),
    )?;

    let mut attrs = attrs_to_json(&dataset.attrs)?;
    let extra_coords = dataset
        .coords
        .iter()
        .filter(|(name, var)| var.dims.len() != 1 || &var.dims[0] != *name)
        .map(|(name, _)| name.as_str())
        .join(" ");
    if !extra_coords.is_empty() {
        attrs.insert(COORDINATES_KEY.into(), Value::String(extra_coords));
    }
    write_json(&path.join(".zattrs"), &Value::Object(attrs))?;

    for (name, var) in dataset.coords.iter().chain(dataset.data_vars.iter()) {
        write_variable(&path.join(name), name, var, encoding)?;
    }
    Ok(())
}

/// Read the store at `path`. Sub-directories that aren't arrays (e.g. child
/// groups) are ignored.
pub fn read_store(path: &Path) -> Result<Dataset, ZarrError> {
    if !path.join(".zgroup").is_file() {
        return Err(ZarrError::NotAGroup(path.to_path_buf()));
    }
    let mut attrs = match path.join(".zattrs") {
        p if p.exists() => match read_json(&p)? {
            Value::Object(o) => o,
            _ => {
                return Err(ZarrError::BadMetadata {
                    path: p,
                    message: ".zattrs is not an object".into(),
                })
            }
        },
        _ => Map::new(),
    };
    let mut coord_names: BTreeSet<String> = BTreeSet::new();
    if let Some(Value::String(names)) = attrs.remove(COORDINATES_KEY) {
        coord_names.extend(names.split_whitespace().map(String::from));
    }

    let mut entries = fs::read_dir(path)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<Vec<PathBuf>, _>>()?;
    entries.sort();
    let mut variables = vec![];
    for entry in entries {
        if !entry.join(".zarray").is_file() {
            continue;
        }
        let name = match entry.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let mut var = read_variable(&entry)?;
        if let Some(AttrValue::Str(names)) = var.attrs.remove(COORDINATES_KEY) {
            coord_names.extend(names.split_whitespace().map(String::from));
        }
        variables.push((name, var));
    }

    let mut dataset = Dataset {
        attrs: json_to_attrs(attrs),
        ..Default::default()
    };
    for (name, var) in variables {
        if coord_names.contains(&name) || var.dims == [name.as_str()] {
            dataset.add_coord(&name, var)?;
        } else {
            dataset.add_data_var(&name, var)?;
        }
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn small_chunks() -> Encoding {
        Encoding {
            chunks: ChunkSpec(BTreeMap::from([
                ("time".to_string(), 2),
                ("baseline".to_string(), 2),
            ])),
            compressor: Compressor::default(),
        }
    }

    fn dataset() -> Dataset {
        let mut ds = Dataset::new();
        ds.add_coord(
            "time",
            Variable::new(&["time"], ArrayData::from(array![1.0, 2.0, 3.0])).with_attrs(
                attrs! {"units" => "s", "format" => "unix"},
            ),
        )
        .unwrap();
        ds.add_coord(
            "baseline_ant1_id",
            Variable::new(&["baseline"], ArrayData::from(array![0i32, 0, 1])),
        )
        .unwrap();
        ds.add_coord(
            "pol",
            Variable::new(
                &["pol"],
                ArrayData::from(array!["XX".to_string(), "YY".to_string()]),
            ),
        )
        .unwrap();
        let vis = Array3::from_shape_fn((3, 3, 2), |(t, b, p)| {
            c32::new((t * 100 + b * 10 + p) as f32, -(t as f32))
        });
        ds.add_data_var("VIS", Variable::new(&["time", "baseline", "pol"], ArrayData::from(vis)))
            .unwrap();
        ds.add_data_var(
            "FLAG",
            Variable::new(
                &["time", "baseline"],
                ArrayData::from(array![[true, false, true], [false, false, true], [true, true, true]]),
            ),
        )
        .unwrap();
        ds.attrs = attrs! {
            "name" => "ddi_0",
            "nested" => attrs! {"a" => 1i64, "b" => vec![1.5, 2.5]},
            "missing" => AttrValue::Null,
        };
        ds
    }

    #[test]
    fn test_chunk_runs_cover_edge_chunks() {
        // A 3x3 array in 2x2 chunks; the last chunk holds a single element.
        assert_eq!(chunk_grid(&[3, 3], &[2, 2]).len(), 4);
        assert_eq!(chunk_runs(&[3, 3], &[2, 2], &[0, 0]), vec![(0, 0, 2), (3, 2, 2)]);
        assert_eq!(chunk_runs(&[3, 3], &[2, 2], &[1, 1]), vec![(8, 0, 1)]);
        assert_eq!(chunk_runs(&[5], &[2], &[2]), vec![(4, 0, 1)]);
        assert_eq!(chunk_key(&[1, 0, 2]), "1.0.2");
        assert_eq!(chunk_key(&[]), "0");
    }

    #[test]
    fn test_write_read_store() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ds.zarr");
        let ds = dataset();
        write_store(&ds, &path, WriteMode::CreateNew, &small_chunks()).unwrap();
        assert!(path.join("VIS").join("1.1.0").exists());
        assert!(path.join("time").join("1").exists());

        let read = read_store(&path).unwrap();
        assert_eq!(read, ds);
        assert!(read.coords.contains_key("baseline_ant1_id"));
    }

    #[test]
    fn test_uncompressed_zero_d_and_nan() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ds.zarr");
        let mut ds = Dataset::new();
        ds.add_data_var(
            "scalar",
            Variable::new::<&str>(&[], ArrayData::from(ndarray::arr0(4.5f64))),
        )
        .unwrap();
        ds.add_data_var(
            "w",
            Variable::new(&["x"], ArrayData::from(array![f32::NAN, 1.0])),
        )
        .unwrap();
        let encoding = Encoding {
            chunks: ChunkSpec::default(),
            compressor: Compressor::None,
        };
        write_store(&ds, &path, WriteMode::CreateNew, &encoding).unwrap();
        let read = read_store(&path).unwrap();
        assert_eq!(read.data_vars["scalar"], ds.data_vars["scalar"]);
        match &read.data_vars["w"].data {
            ArrayData::Float32(a) => {
                assert!(a[0].is_nan());
                assert_abs_diff_eq!(a[1], 1.0);
            }
            other => panic!("unexpected {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_non_finite_attrs() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ds.zarr");
        let mut ds = dataset();
        ds.attrs = attrs! {
            "nan" => f64::NAN,
            "inf" => f64::INFINITY,
            "neg_inf" => f64::NEG_INFINITY,
        };
        write_store(&ds, &path, WriteMode::CreateNew, &small_chunks()).unwrap();

        let zattrs = read_json(&path.join(".zattrs")).unwrap();
        assert_eq!(zattrs["nan"], Value::from("NaN"));
        let read = read_store(&path).unwrap();
        assert!(read.attrs["nan"].as_f64().unwrap().is_nan());
        assert_eq!(read.attrs["inf"].as_f64(), Some(f64::INFINITY));
        assert_eq!(read.attrs["neg_inf"].as_f64(), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_missing_chunk_reads_as_fill() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ds.zarr");
        write_store(&dataset(), &path, WriteMode::CreateNew, &small_chunks()).unwrap();
        fs::remove_file(path.join("time").join("1")).unwrap();
        let read = read_store(&path).unwrap();
        match &read.coords["time"].data {
            ArrayData::Float64(a) => {
                assert_abs_diff_eq!(a[0], 1.0);
                assert!(a[2].is_nan());
            }
            other => panic!("unexpected {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_write_modes() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("ds.zarr");
        let ds = dataset();
        write_store(&ds, &path, WriteMode::CreateNew, &small_chunks()).unwrap();
        let result = write_store(&ds, &path, WriteMode::CreateNew, &small_chunks());
        assert!(matches!(result, Err(ZarrError::AlreadyExists(_))));

        let mut smaller = Dataset::new();
        smaller
            .add_data_var("x", Variable::new(&["a"], ArrayData::from(array![1i64])))
            .unwrap();
        write_store(&smaller, &path, WriteMode::Overwrite, &small_chunks()).unwrap();
        assert_eq!(read_store(&path).unwrap(), smaller);
    }

    #[test]
    fn test_unencodable_attrs() {
        let temp_dir = tempdir().unwrap();
        let mut ds = Dataset::new();
        ds.attrs = attrs! {"arr" => ArrayData::from(array![1.0])};
        let result = write_store(
            &ds,
            &temp_dir.path().join("ds.zarr"),
            WriteMode::CreateNew,
            &Encoding::default(),
        );
        assert!(matches!(result, Err(ZarrError::UnencodableAttr { .. })));
    }

    #[test]
    fn test_not_a_group() {
        let temp_dir = tempdir().unwrap();
        assert!(matches!(
            read_store(temp_dir.path()),
            Err(ZarrError::NotAGroup(_))
        ));
    }
}
