// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::DatasetError;

#[derive(Error, Debug)]
/// Errors from reading measurement set tables.
pub enum TableError {
    #[error("table {table} has no column {column}")]
    NoSuchColumn { table: String, column: String },

    #[error("measurement set has no {0} subtable")]
    NoSuchSubtable(String),

    #[error("column {column} has unsupported type {data_type}")]
    UnsupportedColumnType { column: String, data_type: String },

    #[error("column {column} has cells of differing shapes ({first:?} at row {first_row}, {other:?} at row {other_row})")]
    /// Variable-shaped array column that can't be stacked.
    RaggedColumn {
        column: String,
        first: Vec<usize>,
        first_row: usize,
        other: Vec<usize>,
        other_row: usize,
    },

    #[error("row {row} is out of range for column {column} with {num_rows} rows")]
    BadRow {
        column: String,
        row: usize,
        num_rows: usize,
    },

    #[error("column {column} does not hold {expected} values")]
    WrongColumnType {
        column: String,
        expected: &'static str,
    },

    #[error("column {column} has {received} rows, but the table has {expected}")]
    BadColumnLength {
        column: String,
        expected: usize,
        received: usize,
    },

    #[error("casacore error in {path}: {message}")]
    /// Error message from casacore.
    Casacore { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
/// Errors from reading and writing Zarr stores.
pub enum ZarrError {
    #[error("store {0} already exists; refusing to overwrite it")]
    AlreadyExists(PathBuf),

    #[error("{0} is not a zarr group (no .zgroup)")]
    NotAGroup(PathBuf),

    #[error("unsupported zarr dtype {0}")]
    UnsupportedDtype(String),

    #[error("unsupported zarr compressor {0}")]
    UnsupportedCompressor(String),

    #[error("bad zarr metadata in {path}: {message}")]
    BadMetadata { path: PathBuf, message: String },

    #[error("chunk {path} has {received} bytes, expected {expected}")]
    BadChunk {
        path: PathBuf,
        expected: usize,
        received: usize,
    },

    #[error("attribute {key} can't be stored as JSON: {reason}")]
    UnencodableAttr { key: String, reason: String },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug)]
/// Errors from decoding a stored dataset tree.
pub enum DecodeError {
    #[error("attribute {key}: unsupported encoded array dtype {dtype}")]
    UnsupportedDtype { key: String, dtype: String },

    #[error("attribute {key}: encoded array value is {reason}")]
    BadEncodedValue { key: String, reason: String },

    #[error("child store {path} could not be read: {source}")]
    /// A directory named like a child store that isn't a valid store.
    BadChildStore {
        path: PathBuf,
        #[source]
        source: Box<DecodeError>,
    },

    #[error(transparent)]
    Zarr(#[from] ZarrError),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}
