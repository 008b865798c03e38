// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read measurement set subtables (`ANTENNA`, `FIELD`, `SPECTRAL_WINDOW`, ...)
//! into datasets and metadata.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use log::{debug, warn};
use ndarray::Array1;
use thiserror::Error;

use crate::{
    attrs,
    constants::NO_STATE_ID,
    dataset::{ArrayData, AttrValue, Attrs, Dataset, DatasetError, Variable},
    io::{
        error::TableError,
        table::{MeasurementSource, TableCursor},
    },
};

#[derive(Error, Debug)]
pub enum SubtableError {
    #[error("subtable {table} has {num_rows} rows; there is no row {row}")]
    NoSuchRow {
        table: String,
        row: usize,
        num_rows: usize,
    },

    #[error("subtable {table} column {column} is malformed: {reason}")]
    BadColumn {
        table: String,
        column: String,
        reason: String,
    },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

lazy_static! {
    /// The dimension name of the rows of each subtable.
    static ref SUBTABLE_ROW_DIMS: BTreeMap<&'static str, &'static str> = BTreeMap::from([
        ("ANTENNA", "antenna_id"),
        ("DATA_DESCRIPTION", "data_description_id"),
        ("FEED", "feed_id"),
        ("FIELD", "field_id"),
        ("OBSERVATION", "observation_id"),
        ("POLARIZATION", "pol_setup_id"),
        ("PROCESSOR", "processor_id"),
        ("SOURCE", "source_id"),
        ("SPECTRAL_WINDOW", "spectral_window_id"),
        ("STATE", "state_id"),
    ]);

    /// casacore `Stokes::StokesTypes`, indexed by `CORR_TYPE`.
    static ref STOKES_TYPES: Vec<&'static str> = vec![
        "Undefined", "I", "Q", "U", "V", "RR", "RL", "LR", "LL", "XX", "XY", "YX", "YY", "RX",
        "RY", "LX", "LY", "XR", "XL", "YR", "YL", "PP", "PQ", "QP", "QQ", "RCircular",
        "LCircular", "Linear", "Ptotal", "Plinear", "PFtotal", "PFlinear", "Pangle",
    ];

    /// casacore `MFrequency::Types`, indexed by `MEAS_FREQ_REF`.
    static ref FREQUENCY_FRAMES: Vec<&'static str> = vec![
        "REST", "LSRK", "LSRD", "BARY", "GEO", "TOPO", "GALACTO", "LGROUP", "CMB",
    ];
}

/// The dimension name of the rows of a subtable.
pub fn row_dim(table: &str) -> &'static str {
    SUBTABLE_ROW_DIMS.get(table).copied().unwrap_or("row")
}

/// Read a whole subtable. Each column becomes a variable with a lower-cased
/// name on the table's row dimension; array-valued columns get extra
/// dimensions `<name>_dim_<n>`. Columns that can't be read as one array
/// (e.g. with cells of differing shapes) are left out.
pub fn read_generic_table<M: MeasurementSource + ?Sized>(
    source: &M,
    table: &str,
) -> Result<Dataset, SubtableError> {
    let mut cursor = source.open_subtable(table)?;
    let num_rows = cursor.n_rows();
    let dim = row_dim(table);

    let mut dataset = Dataset::new();
    dataset.add_coord(
        dim,
        Variable::new(&[dim], ArrayData::from(Array1::from_iter(0..num_rows as i32))),
    )?;
    for column in cursor.column_names()? {
        let data = match cursor.get_column(&column) {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping {} column {}: {}", table, column, e);
                continue;
            }
        };
        let name = column.to_lowercase();
        let mut dims = vec![dim.to_string()];
        dims.extend((1..data.ndim()).map(|i| format!("{}_dim_{}", name, i)));
        dataset.add_data_var(&name, Variable::new(&dims, data))?;
    }
    dataset.attrs = attrs! {"table_name" => table};
    debug!("Read {} rows of subtable {}", num_rows, table);
    Ok(dataset)
}

pub fn num_rows<M: MeasurementSource + ?Sized>(source: &M, table: &str) -> Result<usize, SubtableError> {
    Ok(source.open_subtable(table)?.n_rows())
}

fn check_row<C: TableCursor>(cursor: &C, table: &str, row: usize) -> Result<(), SubtableError> {
    if row >= cursor.n_rows() {
        return Err(SubtableError::NoSuchRow {
            table: table.to_string(),
            row,
            num_rows: cursor.n_rows(),
        });
    }
    Ok(())
}

fn cell_f64s<C: TableCursor>(
    cursor: &mut C,
    table: &str,
    column: &str,
    row: usize,
) -> Result<Vec<f64>, SubtableError> {
    cursor
        .get_cell(column, row)?
        .as_f64_vec()
        .ok_or_else(|| SubtableError::BadColumn {
            table: table.to_string(),
            column: column.to_string(),
            reason: "not real-valued".into(),
        })
}

fn cell_i64<C: TableCursor>(
    cursor: &mut C,
    table: &str,
    column: &str,
    row: usize,
) -> Result<i64, SubtableError> {
    cursor
        .get_cell(column, row)?
        .as_i64_vec()
        .and_then(|v| v.first().copied())
        .ok_or_else(|| SubtableError::BadColumn {
            table: table.to_string(),
            column: column.to_string(),
            reason: "not an integer".into(),
        })
}

fn cell_string<C: TableCursor>(
    cursor: &mut C,
    table: &str,
    column: &str,
    row: usize,
) -> Result<String, SubtableError> {
    cursor
        .get_cell(column, row)?
        .as_str_vec()
        .and_then(|v| v.into_iter().next())
        .ok_or_else(|| SubtableError::BadColumn {
            table: table.to_string(),
            column: column.to_string(),
            reason: "not a string".into(),
        })
}

/// An id column, which must fit in an `i32`.
fn cell_id<C: TableCursor>(
    cursor: &mut C,
    table: &str,
    column: &str,
    row: usize,
) -> Result<i32, SubtableError> {
    let id = cell_i64(cursor, table, column, row)?;
    i32::try_from(id).map_err(|_| SubtableError::BadColumn {
        table: table.to_string(),
        column: column.to_string(),
        reason: format!("id {} is out of range", id),
    })
}

/// The spectral window and polarization setup of a data description.
pub fn data_description<M: MeasurementSource + ?Sized>(
    source: &M,
    ddi: i32,
) -> Result<(i32, i32), SubtableError> {
    let table = "DATA_DESCRIPTION";
    let mut cursor = source.open_subtable(table)?;
    let row = usize::try_from(ddi).unwrap_or(usize::MAX);
    check_row(&cursor, table, row)?;
    let spw = cell_id(&mut cursor, table, "SPECTRAL_WINDOW_ID", row)?;
    let pol = cell_id(&mut cursor, table, "POLARIZATION_ID", row)?;
    Ok((spw, pol))
}

/// Descriptive metadata of a field: name, code, reference time, and the
/// first polynomial term of each direction.
pub fn field_info<M: MeasurementSource + ?Sized>(
    source: &M,
    field_id: i32,
) -> Result<Attrs, SubtableError> {
    let table = "FIELD";
    let mut cursor = source.open_subtable(table)?;
    let row = usize::try_from(field_id).unwrap_or(usize::MAX);
    check_row(&cursor, table, row)?;

    let mut info = attrs! {
        "field_id" => field_id,
        "name" => cell_string(&mut cursor, table, "NAME", row)?,
        "code" => cell_string(&mut cursor, table, "CODE", row)?,
        "time" => cell_f64s(&mut cursor, table, "TIME", row)?.first().copied().unwrap_or(f64::NAN),
        "num_poly" => 0i64,
    };
    for column in ["DELAY_DIR", "PHASE_DIR", "REFERENCE_DIR"] {
        let dir = cell_f64s(&mut cursor, table, column, row)?;
        if dir.len() < 2 {
            return Err(SubtableError::BadColumn {
                table: table.to_string(),
                column: column.to_string(),
                reason: format!("has {} values, expected at least 2", dir.len()),
            });
        }
        info.insert(column.to_lowercase(), AttrValue::from(dir[..2].to_vec()));
    }
    Ok(info)
}

/// Channel frequencies of a spectral window as the `freq` coordinate.
pub fn freq_coord<M: MeasurementSource + ?Sized>(
    source: &M,
    spw_id: i32,
) -> Result<Variable, SubtableError> {
    let table = "SPECTRAL_WINDOW";
    let mut cursor = source.open_subtable(table)?;
    let row = usize::try_from(spw_id).unwrap_or(usize::MAX);
    check_row(&cursor, table, row)?;

    let freqs = cell_f64s(&mut cursor, table, "CHAN_FREQ", row)?;
    let mut attrs = attrs! {
        "units" => "Hz",
        "type" => "spectral_coord",
        "spectral_window_id" => spw_id,
    };
    let column_names = cursor.column_names()?;
    if column_names.iter().any(|c| c == "MEAS_FREQ_REF") {
        let frame = cell_i64(&mut cursor, table, "MEAS_FREQ_REF", row)?;
        let frame = usize::try_from(frame)
            .ok()
            .and_then(|f| FREQUENCY_FRAMES.get(f))
            .copied()
            .unwrap_or("Undefined");
        attrs.insert("frame".into(), frame.into());
    }
    if column_names.iter().any(|c| c == "CHAN_WIDTH") {
        if let Some(&width) = cell_f64s(&mut cursor, table, "CHAN_WIDTH", row)?.first() {
            attrs.insert(
                "channel_width".into(),
                attrs! {"data" => width, "units" => "Hz"}.into(),
            );
        }
    }
    if column_names.iter().any(|c| c == "REF_FREQUENCY") {
        if let Some(&reference) = cell_f64s(&mut cursor, table, "REF_FREQUENCY", row)?.first() {
            attrs.insert(
                "reference_frequency".into(),
                attrs! {"data" => reference, "units" => "Hz"}.into(),
            );
        }
    }
    Ok(Variable::new(&["freq"], ArrayData::from(Array1::from(freqs))).with_attrs(attrs))
}

/// Correlation product names (e.g. `XX`) of a polarization setup.
pub fn pol_names<M: MeasurementSource + ?Sized>(
    source: &M,
    pol_id: i32,
) -> Result<Vec<String>, SubtableError> {
    let table = "POLARIZATION";
    let mut cursor = source.open_subtable(table)?;
    let row = usize::try_from(pol_id).unwrap_or(usize::MAX);
    check_row(&cursor, table, row)?;
    let corr_types = cursor
        .get_cell("CORR_TYPE", row)?
        .as_i64_vec()
        .ok_or_else(|| SubtableError::BadColumn {
            table: table.to_string(),
            column: "CORR_TYPE".into(),
            reason: "not an integer".into(),
        })?;
    Ok(corr_types
        .into_iter()
        .map(|c| {
            usize::try_from(c)
                .ok()
                .and_then(|c| STOKES_TYPES.get(c))
                .copied()
                .unwrap_or("Undefined")
                .to_string()
        })
        .collect())
}

/// Every state id, or `[-1]` if the `STATE` table is empty.
pub fn state_ids<M: MeasurementSource + ?Sized>(source: &M) -> Result<Vec<i32>, SubtableError> {
    match num_rows(source, "STATE")? {
        0 => Ok(vec![NO_STATE_ID]),
        n => Ok((0..n as i32).collect()),
    }
}

/// Group state ids by their `OBS_MODE` (intent), in order of first
/// appearance. An empty `STATE` table gives one unnamed group holding `-1`.
pub fn get_unique_intents<M: MeasurementSource + ?Sized>(
    source: &M,
) -> Result<Vec<(String, Vec<i32>)>, SubtableError> {
    let mut cursor = source.open_subtable("STATE")?;
    if cursor.n_rows() == 0 {
        return Ok(vec![(String::new(), vec![NO_STATE_ID])]);
    }
    let obs_modes = cursor.get_str_column("OBS_MODE")?;
    let mut intents: Vec<(String, Vec<i32>)> = vec![];
    for (state_id, obs_mode) in obs_modes.into_iter().enumerate() {
        match intents.iter_mut().find(|(mode, _)| *mode == obs_mode) {
            Some((_, ids)) => ids.push(state_id as i32),
            None => intents.push((obs_mode, vec![state_id as i32])),
        }
    }
    Ok(intents)
}
