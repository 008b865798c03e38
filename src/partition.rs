// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Build and write one partition of a measurement set: the rows with one data
//! description, state (group) and field, reshaped onto a dense
//! `[time][baseline][freq][pol]` grid.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use itertools::Itertools;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use ndarray::Array1;
use thiserror::Error;

use crate::{
    attrs,
    config::ConversionConfig,
    constants::{ANTENNA_STORE_SUFFIX, MAIN_STORE_SUFFIX, MJD_UNIX_OFFSET_SECONDS, PKG_NAME, PKG_VERSION},
    dataset::{ArrayData, AttrValue, Attrs, Dataset, DatasetError, Variable},
    densify::densify_column,
    index::{IndexError, RowIndex},
    io::{
        error::{TableError, ZarrError},
        table::{MeasurementSource, Predicate, TableCursor},
        xds::write_xds,
    },
    subtables::{self, SubtableError},
};

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("partition {name} selects rows from more than one field: {field_ids:?}")]
    MultipleFields { name: String, field_ids: Vec<i64> },

    #[error("partition {name} has out-of-range FIELD_ID {field_id}")]
    BadFieldId { name: String, field_id: i64 },

    #[error("couldn't write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: ZarrError,
    },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Subtable(#[from] SubtableError),

    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

impl PartitionError {
    /// Fatal errors make the whole measurement set unconvertible. The others
    /// only affect their own partition.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PartitionError::MultipleFields { .. } | PartitionError::Write { .. }
        )
    }
}

/// The states selected by a partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateSelection {
    Single(i32),
    /// States sharing an intent.
    Group(Vec<i32>),
}

impl StateSelection {
    pub fn ids(&self) -> Vec<i32> {
        match self {
            StateSelection::Single(id) => vec![*id],
            StateSelection::Group(ids) => ids.clone(),
        }
    }
}

/// What selects the rows of a partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub ddi: i32,
    pub state: StateSelection,
    pub field_id: Option<i32>,
    /// The `OBS_MODE` of the states, if the partition was made by intent.
    pub intent: Option<String>,
}

impl PartitionKey {
    pub fn predicate(&self) -> Predicate {
        Predicate {
            ddi: self.ddi,
            state_ids: self.state.ids(),
            field_id: self.field_id,
        }
    }

    /// The name of this partition's stores, e.g. `ddi_0_state_id_1_2_field_id_3`.
    pub fn file_name(&self) -> String {
        let mut name = format!("ddi_{}_state_id_{}", self.ddi, self.state.ids().iter().join("_"));
        if let Some(field_id) = self.field_id {
            name.push_str(&format!("_field_id_{}", field_id));
        }
        name
    }

    pub fn main_store(&self, outfile: &Path) -> PathBuf {
        outfile.join(format!("{}{}", self.file_name(), MAIN_STORE_SUFFIX))
    }

    pub fn antenna_store(&self, outfile: &Path) -> PathBuf {
        outfile.join(format!("{}{}", self.file_name(), ANTENNA_STORE_SUFFIX))
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// How a main table column is converted.
struct ColumnSpec {
    dims: &'static [&'static str],
    /// Skip this column if that one was loaded. It must come earlier in
    /// [`MAIN_COLUMNS`].
    superseded_by: Option<&'static str>,
}

const VIS_DIMS: &[&str] = &["time", "baseline", "freq", "pol"];

lazy_static! {
    /// Main table columns that may become data variables, in conversion order.
    static ref MAIN_COLUMNS: Vec<(&'static str, ColumnSpec)> = vec![
        ("DATA", ColumnSpec { dims: VIS_DIMS, superseded_by: None }),
        ("CORRECTED_DATA", ColumnSpec { dims: VIS_DIMS, superseded_by: None }),
        ("MODEL_DATA", ColumnSpec { dims: VIS_DIMS, superseded_by: None }),
        ("WEIGHT_SPECTRUM", ColumnSpec { dims: VIS_DIMS, superseded_by: None }),
        ("WEIGHT", ColumnSpec { dims: &["time", "baseline", "pol"], superseded_by: Some("WEIGHT_SPECTRUM") }),
        ("SIGMA_SPECTRUM", ColumnSpec { dims: VIS_DIMS, superseded_by: None }),
        ("SIGMA", ColumnSpec { dims: &["time", "baseline", "pol"], superseded_by: Some("SIGMA_SPECTRUM") }),
        ("FLAG", ColumnSpec { dims: VIS_DIMS, superseded_by: None }),
        ("UVW", ColumnSpec { dims: &["time", "baseline", "uvw_dim"], superseded_by: None }),
        ("EXPOSURE", ColumnSpec { dims: &["time", "baseline"], superseded_by: None }),
        ("TIME_CENTROID", ColumnSpec { dims: &["time", "baseline"], superseded_by: None }),
    ];
}

/// casacore times are MJD seconds.
pub fn casacore_to_unix(time: f64) -> f64 {
    time - MJD_UNIX_OFFSET_SECONDS
}

fn time_attrs() -> Attrs {
    attrs! {
        "units" => "s",
        "type" => "time",
        "format" => "unix",
        "scale" => "utc",
    }
}

/// Attributes of a converted column.
fn column_attrs(column: &str) -> Attrs {
    match column {
        "UVW" => attrs! {
            "units" => "m",
            "measure" => attrs! {"type" => "uvw", "ref_frame" => "ITRF"},
            "long_name" => "uvw",
            "description" => "uvw coordinates.",
        },
        "EXPOSURE" => attrs! {"units" => "s"},
        "TIME_CENTROID" => time_attrs(),
        _ => Attrs::new(),
    }
}

/// What happened to one main table column.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnOutcome {
    Loaded { variable: String, shape: Vec<usize> },
    Skipped { reason: String },
}

/// A summary of one partition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionReport {
    pub name: String,
    pub num_rows: usize,
    /// Rows that couldn't be placed on the time/baseline grid.
    pub num_invalid_rows: usize,
    /// `(time, baseline)` cells without a row.
    pub num_missing_cells: usize,
    pub columns: BTreeMap<String, ColumnOutcome>,
}

/// The datasets of one partition. Both are empty if no rows were selected.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionDatasets {
    pub main: Dataset,
    pub antenna: Dataset,
    pub report: PartitionReport,
}

impl PartitionDatasets {
    pub fn is_empty(&self) -> bool {
        self.report.num_rows == 0
    }
}

/// The result of converting one partition.
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionOutcome {
    /// No rows were selected, and nothing was written.
    Empty,
    Written(PartitionReport),
}

fn load_column<C: TableCursor>(
    cursor: &mut C,
    column: &str,
    spec: &ColumnSpec,
    index: &RowIndex,
) -> Result<Variable, String> {
    let raw = cursor.get_column(column).map_err(|e| e.to_string())?;
    let mut dense = densify_column(column, &raw, index).map_err(|e| e.to_string())?;
    if dense.ndim() != spec.dims.len() {
        return Err(format!(
            "expected {} dimensions ({}), got shape {:?}",
            spec.dims.len(),
            spec.dims.join(", "),
            dense.shape()
        ));
    }
    if column == "TIME_CENTROID" {
        if let ArrayData::Float64(a) = &mut dense {
            a.mapv_inplace(casacore_to_unix);
        }
    }
    Ok(Variable::new(spec.dims, dense).with_attrs(column_attrs(column)))
}

/// The single field of the selected rows.
fn single_field<C: TableCursor>(cursor: &mut C, name: &str) -> Result<i32, PartitionError> {
    let field_ids: Vec<i64> = cursor
        .get_i64_column("FIELD_ID")?
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    match field_ids.as_slice() {
        [field_id] => i32::try_from(*field_id).map_err(|_| PartitionError::BadFieldId {
            name: name.to_string(),
            field_id: *field_id,
        }),
        _ => Err(PartitionError::MultipleFields {
            name: name.to_string(),
            field_ids,
        }),
    }
}

/// Select, index and densify the rows of one partition, and read the
/// metadata it needs from the subtables.
///
/// Columns that fail to load are left out, and the reason is recorded in the
/// report. Selecting no rows is not an error; the datasets are then empty.
pub fn build_partition<M: MeasurementSource + ?Sized>(
    source: &M,
    key: &PartitionKey,
    config: &ConversionConfig,
) -> Result<PartitionDatasets, PartitionError> {
    let name = key.file_name();
    let predicate = key.predicate();
    let mut cursor = source.query_main(Some(&predicate))?;
    let num_rows = cursor.n_rows();
    info!("Partition {}: {} rows {}", name, num_rows, predicate);
    if num_rows == 0 {
        return Ok(PartitionDatasets {
            report: PartitionReport {
                name,
                ..Default::default()
            },
            ..Default::default()
        });
    }

    let index = RowIndex::build(&mut cursor, config.time_tolerance)?;
    let field_id = single_field(&mut cursor, &name)?;

    let (spw_id, pol_id) = subtables::data_description(source, key.ddi)?;
    let freq = subtables::freq_coord(source, spw_id)?;
    let pol_names = subtables::pol_names(source, pol_id)?;
    let field_info = subtables::field_info(source, field_id)?;

    let mut main = Dataset::new();
    let unix_times: Array1<f64> = index.times.times().iter().map(|&t| casacore_to_unix(t)).collect();
    main.add_coord(
        "time",
        Variable::new(&["time"], ArrayData::from(unix_times)).with_attrs(time_attrs()),
    )?;
    main.add_coord(
        "baseline_id",
        Variable::new(
            &["baseline"],
            ArrayData::from(Array1::from_iter(0..index.baselines.len() as i32)),
        ),
    )?;
    main.add_coord(
        "baseline_ant1_id",
        Variable::new(&["baseline"], ArrayData::from(Array1::from(index.baseline_ant1_ids()))),
    )?;
    main.add_coord(
        "baseline_ant2_id",
        Variable::new(&["baseline"], ArrayData::from(Array1::from(index.baseline_ant2_ids()))),
    )?;
    main.add_coord("freq", freq)?;
    main.add_coord(
        "pol",
        Variable::new(&["pol"], ArrayData::from(Array1::from(pol_names))),
    )?;

    let present: BTreeSet<String> = cursor.column_names()?.into_iter().collect();
    let mut columns = BTreeMap::new();
    for (column, spec) in MAIN_COLUMNS.iter() {
        if !present.contains(*column) {
            continue;
        }
        let skip = |reason: String| ColumnOutcome::Skipped { reason };
        let outcome = if config.ignore_cols.contains(*column) {
            skip("ignored".into())
        } else if let Some(other) = spec
            .superseded_by
            .filter(|o| matches!(columns.get(*o), Some(ColumnOutcome::Loaded { .. })))
        {
            skip(format!("superseded by {}", other))
        } else if let Some(variable) = config.column_rename.get(*column) {
            let start = Instant::now();
            let loaded = load_column(&mut cursor, column, spec, &index).and_then(|var| {
                let shape = var.shape().to_vec();
                main.add_data_var(variable, var)
                    .map(|_| shape)
                    .map_err(|e| e.to_string())
            });
            debug!("{}: {} took {:?}", name, column, start.elapsed());
            match loaded {
                Ok(shape) => ColumnOutcome::Loaded {
                    variable: variable.clone(),
                    shape,
                },
                Err(reason) => skip(reason),
            }
        } else {
            skip("no data variable name".into())
        };
        if let ColumnOutcome::Skipped { reason } = &outcome {
            warn!("{}: skipping column {}: {}", name, column, reason);
        }
        columns.insert(column.to_string(), outcome);
    }

    let mut partition_info = attrs! {
        "ddi" => key.ddi,
        "spectral_window_id" => spw_id,
        "polarization_id" => pol_id,
        "state_ids" => key.state.ids(),
        "field_id" => field_id,
    };
    if let Some(intent) = &key.intent {
        partition_info.insert("intent".into(), intent.as_str().into());
    }
    main.attrs = attrs! {
        "field_info" => field_info,
        "partition_info" => partition_info,
        "creator" => attrs! {"software" => PKG_NAME, "version" => PKG_VERSION},
    };

    let mut antenna = subtables::read_generic_table(source, "ANTENNA")?;
    antenna.attrs.insert(
        "partition_info".into(),
        AttrValue::Map(attrs! {"name" => name.as_str()}),
    );

    let report = PartitionReport {
        name,
        num_rows,
        num_invalid_rows: index.valid.iter().filter(|&&v| !v).count(),
        num_missing_cells: index.num_missing_cells(),
        columns,
    };
    Ok(PartitionDatasets {
        main,
        antenna,
        report,
    })
}

/// Build a partition and write its main and antenna stores under `outfile`.
pub fn convert_and_write_partition<M: MeasurementSource + ?Sized>(
    source: &M,
    outfile: &Path,
    key: &PartitionKey,
    config: &ConversionConfig,
) -> Result<PartitionOutcome, PartitionError> {
    let start = Instant::now();
    let datasets = build_partition(source, key, config)?;
    if datasets.is_empty() {
        info!("Partition {} is empty; nothing written", key);
        return Ok(PartitionOutcome::Empty);
    }

    let mode = config.write_mode();
    let encoding = config.encoding();
    let main_path = key.main_store(outfile);
    write_xds(&datasets.main, &main_path, mode, &encoding).map_err(|source| {
        PartitionError::Write {
            path: main_path.clone(),
            source,
        }
    })?;
    info!("Wrote {}", main_path.display());

    let antenna_path = key.antenna_store(outfile);
    if let Err(source) = write_xds(&datasets.antenna, &antenna_path, mode, &encoding) {
        // Don't leave a main store without its antenna store.
        if let Err(e) = fs::remove_dir_all(&main_path) {
            warn!("Couldn't remove {}: {}", main_path.display(), e);
        }
        return Err(PartitionError::Write {
            path: antenna_path,
            source,
        });
    }
    info!("Wrote {}", antenna_path.display());
    debug!("Partition {} took {:?}", key, start.elapsed());
    Ok(PartitionOutcome::Written(datasets.report))
}
