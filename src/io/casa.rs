// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read CASA measurement sets with casacore, via [`rubbl_casatables`].

use std::{
    collections::BTreeSet,
    fmt::Display,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use log::trace;
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use rubbl_casatables::{CasaDataType, CasaScalarData, GlueDataType, Table, TableOpenMode};

use super::{
    error::TableError,
    table::{MeasurementSource, Predicate, TableCursor},
};
use crate::{c32, c64, dataset::ArrayData};

/// The name of the main table, as opposed to a subtable.
const MAIN_TABLE: &str = "MAIN";

lazy_static! {
    /// `(table, column)` of the array columns whose cells are matrices rather
    /// than vectors. The same column name can be a vector in another table,
    /// e.g. SOURCE's DIRECTION.
    static ref MATRIX_COLUMNS: BTreeSet<(&'static str, &'static str)> = [
        (MAIN_TABLE, "DATA"),
        (MAIN_TABLE, "CORRECTED_DATA"),
        (MAIN_TABLE, "MODEL_DATA"),
        (MAIN_TABLE, "FLOAT_DATA"),
        (MAIN_TABLE, "FLAG"),
        (MAIN_TABLE, "WEIGHT_SPECTRUM"),
        (MAIN_TABLE, "SIGMA_SPECTRUM"),
        ("FIELD", "DELAY_DIR"),
        ("FIELD", "PHASE_DIR"),
        ("FIELD", "REFERENCE_DIR"),
        ("POLARIZATION", "CORR_PRODUCT"),
        ("POINTING", "DIRECTION"),
        ("POINTING", "TARGET"),
        ("FEED", "BEAM_OFFSET"),
        ("FEED", "POL_RESPONSE"),
    ]
    .into_iter()
    .collect();
}

fn is_matrix_column(table: &str, column: &str) -> bool {
    MATRIX_COLUMNS.contains(&(table, column))
}

fn casa_err<E: Display>(path: &Path, e: E) -> TableError {
    TableError::Casacore {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CellKind {
    Scalar,
    Vector,
    Matrix,
}

/// A measurement set on disk. Nothing is opened until a cursor is requested.
#[derive(Clone, Debug)]
pub struct CasaMeasurementSet {
    path: PathBuf,
}

impl CasaMeasurementSet {
    pub fn new<T: AsRef<Path>>(path: T) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MeasurementSource for CasaMeasurementSet {
    type Cursor = CasaCursor;

    fn query_main(&self, predicate: Option<&Predicate>) -> Result<CasaCursor, TableError> {
        let mut cursor = CasaCursor::open(&self.path, MAIN_TABLE)?;
        if let Some(predicate) = predicate {
            let rows = predicate.matching_rows(&mut cursor)?;
            trace!("{} matched {} rows", predicate, rows.len());
            cursor.rows = rows.into_iter().map(|r| cursor.rows[r]).collect();
        }
        Ok(cursor)
    }

    fn open_subtable(&self, name: &str) -> Result<CasaCursor, TableError> {
        let path = self.path.join(name);
        if !path.is_dir() {
            return Err(TableError::NoSuchSubtable(name.to_string()));
        }
        CasaCursor::open(&path, name)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A read-only casacore table, restricted to a set of rows.
pub struct CasaCursor {
    path: PathBuf,
    /// `MAIN`, or the subtable name.
    name: String,
    table: Table,
    rows: Vec<usize>,
}

impl CasaCursor {
    pub fn open(path: &Path, name: &str) -> Result<Self, TableError> {
        let table = Table::open(path, TableOpenMode::Read).map_err(|e| casa_err(path, e))?;
        let n_rows = table.n_rows() as usize;
        Ok(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            table,
            rows: (0..n_rows).collect(),
        })
    }

    /// Read `name` over the given rows of the underlying table.
    fn read(&mut self, name: &str, rows: &[usize]) -> Result<ArrayData, TableError> {
        let desc = self
            .table
            .get_col_desc(name)
            .map_err(|e| casa_err(&self.path, e))?;
        let kind = if desc.is_scalar() {
            CellKind::Scalar
        } else if is_matrix_column(&self.name, name) {
            CellKind::Matrix
        } else {
            CellKind::Vector
        };
        match desc.data_type() {
            GlueDataType::TpBool => self.read_numeric::<bool>(name, rows, kind).map(ArrayData::Bool),
            GlueDataType::TpInt => self.read_numeric::<i32>(name, rows, kind).map(ArrayData::Int32),
            GlueDataType::TpFloat => {
                self.read_numeric::<f32>(name, rows, kind).map(ArrayData::Float32)
            }
            GlueDataType::TpDouble => {
                self.read_numeric::<f64>(name, rows, kind).map(ArrayData::Float64)
            }
            GlueDataType::TpComplex => {
                self.read_numeric::<c32>(name, rows, kind).map(ArrayData::Complex64)
            }
            GlueDataType::TpDComplex => {
                self.read_numeric::<c64>(name, rows, kind).map(ArrayData::Complex128)
            }
            GlueDataType::TpString if kind == CellKind::Scalar => {
                self.read_strings(name, rows).map(ArrayData::Str)
            }
            other => Err(TableError::UnsupportedColumnType {
                column: name.to_string(),
                data_type: format!("{:?}", other),
            }),
        }
    }

    fn read_numeric<T>(
        &mut self,
        name: &str,
        rows: &[usize],
        kind: CellKind,
    ) -> Result<ArrayD<T>, TableError>
    where
        T: CasaScalarData + Clone + Default,
        Array2<T>: CasaDataType,
    {
        let path = self.path.clone();
        match kind {
            CellKind::Scalar => {
                let column: Vec<T> = self
                    .table
                    .get_col_as_vec(name)
                    .map_err(|e| casa_err(&path, e))?;
                let selected: Vec<T> = rows.iter().map(|&r| column[r].clone()).collect();
                Ok(Array1::from(selected).into_dyn())
            }
            CellKind::Vector => {
                let mut flat = vec![];
                let mut first_len = None;
                for &row in rows {
                    let cell: Vec<T> = self
                        .table
                        .get_cell_as_vec(name, row as u64)
                        .map_err(|e| casa_err(&path, e))?;
                    check_cell_shape(name, &mut first_len, vec![cell.len()], row)?;
                    flat.extend(cell);
                }
                let len = first_len.map(|(s, _)| s[0]).unwrap_or(0);
                stack(name, flat, &[rows.len(), len])
            }
            CellKind::Matrix => {
                let mut flat = vec![];
                let mut first_shape = None;
                for &row in rows {
                    let cell: Array2<T> = self
                        .table
                        .get_cell(name, row as u64)
                        .map_err(|e| casa_err(&path, e))?;
                    check_cell_shape(name, &mut first_shape, cell.shape().to_vec(), row)?;
                    flat.extend(cell.iter().cloned());
                }
                let (a, b) = first_shape
                    .map(|(s, _)| (s[0], s[1]))
                    .unwrap_or((0, 0));
                stack(name, flat, &[rows.len(), a, b])
            }
        }
    }

    fn read_strings(&mut self, name: &str, rows: &[usize]) -> Result<ArrayD<String>, TableError> {
        let mut values = Vec::with_capacity(rows.len());
        for &row in rows {
            let value: String = self
                .table
                .get_cell(name, row as u64)
                .map_err(|e| casa_err(&self.path, e))?;
            values.push(value);
        }
        Ok(Array1::from(values).into_dyn())
    }
}

/// Make sure every cell of an array column has the same shape as the first.
fn check_cell_shape(
    name: &str,
    first: &mut Option<(Vec<usize>, usize)>,
    shape: Vec<usize>,
    row: usize,
) -> Result<(), TableError> {
    match first {
        None => {
            *first = Some((shape, row));
            Ok(())
        }
        Some((first_shape, first_row)) if *first_shape != shape => Err(TableError::RaggedColumn {
            column: name.to_string(),
            first: first_shape.clone(),
            first_row: *first_row,
            other: shape,
            other_row: row,
        }),
        Some(_) => Ok(()),
    }
}

fn stack<T>(name: &str, flat: Vec<T>, shape: &[usize]) -> Result<ArrayD<T>, TableError> {
    let received = flat.len();
    ArrayD::from_shape_vec(IxDyn(shape), flat).map_err(|_| TableError::BadColumnLength {
        column: name.to_string(),
        expected: shape.iter().product(),
        received,
    })
}

impl TableCursor for CasaCursor {
    fn table_name(&self) -> String {
        self.path.display().to_string()
    }

    fn n_rows(&self) -> usize {
        self.rows.len()
    }

    fn column_names(&mut self) -> Result<Vec<String>, TableError> {
        self.table
            .column_names()
            .map_err(|e| casa_err(&self.path, e))
    }

    fn get_column(&mut self, name: &str) -> Result<ArrayData, TableError> {
        let rows = self.rows.clone();
        self.read(name, &rows)
    }

    fn get_cell(&mut self, name: &str, row: usize) -> Result<ArrayData, TableError> {
        let table_row = *self.rows.get(row).ok_or_else(|| TableError::BadRow {
            column: name.to_string(),
            row,
            num_rows: self.rows.len(),
        })?;
        Ok(self.read(name, &[table_row])?.index_row(0))
    }

    fn is_cell_defined(&mut self, name: &str, row: usize) -> bool {
        self.get_cell(name, row).is_ok()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use fixtures::{write_ms, NUM_CHANS, NUM_POLS};
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_query_main_reads_selected_rows() {
        let temp_dir = tempdir().unwrap();
        let ms_path = temp_dir.path().join("test.ms");
        write_ms(
            &ms_path,
            &[
                (10.0, 0, 1, 0, 0, 0),
                (10.0, 0, 2, 0, 1, 0),
                (11.0, 0, 1, 0, 0, 0),
            ],
            1,
        );
        let ms = CasaMeasurementSet::new(&ms_path);
        let predicate = Predicate {
            ddi: 0,
            state_ids: vec![0],
            field_id: Some(0),
        };
        let mut cursor = ms.query_main(Some(&predicate)).unwrap();
        assert_eq!(cursor.n_rows(), 2);
        assert_eq!(cursor.get_f64_column("TIME").unwrap(), vec![10.0, 11.0]);
        assert_eq!(cursor.get_i64_column("ANTENNA2").unwrap(), vec![1, 1]);

        let data = cursor.get_column("DATA").unwrap();
        assert_eq!(data.shape(), &[2, NUM_CHANS, NUM_POLS]);
        match data {
            // the second selected row is the third table row
            ArrayData::Complex64(a) => assert_eq!(a[[1, 0, 1]], c32::new(2.0, 1.0)),
            other => panic!("unexpected {:?}", other.dtype()),
        }
        assert_eq!(cursor.cell_shape("UVW", 0).unwrap(), Some(vec![3]));
        assert!(cursor.get_column("NOPE").is_err());
    }

    #[test]
    fn test_matrix_columns_depend_on_table() {
        assert!(is_matrix_column(MAIN_TABLE, "DATA"));
        assert!(is_matrix_column("FIELD", "PHASE_DIR"));
        assert!(is_matrix_column("POINTING", "DIRECTION"));
        assert!(!is_matrix_column("SOURCE", "DIRECTION"));
        assert!(!is_matrix_column("FIELD", "DATA"));
    }

    #[test]
    #[serial]
    fn test_open_subtable() {
        let temp_dir = tempdir().unwrap();
        let ms_path = temp_dir.path().join("test.ms");
        write_ms(&ms_path, &[(10.0, 0, 1, 0, 0, 0)], 2);
        let ms = CasaMeasurementSet::new(&ms_path);

        let mut field = ms.open_subtable("FIELD").unwrap();
        assert_eq!(field.n_rows(), 2);
        assert_eq!(
            field.get_str_column("NAME").unwrap(),
            vec!["field0".to_string(), "field1".to_string()]
        );
        assert_eq!(field.get_column("PHASE_DIR").unwrap().shape(), &[2, 1, 2]);

        assert!(matches!(
            ms.open_subtable("SOURCE"),
            Err(TableError::NoSuchSubtable(_))
        ));
    }
}
