// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read-only access to measurement set tables.
//!
//! A [`MeasurementSource`] hands out [`TableCursor`]s: one over the rows of the
//! main table matching a [`Predicate`], or one over a whole subtable. Each call
//! opens a fresh cursor, so partitions converted concurrently never share a
//! live cursor.
//!
//! [`MemMeasurementSet`] keeps every table in memory. With the `ms` feature,
//! [`crate::io::casa::CasaMeasurementSet`] reads a measurement set on disk.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
};

use itertools::Itertools;

use super::error::TableError;
use crate::dataset::ArrayData;

/// A set of rows of one table.
pub trait TableCursor {
    /// A name for this table, used in messages.
    fn table_name(&self) -> String;

    /// The number of (selected) rows.
    fn n_rows(&self) -> usize;

    fn column_names(&mut self) -> Result<Vec<String>, TableError>;

    /// Read a whole column over the selected rows. The first axis of the
    /// result is the row axis; array-valued cells add trailing axes.
    fn get_column(&mut self, name: &str) -> Result<ArrayData, TableError>;

    /// Read a single cell; `row` indexes the selected rows.
    fn get_cell(&mut self, name: &str, row: usize) -> Result<ArrayData, TableError>;

    fn is_cell_defined(&mut self, name: &str, row: usize) -> bool;

    /// The shape of a cell, or [`None`] if the cell is undefined.
    fn cell_shape(&mut self, name: &str, row: usize) -> Result<Option<Vec<usize>>, TableError> {
        if !self.is_cell_defined(name, row) {
            return Ok(None);
        }
        Ok(Some(self.get_cell(name, row)?.shape().to_vec()))
    }

    fn get_f64_column(&mut self, name: &str) -> Result<Vec<f64>, TableError> {
        self.get_column(name)?
            .as_f64_vec()
            .ok_or_else(|| TableError::WrongColumnType {
                column: name.to_string(),
                expected: "real",
            })
    }

    fn get_i64_column(&mut self, name: &str) -> Result<Vec<i64>, TableError> {
        self.get_column(name)?
            .as_i64_vec()
            .ok_or_else(|| TableError::WrongColumnType {
                column: name.to_string(),
                expected: "integer",
            })
    }

    fn get_str_column(&mut self, name: &str) -> Result<Vec<String>, TableError> {
        self.get_column(name)?
            .as_str_vec()
            .ok_or_else(|| TableError::WrongColumnType {
                column: name.to_string(),
                expected: "string",
            })
    }
}

/// Something that can be opened as a measurement set, possibly many times
/// over from different threads.
pub trait MeasurementSource: Sync {
    type Cursor: TableCursor;

    /// Open the main table, keeping only the rows that match `predicate` (all
    /// rows if [`None`]).
    fn query_main(&self, predicate: Option<&Predicate>) -> Result<Self::Cursor, TableError>;

    /// Open a subtable, e.g. `ANTENNA`.
    fn open_subtable(&self, name: &str) -> Result<Self::Cursor, TableError>;

    /// A description of this source, used in messages.
    fn describe(&self) -> String;
}

/// Row selection over `DATA_DESC_ID`, `STATE_ID` and `FIELD_ID`.
///
/// Rows match if they have the data description, any of the state ids (or any
/// state at all, if `state_ids` is empty), and the field id, if one is given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Predicate {
    pub ddi: i32,
    pub state_ids: Vec<i32>,
    pub field_id: Option<i32>,
}

impl Predicate {
    pub fn matches(&self, ddi: i64, state_id: i64, field_id: i64) -> bool {
        ddi == self.ddi as i64
            && (self.state_ids.is_empty() || self.state_ids.iter().any(|&s| s as i64 == state_id))
            && self.field_id.map_or(true, |f| f as i64 == field_id)
    }

    /// The indices of the rows of `cursor` which match.
    pub fn matching_rows<C: TableCursor + ?Sized>(
        &self,
        cursor: &mut C,
    ) -> Result<Vec<usize>, TableError> {
        let n_rows = cursor.n_rows();
        let ddis = cursor.get_i64_column("DATA_DESC_ID")?;
        let states = if self.state_ids.is_empty() {
            vec![0; n_rows]
        } else {
            cursor.get_i64_column("STATE_ID")?
        };
        let fields = if self.field_id.is_none() {
            vec![0; n_rows]
        } else {
            cursor.get_i64_column("FIELD_ID")?
        };
        Ok(ddis
            .iter()
            .zip(states.iter())
            .zip(fields.iter())
            .enumerate()
            .filter(|(_, ((d, s), f))| self.matches(**d, **s, **f))
            .map(|(i, _)| i)
            .collect())
    }
}

impl Display for Predicate {
    /// The equivalent TaQL `where` clause.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "where (DATA_DESC_ID = {})", self.ddi)?;
        if !self.state_ids.is_empty() {
            write!(
                f,
                " AND (STATE_ID = {})",
                self.state_ids.iter().join(" OR STATE_ID = ")
            )?;
        }
        if let Some(field_id) = self.field_id {
            write!(f, " AND (FIELD_ID = {})", field_id)?;
        }
        Ok(())
    }
}

/// A table held in memory, column by column.
#[derive(Clone, Debug, Default)]
pub struct MemTable {
    name: String,
    n_rows: usize,
    columns: BTreeMap<String, ArrayData>,
    undefined: BTreeSet<(String, usize)>,
}

impl MemTable {
    pub fn new(name: &str, n_rows: usize) -> Self {
        Self {
            name: name.to_string(),
            n_rows,
            ..Default::default()
        }
    }

    /// Add a column. The first axis of `data` must have one entry per row.
    pub fn with_column<T: Into<ArrayData>>(mut self, name: &str, data: T) -> Result<Self, TableError> {
        let data = data.into();
        let received = data.shape().first().copied().unwrap_or(0);
        if received != self.n_rows {
            return Err(TableError::BadColumnLength {
                column: name.to_string(),
                expected: self.n_rows,
                received,
            });
        }
        self.columns.insert(name.to_string(), data);
        Ok(self)
    }

    /// Mark a cell as undefined, as casacore does for unwritten cells of
    /// variable-shaped columns.
    pub fn with_undefined_cell(mut self, name: &str, row: usize) -> Self {
        self.undefined.insert((name.to_string(), row));
        self
    }

    /// A new table with only the given rows.
    pub fn select(&self, rows: &[usize]) -> MemTable {
        let undefined = rows
            .iter()
            .enumerate()
            .flat_map(|(new_row, &old_row)| {
                self.undefined
                    .iter()
                    .filter(move |(_, r)| *r == old_row)
                    .map(move |(name, _)| (name.clone(), new_row))
            })
            .collect();
        MemTable {
            name: self.name.clone(),
            n_rows: rows.len(),
            columns: self
                .columns
                .iter()
                .map(|(name, data)| (name.clone(), data.select_rows(rows)))
                .collect(),
            undefined,
        }
    }

    fn column(&self, name: &str) -> Result<&ArrayData, TableError> {
        self.columns.get(name).ok_or_else(|| TableError::NoSuchColumn {
            table: self.name.clone(),
            column: name.to_string(),
        })
    }
}

impl TableCursor for MemTable {
    fn table_name(&self) -> String {
        self.name.clone()
    }

    fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn column_names(&mut self) -> Result<Vec<String>, TableError> {
        Ok(self.columns.keys().cloned().collect())
    }

    fn get_column(&mut self, name: &str) -> Result<ArrayData, TableError> {
        self.column(name).cloned()
    }

    fn get_cell(&mut self, name: &str, row: usize) -> Result<ArrayData, TableError> {
        let column = self.column(name)?;
        if row >= self.n_rows {
            return Err(TableError::BadRow {
                column: name.to_string(),
                row,
                num_rows: self.n_rows,
            });
        }
        Ok(column.index_row(row))
    }

    fn is_cell_defined(&mut self, name: &str, row: usize) -> bool {
        self.columns.contains_key(name)
            && row < self.n_rows
            && !self.undefined.contains(&(name.to_string(), row))
    }
}

/// A measurement set held entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct MemMeasurementSet {
    pub main: MemTable,
    pub subtables: BTreeMap<String, MemTable>,
}

impl MemMeasurementSet {
    pub fn new(main: MemTable) -> Self {
        Self {
            main,
            subtables: BTreeMap::new(),
        }
    }

    pub fn with_subtable(mut self, table: MemTable) -> Self {
        self.subtables.insert(table.name.clone(), table);
        self
    }
}

impl MeasurementSource for MemMeasurementSet {
    type Cursor = MemTable;

    fn query_main(&self, predicate: Option<&Predicate>) -> Result<MemTable, TableError> {
        let mut main = self.main.clone();
        match predicate {
            None => Ok(main),
            Some(predicate) => {
                let rows = predicate.matching_rows(&mut main)?;
                Ok(main.select(&rows))
            }
        }
    }

    fn open_subtable(&self, name: &str) -> Result<MemTable, TableError> {
        self.subtables
            .get(name)
            .cloned()
            .ok_or_else(|| TableError::NoSuchSubtable(name.to_string()))
    }

    fn describe(&self) -> String {
        format!("in-memory measurement set ({} rows)", self.main.n_rows)
    }
}
