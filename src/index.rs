// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Map the rows of a (partition of a) main table onto a regular
//! `[time][baseline]` grid.

use std::fmt::{self, Display};

use itertools::Itertools;
use log::{debug, trace};
use ndarray::Array2;
use thiserror::Error;

use crate::io::{error::TableError, table::TableCursor};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("table {table} has no two-dimensional columns, so the number of channels and polarisations is unknown")]
    NoTwoDimensionalColumns { table: String },

    #[error("column {column} has {received} rows, but TIME has {expected}")]
    BadColumnLength {
        column: String,
        expected: usize,
        received: usize,
    },

    #[error(transparent)]
    Table(#[from] TableError),
}

/// An ordered pair of antenna ids.
///
/// Ordering is by `ant1`, then `ant2`, the same as the order of [`Baseline::key`]
/// for ids below 1000.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Baseline {
    pub ant1: i32,
    pub ant2: i32,
}

impl Baseline {
    pub fn new(ant1: i32, ant2: i32) -> Self {
        Self { ant1, ant2 }
    }

    /// The zero-padded `AAA_BBB` key of this baseline.
    pub fn key(&self) -> String {
        format!("{:03}_{:03}", self.ant1, self.ant2)
    }
}

impl Display for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Sorted, unique timestamps, with near-duplicates merged.
///
/// Each bin starts at a timestamp and holds every timestamp up to `tolerance`
/// after it. The bin's value is its first timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeAxis {
    times: Vec<f64>,
    tolerance: f64,
}

impl TimeAxis {
    /// Non-finite timestamps are ignored.
    pub fn from_times(times: &[f64], tolerance: f64) -> Self {
        let tolerance = tolerance.max(0.0);
        let mut sorted: Vec<f64> = times.iter().copied().filter(|t| t.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        let mut bins: Vec<f64> = vec![];
        for t in sorted {
            match bins.last() {
                Some(&start) if t - start <= tolerance => (),
                _ => bins.push(t),
            }
        }
        Self {
            times: bins,
            tolerance,
        }
    }

    /// The bin holding `time`, if any.
    pub fn index_of(&self, time: f64) -> Option<usize> {
        if !time.is_finite() {
            return None;
        }
        let idx = self.times.partition_point(|&t| t < time - self.tolerance);
        match self.times.get(idx) {
            Some(&t) if (t - time).abs() <= self.tolerance => Some(idx),
            _ => None,
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Where each row of a table lands on the `[time][baseline]` grid.
///
/// Rows which can't be placed (a negative antenna id, a non-finite time, or a
/// baseline which isn't on the axis) are marked invalid, and their indices
/// are out of range.
#[derive(Clone, Debug, PartialEq)]
pub struct RowIndex {
    /// The time bin of each row.
    pub time_idxs: Vec<usize>,
    /// The baseline of each row.
    pub baseline_idxs: Vec<usize>,
    pub valid: Vec<bool>,
    pub times: TimeAxis,
    pub baselines: Vec<Baseline>,
    /// The shape of the first two-dimensional cell, `[freq, pol]`.
    pub cell_shape: [usize; 2],
}

/// The `[freq, pol]` shape of the first two-dimensional cell in row 0.
fn infer_cell_shape<C: TableCursor + ?Sized>(cursor: &mut C) -> Result<[usize; 2], IndexError> {
    if cursor.n_rows() > 0 {
        for column in cursor.column_names()? {
            if let Some(&[freq, pol]) = cursor.cell_shape(&column, 0)?.as_deref() {
                trace!("{} has cells of shape [{}, {}]", column, freq, pol);
                return Ok([freq, pol]);
            }
        }
    }
    Err(IndexError::NoTwoDimensionalColumns {
        table: cursor.table_name(),
    })
}

fn antenna_ids<C: TableCursor + ?Sized>(
    cursor: &mut C,
    column: &str,
    expected: usize,
) -> Result<Vec<Option<i32>>, IndexError> {
    let ids = cursor.get_i64_column(column)?;
    if ids.len() != expected {
        return Err(IndexError::BadColumnLength {
            column: column.to_string(),
            expected,
            received: ids.len(),
        });
    }
    Ok(ids
        .into_iter()
        .map(|a| i32::try_from(a).ok().filter(|&a| a >= 0))
        .collect())
}

impl RowIndex {
    /// Index every row of `cursor`. The baseline axis is the sorted set of
    /// baselines present.
    pub fn build<C: TableCursor + ?Sized>(cursor: &mut C, tolerance: f64) -> Result<Self, IndexError> {
        Self::build_with_baselines(cursor, tolerance, None)
    }

    /// Like [`RowIndex::build`], but if `baselines` is given, use it as the
    /// baseline axis; rows on other baselines are invalid.
    pub fn build_with_baselines<C: TableCursor + ?Sized>(
        cursor: &mut C,
        tolerance: f64,
        baselines: Option<&[Baseline]>,
    ) -> Result<Self, IndexError> {
        let cell_shape = infer_cell_shape(cursor)?;
        let times = cursor.get_f64_column("TIME")?;
        let num_rows = times.len();
        let ant1 = antenna_ids(cursor, "ANTENNA1", num_rows)?;
        let ant2 = antenna_ids(cursor, "ANTENNA2", num_rows)?;

        let row_baselines: Vec<Option<Baseline>> = ant1
            .iter()
            .zip(ant2.iter())
            .map(|(a1, a2)| Some(Baseline::new((*a1)?, (*a2)?)))
            .collect();
        let baselines: Vec<Baseline> = match baselines {
            Some(b) => b.iter().copied().sorted().dedup().collect(),
            None => row_baselines.iter().flatten().copied().sorted().dedup().collect(),
        };
        let time_axis = TimeAxis::from_times(&times, tolerance);

        let num_times = time_axis.len();
        let num_baselines = baselines.len();
        let time_idxs: Vec<usize> = times
            .iter()
            .map(|&t| time_axis.index_of(t).unwrap_or(num_times))
            .collect();
        let baseline_idxs: Vec<usize> = row_baselines
            .iter()
            .map(|b| {
                b.and_then(|b| baselines.binary_search(&b).ok())
                    .unwrap_or(num_baselines)
            })
            .collect();
        let valid: Vec<bool> = time_idxs
            .iter()
            .zip(baseline_idxs.iter())
            .map(|(&t, &b)| t < num_times && b < num_baselines)
            .collect();

        let num_invalid = valid.iter().filter(|&&v| !v).count();
        if num_invalid > 0 {
            debug!(
                "{} of {} rows of {} can't be placed on the time/baseline grid",
                num_invalid,
                num_rows,
                cursor.table_name()
            );
        }

        Ok(Self {
            time_idxs,
            baseline_idxs,
            valid,
            times: time_axis,
            baselines,
            cell_shape,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.valid.len()
    }

    /// `(time bins, baselines)`
    pub fn shape(&self) -> (usize, usize) {
        (self.times.len(), self.baselines.len())
    }

    /// `(row, time index, baseline index)` of every valid row.
    pub fn valid_rows(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.valid
            .iter()
            .enumerate()
            .filter(|(_, v)| **v)
            .map(move |(row, _)| (row, self.time_idxs[row], self.baseline_idxs[row]))
    }

    /// Which `(time, baseline)` cells have a row.
    pub fn occupancy(&self) -> Array2<bool> {
        let mut occupancy = Array2::from_elem(self.shape(), false);
        for (_, t, b) in self.valid_rows() {
            occupancy[[t, b]] = true;
        }
        occupancy
    }

    /// The number of `(time, baseline)` cells without a row.
    pub fn num_missing_cells(&self) -> usize {
        self.occupancy().iter().filter(|&&o| !o).count()
    }

    pub fn baseline_ant1_ids(&self) -> Vec<i32> {
        self.baselines.iter().map(|b| b.ant1).collect()
    }

    pub fn baseline_ant2_ids(&self) -> Vec<i32> {
        self.baselines.iter().map(|b| b.ant2).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{c32, io::table::MemTable};
    use ndarray::{Array1, Array3};

    /// A main table with a 2-channel, 2-polarisation DATA column. Row `r` of
    /// DATA holds `r` in every real part.
    pub(crate) fn main_table(rows: &[(f64, i32, i32)]) -> MemTable {
        let n = rows.len();
        MemTable::new("MAIN", n)
            .with_column("TIME", rows.iter().map(|r| r.0).collect::<Array1<f64>>())
            .unwrap()
            .with_column("ANTENNA1", rows.iter().map(|r| r.1).collect::<Array1<i32>>())
            .unwrap()
            .with_column("ANTENNA2", rows.iter().map(|r| r.2).collect::<Array1<i32>>())
            .unwrap()
            .with_column(
                "DATA",
                Array3::from_shape_fn((n, 2, 2), |(r, c, p)| c32::new(r as f32, (c * 2 + p) as f32)),
            )
            .unwrap()
    }

    #[test]
    fn test_baseline_key() {
        assert_eq!(Baseline::new(1, 23).key(), "001_023");
        assert_eq!(Baseline::new(127, 4).to_string(), "127_004");
        assert!(Baseline::new(0, 5) < Baseline::new(1, 0));
    }

    #[test]
    fn test_time_axis_merges_within_tolerance() {
        let axis = TimeAxis::from_times(&[5.0, 1.0, 1.0005, 3.0, 1.0009, f64::NAN, 3.0], 1e-3);
        assert_eq!(axis.times(), &[1.0, 3.0, 5.0]);
        assert_eq!(axis.index_of(1.0009), Some(0));
        assert_eq!(axis.index_of(1.0), Some(0));
        assert_eq!(axis.index_of(5.0), Some(2));
        assert_eq!(axis.index_of(4.0), None);
        assert_eq!(axis.index_of(f64::INFINITY), None);

        let exact = TimeAxis::from_times(&[2.0, 1.0, 2.0], 0.0);
        assert_eq!(exact.times(), &[1.0, 2.0]);
        assert_eq!(exact.index_of(2.0), Some(1));
    }

    #[test]
    fn test_build_two_times_three_baselines() {
        let mut table = main_table(&[
            (10.0, 0, 1),
            (10.0, 1, 2),
            (11.0, 0, 2),
            (11.0, 0, 1),
        ]);
        let index = RowIndex::build(&mut table, 1e-3).unwrap();
        assert_eq!(index.shape(), (2, 3));
        assert_eq!(index.cell_shape, [2, 2]);
        assert_eq!(index.baseline_ant1_ids(), vec![0, 0, 1]);
        assert_eq!(index.baseline_ant2_ids(), vec![1, 2, 2]);
        assert_eq!(index.time_idxs, vec![0, 0, 1, 1]);
        assert_eq!(index.baseline_idxs, vec![0, 2, 1, 0]);
        assert_eq!(index.num_missing_cells(), 2);
        assert!(!index.occupancy()[[0, 1]]);
        assert!(!index.occupancy()[[1, 2]]);
    }

    #[test]
    fn test_row_order_doesnt_change_axes() {
        let rows = [(10.0, 0, 1), (10.0, 1, 2), (11.0, 0, 2), (12.0, 0, 1)];
        let mut reversed = rows;
        reversed.reverse();
        let a = RowIndex::build(&mut main_table(&rows), 1e-3).unwrap();
        let b = RowIndex::build(&mut main_table(&reversed), 1e-3).unwrap();
        assert_eq!(a.times, b.times);
        assert_eq!(a.baselines, b.baselines);
        assert_eq!(a.occupancy(), b.occupancy());
    }

    #[test]
    fn test_invalid_rows() {
        let mut table = main_table(&[(10.0, 0, 1), (10.0, -1, 1), (f64::NAN, 0, 1), (10.0, 2, 3)]);
        let index = RowIndex::build(&mut table, 1e-3).unwrap();
        assert_eq!(index.valid, vec![true, false, false, true]);
        assert_eq!(index.shape(), (1, 2));
        assert_eq!(index.valid_rows().map(|(r, _, _)| r).collect::<Vec<_>>(), vec![0, 3]);

        // A baseline axis that doesn't include 2-3.
        let axis = [Baseline::new(0, 1), Baseline::new(0, 2)];
        let index = RowIndex::build_with_baselines(&mut table, 1e-3, Some(&axis)).unwrap();
        assert_eq!(index.valid, vec![true, false, false, false]);
        assert_eq!(index.baseline_idxs[3], 2);
    }

    #[test]
    fn test_no_two_dimensional_columns() {
        let mut table = MemTable::new("MAIN", 1)
            .with_column("TIME", Array1::from(vec![1.0]))
            .unwrap()
            .with_column("ANTENNA1", Array1::from(vec![0i32]))
            .unwrap()
            .with_column("ANTENNA2", Array1::from(vec![1i32]))
            .unwrap()
            .with_column("UVW", ndarray::Array2::<f64>::zeros((1, 3)))
            .unwrap();
        assert!(matches!(
            RowIndex::build(&mut table, 1e-3),
            Err(IndexError::NoTwoDimensionalColumns { .. })
        ));

        // An undefined cell in row 0 doesn't count.
        let mut table = main_table(&[(1.0, 0, 1)]).with_undefined_cell("DATA", 0);
        assert!(matches!(
            RowIndex::build(&mut table, 1e-3),
            Err(IndexError::NoTwoDimensionalColumns { .. })
        ));
    }
}
