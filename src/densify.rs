// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scatter row-ordered columns onto a dense `[time][baseline][...]` grid.

use ndarray::{ArrayD, Axis, IxDyn};
use thiserror::Error;

use crate::{
    c32, c64,
    dataset::{remap_array, ArrayData},
    index::RowIndex,
};

#[derive(Error, Debug)]
pub enum DensifyError {
    #[error("column {column} has {received} rows, but the index has {expected}")]
    RowCountMismatch {
        column: String,
        expected: usize,
        received: usize,
    },

    #[error("column {column} has no row axis")]
    NoRowAxis { column: String },
}

/// The value of a grid cell that no row lands in.
pub trait Sentinel: Clone {
    fn sentinel() -> Self;
}

impl Sentinel for f32 {
    fn sentinel() -> Self {
        f32::NAN
    }
}

impl Sentinel for f64 {
    fn sentinel() -> Self {
        f64::NAN
    }
}

impl Sentinel for c32 {
    fn sentinel() -> Self {
        c32::new(f32::NAN, f32::NAN)
    }
}

impl Sentinel for c64 {
    fn sentinel() -> Self {
        c64::new(f64::NAN, f64::NAN)
    }
}

/// Missing samples are flagged.
impl Sentinel for bool {
    fn sentinel() -> Self {
        true
    }
}

impl Sentinel for i32 {
    fn sentinel() -> Self {
        -1
    }
}

impl Sentinel for i64 {
    fn sentinel() -> Self {
        -1
    }
}

impl Sentinel for String {
    fn sentinel() -> Self {
        String::new()
    }
}

/// Place each valid row of `data` at its `[time, baseline]` cell of a grid of
/// shape `[times, baselines] + data.shape()[1..]`. Every other cell holds the
/// [`Sentinel`]. If two rows land in the same cell, the later row wins.
pub fn densify<T: Sentinel>(
    column: &str,
    data: &ArrayD<T>,
    index: &RowIndex,
) -> Result<ArrayD<T>, DensifyError> {
    let num_rows = *data.shape().first().ok_or_else(|| DensifyError::NoRowAxis {
        column: column.to_string(),
    })?;
    if num_rows != index.num_rows() {
        return Err(DensifyError::RowCountMismatch {
            column: column.to_string(),
            expected: index.num_rows(),
            received: num_rows,
        });
    }

    let (num_times, num_baselines) = index.shape();
    let mut shape = vec![num_times, num_baselines];
    shape.extend_from_slice(&data.shape()[1..]);
    let mut dense = ArrayD::from_elem(IxDyn(&shape), T::sentinel());
    for (row, t, b) in index.valid_rows() {
        dense
            .index_axis_mut(Axis(0), t)
            .index_axis_move(Axis(0), b)
            .assign(&data.index_axis(Axis(0), row));
    }
    Ok(dense)
}

/// [`densify`] for any element type.
pub fn densify_column(
    column: &str,
    data: &ArrayData,
    index: &RowIndex,
) -> Result<ArrayData, DensifyError> {
    Ok(remap_array!(data, a => densify(column, a, index)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{index::tests::main_table, io::table::TableCursor};
    use ndarray::{array, Array1, Array2};

    const ROWS: [(f64, i32, i32); 4] = [(10.0, 0, 1), (10.0, 1, 2), (11.0, 0, 2), (11.0, 0, 1)];

    #[test]
    fn test_two_missing_cells_are_nan() {
        let mut table = main_table(&ROWS);
        let index = RowIndex::build(&mut table, 1e-3).unwrap();
        let data = table.get_column("DATA").unwrap();
        let dense = densify_column("DATA", &data, &index).unwrap();
        assert_eq!(dense.shape(), &[2, 3, 2, 2]);
        let vis = match dense {
            ArrayData::Complex64(a) => a,
            other => panic!("unexpected {:?}", other.dtype()),
        };
        let nan_cells: Vec<(usize, usize)> = (0..2)
            .flat_map(|t| (0..3).map(move |b| (t, b)))
            .filter(|&(t, b)| vis[[t, b, 0, 0]].re.is_nan())
            .collect();
        assert_eq!(nan_cells, vec![(0, 1), (1, 2)]);
        // Row 2 is (11.0, 0, 2).
        assert_eq!(vis[[1, 1, 1, 0]], c32::new(2.0, 2.0));
    }

    #[test]
    fn test_shape_is_independent_of_row_order() {
        for perm in [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]] {
            let rows: Vec<_> = perm.iter().map(|&i| ROWS[i]).collect();
            let mut table = main_table(&rows);
            let index = RowIndex::build(&mut table, 1e-3).unwrap();
            let weights = Array2::from_shape_fn((rows.len(), 2), |(r, p)| (perm[r] * 2 + p) as f32);
            let dense = densify("WEIGHT", &weights.into_dyn(), &index).unwrap();
            assert_eq!(dense.shape(), &[2, 3, 2]);
            // The value in each cell follows its row, wherever the row was.
            assert_eq!(dense[[1, 1, 1]], 5.0);
            assert_eq!(dense[[0, 2, 0]], 2.0);
            assert!(dense[[0, 1, 0]].is_nan());
        }
    }

    #[test]
    fn test_non_float_sentinels() {
        let mut table = main_table(&ROWS);
        let index = RowIndex::build(&mut table, 1e-3).unwrap();

        let flags = ArrayData::from(Array1::from_elem(4, false));
        match densify_column("FLAG", &flags, &index).unwrap() {
            ArrayData::Bool(a) => {
                assert_eq!(a.iter().filter(|&&f| f).count(), 2);
                assert!(a[[0, 1]]);
            }
            other => panic!("unexpected {:?}", other.dtype()),
        }

        let ids = ArrayData::from(array![7i64, 7, 7, 7]);
        match densify_column("ID", &ids, &index).unwrap() {
            ArrayData::Int64(a) => assert_eq!(a[[1, 2]], -1),
            other => panic!("unexpected {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_later_row_wins_a_shared_cell() {
        for (rows, tolerance) in [
            ([(10.0, 0, 1), (10.0, 0, 1)], 0.0),
            ([(10.0, 0, 1), (10.0005, 0, 1)], 1e-3),
            ([(10.0005, 0, 1), (10.0, 0, 1)], 1e-3),
            ([(10.5, 0, 1), (10.0, 0, 1)], 1.0),
        ] {
            let mut table = main_table(&rows);
            let index = RowIndex::build(&mut table, tolerance).unwrap();
            assert_eq!(index.shape(), (1, 1));
            let dense = densify("X", &array![1.0, 2.0].into_dyn(), &index).unwrap();
            assert_eq!(dense, array![[2.0]].into_dyn());
        }

        // Whichever rows a bin gathers, its cell holds the last of them.
        let rows = [(10.0, 0, 1), (10.4, 0, 1), (10.8, 0, 1)];
        let data = array![1.0, 2.0, 3.0].into_dyn();
        let mut table = main_table(&rows);
        let index = RowIndex::build(&mut table, 0.5).unwrap();
        assert_eq!(densify("X", &data, &index).unwrap(), array![[2.0], [3.0]].into_dyn());
        let index = RowIndex::build(&mut table, 1.0).unwrap();
        assert_eq!(densify("X", &data, &index).unwrap(), array![[3.0]].into_dyn());
    }

    #[test]
    fn test_invalid_rows_are_dropped() {
        let mut table = main_table(&[(10.0, 0, 1), (10.0, -1, 1)]);
        let index = RowIndex::build(&mut table, 1e-3).unwrap();
        let dense = densify("X", &array![1.0, 2.0].into_dyn(), &index).unwrap();
        assert_eq!(dense, array![[1.0]].into_dyn());
    }

    #[test]
    fn test_row_count_mismatch() {
        let mut table = main_table(&ROWS);
        let index = RowIndex::build(&mut table, 1e-3).unwrap();
        let result = densify("X", &array![1.0, 2.0].into_dyn(), &index);
        assert!(matches!(
            result,
            Err(DensifyError::RowCountMismatch {
                expected: 4,
                received: 2,
                ..
            })
        ));
        let result = densify("X", &ndarray::arr0(1.0).into_dyn(), &index);
        assert!(matches!(result, Err(DensifyError::NoRowAxis { .. })));
    }
}
