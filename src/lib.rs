// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Convert CASA Measurement Sets (v2) into "processing sets": one chunked,
//! compressed Zarr dataset per (data description, state, field) partition,
//! with visibilities reshaped from rows into dense
//! `[time][baseline][freq][pol]` arrays. Also reads such stores back into
//! labeled datasets, and builds empty sky-image datasets.

#[allow(non_camel_case_types)]
pub type c32 = num_complex::Complex<f32>;
#[allow(non_camel_case_types)]
pub type c64 = num_complex::Complex<f64>;

pub mod config;
pub mod constants;
pub mod dataset;
pub mod densify;
pub mod image;
pub mod index;
pub mod io;
pub mod partition;
pub mod processing_set;
pub mod subtables;

// Re-exports.
pub use config::{ChunkSpec, ConversionConfig, PartitionScheme};
pub use dataset::{ArrayData, AttrValue, Attrs, DType, Dataset, Variable};
pub use densify::densify_column;
pub use image::{make_empty_sky_image, ImageError, Projection, SinProjection, SkyImageParams};
pub use index::{Baseline, RowIndex, TimeAxis};
pub use io::{
    table::{MeasurementSource, MemMeasurementSet, MemTable, Predicate, TableCursor},
    xds::{read_xds, write_xds},
    zarr::{Compressor, Encoding, WriteMode},
};
pub use partition::{
    build_partition, convert_and_write_partition, PartitionError, PartitionKey, PartitionOutcome,
    StateSelection,
};
pub use processing_set::{
    convert_msv2_to_processing_set, enumerate_partitions, ConversionError, ProcessingSetReport,
};

pub use ndarray;
pub use num_complex;
pub use num_complex::Complex;
pub use rayon;

// If "ms" is enabled, re-export rubbl_casatables here.
cfg_if::cfg_if! {
    if #[cfg(feature = "ms")] {
        pub use rubbl_casatables;
        pub use io::casa::CasaMeasurementSet;
        pub use processing_set::convert_ms;
    }
}
