// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reading tables, and reading/writing chunked array stores.

pub mod error;
pub mod table;
pub mod xds;
pub mod zarr;

pub use error::{DecodeError, TableError, ZarrError};

cfg_if::cfg_if! {
    if #[cfg(feature = "ms")] {
        pub mod casa;

        pub use casa::CasaMeasurementSet;
    }
}
