// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.

/// Speed of light \[metres/second\]
pub const VEL_C: f64 = 299_792_458.0;

/// Seconds per day (86400)
pub const DAYSEC: f64 = 86400.0;

/// Seconds between the MJD epoch (1858-11-17) and the Unix epoch (1970-01-01).
/// casacore stores `TIME` as MJD seconds.
pub const MJD_UNIX_OFFSET_SECONDS: f64 = 40587.0 * DAYSEC;

/// Default tolerance \[seconds\] when merging near-identical timestamps into one
/// time bin.
pub const DEFAULT_TIME_TOLERANCE: f64 = 1e-3;

/// Value of `__type` in an encoded array attribute.
pub const ENCODED_ARRAY_TYPE: &str = "numpy.ndarray";

/// Child stores of a dataset live in sibling directories named
/// `<CHILD_STORE_PREFIX><CHILD_STORE_SEPARATOR><key>`.
pub const CHILD_STORE_PREFIX: &str = "_attrs_xds";
pub const CHILD_STORE_SEPARATOR: &str = "__";

/// Suffix of the main visibility store of a partition.
pub const MAIN_STORE_SUFFIX: &str = "_MAIN";
/// Suffix of the antenna store of a partition.
pub const ANTENNA_STORE_SUFFIX: &str = "_ANTENNA";

/// `STATE_ID` used by measurement sets with an empty `STATE` table.
pub const NO_STATE_ID: i32 = -1;

pub(crate) const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
pub(crate) const PKG_NAME: &str = env!("CARGO_PKG_NAME");
