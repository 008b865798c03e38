// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Settings for a measurement set conversion.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::BufReader,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    constants::DEFAULT_TIME_TOLERANCE,
    io::{
        error::ZarrError,
        zarr::{Compressor, Encoding, WriteMode},
    },
};

/// How the rows of a measurement set are split into partitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    /// One partition per data description, observing intent and field. States
    /// sharing an `OBS_MODE` are grouped together.
    #[default]
    DdiIntentField,
    /// One partition per data description and state.
    DdiState,
}

/// Chunk length per dimension name. Dimensions not listed are not chunked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkSpec(pub BTreeMap<String, usize>);

impl Default for ChunkSpec {
    fn default() -> Self {
        ChunkSpec(
            [("time", 400), ("baseline", 200), ("freq", 100), ("pol", 2)]
                .into_iter()
                .map(|(d, n)| (d.to_string(), n))
                .collect(),
        )
    }
}

impl ChunkSpec {
    /// The chunk shape of an array with these dimensions and shape. Chunks
    /// never exceed the array, and are at least one long.
    pub fn chunk_shape(&self, dims: &[String], shape: &[usize]) -> Vec<usize> {
        dims.iter()
            .zip(shape)
            .map(|(dim, &len)| self.0.get(dim).copied().unwrap_or(len).min(len).max(1))
            .collect()
    }
}

/// Everything that controls a conversion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub scheme: PartitionScheme,

    pub chunks: ChunkSpec,

    pub compressor: Compressor,

    /// Convert partitions on the rayon thread pool.
    pub parallel: bool,

    /// Replace existing output stores. If false, an existing store fails that
    /// partition.
    pub overwrite: bool,

    /// Main table column -> data variable name. Columns not listed here are
    /// not converted.
    pub column_rename: BTreeMap<String, String>,

    /// Main table columns to leave out.
    pub ignore_cols: BTreeSet<String>,

    /// Timestamps closer than this \[seconds\] share a time bin.
    pub time_tolerance: f64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        let column_rename = [
            ("DATA", "VIS"),
            ("CORRECTED_DATA", "VIS_CORRECTED"),
            ("MODEL_DATA", "VIS_MODEL"),
            ("WEIGHT_SPECTRUM", "WEIGHT"),
            ("WEIGHT", "WEIGHT"),
            ("SIGMA_SPECTRUM", "SIGMA"),
            ("SIGMA", "SIGMA"),
            ("FLAG", "FLAG"),
            ("UVW", "UVW"),
            ("EXPOSURE", "EXPOSURE"),
            ("TIME_CENTROID", "TIME_CENTROID"),
        ]
        .into_iter()
        .map(|(c, v)| (c.to_string(), v.to_string()))
        .collect();
        Self {
            scheme: PartitionScheme::default(),
            chunks: ChunkSpec::default(),
            compressor: Compressor::default(),
            parallel: false,
            overwrite: false,
            column_rename,
            ignore_cols: BTreeSet::new(),
            time_tolerance: DEFAULT_TIME_TOLERANCE,
        }
    }
}

impl ConversionConfig {
    /// Read a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<T: AsRef<Path>>(path: T) -> Result<Self, ZarrError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn encoding(&self) -> Encoding {
        Encoding {
            chunks: self.chunks.clone(),
            compressor: self.compressor,
        }
    }

    pub fn write_mode(&self) -> WriteMode {
        if self.overwrite {
            WriteMode::Overwrite
        } else {
            WriteMode::CreateNew
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_chunk_shape() {
        let chunks = ChunkSpec::default();
        let dims: Vec<String> = ["time", "baseline", "freq", "uvw_label"]
            .iter()
            .map(|d| d.to_string())
            .collect();
        assert_eq!(
            chunks.chunk_shape(&dims, &[1000, 50, 768, 3]),
            vec![400, 50, 100, 3]
        );
        assert_eq!(chunks.chunk_shape(&dims[..1], &[0]), vec![1]);
    }

    #[test]
    fn test_partial_json_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"scheme": "ddi_state", "parallel": true, "compressor": {{"id": "none"}},
               "chunks": {{"time": 10}}, "ignore_cols": ["FLAG"]}}"#
        )
        .unwrap();
        let config = ConversionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.scheme, PartitionScheme::DdiState);
        assert!(config.parallel);
        assert!(!config.overwrite);
        assert_eq!(config.compressor, Compressor::None);
        assert_eq!(config.chunks.0.len(), 1);
        assert!(config.ignore_cols.contains("FLAG"));
        assert_eq!(config.column_rename["DATA"], "VIS");
        assert_eq!(config.write_mode(), WriteMode::CreateNew);
    }

    #[test]
    fn test_zlib_compressor_json() {
        let config: ConversionConfig =
            serde_json::from_str(r#"{"compressor": {"id": "zlib", "level": 5}}"#).unwrap();
        assert_eq!(config.compressor, Compressor::Zlib { level: 5 });
    }
}
