// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Convert a whole measurement set into a processing set: one pair of stores
//! per partition key.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use itertools::iproduct;
use log::{info, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    config::{ConversionConfig, PartitionScheme},
    io::table::MeasurementSource,
    partition::{
        convert_and_write_partition, PartitionError, PartitionKey, PartitionOutcome,
        StateSelection,
    },
    subtables::{self, SubtableError},
};

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("partitions {first} and {second} would both write to {path}")]
    DuplicateOutput {
        first: String,
        second: String,
        path: PathBuf,
    },

    #[error("couldn't convert partition {key}: {source}")]
    Partition {
        key: String,
        #[source]
        source: PartitionError,
    },

    #[error(transparent)]
    Subtable(#[from] SubtableError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Every partition key of a measurement set: data descriptions × state groups
/// × fields.
pub fn enumerate_partitions<M: MeasurementSource + ?Sized>(
    source: &M,
    scheme: PartitionScheme,
) -> Result<Vec<PartitionKey>, SubtableError> {
    let num_ddis = subtables::num_rows(source, "DATA_DESCRIPTION")? as i32;
    let num_fields = subtables::num_rows(source, "FIELD")? as i32;
    let state_groups: Vec<(StateSelection, Option<String>)> = match scheme {
        PartitionScheme::DdiIntentField => subtables::get_unique_intents(source)?
            .into_iter()
            .map(|(intent, ids)| {
                let intent = if intent.is_empty() { None } else { Some(intent) };
                (StateSelection::Group(ids), intent)
            })
            .collect(),
        PartitionScheme::DdiState => subtables::state_ids(source)?
            .into_iter()
            .map(|id| (StateSelection::Single(id), None))
            .collect(),
    };

    Ok(iproduct!(0..num_ddis, state_groups.iter(), 0..num_fields)
        .map(|(ddi, (state, intent), field_id)| PartitionKey {
            ddi,
            state: state.clone(),
            field_id: Some(field_id),
            intent: intent.clone(),
        })
        .collect())
}

/// One unit of work: a partition and the main store it will write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTask {
    pub key: PartitionKey,
    pub output: PathBuf,
}

/// Make a task per key, checking that no two tasks write to the same place.
pub fn plan_tasks(
    keys: Vec<PartitionKey>,
    outfile: &Path,
) -> Result<Vec<PartitionTask>, ConversionError> {
    let mut outputs: BTreeMap<PathBuf, String> = BTreeMap::new();
    let mut tasks = Vec::with_capacity(keys.len());
    for key in keys {
        let output = key.main_store(outfile);
        if let Some(first) = outputs.insert(output.clone(), key.to_string()) {
            return Err(ConversionError::DuplicateOutput {
                first,
                second: key.to_string(),
                path: output,
            });
        }
        tasks.push(PartitionTask { key, output });
    }
    Ok(tasks)
}

/// The outcome of every partition of a conversion, in enumeration order.
#[derive(Debug, Default)]
pub struct ProcessingSetReport {
    pub outcomes: Vec<(PartitionKey, Result<PartitionOutcome, PartitionError>)>,
}

impl ProcessingSetReport {
    pub fn num_written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Ok(PartitionOutcome::Written(_))))
            .count()
    }

    pub fn num_empty(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Ok(PartitionOutcome::Empty)))
            .count()
    }

    /// Partitions which failed on their own.
    pub fn failures(&self) -> impl Iterator<Item = (&PartitionKey, &PartitionError)> {
        self.outcomes
            .iter()
            .filter_map(|(key, r)| r.as_ref().err().map(|e| (key, e)))
    }
}

/// Convert every partition of `source` into stores under `outfile`.
///
/// A partition that fails on its own (several fields, an existing store) is
/// logged and recorded in the report; the other partitions carry on. A fatal
/// error (an unreadable subtable) is returned. In parallel mode all
/// partitions run to completion before it is returned.
pub fn convert_msv2_to_processing_set<M: MeasurementSource + ?Sized>(
    source: &M,
    outfile: &Path,
    config: &ConversionConfig,
) -> Result<ProcessingSetReport, ConversionError> {
    let start = Instant::now();
    let keys = enumerate_partitions(source, config.scheme)?;
    let tasks = plan_tasks(keys, outfile)?;
    info!(
        "Converting {} into {} ({} partitions, {})",
        source.describe(),
        outfile.display(),
        tasks.len(),
        if config.parallel { "parallel" } else { "sequential" }
    );
    fs::create_dir_all(outfile)?;

    let run = |task: &PartitionTask| {
        let result = convert_and_write_partition(source, outfile, &task.key, config);
        if let Err(e) = &result {
            warn!("Partition {} failed: {}", task.key, e);
        }
        (task.key.clone(), result)
    };

    let mut outcomes = Vec::with_capacity(tasks.len());
    if config.parallel {
        let results: Vec<_> = tasks.par_iter().map(run).collect();
        for (key, result) in results {
            match result {
                Err(e) if e.is_fatal() => {
                    return Err(ConversionError::Partition {
                        key: key.to_string(),
                        source: e,
                    })
                }
                result => outcomes.push((key, result)),
            }
        }
    } else {
        for task in &tasks {
            match run(task) {
                (key, Err(e)) if e.is_fatal() => {
                    return Err(ConversionError::Partition {
                        key: key.to_string(),
                        source: e,
                    })
                }
                outcome => outcomes.push(outcome),
            }
        }
    }

    let report = ProcessingSetReport { outcomes };
    info!(
        "Wrote {} partitions ({} empty, {} failed) in {:?}",
        report.num_written(),
        report.num_empty(),
        report.failures().count(),
        start.elapsed()
    );
    Ok(report)
}

cfg_if::cfg_if! {
    if #[cfg(feature = "ms")] {
        use crate::io::casa::CasaMeasurementSet;

        /// Convert the casacore measurement set at `infile`.
        pub fn convert_ms<T: AsRef<Path>, U: AsRef<Path>>(
            infile: T,
            outfile: U,
            config: &ConversionConfig,
        ) -> Result<ProcessingSetReport, ConversionError> {
            let source = CasaMeasurementSet::new(infile);
            convert_msv2_to_processing_set(&source, outfile.as_ref(), config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::{
            error::ZarrError,
            table::{MemMeasurementSet, MemTable},
            xds::read_xds,
        },
        partition::tests::{main_table, test_ms, Row},
        subtables::tests::with_subtables,
    };
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    /// Rows for two partitions: data description 0 with the two
    /// `OBSERVE_TARGET` states on field 0, and data description 1 with the
    /// `CALIBRATE_PHASE` state on field 1.
    const ROWS: [Row; 5] = [
        (10.0, 0, 1, 0, 0, 0),
        (10.0, 1, 2, 0, 0, 0),
        (11.0, 0, 1, 0, 2, 0),
        (10.0, 0, 1, 1, 1, 1),
        (12.0, 0, 2, 1, 1, 1),
    ];

    fn store_names(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_enumerate_cross_product() {
        let ms = test_ms(&ROWS);
        let keys = enumerate_partitions(&ms, PartitionScheme::DdiIntentField).unwrap();
        // 2 data descriptions × 2 intents × 2 fields
        assert_eq!(keys.len(), 8);
        assert_eq!(keys[0].file_name(), "ddi_0_state_id_0_2_field_id_0");
        assert_eq!(keys[0].intent.as_deref(), Some("OBSERVE_TARGET"));
        assert_eq!(keys[3].file_name(), "ddi_0_state_id_1_field_id_1");

        let keys = enumerate_partitions(&ms, PartitionScheme::DdiState).unwrap();
        assert_eq!(keys.len(), 2 * 3 * 2);
        let names: BTreeSet<String> = keys.iter().map(|k| k.file_name()).collect();
        assert_eq!(names.len(), keys.len());
        assert!(keys.iter().all(|k| k.intent.is_none()));
    }

    #[test]
    fn test_empty_state_table() {
        let ms = with_subtables(MemMeasurementSet::new(main_table(&ROWS)), 1, 2, &[]);
        let keys = enumerate_partitions(&ms, PartitionScheme::DdiIntentField).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].state, StateSelection::Group(vec![-1]));
        assert_eq!(keys[0].intent, None);
        assert_eq!(keys[1].file_name(), "ddi_0_state_id_-1_field_id_1");
    }

    #[test]
    fn test_duplicate_outputs() {
        let key = PartitionKey {
            ddi: 0,
            state: StateSelection::Single(0),
            field_id: Some(0),
            intent: None,
        };
        let mut other = key.clone();
        other.state = StateSelection::Group(vec![0]);
        let result = plan_tasks(vec![key, other], Path::new("/out"));
        assert!(matches!(
            result,
            Err(ConversionError::DuplicateOutput { .. })
        ));
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let ms = test_ms(&ROWS);
        let mut reports = vec![];
        let mut names = vec![];
        for parallel in [false, true] {
            let temp_dir = tempdir().unwrap();
            let config = ConversionConfig {
                parallel,
                ..Default::default()
            };
            let report = convert_msv2_to_processing_set(&ms, temp_dir.path(), &config).unwrap();
            assert_eq!(report.num_written(), 2);
            assert_eq!(report.num_empty(), 6);
            assert_eq!(report.failures().count(), 0);
            names.push(store_names(temp_dir.path()));
            reports.push(
                report
                    .outcomes
                    .into_iter()
                    .map(|(key, r)| (key, r.unwrap()))
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(reports[0], reports[1]);
        assert_eq!(names[0], names[1]);
        assert_eq!(
            names[0],
            [
                "ddi_0_state_id_0_2_field_id_0_ANTENNA",
                "ddi_0_state_id_0_2_field_id_0_MAIN",
                "ddi_1_state_id_1_field_id_1_ANTENNA",
                "ddi_1_state_id_1_field_id_1_MAIN",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_failed_partition_doesnt_stop_siblings() {
        let temp_dir = tempdir().unwrap();
        let ms = test_ms(&ROWS);
        fs::create_dir(temp_dir.path().join("ddi_0_state_id_0_2_field_id_0_MAIN")).unwrap();

        for parallel in [false, true] {
            let config = ConversionConfig {
                parallel,
                overwrite: false,
                ..Default::default()
            };
            let report = convert_msv2_to_processing_set(&ms, temp_dir.path(), &config).unwrap();
            let failures: Vec<_> = report.failures().collect();
            if parallel {
                // Both partitions were written by the sequential run.
                assert_eq!(failures.len(), 2);
            } else {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0.file_name(), "ddi_0_state_id_0_2_field_id_0");
                assert_eq!(report.num_written(), 1);
            }
            assert!(failures.iter().all(|(_, e)| matches!(
                e,
                PartitionError::Write {
                    source: ZarrError::AlreadyExists(_),
                    ..
                }
            )));
        }

        let main = read_xds(&temp_dir.path().join("ddi_1_state_id_1_field_id_1_MAIN")).unwrap();
        assert_eq!(main.dims()["time"], 2);
        assert_eq!(main.dims()["baseline"], 2);
    }

    #[test]
    fn test_missing_subtable_is_fatal() {
        let mut ms = test_ms(&ROWS);
        ms.subtables.remove("POLARIZATION");
        for parallel in [false, true] {
            let temp_dir = tempdir().unwrap();
            let config = ConversionConfig {
                parallel,
                ..Default::default()
            };
            let result = convert_msv2_to_processing_set(&ms, temp_dir.path(), &config);
            assert!(matches!(
                result,
                Err(ConversionError::Partition {
                    source: PartitionError::Subtable(_),
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_overwrite() {
        let temp_dir = tempdir().unwrap();
        let ms = test_ms(&ROWS);
        let mut config = ConversionConfig::default();
        convert_msv2_to_processing_set(&ms, temp_dir.path(), &config).unwrap();

        config.overwrite = true;
        let report = convert_msv2_to_processing_set(&ms, temp_dir.path(), &config).unwrap();
        assert_eq!(report.num_written(), 2);
        assert_eq!(report.failures().count(), 0);
    }

    #[test]
    fn test_no_fields() {
        let temp_dir = tempdir().unwrap();
        let mut ms = test_ms(&ROWS);
        ms.subtables
            .insert("FIELD".into(), MemTable::new("FIELD", 0));
        let report =
            convert_msv2_to_processing_set(&ms, temp_dir.path(), &ConversionConfig::default())
                .unwrap();
        assert!(report.outcomes.is_empty());
        assert!(store_names(temp_dir.path()).is_empty());
    }

    #[cfg(feature = "ms")]
    #[test]
    #[serial_test::serial]
    fn test_convert_casa_ms() {
        use crate::{
            dataset::ArrayData,
            io::casa::fixtures::{write_ms, NUM_CHANS, NUM_POLS},
        };

        let temp_dir = tempdir().unwrap();
        let ms_path = temp_dir.path().join("test.ms");
        let t0 = 4.5e9;
        write_ms(
            &ms_path,
            &[
                (t0, 0, 1, 0, 0, 0),
                (t0, 1, 2, 0, 0, 0),
                (t0 + 1.0, 0, 1, 0, 0, 0),
                (t0, 0, 1, 0, 1, 1),
            ],
            2,
        );
        let outfile = temp_dir.path().join("test.zarr");
        let report = convert_ms(&ms_path, &outfile, &ConversionConfig::default()).unwrap();
        // 1 data description × 2 intents × 2 fields
        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.num_written(), 2);

        let main = read_xds(&outfile.join("ddi_0_state_id_0_field_id_0_MAIN")).unwrap();
        assert_eq!(main.data_vars["VIS"].shape(), &[2, 2, NUM_CHANS, NUM_POLS]);
        match &main.data_vars["VIS"].data {
            // (t0 + 1, 1_2) has no row.
            ArrayData::Complex64(vis) => assert!(vis[[1, 1, 0, 0]].re.is_nan()),
            other => panic!("unexpected {:?}", other.dtype()),
        }
        let field_info = main.attrs["field_info"].as_map().unwrap();
        assert_eq!(field_info["name"].as_str(), Some("field0"));

        let antenna = read_xds(&outfile.join("ddi_0_state_id_1_field_id_1_ANTENNA")).unwrap();
        assert_eq!(antenna.dims()["antenna_id"], 3);
    }
}
