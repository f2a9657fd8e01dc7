//! Per-dataset summary in the prefix directory.
//!
//! The summary names every file of a dataset with its owning rank, size
//! and CRC so a later job (possibly with a different rank count) can fetch
//! the dataset without touching any other process's control state.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use scr_api_types::Dataset;

pub const SUMMARY_FILE: &str = "summary.scr";

/// Format version; older versions are not readable.
pub const SUMMARY_VERSION: u64 = 6;

/// One file as seen from the prefix directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SummaryFileEntry {
    /// Path relative to the prefix directory.
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crc32: Option<u32>,
}

/// Dataset summary: descriptor plus the rank-to-file map.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Summary {
    pub version: u64,
    pub dataset: Dataset,
    pub complete: bool,
    /// World size of the job that wrote the dataset.
    pub ranks: usize,
    /// Files per owning world rank.
    pub files: BTreeMap<usize, Vec<SummaryFileEntry>>,
}

impl Summary {
    pub fn new(dataset: Dataset, ranks: usize) -> Self {
        Summary {
            version: SUMMARY_VERSION,
            dataset,
            complete: false,
            ranks,
            files: BTreeMap::new(),
        }
    }

    /// Total bytes across all listed files.
    pub fn total_bytes(&self) -> u64 {
        self.files
            .values()
            .flat_map(|files| files.iter())
            .map(|entry| entry.size)
            .sum()
    }

    /// Read a summary from a dataset directory in the prefix tree.
    pub fn read_from<P: AsRef<Path>>(dir: P) -> Result<Summary, Error> {
        let path = dir.as_ref().join(SUMMARY_FILE);
        let data = scr_tools::fs::read_file(&path)?;
        let summary: Summary = serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse summary {:?} - {}", path, err))?;
        if summary.version != SUMMARY_VERSION {
            bail!(
                "summary {:?} has unsupported version {}",
                path,
                summary.version
            );
        }
        Ok(summary)
    }

    /// Write the summary into a dataset directory in the prefix tree.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<(), Error> {
        let path = dir.as_ref().join(SUMMARY_FILE);
        scr_tools::fs::replace_file(&path, &serde_json::to_vec_pretty(self)?, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scr_api_types::DatasetFlags;

    #[test]
    fn roundtrip_and_totals() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;

        let dataset = Dataset {
            id: 2,
            name: "ckpt.2".to_string(),
            flags: DatasetFlags::CHECKPOINT,
            created: 1,
            user: None,
            jobid: None,
            jobname: None,
            cluster: None,
            files: 2,
            size: 30,
            complete: true,
            ckpt: Some(2),
        };
        let mut summary = Summary::new(dataset, 2);
        summary.complete = true;
        summary.files.insert(
            0,
            vec![SummaryFileEntry {
                path: "out/rank_0.ckpt".to_string(),
                size: 10,
                crc32: Some(1),
            }],
        );
        summary.files.insert(
            1,
            vec![SummaryFileEntry {
                path: "out/rank_1.ckpt".to_string(),
                size: 20,
                crc32: None,
            }],
        );

        summary.write_to(dir.path())?;
        let back = Summary::read_from(dir.path())?;
        assert_eq!(back.total_bytes(), 30);
        assert_eq!(back.files.len(), 2);
        assert_eq!(back.dataset.id, 2);
        Ok(())
    }

    #[test]
    fn version_mismatch_rejected() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let dataset = Dataset {
            id: 1,
            name: "d".to_string(),
            flags: DatasetFlags::CHECKPOINT,
            created: 0,
            user: None,
            jobid: None,
            jobname: None,
            cluster: None,
            files: 0,
            size: 0,
            complete: false,
            ckpt: Some(1),
        };
        let mut summary = Summary::new(dataset, 1);
        summary.version = 5;
        summary.write_to(dir.path())?;
        assert!(Summary::read_from(dir.path()).is_err());
        Ok(())
    }
}
