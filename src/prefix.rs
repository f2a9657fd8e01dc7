//! Prefix directory maintenance.
//!
//! The prefix directory keeps a hidden `.scr` subtree with the durable
//! dataset index, the halt file, the per-job flush file and one directory
//! per flushed dataset. The index is only ever written by rank 0 and every
//! read-modify-write runs under an advisory lock, so concurrent jobs
//! sharing a prefix never interleave updates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use scr_api_types::{Dataset, DatasetFlags, Location};
use scr_cache::layout;
use scr_tools::lock::LockedFile;

pub const SCR_DIR: &str = ".scr";
pub const INDEX_FILE: &str = "index.scrinfo";
pub const HALT_FILE: &str = "halt.scr";
pub const FLUSH_FILE: &str = "flush.scr";
pub const NODES_FILE: &str = "nodes.scr";

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// The hidden subtree of the prefix directory.
pub fn scr_dir(prefix: &Path) -> PathBuf {
    prefix.join(SCR_DIR)
}

pub fn index_path(prefix: &Path) -> PathBuf {
    scr_dir(prefix).join(INDEX_FILE)
}

pub fn halt_path(prefix: &Path) -> PathBuf {
    scr_dir(prefix).join(HALT_FILE)
}

pub fn flush_path(prefix: &Path) -> PathBuf {
    scr_dir(prefix).join(FLUSH_FILE)
}

pub fn nodes_path(prefix: &Path) -> PathBuf {
    scr_dir(prefix).join(NODES_FILE)
}

/// Record how many nodes the current run spans, so the scavenger tooling
/// can tell whether a later allocation still covers the same caches.
pub fn write_nodes(prefix: &Path, nodes: u64) -> Result<(), Error> {
    scr_tools::fs::create_path(scr_dir(prefix))?;
    let record = serde_json::json!({ "nodes": nodes });
    scr_tools::fs::replace_file(nodes_path(prefix), record.to_string().as_bytes(), true)
}

/// Metadata directory of a dataset under the hidden subtree.
pub fn dataset_dir(prefix: &Path, id: u64) -> PathBuf {
    scr_dir(prefix).join(layout::dataset_dir_name(id))
}

/// One dataset recorded in the durable index.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexEntry {
    pub id: u64,
    pub name: String,
    pub flags: DatasetFlags,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ckpt: Option<u64>,
    pub complete: bool,
    /// Fetch failed from this dataset; skip it on later restarts.
    #[serde(default)]
    pub failed: bool,
    /// Epoch seconds when the flush finished; unset while flushing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flushed: Option<i64>,
}

impl IndexEntry {
    pub fn from_dataset(dataset: &Dataset) -> IndexEntry {
        IndexEntry {
            id: dataset.id,
            name: dataset.name.clone(),
            flags: dataset.flags,
            ckpt: dataset.ckpt,
            complete: dataset.complete,
            failed: false,
            flushed: None,
        }
    }

    pub fn is_ckpt(&self) -> bool {
        self.flags.contains(DatasetFlags::CHECKPOINT)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(DatasetFlags::OUTPUT)
    }
}

/// Durable index of named datasets in the prefix directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrefixIndex {
    /// Name of the dataset restarts should prefer.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current: Option<String>,
    pub datasets: BTreeMap<u64, IndexEntry>,
}

impl PrefixIndex {
    pub fn get_by_name(&self, name: &str) -> Option<&IndexEntry> {
        self.datasets.values().find(|entry| entry.name == name)
    }

    pub fn remove_by_name(&mut self, name: &str) -> Option<IndexEntry> {
        let id = self.get_by_name(name)?.id;
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        self.datasets.remove(&id)
    }

    /// Largest ids recorded: (dataset id, checkpoint id, its dataset id).
    pub fn max_ids(&self) -> (u64, u64, u64) {
        let mut max_id = 0;
        let mut max_ckpt = 0;
        let mut max_ckpt_dset = 0;
        for entry in self.datasets.values() {
            max_id = max_id.max(entry.id);
            if let Some(ckpt) = entry.ckpt {
                if ckpt > max_ckpt {
                    max_ckpt = ckpt;
                    max_ckpt_dset = entry.id;
                }
            }
        }
        (max_id, max_ckpt, max_ckpt_dset)
    }

    /// Checkpoints eligible for fetch, newest first, skipping failed and
    /// incomplete entries.
    pub fn fetch_candidates(&self) -> Vec<&IndexEntry> {
        self.datasets
            .values()
            .rev()
            .filter(|entry| entry.is_ckpt() && entry.complete && !entry.failed)
            .collect()
    }

    /// Read the index without holding the lock beyond the read itself.
    pub fn load(prefix: &Path) -> Result<PrefixIndex, Error> {
        let path = index_path(prefix);
        if !path.exists() {
            return Ok(PrefixIndex::default());
        }
        let mut locked = LockedFile::open(&path, LOCK_TIMEOUT, false)?;
        let data = locked.read_to_vec()?;
        if data.is_empty() {
            return Ok(PrefixIndex::default());
        }
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse index {:?} - {}", path, err))
    }

    /// Read-modify-write the index under the exclusive lock. Rank 0 only.
    pub fn update<R>(
        prefix: &Path,
        mutate: impl FnOnce(&mut PrefixIndex) -> R,
    ) -> Result<R, Error> {
        scr_tools::fs::create_path(scr_dir(prefix))?;
        let path = index_path(prefix);
        let mut locked = LockedFile::open(&path, LOCK_TIMEOUT, true)?;

        let data = locked.read_to_vec()?;
        let mut index = if data.is_empty() {
            PrefixIndex::default()
        } else {
            serde_json::from_slice(&data)
                .map_err(|err| format_err!("unable to parse index {:?} - {}", path, err))?
        };

        let result = mutate(&mut index);
        locked.rewrite(&serde_json::to_vec_pretty(&index)?)?;
        Ok(result)
    }
}

/// One dataset's location tags in the per-job flush file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlushEntry {
    pub name: String,
    pub location: BTreeSet<Location>,
    #[serde(default)]
    pub ckpt: bool,
    #[serde(default)]
    pub output: bool,
}

/// Per-job record of where each dataset's bytes currently live. The
/// scavenger tooling reads this after a job dies; the library only writes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlushFile {
    pub datasets: BTreeMap<u64, FlushEntry>,
}

impl FlushFile {
    pub fn load(prefix: &Path) -> Result<FlushFile, Error> {
        let path = flush_path(prefix);
        if !path.exists() {
            return Ok(FlushFile::default());
        }
        let data = scr_tools::fs::read_file(&path)?;
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse flush file {:?} - {}", path, err))
    }

    /// Read-modify-write the flush file. Rank 0 only.
    pub fn update<R>(prefix: &Path, mutate: impl FnOnce(&mut FlushFile) -> R) -> Result<R, Error> {
        scr_tools::fs::create_path(scr_dir(prefix))?;
        let mut flush = FlushFile::load(prefix)?;
        let result = mutate(&mut flush);
        scr_tools::fs::replace_file(
            flush_path(prefix),
            &serde_json::to_vec_pretty(&flush)?,
            true,
        )?;
        Ok(result)
    }

    /// True when the dataset still has bytes in cache that never reached
    /// the prefix directory.
    pub fn needs_flush(&self, id: u64) -> bool {
        match self.datasets.get(&id) {
            Some(entry) => !entry.location.contains(&Location::Pfs),
            None => false,
        }
    }

    pub fn is_flushing(&self, id: u64) -> bool {
        match self.datasets.get(&id) {
            Some(entry) => entry.location.contains(&Location::Flushing),
            None => false,
        }
    }
}
