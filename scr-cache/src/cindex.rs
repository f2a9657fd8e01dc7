//! The per-process cache index.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use scr_api_types::Dataset;

/// What the cache index records per dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheIndexEntry {
    pub dataset: Dataset,
    /// Absolute cache directory of the dataset.
    pub dir: String,
    /// Files live directly in the prefix directory; cache holds metadata only.
    #[serde(default)]
    pub bypass: bool,
}

/// Map of dataset id to cache location, persisted in the control directory.
///
/// Purely process-local; mutations must be flushed with `write_to` before
/// the on-disk state they describe changes, so a restarted run sees an
/// index that matches what is physically present.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheIndex {
    /// Name of a user-provided current checkpoint request already applied,
    /// so later runs do not re-apply it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    current: Option<String>,
    #[serde(default)]
    datasets: BTreeMap<u64, CacheIndexEntry>,
}

impl CacheIndex {
    pub fn new() -> Self {
        CacheIndex::default()
    }

    pub fn get(&self, id: u64) -> Option<&CacheIndexEntry> {
        self.datasets.get(&id)
    }

    pub fn set(&mut self, entry: CacheIndexEntry) {
        self.datasets.insert(entry.dataset.id, entry);
    }

    pub fn unset(&mut self, id: u64) -> Option<CacheIndexEntry> {
        self.datasets.remove(&id)
    }

    /// Dataset ids in ascending order.
    pub fn ids(&self) -> Vec<u64> {
        self.datasets.keys().copied().collect()
    }

    /// Largest dataset id in the index.
    pub fn latest(&self) -> Option<u64> {
        self.datasets.keys().next_back().copied()
    }

    pub fn num_datasets(&self) -> usize {
        self.datasets.len()
    }

    pub fn clear(&mut self) {
        self.datasets.clear();
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn set_current(&mut self, name: Option<String>) {
        self.current = name;
    }

    pub fn merge(&mut self, other: CacheIndex) {
        if self.current.is_none() {
            self.current = other.current;
        }
        self.datasets.extend(other.datasets);
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = scr_tools::fs::read_file(path)?;
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse cache index {:?} - {}", path, err))
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(self)?;
        scr_tools::fs::replace_file(path, &data, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scr_api_types::DatasetFlags;

    fn entry(id: u64) -> CacheIndexEntry {
        CacheIndexEntry {
            dataset: Dataset {
                id,
                name: format!("ckpt.{}", id),
                flags: DatasetFlags::CHECKPOINT,
                created: 0,
                user: None,
                jobid: None,
                jobname: None,
                cluster: None,
                files: 0,
                size: 0,
                complete: true,
                ckpt: Some(id),
            },
            dir: format!("/cache/scr.dataset.{}", id),
            bypass: false,
        }
    }

    #[test]
    fn ordering_and_latest() {
        let mut index = CacheIndex::new();
        index.set(entry(5));
        index.set(entry(2));
        index.set(entry(9));

        assert_eq!(index.ids(), vec![2, 5, 9]);
        assert_eq!(index.latest(), Some(9));

        index.unset(9);
        assert_eq!(index.latest(), Some(5));
        assert!(index.get(9).is_none());
    }

    #[test]
    fn persist_roundtrip() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cindex.scrinfo");

        let mut index = CacheIndex::new();
        index.set(entry(1));
        index.set_current(Some("ckpt.1".to_string()));
        index.write_to(&path)?;

        let back = CacheIndex::read_from(&path)?;
        assert_eq!(back.ids(), vec![1]);
        assert_eq!(back.current(), Some("ckpt.1"));
        Ok(())
    }
}
