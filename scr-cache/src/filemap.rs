//! Per-dataset record of the files one process owns.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use scr_api_types::{Dataset, FileKind, FileMeta};

/// The files this process holds for one dataset, plus the dataset
/// descriptor itself. Persisted next to the data in the hidden subdirectory
/// of the dataset cache directory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Filemap {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    dataset: Option<Dataset>,
    /// Keyed by the absolute path of the file as written.
    #[serde(default)]
    files: BTreeMap<String, FileMeta>,
}

impl Filemap {
    pub fn new() -> Self {
        Filemap::default()
    }

    pub fn set_dataset(&mut self, dataset: Dataset) {
        self.dataset = Some(dataset);
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    /// Register a file; an existing entry for the same path is replaced.
    pub fn add_file(&mut self, meta: FileMeta) {
        self.files.insert(meta.path.clone(), meta);
    }

    pub fn remove_file(&mut self, path: &str) -> Option<FileMeta> {
        self.files.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn get_meta(&self, path: &str) -> Option<&FileMeta> {
        self.files.get(path)
    }

    pub fn set_meta(&mut self, meta: FileMeta) {
        self.files.insert(meta.path.clone(), meta);
    }

    /// Iterate file entries in path order.
    pub fn files(&self) -> impl Iterator<Item = &FileMeta> {
        self.files.values()
    }

    pub fn files_mut(&mut self) -> impl Iterator<Item = &mut FileMeta> {
        self.files.values_mut()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Paths of the user files only, skipping redundancy shards.
    pub fn user_paths(&self) -> Vec<String> {
        self.files
            .values()
            .filter(|meta| meta.kind == FileKind::User)
            .map(|meta| meta.path.clone())
            .collect()
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn clear(&mut self) {
        self.dataset = None;
        self.files.clear();
    }

    /// Add all entries of `other`; the dataset descriptor is taken from
    /// `other` if this map has none yet.
    pub fn merge(&mut self, other: Filemap) {
        if self.dataset.is_none() {
            self.dataset = other.dataset;
        }
        self.files.extend(other.files);
    }

    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let data = scr_tools::fs::read_file(path)?;
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse filemap {:?} - {}", path, err))
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

    fn dataset(id: u64) -> Dataset {
        Dataset {
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
            complete: false,
            ckpt: Some(id),
        }
    }

    #[test]
    fn add_remove_iterate() {
        let mut map = Filemap::new();
        map.set_dataset(dataset(1));
        map.add_file(FileMeta::new("/cache/scr.dataset.1/b"));
        map.add_file(FileMeta::new("/cache/scr.dataset.1/a"));
        map.add_file(FileMeta::new_redundancy(
            "/cache/scr.dataset.1/.scr/xor.0_1_of_4.scr",
        ));

        assert_eq!(map.num_files(), 3);
        assert_eq!(map.user_paths().len(), 2);
        // path order
        let paths: Vec<_> = map.files().map(|meta| meta.path.clone()).collect();
        assert!(paths[0] < paths[1]);

        assert!(map.remove_file("/cache/scr.dataset.1/a").is_some());
        assert!(!map.contains("/cache/scr.dataset.1/a"));
    }

    #[test]
    fn write_read_identity() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("filemap_0");

        let mut map = Filemap::new();
        map.set_dataset(dataset(3));
        let mut meta = FileMeta::new("/cache/scr.dataset.3/rank_0.ckpt");
        meta.size = 42;
        meta.crc32 = Some(0xdead_beef);
        meta.complete = true;
        map.add_file(meta);
        map.write_to(&path)?;

        let back = Filemap::read_from(&path)?;
        assert_eq!(back.dataset().unwrap().id, 3);
        let meta = back.get_meta("/cache/scr.dataset.3/rank_0.ckpt").unwrap();
        assert_eq!(meta.size, 42);
        assert_eq!(meta.crc32, Some(0xdead_beef));
        Ok(())
    }
}
