//! Flushing datasets from cache to the prefix directory.
//!
//! A flush materializes the destination list (preserving the user's path
//! hierarchy under the prefix root), creates destination directories with
//! one elected leader per unique directory, hands the file list to the
//! mover, writes the dataset summary, updates the durable index and
//! enforces the retention window. The asynchronous variant parks the mover
//! handle and finishes the bookkeeping once `test` reports completion; at
//! most one async flush is in flight at a time.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};

use scr_api_types::{FileKind, Location};
use scr_cache::Filemap;
use scr_comm::{allreduce_and, bcast_value};

use crate::api::Scr;
use crate::env;
use crate::events::Event;
use crate::mover::{mover_for, MoverHandle, TransferItem, TransferResult, XferKind};
use crate::prefix::{self, FlushFile, IndexEntry, PrefixIndex};
use crate::summary::{Summary, SummaryFileEntry};

/// An async flush in flight: the mover handle plus the local summary
/// entries still waiting for their transfer results.
pub(crate) struct AsyncFlush {
    pub id: u64,
    pub handle: MoverHandle,
    pub entries: Vec<SummaryFileEntry>,
}

struct FlushPrep {
    items: Vec<TransferItem>,
    entries: Vec<SummaryFileEntry>,
}

impl Scr {
    /// Destination of a file under the prefix root, preserving the origin
    /// hierarchy. Files whose origin lies outside the prefix land at the
    /// prefix root under their basename.
    fn flush_destination(&self, meta: &scr_api_types::FileMeta) -> Result<(PathBuf, String), Error> {
        let origin = meta.orig_path.as_deref().unwrap_or(&meta.path);
        let origin = scr_tools::fs::simplify_path(origin);

        let rel = match origin.strip_prefix(&self.params.prefix) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                let name = origin
                    .file_name()
                    .ok_or_else(|| format_err!("file {:?} has no basename", origin))?;
                log::warn!(
                    "origin {:?} lies outside the prefix directory; flushing to the prefix root",
                    origin
                );
                PathBuf::from(name)
            }
        };

        let dest = self.params.prefix.join(&rel);
        Ok((dest, rel.to_string_lossy().into_owned()))
    }

    /// Mark the dataset as flushing, build the transfer list and create
    /// the destination directories. Collective.
    fn flush_prepare(&mut self, id: u64) -> Result<FlushPrep, Error> {
        let entry = self
            .cindex
            .get(id)
            .ok_or_else(|| format_err!("dataset {} is not in cache", id))?
            .clone();

        if self.comm.rank() == 0 {
            FlushFile::update(&self.params.prefix, |flush| {
                if let Some(flush_entry) = flush.datasets.get_mut(&id) {
                    flush_entry.location.insert(Location::Flushing);
                }
            })?;
        }
        self.comm.barrier()?;

        let map = Filemap::read_from(self.filemap_path_for(id))?;

        let mut items = Vec::new();
        let mut entries = Vec::new();
        let mut dirs = Vec::new();
        for meta in map.files() {
            if meta.kind != FileKind::User {
                continue;
            }
            let (dest, rel) = self.flush_destination(meta)?;

            let crc32 = if entry.bypass && self.params.crc_on_flush && meta.crc32.is_none() {
                // the bytes are already in place; compute the record now
                Some(scr_tools::fs::crc32_file(&meta.path)?)
            } else {
                meta.crc32
            };

            entries.push(SummaryFileEntry {
                path: rel,
                size: meta.size,
                crc32,
            });

            if !entry.bypass {
                let mut item = TransferItem::new(PathBuf::from(&meta.path), dest.clone());
                item.size = Some(meta.size);
                item.crc32 = meta.crc32;
                item.compute_crc = self.params.crc_on_flush;
                if self.params.copy_metadata {
                    item.meta = meta.stat;
                }
                items.push(item);

                if let Some(parent) = dest.parent() {
                    dirs.push(parent.to_string_lossy().into_owned());
                }
            }
        }

        // one elected leader per unique directory avoids the mkdir storm
        let leaders = scr_comm::elect_leaders(self.comm.as_ref(), &dirs)?;
        for (dir, leader) in dirs.iter().zip(leaders) {
            if leader {
                scr_tools::fs::create_path(dir)?;
            }
        }
        self.comm.barrier()?;

        Ok(FlushPrep { items, entries })
    }

    /// Merge transfer results, gather the rank-to-file map at rank 0,
    /// write summary and index, and enforce retention. Collective; returns
    /// the reconciled success.
    fn flush_finish(
        &mut self,
        id: u64,
        mut entries: Vec<SummaryFileEntry>,
        results: Result<Vec<TransferResult>, Error>,
        local_ok: bool,
    ) -> Result<bool, Error> {
        let local_ok = local_ok
            && match results {
                Ok(results) => {
                    let by_rel: HashMap<PathBuf, Option<u32>> = results
                        .into_iter()
                        .map(|result| (result.dst, result.crc32))
                        .collect();
                    for entry in entries.iter_mut() {
                        if entry.crc32.is_none() {
                            let dest = self.params.prefix.join(&entry.path);
                            if let Some(crc) = by_rel.get(&dest) {
                                entry.crc32 = *crc;
                            }
                        }
                    }
                    true
                }
                Err(err) => {
                    log::error!("flush of dataset {} failed on this rank - {}", id, err);
                    false
                }
            };

        let all_ok = allreduce_and(self.comm.as_ref(), local_ok)?;

        let gathered = self
            .comm
            .gather(0, &serde_json::to_vec(&entries)?)?;

        if self.comm.rank() == 0 {
            if all_ok {
                let dataset = self
                    .cindex
                    .get(id)
                    .map(|entry| entry.dataset.clone())
                    .ok_or_else(|| format_err!("dataset {} vanished from cache index", id))?;

                let mut files = BTreeMap::new();
                for (rank, part) in gathered.unwrap().into_iter().enumerate() {
                    let rank_entries: Vec<SummaryFileEntry> = serde_json::from_slice(&part)?;
                    if !rank_entries.is_empty() {
                        files.insert(rank, rank_entries);
                    }
                }

                let mut summary = Summary::new(dataset.clone(), self.comm.size());
                summary.complete = dataset.complete;
                summary.files = files;

                let dir = prefix::dataset_dir(&self.params.prefix, id);
                scr_tools::fs::create_path(&dir)?;
                summary.write_to(&dir)?;

                Event::new("FLUSH")
                    .dataset(id, &dataset.name)
                    .bytes(summary.total_bytes())
                    .files(dataset.files)
                    .emit_transfer();

                PrefixIndex::update(&self.params.prefix, |index| {
                    let entry = index
                        .datasets
                        .entry(id)
                        .or_insert_with(|| IndexEntry::from_dataset(&dataset));
                    entry.complete = dataset.complete;
                    entry.failed = false;
                    entry.flushed = Some(env::now_secs());
                })?;

                FlushFile::update(&self.params.prefix, |flush| {
                    if let Some(entry) = flush.datasets.get_mut(&id) {
                        entry.location.remove(&Location::Flushing);
                        entry.location.insert(Location::Pfs);
                    }
                })?;

                if self.params.prefix_size > 0 {
                    self.prefix_delete_sliding(id, self.params.prefix_size)?;
                }
            } else {
                // retain the cache copy; the next interval retries
                FlushFile::update(&self.params.prefix, |flush| {
                    if let Some(entry) = flush.datasets.get_mut(&id) {
                        entry.location.remove(&Location::Flushing);
                    }
                })?;
            }
        }

        self.comm.barrier()?;
        Ok(all_ok)
    }

    /// Synchronously flush a dataset to the prefix directory.
    pub(crate) fn flush_sync(&mut self, id: u64) -> Result<(), Error> {
        if self.comm.rank() == 0 {
            log::info!("flushing dataset {}", id);
        }

        let prep = self.flush_prepare(id)?;

        let results = if prep.items.is_empty() {
            Ok(Vec::new())
        } else {
            let mover = mover_for(self.params.flush_type);
            match mover.start(prep.items, self.params.file_buf_size) {
                Ok(handle) => handle.wait(),
                Err(err) => Err(err),
            }
        };

        if !self.flush_finish(id, prep.entries, results, true)? {
            bail!("flush of dataset {} failed", id);
        }
        Ok(())
    }

    /// Issue an asynchronous flush and return immediately.
    pub(crate) fn flush_async_start(&mut self, id: u64) -> Result<(), Error> {
        if self.async_flush.is_some() {
            bail!("an asynchronous flush is already in flight");
        }
        if self.comm.rank() == 0 {
            log::info!("starting async flush of dataset {}", id);
        }

        let prep = self.flush_prepare(id)?;
        let mover = mover_for(XferKind::Pthread);
        let handle = mover.start(prep.items, self.params.file_buf_size)?;

        self.async_flush = Some(AsyncFlush {
            id,
            handle,
            entries: prep.entries,
        });
        Ok(())
    }

    /// Drive an in-flight async flush: finish the bookkeeping once every
    /// rank's transfers are done. Collective.
    pub(crate) fn flush_async_progress(&mut self) -> Result<(), Error> {
        let local_done = match self.async_flush.as_mut() {
            Some(flush) => flush.handle.test(),
            None => return Ok(()),
        };

        if allreduce_and(self.comm.as_ref(), local_done)? {
            self.flush_async_complete()?;
        } else if self.comm.rank() == 0 {
            log::debug!("async flush still in progress");
        }
        Ok(())
    }

    /// Block until the in-flight async flush has completed its transfers
    /// and bookkeeping. Collective; a failed flush is fatal here because
    /// callers rely on the dataset being durable.
    pub(crate) fn flush_async_wait(&mut self) -> Result<(), Error> {
        if self.async_flush.is_some() {
            self.flush_async_complete()?;
        }
        Ok(())
    }

    fn flush_async_complete(&mut self) -> Result<(), Error> {
        let flush = match self.async_flush.take() {
            Some(flush) => flush,
            None => return Ok(()),
        };

        let results = flush.handle.wait();
        if !self.flush_finish(flush.id, flush.entries, results, true)? {
            bail!("async flush of dataset {} failed", flush.id);
        }
        if self.comm.rank() == 0 {
            log::info!("completed async flush of dataset {}", flush.id);
        }
        Ok(())
    }

    /// Abandon the in-flight async flush. Blocks until the mover
    /// acknowledges the stop; the dataset keeps its cache copy.
    pub(crate) fn flush_async_stop(&mut self) -> Result<(), Error> {
        let flush = match self.async_flush.take() {
            Some(flush) => flush,
            None => return Ok(()),
        };
        let id = flush.id;
        flush.handle.cancel()?;

        if self.comm.rank() == 0 {
            FlushFile::update(&self.params.prefix, |flush| {
                if let Some(entry) = flush.datasets.get_mut(&id) {
                    entry.location.remove(&Location::Flushing);
                }
            })?;
        }
        self.comm.barrier()?;
        Ok(())
    }

    /// Delete the prefix copy of a dataset: the files listed in its
    /// summary, its metadata directory and its index entry. Rank 0 only.
    pub(crate) fn prefix_delete_data(&mut self, id: u64) -> Result<(), Error> {
        let dir = prefix::dataset_dir(&self.params.prefix, id);
        if let Ok(summary) = Summary::read_from(&dir) {
            for entries in summary.files.values() {
                for entry in entries {
                    let path = self.params.prefix.join(&entry.path);
                    if self.params.crc_on_delete {
                        if let Some(expected) = entry.crc32 {
                            match scr_tools::fs::crc32_file(&path) {
                                Ok(actual) if actual == expected => {}
                                Ok(actual) => log::warn!(
                                    "CRC32 mismatch deleting {:?}: expected {:08x} got {:08x}",
                                    path,
                                    expected,
                                    actual
                                ),
                                Err(err) => {
                                    log::warn!("CRC32 of {:?} unavailable - {}", path, err)
                                }
                            }
                        }
                    }
                    scr_tools::fs::remove_file_quiet(&path)?;
                }
            }
        }
        scr_tools::fs::remove_dir_all_quiet(&dir)?;

        PrefixIndex::update(&self.params.prefix, |index| {
            if let Some(entry) = index.datasets.remove(&id) {
                if index.current.as_deref() == Some(entry.name.as_str()) {
                    index.current = None;
                }
            }
        })?;
        FlushFile::update(&self.params.prefix, |flush| {
            if let Some(entry) = flush.datasets.get_mut(&id) {
                entry.location.remove(&Location::Pfs);
            }
        })?;
        Ok(())
    }

    /// Keep the newest `window` pure checkpoints in the prefix directory
    /// and delete the rest. Datasets flagged output are never deleted.
    /// Rank 0 only.
    fn prefix_delete_sliding(&mut self, current_id: u64, window: usize) -> Result<(), Error> {
        let index = PrefixIndex::load(&self.params.prefix)?;

        let victims: Vec<u64> = index
            .datasets
            .values()
            .rev()
            .filter(|entry| {
                entry.id <= current_id
                    && entry.is_ckpt()
                    && !entry.is_output()
                    && index.current.as_deref() != Some(entry.name.as_str())
            })
            .skip(window)
            .map(|entry| entry.id)
            .collect();

        for id in victims {
            log::info!("retention window evicts dataset {} from the prefix directory", id);
            self.prefix_delete_data(id)?;
        }
        Ok(())
    }

    /// Delete the named dataset from the prefix directory. Rank 0 only.
    pub(crate) fn prefix_delete_named(&mut self, name: &str) -> Result<(), Error> {
        let index = PrefixIndex::load(&self.params.prefix)?;
        if let Some(entry) = index.get_by_name(name) {
            let id = entry.id;
            self.prefix_delete_data(id)?;
        }
        Ok(())
    }

    /// Delete every dataset listed in the index. Rank 0 only.
    pub(crate) fn prefix_delete_all(&mut self) -> Result<(), Error> {
        let index = PrefixIndex::load(&self.params.prefix)?;
        for id in index.datasets.keys().copied().collect::<Vec<_>>() {
            self.prefix_delete_data(id)?;
        }
        Ok(())
    }

    /// True when the named dataset still needs a flush according to the
    /// per-job flush file. Collective convenience for callers that need a
    /// uniform answer.
    pub(crate) fn needs_flush(&mut self, id: u64) -> Result<bool, Error> {
        let needs = if self.comm.rank() == 0 {
            FlushFile::load(&self.params.prefix)?.needs_flush(id)
        } else {
            false
        };
        Ok(bcast_value(self.comm.as_ref(), 0, Some(&needs))?)
    }
}
