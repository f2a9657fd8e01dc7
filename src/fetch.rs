//! Fetching datasets from the prefix directory into cache.
//!
//! Fetch walks the durable index from the preferred entry downward: the
//! configured current name first, then the index's current pointer, then
//! the most recent complete checkpoint. A candidate that cannot be read is
//! marked failed and the next one is tried until none remain.

use std::collections::BTreeSet;

use anyhow::{format_err, Error};

use scr_api_types::FileMeta;
use scr_cache::{layout, CacheIndexEntry, Filemap};
use scr_comm::{allreduce_and, bcast_value};

use crate::api::Scr;
use crate::mover::{mover_for, TransferItem};
use crate::prefix::{self, PrefixIndex};
use crate::reddesc;
use crate::redundancy;
use crate::summary::{Summary, SummaryFileEntry};

impl Scr {
    /// Pick the next fetch candidate and load its summary. Rank 0 only;
    /// unreadable summaries are marked failed on the spot.
    fn pick_candidate(&self, tried: &BTreeSet<u64>) -> Result<Option<Summary>, Error> {
        let index = PrefixIndex::load(&self.params.prefix)?;

        let mut order: Vec<u64> = Vec::new();
        if let Some(name) = &self.params.fetch_current {
            // an explicit current request is honored once; the cache index
            // remembers it so later runs resume normal ordering
            if self.cindex.current() != Some(name.as_str()) {
                if let Some(entry) = index.get_by_name(name) {
                    order.push(entry.id);
                }
            }
        }
        if let Some(name) = &index.current {
            if let Some(entry) = index.get_by_name(name) {
                order.push(entry.id);
            }
        }
        for entry in index.fetch_candidates() {
            order.push(entry.id);
        }

        let mut seen = BTreeSet::new();
        for id in order {
            if !seen.insert(id) || tried.contains(&id) {
                continue;
            }
            let entry = match index.datasets.get(&id) {
                Some(entry) => entry,
                None => continue,
            };
            if !entry.complete || entry.failed {
                continue;
            }

            let dir = prefix::dataset_dir(&self.params.prefix, id);
            match Summary::read_from(&dir) {
                Ok(summary) if summary.dataset.id == id => return Ok(Some(summary)),
                Ok(summary) => {
                    log::error!(
                        "summary in {:?} names dataset {} instead of {}",
                        dir,
                        summary.dataset.id,
                        id
                    );
                }
                Err(err) => {
                    log::error!("unable to read summary of dataset {} - {}", id, err);
                }
            }

            // candidate is unusable; never offer it again
            PrefixIndex::update(&self.params.prefix, |index| {
                if let Some(entry) = index.datasets.get_mut(&id) {
                    entry.failed = true;
                }
                if index.current.as_deref()
                    == index.datasets.get(&id).map(|entry| entry.name.as_str())
                {
                    index.current = None;
                }
            })?;
        }
        Ok(None)
    }

    /// Restore the most recent usable checkpoint from the prefix
    /// directory. Collective; returns whether a checkpoint was loaded and
    /// updates the dataset/checkpoint counters on success.
    pub(crate) fn fetch_latest(&mut self) -> Result<bool, Error> {
        let mut tried = BTreeSet::new();

        loop {
            let candidate = if self.comm.rank() == 0 {
                self.pick_candidate(&tried)?
            } else {
                None
            };
            let candidate: Option<Summary> =
                bcast_value(self.comm.as_ref(), 0, Some(&candidate))?;

            let summary = match candidate {
                Some(summary) => summary,
                None => return Ok(false),
            };
            let id = summary.dataset.id;
            tried.insert(id);

            if self.fetch_dset(&summary)? {
                let dataset = &summary.dataset;
                self.dataset_id = dataset.id;
                if let Some(ckpt) = dataset.ckpt {
                    self.checkpoint_id = ckpt;
                    self.ckpt_dset_id = dataset.id;
                    self.have_restart_flag = true;
                }
                if let Some(name) = &self.params.fetch_current {
                    if name == &dataset.name {
                        self.cindex.set_current(Some(name.clone()));
                        self.write_cindex()?;
                    }
                }
                if self.comm.rank() == 0 {
                    log::info!("fetched dataset {} '{}'", dataset.id, dataset.name);
                    crate::events::Event::new("FETCH")
                        .dataset(dataset.id, &dataset.name)
                        .bytes(summary.total_bytes())
                        .emit_transfer();
                }
                return Ok(true);
            }

            // fetch failed; mark it and move on to the next candidate
            if self.comm.rank() == 0 {
                log::warn!("fetch of dataset {} failed; trying an older checkpoint", id);
                PrefixIndex::update(&self.params.prefix, |index| {
                    if let Some(entry) = index.datasets.get_mut(&id) {
                        entry.failed = true;
                    }
                })?;
            }
        }
    }

    /// Fetch one dataset described by its summary. Collective; returns the
    /// reconciled success.
    fn fetch_dset(&mut self, summary: &Summary) -> Result<bool, Error> {
        let dataset = summary.dataset.clone();
        let bypass = self.params.fetch_bypass;

        // drop any stale cache copy of the same id first
        if self.cindex.get(dataset.id).is_some() {
            self.cache_delete(dataset.id)?;
        }

        let rd = reddesc::select_reddesc(&self.reddescs, &dataset)
            .ok_or_else(|| format_err!("no redundancy descriptor matches dataset {}", dataset.id))?;

        let (dataset_dir, my_dir) = self.cache_dirs(&self.reddescs[rd], dataset.id);
        if !bypass {
            let store = &self.storedescs[self.reddescs[rd].store_index];
            store.create_dir(&dataset_dir)?;
        }
        scr_tools::fs::create_path(self.hidden_dir(&my_dir))?;

        // files of summary rank r go to current rank r mod size
        let mut my_entries: Vec<&SummaryFileEntry> = Vec::new();
        for (rank, entries) in &summary.files {
            if rank % self.comm.size() == self.comm.rank() {
                my_entries.extend(entries.iter());
            }
        }

        let mut map = Filemap::new();
        map.set_dataset(dataset.clone());

        let mut items = Vec::new();
        for entry in &my_entries {
            let src = self.params.prefix.join(&entry.path);
            let dst = if bypass {
                src.clone()
            } else {
                let name = src
                    .file_name()
                    .ok_or_else(|| format_err!("summary path {:?} has no basename", entry.path))?;
                my_dir.join(name)
            };

            let mut meta = FileMeta::new(dst.to_string_lossy().into_owned());
            meta.orig_path = Some(src.to_string_lossy().into_owned());
            meta.size = entry.size;
            meta.crc32 = entry.crc32;
            meta.complete = true;
            map.add_file(meta);

            if !bypass {
                let mut item = TransferItem::new(src, dst);
                item.size = Some(entry.size);
                item.crc32 = entry.crc32;
                item.compute_crc = self.params.crc_on_flush;
                items.push(item);
            }
        }

        let local_ok = if items.is_empty() {
            true
        } else {
            let mover = mover_for(self.params.flush_type);
            match mover.start(items, self.params.file_buf_size) {
                Ok(handle) => match handle.wait() {
                    Ok(_) => true,
                    Err(err) => {
                        log::error!("fetch transfer failed - {}", err);
                        false
                    }
                },
                Err(err) => {
                    log::error!("unable to start fetch transfer - {}", err);
                    false
                }
            }
        };

        let mut ok = allreduce_and(self.comm.as_ref(), local_ok)?;

        if ok {
            self.cindex.set(CacheIndexEntry {
                dataset: dataset.clone(),
                dir: my_dir.to_string_lossy().into_owned(),
                bypass,
            });
            self.write_cindex()?;

            let map_path = layout::hidden_dir(&my_dir)
                .join(layout::filemap_name(self.comm.rank()));
            map.write_to(&map_path)?;

            // re-protect the fetched dataset as if this run had written it
            if !bypass {
                let ctx = self.redundancy_ctx(dataset.id);
                ok = redundancy::apply(&ctx, &self.reddescs[rd], &mut map)?;
            }
        }

        if !ok {
            self.cache_delete(dataset.id)?;
            // remove a partially fetched directory even if it never made
            // it into the cache index
            let _ = scr_tools::fs::remove_dir_all_quiet(&my_dir);
        }
        Ok(ok)
    }
}
