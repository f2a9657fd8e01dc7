//! Scalable restart: rebuild cache state from surviving node-local copies.
//!
//! When a job restarts with access to the same caches as the prior run,
//! processes exchange an inventory of the datasets they still hold and
//! walk them in ascending id order, invoking the redundancy engine's
//! recover for each. Members whose cache was lost are rebuilt from the
//! surviving shards; datasets that cannot be rebuilt are deleted from
//! cache. The newest rebuilt checkpoint becomes the restart point, and
//! fetch remains as the fallback when nothing survives.

use std::collections::BTreeSet;

use anyhow::Error;

use scr_api_types::{Dataset, Location};
use scr_cache::{CacheIndexEntry, Filemap};
use scr_comm::bcast_value;

use crate::api::Scr;
use crate::prefix::{FlushEntry, FlushFile};
use crate::reddesc;
use crate::redundancy;

impl Scr {
    /// Attempt to rebuild every dataset found in any process's cache.
    /// Collective; sets the restart point on success.
    pub(crate) fn cache_rebuild(&mut self) -> Result<(), Error> {
        // union of dataset ids across all caches
        let my_ids = self.cindex.ids();
        let mut union = BTreeSet::new();
        for part in self.comm.allgather(&serde_json::to_vec(&my_ids)?)? {
            let ids: Vec<u64> = serde_json::from_slice(&part)?;
            union.extend(ids);
        }
        if union.is_empty() {
            return Ok(());
        }
        if self.comm.rank() == 0 {
            log::info!("attempting restart from {} cached dataset(s)", union.len());
        }

        let mut newest_usable: Option<Dataset> = None;
        let mut max_usable_id = 0u64;

        for id in union {
            // the lowest rank still holding the dataset shares its
            // descriptor with everyone
            let have = self.cindex.get(id).is_some();
            let flags = self.comm.allgather(&[have as u8])?;
            let owner = match flags.iter().position(|f| f == &[1u8]) {
                Some(owner) => owner,
                None => continue,
            };

            let shared = if self.comm.rank() == owner {
                let entry = self.cindex.get(id).unwrap();
                Some((entry.dataset.clone(), entry.bypass))
            } else {
                None
            };
            let (dataset, bypass): (Dataset, bool) =
                bcast_value(self.comm.as_ref(), owner, shared.as_ref())?;

            let rd = match reddesc::select_reddesc(&self.reddescs, &dataset) {
                Some(rd) => rd,
                None => continue,
            };

            // members that lost their cache need directories and an index
            // entry before recover can place files; create_path is
            // idempotent so no coordination is needed here
            if !have {
                let (_, my_dir) = self.cache_dirs(&self.reddescs[rd], id);
                scr_tools::fs::create_path(self.hidden_dir(&my_dir))?;
                self.cindex.set(CacheIndexEntry {
                    dataset: dataset.clone(),
                    dir: my_dir.to_string_lossy().into_owned(),
                    bypass,
                });
                self.write_cindex()?;
            }

            let ok = if bypass {
                // bypass data lives in the prefix directory; the cache
                // record is usable iff the filemap still matches it
                let map = Filemap::read_from(self.filemap_path_for(id)).unwrap_or_default();
                scr_comm::allreduce_and(
                    self.comm.as_ref(),
                    redundancy::check_files(&map, true),
                )?
            } else {
                let mut map =
                    Filemap::read_from(self.filemap_path_for(id)).unwrap_or_default();
                let ctx = self.redundancy_ctx(id);
                redundancy::recover(&ctx, &self.reddescs[rd], &mut map)?
            };

            if ok {
                if self.comm.rank() == 0 {
                    log::info!("rebuilt dataset {} '{}' from cache", id, dataset.name);
                    crate::events::Event::new("REBUILD")
                        .dataset(id, &dataset.name)
                        .emit();
                    FlushFile::update(&self.params.prefix, |flush| {
                        flush
                            .datasets
                            .entry(id)
                            .or_insert_with(|| FlushEntry {
                                name: dataset.name.clone(),
                                location: [Location::Cache].into_iter().collect(),
                                ckpt: dataset.is_ckpt(),
                                output: dataset.is_output(),
                            });
                    })?;
                }

                max_usable_id = max_usable_id.max(id);
                if dataset.is_ckpt() {
                    let newer = newest_usable
                        .as_ref()
                        .map_or(true, |best| dataset.ckpt > best.ckpt);
                    if newer {
                        newest_usable = Some(dataset);
                    }
                }
            } else {
                if self.comm.rank() == 0 {
                    log::warn!("unable to rebuild dataset {}; deleting it from cache", id);
                }
                self.cache_delete(id)?;
            }
        }

        if let Some(dataset) = newest_usable {
            self.dataset_id = max_usable_id.max(dataset.id);
            self.checkpoint_id = dataset.ckpt.unwrap_or(0);
            self.ckpt_dset_id = dataset.id;
            self.have_restart_flag = true;
            if self.comm.rank() == 0 {
                log::info!(
                    "restart point is dataset {} '{}' (checkpoint {})",
                    dataset.id,
                    dataset.name,
                    self.checkpoint_id
                );
            }
        } else {
            self.dataset_id = self.dataset_id.max(max_usable_id);
        }
        Ok(())
    }
}
