//! The public collective API and dataset lifecycle state machine.
//!
//! A [`Scr`] context is created by `init` and dropped by `finalize`; every
//! public operation is collective over the world group and must be called
//! by all processes in the same order with identical arguments. Violations
//! of the calling discipline are programming errors and abort the job with
//! a diagnostic naming the expected call.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, format_err, Error};

use scr_api_types::{Dataset, DatasetFlags, FileMeta, HaltState, Location};
use scr_cache::{layout, CacheIndex, CacheIndexEntry, Filemap};
use scr_comm::{allreduce_and, allreduce_sum, bcast_value, Comm};

use crate::config::Config;
use crate::env;
use crate::events::Event;
use crate::flush::AsyncFlush;
use crate::groupdesc::{self, GroupDesc, GROUP_NODE};
use crate::halt;
use crate::prefix::{self, FlushEntry, FlushFile, PrefixIndex};
use crate::reddesc::{self, RedDesc};
use crate::redundancy::{self, RedundancyCtx};
use crate::storedesc::{self, StoreDesc, StoreView};
use crate::Params;

/// Lifecycle states of the collective API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    Checkpoint,
    Output,
    Restart,
}

impl State {
    fn expected_call(self) -> &'static str {
        match self {
            State::Idle => "a start call",
            State::Checkpoint => "complete_checkpoint",
            State::Output => "complete_output",
            State::Restart => "complete_restart",
        }
    }
}

pub(crate) struct OutputState {
    pub map: Filemap,
    pub reddesc: usize,
}

/// The initialized runtime. All descriptors, counters and in-flight state
/// live here; public operations take it by mutable reference.
pub struct Scr {
    pub(crate) params: Params,
    pub(crate) comm: Box<dyn Comm>,
    pub(crate) my_hostname: String,
    /// Id of this process's node group.
    pub(crate) my_hostid: u64,
    pub(crate) user: Option<String>,
    pub(crate) jobid: String,
    pub(crate) jobname: Option<String>,
    pub(crate) cluster: Option<String>,
    pub(crate) cntl_dir: PathBuf,
    pub(crate) cindex_file: PathBuf,
    pub(crate) groupdescs: Vec<GroupDesc>,
    pub(crate) storedescs: Vec<StoreDesc>,
    pub(crate) reddescs: Vec<RedDesc>,
    pub(crate) cindex: CacheIndex,
    pub(crate) state: State,
    pub(crate) dataset_id: u64,
    pub(crate) checkpoint_id: u64,
    pub(crate) ckpt_dset_id: u64,
    pub(crate) have_restart_flag: bool,
    pub(crate) output: Option<OutputState>,
    pub(crate) restart_map: Option<Filemap>,
    pub(crate) halt_state: HaltState,
    pub(crate) async_flush: Option<AsyncFlush>,
    need_checkpoint_count: u64,
    time_checkpoint_end: Instant,
    time_output_start: Option<Instant>,
    time_checkpoint_total: f64,
    time_checkpoint_count: u64,
}

/// Abort the job with a diagnostic; the launcher treats a rank panic as a
/// collective abort.
macro_rules! scr_abort {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}

impl Scr {
    /// Initialize the library. Collective; on failure every rank returns
    /// an error and the application may continue without checkpointing.
    pub fn init(config: &Config, comm: Box<dyn Comm>) -> Result<Scr, Error> {
        let params = Params::from_config(config)?;

        // the shared and scheme-determining parameters must agree on every
        // rank; node-local base paths may legitimately differ
        let check = (
            params.prefix.clone(),
            params.copy_type,
            params.set_size as u64,
            params.set_failures as u64,
            params.flush,
            params.cache_bypass,
            params.flush_async,
        );
        let root_check: (std::path::PathBuf, scr_api_types::CopyType, u64, u64, u64, bool, bool) =
            bcast_value(comm.as_ref(), 0, Some(&check))?;
        if root_check != check {
            scr_abort!("configuration differs between rank 0 and rank {}", comm.rank());
        }

        if !params.enabled {
            bail!("scr is disabled via SCR_ENABLE");
        }

        let my_hostname = env::hostname()?;
        let user = env::username().ok();
        let jobid = params.jobid.clone().unwrap_or_else(env::jobid);
        let jobname = params.jobname.clone().or_else(env::jobname);
        let cluster = params.cluster.clone().or_else(env::cluster);

        let groupdescs =
            crate::groupdesc::create_groupdescs(comm.as_ref(), &my_hostname, &config.group_attrs(&my_hostname))?;
        let node_index = groupdesc::index_from_name(&groupdescs, GROUP_NODE).unwrap();
        let my_hostid = groupdescs[node_index].group_id;

        let storedescs = storedesc::create_storedescs(config, &params, &groupdescs)?;
        let reddescs =
            reddesc::create_reddescs(config, &params, comm.as_ref(), &groupdescs, &storedescs)?;

        // control directory for this user and job
        let user_part = user.as_deref().unwrap_or("nobody");
        let cntl_dir = params
            .cntl_base
            .join(user_part)
            .join(format!("scr.{}", jobid));
        scr_tools::fs::create_path(&cntl_dir)?;
        let cindex_file = cntl_dir.join("cindex.scrinfo");

        // the prefix directory must be reachable; create the hidden subtree
        if comm.rank() == 0 {
            scr_tools::fs::create_path(prefix::scr_dir(&params.prefix))?;
        }
        comm.barrier()?;

        if comm.rank() == 0 {
            prefix::write_nodes(&params.prefix, groupdescs[node_index].groups)?;
        }

        let cindex = if cindex_file.exists() {
            CacheIndex::read_from(&cindex_file)?
        } else {
            CacheIndex::new()
        };

        let mut halt_state = HaltState::default();
        if params.halt_seconds > 0 {
            halt_state.halt_seconds = Some(params.halt_seconds);
        }

        let mut scr = Scr {
            params,
            comm,
            my_hostname,
            my_hostid,
            user,
            jobid,
            jobname,
            cluster,
            cntl_dir,
            cindex_file,
            groupdescs,
            storedescs,
            reddescs,
            cindex,
            state: State::Idle,
            dataset_id: 0,
            checkpoint_id: 0,
            ckpt_dset_id: 0,
            have_restart_flag: false,
            output: None,
            restart_map: None,
            halt_state,
            async_flush: None,
            need_checkpoint_count: 0,
            time_checkpoint_end: Instant::now(),
            time_output_start: None,
            time_checkpoint_total: 0.0,
            time_checkpoint_count: 0,
        };

        // seed the halt file so external conditions are visible early
        if scr.comm.rank() == 0 {
            let path = prefix::halt_path(&scr.params.prefix);
            halt::sync_and_decrement(&path, &mut scr.halt_state, 0)?;
        }

        if scr.params.prefix_purge && scr.comm.rank() == 0 {
            scr.prefix_delete_all()?;
        }

        if scr.params.purge {
            scr.cache_purge()?;
        }

        scr.cache_clean()?;

        // scalable restart from surviving caches, then fetch as fallback
        if scr.params.distribute && !scr.params.global_restart {
            scr.cache_rebuild()?;
        } else {
            scr.cache_purge()?;
        }

        if !scr.have_restart_flag && scr.params.fetch {
            scr.fetch_latest()?;
        }

        if scr.have_restart_flag && scr.params.flush_on_restart {
            let id = scr.ckpt_dset_id;
            scr.flush_sync(id)?;
        }

        log::info!(
            "scr {} initialized on rank {} of {} (host {})",
            crate::VERSION,
            scr.comm.rank(),
            scr.comm.size(),
            scr.my_hostname
        );

        Ok(scr)
    }

    /// Tear down the context, flushing the latest checkpoint if the flush
    /// policy still owes one.
    pub fn finalize(mut self) -> Result<(), Error> {
        self.assert_state(State::Idle, "finalize");

        // let an in-flight async flush finish
        if self.async_flush.is_some() {
            self.flush_async_wait()?;
        }

        if self.params.flush > 0 && self.ckpt_dset_id > 0 {
            let id = self.ckpt_dset_id;
            if self.needs_flush(id)? {
                self.flush_sync(id)?;
            }
        }

        if self.comm.rank() == 0 {
            self.halt_state.exit_reason = Some(halt::FINALIZE_CALLED.to_string());
            let path = prefix::halt_path(&self.params.prefix);
            halt::sync_and_decrement(&path, &mut self.halt_state, 0)?;
        }

        self.comm.barrier()?;
        Ok(())
    }

    /// Ask whether the application should take a checkpoint now, based on
    /// the configured interval, elapsed time and overhead heuristics plus
    /// the halt state.
    pub fn need_checkpoint(&mut self) -> Result<bool, Error> {
        self.assert_state(State::Idle, "need_checkpoint");
        self.comm.barrier()?;

        self.need_checkpoint_count += 1;

        let mut flag = self.check_halt(false, 0)?;

        if self.comm.rank() == 0 && !flag {
            let params = &self.params;
            if params.checkpoint_interval > 0
                && self.need_checkpoint_count % params.checkpoint_interval == 0
            {
                flag = true;
            }

            if !flag && params.checkpoint_seconds > 0 {
                let since = self.time_checkpoint_end.elapsed().as_secs();
                if since >= params.checkpoint_seconds {
                    flag = true;
                }
            }

            if !flag && params.checkpoint_overhead > 0.0 {
                if self.time_checkpoint_count == 0 {
                    // no cost estimate yet; take one checkpoint to get one
                    flag = true;
                } else {
                    let avg_cost = self.time_checkpoint_total / self.time_checkpoint_count as f64;
                    let since = self.time_checkpoint_end.elapsed().as_secs_f64();
                    let percent = avg_cost / (since + avg_cost) * 100.0;
                    if percent < params.checkpoint_overhead {
                        flag = true;
                    }
                }
            }

            // with no heuristic configured, always say yes
            if !flag
                && params.checkpoint_interval == 0
                && params.checkpoint_seconds == 0
                && params.checkpoint_overhead <= 0.0
            {
                flag = true;
            }
        }

        Ok(bcast_value(self.comm.as_ref(), 0, Some(&flag))?)
    }

    /// Start a new output dataset.
    pub fn start_output(&mut self, name: Option<&str>, flags: DatasetFlags) -> Result<(), Error> {
        self.assert_state(State::Idle, "start_output");
        self.state = if flags.contains(DatasetFlags::CHECKPOINT) && name.is_none() {
            State::Checkpoint
        } else {
            State::Output
        };
        self.start_output_common(name, flags)
    }

    /// Start a new checkpoint dataset with a generated name.
    pub fn start_checkpoint(&mut self) -> Result<(), Error> {
        self.assert_state(State::Idle, "start_checkpoint");
        self.state = State::Checkpoint;
        self.start_output_common(None, DatasetFlags::CHECKPOINT)
    }

    fn start_output_common(
        &mut self,
        name: Option<&str>,
        flags: DatasetFlags,
    ) -> Result<(), Error> {
        if self.output.is_some() {
            scr_abort!("complete_output must be called before start_output is called again");
        }

        // everyone must be ready before older datasets are evicted
        self.comm.barrier()?;

        let is_ckpt = flags.contains(DatasetFlags::CHECKPOINT);

        // If a restart was loaded but never consumed, or this is the very
        // first output, jump the counters past anything in the index so new
        // datasets cannot collide with existing ones.
        if self.have_restart_flag || self.dataset_id == 0 {
            let ids = if self.comm.rank() == 0 {
                match PrefixIndex::load(&self.params.prefix) {
                    Ok(index) => Some(index.max_ids()),
                    Err(_) => None,
                }
            } else {
                None
            };
            let ids: Option<(u64, u64, u64)> = bcast_value(self.comm.as_ref(), 0, Some(&ids))?;
            if let Some((max_id, max_ckpt, max_ckpt_dset)) = ids {
                if max_id > self.dataset_id {
                    self.dataset_id = max_id;
                }
                if max_ckpt > self.checkpoint_id {
                    self.checkpoint_id = max_ckpt;
                    self.ckpt_dset_id = max_ckpt_dset;
                }
            }
            self.have_restart_flag = false;
        }

        self.dataset_id += 1;
        if is_ckpt {
            self.checkpoint_id += 1;
            self.ckpt_dset_id = self.dataset_id;
        }

        let dataset_name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("scr.dataset.{}", self.dataset_id),
        };

        // name and flags must match on every rank
        let root: (String, u32) =
            bcast_value(self.comm.as_ref(), 0, Some(&(dataset_name.clone(), flags.bits())))?;
        if root.0 != dataset_name {
            scr_abort!("dataset name must be identical on all processes");
        }
        if root.1 != flags.bits() {
            scr_abort!("dataset flags must be identical on all processes");
        }

        // rank 0 builds the descriptor, everyone gets a copy
        let dataset = if self.comm.rank() == 0 {
            Some(Dataset {
                id: self.dataset_id,
                name: dataset_name.clone(),
                flags,
                created: env::now_usecs(),
                user: self.user.clone(),
                jobid: Some(self.jobid.clone()),
                jobname: self.jobname.clone(),
                cluster: self.cluster.clone(),
                files: 0,
                size: 0,
                complete: false,
                ckpt: is_ckpt.then_some(self.checkpoint_id),
            })
        } else {
            None
        };
        let dataset: Dataset = bcast_value(self.comm.as_ref(), 0, dataset.as_ref())?;

        let rd = reddesc::select_reddesc(&self.reddescs, &dataset)
            .unwrap_or_else(|| scr_abort!("no redundancy descriptor matches dataset {}", dataset.id));

        self.evict_for(rd)?;

        // register the dataset before touching the directory tree so crash
        // recovery sees an index that covers everything on disk
        let (dataset_dir, my_dir) = self.cache_dirs(&self.reddescs[rd], self.dataset_id);
        self.cindex.set(CacheIndexEntry {
            dataset: dataset.clone(),
            dir: my_dir.to_string_lossy().into_owned(),
            bypass: self.reddescs[rd].bypass,
        });
        self.write_cindex()?;

        if !self.reddescs[rd].bypass {
            let store = &self.storedescs[self.reddescs[rd].store_index];
            store.create_dir(&dataset_dir)?;
        }
        // the hidden subdir holds the filemap even for bypass datasets
        scr_tools::fs::create_path(self.hidden_dir(&my_dir))?;

        // bypass datasets appear in the durable index right away since
        // their files land in the prefix directory as they are written
        if self.reddescs[rd].bypass && self.comm.rank() == 0 {
            PrefixIndex::update(&self.params.prefix, |index| {
                index
                    .datasets
                    .entry(dataset.id)
                    .or_insert_with(|| prefix::IndexEntry::from_dataset(&dataset));
            })?;
        }

        let mut map = Filemap::new();
        map.set_dataset(dataset);
        self.output = Some(OutputState { map, reddesc: rd });

        self.time_output_start = Some(Instant::now());
        if self.comm.rank() == 0 {
            log::info!("starting dataset {} '{}'", self.dataset_id, dataset_name);
            let kind = if is_ckpt {
                "CHECKPOINT_START"
            } else {
                "OUTPUT_START"
            };
            let mut event = Event::new(kind).dataset(self.dataset_id, &dataset_name);
            if is_ckpt {
                event = event.ckpt(self.checkpoint_id);
            }
            event.emit();
        }
        Ok(())
    }

    /// Map a file path to where the process should actually read or write
    /// it. See the lifecycle rules for the per-state behavior.
    pub fn route_file<P: AsRef<Path>>(&mut self, path: P) -> Result<PathBuf, Error> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            bail!("empty path passed to route_file");
        }

        match self.state {
            State::Output | State::Checkpoint => self.route_file_output(path),
            State::Restart => self.route_file_restart(path),
            // outside of a phase the route is the identity, so applications
            // can keep the calls in place unconditionally
            State::Idle => Ok(path.to_path_buf()),
        }
    }

    fn route_file_output(&mut self, path: &Path) -> Result<PathBuf, Error> {
        let output = self
            .output
            .as_mut()
            .expect("output state exists in Output/Checkpoint");
        let rd = &self.reddescs[output.reddesc];

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let absolute = scr_tools::fs::simplify_path(absolute);

        let routed = if rd.bypass {
            if !scr_tools::fs::path_within(&absolute, &self.params.prefix) {
                scr_abort!(
                    "bypass file {:?} is not under the prefix directory {:?}",
                    absolute,
                    self.params.prefix
                );
            }
            if let Some(parent) = absolute.parent() {
                scr_tools::fs::create_path(parent)?;
            }
            absolute.clone()
        } else {
            let name = absolute
                .file_name()
                .ok_or_else(|| format_err!("path {:?} has no file name", absolute))?;
            let entry = self
                .cindex
                .get(self.dataset_id)
                .expect("current dataset registered in cache index");
            Path::new(&entry.dir).join(name)
        };

        let mut meta = FileMeta::new(routed.to_string_lossy().into_owned());
        meta.orig_path = Some(absolute.to_string_lossy().into_owned());
        output.map.add_file(meta);

        Ok(routed)
    }

    fn route_file_restart(&mut self, path: &Path) -> Result<PathBuf, Error> {
        if scr_tools::fs::is_readable(path) {
            return Ok(path.to_path_buf());
        }

        let name = path
            .file_name()
            .ok_or_else(|| format_err!("path {:?} has no file name", path))?;
        let map = self
            .restart_map
            .as_ref()
            .ok_or_else(|| format_err!("no restart filemap loaded"))?;

        for meta in map.files() {
            let candidate = meta.orig_path.as_deref().unwrap_or(&meta.path);
            if Path::new(candidate).file_name() == Some(name) {
                return Ok(PathBuf::from(&meta.path));
            }
        }
        bail!("no restart file matches {:?}", path)
    }

    /// Finish the current output phase: assign ownership, validate files,
    /// apply redundancy and trigger the flush policy.
    pub fn complete_output(&mut self, valid: bool) -> Result<(), Error> {
        if self.state != State::Output && self.state != State::Checkpoint {
            scr_abort!("start_output must be called before complete_output");
        }

        let mut output = self
            .output
            .take()
            .unwrap_or_else(|| scr_abort!("start_output must be called before complete_output"));
        let rd_index = output.reddesc;
        let bypass = self.reddescs[rd_index].bypass;

        self.assign_ownership(&mut output.map, bypass)?;

        // validate each file this process still owns
        let mut files_valid = valid;
        let mut my_files = 0u64;
        let mut my_bytes = 0u64;
        let mut updates = Vec::new();
        for meta in output.map.files() {
            my_files += 1;
            let mut meta = meta.clone();
            let mut file_valid = valid;

            if !scr_tools::fs::is_readable(&meta.path) {
                log::warn!("no read access to {:?}", meta.path);
                file_valid = false;
                files_valid = false;
            }

            match scr_tools::fs::stat_file(&meta.path) {
                Ok(stat) => {
                    meta.size = stat.st_size as u64;
                    meta.stat = Some(scr_api_types::StatSnapshot {
                        mode: stat.st_mode as u32,
                        uid: stat.st_uid,
                        gid: stat.st_gid,
                        mtime: (stat.st_mtime, stat.st_mtime_nsec),
                        ctime: (stat.st_ctime, stat.st_ctime_nsec),
                    });
                }
                Err(_) => {
                    file_valid = false;
                    files_valid = false;
                }
            }

            my_bytes += meta.size;
            meta.complete = file_valid;
            updates.push(meta);
        }
        for meta in updates {
            output.map.set_meta(meta);
        }

        let total_files = allreduce_sum(self.comm.as_ref(), my_files)?;
        let total_bytes = allreduce_sum(self.comm.as_ref(), my_bytes)?;
        let all_valid = allreduce_and(self.comm.as_ref(), files_valid)?;

        // update the dataset descriptor everywhere
        let mut dataset = output.map.dataset().cloned().expect("dataset set");
        dataset.files = total_files;
        dataset.size = total_bytes;
        dataset.complete = all_valid;
        output.map.set_dataset(dataset.clone());
        self.cindex.set(CacheIndexEntry {
            dataset: dataset.clone(),
            dir: self
                .cindex
                .get(dataset.id)
                .map(|entry| entry.dir.clone())
                .unwrap_or_default(),
            bypass,
        });
        self.write_cindex()?;
        output.map.write_to(self.filemap_path_for(dataset.id))?;

        let mut rc = all_valid;

        if rc && !bypass {
            let ctx = self.redundancy_ctx(dataset.id);
            rc = redundancy::apply(&ctx, &self.reddescs[rd_index], &mut output.map)?;
        }

        let is_ckpt = dataset.is_ckpt();
        let is_output = dataset.is_output();

        if rc {
            if self.comm.rank() == 0 {
                FlushFile::update(&self.params.prefix, |flush| {
                    flush.datasets.insert(
                        dataset.id,
                        FlushEntry {
                            name: dataset.name.clone(),
                            location: [Location::Cache].into_iter().collect(),
                            ckpt: is_ckpt,
                            output: is_output,
                        },
                    );
                })?;
            }
            self.comm.barrier()?;

            // a bypass dataset is nearly flushed already, finish it now
            if bypass {
                let id = dataset.id;
                self.flush_sync(id)?;
            }

            if is_ckpt {
                self.check_halt(true, 1)?;
            }
            self.check_flush()?;
        } else {
            // conserve cache space, this dataset cannot be used
            let id = dataset.id;
            self.cache_delete(id)?;
        }

        // opportunistically drive an in-flight async flush forward
        self.flush_async_progress()?;

        let phase_secs = self
            .time_output_start
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        if is_ckpt {
            self.time_checkpoint_total += phase_secs;
            self.time_checkpoint_count += 1;
            self.time_checkpoint_end = Instant::now();
        }
        self.time_output_start = None;

        self.comm.barrier()?;
        self.state = State::Idle;

        if self.comm.rank() == 0 {
            log::info!(
                "completed dataset {} ({} files, {} bytes, valid {})",
                dataset.id,
                total_files,
                total_bytes,
                rc
            );
            let kind = if is_ckpt {
                "CHECKPOINT_END"
            } else {
                "OUTPUT_END"
            };
            Event::new(kind)
                .dataset(dataset.id, &dataset.name)
                .secs(phase_secs)
                .emit();
            Event::new("WRITE")
                .dataset(dataset.id, &dataset.name)
                .secs(phase_secs)
                .bytes(total_bytes)
                .files(total_files)
                .emit_transfer();
        }

        if rc {
            Ok(())
        } else {
            Err(format_err!("dataset {} is not complete", dataset.id))
        }
    }

    /// Finish the current checkpoint phase.
    pub fn complete_checkpoint(&mut self, valid: bool) -> Result<(), Error> {
        self.complete_output(valid)
    }

    /// Detect files registered by more than one process and keep exactly
    /// one owner. Fatal outside bypass mode.
    fn assign_ownership(&mut self, map: &mut Filemap, bypass: bool) -> Result<(), Error> {
        let mut origins = Vec::new();
        let mut paths = Vec::new();
        for meta in map.files() {
            origins.push(meta.orig_path.clone().unwrap_or_else(|| meta.path.clone()));
            paths.push(meta.path.clone());
        }

        let mine = serde_json::to_vec(&origins)?;
        let all = self.comm.allgather(&mine)?;
        let mut decoded: Vec<Vec<String>> = Vec::with_capacity(all.len());
        for part in &all {
            decoded.push(serde_json::from_slice(part)?);
        }

        let mut multiple_owner = false;
        for (index, origin) in origins.iter().enumerate() {
            let mut claimants = decoded
                .iter()
                .enumerate()
                .flat_map(|(rank, list)| {
                    list.iter()
                        .enumerate()
                        .filter(|(_, other)| *other == origin)
                        .map(move |(i, _)| (rank, i))
                });
            let first = claimants.next();
            let shared = claimants.next().is_some();

            if shared {
                multiple_owner = true;
                if !bypass {
                    log::error!(
                        "multiple processes registered file '{}' while not in bypass mode",
                        origin
                    );
                }
            }

            if first != Some((self.comm.rank(), index)) {
                map.remove_file(&paths[index]);
            }
        }

        let any_multiple = !allreduce_and(self.comm.as_ref(), !multiple_owner)?;
        if any_multiple && !bypass {
            scr_abort!("shared file access detected while not in bypass mode");
        }
        Ok(())
    }

    /// Report whether a recoverable checkpoint is loaded, and its name.
    pub fn have_restart(&mut self) -> Result<Option<String>, Error> {
        self.assert_state(State::Idle, "have_restart");
        self.comm.barrier()?;

        if !self.have_restart_flag {
            return Ok(None);
        }
        let name = self
            .cindex
            .get(self.ckpt_dset_id)
            .map(|entry| entry.dataset.name.clone());
        Ok(name)
    }

    /// Enter the restart phase; returns the name of the loaded checkpoint.
    pub fn start_restart(&mut self) -> Result<String, Error> {
        self.assert_state(State::Idle, "start_restart");
        if !self.have_restart_flag {
            scr_abort!("start_restart requires have_restart to report a checkpoint");
        }
        self.state = State::Restart;
        self.comm.barrier()?;

        let entry = self
            .cindex
            .get(self.ckpt_dset_id)
            .unwrap_or_else(|| scr_abort!("restart dataset {} missing from cache index", self.ckpt_dset_id));
        let name = entry.dataset.name.clone();

        let map_path = self.filemap_path_for(self.ckpt_dset_id);
        self.restart_map = Some(Filemap::read_from(map_path)?);
        Ok(name)
    }

    /// Leave the restart phase. When any rank failed to read its data the
    /// current checkpoint is marked failed, dropped from cache, and the
    /// next older checkpoint (or a fetched one) becomes the restart point.
    pub fn complete_restart(&mut self, valid: bool) -> Result<(), Error> {
        if self.state != State::Restart {
            scr_abort!("start_restart must be called before complete_restart");
        }
        self.state = State::Idle;
        self.restart_map = None;
        self.have_restart_flag = false;

        if allreduce_and(self.comm.as_ref(), valid)? {
            return Ok(());
        }

        // mark this checkpoint failed so fetch does not hand it back
        let failed_id = self.ckpt_dset_id;
        if self.comm.rank() == 0 {
            if let Some(entry) = self.cindex.get(failed_id) {
                let name = entry.dataset.name.clone();
                PrefixIndex::update(&self.params.prefix, |index| {
                    if index.current.as_deref() == Some(name.as_str()) {
                        index.current = None;
                    }
                    if let Some(entry) = index.get_by_name(&name) {
                        let id = entry.id;
                        index.datasets.get_mut(&id).unwrap().failed = true;
                    }
                })?;
            }
        }

        self.cache_delete(failed_id)?;
        self.dataset_id = 0;
        self.checkpoint_id = 0;
        self.ckpt_dset_id = 0;

        // newest remaining checkpoint in cache, if any
        for id in self.cindex.ids().into_iter().rev() {
            if let Some(entry) = self.cindex.get(id) {
                if entry.dataset.is_ckpt() {
                    if id > self.dataset_id {
                        self.dataset_id = id;
                    }
                    if let Some(ckpt) = entry.dataset.ckpt {
                        if ckpt > self.checkpoint_id {
                            self.checkpoint_id = ckpt;
                            self.ckpt_dset_id = id;
                        }
                    }
                }
            }
        }

        if self.checkpoint_id == 0 && self.params.fetch {
            self.fetch_latest()?;
        }

        self.have_restart_flag = self.checkpoint_id > 0;
        Err(format_err!("restart data was not valid on all processes"))
    }

    /// Check the halt state.
    pub fn should_exit(&mut self) -> Result<bool, Error> {
        self.assert_state(State::Idle, "should_exit");
        self.comm.barrier()?;
        self.check_halt(false, 0)
    }

    /// Declare the named checkpoint as the current restart point.
    pub fn current(&mut self, name: &str) -> Result<(), Error> {
        self.assert_state(State::Idle, "current");

        // remember an applied request so later runs do not redo it
        if self.cindex.current() == Some(name) {
            self.comm.barrier()?;
            return Ok(());
        }

        let drop_after = self.params.drop_after_current;
        let found = if self.comm.rank() == 0 {
            PrefixIndex::update(&self.params.prefix, |index| {
                match index.get_by_name(name) {
                    Some(entry) => {
                        let id = entry.id;
                        index.current = Some(name.to_string());
                        if drop_after {
                            index.datasets.retain(|other, _| *other <= id);
                        }
                        true
                    }
                    None => false,
                }
            })?
        } else {
            false
        };
        let found: bool = bcast_value(self.comm.as_ref(), 0, Some(&found))?;
        if !found {
            bail!("no dataset named '{}' in the index", name);
        }

        self.cindex.set_current(Some(name.to_string()));
        self.write_cindex()?;
        Ok(())
    }

    /// Remove a dataset from the durable index only; its data is left in
    /// place.
    pub fn drop_dataset(&mut self, name: &str) -> Result<(), Error> {
        self.assert_state(State::Idle, "drop");

        if self.comm.rank() == 0 {
            PrefixIndex::update(&self.params.prefix, |index| {
                index.remove_by_name(name);
            })?;
        }
        self.comm.barrier()?;
        Ok(())
    }

    /// Remove a dataset from cache, from prefix storage and from the
    /// index.
    pub fn delete(&mut self, name: &str) -> Result<(), Error> {
        self.assert_state(State::Idle, "delete");

        // cache side
        let cached = self
            .cindex
            .ids()
            .into_iter()
            .find(|id| {
                self.cindex
                    .get(*id)
                    .map(|entry| entry.dataset.name == name)
                    .unwrap_or(false)
            });
        if let Some(id) = cached {
            self.cache_delete(id)?;
        }

        // prefix side
        if self.comm.rank() == 0 {
            self.prefix_delete_named(name)?;
        }
        self.comm.barrier()?;
        Ok(())
    }

    /// Library version.
    pub fn version() -> &'static str {
        crate::VERSION
    }

    // ----- internal helpers -----

    fn assert_state(&self, expected: State, operation: &str) {
        if self.state != expected {
            scr_abort!(
                "{} called in the wrong order; next call should be {}",
                operation,
                self.state.expected_call()
            );
        }
    }

    /// Cache directories of a dataset: (dataset dir, this process's dir).
    ///
    /// On a global-view store every node gets a subdirectory so nodes do
    /// not collide inside the shared dataset directory.
    pub(crate) fn cache_dirs(&self, rd: &RedDesc, id: u64) -> (PathBuf, PathBuf) {
        let store = &self.storedescs[rd.store_index];
        let user_part = self.user.as_deref().unwrap_or("nobody");
        let dataset_dir = store
            .base
            .join(user_part)
            .join(format!("scr.{}", self.jobid))
            .join(layout::dataset_dir_name(id));
        let my_dir = match store.view {
            StoreView::NodeLocal => dataset_dir.clone(),
            StoreView::Global => dataset_dir.join(layout::node_dir_name(self.my_hostid)),
        };
        (dataset_dir, my_dir)
    }

    pub(crate) fn hidden_dir(&self, my_dir: &Path) -> PathBuf {
        layout::hidden_dir(my_dir)
    }

    pub(crate) fn filemap_path_for(&self, id: u64) -> PathBuf {
        let dir = self
            .cindex
            .get(id)
            .map(|entry| PathBuf::from(&entry.dir))
            .unwrap_or_default();
        layout::hidden_dir(dir).join(layout::filemap_name(self.comm.rank()))
    }

    pub(crate) fn redundancy_ctx(&self, id: u64) -> RedundancyCtx {
        let dir = self
            .cindex
            .get(id)
            .map(|entry| PathBuf::from(&entry.dir))
            .unwrap_or_default();
        RedundancyCtx {
            world_rank: self.comm.rank(),
            dataset_dir: dir.clone(),
            hidden_dir: layout::hidden_dir(&dir),
            filemap_path: layout::hidden_dir(&dir).join(layout::filemap_name(self.comm.rank())),
            buf_size: self.params.mpi_buf_size,
            crc_on_copy: self.params.crc_on_copy,
        }
    }

    pub(crate) fn write_cindex(&self) -> Result<(), Error> {
        self.cindex.write_to(&self.cindex_file)
    }

    /// Delete a dataset from cache: files first, then the filemap and the
    /// index entry, so a crash mid-way leaves records that cover what is
    /// still on disk.
    pub(crate) fn cache_delete(&mut self, id: u64) -> Result<(), Error> {
        if let Some(entry) = self.cindex.get(id).cloned() {
            // bypass datasets keep their files in the prefix directory;
            // only the cached metadata goes
            if !entry.bypass {
                let map_path = self.filemap_path_for(id);
                if let Ok(map) = Filemap::read_from(&map_path) {
                    for meta in map.files() {
                        if self.params.crc_on_delete {
                            if let Some(expected) = meta.crc32 {
                                match scr_tools::fs::crc32_file(&meta.path) {
                                    Ok(actual) if actual == expected => {}
                                    Ok(actual) => log::warn!(
                                        "CRC32 mismatch deleting {:?}: expected {:08x} got {:08x}",
                                        meta.path,
                                        expected,
                                        actual
                                    ),
                                    Err(err) => {
                                        log::warn!("CRC32 of {:?} unavailable - {}", meta.path, err)
                                    }
                                }
                            }
                        }
                        scr_tools::fs::remove_file_quiet(&meta.path)?;
                    }
                }
            }
            scr_tools::fs::remove_dir_all_quiet(Path::new(&entry.dir))?;

            // the shared dataset dir goes once every member is done
            let rd = reddesc::select_reddesc(&self.reddescs, &entry.dataset);
            if let Some(rd) = rd {
                let (dataset_dir, _) = self.cache_dirs(&self.reddescs[rd], id);
                let store = &self.storedescs[self.reddescs[rd].store_index];
                store.delete_dir(&dataset_dir)?;
            }
            self.cindex.unset(id);
            self.write_cindex()?;
        }
        Ok(())
    }

    /// Delete every dataset from cache.
    pub(crate) fn cache_purge(&mut self) -> Result<(), Error> {
        for id in self.cindex.ids() {
            self.cache_delete(id)?;
        }
        self.cindex.clear();
        self.write_cindex()
    }

    /// Drop dataset directories on disk that the cache index does not
    /// describe. A record without data is handled by recover; data without
    /// a record is unusable and only wastes cache space.
    fn cache_clean(&mut self) -> Result<(), Error> {
        let user_part = self.user.as_deref().unwrap_or("nobody");
        let job_dir = self
            .params
            .cache_base
            .join(user_part)
            .join(format!("scr.{}", self.jobid));
        if !job_dir.is_dir() {
            return Ok(());
        }

        for entry in walkdir::WalkDir::new(&job_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = match layout::dataset_id_from_dir(&name) {
                Some(id) => id,
                None => continue,
            };
            if self.cindex.get(id).is_some() {
                continue;
            }

            // a surviving filemap means the control directory was lost but
            // the data was not; take the record back instead of purging
            let map_path = layout::hidden_dir(entry.path())
                .join(layout::filemap_name(self.comm.rank()));
            match Filemap::read_from(&map_path).ok().and_then(|map| {
                map.dataset().cloned()
            }) {
                Some(dataset) => {
                    log::info!("re-registering dataset {} found in cache", id);
                    self.cindex.set(CacheIndexEntry {
                        dataset,
                        dir: entry.path().to_string_lossy().into_owned(),
                        bypass: false,
                    });
                    self.write_cindex()?;
                }
                None => {
                    log::warn!("removing unindexed dataset directory {:?}", entry.path());
                    scr_tools::fs::remove_dir_all_quiet(entry.path())?;
                }
            }
        }
        Ok(())
    }

    /// Evict datasets from the target store until its retention count has
    /// room for one more.
    fn evict_for(&mut self, rd_index: usize) -> Result<(), Error> {
        let max_count = {
            let rd = &self.reddescs[rd_index];
            self.storedescs[rd.store_index].max_count
        };
        if max_count == 0 {
            return Ok(());
        }
        let base = self.reddescs[rd_index].base.clone();

        let in_base = |scr: &Scr, id: u64| -> bool {
            scr.cindex
                .get(id)
                .map(|entry| {
                    storedesc::index_from_child_path(&scr.storedescs, Path::new(&entry.dir))
                        .map(|s| scr.storedescs[s].base == base)
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        };

        let mut count = self
            .cindex
            .ids()
            .into_iter()
            .filter(|id| in_base(self, *id))
            .count();

        let mut flushing = None;
        for id in self.cindex.ids() {
            if count < max_count {
                break;
            }
            if !in_base(self, id) {
                continue;
            }
            if self.async_flush.as_ref().map(|f| f.id) == Some(id) {
                flushing = Some(id);
                continue;
            }
            self.cache_delete(id)?;
            count -= 1;
        }

        // the one in the way is still flushing; wait it out, then evict
        if count >= max_count {
            if let Some(id) = flushing {
                self.flush_async_wait()?;
                self.cache_delete(id)?;
            }
        }
        Ok(())
    }

    /// Evaluate the halt conditions; rank 0 reads the halt file and the
    /// decision is broadcast. With `halt_now` set and an active condition,
    /// flushes are finished and the job exits collectively.
    pub(crate) fn check_halt(&mut self, halt_now: bool, decrement: i64) -> Result<bool, Error> {
        let halt_exit = halt_now && self.params.halt_exit;

        let reason = if self.comm.rank() == 0 {
            let path = prefix::halt_path(&self.params.prefix);
            halt::sync_and_decrement(&path, &mut self.halt_state, decrement)?;
            let reason =
                halt::active_condition(&self.halt_state, self.params.end_time).map(String::from);
            if let (Some(reason), true) = (&reason, halt_exit) {
                log::info!("job exiting: {}", reason);
                Event::new("HALT").note("reason", reason).emit();
                self.halt_state.exit_reason = Some(reason.clone());
                halt::sync_and_decrement(&path, &mut self.halt_state, 0)?;
            }
            reason
        } else {
            None
        };

        let need_halt: bool =
            bcast_value(self.comm.as_ref(), 0, Some(&reason.is_some()))?;

        if need_halt && halt_exit {
            // let the in-flight flush finish, or redo it synchronously
            let in_flight = self.async_flush.as_ref().map(|flush| flush.id);
            if let Some(id) = in_flight {
                if id == self.dataset_id {
                    self.flush_async_stop()?;
                } else {
                    self.flush_async_wait()?;
                }
            }

            if self.params.flush > 0 && self.ckpt_dset_id > 0 {
                let id = self.ckpt_dset_id;
                if self.needs_flush(id)? {
                    self.flush_sync(id)?;
                }
            }

            self.comm.barrier()?;
            std::process::exit(0);
        }

        Ok(need_halt)
    }

    /// Flush if the policy calls for it after a completed dataset.
    fn check_flush(&mut self) -> Result<(), Error> {
        let entry = match self.cindex.get(self.dataset_id) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        let mut need_flush = entry.dataset.is_output();
        if !need_flush
            && self.params.flush > 0
            && entry.dataset.is_ckpt()
            && self.checkpoint_id > 0
            && self.checkpoint_id % self.params.flush == 0
        {
            need_flush = true;
        }
        if !need_flush {
            return Ok(());
        }

        // bypass datasets were flushed inside complete_output already
        if entry.bypass {
            return Ok(());
        }

        if self.params.flush_async {
            if self.async_flush.is_some() {
                // only one async flush in flight; finish the previous one
                self.flush_async_wait()?;
            }
            let id = self.dataset_id;
            self.flush_async_start(id)
        } else {
            let id = self.dataset_id;
            self.flush_sync(id)
        }
    }
}
