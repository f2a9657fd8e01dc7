//! Redundancy descriptors.
//!
//! A redundancy descriptor binds a scheme to a store and a failure group
//! and owns the communicator of its redundancy set. Sets are carved out of
//! the across-group communicator of the failure group, so members of one
//! set reside in distinct failure groups and the set survives the loss of
//! any one group's worth of members up to the scheme's tolerance.

use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use scr_api_types::{CopyType, Dataset};
use scr_comm::{allreduce_max, allreduce_sum, Comm};

use crate::config::Config;
use crate::groupdesc::{self, GroupDesc};
use crate::storedesc::{self, StoreDesc};
use crate::Params;

pub struct RedDesc {
    pub enabled: bool,
    pub index: usize,
    /// Apply this descriptor when `ckpt_id % interval == 0`; the enabled
    /// descriptor with the largest dividing interval wins.
    pub interval: u64,
    /// Preferred for non-checkpoint output datasets.
    pub output: bool,
    /// Route files directly to the prefix directory.
    pub bypass: bool,
    pub store_index: usize,
    pub group_index: usize,
    pub base: PathBuf,
    pub copy_type: CopyType,
    /// Requested members per redundancy set.
    pub set_size: usize,
    /// Tolerated failures per set (RS only; 1 for XOR/PARTNER).
    pub set_failures: usize,
    /// The redundancy set this process belongs to.
    pub comm: Box<dyn Comm>,
    /// Id of this set, unique across the job.
    pub group_id: u64,
    /// Number of sets formed for this descriptor.
    pub groups: u64,
    /// Set rank to world rank.
    pub group_map: Vec<usize>,
}

impl RedDesc {
    /// Set-relative rank one to the left, with wrap.
    pub fn lhs(&self) -> usize {
        (self.comm.rank() + self.comm.size() - 1) % self.comm.size()
    }

    /// Set-relative rank one to the right, with wrap.
    pub fn rhs(&self) -> usize {
        (self.comm.rank() + 1) % self.comm.size()
    }

    /// Condensed form recorded in shard headers and summaries.
    pub fn info(&self) -> RedDescInfo {
        RedDescInfo {
            copy_type: self.copy_type,
            ranks: self.comm.size(),
            failures: self.set_failures,
            group_id: self.group_id,
        }
    }
}

/// Redundancy parameters recorded alongside encoded data.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RedDescInfo {
    pub copy_type: CopyType,
    pub ranks: usize,
    pub failures: usize,
    pub group_id: u64,
}

struct RedConf {
    enabled: bool,
    interval: u64,
    output: bool,
    bypass: bool,
    store: String,
    group: String,
    copy_type: CopyType,
    set_size: usize,
    set_failures: usize,
}

impl RedConf {
    fn defaults(params: &Params) -> RedConf {
        RedConf {
            enabled: true,
            interval: 1,
            output: false,
            bypass: params.cache_bypass,
            store: params.cache_base.to_string_lossy().into_owned(),
            group: params.group.clone(),
            copy_type: params.copy_type,
            set_size: params.set_size,
            set_failures: params.set_failures,
        }
    }

    fn from_subkeys(
        params: &Params,
        subkeys: &std::collections::BTreeMap<String, String>,
    ) -> Result<RedConf, Error> {
        let mut conf = RedConf::defaults(params);
        for (key, value) in subkeys {
            match key.as_str() {
                "ENABLED" => conf.enabled = value != "0",
                "INTERVAL" => conf.interval = value.parse()?,
                "OUTPUT" => conf.output = value != "0",
                "BYPASS" => conf.bypass = value != "0",
                "STORE" => conf.store = value.clone(),
                "GROUP" => conf.group = value.clone(),
                "TYPE" => conf.copy_type = value.parse()?,
                "SET_SIZE" => conf.set_size = value.parse()?,
                "SET_FAILURES" => conf.set_failures = value.parse()?,
                other => bail!("unknown CKPT descriptor key '{}'", other),
            }
        }
        Ok(conf)
    }
}

/// Degrade the requested scheme to what the actual set size supports.
fn effective_scheme(requested: CopyType, ranks: usize, failures: usize) -> (CopyType, usize) {
    match requested {
        CopyType::Single => (CopyType::Single, 0),
        _ if ranks < 2 => {
            log::warn!(
                "redundancy set of a single rank cannot encode {}; falling back to SINGLE",
                requested
            );
            (CopyType::Single, 0)
        }
        CopyType::Partner => (CopyType::Partner, 1),
        CopyType::Xor => (CopyType::Xor, 1),
        CopyType::Rs => {
            let failures = failures.clamp(1, ranks - 1);
            (CopyType::Rs, failures)
        }
    }
}

fn create_reddesc(
    index: usize,
    conf: &RedConf,
    world: &dyn Comm,
    groups: &[GroupDesc],
    stores: &[StoreDesc],
) -> Result<RedDesc, Error> {
    let store_index = storedesc::index_from_name(stores, &conf.store)
        .ok_or_else(|| format_err!("CKPT descriptor {} names unknown store '{}'", index, conf.store))?;
    let group_index = groupdesc::index_from_name(groups, &conf.group)
        .ok_or_else(|| format_err!("CKPT descriptor {} names unknown group '{}'", index, conf.group))?;

    if conf.set_size < 2 && conf.copy_type != CopyType::Single {
        bail!(
            "CKPT descriptor {} requests {} with set size {}",
            index,
            conf.copy_type,
            conf.set_size
        );
    }

    // carve redundancy sets out of the across-group communicator so that
    // set members land in distinct failure groups
    let comm = match conf.copy_type {
        CopyType::Single => world.split(world.rank() as u64, 0)?,
        _ => {
            let across = &groups[group_index].across;
            let color = (across.rank() / conf.set_size) as u64;
            across.split(color, across.rank())?
        }
    };

    let (copy_type, set_failures) =
        effective_scheme(conf.copy_type, comm.size(), conf.set_failures);

    // set rank to world rank
    let mut group_map = Vec::with_capacity(comm.size());
    for part in comm.allgather(&(world.rank() as u64).to_le_bytes())? {
        let bytes: [u8; 8] = part
            .as_slice()
            .try_into()
            .map_err(|_| format_err!("bad group map payload"))?;
        group_map.push(u64::from_le_bytes(bytes) as usize);
    }

    let group_id = *group_map.iter().min().unwrap() as u64;
    let leader = (comm.rank() == 0) as u64;
    let groups_total = allreduce_sum(world, leader)?;

    Ok(RedDesc {
        enabled: conf.enabled,
        index,
        interval: conf.interval,
        output: conf.output,
        bypass: conf.bypass,
        store_index,
        group_index,
        base: stores[store_index].base.clone(),
        copy_type,
        set_size: conf.set_size,
        set_failures,
        comm,
        group_id,
        groups: groups_total,
        group_map,
    })
}

/// Build the redundancy descriptors from configuration; with no `CKPT`
/// entries a single descriptor is derived from the plain parameters.
/// Collective over the world group.
pub fn create_reddescs(
    config: &Config,
    params: &Params,
    world: &dyn Comm,
    groups: &[GroupDesc],
    stores: &[StoreDesc],
) -> Result<Vec<RedDesc>, Error> {
    let mut confs = Vec::new();
    let entries = config.entries("CKPT");
    if entries.is_empty() {
        confs.push(RedConf::defaults(params));
    } else {
        // entry order must match on all ranks; sort by the numeric index
        let mut indexed = Vec::new();
        for (value, subkeys) in entries {
            let index: u64 = value
                .parse()
                .map_err(|err| format_err!("invalid CKPT index '{}' - {}", value, err))?;
            indexed.push((index, subkeys));
        }
        indexed.sort_by_key(|(index, _)| *index);
        for (_, subkeys) in indexed {
            confs.push(RedConf::from_subkeys(params, subkeys)?);
        }
    }

    let mut descs = Vec::with_capacity(confs.len());
    for (index, conf) in confs.iter().enumerate() {
        descs.push(create_reddesc(index, conf, world, groups, stores)?);
    }

    if !descs
        .iter()
        .any(|desc| desc.enabled && desc.interval == 1)
    {
        bail!("no enabled redundancy descriptor with interval 1");
    }

    // all sets must agree on the largest descriptor count
    let count = allreduce_max(world, descs.len() as u64)?;
    if count != descs.len() as u64 {
        bail!("redundancy descriptor count differs across ranks");
    }

    Ok(descs)
}

/// Pick the descriptor for a dataset.
///
/// Output datasets prefer the first enabled descriptor flagged for output;
/// checkpoints take the enabled descriptor with the largest interval
/// dividing the checkpoint id; otherwise the first enabled descriptor with
/// interval 1 applies.
pub fn select_reddesc(descs: &[RedDesc], dataset: &Dataset) -> Option<usize> {
    if dataset.is_output() {
        if let Some(index) = descs
            .iter()
            .position(|desc| desc.enabled && desc.output)
        {
            return Some(index);
        }
    }

    if dataset.is_ckpt() {
        if let Some(ckpt_id) = dataset.ckpt {
            let mut best: Option<usize> = None;
            for (index, desc) in descs.iter().enumerate() {
                if desc.enabled
                    && desc.interval > 0
                    && ckpt_id % desc.interval == 0
                    && best.map_or(true, |b| desc.interval > descs[b].interval)
                {
                    best = Some(index);
                }
            }
            if best.is_some() {
                return best;
            }
        }
    }

    descs
        .iter()
        .position(|desc| desc.enabled && desc.interval == 1)
}
