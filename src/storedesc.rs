//! Storage tier descriptors.
//!
//! A store binds a base directory to the group of processes that share
//! access to it, together with a dataset retention count, the transfer
//! type its mover uses, and whether the tier is node-local or globally
//! visible.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, format_err, Error};

use scr_comm::Comm;

use crate::config::Config;
use crate::groupdesc::{self, GroupDesc, GROUP_NODE};
use crate::mover::XferKind;
use crate::Params;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreView {
    NodeLocal,
    Global,
}

impl FromStr for StoreView {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_uppercase().as_str() {
            "NODE" | "NODE_LOCAL" => Ok(StoreView::NodeLocal),
            "GLOBAL" => Ok(StoreView::Global),
            other => bail!("unknown store view '{}'", other),
        }
    }
}

pub struct StoreDesc {
    /// Stores are named by their base path.
    pub name: String,
    pub base: PathBuf,
    /// Maximum datasets to keep in this store; 0 means unlimited.
    pub max_count: usize,
    pub can_mkdir: bool,
    pub xfer: XferKind,
    pub view: StoreView,
    pub group_index: usize,
    /// Processes sharing access to this store.
    pub comm: Box<dyn Comm>,
}

impl StoreDesc {
    /// Create a directory on this store; one member per storage device
    /// does the work.
    pub fn create_dir<P: AsRef<Path>>(&self, dir: P) -> Result<(), Error> {
        if !self.can_mkdir {
            return Ok(());
        }
        if self.comm.rank() == 0 {
            scr_tools::fs::create_path(dir.as_ref())?;
        }
        self.comm.barrier()?;
        Ok(())
    }

    /// Delete a directory tree on this store.
    pub fn delete_dir<P: AsRef<Path>>(&self, dir: P) -> Result<(), Error> {
        if self.comm.rank() == 0 {
            scr_tools::fs::remove_dir_all_quiet(dir.as_ref())?;
        }
        self.comm.barrier()?;
        Ok(())
    }
}

fn store_from_conf(
    base: &str,
    subkeys: &std::collections::BTreeMap<String, String>,
    default_count: usize,
    groups: &[GroupDesc],
    params: &Params,
) -> Result<StoreDesc, Error> {
    let group_name = subkeys
        .get("GROUP")
        .map(String::as_str)
        .unwrap_or(GROUP_NODE);
    let group_index = groupdesc::index_from_name(groups, group_name)
        .ok_or_else(|| format_err!("store {} names unknown group '{}'", base, group_name))?;

    let max_count = match subkeys.get("COUNT") {
        Some(value) => value
            .parse()
            .map_err(|err| format_err!("invalid COUNT for store {} - {}", base, err))?,
        None => default_count,
    };

    let xfer = match subkeys.get("TYPE") {
        Some(value) => value.parse()?,
        None => params.flush_type,
    };

    let view = match subkeys.get("VIEW") {
        Some(value) => value.parse()?,
        None => StoreView::NodeLocal,
    };

    let can_mkdir = match subkeys.get("MKDIR") {
        Some(value) => value == "1",
        None => true,
    };

    Ok(StoreDesc {
        name: base.to_string(),
        base: PathBuf::from(base),
        max_count,
        can_mkdir,
        xfer,
        view,
        group_index,
        comm: groups[group_index].comm.dup(),
    })
}

/// Build store descriptors from configuration, guaranteeing entries for
/// the control and cache base directories.
pub fn create_storedescs(
    config: &Config,
    params: &Params,
    groups: &[GroupDesc],
) -> Result<Vec<StoreDesc>, Error> {
    let mut descs = Vec::new();

    for (base, subkeys) in config.entries("STORE") {
        descs.push(store_from_conf(base, subkeys, params.cache_size, groups, params)?);
    }

    let empty = std::collections::BTreeMap::new();
    for base in [&params.cache_base, &params.cntl_base] {
        let base = base.to_string_lossy();
        if index_from_name(&descs, &base).is_none() {
            descs.push(store_from_conf(
                &base,
                &empty,
                params.cache_size,
                groups,
                params,
            )?);
        }
    }

    Ok(descs)
}

/// Index of a store descriptor by name (its base path).
pub fn index_from_name(descs: &[StoreDesc], name: &str) -> Option<usize> {
    descs.iter().position(|desc| desc.name == name)
}

/// Index of the store whose base contains `path`; the longest matching
/// base wins.
pub fn index_from_child_path(descs: &[StoreDesc], path: &Path) -> Option<usize> {
    let path = scr_tools::fs::simplify_path(path);
    descs
        .iter()
        .enumerate()
        .filter(|(_, desc)| path.starts_with(&desc.base))
        .max_by_key(|(_, desc)| desc.base.as_os_str().len())
        .map(|(index, _)| index)
}
