//! Failure and locality group descriptors.
//!
//! A group is an equivalence class of processes sharing an attribute
//! string. The built-in `NODE` group uses the hostname; further groups come
//! from per-node `GROUPS` configuration entries (power supply, switch, ...).
//! Each descriptor holds a subgroup communicator over the members and an
//! across-group communicator linking equal positions of different groups.

use std::collections::BTreeMap;

use anyhow::{bail, Error};

use scr_api_types::DESCRIPTOR_NAME_REGEX;
use scr_comm::{rank_strings, Comm};

/// Name of the built-in per-node group.
pub const GROUP_NODE: &str = "NODE";

/// Name of the built-in world group (all processes).
pub const GROUP_WORLD: &str = "WORLD";

pub struct GroupDesc {
    pub name: String,
    /// Members sharing this process's attribute value.
    pub comm: Box<dyn Comm>,
    /// Processes holding the same rank within their respective groups.
    pub across: Box<dyn Comm>,
    /// Id of this process's group; dense and identical on all members.
    pub group_id: u64,
    /// Number of distinct groups.
    pub groups: u64,
}

impl GroupDesc {
    fn create(name: &str, value: &str, world: &dyn Comm) -> Result<GroupDesc, Error> {
        let ranking = rank_strings(world, value)?;
        let comm = world.split(ranking.group_id, world.rank())?;
        let across = world.split(comm.rank() as u64, world.rank())?;
        Ok(GroupDesc {
            name: name.to_string(),
            comm,
            across,
            group_id: ranking.group_id,
            groups: ranking.groups,
        })
    }
}

/// Build all group descriptors. Collective; the set of group names must be
/// identical on every rank even though attribute values differ.
pub fn create_groupdescs(
    world: &dyn Comm,
    hostname: &str,
    attrs: &BTreeMap<String, String>,
) -> Result<Vec<GroupDesc>, Error> {
    let mut descs = Vec::with_capacity(2 + attrs.len());

    // WORLD and NODE always exist; a GROUPS entry may override the NODE
    // attribute, e.g. to emulate a topology under a launcher that
    // virtualizes nodes
    let node_value = attrs
        .get(GROUP_NODE)
        .cloned()
        .unwrap_or_else(|| hostname.to_string());

    descs.push(GroupDesc::create(GROUP_WORLD, "world", world)?);
    descs.push(GroupDesc::create(GROUP_NODE, &node_value, world)?);

    for (name, value) in attrs {
        if name == GROUP_NODE || name == GROUP_WORLD {
            continue;
        }
        if !DESCRIPTOR_NAME_REGEX.is_match(name) {
            bail!("invalid group name '{}'", name);
        }
        descs.push(GroupDesc::create(name, value, world)?);
    }

    Ok(descs)
}

/// Index of a group descriptor by name.
pub fn index_from_name(descs: &[GroupDesc], name: &str) -> Option<usize> {
    descs.iter().position(|desc| desc.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scr_comm::thread::ThreadComm;

    #[test]
    fn node_groups_from_hostnames() {
        let comms = ThreadComm::world(4);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(std::thread::spawn(move || {
                let hostname = format!("node{}", comm.rank() / 2);
                let descs =
                    create_groupdescs(&comm, &hostname, &BTreeMap::new()).unwrap();

                let world = &descs[index_from_name(&descs, GROUP_WORLD).unwrap()];
                assert_eq!(world.comm.size(), 4);
                assert_eq!(world.groups, 1);

                let node = &descs[index_from_name(&descs, GROUP_NODE).unwrap()];
                assert_eq!(node.comm.size(), 2);
                assert_eq!(node.groups, 2);
                assert_eq!(node.group_id, (comm.rank() / 2) as u64);
                // across links rank k of node0 with rank k of node1
                assert_eq!(node.across.size(), 2);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
