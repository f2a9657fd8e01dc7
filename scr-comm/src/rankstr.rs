//! Collective string ranking.
//!
//! Processes contribute strings and collectively learn, for each string,
//! which equivalence class it falls in and where the caller ranks within
//! that class. Group descriptors use this to form failure groups from node
//! names, and the flush path uses the leader election variant so exactly
//! one process creates each destination directory.

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::Comm;

/// Result of ranking one string per process across a communicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringRank {
    /// Number of distinct strings across the group.
    pub groups: u64,
    /// Id of the caller's string class; ids follow the sorted order of the
    /// distinct strings and are identical on all members.
    pub group_id: u64,
    /// Caller's rank within its class, ordered by world rank.
    pub group_rank: usize,
    /// Number of members holding the same string.
    pub group_size: usize,
}

/// Rank one string per process.
pub fn rank_strings(comm: &dyn Comm, value: &str) -> Result<StringRank, Error> {
    let all = comm.allgather(value.as_bytes())?;

    let mut distinct: Vec<&[u8]> = all.iter().map(|part| part.as_slice()).collect();
    distinct.sort_unstable();
    distinct.dedup();

    let mine = value.as_bytes();
    let group_id = distinct
        .binary_search(&mine)
        .expect("own string missing from allgather") as u64;

    let mut group_rank = 0;
    let mut group_size = 0;
    for (rank, part) in all.iter().enumerate() {
        if part.as_slice() == mine {
            if rank < comm.rank() {
                group_rank += 1;
            }
            group_size += 1;
        }
    }

    Ok(StringRank {
        groups: distinct.len() as u64,
        group_id,
        group_rank,
        group_size,
    })
}

/// Elect one leader per set of equal strings.
///
/// Each process contributes a list of strings; the returned vector marks,
/// for each input string, whether the caller is the leader of that string's
/// equivalence class. The leader is the occurrence with the lowest
/// (world rank, list index).
pub fn elect_leaders(comm: &dyn Comm, strings: &[String]) -> Result<Vec<bool>, Error> {
    let mine = serde_json::to_vec(strings)?;
    let all = comm.allgather(&mine)?;

    let mut decoded: Vec<Vec<String>> = Vec::with_capacity(all.len());
    for part in &all {
        decoded.push(serde_json::from_slice(part)?);
    }

    let mut leaders = Vec::with_capacity(strings.len());
    for (index, value) in strings.iter().enumerate() {
        let first = decoded
            .iter()
            .enumerate()
            .flat_map(|(rank, list)| {
                list.iter()
                    .enumerate()
                    .filter(|(_, other)| *other == value)
                    .map(move |(i, _)| (rank, i))
            })
            .min();
        leaders.push(first == Some((comm.rank(), index)));
    }
    Ok(leaders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadComm;

    #[test]
    fn ranking_groups_by_string() {
        let comms = ThreadComm::world(4);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(std::thread::spawn(move || {
                // ranks 0,1 on "node1"; ranks 2,3 on "node2"
                let node = if comm.rank() < 2 { "node1" } else { "node2" };
                let rank = rank_strings(&comm, node).unwrap();
                assert_eq!(rank.groups, 2);
                assert_eq!(rank.group_size, 2);
                assert_eq!(rank.group_rank, comm.rank() % 2);
                assert_eq!(rank.group_id, (comm.rank() / 2) as u64);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn leader_per_directory() {
        let comms = ThreadComm::world(3);
        let mut handles = Vec::new();
        for comm in comms {
            handles.push(std::thread::spawn(move || {
                let dirs = vec![
                    "/prefix/out".to_string(),
                    format!("/prefix/out/rank.{}", comm.rank()),
                ];
                let leaders = elect_leaders(&comm, &dirs).unwrap();
                // only rank 0 leads the shared directory, everyone leads their own
                assert_eq!(leaders[0], comm.rank() == 0);
                assert!(leaders[1]);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
