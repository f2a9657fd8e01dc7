//! In-process communicator running each rank on its own thread.
//!
//! Every communicator instance owns a private mesh of buffered channel
//! pairs, one per (source, destination) pair, handed out by a registry
//! shared across the job. Sub-communicators created by `split` get a fresh
//! mesh, so traffic on different communicators can never interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{Comm, CommError};

type Payload = Vec<u8>;

/// (parent comm id, split sequence number, color)
type MeshKey = (u64, u64, u64);

struct MeshSlot {
    sender: Option<Sender<Payload>>,
    receiver: Option<Receiver<Payload>>,
}

struct Mesh {
    comm_id: u64,
    size: usize,
    /// Indexed `pairs[src][dst]`.
    pairs: Vec<Vec<MeshSlot>>,
    taken: usize,
}

impl Mesh {
    fn new(comm_id: u64, size: usize) -> Self {
        let pairs = (0..size)
            .map(|_| {
                (0..size)
                    .map(|_| {
                        let (sender, receiver) = unbounded();
                        MeshSlot {
                            sender: Some(sender),
                            receiver: Some(receiver),
                        }
                    })
                    .collect()
            })
            .collect();
        Mesh {
            comm_id,
            size,
            pairs,
            taken: 0,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    next_comm_id: u64,
    meshes: HashMap<MeshKey, Mesh>,
}

/// Allocates channel meshes for communicators derived from one world.
struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner {
                next_comm_id: 1, // 0 is the world communicator
                meshes: HashMap::new(),
            }),
        }
    }

    /// Pick up this member's endpoints for the mesh identified by `key`,
    /// creating the mesh on first arrival.
    fn join(
        &self,
        key: MeshKey,
        size: usize,
        my_rank: usize,
    ) -> (u64, Vec<Sender<Payload>>, Vec<Receiver<Payload>>) {
        let mut inner = self.inner.lock().unwrap();

        if !inner.meshes.contains_key(&key) {
            let comm_id = inner.next_comm_id;
            inner.next_comm_id += 1;
            inner.meshes.insert(key, Mesh::new(comm_id, size));
        }

        let mesh = inner.meshes.get_mut(&key).unwrap();
        assert_eq!(mesh.size, size, "split members disagree on group size");

        let senders = (0..size)
            .map(|dst| mesh.pairs[my_rank][dst].sender.take().unwrap())
            .collect();
        let receivers = (0..size)
            .map(|src| mesh.pairs[src][my_rank].receiver.take().unwrap())
            .collect();

        mesh.taken += 1;
        let comm_id = mesh.comm_id;
        if mesh.taken == size {
            inner.meshes.remove(&key);
        }

        (comm_id, senders, receivers)
    }
}

/// One rank's endpoint of an in-process communicator.
#[derive(Clone)]
pub struct ThreadComm {
    registry: Arc<Registry>,
    id: u64,
    rank: usize,
    size: usize,
    senders: Arc<Vec<Sender<Payload>>>,
    receivers: Arc<Vec<Receiver<Payload>>>,
    split_seq: Arc<AtomicU64>,
}

impl ThreadComm {
    /// Create a world of `n` ranks, returning the endpoint for each rank in
    /// rank order. Endpoints are meant to move onto their own threads.
    pub fn world(n: usize) -> Vec<ThreadComm> {
        assert!(n > 0, "communicator needs at least one rank");
        let registry = Arc::new(Registry::new());
        let mut mesh = Mesh::new(0, n);

        (0..n)
            .map(|rank| {
                let senders = (0..n)
                    .map(|dst| mesh.pairs[rank][dst].sender.take().unwrap())
                    .collect();
                let receivers = (0..n)
                    .map(|src| mesh.pairs[src][rank].receiver.take().unwrap())
                    .collect();
                ThreadComm {
                    registry: Arc::clone(&registry),
                    id: 0,
                    rank,
                    size: n,
                    senders: Arc::new(senders),
                    receivers: Arc::new(receivers),
                    split_seq: Arc::new(AtomicU64::new(0)),
                }
            })
            .collect()
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn dup(&self) -> Box<dyn Comm> {
        Box::new(self.clone())
    }

    fn split(&self, color: u64, key: usize) -> Result<Box<dyn Comm>, CommError> {
        let seq = self.split_seq.fetch_add(1, Ordering::SeqCst);

        // collect (color, key, rank) from everyone
        let mut mine = Vec::with_capacity(24);
        mine.extend_from_slice(&color.to_le_bytes());
        mine.extend_from_slice(&(key as u64).to_le_bytes());
        mine.extend_from_slice(&(self.rank as u64).to_le_bytes());
        let all = self.allgather(&mine)?;

        let mut members = Vec::new();
        for part in &all {
            if part.len() != 24 {
                return Err(CommError::Protocol("bad split payload".to_string()));
            }
            let their_color = u64::from_le_bytes(part[0..8].try_into().unwrap());
            let their_key = u64::from_le_bytes(part[8..16].try_into().unwrap());
            let their_rank = u64::from_le_bytes(part[16..24].try_into().unwrap()) as usize;
            if their_color == color {
                members.push((their_key, their_rank));
            }
        }
        members.sort_unstable();

        let new_rank = members
            .iter()
            .position(|&(_, rank)| rank == self.rank)
            .expect("split member list misses caller");

        let (comm_id, senders, receivers) =
            self.registry
                .join((self.id, seq, color), members.len(), new_rank);

        Ok(Box::new(ThreadComm {
            registry: Arc::clone(&self.registry),
            id: comm_id,
            rank: new_rank,
            size: members.len(),
            senders: Arc::new(senders),
            receivers: Arc::new(receivers),
            split_seq: Arc::new(AtomicU64::new(0)),
        }))
    }

    fn send(&self, dest: usize, data: Vec<u8>) -> Result<(), CommError> {
        let sender = self
            .senders
            .get(dest)
            .ok_or(CommError::RankOutOfRange(dest, self.size))?;
        sender
            .send(data)
            .map_err(|_| CommError::Disconnected(dest))
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>, CommError> {
        let receiver = self
            .receivers
            .get(src)
            .ok_or(CommError::RankOutOfRange(src, self.size))?;
        receiver.recv().map_err(|_| CommError::Disconnected(src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_send() {
        let mut world = ThreadComm::world(1);
        let comm = world.pop().unwrap();
        comm.send(0, b"loop".to_vec()).unwrap();
        assert_eq!(comm.recv(0).unwrap(), b"loop");
        comm.barrier().unwrap();
    }

    #[test]
    fn out_of_range() {
        let mut world = ThreadComm::world(2);
        let comm = world.remove(0);
        assert!(matches!(
            comm.send(5, Vec::new()),
            Err(CommError::RankOutOfRange(5, 2))
        ));
    }
}
