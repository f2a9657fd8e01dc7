//! Collective communication interface for the scr workspace.
//!
//! The library itself never talks to a network; every exchange goes through
//! the [`Comm`] trait, which models the fixed process group of a parallel
//! job. Point-to-point sends are buffered, so a send never blocks on the
//! matching receive. Collectives are built from the point-to-point
//! primitives and must be entered by every member of the communicator in
//! the same order.
//!
//! [`thread::ThreadComm`] provides an in-process implementation used by the
//! test harness and by embeddings that run ranks as threads.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod rankstr;
pub mod thread;

pub use rankstr::{elect_leaders, rank_strings, StringRank};

/// Errors raised by the transport.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("rank {0} disconnected")]
    Disconnected(usize),
    #[error("rank {0} is out of range for communicator of size {1}")]
    RankOutOfRange(usize, usize),
    #[error("{0}")]
    Protocol(String),
}

/// A communicator over a fixed group of processes.
///
/// `rank` and `size` are stable for the lifetime of the communicator. The
/// default collective implementations are linear over the buffered
/// point-to-point layer, which is the honest cost model for the group sizes
/// a redundancy set uses.
pub trait Comm: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Duplicate this communicator. Operations on the duplicate share the
    /// member group and ordering domain of the original.
    fn dup(&self) -> Box<dyn Comm>;

    /// Collectively partition members by `color`; members of one color form
    /// a new communicator ordered by (`key`, old rank).
    fn split(&self, color: u64, key: usize) -> Result<Box<dyn Comm>, CommError>;

    /// Buffered send; completes without waiting for the receiver.
    fn send(&self, dest: usize, data: Vec<u8>) -> Result<(), CommError>;

    /// Blocking receive of the next message from `src`.
    fn recv(&self, src: usize) -> Result<Vec<u8>, CommError>;

    /// Simultaneous exchange with two peers (which may be the same rank).
    fn sendrecv(
        &self,
        dest: usize,
        data: &[u8],
        src: usize,
    ) -> Result<Vec<u8>, CommError> {
        self.send(dest, data.to_vec())?;
        self.recv(src)
    }

    /// Broadcast `buf` from `root` to every member.
    fn bcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<(), CommError> {
        if root >= self.size() {
            return Err(CommError::RankOutOfRange(root, self.size()));
        }
        if self.rank() == root {
            for dest in 0..self.size() {
                if dest != root {
                    self.send(dest, buf.clone())?;
                }
            }
        } else {
            *buf = self.recv(root)?;
        }
        Ok(())
    }

    /// Gather one buffer per member at `root`; other ranks get `None`.
    fn gather(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        if root >= self.size() {
            return Err(CommError::RankOutOfRange(root, self.size()));
        }
        if self.rank() == root {
            let mut parts = Vec::with_capacity(self.size());
            for src in 0..self.size() {
                if src == root {
                    parts.push(data.to_vec());
                } else {
                    parts.push(self.recv(src)?);
                }
            }
            Ok(Some(parts))
        } else {
            self.send(root, data.to_vec())?;
            Ok(None)
        }
    }

    /// Gather one buffer per member at every member.
    fn allgather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        match self.gather(0, data)? {
            Some(parts) => {
                let mut framed = frame(&parts);
                self.bcast(0, &mut framed)?;
                Ok(parts)
            }
            None => {
                let mut framed = Vec::new();
                self.bcast(0, &mut framed)?;
                unframe(&framed)
            }
        }
    }

    /// Rendezvous of all members.
    fn barrier(&self) -> Result<(), CommError> {
        self.allgather(&[])?;
        Ok(())
    }
}

fn frame(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(parts.len() as u64).to_le_bytes());
    for part in parts {
        buf.extend_from_slice(&(part.len() as u64).to_le_bytes());
        buf.extend_from_slice(part);
    }
    buf
}

fn unframe(buf: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
    fn take<'a>(rest: &mut &'a [u8], n: usize) -> Result<&'a [u8], CommError> {
        if rest.len() < n {
            return Err(CommError::Protocol("truncated frame".to_string()));
        }
        let (head, tail) = rest.split_at(n);
        *rest = tail;
        Ok(head)
    }

    let mut rest = buf;
    let count = u64::from_le_bytes(take(&mut rest, 8)?.try_into().unwrap()) as usize;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len = u64::from_le_bytes(take(&mut rest, 8)?.try_into().unwrap()) as usize;
        parts.push(take(&mut rest, len)?.to_vec());
    }
    Ok(parts)
}

/// True only if `value` is true on every member.
pub fn allreduce_and(comm: &dyn Comm, value: bool) -> Result<bool, CommError> {
    let all = comm.allgather(&[value as u8])?;
    Ok(all.iter().all(|part| part == &[1u8]))
}

/// Sum of `value` across all members.
pub fn allreduce_sum(comm: &dyn Comm, value: u64) -> Result<u64, CommError> {
    let all = comm.allgather(&value.to_le_bytes())?;
    let mut total = 0u64;
    for part in all {
        let bytes: [u8; 8] = part
            .as_slice()
            .try_into()
            .map_err(|_| CommError::Protocol("bad sum payload".to_string()))?;
        total += u64::from_le_bytes(bytes);
    }
    Ok(total)
}

/// Maximum of `value` across all members.
pub fn allreduce_max(comm: &dyn Comm, value: u64) -> Result<u64, CommError> {
    let all = comm.allgather(&value.to_le_bytes())?;
    let mut max = 0u64;
    for part in all {
        let bytes: [u8; 8] = part
            .as_slice()
            .try_into()
            .map_err(|_| CommError::Protocol("bad max payload".to_string()))?;
        max = max.max(u64::from_le_bytes(bytes));
    }
    Ok(max)
}

/// Broadcast a serde value from `root`.
pub fn bcast_value<T: Serialize + DeserializeOwned>(
    comm: &dyn Comm,
    root: usize,
    value: Option<&T>,
) -> Result<T, anyhow::Error> {
    let mut buf = if comm.rank() == root {
        match value {
            Some(value) => serde_json::to_vec(value)?,
            None => anyhow::bail!("bcast_value root rank passed no value"),
        }
    } else {
        Vec::new()
    };
    comm.bcast(root, &mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Verify that a collective argument is identical on all members.
///
/// Returns the rank-0 value so callers can compare locally and abort with a
/// uniform diagnostic.
pub fn bcast_for_compare<T: Serialize + DeserializeOwned>(
    comm: &dyn Comm,
    value: &T,
) -> Result<T, anyhow::Error> {
    bcast_value(comm, 0, Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadComm;

    fn run_ranks<F>(n: usize, f: F)
    where
        F: Fn(ThreadComm) + Send + Sync + Clone + 'static,
    {
        let comms = ThreadComm::world(n);
        let mut handles = Vec::new();
        for comm in comms {
            let f = f.clone();
            handles.push(std::thread::spawn(move || f(comm)));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn bcast_and_gather() {
        run_ranks(4, |comm| {
            let mut buf = if comm.rank() == 1 {
                b"hello".to_vec()
            } else {
                Vec::new()
            };
            comm.bcast(1, &mut buf).unwrap();
            assert_eq!(buf, b"hello");

            let mine = vec![comm.rank() as u8];
            let gathered = comm.gather(0, &mine).unwrap();
            if comm.rank() == 0 {
                assert_eq!(gathered.unwrap(), vec![vec![0], vec![1], vec![2], vec![3]]);
            } else {
                assert!(gathered.is_none());
            }
        });
    }

    #[test]
    fn allgather_and_reductions() {
        run_ranks(3, |comm| {
            let all = comm.allgather(&[comm.rank() as u8; 2]).unwrap();
            assert_eq!(all.len(), 3);
            assert_eq!(all[2], vec![2, 2]);

            assert_eq!(allreduce_sum(&comm, comm.rank() as u64 + 1).unwrap(), 6);
            assert_eq!(allreduce_max(&comm, comm.rank() as u64).unwrap(), 2);
            assert!(allreduce_and(&comm, true).unwrap());
            assert!(!allreduce_and(&comm, comm.rank() != 1).unwrap());
        });
    }

    #[test]
    fn sendrecv_ring() {
        run_ranks(4, |comm| {
            let right = (comm.rank() + 1) % comm.size();
            let left = (comm.rank() + comm.size() - 1) % comm.size();
            let got = comm
                .sendrecv(right, &[comm.rank() as u8], left)
                .unwrap();
            assert_eq!(got, vec![left as u8]);
        });
    }

    #[test]
    fn split_by_parity() {
        run_ranks(4, |comm| {
            let color = (comm.rank() % 2) as u64;
            let sub = comm.split(color, comm.rank()).unwrap();
            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), comm.rank() / 2);

            // world ranks of the subgroup via allgather on the subgroup
            let ranks = sub.allgather(&[comm.rank() as u8]).unwrap();
            let expect: Vec<Vec<u8>> = if color == 0 {
                vec![vec![0], vec![2]]
            } else {
                vec![vec![1], vec![3]]
            };
            assert_eq!(ranks, expect);
        });
    }
}
