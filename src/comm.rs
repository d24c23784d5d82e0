//! A fixed-size group of cooperating workers and the collective operations between them.
//!
//! Each worker runs on its own thread with exclusive ownership of its shard of every
//! distributed dataset. Workers only exchange data through the collectives on [`Comm`], which
//! every worker must call in the same order. A worker that fails drops its endpoints, so a
//! collective waiting on it returns [`CommError::Disconnected`] instead of hanging.

use std::{fmt::Debug, ops::Range, thread};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;
use thiserror::Error;

use crate::dataset::DataArray;

/// Errors raised by collective operations.
#[derive(Error, Debug)]
pub enum CommError {
    /// A peer dropped out of the group, usually because it failed.
    #[error("worker {peer} disconnected during {operation} (seen by worker {rank})")]
    Disconnected {
        /// The worker that noticed
        rank: usize,
        /// The worker that went away
        peer: usize,
        /// The collective in progress
        operation: &'static str,
    },

    /// A collective was given the wrong number of pieces.
    #[error("{operation} on a group of {size} workers was given {received} pieces")]
    PieceCount {
        /// The collective in progress
        operation: &'static str,
        /// The group size
        size: usize,
        /// The number of pieces supplied
        received: usize,
    },

    /// A peer sent a payload of a different kind than the collective exchanges.
    #[error("{operation} expected {expected} from worker {peer}")]
    UnexpectedPayload {
        /// The collective in progress
        operation: &'static str,
        /// The worker that sent it
        peer: usize,
        /// What was expected
        expected: &'static str,
    },
}

/// Number of elements in each part when splitting `n` elements into `m` near-even parts.
///
/// The first `n % m` parts hold one extra element.
pub fn split_m(n: usize, m: usize) -> Vec<usize> {
    let base = n / m;
    let rem = n % m;
    (0..m).map(|i| base + usize::from(i < rem)).collect()
}

/// The range of elements that part `i` of a near-even split of `n` into `m` holds.
pub fn partition(n: usize, m: usize, i: usize) -> Range<usize> {
    let base = n / m;
    let rem = n % m;
    let start = i * base + i.min(rem);
    start..start + base + usize::from(i < rem)
}

/// One worker's endpoint in a group.
///
/// Cloning a [`Comm`] gives another handle to the same endpoint; containers derived from one
/// another share their worker's endpoint.
#[derive(Clone)]
pub struct Comm {
    rank: usize,
    size: usize,
    /// `senders[peer]` delivers to `peer`
    senders: Vec<Sender<DataArray>>,
    /// `receivers[peer]` yields what `peer` sent to this worker
    receivers: Vec<Receiver<DataArray>>,
}

impl Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Comm {
    /// Create the endpoints of a fully connected group of `size` workers, in rank order.
    pub fn world(size: usize) -> Vec<Comm> {
        let size = size.max(1);
        // channels[src][dst]
        let channels: Vec<Vec<(Sender<DataArray>, Receiver<DataArray>)>> = (0..size)
            .map(|_| (0..size).map(|_| unbounded()).collect())
            .collect();
        (0..size)
            .map(|rank| Comm {
                rank,
                size,
                senders: (0..size).map(|dst| channels[rank][dst].0.clone()).collect(),
                receivers: (0..size).map(|src| channels[src][rank].1.clone()).collect(),
            })
            .collect()
    }

    /// A group with a single worker.
    pub fn solo() -> Comm {
        Comm::world(1).remove(0)
    }

    /// This worker's index in the group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The number of workers in the group.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this is worker 0.
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    fn send(&self, peer: usize, data: DataArray, operation: &'static str) -> Result<(), CommError> {
        self.senders[peer]
            .send(data)
            .map_err(|_| CommError::Disconnected {
                rank: self.rank,
                peer,
                operation,
            })
    }

    fn recv(&self, peer: usize, operation: &'static str) -> Result<DataArray, CommError> {
        self.receivers[peer]
            .recv()
            .map_err(|_| CommError::Disconnected {
                rank: self.rank,
                peer,
                operation,
            })
    }

    /// Wait until every worker has reached this point.
    ///
    /// # Errors
    ///
    /// [`CommError::Disconnected`] if a peer has gone away.
    pub fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(DataArray::default()).map(|_| ())
    }

    /// Send `pieces[peer]` to every peer, and receive one piece from each, in rank order.
    ///
    /// # Errors
    ///
    /// [`CommError::PieceCount`] unless there is exactly one piece per worker, or
    /// [`CommError::Disconnected`] if a peer has gone away.
    pub fn all_to_all(&self, pieces: Vec<DataArray>) -> Result<Vec<DataArray>, CommError> {
        const OP: &str = "all_to_all";
        if pieces.len() != self.size {
            return Err(CommError::PieceCount {
                operation: OP,
                size: self.size,
                received: pieces.len(),
            });
        }
        trace!("worker {} {}", self.rank, OP);
        // channels are unbounded, so every send completes before any receive blocks
        for (peer, piece) in pieces.into_iter().enumerate() {
            self.send(peer, piece, OP)?;
        }
        (0..self.size).map(|peer| self.recv(peer, OP)).collect()
    }

    /// Give every worker a copy of every worker's piece, in rank order.
    ///
    /// # Errors
    ///
    /// [`CommError::Disconnected`] if a peer has gone away.
    pub fn all_gather(&self, piece: DataArray) -> Result<Vec<DataArray>, CommError> {
        self.all_to_all(vec![piece; self.size])
    }

    /// Collect every worker's piece on `root`. Other workers get `None`.
    ///
    /// # Errors
    ///
    /// [`CommError::Disconnected`] if a peer has gone away.
    pub fn gather(&self, piece: DataArray, root: usize) -> Result<Option<Vec<DataArray>>, CommError> {
        const OP: &str = "gather";
        self.send(root, piece, OP)?;
        if self.rank == root {
            Ok(Some(
                (0..self.size)
                    .map(|peer| self.recv(peer, OP))
                    .collect::<Result<_, _>>()?,
            ))
        } else {
            Ok(None)
        }
    }

    /// Share `root`'s value with every worker. Only `root`'s argument is used.
    ///
    /// # Errors
    ///
    /// [`CommError::Disconnected`] if a peer has gone away.
    pub fn broadcast(&self, value: DataArray, root: usize) -> Result<DataArray, CommError> {
        const OP: &str = "broadcast";
        if self.rank == root {
            for peer in 0..self.size {
                self.send(peer, value.clone(), OP)?;
            }
        }
        self.recv(root, OP)
    }

    /// Gather one count from every worker, in rank order.
    ///
    /// # Errors
    ///
    /// [`CommError::Disconnected`] if a peer has gone away, or
    /// [`CommError::UnexpectedPayload`] if a peer sent something else.
    pub fn all_gather_usize(&self, value: usize) -> Result<Vec<usize>, CommError> {
        const OP: &str = "all_gather_usize";
        self.all_gather(DataArray::scalar(value as i64))?
            .into_iter()
            .enumerate()
            .map(|(peer, data)| match data {
                DataArray::Int(array) if array.len() == 1 => {
                    Ok(array.iter().next().copied().unwrap_or_default() as usize)
                }
                _ => Err(CommError::UnexpectedPayload {
                    operation: OP,
                    peer,
                    expected: "a single integer",
                }),
            })
            .collect()
    }

    /// Sum one count over every worker; every worker receives the total.
    ///
    /// # Errors
    ///
    /// [`CommError::Disconnected`] if a peer has gone away.
    pub fn sum_usize(&self, value: usize) -> Result<usize, CommError> {
        Ok(self.all_gather_usize(value)?.into_iter().sum())
    }

    /// Whether every worker passed `true`.
    ///
    /// # Errors
    ///
    /// [`CommError::Disconnected`] if a peer has gone away.
    pub fn all_ok(&self, ok: bool) -> Result<bool, CommError> {
        Ok(self
            .all_gather_usize(usize::from(ok))?
            .into_iter()
            .all(|value| value == 1))
    }
}

/// Run `work` on `size` workers, one thread each, and return their results in rank order.
///
/// A panic on any worker is resumed on the calling thread.
pub fn run_workers<F, R>(size: usize, work: F) -> Vec<R>
where
    F: Fn(Comm) -> R + Sync,
    R: Send,
{
    let work = &work;
    thread::scope(|scope| {
        let handles: Vec<_> = Comm::world(size)
            .into_iter()
            .map(|comm| {
                scope.spawn(move || work(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_split_m() {
        assert_eq!(split_m(10, 3), vec![4, 3, 3]);
        assert_eq!(split_m(2, 3), vec![1, 1, 0]);
        assert_eq!(partition(10, 3, 0), 0..4);
        assert_eq!(partition(10, 3, 1), 4..7);
        assert_eq!(partition(10, 3, 2), 7..10);
        assert_eq!(partition(2, 3, 2), 2..2);
    }

    #[test]
    fn test_all_to_all_exchanges_pieces() {
        let results = run_workers(3, |comm| {
            let pieces = (0..comm.size())
                .map(|peer| DataArray::scalar((comm.rank() * 10 + peer) as i64))
                .collect();
            comm.all_to_all(pieces).unwrap()
        });
        for (rank, received) in results.into_iter().enumerate() {
            let expected: Vec<_> = (0..3)
                .map(|peer| DataArray::scalar((peer * 10 + rank) as i64))
                .collect();
            assert_eq!(received, expected);
        }
    }

    #[test]
    fn test_gather_and_broadcast() {
        let results = run_workers(2, |comm| {
            let gathered = comm
                .gather(DataArray::from(array![comm.rank() as i64]), 0)
                .unwrap();
            let shared = comm
                .broadcast(DataArray::scalar(comm.rank() as i64 + 7), 1)
                .unwrap();
            comm.barrier().unwrap();
            (gathered.map(|parts| parts.len()), shared)
        });
        assert_eq!(results[0], (Some(2), DataArray::scalar(8)));
        assert_eq!(results[1], (None, DataArray::scalar(8)));
    }

    #[test]
    fn test_all_ok() {
        let results = run_workers(3, |comm| comm.all_ok(comm.rank() != 1).unwrap());
        assert_eq!(results, vec![false, false, false]);
    }

    #[test]
    fn test_disconnected_peer_is_an_error() {
        let results = run_workers(2, |comm| {
            if comm.rank() == 1 {
                // this worker gives up before the collective
                return None;
            }
            Some(comm.all_gather_usize(1))
        });
        assert!(matches!(
            results[0],
            Some(Err(CommError::Disconnected { peer: 1, .. }))
        ));
    }

    #[test]
    fn test_sum_usize() {
        let totals = run_workers(3, |comm| comm.sum_usize(comm.rank() + 1).unwrap());
        assert_eq!(totals, vec![6, 6, 6]);
    }

    #[test]
    fn test_piece_count() {
        let comm = Comm::solo();
        assert!(matches!(
            comm.all_to_all(vec![]),
            Err(CommError::PieceCount { .. })
        ));
    }
}
