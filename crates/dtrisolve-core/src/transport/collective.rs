//! The paired all-to-all exchanges used by the redistributor (C3, §4.3):
//! "one integer `Alltoallv` (indices) followed by one double `Alltoallv`
//! (values)". Both are genuine collectives — every rank blocks until every
//! other rank has published and every rank has drained — independent of
//! which point-to-point [`super::Transport`] the solve engines use.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::TransportError;

/// Shared state for one mesh's worth of all-to-all exchanges. Call
/// [`CollectiveWorld::exchange_values`]/[`exchange_indices`] once per rank
/// per logical collective call; every rank must call it the same number of
/// times; a lone rank skipping a call deadlocks every other rank on the
/// barrier, mirroring a real `MPI_Alltoallv` mismatch.
pub struct CollectiveWorld {
    nprocs: usize,
    value_slots: Vec<Mutex<Vec<f64>>>,
    index_slots: Vec<Mutex<Vec<i64>>>,
    publish_barrier: Barrier,
    drain_barrier: Barrier,
}

impl CollectiveWorld {
    pub fn new(nprocs: usize) -> Arc<Self> {
        Arc::new(Self {
            nprocs,
            value_slots: (0..nprocs * nprocs).map(|_| Mutex::new(Vec::new())).collect(),
            index_slots: (0..nprocs * nprocs).map(|_| Mutex::new(Vec::new())).collect(),
            publish_barrier: Barrier::new(nprocs.max(1)),
            drain_barrier: Barrier::new(nprocs.max(1)),
        })
    }

    fn slot(nprocs: usize, src: usize, dest: usize) -> usize {
        src * nprocs + dest
    }

    /// Each rank `rank` supplies `send[dest]`, the values bound for `dest`;
    /// returns `recv[src]`, the values this rank received from `src`.
    pub fn exchange_values(
        &self,
        rank: usize,
        send: Vec<Vec<f64>>,
    ) -> Result<Vec<Vec<f64>>, TransportError> {
        if send.len() != self.nprocs {
            return Err(TransportError::CollectiveSizeMismatch {
                expected: self.nprocs,
                actual: send.len(),
            });
        }
        for (dest, buf) in send.into_iter().enumerate() {
            *self.value_slots[Self::slot(self.nprocs, rank, dest)]
                .lock()
                .unwrap() = buf;
        }
        self.publish_barrier.wait();
        let recv = (0..self.nprocs)
            .map(|src| {
                self.value_slots[Self::slot(self.nprocs, src, rank)]
                    .lock()
                    .unwrap()
                    .clone()
            })
            .collect();
        self.drain_barrier.wait();
        Ok(recv)
    }

    pub fn exchange_indices(
        &self,
        rank: usize,
        send: Vec<Vec<i64>>,
    ) -> Result<Vec<Vec<i64>>, TransportError> {
        if send.len() != self.nprocs {
            return Err(TransportError::CollectiveSizeMismatch {
                expected: self.nprocs,
                actual: send.len(),
            });
        }
        for (dest, buf) in send.into_iter().enumerate() {
            *self.index_slots[Self::slot(self.nprocs, rank, dest)]
                .lock()
                .unwrap() = buf;
        }
        self.publish_barrier.wait();
        let recv = (0..self.nprocs)
            .map(|src| {
                self.index_slots[Self::slot(self.nprocs, src, rank)]
                    .lock()
                    .unwrap()
                    .clone()
            })
            .collect();
        self.drain_barrier.wait();
        Ok(recv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn four_way_exchange_routes_by_destination() {
        let world = CollectiveWorld::new(4);
        let mut handles = Vec::new();
        for rank in 0..4 {
            let world = Arc::clone(&world);
            handles.push(thread::spawn(move || {
                let send: Vec<Vec<f64>> = (0..4).map(|dest| vec![(rank * 10 + dest) as f64]).collect();
                world.exchange_values(rank, send).unwrap()
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for dest in 0..4 {
            for src in 0..4 {
                assert_eq!(results[dest][src][0], (src * 10 + dest) as f64);
            }
        }
    }
}
