//! Shared-window (one-sided) transport (§4.4.4, §9).
//!
//! Each rank exposes a window logically partitioned `[counter cells |
//! per-origin slot]`. A sender places its message directly into the slot it
//! owns in the destination's window and then increments that slot's counter
//! cell; the destination's progress loop polls the counter cells and drains
//! newly arrived entries in order.
//!
//! The historical reference this core is modeled on reads those counter
//! cells with no memory fence at all, which is a data race: a value can be
//! observed before the write it is supposed to signal has become visible.
//! This implementation closes that hole by using `Release` stores on the
//! sender side and `Acquire` loads on the poll side (§9 "re-examined from
//! the historical reference").

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TransportError;
use crate::types::ProcessId;

use super::{AbortFlag, Message, Transport};

struct Window {
    /// `counters[origin]` counts how many messages `origin` has ever placed
    /// into this window, release-stored by the sender and acquire-loaded by
    /// the owning rank's poll loop.
    counters: Vec<AtomicUsize>,
    /// `slots[origin]` is the queue of messages `origin` has placed but the
    /// owner has not yet drained.
    slots: Vec<Mutex<VecDeque<Message>>>,
}

pub struct OneSidedTransport {
    rank: ProcessId,
    windows: Arc<Vec<Window>>,
    /// How many of `origin`'s messages this rank has drained so far. Only
    /// this rank's own worker thread ever calls `recv_any`, but the
    /// `Transport` trait takes `&self`, so this is an atomic counter rather
    /// than a plain field; there is no cross-thread contention on it.
    seen: Vec<AtomicUsize>,
    abort: AbortFlag,
}

impl Transport for OneSidedTransport {
    fn rank(&self) -> ProcessId {
        self.rank
    }

    fn send(&self, dest: ProcessId, msg: Message) -> Result<(), TransportError> {
        let window = &self.windows[dest];
        window.slots[self.rank].lock().unwrap().push_back(msg);
        // Release: the enqueue above must be visible to any thread that
        // observes the incremented counter.
        window.counters[self.rank].fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn recv_any(&self) -> Result<Message, TransportError> {
        let window = &self.windows[self.rank];
        loop {
            for origin in 0..window.counters.len() {
                let published = window.counters[origin].load(Ordering::Acquire);
                let drained = self.seen[origin].load(Ordering::Relaxed);
                if published > drained {
                    let mut slot = window.slots[origin].lock().unwrap();
                    if let Some(msg) = slot.pop_front() {
                        drop(slot);
                        self.seen[origin].fetch_add(1, Ordering::Relaxed);
                        return Ok(msg);
                    }
                }
            }
            if self.abort.load(Ordering::Acquire) {
                return Err(TransportError::Aborted);
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

/// Builds one [`OneSidedTransport`] handle per rank of an `nprocs`-wide
/// mesh, each sharing the same set of windows and the same `abort` flag, so
/// any rank's failure unblocks every other rank's poll loop.
pub fn build_world(nprocs: usize, abort: AbortFlag) -> Vec<OneSidedTransport> {
    let windows = Arc::new(
        (0..nprocs)
            .map(|_| Window {
                counters: (0..nprocs).map(|_| AtomicUsize::new(0)).collect(),
                slots: (0..nprocs).map(|_| Mutex::new(VecDeque::new())).collect(),
            })
            .collect::<Vec<_>>(),
    );
    (0..nprocs)
        .map(|rank| OneSidedTransport {
            rank,
            windows: Arc::clone(&windows),
            seen: (0..nprocs).map(|_| AtomicUsize::new(0)).collect(),
            abort: abort.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn polling_drains_in_arrival_order_per_origin() {
        let mut world = build_world(2, Arc::new(AtomicBool::new(false)));
        let receiver = world.remove(0);
        let sender = world.remove(0);

        let handle = thread::spawn(move || {
            for i in 0..5 {
                sender
                    .send(0, Message {
                        origin: 1,
                        tag: Tag::ReduceL,
                        supernode: 3,
                        body: vec![i as f64],
                    })
                    .unwrap();
            }
        });
        handle.join().unwrap();

        for i in 0..5 {
            let msg = receiver.recv_any().unwrap();
            assert_eq!(msg.body[0], i as f64);
        }
    }
}
