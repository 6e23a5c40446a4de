//! Two-sided transport: an any-source/any-tag receive realized as a single
//! inbound multi-producer channel per rank. Every other rank holds a clone
//! of the `Sender` half, so `recv_any` naturally drains messages in arrival
//! order regardless of origin or tag — the channel *is* the receive pool
//! the historical reference sizes to `maxrecvsz * (nfrecvx + 1)`.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::error::TransportError;
use crate::types::ProcessId;

use super::{AbortFlag, Message, Transport};

/// How often `recv_any` re-checks the shared abort flag while otherwise
/// blocked waiting for a message. Short enough that an aborted mesh unwinds
/// promptly, long enough not to spin.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct TwoSidedTransport {
    rank: ProcessId,
    senders: Vec<Sender<Message>>,
    receiver: Receiver<Message>,
    abort: AbortFlag,
}

impl Transport for TwoSidedTransport {
    fn rank(&self) -> ProcessId {
        self.rank
    }

    fn send(&self, dest: ProcessId, msg: Message) -> Result<(), TransportError> {
        self.senders[dest]
            .send(msg)
            .map_err(|_| TransportError::RankDisconnected { rank: dest })
    }

    fn recv_any(&self) -> Result<Message, TransportError> {
        loop {
            match self.receiver.recv_timeout(ABORT_POLL_INTERVAL) {
                Ok(msg) => return Ok(msg),
                Err(RecvTimeoutError::Timeout) => {
                    if self.abort.load(Ordering::Acquire) {
                        return Err(TransportError::Aborted);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::RankDisconnected { rank: self.rank });
                }
            }
        }
    }
}

/// Builds one [`TwoSidedTransport`] handle per rank of an `nprocs`-wide
/// mesh, sharing `abort` so any rank's failure unblocks every other rank's
/// `recv_any` within one poll interval. The returned vector is meant to be
/// distributed one handle per worker thread (see `world::LocalWorld`).
pub fn build_world(nprocs: usize, abort: AbortFlag) -> Vec<TwoSidedTransport> {
    let mut senders = Vec::with_capacity(nprocs);
    let mut receivers = Vec::with_capacity(nprocs);
    for _ in 0..nprocs {
        let (s, r) = unbounded();
        senders.push(s);
        receivers.push(r);
    }
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, receiver)| TwoSidedTransport {
            rank,
            senders: senders.clone(),
            receiver,
            abort: abort.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn any_source_any_tag_roundtrip() {
        let mut world = build_world(3, Arc::new(AtomicBool::new(false)));
        let rx = world.remove(0);
        let tx1 = world.remove(0); // now index 0 of remaining == original rank 1
        let tx2 = world.remove(0); // original rank 2

        let h1 = thread::spawn(move || {
            tx1.send(0, Message {
                origin: 1,
                tag: Tag::BcastL,
                supernode: 5,
                body: vec![1.0],
            })
            .unwrap();
        });
        let h2 = thread::spawn(move || {
            tx2.send(0, Message {
                origin: 2,
                tag: Tag::ReduceL,
                supernode: 5,
                body: vec![2.0],
            })
            .unwrap();
        });
        h1.join().unwrap();
        h2.join().unwrap();

        let mut origins = vec![rx.recv_any().unwrap().origin, rx.recv_any().unwrap().origin];
        origins.sort();
        assert_eq!(origins, vec![1, 2]);
    }
}
