//! Transport abstraction driving the forward/backward solve progress loops
//! (§4.4.4, §9) and the paired all-to-all exchanges of the redistributor
//! (§4.3). The solve engines are written against the [`Transport`] trait
//! only; which concrete transport backs a run is a [`TransportKind`] choice
//! made once, at solve entry.
//!
//! This crate ships two concrete transports, both realized in-process over
//! worker threads (§10.4) rather than over a real multi-host message-passing
//! library, so the end-to-end scenarios of spec §8 are runnable as ordinary
//! tests:
//! - [`two_sided::TwoSidedTransport`]: an any-source/any-tag receive backed
//!   by a multi-producer channel per rank.
//! - [`one_sided::OneSidedTransport`]: a shared-window transport with
//!   per-origin counter cells, polled with acquire-ordered loads.

pub mod collective;
pub mod one_sided;
pub mod two_sided;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::error::TransportError;
use crate::types::{ProcessId, Tag};

/// Shared by every rank's transport handle in one mesh. Set by
/// `world::LocalWorld::run` the moment any rank's closure returns an error,
/// so every other rank's `recv_any`, however it polls, notices within one
/// poll interval instead of blocking forever on a message that will now
/// never arrive (§5 "any MPI error aborts the process group").
pub type AbortFlag = Arc<AtomicBool>;

/// One broadcast or reduction message: the envelope is the header cell
/// (global supernode number) followed by `SuperSize(k) * nrhs` doubles
/// (§6 "Message envelopes").
#[derive(Debug, Clone)]
pub struct Message {
    pub origin: ProcessId,
    pub tag: Tag,
    pub supernode: usize,
    pub body: Vec<f64>,
}

/// Point-to-point transport used by the forward/backward progress loops.
/// A value of this trait is owned by exactly one rank's worker thread; it
/// is `Send` so it can be handed off into that thread, but is not meant to
/// be shared behind a reference across ranks (each rank gets its own
/// handle from the same [`TransportKind::build`] call).
pub trait Transport: Send {
    fn rank(&self) -> ProcessId;

    fn send(&self, dest: ProcessId, msg: Message) -> Result<(), TransportError>;

    /// Blocks until any message addressed to this rank (from any origin,
    /// carrying any tag) is available.
    fn recv_any(&self) -> Result<Message, TransportError>;
}

/// Which point-to-point transport variant a solve should use. Selectable at
/// build time (pick one and only link that module in a constrained
/// environment) or at run time, as required by §4.4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    TwoSided,
    OneSided,
}

/// A full mesh of point-to-point transport handles, one per rank, plus the
/// shared collective used by the redistributor.
pub enum MeshTransports {
    TwoSided(Vec<two_sided::TwoSidedTransport>),
    OneSided(Vec<one_sided::OneSidedTransport>),
}

impl TransportKind {
    pub fn build(self, nprocs: usize, abort: AbortFlag) -> MeshTransports {
        match self {
            TransportKind::TwoSided => {
                MeshTransports::TwoSided(two_sided::build_world(nprocs, abort))
            }
            TransportKind::OneSided => {
                MeshTransports::OneSided(one_sided::build_world(nprocs, abort))
            }
        }
    }
}

impl MeshTransports {
    /// Erases the concrete transport type so callers that only need to hand
    /// one handle to each rank's worker thread don't have to match on the
    /// variant (see `world::LocalWorld`).
    pub fn into_boxed(self) -> Vec<Box<dyn Transport>> {
        match self {
            MeshTransports::TwoSided(v) => v
                .into_iter()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .collect(),
            MeshTransports::OneSided(v) => v
                .into_iter()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .collect(),
        }
    }
}
