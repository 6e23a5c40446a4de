//! Index and identifier types shared across the solve core.
//!
//! The historical reference this core is modeled on keeps a single integer
//! width (`int_t`, selectable 32/64-bit) for every global index, uniform
//! across a run. Every index-bearing field in this crate (supernode
//! numbers, row indices, process ids) is plain `usize` instead: a 32-bit
//! build-time choice would need to be threaded through every struct and
//! collection that stores an index — `SupernodePartition`, `CommPlan`,
//! the solve buffers' local block indices — and nothing in this crate
//! reads its own indices off the wire in a fixed-width binary format the
//! way the historical reference's MPI envelopes did, so there is no
//! narrower representation to select between.

/// Rank of a process within the flattened `Pr x Pc` mesh.
pub type ProcessId = usize;

/// Local supernode handle: an index into this rank's slice of `x`/`lsum`,
/// *not* a global supernode number. Use [`crate::mesh::SupernodePartition`]
/// to translate between the two.
pub type LocalSuper = usize;

/// Message discriminant for the transport layer. The one-sided transport
/// maps these to disjoint buffer regions instead of wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Broadcast of `x[k]` down a process column during forward solve.
    BcastL,
    /// Reduction of `lsum[i]` up a process row during forward solve.
    ReduceL,
    /// Broadcast of `x[k]` down a process column during backward solve.
    BcastU,
    /// Reduction of `lsum[i]` up a process row during backward solve.
    ReduceU,
}

impl Tag {
    pub fn is_broadcast(self) -> bool {
        matches!(self, Tag::BcastL | Tag::BcastU)
    }

    pub fn is_reduction(self) -> bool {
        matches!(self, Tag::ReduceL | Tag::ReduceU)
    }
}
