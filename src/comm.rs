//! Process-group abstraction for the SPMD execution model.
//!
//! The solver is written against [`Communicator`]: every collective point in
//! the algorithm (residual norms, the dense-matrix reduction, step-length
//! minima) maps to exactly one trait method. A reduction to the optimization
//! root is always followed by a broadcast so that replicated data is bitwise
//! identical on every rank, which keeps the algorithm deterministic even in
//! the presence of floating-point non-associativity.
//!
//! The crate ships [`SelfComm`], the single-process group where every
//! collective is the identity. A message-passing implementation of the same
//! trait is a drop-in replacement; the engine code does not change.

use faer::Col;

use crate::E;

/// The rank that performs the dense factorizations and owns the header of
/// the checkpoint file.
pub const OPT_ROOT: usize = 0;

/// Collective operations over a fixed process group.
///
/// All methods operate in place: on return from a `reduce_sum_root` the root
/// rank holds the sum and the other ranks hold unspecified values; a
/// `broadcast` overwrites every rank's buffer with the root's copy.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sum `vals` across all ranks; every rank receives the result.
    fn allreduce_sum(&self, vals: &mut [E]);

    /// Sum `vals` onto the root rank only.
    fn reduce_sum_root(&self, vals: &mut [E]);

    /// Overwrite `vals` on every rank with the root rank's copy.
    fn broadcast(&self, vals: &mut [E]);

    /// Componentwise minimum across all ranks; every rank receives the
    /// result. Step lengths are real quantities, so this reduces `f64`
    /// regardless of the scalar type.
    fn allreduce_min(&self, vals: &mut [f64]);

    /// Componentwise maximum across all ranks; every rank receives the
    /// result.
    fn allreduce_max(&self, vals: &mut [f64]);

    /// Bitwise-OR of warning flags across all ranks.
    fn allreduce_bor(&self, flags: &mut u32);

    /// Overwrite `vals` on every rank with the root rank's copy. Used for
    /// pivot arrays, which accompany broadcast factors.
    fn broadcast_index(&self, vals: &mut [usize]);

    /// Gather the per-rank `count` into a vector indexed by rank.
    fn allgather_count(&self, count: usize) -> Vec<usize>;

    /// Broadcast a column vector from the root rank.
    fn broadcast_col(&self, col: &mut Col<E>) {
        if self.size() > 1 {
            let mut buf: Vec<E> = (0..col.nrows()).map(|i| col[i]).collect();
            self.broadcast(&mut buf);
            for (i, v) in buf.into_iter().enumerate() {
                col[i] = v;
            }
        }
    }
}

/// The single-process group. Every collective is the identity, so a serial
/// run exercises the same reduction/broadcast call sequence a distributed
/// run would.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, _vals: &mut [E]) {}

    fn reduce_sum_root(&self, _vals: &mut [E]) {}

    fn broadcast(&self, _vals: &mut [E]) {}

    fn allreduce_min(&self, _vals: &mut [f64]) {}

    fn allreduce_max(&self, _vals: &mut [f64]) {}

    fn allreduce_bor(&self, _flags: &mut u32) {}

    fn broadcast_index(&self, _vals: &mut [usize]) {}

    fn allgather_count(&self, count: usize) -> Vec<usize> {
        vec![count]
    }
}

/// Exclusive prefix sum of per-rank counts: `ranges[r]..ranges[r + 1]` is
/// the global index range owned by rank `r`.
pub(crate) fn ownership_ranges(counts: &[usize]) -> Vec<usize> {
    let mut ranges = Vec::with_capacity(counts.len() + 1);
    ranges.push(0);
    for &count in counts {
        ranges.push(ranges.last().unwrap() + count);
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_ranges() {
        assert_eq!(ownership_ranges(&[4]), vec![0, 4]);
        assert_eq!(ownership_ranges(&[3, 0, 5]), vec![0, 3, 3, 8]);
    }

    #[test]
    fn test_self_comm_identity() {
        let comm = SelfComm;
        let mut vals = [1.0, -2.0, 3.0];
        comm.allreduce_sum(&mut vals);
        comm.reduce_sum_root(&mut vals);
        comm.broadcast(&mut vals);
        assert_eq!(vals, [1.0, -2.0, 3.0]);
        assert_eq!(comm.allgather_count(7), vec![7]);
    }
}
