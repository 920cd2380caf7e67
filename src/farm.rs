use crate::types::{Solution, WorkPackage};

/// Upstream collaborator supplying work and accepting solutions.
///
/// `work` must be non-blocking: the scheduler polls it between kernel
/// launches and falls back to a bounded wait when it returns `None`. The
/// owner is expected to call [`crate::scheduler::ClMiner::kick`] whenever a
/// new package becomes available so a parked scheduler wakes immediately.
pub trait Farm: Send + Sync {
    /// Current work package, if any.
    fn work(&self) -> Option<WorkPackage>;

    /// Accept a candidate solution found by a device.
    fn submit_proof(&self, solution: Solution);
}
