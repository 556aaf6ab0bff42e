//! Scheduling queue — workloads waiting for capacity.
//!
//! Ordered FIFO by submission time, but not FIFO-*served*: every drain
//! cycle offers each queued workload to the selector in submission order,
//! so an old workload nobody can fit never blocks a newer one that fits
//! somewhere. Ties on the (second-resolution) submission timestamp fall
//! back to workload id for a total, reproducible order.

use fleetgrid_state::WorkloadId;

/// FIFO-by-submission queue of workload ids.
///
/// Plain data structure; the scheduler serializes access to it.
#[derive(Debug, Default)]
pub struct SchedulingQueue {
    /// Sorted by (submitted_at, workload_id).
    entries: Vec<(u64, WorkloadId)>,
}

impl SchedulingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a workload, keeping submission order. Re-inserting an id
    /// already present is a no-op.
    pub fn push(&mut self, submitted_at: u64, workload_id: &str) {
        if self.contains(workload_id) {
            return;
        }
        let key = (submitted_at, workload_id.to_string());
        let pos = self.entries.partition_point(|e| *e < key);
        self.entries.insert(pos, key);
    }

    /// Remove a workload. Returns true if it was queued.
    pub fn remove(&mut self, workload_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(_, id)| id != workload_id);
        self.entries.len() != before
    }

    pub fn contains(&self, workload_id: &str) -> bool {
        self.entries.iter().any(|(_, id)| id == workload_id)
    }

    /// Snapshot of queued ids in submission order, for one drain cycle.
    pub fn drain_order(&self) -> Vec<WorkloadId> {
        self.entries.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_order_is_submission_order() {
        let mut queue = SchedulingQueue::new();
        queue.push(300, "wl-c");
        queue.push(100, "wl-a");
        queue.push(200, "wl-b");

        assert_eq!(queue.drain_order(), vec!["wl-a", "wl-b", "wl-c"]);
    }

    #[test]
    fn ties_break_by_workload_id() {
        let mut queue = SchedulingQueue::new();
        queue.push(100, "wl-b");
        queue.push(100, "wl-a");

        assert_eq!(queue.drain_order(), vec!["wl-a", "wl-b"]);
    }

    #[test]
    fn duplicate_push_is_noop() {
        let mut queue = SchedulingQueue::new();
        queue.push(100, "wl-a");
        queue.push(100, "wl-a");
        queue.push(500, "wl-a");

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let mut queue = SchedulingQueue::new();
        queue.push(100, "wl-a");

        assert!(queue.remove("wl-a"));
        assert!(!queue.remove("wl-a"));
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_order_is_a_snapshot() {
        let mut queue = SchedulingQueue::new();
        queue.push(100, "wl-a");
        queue.push(200, "wl-b");

        let order = queue.drain_order();
        queue.remove("wl-a");

        // The snapshot is unaffected by later mutation.
        assert_eq!(order, vec!["wl-a", "wl-b"]);
        assert_eq!(queue.len(), 1);
    }
}
