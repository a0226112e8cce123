//! Bounded in-flight job set for one executor.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{EngineError, EngineResult};

/// Tracks which nodes currently have a command in flight, capped at the
/// task's concurrency. The shutdown flag stops admissions without touching
/// jobs that are already running; those drain on their status reports.
pub struct WorkerPool {
    capacity: usize,
    inflight: Mutex<HashMap<String, usize>>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inflight: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Claim an in-flight slot for `node_name`, remembering its position in
    /// the executor's node slice.
    pub fn add_job(&self, node_name: &str, index: usize) -> EngineResult<()> {
        if self.is_shutting_down() {
            return Err(EngineError::WorkersStopped);
        }
        let mut inflight = self.lock_inflight();
        if inflight.len() >= self.capacity {
            return Err(EngineError::WorkersFull {
                inflight: inflight.len(),
                capacity: self.capacity,
            });
        }
        inflight.insert(node_name.to_string(), index);
        Ok(())
    }

    /// Release the slot held by `node_name` and return the stored index.
    /// Duplicate or foreign completions fail.
    pub fn end_job(&self, node_name: &str) -> EngineResult<usize> {
        self.lock_inflight()
            .remove(node_name)
            .ok_or_else(|| EngineError::UnknownJob {
                node: node_name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.lock_inflight().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Advisory read; any inconsistency is corrected under the next lock.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.inflight.lock().expect("worker pool lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_job_respects_capacity() {
        let pool = WorkerPool::new(2);
        pool.add_job("edge-0", 0).expect("first slot");
        pool.add_job("edge-1", 1).expect("second slot");

        let err = pool.add_job("edge-2", 2).expect_err("pool is full");
        assert!(matches!(
            err,
            EngineError::WorkersFull {
                inflight: 2,
                capacity: 2
            }
        ));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_end_job_frees_a_slot_and_returns_index() {
        let pool = WorkerPool::new(1);
        pool.add_job("edge-0", 7).expect("slot");

        assert_eq!(pool.end_job("edge-0").expect("release"), 7);
        assert!(pool.is_empty());
        pool.add_job("edge-1", 8).expect("slot freed");
    }

    #[test]
    fn test_end_job_rejects_unknown_node() {
        let pool = WorkerPool::new(1);
        let err = pool.end_job("edge-9").expect_err("never admitted");
        assert!(matches!(err, EngineError::UnknownJob { .. }));
    }

    #[test]
    fn test_shutdown_blocks_new_admissions_but_keeps_inflight() {
        let pool = WorkerPool::new(2);
        pool.add_job("edge-0", 0).expect("slot");

        pool.begin_shutdown();
        let err = pool.add_job("edge-1", 1).expect_err("stopped");
        assert!(matches!(err, EngineError::WorkersStopped));

        assert_eq!(pool.end_job("edge-0").expect("drain"), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 1);
        pool.add_job("edge-0", 0).expect("one slot available");
    }
}
