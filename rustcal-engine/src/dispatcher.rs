//! Fixed-pool work dispatch over a shared, monotonically advancing
//! work index.
//!
//! Workers are scoped threads spawned fresh per round and joined before
//! `run` returns; the only shared mutable state is the next-item counter
//! and the per-task result slots, so task bodies need no locking for
//! work that writes to disjoint destinations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A fixed-size worker pool draining an indexed task set.
///
/// The dispatcher owns no task semantics: the closure passed to
/// [`WorkDispatcher::run`] decides what an index means (a file to load,
/// a collection to calibrate).
#[derive(Debug, Clone, Copy)]
pub struct WorkDispatcher {
    worker_count: usize,
}

impl WorkDispatcher {
    /// Creates a dispatcher that will spawn up to `worker_count` workers
    /// per round (clamped to the task count at run time).
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
        }
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Runs `task` over every index in `0..task_count` and returns one
    /// success flag per task.
    ///
    /// Each worker repeatedly claims the next unclaimed index; a task
    /// returning `false` is recorded and never stops the other workers
    /// from draining the remaining indices. `task_count == 0` returns
    /// immediately without spawning anything. All workers are joined
    /// before this returns.
    pub fn run<F>(&self, task_count: usize, task: F) -> Vec<bool>
    where
        F: Fn(usize) -> bool + Sync,
    {
        if task_count == 0 {
            return Vec::new();
        }
        let workers = self.worker_count.min(task_count);
        let next_item = AtomicUsize::new(0);
        let results: Vec<AtomicBool> = (0..task_count).map(|_| AtomicBool::new(false)).collect();

        log::debug!("dispatching {task_count} tasks over {workers} workers");
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while let Some(index) = claim_next(&next_item, task_count) {
                        let ok = task(index);
                        results[index].store(ok, Ordering::Release);
                    }
                });
            }
        });

        results.into_iter().map(AtomicBool::into_inner).collect()
    }
}

/// Claims the next unprocessed index, keeping the counter at or below
/// `task_count`.
fn claim_next(next_item: &AtomicUsize, task_count: usize) -> Option<usize> {
    let mut current = next_item.load(Ordering::Relaxed);
    loop {
        if current >= task_count {
            return None;
        }
        match next_item.compare_exchange_weak(
            current,
            current + 1,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(claimed) => return Some(claimed),
            Err(actual) => current = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_zero_tasks_returns_empty() {
        let dispatcher = WorkDispatcher::new(4);
        let results = dispatcher.run(0, |_| panic!("no task must run"));
        assert!(results.is_empty());
    }

    #[test]
    fn test_every_index_claimed_exactly_once() {
        let claims: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
        let dispatcher = WorkDispatcher::new(8);
        let results = dispatcher.run(100, |index| {
            claims[index].fetch_add(1, Ordering::SeqCst);
            true
        });
        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|&ok| ok));
        assert!(claims.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_more_workers_than_tasks() {
        let dispatcher = WorkDispatcher::new(16);
        let results = dispatcher.run(3, |index| index != 1);
        assert_eq!(results, vec![true, false, true]);
    }

    #[test]
    fn test_failure_does_not_stop_the_round() {
        let processed = AtomicUsize::new(0);
        let dispatcher = WorkDispatcher::new(2);
        let results = dispatcher.run(50, |index| {
            processed.fetch_add(1, Ordering::SeqCst);
            index % 7 != 0
        });
        assert_eq!(processed.load(Ordering::SeqCst), 50);
        assert_eq!(results.iter().filter(|&&ok| !ok).count(), 8);
    }

    #[test]
    fn test_worker_count_clamped_to_at_least_one() {
        let dispatcher = WorkDispatcher::new(0);
        assert_eq!(dispatcher.worker_count(), 1);
        let results = dispatcher.run(5, |_| true);
        assert_eq!(results.len(), 5);
    }
}
