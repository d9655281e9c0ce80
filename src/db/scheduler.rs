//! Background scheduling — a score-keyed priority pool.
//!
//! Compaction work is submitted as re-runnable jobs tagged with a
//! floating-point **score** (level pressure, memtable-dump urgency).
//! A fixed pool of worker threads always runs the highest-scoring pending
//! job. Rescheduling an already-queued job to a new score is a
//! decrease-key: the old heap entry is lazily invalidated by a generation
//! counter rather than removed, and a fresh entry is pushed.
//!
//! Shutdown wakes all workers, discards pending entries, and joins the
//! threads; in-flight jobs run to completion first.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

/// A schedulable, re-runnable unit of background work.
pub(crate) type Job = Arc<dyn Fn() + Send + Sync>;

/// Identifies one scheduled job for rescheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(u64);

struct QueuedJob {
    score: f64,
    /// Submission order breaks score ties, oldest first.
    seq: u64,
    id: TaskId,
    generation: u64,
    job: Job,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap by score; on equal score the older submission wins.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.generation == other.generation
    }
}

impl Eq for QueuedJob {}

struct PoolState {
    heap: BinaryHeap<QueuedJob>,
    /// Current generation per pending task; heap entries with a stale
    /// generation are skipped when popped.
    generations: HashMap<TaskId, u64>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed worker pool draining a score-ordered job heap.
pub(crate) struct PriorityPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl PriorityPool {
    /// Spawns `workers` threads.
    pub(crate) fn new(workers: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                heap: BinaryHeap::new(),
                generations: HashMap::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("stratadb-bg-{id}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn background thread");
            handles.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(handles),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Queues `job` at `score`; higher scores run first.
    pub(crate) fn schedule(&self, score: f64, job: Job) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            return id;
        }
        state.generations.insert(id, 0);
        state.heap.push(QueuedJob {
            score,
            seq,
            id,
            generation: 0,
            job,
        });
        drop(state);
        self.shared.available.notify_one();
        trace!(?id, score, "scheduled background job");
        id
    }

    /// Changes the score of a pending job (decrease-key via lazy
    /// invalidation). Returns false when the job already ran.
    pub(crate) fn reschedule(&self, id: TaskId, score: f64, job: Job) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if state.shutdown {
            return false;
        }
        let Some(generation) = state.generations.get_mut(&id) else {
            return false;
        };
        *generation += 1;
        let generation = *generation;
        state.heap.push(QueuedJob {
            score,
            seq,
            id,
            generation,
            job,
        });
        drop(state);
        self.shared.available.notify_one();
        trace!(?id, score, "rescheduled background job");
        true
    }

    /// Stops accepting work, discards pending jobs, and joins workers.
    /// In-flight jobs finish first. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            state.shutdown = true;
            state.heap.clear();
            state.generations.clear();
        }
        self.shared.available.notify_all();

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!("background pool drained");
    }
}

impl Drop for PriorityPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if state.shutdown {
                    return;
                }
                // Skip entries invalidated by a reschedule.
                match state.heap.pop() {
                    Some(entry) => {
                        let current = state.generations.get(&entry.id).copied();
                        if current == Some(entry.generation) {
                            state.generations.remove(&entry.id);
                            break entry.job;
                        }
                        // stale generation: drop and try again
                    }
                    None => {
                        state = shared
                            .available
                            .wait(state)
                            .unwrap_or_else(|e| e.into_inner());
                    }
                }
            }
        };
        job();
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
