//! Decompression worker pool.
//!
//! A fixed set of threads executes decompression jobs for the block cache.
//! Jobs are queued FIFO but may complete out of order across workers.
//! Workers are started lazily via `set_num_workers` so daemonization can
//! fork before any thread exists.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

pub struct DecompressorPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DecompressorPool {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                cond: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker threads. Must run after daemonization so the
    /// threads live in the child process.
    pub fn set_num_workers(&self, count: usize) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        debug!(workers = count, "starting decompressor pool");
        for idx in 0..count.max(1) {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("dwarfs-decomp-{idx}"))
                .spawn(move || worker_loop(&shared))
                .expect("spawning decompressor worker");
            workers.push(handle);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Enqueue a job. Returns false when the pool is shutting down, in
    /// which case the job is dropped without running.
    pub fn enqueue(&self, job: Job) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        state.queue.push_back(job);
        drop(state);
        self.shared.cond.notify_one();
        true
    }

    /// Stop the pool: in-flight jobs complete, queued jobs are dropped,
    /// workers are joined.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        self.shared.cond.notify_all();
        if dropped > 0 {
            trace!(dropped, "cancelled queued decompression jobs");
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Default for DecompressorPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DecompressorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                shared.cond.wait(&mut state);
            }
        };
        job();
    }
}
