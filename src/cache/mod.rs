//! Bounded cache of decompressed image blocks.
//!
//! The cache is the heart of the driver runtime. Entries move through
//! `absent -> pending -> ready -> absent`; a single mutex guards the index
//! and all state transitions, a per-entry condition variable signals
//! completion, and decompression itself always runs outside the lock on
//! the worker pool. Ready bytes are handed out as `Arc` slices, so a
//! reader pins an entry simply by holding its clone and eviction can skip
//! any entry that still has readers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::image::{section::SectionEntry, ImageReader, SectionIndex};
use crate::{Error, Result};

pub mod codec;
pub mod pool;

pub use codec::Codec;
pub use pool::DecompressorPool;

/// Cache construction options; mirrors the mount option surface.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Byte budget for decompressed blocks (soft ceiling).
    pub max_bytes: usize,
    /// Decompressor pool size.
    pub num_workers: usize,
    /// Retained for option compatibility; codecs decompress whole blocks.
    pub decompress_ratio: f64,
    /// Spawn workers immediately instead of waiting for `set_num_workers`.
    /// Mount bring-up leaves this off so workers are created post-fork.
    pub init_workers: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_bytes: 512 << 20,
            num_workers: 2,
            decompress_ratio: 0.8,
            init_workers: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TidyStrategy {
    #[default]
    None,
    Time,
    Swap,
}

impl std::str::FromStr for TidyStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(TidyStrategy::None),
            "time" => Ok(TidyStrategy::Time),
            "swap" => Ok(TidyStrategy::Swap),
            other => Err(Error::Cli(format!("no such cache tidy strategy: {other}")).into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TidyConfig {
    pub strategy: TidyStrategy,
    pub interval: Duration,
    pub max_age: Duration,
}

impl Default for TidyConfig {
    fn default() -> Self {
        Self {
            strategy: TidyStrategy::None,
            interval: Duration::from_secs(300),
            max_age: Duration::from_secs(600),
        }
    }
}

/// Point-in-time counters, snapshotted for the perfmon xattr and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub decompressions: u64,
    pub evictions: u64,
    pub tidy_evictions: u64,
    pub budget_overruns: u64,
    pub bytes_cached: u64,
    pub blocks_cached: u64,
}

#[derive(Debug, Default)]
struct CacheStatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    decompressions: AtomicU64,
    evictions: AtomicU64,
    tidy_evictions: AtomicU64,
    budget_overruns: AtomicU64,
}

enum EntryState {
    Pending {
        waiters: usize,
    },
    /// `waiters` counts getters that were woken but have not yet picked
    /// the bytes up; eviction must not outrun them.
    Ready {
        bytes: Arc<[u8]>,
        waiters: usize,
    },
    Failed {
        error: String,
        waiters: usize,
    },
}

struct CacheEntry {
    state: EntryState,
    cond: Arc<Condvar>,
    last_use: Instant,
}

struct CacheState {
    entries: LinkedHashMap<u32, CacheEntry>,
    ready_bytes: usize,
    shutdown: bool,
}

struct CacheShared {
    state: Mutex<CacheState>,
    stats: CacheStatsInner,
    max_bytes: usize,
}

struct TidyControl {
    stop: Mutex<bool>,
    cond: Condvar,
}

pub struct BlockCache {
    shared: Arc<CacheShared>,
    pool: Arc<DecompressorPool>,
    image: Arc<ImageReader>,
    sections: Arc<SectionIndex>,
    num_workers: usize,
    tidy: Mutex<Option<(Arc<TidyControl>, JoinHandle<()>)>>,
}

impl BlockCache {
    pub fn new(
        image: Arc<ImageReader>,
        sections: Arc<SectionIndex>,
        opts: &CacheOptions,
    ) -> Self {
        let cache = Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    entries: LinkedHashMap::new(),
                    ready_bytes: 0,
                    shutdown: false,
                }),
                stats: CacheStatsInner::default(),
                max_bytes: opts.max_bytes,
            }),
            pool: Arc::new(DecompressorPool::new()),
            image,
            sections,
            num_workers: opts.num_workers,
            tidy: Mutex::new(None),
        };
        if opts.init_workers {
            cache.set_num_workers(opts.num_workers);
        }
        cache
    }

    /// Start the decompressor workers (post-fork in daemon mode).
    pub fn set_num_workers(&self, count: usize) {
        self.pool.set_num_workers(count.max(1));
    }

    pub fn configured_workers(&self) -> usize {
        self.num_workers
    }

    /// Install the tidy configuration and start the tidy thread if the
    /// strategy calls for one. Post-fork, like `set_num_workers`.
    pub fn set_tidy_config(&self, config: TidyConfig) {
        let mut slot = self.tidy.lock();
        if slot.is_some() || config.strategy == TidyStrategy::None {
            return;
        }
        let control = Arc::new(TidyControl {
            stop: Mutex::new(false),
            cond: Condvar::new(),
        });
        let shared = Arc::clone(&self.shared);
        let thread_control = Arc::clone(&control);
        let handle = std::thread::Builder::new()
            .name("dwarfs-tidy".to_string())
            .spawn(move || tidy_loop(&shared, &thread_control, config))
            .expect("spawning cache tidy thread");
        info!(strategy = ?config.strategy, interval = ?config.interval, "cache tidy enabled");
        *slot = Some((control, handle));
    }

    /// Fetch a decompressed block, waiting for an in-flight decompression
    /// or starting one on a miss. At most one decompression runs per
    /// block id at any instant.
    pub fn get(&self, block_id: u32) -> Result<Arc<[u8]>> {
        let mut state = self.shared.state.lock();
        let mut registered = false;

        loop {
            if state.shutdown {
                if registered {
                    deregister_waiter(&mut state, block_id);
                }
                return Err(if registered {
                    Error::Cancelled.into()
                } else {
                    Error::ShuttingDown.into()
                });
            }

            // to_back also promotes the entry to most-recently-used.
            let Some(entry) = state.entries.to_back(&block_id) else {
                // Miss: install the pending entry while holding the lock,
                // then enqueue the job outside it.
                self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.install_pending(&mut state, block_id, 1)?;
                registered = true;
                drop(state);
                self.enqueue_fetch(block_id)?;
                state = self.shared.state.lock();
                continue;
            };

            match &mut entry.state {
                EntryState::Ready { bytes, waiters } => {
                    if registered {
                        *waiters = waiters.saturating_sub(1);
                    } else {
                        self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    entry.last_use = Instant::now();
                    return Ok(Arc::clone(bytes));
                }
                EntryState::Pending { waiters } => {
                    if !registered {
                        *waiters += 1;
                        registered = true;
                    }
                    let cond = Arc::clone(&entry.cond);
                    cond.wait(&mut state);
                }
                EntryState::Failed { error, waiters } => {
                    let msg = error.clone();
                    let mut drop_entry = false;
                    if registered {
                        *waiters = waiters.saturating_sub(1);
                        drop_entry = *waiters == 0;
                    }
                    if drop_entry {
                        state.entries.remove(&block_id);
                    }
                    return Err(Error::Decompress(msg).into());
                }
            }
        }
    }

    /// Install a pending entry and enqueue its decompression without a
    /// waiter. No-op when the block is already present or shutting down.
    pub fn prefetch(&self, block_id: u32) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown || state.entries.contains_key(&block_id) {
                return;
            }
            if self.install_pending(&mut state, block_id, 0).is_err() {
                return;
            }
        }
        if let Err(e) = self.enqueue_fetch(block_id) {
            debug!(block = block_id, error = %e, "prefetch enqueue failed");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (bytes_cached, blocks_cached) = {
            let state = self.shared.state.lock();
            (state.ready_bytes as u64, state.entries.len() as u64)
        };
        let s = &self.shared.stats;
        CacheStats {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            decompressions: s.decompressions.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
            tidy_evictions: s.tidy_evictions.load(Ordering::Relaxed),
            budget_overruns: s.budget_overruns.load(Ordering::Relaxed),
            bytes_cached,
            blocks_cached,
        }
    }

    /// True while the given block has a ready cache entry. Used by tests
    /// and the tidy loop verification; not part of the read path.
    pub fn is_resident(&self, block_id: u32) -> bool {
        let state = self.shared.state.lock();
        matches!(
            state.entries.get(&block_id).map(|e| &e.state),
            Some(EntryState::Ready { .. })
        )
    }

    /// Stop serving: new `get`s fail with ShuttingDown, waiters wake with
    /// Cancelled, queued jobs are dropped, workers and the tidy thread are
    /// joined, and all buffers are freed.
    pub fn shutdown(&self) {
        let conds: Vec<Arc<Condvar>> = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.ready_bytes = 0;
            let conds = state
                .entries
                .iter()
                .map(|(_, e)| Arc::clone(&e.cond))
                .collect();
            state.entries.clear();
            conds
        };
        for cond in conds {
            cond.notify_all();
        }

        self.pool.shutdown();

        if let Some((control, handle)) = self.tidy.lock().take() {
            *control.stop.lock() = true;
            control.cond.notify_all();
            let _ = handle.join();
        }

        debug!("block cache shut down");
    }

    fn install_pending(
        &self,
        state: &mut CacheState,
        block_id: u32,
        waiters: usize,
    ) -> Result<()> {
        // Validate the id before committing an entry, so bogus chunk
        // references fail fast instead of leaving a stuck pending entry.
        self.sections.block(block_id)?;
        state.entries.insert(
            block_id,
            CacheEntry {
                state: EntryState::Pending { waiters },
                cond: Arc::new(Condvar::new()),
                last_use: Instant::now(),
            },
        );
        Ok(())
    }

    fn enqueue_fetch(&self, block_id: u32) -> Result<()> {
        let entry: SectionEntry = *self.sections.block(block_id)?;
        let shared = Arc::clone(&self.shared);
        let image = Arc::clone(&self.image);
        self.shared
            .stats
            .decompressions
            .fetch_add(1, Ordering::Relaxed);

        let accepted = self.pool.enqueue(Box::new(move || {
            // Long-running work happens outside the cache lock.
            let result = image
                .slice(entry.payload_offset, entry.payload_len as usize)
                .and_then(|payload| entry.codec.decompress(payload));
            complete_fetch(&shared, block_id, result);
        }));

        if !accepted {
            // Pool is shutting down; the cache shutdown path wakes waiters.
            return Err(Error::ShuttingDown.into());
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deregister_waiter(state: &mut CacheState, block_id: u32) {
    if let Some(entry) = state.entries.get_mut(&block_id) {
        match &mut entry.state {
            EntryState::Pending { waiters }
            | EntryState::Ready { waiters, .. }
            | EntryState::Failed { waiters, .. } => {
                *waiters = waiters.saturating_sub(1);
            }
        }
    }
}

/// Job completion: transition pending -> ready (or failed), then evict
/// down to the byte budget and wake waiters.
fn complete_fetch(shared: &CacheShared, block_id: u32, result: Result<Vec<u8>>) {
    let mut guard = shared.state.lock();
    let state = &mut *guard;
    let Some(entry) = state.entries.get_mut(&block_id) else {
        // Entry vanished (shutdown); drop the bytes.
        return;
    };
    let cond = Arc::clone(&entry.cond);

    let waiters = match entry.state {
        EntryState::Pending { waiters } => waiters,
        _ => 0,
    };

    match result {
        Ok(bytes) => {
            let len = bytes.len();
            entry.state = EntryState::Ready {
                bytes: Arc::from(bytes.into_boxed_slice()),
                waiters,
            };
            entry.last_use = Instant::now();
            state.ready_bytes += len;
            evict_to_budget(shared, state);
        }
        Err(err) => {
            let msg = err.to_string();
            warn!(block = block_id, error = %msg, "block decompression failed");
            if waiters == 0 {
                state.entries.remove(&block_id);
            } else {
                entry.state = EntryState::Failed {
                    error: msg,
                    waiters,
                };
            }
        }
    }

    drop(guard);
    cond.notify_all();
}

fn evict_to_budget(shared: &CacheShared, state: &mut CacheState) {
    while state.ready_bytes > shared.max_bytes {
        // Front of the map is least recently used.
        let victim = state.entries.iter().find_map(|(k, e)| match &e.state {
            EntryState::Ready { bytes, waiters: 0 } if Arc::strong_count(bytes) == 1 => {
                Some((*k, bytes.len()))
            }
            _ => None,
        });
        match victim {
            Some((key, len)) => {
                state.entries.remove(&key);
                state.ready_bytes -= len;
                shared.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(block = key, bytes = len, "evicted block");
            }
            None => {
                // Everything ready is pinned by readers; admit over budget.
                shared.stats.budget_overruns.fetch_add(1, Ordering::Relaxed);
                warn!(
                    bytes = state.ready_bytes,
                    budget = shared.max_bytes,
                    "cache over budget with no evictable blocks"
                );
                break;
            }
        }
    }
}

fn tidy_loop(shared: &CacheShared, control: &TidyControl, config: TidyConfig) {
    loop {
        {
            let mut stop = control.stop.lock();
            if !*stop {
                control.cond.wait_for(&mut stop, config.interval);
            }
            if *stop {
                return;
            }
        }
        tidy_pass(shared, &config);
    }
}

fn tidy_pass(shared: &CacheShared, config: &TidyConfig) {
    let mut state = shared.state.lock();
    if state.shutdown {
        return;
    }

    let now = Instant::now();
    let victims: Vec<(u32, usize)> = state
        .entries
        .iter()
        .filter_map(|(k, e)| {
            let EntryState::Ready { bytes, waiters } = &e.state else {
                return None;
            };
            if *waiters != 0 || Arc::strong_count(bytes) != 1 {
                return None;
            }
            let expired = match config.strategy {
                TidyStrategy::Time => now.duration_since(e.last_use) > config.max_age,
                TidyStrategy::Swap => !pages_resident(bytes),
                TidyStrategy::None => false,
            };
            expired.then_some((*k, bytes.len()))
        })
        .collect();

    for (key, len) in victims {
        state.entries.remove(&key);
        state.ready_bytes -= len;
        shared.stats.tidy_evictions.fetch_add(1, Ordering::Relaxed);
        debug!(block = key, bytes = len, strategy = ?config.strategy, "tidy evicted block");
    }
}

/// Best-effort residency probe for the `swap` tidy strategy. Platforms
/// without `mincore` report everything resident, degrading to `none`.
#[cfg(target_os = "linux")]
fn pages_resident(buf: &[u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let addr = buf.as_ptr() as usize;
    let start = addr & !(page - 1);
    let end = addr + buf.len();
    let pages = end.div_ceil(page) - start / page;
    let mut vec = vec![0u8; pages];
    let rc = unsafe {
        libc::mincore(
            start as *mut libc::c_void,
            end - start,
            vec.as_mut_ptr() as *mut libc::c_uchar,
        )
    };
    if rc != 0 {
        return true;
    }
    vec.iter().all(|b| b & 1 == 1)
}

#[cfg(not(target_os = "linux"))]
fn pages_resident(_buf: &[u8]) -> bool {
    true
}
