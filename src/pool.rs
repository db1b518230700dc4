//! The worker pool: lazily spawned workers, newest-first assignment and
//! graceful shutdown.
//!
//! Assignment walks the running workers from most recently started back
//! to least, taking the first whose half-lock yields without blocking
//! and which has a free slot; failing that a new worker is spawned
//! (pinned round-robin into the configured CPU range) and the walk
//! retries. Assignment is refused once shutdown begins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::worker::{self, Worker, WorkerCfg};

/// Hard ceiling on worker threads.
pub const MAX_WORKERS: usize = 128;

/// State the workers report back into.
pub(crate) struct PoolShared {
    done_lock: Mutex<()>,
    done_cond: Condvar,
    active_sessions: AtomicUsize,
}

impl PoolShared {
    pub(crate) fn note_session_end(&self) {
        let prev = self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        let _guard = self.done_lock.lock();
        self.done_cond.notify_all();
    }

    pub(crate) fn note_worker_idle(&self) {
        let _guard = self.done_lock.lock();
        self.done_cond.notify_all();
    }
}

struct PoolState {
    /// Spawn order; assignment walks this back-to-front.
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
    suspended: bool,
    next_cpu: usize,
}

/// Folded per-worker status after a join.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub failed: bool,
    pub canceled: bool,
}

pub struct WorkerPool {
    cfg: WorkerCfg,
    cpu_range: Option<(usize, usize)>,
    state: Mutex<PoolState>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(cfg: WorkerCfg, cpu_range: Option<(usize, usize)>) -> Self {
        Self {
            cfg,
            cpu_range,
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                handles: Vec::new(),
                suspended: false,
                next_cpu: 0,
            }),
            shared: Arc::new(PoolShared {
                done_lock: Mutex::new(()),
                done_cond: Condvar::new(),
                active_sessions: AtomicUsize::new(0),
            }),
        }
    }

    /// Place a session on a worker, spawning one if every running worker
    /// is contended or full.
    pub fn assign(&self, session: Session) -> Result<()> {
        let mut session = session;
        loop {
            {
                let mut state = self.state.lock();
                if state.suspended {
                    return Err(Error::Config("worker pool is shutting down".into()));
                }
                for w in state.workers.iter().rev() {
                    match w.assign(session) {
                        Ok(()) => {
                            self.shared.active_sessions.fetch_add(1, Ordering::SeqCst);
                            return Ok(());
                        }
                        Err(back) => session = back,
                    }
                }
                if state.workers.len() == MAX_WORKERS {
                    return Err(Error::PoolExhausted);
                }
                self.spawn_worker(&mut state)?;
            }
            // Lock released; retry the walk with the new worker in it.
        }
    }

    fn spawn_worker(&self, state: &mut PoolState) -> Result<()> {
        let index = state.workers.len();
        let worker = Arc::new(Worker::new(index));
        let cpu = self.cpu_range.map(|(lo, hi)| {
            let span = hi - lo + 1;
            let cpu = lo + state.next_cpu % span;
            state.next_cpu += 1;
            cpu
        });
        let cfg = self.cfg.clone();
        let shared = Arc::clone(&self.shared);
        let thread_worker = Arc::clone(&worker);
        let handle = std::thread::Builder::new()
            .name(format!("fabxfer-worker-{index}"))
            .spawn(move || worker::run(thread_worker, cfg, cpu, shared))
            .map_err(Error::IO)?;
        debug!("spawned worker {index} (cpu {cpu:?})");
        state.workers.push(worker);
        state.handles.push(handle);
        Ok(())
    }

    /// Block until every assigned session has ended (finished, failed or
    /// drained after cancellation).
    pub fn wait_sessions(&self) {
        let mut guard = self.shared.done_lock.lock();
        while self.shared.active_sessions.load(Ordering::SeqCst) > 0 {
            self.done_wait(&mut guard);
        }
    }

    fn done_wait(&self, guard: &mut parking_lot::MutexGuard<'_, ()>) {
        self.shared
            .done_cond
            .wait_for(guard, Duration::from_millis(200));
    }

    /// Suspend assignment, wait for idle, stop and join every worker,
    /// and fold their status into the process outcome.
    pub fn shutdown(&self) -> PoolStatus {
        self.state.lock().suspended = true;
        self.wait_sessions();

        let (workers, handles) = {
            let mut state = self.state.lock();
            (state.workers.clone(), std::mem::take(&mut state.handles))
        };
        for w in &workers {
            w.request_shutdown();
        }
        let mut panicked = false;
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
                panicked = true;
            }
        }
        PoolStatus {
            failed: panicked || workers.iter().any(|w| w.failed()),
            canceled: workers.iter().any(|w| w.canceled()),
        }
    }
}
