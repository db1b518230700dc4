//! Worker threads: each owns up to eight session slots split into two
//! halves under independent locks, so pool assignment can land on one
//! half while the thread services the other.
//!
//! The outer loop waits for completion-queue readiness (a poll-set scan,
//! or `epoll_pwait` over the endpoints' descriptors in fd-wait mode),
//! compacts the ready sessions to the front of each half, runs the
//! terminal trade and the connection step for each, and idles on its
//! condition variable when it has nothing at all.

use std::collections::HashSet;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::buf::{BufPool, XferKind};
use crate::cxn::LoopStatus;
use crate::pool::PoolShared;
use crate::session::Session;
use crate::signal;
use crate::terminal::TradeStatus;

/// Session slots per worker.
pub const SESSIONS_PER_WORKER: usize = 8;
const HALF_SLOTS: usize = SESSIONS_PER_WORKER / 2;

/// Loops per load-average update.
const LOAD_WINDOW: u64 = 65_536;

/// Default payload buffer length for both directions.
pub const DEFAULT_BUFLEN: usize = 8192;

/// Payload buffers a worker will allocate per reservoir before the
/// take-side starts reporting empty.
const RESERVOIR_LIMIT: usize = 1024;

/// Per-worker knobs, shared by every worker a pool spawns.
#[derive(Debug, Clone)]
pub struct WorkerCfg {
    /// Wait in `epoll_pwait` instead of scanning the poll set.
    pub use_fd_wait: bool,
    /// Allocation size of receiver-side RDMA target buffers.
    pub rx_buflen: usize,
    /// Allocation size of sender-side payload buffers.
    pub tx_buflen: usize,
}

impl Default for WorkerCfg {
    fn default() -> Self {
        Self {
            use_fd_wait: false,
            rx_buflen: DEFAULT_BUFLEN,
            tx_buflen: DEFAULT_BUFLEN,
        }
    }
}

/// The worker's payload reservoirs. Connections draw their session
/// buffers from here, so allocation stays on the thread that uses them.
pub struct Reservoirs {
    pub rx_payload: BufPool,
    pub tx_payload: BufPool,
}

impl Reservoirs {
    fn new(cfg: &WorkerCfg) -> Self {
        Self {
            rx_payload: BufPool::new(XferKind::RdmaWrite, cfg.rx_buflen, RESERVOIR_LIMIT),
            tx_payload: BufPool::new(XferKind::RdmaWrite, cfg.tx_buflen, RESERVOIR_LIMIT),
        }
    }
}

struct Half {
    slots: Vec<Option<Session>>,
}

impl Half {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(HALF_SLOTS);
        slots.resize_with(HALF_SLOTS, || None);
        Self { slots }
    }
}

/// How a session left its slot.
enum SlotEnd {
    Done,
    Canceled,
    Failed,
}

pub struct Worker {
    index: usize,
    halves: [Mutex<Half>; 2],
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
    nsessions: AtomicUsize,
    shutting_down: AtomicBool,
    failed: AtomicBool,
    canceled: AtomicBool,
    tid: Mutex<Option<libc::pthread_t>>,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            halves: [Mutex::new(Half::new()), Mutex::new(Half::new())],
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
            nsessions: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            tid: Mutex::new(None),
        }
    }

    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn nsessions(&self) -> usize {
        self.nsessions.load(Ordering::Relaxed)
    }

    /// Non-blocking slot insertion, used by the pool's assigner. Gives
    /// the session back when both half locks are contended or full.
    pub(crate) fn assign(&self, session: Session) -> Result<(), Session> {
        for half in &self.halves {
            let Some(mut guard) = half.try_lock() else {
                continue;
            };
            if let Some(i) = guard.slots.iter().position(Option::is_none) {
                guard.slots[i] = Some(session);
                self.nsessions.fetch_add(1, Ordering::Relaxed);
                drop(guard);
                self.wake();
                return Ok(());
            }
        }
        Err(session)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.wake();
    }

    /// Wake a parked worker (condvar) or one blocked in `epoll_pwait`
    /// (wakeup signal).
    fn wake(&self) {
        {
            let _guard = self.idle_lock.lock();
            self.idle_cond.notify_one();
        }
        if let Some(tid) = *self.tid.lock() {
            signal::wake_thread(tid);
        }
    }
}

/// Fixed-point EWMA of contexts serviced per loop.
struct LoadStats {
    acc: u64,
    nloops: u64,
    min: u64,
    max: u64,
    avg: u64,
}

impl LoadStats {
    fn new() -> Self {
        Self {
            acc: 0,
            nloops: 0,
            min: u64::MAX,
            max: 0,
            avg: 0,
        }
    }

    fn update(&mut self, index: usize, nready: u64) {
        self.acc += nready;
        self.min = self.min.min(nready);
        self.max = self.max.max(nready);
        self.nloops += 1;
        if self.nloops % LOAD_WINDOW == 0 {
            self.avg = (self.avg + 256 * self.acc / LOAD_WINDOW) / 2;
            debug!(
                "worker {index}: load avg {} (fixed-point /256), min {} max {} per loop",
                self.avg, self.min, self.max
            );
            self.acc = 0;
            self.min = u64::MAX;
            self.max = 0;
        }
    }
}

struct Epoll {
    fd: RawFd,
    registered: HashSet<RawFd>,
}

impl Epoll {
    fn new() -> std::io::Result<Self> {
        // SAFETY: plain epoll_create1.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            registered: HashSet::new(),
        })
    }

    /// Track exactly `fds`: register newcomers, drop the stale.
    fn ensure(&mut self, fds: &HashSet<RawFd>) {
        for &fd in fds {
            if self.registered.insert(fd) {
                let mut ev = libc::epoll_event {
                    events: libc::EPOLLIN as u32,
                    u64: fd as u64,
                };
                // SAFETY: valid epoll fd and event struct.
                unsafe {
                    libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut ev);
                }
            }
        }
        self.registered.retain(|&fd| {
            if fds.contains(&fd) {
                return true;
            }
            // SAFETY: removing a previously added descriptor.
            unsafe {
                libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
            false
        });
    }

    /// Bounded wait, interruptible by the wakeup signal.
    fn pwait(&self, timeout_ms: i32) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];
        let mask = signal::pwait_sigmask();
        // SAFETY: valid fd, event array and sigset; EINTR is the wakeup
        // working as intended.
        unsafe {
            libc::epoll_pwait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
                &mask,
            );
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // SAFETY: fd came from epoll_create1.
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn pin_thread(cpu: usize, index: usize) {
    // SAFETY: local cpu_set_t; affinity failure is nonfatal.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc =
            libc::pthread_setaffinity_np(libc::pthread_self(), mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            warn!("worker {index}: could not pin to cpu {cpu} (errno {rc})");
        }
    }
}

/// Thread body. Runs until shutdown is requested and the last session
/// is gone.
pub(crate) fn run(worker: Arc<Worker>, cfg: WorkerCfg, cpu: Option<usize>, shared: Arc<PoolShared>) {
    if let Some(cpu) = cpu {
        pin_thread(cpu, worker.index);
    }
    if let Err(e) = signal::block_wakeup() {
        warn!("worker {}: cannot block wakeup signal: {e}", worker.index);
    }
    // SAFETY: pthread_self of the running thread.
    *worker.tid.lock() = Some(unsafe { libc::pthread_self() });
    debug!("worker {} running", worker.index);

    let mut res = Reservoirs::new(&cfg);
    let mut epoll = if cfg.use_fd_wait { Epoll::new().ok() } else { None };
    let mut load = LoadStats::new();

    loop {
        if worker.shutting_down.load(Ordering::Relaxed) && worker.nsessions() == 0 {
            break;
        }

        let mut nready = 0usize;
        for half in &worker.halves {
            let Some(mut guard) = half.try_lock() else {
                continue;
            };
            nready += service_half(&mut guard, &mut res, &worker, &shared);
        }
        load.update(worker.index, nready as u64);

        if worker.nsessions() == 0 {
            let mut guard = worker.idle_lock.lock();
            if worker.nsessions() == 0 && !worker.shutting_down.load(Ordering::Relaxed) {
                shared.note_worker_idle();
                let _ = worker
                    .idle_cond
                    .wait_for(&mut guard, Duration::from_millis(100));
            }
        } else if nready == 0 {
            match &mut epoll {
                Some(ep) => {
                    let mut fds = HashSet::new();
                    let mut safe_to_block = true;
                    for half in &worker.halves {
                        if let Some(guard) = half.try_lock() {
                            for session in guard.slots.iter().flatten() {
                                fds.insert(session.cxn.fd());
                                // the try-wait query: anything already
                                // serviceable forbids blocking
                                safe_to_block &= !session.cxn.cq_ready();
                            }
                        } else {
                            safe_to_block = false;
                        }
                    }
                    ep.ensure(&fds);
                    if safe_to_block {
                        ep.pwait(100);
                    }
                }
                None => std::thread::yield_now(),
            }
        }
    }
    debug!("worker {} exiting", worker.index);
}

/// Scan a half for ready sessions, compact them to the front and run
/// their trades and steps.
fn service_half(
    half: &mut Half,
    res: &mut Reservoirs,
    worker: &Worker,
    shared: &PoolShared,
) -> usize {
    let mut nready = 0;
    for i in 0..half.slots.len() {
        let ready = match &half.slots[i] {
            Some(s) => {
                s.cxn.cq_ready()
                    || s.cxn.cancelled()
                    || signal::cancel_requested()
                    || s.cxn.pending_startup()
                    || (s.cxn.sent_first()
                        && (!s.fifos.ready_for_terminal.empty() || !s.fifos.ready_for_cxn.empty()))
            }
            None => false,
        };
        if ready {
            half.slots.swap(nready, i);
            nready += 1;
        }
    }

    for i in 0..nready {
        let end = {
            let Some(s) = half.slots[i].as_mut() else {
                continue;
            };
            if !s.term_done {
                match s.terminal.trade(&mut s.fifos) {
                    Ok(TradeStatus::Continue) => {}
                    Ok(TradeStatus::End) => s.term_done = true,
                    Err(e) => {
                        // Route the terminal failure through the same
                        // cancel-and-drain close as a signal would take.
                        error!("worker {}: terminal failed: {e}", worker.index);
                        worker.failed.store(true, Ordering::Relaxed);
                        s.term_done = true;
                        s.cxn.abort();
                    }
                }
            }
            match s.cxn.step(&mut s.fifos, res) {
                Ok(LoopStatus::Continue) => None,
                Ok(LoopStatus::End) => Some(SlotEnd::Done),
                Ok(LoopStatus::Canceled) => Some(SlotEnd::Canceled),
                Err(e) => {
                    error!("worker {}: connection failed: {e}", worker.index);
                    Some(SlotEnd::Failed)
                }
            }
        };
        if let Some(end) = end {
            // Dropping the session closes the endpoint.
            half.slots[i] = None;
            worker.nsessions.fetch_sub(1, Ordering::Relaxed);
            match end {
                SlotEnd::Done => {}
                SlotEnd::Canceled => worker.canceled.store(true, Ordering::Relaxed),
                SlotEnd::Failed => worker.failed.store(true, Ordering::Relaxed),
            }
            shared.note_session_end();
        }
    }
    nready
}
