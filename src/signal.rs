//! Cancellation flag and signal plumbing.
//!
//! SIGHUP/SIGINT/SIGQUIT/SIGTERM set one process-global atomic flag; the
//! connection loops check it cooperatively at the top of every step.
//! SIGUSR1 is a no-op whose only purpose is to interrupt a worker parked
//! in `epoll_pwait` after a session was assigned to it.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;

static CANCEL: AtomicBool = AtomicBool::new(false);

pub const WAKEUP_SIGNAL: c_int = libc::SIGUSR1;

/// True once any cancellation signal has been delivered (or
/// [`request_cancel`] was called).
#[inline(always)]
pub fn cancel_requested() -> bool {
    CANCEL.load(Ordering::Relaxed)
}

/// Programmatic equivalent of a cancellation signal.
pub fn request_cancel() {
    CANCEL.store(true, Ordering::Relaxed);
}

extern "C" fn on_cancel(_signo: c_int) {
    // Only async-signal-safe work here: one atomic store.
    CANCEL.store(true, Ordering::Relaxed);
}

extern "C" fn on_wakeup(_signo: c_int) {}

fn install(signo: c_int, handler: extern "C" fn(c_int)) -> io::Result<()> {
    // SAFETY: sigaction with a handler that only stores an atomic.
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signo, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Install the process signal handlers. Called once from each binary's
/// `main` before any worker starts.
pub fn install_handlers() -> io::Result<()> {
    for signo in [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
        install(signo, on_cancel)?;
    }
    install(WAKEUP_SIGNAL, on_wakeup)
}

/// Block [`WAKEUP_SIGNAL`] in the calling thread. Workers do this on
/// startup so the signal is only ever delivered inside `epoll_pwait`,
/// through the mask returned by [`pwait_sigmask`].
pub fn block_wakeup() -> io::Result<()> {
    // SAFETY: plain sigset manipulation on a local set.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, WAKEUP_SIGNAL);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The calling thread's current mask with [`WAKEUP_SIGNAL`] removed, for
/// handing to `epoll_pwait`.
pub fn pwait_sigmask() -> libc::sigset_t {
    // SAFETY: reads the current mask into a local set.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut set);
        libc::sigdelset(&mut set, WAKEUP_SIGNAL);
        set
    }
}

/// Poke a worker thread that may be parked in `epoll_pwait`.
pub fn wake_thread(thread: libc::pthread_t) {
    // SAFETY: pthread_kill with a handled signal; a dead thread id is the
    // caller's race to lose and returns ESRCH, which we ignore.
    unsafe {
        libc::pthread_kill(thread, WAKEUP_SIGNAL);
    }
}
