//! Connection state machines and their control queues.
//!
//! A [`Connection`] is one of two variants — [`Receiver`] (RDMA target
//! side) or [`Sender`] (RDMA initiator) — with a single [`step`] entry
//! the worker drives. Each step drains at most one completion, runs the
//! variant's book-keeping passes and reports whether the connection
//! wants to keep going.
//!
//! [`step`]: Connection::step

pub mod receiver;
pub mod sender;

pub use receiver::Receiver;
pub use sender::Sender;

use crate::buf::{BufPool, Buffer, Owner, XferKind};
use crate::error::{Error, Result};
use crate::fabric::tcp::Endpoint;
use crate::fabric::{Completion, OpFlags};
use crate::fifo::Fifo;
use crate::session::SessionFifos;
use crate::worker::Reservoirs;

/// Depth of the rx/tx posted rings.
pub const CTL_DEPTH: usize = 8;
/// Vector-message buffers per receiver.
pub const VEC_POOL: usize = 4;
/// Progress-message buffers per sender.
pub const PROGRESS_POOL: usize = 4;
/// Posted progress receives per receiver.
pub const PROGRESS_RX_DEPTH: usize = 8;
/// Posted vector receives per sender.
pub const VEC_RX_DEPTH: usize = 4;
/// Advertised-but-unfilled RDMA targets a receiver keeps in flight.
pub const TARGETS_DEPTH: usize = 64;
/// Entries (parents plus fragments) in a sender's write-posted queue.
pub const WRPOSTED_DEPTH: usize = 64;

/// What a connection's loop step tells the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Continue,
    /// Both sides closed and everything drained; close the endpoint.
    End,
    /// Cancellation observed and drained.
    Canceled,
}

/// Local/remote end-of-stream tracking. `local` means our EOF message
/// has been *enqueued*; `remote` means the peer's EOF was *observed*.
#[derive(Debug, Clone, Copy, Default)]
pub struct EofState {
    pub local: bool,
    pub remote: bool,
}

/// Receive control: buffers the NIC is writing into, completed in
/// posted order.
pub(crate) struct RxCtl {
    posted: Fifo<Buffer>,
}

impl RxCtl {
    pub fn new(depth: usize) -> Self {
        Self {
            posted: Fifo::new(depth),
        }
    }

    /// Issue a one-segment receive for the buffer's whole payload region
    /// and append it to the posted queue.
    pub fn post(&mut self, ep: &mut Endpoint, mut buf: Buffer) -> Result<()> {
        buf.ctx.cancelled = false;
        buf.ctx.owner = Owner::Nic;
        let span = buf.raw_span(0, buf.nallocated());
        ep.recv(span, buf.ctx.token().0)?;
        self.posted
            .put(buf)
            .map_err(|_| Error::other("receive posted past ring depth"))?;
        Ok(())
    }

    /// Match a completion against the posted head. A mismatched context
    /// means the posted-order invariant broke: fatal.
    pub fn complete(&mut self, cmpl: &Completion) -> Result<Buffer> {
        let mut buf = self
            .posted
            .force_get()
            .ok_or(Error::ContextMismatch {
                expected: 0,
                got: cmpl.token,
            })?;
        let expected = buf.ctx.token().0;
        if expected != cmpl.token {
            return Err(Error::ContextMismatch {
                expected,
                got: cmpl.token,
            });
        }
        buf.ctx.owner = Owner::Program;
        buf.nused = cmpl.len;
        Ok(buf)
    }

    /// Mark every posted buffer cancelled. The endpoint-wide cancel that
    /// actually flushes them is the connection's job, once.
    pub fn cancel(&mut self) {
        self.posted.for_each_mut(|buf| buf.ctx.cancelled = true);
    }

    #[inline(always)]
    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }
}

/// Transmit control: a ready queue, an in-flight queue and a free pool.
pub(crate) struct TxCtl {
    ready: Fifo<Buffer>,
    posted: Fifo<Buffer>,
    pool: BufPool,
}

impl TxCtl {
    pub fn new(kind: XferKind, bufsize: usize, pool_limit: usize) -> Self {
        Self {
            ready: Fifo::new(CTL_DEPTH),
            posted: Fifo::new(CTL_DEPTH),
            pool: BufPool::new(kind, bufsize, pool_limit),
        }
    }

    #[inline(always)]
    pub fn take(&mut self) -> Option<Buffer> {
        self.pool.take()
    }

    #[inline(always)]
    pub fn give_back(&mut self, buf: Buffer) {
        self.pool.give(buf);
    }

    pub fn enqueue(&mut self, buf: Buffer) -> Result<()> {
        self.ready
            .put(buf)
            .map_err(|_| Error::other("transmit ready queue overflow"))
    }

    /// Walk `ready` while `posted` has room, one send per buffer.
    /// Provider back-pressure stops the walk cleanly.
    pub fn transmit(&mut self, ep: &mut Endpoint, flags: OpFlags) -> Result<()> {
        while !self.posted.full() && !self.ready.empty() {
            let (span, token) = {
                let buf = match self.ready.peek_mut() {
                    Some(buf) => buf,
                    None => break,
                };
                (buf.raw_span(0, buf.nused), buf.ctx.token().0)
            };
            match ep.send(&[span], flags, token) {
                Ok(()) => {
                    let mut buf = match self.ready.get() {
                        Some(buf) => buf,
                        None => break,
                    };
                    buf.ctx.owner = Owner::Nic;
                    self.posted
                        .put(buf)
                        .map_err(|_| Error::other("transmit posted queue overflow"))?;
                }
                Err(crate::fabric::Error::TryAgain) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Move the posted head back into the pool.
    pub fn complete(&mut self, cmpl: &Completion) -> Result<()> {
        let buf = self
            .posted
            .force_get()
            .ok_or(Error::ContextMismatch {
                expected: 0,
                got: cmpl.token,
            })?;
        let expected = buf.ctx.token().0;
        if expected != cmpl.token {
            return Err(Error::ContextMismatch {
                expected,
                got: cmpl.token,
            });
        }
        self.pool.give(buf);
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.posted.for_each_mut(|buf| buf.ctx.cancelled = true);
        self.ready.for_each_mut(|buf| buf.ctx.cancelled = true);
    }

    /// Nothing queued, nothing in flight.
    #[inline(always)]
    pub fn idle(&self) -> bool {
        self.ready.len() == 0 && self.posted.len() == 0
    }

    #[inline(always)]
    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }
}

/// Polymorphic connection, dispatched without heap indirection.
pub enum Connection {
    Receiver(Receiver),
    Sender(Sender),
}

impl Connection {
    /// One scheduler-driven step of the protocol state machine.
    pub fn step(&mut self, fifos: &mut SessionFifos, res: &mut Reservoirs) -> Result<LoopStatus> {
        match self {
            Connection::Receiver(r) => r.step(fifos, res),
            Connection::Sender(s) => s.step(fifos, res),
        }
    }

    /// The first protocol message (ack or initial) went out. Work-ready
    /// promotion in the scheduler keys off this.
    pub fn sent_first(&self) -> bool {
        match self {
            Connection::Receiver(r) => r.sent_first(),
            Connection::Sender(s) => s.sent_first(),
        }
    }

    /// Still in its pre-running states; the scheduler must step it even
    /// though no fabric traffic exists yet.
    pub fn pending_startup(&self) -> bool {
        match self {
            Connection::Receiver(r) => r.pending_startup(),
            Connection::Sender(s) => s.pending_startup(),
        }
    }

    /// Force the connection onto the cancel-and-drain path (terminal
    /// failure takes the same exit as a signal).
    pub fn abort(&mut self) {
        match self {
            Connection::Receiver(r) => r.cancel_ops(),
            Connection::Sender(s) => s.cancel_ops(),
        }
    }

    pub fn cancelled(&self) -> bool {
        match self {
            Connection::Receiver(r) => r.cancelled(),
            Connection::Sender(s) => s.cancelled(),
        }
    }

    /// Completion-queue readiness, for the scheduler's I/O scan.
    pub fn cq_ready(&self) -> bool {
        self.endpoint().cq_ready()
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        self.endpoint().fd()
    }

    fn endpoint(&self) -> &Endpoint {
        match self {
            Connection::Receiver(r) => r.endpoint(),
            Connection::Sender(s) => s.endpoint(),
        }
    }
}
