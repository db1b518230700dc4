//! Typed byte buffers, transfer contexts and buffer pools.
//!
//! Every buffer embeds a [`XferContext`]: the tag the fabric hands back
//! on completion. The context's kind plus a process-unique serial pack
//! into a [`CtxToken`], so a completion identifies both *what sort* of
//! operation finished and *which* buffer it belongs to without any
//! pointer traffic across the provider boundary.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::fabric::{MrHandle, RawSpan};

/// What a buffer (and therefore its completion) is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XferKind {
    Ack = 1,
    Fragment = 2,
    Initial = 3,
    Progress = 4,
    RdmaWrite = 5,
    Vector = 6,
}

impl XferKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Ack,
            2 => Self::Fragment,
            3 => Self::Initial,
            4 => Self::Progress,
            5 => Self::RdmaWrite,
            6 => Self::Vector,
            _ => return None,
        })
    }
}

/// Who may touch the buffer's bytes right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Program,
    Nic,
}

bitflags::bitflags! {
    /// Placement of an entry inside a write batch.
    pub struct Place: u8 {
        const FIRST = 0b01;
        const LAST = 0b10;
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A process-unique serial for contexts that live outside a [`Buffer`]
/// (fragment headers in a write batch).
pub fn fresh_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

const SERIAL_BITS: u32 = 56;
const SERIAL_MASK: u64 = (1 << SERIAL_BITS) - 1;

/// Completion context token: kind tag in the top byte, buffer serial in
/// the low 56 bits. This is the `u64` the fabric returns verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxToken(pub u64);

impl CtxToken {
    #[inline(always)]
    pub fn pack(kind: XferKind, serial: u64) -> Self {
        debug_assert_eq!(serial & !SERIAL_MASK, 0);
        Self((kind as u64) << SERIAL_BITS | (serial & SERIAL_MASK))
    }

    #[inline(always)]
    pub fn kind(self) -> Option<XferKind> {
        XferKind::from_tag((self.0 >> SERIAL_BITS) as u8)
    }

    #[inline(always)]
    pub fn serial(self) -> u64 {
        self.0 & SERIAL_MASK
    }
}

/// The transfer context embedded in every buffer header.
#[derive(Debug, Clone)]
pub struct XferContext {
    pub kind: XferKind,
    pub owner: Owner,
    pub place: Place,
    /// Outstanding fragment children of a payload buffer.
    pub nchildren: u32,
    pub cancelled: bool,
    pub serial: u64,
}

impl XferContext {
    pub fn new(kind: XferKind) -> Self {
        Self {
            kind,
            owner: Owner::Program,
            place: Place::empty(),
            nchildren: 0,
            cancelled: false,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub fn token(&self) -> CtxToken {
        CtxToken::pack(self.kind, self.serial)
    }
}

/// A registered (or registrable) byte buffer with its transfer context.
///
/// One struct serves every message kind; payload, vector, progress, ack
/// and initial buffers differ only in kind tag and allocation size.
#[derive(Debug)]
pub struct Buffer {
    pub ctx: XferContext,
    storage: Box<[u8]>,
    /// Bytes meaningful to the current owner (filled on tx, received on
    /// rx, consumed-so-far on an RDMA target).
    pub nused: usize,
    /// Remote-address hint: logical offset the peer should write at.
    pub raddr: u64,
    pub mr: Option<MrHandle>,
}

impl Buffer {
    pub fn new(kind: XferKind, size: usize) -> Self {
        Self {
            ctx: XferContext::new(kind),
            storage: vec![0u8; size].into_boxed_slice(),
            nused: 0,
            raddr: 0,
            mr: None,
        }
    }

    #[inline(always)]
    pub fn nallocated(&self) -> usize {
        self.storage.len()
    }

    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        &self.storage
    }

    #[inline(always)]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// Raw span over `storage[off..off + len]` for handing to the
    /// fabric. The caller transfers ownership of those bytes to the NIC
    /// until the matching completion arrives.
    pub fn raw_span(&mut self, off: usize, len: usize) -> RawSpan {
        assert!(off + len <= self.storage.len());
        // SAFETY: in-bounds pointer into our own storage; validity across
        // the await window is the Owner::Nic discipline.
        unsafe { RawSpan::new(self.storage.as_mut_ptr().add(off), len) }
    }

    /// Reset bookkeeping before the buffer goes back to a pool. The
    /// serial survives: tokens stay unique per allocation, not per use.
    pub fn reset(&mut self) {
        self.nused = 0;
        self.raddr = 0;
        self.ctx.owner = Owner::Program;
        self.ctx.place = Place::empty();
        self.ctx.nchildren = 0;
        self.ctx.cancelled = false;
    }
}

/// Single-threaded free-list of same-kind, same-size buffers.
///
/// `take` falls back to a fresh allocation until `limit` buffers exist;
/// after that an empty free-list means "wait", which the FIFOs upstream
/// turn into natural back-pressure.
#[derive(Debug)]
pub struct BufPool {
    kind: XferKind,
    bufsize: usize,
    limit: usize,
    allocated: usize,
    free: Vec<Buffer>,
}

impl BufPool {
    pub fn new(kind: XferKind, bufsize: usize, limit: usize) -> Self {
        Self {
            kind,
            bufsize,
            limit,
            allocated: 0,
            free: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    pub fn take(&mut self) -> Option<Buffer> {
        if let Some(buf) = self.free.pop() {
            return Some(buf);
        }
        if self.allocated < self.limit {
            self.allocated += 1;
            return Some(Buffer::new(self.kind, self.bufsize));
        }
        None
    }

    pub fn give(&mut self, mut buf: Buffer) {
        debug_assert_eq!(buf.ctx.kind, self.kind);
        buf.reset();
        self.free.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let ctx = XferContext::new(XferKind::Vector);
        let token = ctx.token();
        assert_eq!(token.kind(), Some(XferKind::Vector));
        assert_eq!(token.serial(), ctx.serial);
    }

    #[test]
    fn pool_respects_limit() {
        let mut pool = BufPool::new(XferKind::Progress, 16, 2);
        let a = pool.take().unwrap();
        let _b = pool.take().unwrap();
        assert!(pool.take().is_none());
        pool.give(a);
        assert!(pool.take().is_some());
    }
}
