//! Sender side: consumes advertised target vectors, issues the one-sided
//! writes — fragmenting payload buffers across the advertised window
//! when it must — and reports what it wrote in fenced progress messages.

use std::collections::VecDeque;
use std::io::Cursor;

use log::{debug, trace};

use crate::buf::{fresh_serial, Buffer, CtxToken, Owner, Place, XferKind};
use crate::error::{Error, Result};
use crate::fabric::tcp::Endpoint;
use crate::fabric::{self, Access, Completion, Limits, OpFlags, RawSpan, RemoteIovec};
use crate::fifo::Fifo;
use crate::proto::{
    self, Initial, Progress, ACK_MSG_MAX, INITIAL_MSG_MAX, MAX_RIOVS, PROGRESS_MSG_LEN,
    VECTOR_MSG_MAX,
};
use crate::reg::{regv_all, KeySource};
use crate::session::SessionFifos;
use crate::signal;
use crate::worker::Reservoirs;

use super::{EofState, LoopStatus, RxCtl, TxCtl, PROGRESS_POOL, VEC_RX_DEPTH, WRPOSTED_DEPTH};

/// One write-posted queue entry: a parent payload buffer, or a fragment
/// header that shares its parent's registration and storage.
struct WriteEntry {
    serial: u64,
    kind: XferKind,
    place: Place,
    /// Parent payload serial; meaningful for fragments only.
    parent_serial: u64,
    /// The payload buffer itself; parents only.
    buf: Option<Buffer>,
}

pub struct Sender {
    ep: Endpoint,
    keys: KeySource,
    limits: Limits,
    reregister: bool,
    /// Remote segments per write; 1 in contiguous mode.
    rma_maxsegs: usize,
    id: u32,
    nsources: u32,
    sent_initial: bool,
    posted_ack_rx: bool,
    initial_buf: Option<Buffer>,
    rcvd_ack: bool,
    started: bool,
    ack_rx: RxCtl,
    vec_rx: RxCtl,
    /// Unloaded advertisement segments waiting for window room.
    pending_riovs: VecDeque<RemoteIovec>,
    /// The active advertisement window; the front is consumed in place,
    /// so the unwritten residue needs no second array.
    riov: VecDeque<RemoteIovec>,
    wrposted: Fifo<WriteEntry>,
    /// Offset into the head payload buffer while it is mid-fragmentation.
    /// Survives vector unloads; cleared only when the head is fully
    /// consumed.
    fragment_offset: usize,
    /// Bytes written since the last progress report.
    bytes_progress: u64,
    progress_tx: TxCtl,
    eof: EofState,
    cancelled: bool,
    nwrites: u64,
    nfragments: u64,
    nbytes: u64,
}

impl Sender {
    pub fn new(
        ep: Endpoint,
        id: u32,
        nsources: u32,
        reregister: bool,
        contiguous: bool,
    ) -> Result<Self> {
        let limits = ep.limits();
        if limits.rma_virt_addr {
            return Err(fabric::Error::Unsupported("provider requires virtual-address rma").into());
        }
        let rma_maxsegs = if contiguous { 1 } else { limits.rma_maxsegs };
        Ok(Self {
            ep,
            keys: KeySource::new(),
            limits,
            reregister,
            rma_maxsegs,
            id,
            nsources,
            sent_initial: false,
            posted_ack_rx: false,
            initial_buf: None,
            rcvd_ack: false,
            started: false,
            ack_rx: RxCtl::new(1),
            vec_rx: RxCtl::new(VEC_RX_DEPTH),
            pending_riovs: VecDeque::new(),
            riov: VecDeque::with_capacity(MAX_RIOVS),
            wrposted: Fifo::new(WRPOSTED_DEPTH),
            fragment_offset: 0,
            bytes_progress: 0,
            progress_tx: TxCtl::new(XferKind::Progress, PROGRESS_MSG_LEN, PROGRESS_POOL),
            eof: EofState::default(),
            cancelled: false,
            nwrites: 0,
            nfragments: 0,
            nbytes: 0,
        })
    }

    #[inline(always)]
    pub fn sent_first(&self) -> bool {
        self.sent_initial
    }

    #[inline(always)]
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    #[inline(always)]
    pub fn pending_startup(&self) -> bool {
        !(self.sent_initial && self.started)
    }

    #[inline(always)]
    pub fn endpoint(&self) -> &Endpoint {
        &self.ep
    }

    #[inline(always)]
    pub fn nfragments(&self) -> u64 {
        self.nfragments
    }

    #[inline(always)]
    pub fn nbytes(&self) -> u64 {
        self.nbytes
    }

    pub fn step(&mut self, fifos: &mut SessionFifos, res: &mut Reservoirs) -> Result<LoopStatus> {
        if signal::cancel_requested() && !self.cancelled {
            self.cancel_ops();
        }
        if self.cancelled {
            return self.drain_cancel();
        }
        if !self.sent_initial {
            return self.send_initial();
        }

        if let Some(cmpl) = self.ep.cq_read()? {
            self.dispatch(cmpl, fifos)?;
        }
        if !self.rcvd_ack {
            return Ok(LoopStatus::Continue);
        }
        if !self.started {
            self.start(fifos, res);
            return Ok(LoopStatus::Continue);
        }

        self.vecbuf_unload();
        self.targets_write(fifos)?;
        self.progress_update(fifos)?;
        self.progress_tx.transmit(&mut self.ep, OpFlags::FENCE)?;

        // A peer close before its EOF message is a death, not a close.
        if self.ep.peer_closed() && !self.eof.remote && !self.ep.has_completions() {
            return Err(fabric::Error::PeerClosed.into());
        }

        if fifos.ready_for_cxn.eoget()
            && self.wrposted.len() == 0
            && self.bytes_progress == 0
            && self.eof.local
            && self.eof.remote
            && self.progress_tx.idle()
            && self.ep.tx_idle()
        {
            debug!(
                "sender {} done: {} bytes in {} writes, {} fragments",
                self.id, self.nbytes, self.nwrites, self.nfragments
            );
            return Ok(LoopStatus::End);
        }
        Ok(LoopStatus::Continue)
    }

    /// Initial-send state: post the ack receive, then send the initial
    /// message once; stay here on back-pressure.
    fn send_initial(&mut self) -> Result<LoopStatus> {
        if !self.posted_ack_rx {
            self.ack_rx
                .post(&mut self.ep, Buffer::new(XferKind::Ack, ACK_MSG_MAX))?;
            self.posted_ack_rx = true;
        }
        let addr = self.ep.getname()?;
        let mut buf = Buffer::new(XferKind::Initial, INITIAL_MSG_MAX);
        {
            let mut cur = Cursor::new(buf.bytes_mut());
            proto::encode_initial(
                &mut cur,
                &Initial {
                    nonce: 0,
                    nsources: self.nsources,
                    id: self.id,
                    addr,
                },
            )?;
            buf.nused = cur.position() as usize;
        }
        let span = buf.raw_span(0, buf.nused);
        let token = buf.ctx.token().0;
        match self.ep.send(&[span], OpFlags::empty(), token) {
            Ok(()) => {
                buf.ctx.owner = Owner::Nic;
                self.initial_buf = Some(buf);
                self.sent_initial = true;
            }
            Err(fabric::Error::TryAgain) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(LoopStatus::Continue)
    }

    /// Starting state: give the source empty payload buffers to fill.
    fn start(&mut self, fifos: &mut SessionFifos, res: &mut Reservoirs) {
        while !fifos.ready_for_terminal.full() {
            let Some(buf) = res.tx_payload.take() else {
                break;
            };
            if fifos.ready_for_terminal.put(buf).is_err() {
                break;
            }
        }
        self.started = true;
    }

    fn dispatch(&mut self, cmpl: Completion, fifos: &mut SessionFifos) -> Result<()> {
        let kind = CtxToken(cmpl.token)
            .kind()
            .ok_or(Error::ContextMismatch {
                expected: 0,
                got: cmpl.token,
            })?;
        match kind {
            XferKind::Ack => {
                let buf = self.ack_rx.complete(&cmpl)?;
                if cmpl.error.is_some() {
                    return Ok(());
                }
                let ack = proto::decode_ack(&buf.bytes()[..buf.nused])?;
                self.ep.av_insert(&ack.addr)?;
                for _ in 0..VEC_RX_DEPTH {
                    self.vec_rx
                        .post(&mut self.ep, Buffer::new(XferKind::Vector, VECTOR_MSG_MAX))?;
                }
                self.rcvd_ack = true;
                debug!("sender {} acked by {}", self.id, ack.addr);
            }
            XferKind::Vector => {
                let buf = self.vec_rx.complete(&cmpl)?;
                if cmpl.error.is_some() {
                    return Ok(());
                }
                let msg = proto::decode_vector(&buf.bytes()[..buf.nused])?;
                if msg.iovs.is_empty() {
                    debug!("sender {}: remote eof (empty vector)", self.id);
                    self.eof.remote = true;
                } else {
                    trace!("sender {}: {} targets advertised", self.id, msg.iovs.len());
                    self.pending_riovs.extend(msg.iovs);
                    self.vec_rx.post(&mut self.ep, buf)?;
                }
            }
            XferKind::RdmaWrite => self.write_retire(&cmpl, fifos)?,
            XferKind::Progress => self.progress_tx.complete(&cmpl)?,
            XferKind::Initial => {
                let expected = self.initial_buf.as_ref().map(|b| b.ctx.token().0);
                if expected != Some(cmpl.token) {
                    return Err(Error::ContextMismatch {
                        expected: expected.unwrap_or(0),
                        got: cmpl.token,
                    });
                }
                self.initial_buf = None;
            }
            other => {
                return Err(Error::UnexpectedCompletion {
                    kind: other,
                    state: "sender running",
                })
            }
        }
        Ok(())
    }

    /// Move unloaded advertisement segments into the window. The window
    /// caps at 12 segments; the rest wait their turn. An in-progress
    /// `fragment_offset` is deliberately untouched here.
    fn vecbuf_unload(&mut self) {
        while self.riov.len() < MAX_RIOVS {
            let Some(seg) = self.pending_riovs.pop_front() else {
                break;
            };
            self.riov.push_back(seg);
        }
    }

    /// The adaptive write pass: walk `ready_for_cxn` accumulating payload
    /// segments against the advertised window, fragmenting the head only
    /// when no further advertisements can widen the window, then issue
    /// one delivery-complete write for the batch.
    fn targets_write(&mut self, fifos: &mut SessionFifos) -> Result<()> {
        if self.eof.remote && self.riov.is_empty() && self.pending_riovs.is_empty() {
            if !fifos.ready_for_cxn.closed() {
                debug!("sender {}: window exhausted at remote eof", self.id);
                fifos.ready_for_cxn.get_close();
            }
            return Ok(());
        }

        let maxriovs = self.rma_maxsegs.min(self.riov.len());
        if maxriovs == 0 {
            return Ok(());
        }
        let maxbytes: u64 = self.riov.iter().take(maxriovs).map(|s| s.len).sum();
        if maxbytes == 0 {
            return Ok(());
        }
        // Room prechecks: nothing below may need unwinding.
        if self.wrposted.capacity() - self.wrposted.len() < self.limits.tx_maxsegs {
            return Ok(());
        }
        if self.ep.tx_room() < maxbytes as usize + 32 * (maxriovs + 1) {
            return Ok(());
        }

        let mut staged: Vec<WriteEntry> = Vec::new();
        let mut local: Vec<RawSpan> = Vec::new();
        let mut total: u64 = 0;

        while total < maxbytes && local.len() < self.limits.tx_maxsegs {
            let Some(head) = fifos.ready_for_cxn.peek_mut() else {
                break;
            };
            // First touch of a head buffer registers it (fresh key every
            // time in reregister mode, since retirement deregisters).
            if self.fragment_offset == 0 && head.mr.is_none() {
                let span = head.raw_span(0, head.nused);
                let rv = regv_all(
                    &mut self.ep,
                    &[span],
                    self.limits.reg_maxsegs,
                    Access::READ,
                    &mut self.keys,
                )?;
                head.mr = rv.handles.first().copied();
            }
            let remaining = head.nused - self.fragment_offset;
            if remaining as u64 > maxbytes - total {
                if self.riov.len() < self.rma_maxsegs && !self.eof.remote {
                    // More advertisements will arrive; wait rather than
                    // fragment against a window that can still grow.
                    break;
                }
                let len = (maxbytes - total) as usize;
                let span = head.raw_span(self.fragment_offset, len);
                head.ctx.nchildren += 1;
                let parent_serial = head.ctx.serial;
                self.fragment_offset += len;
                total = maxbytes;
                self.nfragments += 1;
                local.push(span);
                staged.push(WriteEntry {
                    serial: fresh_serial(),
                    kind: XferKind::Fragment,
                    place: Place::empty(),
                    parent_serial,
                    buf: None,
                });
            } else {
                let len = remaining;
                let span = head.raw_span(self.fragment_offset, len);
                self.fragment_offset = 0;
                total += len as u64;
                local.push(span);
                let Some(buf) = fifos.ready_for_cxn.get() else {
                    return Err(Error::other("payload queue head vanished mid-walk"));
                };
                staged.push(WriteEntry {
                    serial: buf.ctx.serial,
                    kind: XferKind::RdmaWrite,
                    place: Place::empty(),
                    parent_serial: 0,
                    buf: Some(buf),
                });
            }
        }
        if total == 0 {
            return Ok(());
        }

        staged[0].place |= Place::FIRST;
        let last = staged.len() - 1;
        staged[last].place |= Place::LAST;
        // Only the first entry carries the NIC context; its completion
        // fires for the whole batch.
        let token = CtxToken::pack(XferKind::RdmaWrite, staged[0].serial).0;

        let mut remote: Vec<RemoteIovec> = Vec::with_capacity(maxriovs);
        let mut left = total;
        while left > 0 {
            let Some(seg) = self.riov.front_mut() else {
                return Err(Error::other("write batch exceeds advertised window"));
            };
            let take = seg.len.min(left);
            remote.push(RemoteIovec {
                addr: seg.addr,
                len: take,
                key: seg.key,
            });
            seg.addr += take;
            seg.len -= take;
            left -= take;
            if seg.len == 0 {
                self.riov.pop_front();
            }
        }

        self.ep.writemsg(
            &local,
            &remote,
            OpFlags::DELIVERY_COMPLETE | OpFlags::COMPLETION,
            token,
        )?;
        for entry in staged {
            self.wrposted
                .put(entry)
                .map_err(|_| Error::other("write-posted queue overflow"))?;
        }
        self.bytes_progress += total;
        self.nbytes += total;
        self.nwrites += 1;
        trace!(
            "sender {}: write of {} bytes over {} remote segments",
            self.id,
            total,
            remote.len()
        );
        Ok(())
    }

    /// Retire one completed write batch: fragments count down their
    /// parent, parents with no outstanding children go back to the
    /// terminal in order.
    fn write_retire(&mut self, cmpl: &Completion, fifos: &mut SessionFifos) -> Result<()> {
        let canceled = cmpl.error.is_some();
        let mut first = true;
        loop {
            let Some(mut entry) = self.wrposted.force_get() else {
                return Err(Error::other("write completion with empty write-posted queue"));
            };
            if first {
                if entry.serial != CtxToken(cmpl.token).serial()
                    || !entry.place.contains(Place::FIRST)
                {
                    return Err(Error::ContextMismatch {
                        expected: CtxToken::pack(XferKind::RdmaWrite, entry.serial).0,
                        got: cmpl.token,
                    });
                }
                first = false;
            }
            let last = entry.place.contains(Place::LAST);
            match entry.kind {
                XferKind::Fragment => self.decr_parent(entry.parent_serial, fifos)?,
                XferKind::RdmaWrite => {
                    let mut buf = entry
                        .buf
                        .take()
                        .ok_or_else(|| Error::other("parent write entry without buffer"))?;
                    if buf.ctx.nchildren != 0 {
                        return Err(Error::other("parent retired with outstanding children"));
                    }
                    if canceled {
                        drop(buf);
                    } else {
                        if self.reregister {
                            if let Some(mr) = buf.mr.take() {
                                self.ep.mr_close(mr.key);
                            }
                        }
                        buf.ctx.owner = Owner::Program;
                        buf.ctx.place = Place::empty();
                        buf.nused = 0;
                        if let Err(buf) = fifos.ready_for_terminal.put(buf) {
                            if fifos.ready_for_terminal.closed() {
                                drop(buf);
                            } else {
                                return Err(Error::other("ready-for-terminal queue overflow"));
                            }
                        }
                    }
                }
                _ => return Err(Error::other("foreign entry on write-posted queue")),
            }
            if last {
                break;
            }
        }
        Ok(())
    }

    /// A fragment completed: its parent is either still queued behind it
    /// on the write-posted queue, or still at the head of `ready_for_cxn`
    /// mid-fragmentation.
    fn decr_parent(&mut self, serial: u64, fifos: &mut SessionFifos) -> Result<()> {
        if let Some(entry) = self
            .wrposted
            .find_mut(|e| e.kind == XferKind::RdmaWrite && e.serial == serial)
        {
            let buf = entry
                .buf
                .as_mut()
                .ok_or_else(|| Error::other("parent write entry without buffer"))?;
            buf.ctx.nchildren -= 1;
            return Ok(());
        }
        if let Some(head) = fifos.ready_for_cxn.find_mut(|b| b.ctx.serial == serial) {
            head.ctx.nchildren -= 1;
            return Ok(());
        }
        Err(Error::other("fragment completion without a parent"))
    }

    /// Report bytes written since the last progress message; at EOF the
    /// report carries `nleftover == 0`, which is our half of the close.
    ///
    /// EOF is reached exactly when the payload queue is closed and
    /// drained: the source's `put_close` once it produced everything, or
    /// this side's `get_close` once remote EOF exhausted the write
    /// window. Nothing can be written after either, so the promise in
    /// `nleftover == 0` holds.
    fn progress_update(&mut self, fifos: &mut SessionFifos) -> Result<()> {
        let reached_eof = fifos.ready_for_cxn.eoget();
        if self.bytes_progress == 0 && !(reached_eof && !self.eof.local) {
            return Ok(());
        }
        let Some(mut buf) = self.progress_tx.take() else {
            return Ok(());
        };
        let msg = Progress {
            nfilled: self.bytes_progress,
            nleftover: if reached_eof { 0 } else { 1 },
        };
        {
            let mut cur = Cursor::new(buf.bytes_mut());
            proto::encode_progress(&mut cur, &msg)?;
            buf.nused = cur.position() as usize;
        }
        self.progress_tx.enqueue(buf)?;
        self.bytes_progress = 0;
        if reached_eof && !self.eof.local {
            self.eof.local = true;
            debug!("sender {}: local eof enqueued", self.id);
        }
        Ok(())
    }

    pub(crate) fn cancel_ops(&mut self) {
        debug!("sender {} cancelling posted operations", self.id);
        self.cancelled = true;
        self.ack_rx.cancel();
        self.vec_rx.cancel();
        self.progress_tx.cancel();
        self.ep.cancel();
    }

    fn drain_cancel(&mut self) -> Result<LoopStatus> {
        loop {
            match self.ep.cq_read() {
                Ok(Some(cmpl)) => match CtxToken(cmpl.token).kind() {
                    Some(XferKind::Ack) => {
                        let _ = self.ack_rx.complete(&cmpl)?;
                    }
                    Some(XferKind::Vector) => {
                        let _ = self.vec_rx.complete(&cmpl)?;
                    }
                    Some(XferKind::Progress) => self.progress_tx.complete(&cmpl)?,
                    Some(XferKind::RdmaWrite) => self.retire_canceled(&cmpl)?,
                    Some(XferKind::Initial) => self.initial_buf = None,
                    _ => {}
                },
                Ok(None) => break,
                Err(_) => return Ok(LoopStatus::Canceled),
            }
        }
        if self.ack_rx.posted_len() == 0
            && self.vec_rx.posted_len() == 0
            && self.progress_tx.posted_len() == 0
            && self.wrposted.len() == 0
        {
            return Ok(LoopStatus::Canceled);
        }
        Ok(LoopStatus::Continue)
    }

    /// During cancellation the batch entries are simply discarded; the
    /// payload buffers die with the session.
    fn retire_canceled(&mut self, cmpl: &Completion) -> Result<()> {
        let mut first = true;
        loop {
            let Some(entry) = self.wrposted.force_get() else {
                return Err(Error::other("write completion with empty write-posted queue"));
            };
            if first {
                if entry.serial != CtxToken(cmpl.token).serial() {
                    return Err(Error::ContextMismatch {
                        expected: CtxToken::pack(XferKind::RdmaWrite, entry.serial).0,
                        got: cmpl.token,
                    });
                }
                first = false;
            }
            if entry.place.contains(Place::LAST) {
                return Ok(());
            }
        }
    }
}
