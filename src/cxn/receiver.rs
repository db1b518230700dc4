//! Receiver side: advertises registered target buffers, watches
//! progress reports, and hands filled targets to the sink in the order
//! they were advertised.

use std::io::Cursor;

use log::{debug, trace};

use crate::buf::{Buffer, CtxToken, XferKind};
use crate::error::{Error, Result};
use crate::fabric::tcp::Endpoint;
use crate::fabric::{self, Access, Completion, Limits, OpFlags, RemoteIovec};
use crate::fifo::Fifo;
use crate::proto::{self, Ack, Vector, ACK_MSG_MAX, MAX_RIOVS, PROGRESS_MSG_LEN, VECTOR_MSG_MAX};
use crate::reg::{regv_all, KeySource};
use crate::session::SessionFifos;
use crate::signal;
use crate::worker::Reservoirs;

use super::{
    EofState, LoopStatus, RxCtl, TxCtl, PROGRESS_RX_DEPTH, TARGETS_DEPTH, VEC_POOL,
};

pub struct Receiver {
    ep: Endpoint,
    keys: KeySource,
    limits: Limits,
    reregister: bool,
    sent_first: bool,
    /// The one-shot ack buffer, held until its send completion.
    ack_buf: Option<Buffer>,
    started: bool,
    progress_rx: RxCtl,
    vec_tx: TxCtl,
    /// Advertised targets in issuance order; `nused` tracks how far each
    /// has been consumed by progress accounting.
    targets: Fifo<Buffer>,
    /// Bytes reported written but not yet mapped onto targets.
    nfull: u64,
    eof: EofState,
    cancelled: bool,
    nvectors: u64,
    nhandoffs: u64,
    nbytes: u64,
}

impl Receiver {
    pub fn new(ep: Endpoint, reregister: bool) -> Result<Self> {
        let limits = ep.limits();
        if limits.rma_virt_addr {
            return Err(fabric::Error::Unsupported("provider requires virtual-address rma").into());
        }
        Ok(Self {
            ep,
            keys: KeySource::new(),
            limits,
            reregister,
            sent_first: false,
            ack_buf: None,
            started: false,
            progress_rx: RxCtl::new(PROGRESS_RX_DEPTH),
            vec_tx: TxCtl::new(XferKind::Vector, VECTOR_MSG_MAX, VEC_POOL),
            targets: Fifo::new(TARGETS_DEPTH),
            nfull: 0,
            eof: EofState::default(),
            cancelled: false,
            nvectors: 0,
            nhandoffs: 0,
            nbytes: 0,
        })
    }

    #[inline(always)]
    pub fn sent_first(&self) -> bool {
        self.sent_first
    }

    #[inline(always)]
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    #[inline(always)]
    pub fn pending_startup(&self) -> bool {
        !(self.sent_first && self.started)
    }

    #[inline(always)]
    pub fn endpoint(&self) -> &Endpoint {
        &self.ep
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
        if !self.sent_first {
            return self.send_ack();
        }
        if !self.started {
            self.start(fifos, res)?;
            return Ok(LoopStatus::Continue);
        }

        if let Some(cmpl) = self.ep.cq_read()? {
            self.dispatch(cmpl)?;
        }
        self.vector_update(fifos)?;
        self.vec_tx.transmit(&mut self.ep, OpFlags::empty())?;
        self.targets_read(fifos)?;

        // A peer close before its EOF message is a death, not a close.
        if self.ep.peer_closed() && !self.eof.remote && !self.ep.has_completions() {
            return Err(fabric::Error::PeerClosed.into());
        }

        if fifos.ready_for_terminal.eoget()
            && self.eof.local
            && self.eof.remote
            && self.vec_tx.idle()
            && self.ep.tx_idle()
        {
            debug!(
                "receiver done: {} bytes over {} vectors, {} targets retired",
                self.nbytes, self.nvectors, self.nhandoffs
            );
            return Ok(LoopStatus::End);
        }
        Ok(LoopStatus::Continue)
    }

    /// Pre-ack state: send the ack once; stay here on back-pressure.
    fn send_ack(&mut self) -> Result<LoopStatus> {
        let addr = self.ep.getname()?;
        let mut buf = Buffer::new(XferKind::Ack, ACK_MSG_MAX);
        {
            let mut cur = Cursor::new(buf.bytes_mut());
            proto::encode_ack(&mut cur, &Ack { addr })?;
            buf.nused = cur.position() as usize;
        }
        let span = buf.raw_span(0, buf.nused);
        let token = buf.ctx.token().0;
        match self.ep.send(&[span], OpFlags::empty(), token) {
            Ok(()) => {
                buf.ctx.owner = crate::buf::Owner::Nic;
                self.ack_buf = Some(buf);
                self.sent_first = true;
            }
            Err(fabric::Error::TryAgain) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(LoopStatus::Continue)
    }

    /// Starting state: post the progress receives and prime the
    /// advertisement pipeline from the worker's payload reservoir.
    fn start(&mut self, fifos: &mut SessionFifos, res: &mut Reservoirs) -> Result<()> {
        for _ in 0..PROGRESS_RX_DEPTH {
            let buf = Buffer::new(XferKind::Progress, PROGRESS_MSG_LEN);
            self.progress_rx.post(&mut self.ep, buf)?;
        }
        while !fifos.ready_for_cxn.full() {
            let Some(mut buf) = res.rx_payload.take() else {
                break;
            };
            buf.nused = buf.nallocated();
            if fifos.ready_for_cxn.put(buf).is_err() {
                break;
            }
        }
        self.started = true;
        Ok(())
    }

    fn dispatch(&mut self, cmpl: Completion) -> Result<()> {
        let kind = CtxToken(cmpl.token)
            .kind()
            .ok_or(Error::ContextMismatch {
                expected: 0,
                got: cmpl.token,
            })?;
        match kind {
            XferKind::Progress => {
                let buf = self.progress_rx.complete(&cmpl)?;
                if cmpl.error.is_some() {
                    if buf.ctx.cancelled {
                        return Ok(());
                    }
                    return Err(Error::other("canceled completion on live progress receive"));
                }
                let msg = proto::decode_progress(&buf.bytes()[..buf.nused])?;
                trace!(
                    "progress: nfilled={} nleftover={}",
                    msg.nfilled,
                    msg.nleftover
                );
                self.nfull += msg.nfilled;
                self.nbytes += msg.nfilled;
                if msg.nleftover == 0 {
                    debug!("remote eof after {} bytes", self.nbytes);
                    self.eof.remote = true;
                } else {
                    self.progress_rx.post(&mut self.ep, buf)?;
                }
            }
            XferKind::Vector => self.vec_tx.complete(&cmpl)?,
            XferKind::Ack => {
                let expected = self.ack_buf.as_ref().map(|b| b.ctx.token().0);
                if expected != Some(cmpl.token) {
                    return Err(Error::ContextMismatch {
                        expected: expected.unwrap_or(0),
                        got: cmpl.token,
                    });
                }
                self.ack_buf = None;
            }
            other => {
                return Err(Error::UnexpectedCompletion {
                    kind: other,
                    state: "receiver running",
                })
            }
        }
        Ok(())
    }

    /// Drain empty payload buffers into vector advertisements, recording
    /// each on the targets queue in the order advertised. At remote EOF,
    /// enqueue the closing zero-vector once.
    fn vector_update(&mut self, fifos: &mut SessionFifos) -> Result<()> {
        loop {
            if fifos.ready_for_cxn.empty() || self.targets.full() {
                break;
            }
            let Some(mut vbuf) = self.vec_tx.take() else {
                break;
            };
            let mut iovs: Vec<RemoteIovec> = Vec::with_capacity(MAX_RIOVS);
            while iovs.len() < MAX_RIOVS && !self.targets.full() {
                let Some(mut buf) = fifos.ready_for_cxn.get() else {
                    break;
                };
                let key = match buf.mr {
                    Some(mr) => mr.key,
                    None => {
                        let span = buf.raw_span(0, buf.nallocated());
                        let rv = regv_all(
                            &mut self.ep,
                            &[span],
                            self.limits.reg_maxsegs,
                            Access::REMOTE_WRITE,
                            &mut self.keys,
                        )?;
                        let handle = rv
                            .handles
                            .first()
                            .copied()
                            .ok_or_else(|| Error::other("empty registration"))?;
                        buf.mr = Some(handle);
                        handle.key
                    }
                };
                iovs.push(RemoteIovec {
                    addr: 0,
                    len: buf.nallocated() as u64,
                    key,
                });
                buf.nused = 0;
                self.targets
                    .put(buf)
                    .map_err(|_| Error::other("targets queue overflow"))?;
            }
            if iovs.is_empty() {
                self.vec_tx.give_back(vbuf);
                break;
            }
            trace!("advertising {} targets", iovs.len());
            {
                let mut cur = Cursor::new(vbuf.bytes_mut());
                proto::encode_vector(&mut cur, &Vector { iovs })?;
                vbuf.nused = cur.position() as usize;
            }
            self.vec_tx.enqueue(vbuf)?;
            self.nvectors += 1;
        }

        if self.eof.remote && !self.eof.local {
            if let Some(mut vbuf) = self.vec_tx.take() {
                {
                    let mut cur = Cursor::new(vbuf.bytes_mut());
                    proto::encode_vector(&mut cur, &Vector { iovs: Vec::new() })?;
                    vbuf.nused = cur.position() as usize;
                }
                self.vec_tx.enqueue(vbuf)?;
                self.eof.local = true;
                debug!("local eof: zero-vector enqueued");
            }
        }
        Ok(())
    }

    /// Map reported bytes onto targets in issuance order. A target goes
    /// to the terminal once fully filled, or partially filled at remote
    /// EOF.
    fn targets_read(&mut self, fifos: &mut SessionFifos) -> Result<()> {
        while self.nfull > 0 {
            let full = {
                let Some(head) = self.targets.peek_mut() else {
                    return Err(Error::other("progress report exceeds advertised targets"));
                };
                let room = head.nallocated() - head.nused;
                let take = room.min(self.nfull as usize);
                head.nused += take;
                self.nfull -= take as u64;
                head.nused == head.nallocated()
            };
            if !full {
                break;
            }
            self.handoff(fifos)?;
        }

        if self.eof.remote && self.nfull == 0 {
            while self.targets.peek().is_some_and(|b| b.nused > 0) {
                self.handoff(fifos)?;
            }
            if !fifos.ready_for_terminal.closed() {
                fifos.ready_for_terminal.put_close();
            }
        }
        Ok(())
    }

    fn handoff(&mut self, fifos: &mut SessionFifos) -> Result<()> {
        let mut buf = self
            .targets
            .get()
            .ok_or_else(|| Error::other("target queue empty at hand-off"))?;
        if self.reregister {
            if let Some(mr) = buf.mr.take() {
                self.ep.mr_close(mr.key);
            }
        }
        self.nhandoffs += 1;
        if let Err(buf) = fifos.ready_for_terminal.put(buf) {
            if fifos.ready_for_terminal.closed() {
                drop(buf);
            } else {
                return Err(Error::other("ready-for-terminal queue overflow"));
            }
        }
        Ok(())
    }

    pub(crate) fn cancel_ops(&mut self) {
        debug!("receiver cancelling posted operations");
        self.cancelled = true;
        self.progress_rx.cancel();
        self.vec_tx.cancel();
        self.ep.cancel();
    }

    /// Stay in the loop until the posted queues drain, consuming the
    /// canceled completions as they surface.
    fn drain_cancel(&mut self) -> Result<LoopStatus> {
        loop {
            match self.ep.cq_read() {
                Ok(Some(cmpl)) => {
                    match CtxToken(cmpl.token).kind() {
                        Some(XferKind::Progress) => {
                            let _ = self.progress_rx.complete(&cmpl)?;
                        }
                        Some(XferKind::Vector) => self.vec_tx.complete(&cmpl)?,
                        Some(XferKind::Ack) => self.ack_buf = None,
                        _ => {}
                    };
                }
                Ok(None) => break,
                // The peer may already be gone; nothing else will
                // complete, so the drain is as done as it gets.
                Err(_) => return Ok(LoopStatus::Canceled),
            }
        }
        if self.progress_rx.posted_len() == 0 && self.vec_tx.posted_len() == 0 {
            return Ok(LoopStatus::Canceled);
        }
        Ok(LoopStatus::Continue)
    }
}
