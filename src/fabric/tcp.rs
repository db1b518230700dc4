//! Built-in fabric provider: reliable messages plus emulated one-sided
//! writes over one nonblocking TCP connection per endpoint.
//!
//! Four frame kinds travel on the stream:
//!
//! - `MSG` carries an out-of-band message into the peer's next posted
//!   receive buffer.
//! - `WRITE` carries `(key, addr, len, bytes)` and is applied silently
//!   into the target registration — the peer's program never sees it.
//! - `COMMIT` ends a delivery-complete write batch; the target answers
//!   with `ACK`, and the initiator's write completion fires on the `ACK`.
//!   That is the delivery-complete semantic; stream ordering supplies the
//!   fence semantic for free.
//!
//! Progress is manual: [`Endpoint::cq_read`] flushes the outgoing queue,
//! drains the socket and parses frames. Posting past the bounded
//! outgoing queue returns [`Error::TryAgain`] without consuming the
//! operation.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use byteorder::{ByteOrder, LittleEndian};

use super::{
    Access, CompFlags, Completion, CompletionError, Error, FabricAddr, Limits, MrHandle, OpFlags,
    RawSpan, RemoteIovec,
};

/// Bound on buffered outgoing frame bytes; posting past it is `TryAgain`.
pub const TXQ_LIMIT: usize = 256 * 1024;

const FRAME_MSG: u8 = 1;
const FRAME_WRITE: u8 = 2;
const FRAME_COMMIT: u8 = 3;
const FRAME_ACK: u8 = 4;

const MSG_HDR: usize = 1 + 4;
const WRITE_HDR: usize = 1 + 8 + 8 + 4;
const COMMIT_HDR: usize = 1 + 8;

/// What this provider can do per operation.
pub const LIMITS: Limits = Limits {
    tx_maxsegs: 8,
    rma_maxsegs: 4,
    reg_maxsegs: 4,
    rma_virt_addr: false,
};

struct PostedRecv {
    token: u64,
    span: RawSpan,
}

struct PendingWrite {
    commit: u64,
    token: u64,
    len: usize,
}

struct RegEntry {
    spans: Vec<RawSpan>,
    access: Access,
    total: u64,
}

pub struct Endpoint {
    stream: TcpStream,
    peer: Option<FabricAddr>,
    txq: VecDeque<u8>,
    rxbuf: Vec<u8>,
    posted: VecDeque<PostedRecv>,
    /// MSG payloads that arrived before a receive was posted.
    unclaimed: VecDeque<Vec<u8>>,
    regs: HashMap<u64, RegEntry>,
    cmpl: VecDeque<Completion>,
    pending_writes: VecDeque<PendingWrite>,
    next_commit: u64,
    eof_seen: bool,
}

impl Endpoint {
    fn new(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nonblocking(true).map_err(Error::Io)?;
        stream.set_nodelay(true).map_err(Error::Io)?;
        Ok(Self {
            stream,
            peer: None,
            txq: VecDeque::new(),
            rxbuf: Vec::new(),
            posted: VecDeque::new(),
            unclaimed: VecDeque::new(),
            regs: HashMap::new(),
            cmpl: VecDeque::new(),
            pending_writes: VecDeque::new(),
            next_commit: 1,
            eof_seen: false,
        })
    }

    #[inline(always)]
    pub fn limits(&self) -> Limits {
        LIMITS
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// The endpoint's own fabric address (textual socket address).
    pub fn getname(&self) -> Result<FabricAddr, Error> {
        let addr = self.stream.local_addr().map_err(Error::Io)?;
        FabricAddr::from_bytes(addr.to_string().as_bytes())
    }

    /// Peer address recorded by [`av_insert`](Endpoint::av_insert).
    pub fn peername(&self) -> Option<&FabricAddr> {
        self.peer.as_ref()
    }

    /// Record the peer address from an initial/ack message. The stream is
    /// already connected, so this validates and remembers.
    pub fn av_insert(&mut self, addr: &FabricAddr) -> Result<(), Error> {
        let text = std::str::from_utf8(addr.as_bytes())
            .map_err(|_| Error::BadAddress("address is not utf-8".into()))?;
        if text.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::BadAddress(text.into()));
        }
        self.peer = Some(addr.clone());
        Ok(())
    }

    /// Free outgoing-queue capacity; a post needing more is `TryAgain`.
    #[inline(always)]
    pub fn tx_room(&self) -> usize {
        TXQ_LIMIT.saturating_sub(self.txq.len())
    }

    /// Every framed byte has reached the socket. Close only after this
    /// holds, or queued control traffic dies with the endpoint.
    #[inline(always)]
    pub fn tx_idle(&self) -> bool {
        self.txq.is_empty()
    }

    /// Post a message send. Completes (flags `MSG|SEND`) as soon as the
    /// bytes are framed: the buffer is reusable immediately. `FENCE`
    /// costs nothing here — frames leave the endpoint in post order.
    pub fn send(&mut self, spans: &[RawSpan], _flags: OpFlags, token: u64) -> Result<(), Error> {
        let total: usize = spans.iter().map(RawSpan::len).sum();
        if MSG_HDR + total > self.tx_room() {
            return Err(Error::TryAgain);
        }
        let mut hdr = [0u8; MSG_HDR];
        hdr[0] = FRAME_MSG;
        LittleEndian::write_u32(&mut hdr[1..5], total as u32);
        self.txq.extend(hdr);
        for span in spans {
            // SAFETY: the caller posted these spans; NIC ownership.
            self.txq.extend(unsafe { span.as_slice() });
        }
        self.cmpl.push_back(Completion {
            token,
            flags: CompFlags::MSG | CompFlags::SEND,
            len: total,
            error: None,
        });
        Ok(())
    }

    /// Post a message receive into `span`.
    pub fn recv(&mut self, span: RawSpan, token: u64) -> Result<(), Error> {
        if let Some(payload) = self.unclaimed.pop_front() {
            return self.deliver_msg(&payload, PostedRecv { token, span });
        }
        self.posted.push_back(PostedRecv { token, span });
        Ok(())
    }

    /// Post a one-sided write: gather `local`, scatter into the peer's
    /// `remote` segments. With `DELIVERY_COMPLETE` the completion fires
    /// on the peer's acknowledgement; with bare `COMPLETION` it fires at
    /// frame time.
    pub fn writemsg(
        &mut self,
        local: &[RawSpan],
        remote: &[RemoteIovec],
        flags: OpFlags,
        token: u64,
    ) -> Result<(), Error> {
        let total: usize = local.iter().map(RawSpan::len).sum();
        let rtotal: u64 = remote.iter().map(|r| r.len).sum();
        debug_assert_eq!(total as u64, rtotal);

        let mut need: usize = remote.len() * WRITE_HDR + total;
        if flags.contains(OpFlags::DELIVERY_COMPLETE) {
            need += COMMIT_HDR;
        }
        if need > self.tx_room() {
            return Err(Error::TryAgain);
        }

        // Gather cursor over the local spans.
        let mut li = 0;
        let mut loff = 0usize;
        for seg in remote {
            let mut hdr = [0u8; WRITE_HDR];
            hdr[0] = FRAME_WRITE;
            LittleEndian::write_u64(&mut hdr[1..9], seg.key);
            LittleEndian::write_u64(&mut hdr[9..17], seg.addr);
            LittleEndian::write_u32(&mut hdr[17..21], seg.len as u32);
            self.txq.extend(hdr);

            let mut left = seg.len as usize;
            while left > 0 {
                // SAFETY: posted spans, NIC ownership.
                let bytes = unsafe { local[li].as_slice() };
                let take = left.min(bytes.len() - loff);
                self.txq.extend(&bytes[loff..loff + take]);
                loff += take;
                left -= take;
                if loff == bytes.len() {
                    li += 1;
                    loff = 0;
                }
            }
        }

        if flags.contains(OpFlags::DELIVERY_COMPLETE) {
            let commit = self.next_commit;
            self.next_commit += 1;
            let mut hdr = [0u8; COMMIT_HDR];
            hdr[0] = FRAME_COMMIT;
            LittleEndian::write_u64(&mut hdr[1..9], commit);
            self.txq.extend(hdr);
            self.pending_writes.push_back(PendingWrite {
                commit,
                token,
                len: total,
            });
        } else if flags.contains(OpFlags::COMPLETION) {
            self.cmpl.push_back(Completion {
                token,
                flags: CompFlags::RMA | CompFlags::WRITE,
                len: total,
                error: None,
            });
        }
        Ok(())
    }

    /// Register `spans` under `key`. The registration's remote address
    /// space is logical offsets `0..total` across the spans in order.
    pub fn mr_reg(
        &mut self,
        key: u64,
        spans: Vec<RawSpan>,
        access: Access,
    ) -> Result<MrHandle, Error> {
        let desc = spans.first().map(RawSpan::desc).unwrap_or(0);
        let total: u64 = spans.iter().map(|s| s.len() as u64).sum();
        if self.regs.insert(key, RegEntry { spans, access, total }).is_some() {
            return Err(Error::BadKey(key));
        }
        Ok(MrHandle { key, desc })
    }

    pub fn mr_close(&mut self, key: u64) {
        self.regs.remove(&key);
    }

    /// Cancel every posted operation once. Each comes back through the
    /// completion queue with a `Canceled` error.
    pub fn cancel(&mut self) {
        for pr in self.posted.drain(..) {
            self.cmpl.push_back(Completion {
                token: pr.token,
                flags: CompFlags::MSG | CompFlags::RECV,
                len: 0,
                error: Some(CompletionError::Canceled),
            });
        }
        for pw in self.pending_writes.drain(..) {
            self.cmpl.push_back(Completion {
                token: pw.token,
                flags: CompFlags::RMA | CompFlags::WRITE,
                len: 0,
                error: Some(CompletionError::Canceled),
            });
        }
    }

    /// Drive progress and dequeue one completion.
    pub fn cq_read(&mut self) -> Result<Option<Completion>, Error> {
        self.progress()?;
        Ok(self.cmpl.pop_front())
    }

    /// The peer's stream reached EOF. Whether that is a clean close or a
    /// death mid-protocol is the connection's call.
    #[inline(always)]
    pub fn peer_closed(&self) -> bool {
        self.eof_seen
    }

    #[inline(always)]
    pub fn has_completions(&self) -> bool {
        !self.cmpl.is_empty()
    }

    /// Cheap readiness test for the scheduler: pending completions,
    /// queued outgoing bytes, or a readable socket.
    pub fn cq_ready(&self) -> bool {
        if !self.cmpl.is_empty() || !self.txq.is_empty() {
            return true;
        }
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        unsafe { libc::poll(&mut pfd, 1, 0) > 0 }
    }

    fn progress(&mut self) -> Result<(), Error> {
        self.flush_tx()?;
        self.pump_rx()?;
        self.parse_frames()?;
        // Parsing may have queued ACK frames.
        self.flush_tx()
    }

    fn flush_tx(&mut self) -> Result<(), Error> {
        while !self.txq.is_empty() {
            let (head, _) = self.txq.as_slices();
            match self.stream.write(head) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.txq.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn pump_rx(&mut self) -> Result<(), Error> {
        let mut scratch = [0u8; 64 * 1024];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    self.eof_seen = true;
                    break;
                }
                Ok(n) => self.rxbuf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn parse_frames(&mut self) -> Result<(), Error> {
        let mut off = 0usize;
        loop {
            let avail = self.rxbuf.len() - off;
            if avail == 0 {
                break;
            }
            let kind = self.rxbuf[off];
            let consumed = match kind {
                FRAME_MSG => {
                    if avail < MSG_HDR {
                        break;
                    }
                    let len = LittleEndian::read_u32(&self.rxbuf[off + 1..off + 5]) as usize;
                    if avail < MSG_HDR + len {
                        break;
                    }
                    let payload = self.rxbuf[off + MSG_HDR..off + MSG_HDR + len].to_vec();
                    match self.posted.pop_front() {
                        Some(pr) => self.deliver_msg(&payload, pr)?,
                        None => self.unclaimed.push_back(payload),
                    }
                    MSG_HDR + len
                }
                FRAME_WRITE => {
                    if avail < WRITE_HDR {
                        break;
                    }
                    let key = LittleEndian::read_u64(&self.rxbuf[off + 1..off + 9]);
                    let addr = LittleEndian::read_u64(&self.rxbuf[off + 9..off + 17]);
                    let len = LittleEndian::read_u32(&self.rxbuf[off + 17..off + 21]) as usize;
                    if avail < WRITE_HDR + len {
                        break;
                    }
                    let start = off + WRITE_HDR;
                    self.apply_write(key, addr, start, len)?;
                    WRITE_HDR + len
                }
                FRAME_COMMIT => {
                    if avail < COMMIT_HDR {
                        break;
                    }
                    let commit = LittleEndian::read_u64(&self.rxbuf[off + 1..off + 9]);
                    let mut hdr = [0u8; COMMIT_HDR];
                    hdr[0] = FRAME_ACK;
                    LittleEndian::write_u64(&mut hdr[1..9], commit);
                    // Control frame: ignores TXQ_LIMIT, it is 9 bytes.
                    self.txq.extend(hdr);
                    COMMIT_HDR
                }
                FRAME_ACK => {
                    if avail < COMMIT_HDR {
                        break;
                    }
                    let commit = LittleEndian::read_u64(&self.rxbuf[off + 1..off + 9]);
                    let pw = self
                        .pending_writes
                        .pop_front()
                        .filter(|pw| pw.commit == commit)
                        .ok_or(Error::BadFrame(FRAME_ACK))?;
                    self.cmpl.push_back(Completion {
                        token: pw.token,
                        flags: CompFlags::RMA | CompFlags::WRITE,
                        len: pw.len,
                        error: None,
                    });
                    COMMIT_HDR
                }
                other => return Err(Error::BadFrame(other)),
            };
            off += consumed;
        }
        if off > 0 {
            self.rxbuf.drain(..off);
        }
        // Posted receives may legitimately outlive the peer (they stay
        // posted until cancel or close). An unacknowledged
        // delivery-complete write or a partial frame cannot.
        if self.eof_seen && (!self.pending_writes.is_empty() || !self.rxbuf.is_empty()) {
            return Err(Error::PeerClosed);
        }
        Ok(())
    }

    fn deliver_msg(&mut self, payload: &[u8], pr: PostedRecv) -> Result<(), Error> {
        if payload.len() > pr.span.len() {
            return Err(Error::RecvTruncated {
                len: payload.len(),
                cap: pr.span.len(),
            });
        }
        // SAFETY: the program gave the span up when it posted the recv.
        unsafe {
            pr.span.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        }
        self.cmpl.push_back(Completion {
            token: pr.token,
            flags: CompFlags::MSG | CompFlags::RECV,
            len: payload.len(),
            error: None,
        });
        Ok(())
    }

    fn apply_write(&mut self, key: u64, addr: u64, start: usize, len: usize) -> Result<(), Error> {
        let reg = self.regs.get(&key).ok_or(Error::BadKey(key))?;
        if !reg.access.contains(Access::REMOTE_WRITE) || addr + len as u64 > reg.total {
            return Err(Error::BadWrite {
                key,
                addr,
                len: len as u64,
            });
        }
        let mut skip = addr as usize;
        let mut src = start;
        let mut left = len;
        for span in &reg.spans {
            if skip >= span.len() {
                skip -= span.len();
                continue;
            }
            let take = left.min(span.len() - skip);
            // SAFETY: registered target region; the peer owns these bytes
            // until the registration's buffer is handed back filled.
            unsafe {
                span.as_mut_slice()[skip..skip + take]
                    .copy_from_slice(&self.rxbuf[src..src + take]);
            }
            src += take;
            left -= take;
            skip = 0;
            if left == 0 {
                break;
            }
        }
        debug_assert_eq!(left, 0);
        Ok(())
    }
}

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let inner = TcpListener::bind(addr).map_err(Error::Io)?;
        inner.set_nonblocking(true).map_err(Error::Io)?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        self.inner.local_addr().map_err(Error::Io)
    }

    /// Nonblocking accept; `Ok(None)` when nobody is dialing. The caller
    /// owns the wait loop (it has a cancel flag to watch).
    pub fn accept(&self) -> Result<Option<Endpoint>, Error> {
        match self.inner.accept() {
            Ok((stream, _peer)) => Ok(Some(Endpoint::new(stream)?)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Dial a remote listener.
pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Endpoint, Error> {
    let stream = TcpStream::connect(addr).map_err(Error::Io)?;
    Endpoint::new(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (Endpoint, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        (dialer, Endpoint::new(stream).unwrap())
    }

    fn next_completion(ep: &mut Endpoint) -> Completion {
        for _ in 0..500 {
            if let Some(cmpl) = ep.cq_read().unwrap() {
                return cmpl;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("no completion within the deadline");
    }

    fn span_of(buf: &mut [u8]) -> RawSpan {
        // SAFETY: the test keeps the buffer alive past the operation.
        unsafe { RawSpan::new(buf.as_mut_ptr(), buf.len()) }
    }

    #[test]
    fn message_reaches_the_posted_receive() {
        let (mut a, mut b) = pair();
        let mut rx = vec![0u8; 64];
        b.recv(span_of(&mut rx), 21).unwrap();

        let mut tx = b"hello".to_vec();
        a.send(&[span_of(&mut tx)], OpFlags::empty(), 7).unwrap();
        let sent = next_completion(&mut a);
        assert_eq!(sent.token, 7);
        assert!(sent.flags.contains(CompFlags::SEND));

        let rcvd = next_completion(&mut b);
        assert_eq!(rcvd.token, 21);
        assert_eq!(rcvd.len, 5);
        assert!(rcvd.error.is_none());
        assert_eq!(&rx[..5], b"hello");
    }

    #[test]
    fn early_message_waits_for_a_receive() {
        let (mut a, mut b) = pair();
        let mut tx = b"early".to_vec();
        a.send(&[span_of(&mut tx)], OpFlags::empty(), 1).unwrap();
        let _ = next_completion(&mut a);

        // Let the frame arrive with nothing posted.
        for _ in 0..50 {
            assert!(b.cq_read().unwrap().is_none());
            std::thread::sleep(Duration::from_millis(1));
            if !b.unclaimed.is_empty() {
                break;
            }
        }
        let mut rx = vec![0u8; 16];
        b.recv(span_of(&mut rx), 2).unwrap();
        let rcvd = next_completion(&mut b);
        assert_eq!(rcvd.token, 2);
        assert_eq!(&rx[..5], b"early");
    }

    #[test]
    fn delivery_complete_write_lands_before_its_ack() {
        let (mut a, mut b) = pair();
        let mut target = vec![0u8; 8];
        let spans = vec![span_of(&mut target)];
        b.mr_reg(77, spans, Access::REMOTE_WRITE).unwrap();

        let mut payload = b"abcdefgh".to_vec();
        let remote = [RemoteIovec {
            addr: 0,
            len: 8,
            key: 77,
        }];
        a.writemsg(
            &[span_of(&mut payload)],
            &remote,
            OpFlags::DELIVERY_COMPLETE | OpFlags::COMPLETION,
            9,
        )
        .unwrap();

        // The target applies the write silently and answers the commit.
        let done = loop {
            assert!(b.cq_read().unwrap().is_none(), "one-sided write surfaced");
            if let Some(cmpl) = a.cq_read().unwrap() {
                break cmpl;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(done.token, 9);
        assert_eq!(done.len, 8);
        assert!(done.flags.contains(CompFlags::WRITE));
        assert_eq!(&target, b"abcdefgh");
    }

    #[test]
    fn write_scatter_splits_across_remote_segments() {
        let (mut a, mut b) = pair();
        let mut t1 = vec![0u8; 4];
        let mut t2 = vec![0u8; 4];
        b.mr_reg(1, vec![span_of(&mut t1)], Access::REMOTE_WRITE)
            .unwrap();
        b.mr_reg(2, vec![span_of(&mut t2)], Access::REMOTE_WRITE)
            .unwrap();

        let mut payload = b"wxyzWXYZ".to_vec();
        let remote = [
            RemoteIovec {
                addr: 0,
                len: 4,
                key: 1,
            },
            RemoteIovec {
                addr: 0,
                len: 4,
                key: 2,
            },
        ];
        a.writemsg(
            &[span_of(&mut payload)],
            &remote,
            OpFlags::DELIVERY_COMPLETE | OpFlags::COMPLETION,
            3,
        )
        .unwrap();
        let done = loop {
            let _ = b.cq_read().unwrap();
            if let Some(cmpl) = a.cq_read().unwrap() {
                break cmpl;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(done.len, 8);
        assert_eq!(&t1, b"wxyz");
        assert_eq!(&t2, b"WXYZ");
    }

    #[test]
    fn posting_past_the_queue_bound_is_try_again() {
        let (mut a, _b) = pair();
        let mut big = vec![0u8; 96 * 1024];
        let span = span_of(&mut big);
        assert!(a.send(&[span], OpFlags::empty(), 1).is_ok());
        assert!(a.send(&[span], OpFlags::empty(), 2).is_ok());
        assert!(matches!(
            a.send(&[span], OpFlags::empty(), 3),
            Err(Error::TryAgain)
        ));
    }

    #[test]
    fn cancel_returns_every_posted_operation() {
        let (_a, mut b) = pair();
        let mut rx = vec![0u8; 16];
        b.recv(span_of(&mut rx), 5).unwrap();
        b.cancel();
        let cmpl = next_completion(&mut b);
        assert_eq!(cmpl.token, 5);
        assert_eq!(cmpl.error, Some(CompletionError::Canceled));
    }
}
