//! Data terminals: the pattern source and the verifying sink.
//!
//! The self-check stream is the fixed sentence repeated 100 000 times.
//! The source fills payload buffers with it and `put_close`s its
//! completed FIFO at the total; the sink verifies positionally and
//! `get_close`s its ready FIFO at the total. A mismatch is a loop
//! error, surfaced as [`Error::Verify`].

use log::debug;

use crate::error::{Error, Result};
use crate::session::SessionFifos;
use crate::signal;

pub const PATTERN: &[u8] =
    b"If this message was received in error then please print it out and shred it.";

pub const PATTERN_REPEAT: u64 = 100_000;

/// Total stream length: `txbuflen × 100000`.
pub fn entire_len() -> u64 {
    PATTERN.len() as u64 * PATTERN_REPEAT
}

/// What a terminal trade tells the worker. Verification failures and
/// short streams come back as `Err`, the worker's cue to fail the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    Continue,
    /// The terminal produced or consumed its whole stream.
    End,
}

pub enum Terminal {
    Source(Source),
    Sink(Sink),
}

impl Terminal {
    pub fn trade(&mut self, fifos: &mut SessionFifos) -> Result<TradeStatus> {
        match self {
            Terminal::Source(s) => s.trade(fifos),
            Terminal::Sink(s) => s.trade(fifos),
        }
    }
}

/// Copies the repeating pattern into payload buffers until the fixed
/// total is produced.
pub struct Source {
    produced: u64,
    total: u64,
}

impl Source {
    pub fn new() -> Self {
        Self {
            produced: 0,
            total: entire_len(),
        }
    }

    fn trade(&mut self, fifos: &mut SessionFifos) -> Result<TradeStatus> {
        loop {
            if self.produced == self.total {
                fifos.ready_for_cxn.put_close();
                debug!("source done after {} bytes", self.produced);
                return Ok(TradeStatus::End);
            }
            if fifos.ready_for_cxn.full() {
                return Ok(TradeStatus::Continue);
            }
            let Some(mut buf) = fifos.ready_for_terminal.get() else {
                return Ok(TradeStatus::Continue);
            };
            let n = (buf.nallocated() as u64).min(self.total - self.produced) as usize;
            let bytes = buf.bytes_mut();
            for (i, b) in bytes[..n].iter_mut().enumerate() {
                *b = PATTERN[((self.produced + i as u64) % PATTERN.len() as u64) as usize];
            }
            buf.nused = n;
            self.produced += n as u64;
            if fifos.ready_for_cxn.put(buf).is_err() {
                // The connection get-closed the queue under us: the peer
                // stopped advertising targets. Nothing more to produce.
                return Ok(TradeStatus::End);
            }
        }
    }
}

impl Default for Source {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies incoming payload buffers against the pattern at the stream
/// offset and recycles them for re-advertisement.
pub struct Sink {
    verified: u64,
    total: u64,
}

impl Sink {
    pub fn new() -> Self {
        Self {
            verified: 0,
            total: entire_len(),
        }
    }

    fn trade(&mut self, fifos: &mut SessionFifos) -> Result<TradeStatus> {
        if signal::cancel_requested() {
            // A short stream is expected now; the connection's cancel
            // drain owns the shutdown.
            return Ok(TradeStatus::Continue);
        }
        loop {
            if self.verified == self.total {
                fifos.ready_for_terminal.get_close();
                fifos.ready_for_cxn.put_close();
                debug!("sink verified {} bytes", self.verified);
                return Ok(TradeStatus::End);
            }
            let Some(mut buf) = fifos.ready_for_terminal.get() else {
                if fifos.ready_for_terminal.eoget() {
                    return Err(Error::other(format!(
                        "stream ended short: {} of {} bytes",
                        self.verified, self.total
                    )));
                }
                return Ok(TradeStatus::Continue);
            };
            if self.verified + buf.nused as u64 > self.total {
                return Err(Error::other(format!(
                    "stream overran the expected total: {} + {}",
                    self.verified, buf.nused
                )));
            }
            let bytes = buf.bytes();
            for i in 0..buf.nused {
                let expect = PATTERN[((self.verified + i as u64) % PATTERN.len() as u64) as usize];
                if bytes[i] != expect {
                    return Err(Error::Verify {
                        offset: self.verified + i as u64,
                    });
                }
            }
            self.verified += buf.nused as u64;
            buf.nused = 0;
            // Recycle for the next advertisement; a closed or full queue
            // just retires the buffer.
            let _ = fifos.ready_for_cxn.put(buf);
        }
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{Buffer, XferKind};
    use crate::session::SessionFifos;

    fn feed(fifos: &mut SessionFifos, count: usize, size: usize) {
        for _ in 0..count {
            fifos
                .ready_for_terminal
                .put(Buffer::new(XferKind::RdmaWrite, size))
                .ok();
        }
    }

    #[test]
    fn source_then_sink_roundtrip_prefix() {
        let mut src = Source::new();
        let mut fifos = SessionFifos::new();
        feed(&mut fifos, 4, 8192);
        assert_eq!(src.trade(&mut fifos).unwrap(), TradeStatus::Continue);

        // hand the produced buffers straight to a sink
        let mut sink = Sink::new();
        let mut sink_fifos = SessionFifos::new();
        while let Some(buf) = fifos.ready_for_cxn.get() {
            sink_fifos.ready_for_terminal.put(buf).ok();
        }
        assert_eq!(sink.trade(&mut sink_fifos).unwrap(), TradeStatus::Continue);
        assert_eq!(sink.verified, 4 * 8192);
    }

    #[test]
    fn sink_rejects_corruption() {
        let mut sink = Sink::new();
        let mut fifos = SessionFifos::new();
        let mut buf = Buffer::new(XferKind::RdmaWrite, 64);
        for (i, b) in buf.bytes_mut().iter_mut().enumerate() {
            *b = PATTERN[i % PATTERN.len()];
        }
        buf.bytes_mut()[17] ^= 0xff;
        buf.nused = 64;
        fifos.ready_for_terminal.put(buf).ok();
        assert!(matches!(
            sink.trade(&mut fifos),
            Err(Error::Verify { offset: 17 })
        ));
    }

    #[test]
    fn sink_flags_short_stream() {
        let mut sink = Sink::new();
        let mut fifos = SessionFifos::new();
        fifos.ready_for_terminal.put_close();
        assert!(sink.trade(&mut fifos).is_err());
    }
}
