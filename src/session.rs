//! A session is the triple of one connection, one terminal and the two
//! FIFOs linking them.
//!
//! `ready_for_cxn` carries buffers toward the connection (filled payload
//! for a sender, empty advertisement targets for a receiver);
//! `ready_for_terminal` carries buffers toward the terminal (drained
//! payload for a source, filled targets for a sink). End-of-stream flows
//! through the FIFOs' close positions, never through a side channel.

use crate::buf::Buffer;
use crate::cxn::Connection;
use crate::fifo::Fifo;
use crate::terminal::Terminal;

/// Depth of both inter-directional FIFOs.
pub const SESSION_FIFO_DEPTH: usize = 64;

pub struct SessionFifos {
    pub ready_for_cxn: Fifo<Buffer>,
    pub ready_for_terminal: Fifo<Buffer>,
}

impl SessionFifos {
    pub fn new() -> Self {
        Self {
            ready_for_cxn: Fifo::new(SESSION_FIFO_DEPTH),
            ready_for_terminal: Fifo::new(SESSION_FIFO_DEPTH),
        }
    }
}

impl Default for SessionFifos {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Session {
    pub cxn: Connection,
    pub terminal: Terminal,
    pub fifos: SessionFifos,
    /// The terminal finished its half; the connection may still be
    /// draining the protocol tail.
    pub term_done: bool,
}

impl Session {
    pub fn new(cxn: Connection, terminal: Terminal) -> Self {
        Self {
            cxn,
            terminal,
            fifos: SessionFifos::new(),
            term_done: false,
        }
    }
}
