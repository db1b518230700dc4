//! Bidirectional bulk-data transfer over a message/RDMA-style fabric.
//!
//! One side (the *sender*, binary `fput`) pushes a byte stream into the
//! other (the *receiver*, binary `fget`) with one-sided remote writes
//! coordinated by small out-of-band control messages. The receiver
//! advertises registered target buffers in [vector messages](proto), the
//! sender writes into them — fragmenting payloads across the advertised
//! segments when it has to — and reports what it wrote in fenced
//! [progress messages](proto). This crate contains:
//!
//! - [Buffer primitives and pools](buf), [bounded FIFOs with close
//!   positions](fifo)
//! - [Registration keys and vector registration](reg)
//! - [The wire codecs](proto)
//! - [The fabric surface and the built-in TCP provider](fabric)
//! - [The receiver and sender state machines](cxn)
//! - [Source/sink terminals](terminal), [sessions](session)
//! - [Worker threads](worker) and [the worker pool](pool)
//! - [The `get`/`put` personalities](personality)

pub mod buf;
pub mod cxn;
pub mod error;
pub mod fabric;
pub mod fifo;
pub mod log;
pub mod personality;
pub mod pool;
pub mod proto;
pub mod reg;
pub mod session;
pub mod signal;
pub mod terminal;
pub mod worker;

pub use error::{Error, Result};
