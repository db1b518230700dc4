//! The fabric surface: completions, flags, iovecs, registration handles
//! and the built-in [`tcp`] provider.
//!
//! The core only assumes reliable message send/recv plus one-sided
//! remote writes on the same endpoint, manual progress driven from
//! completion-queue reads, and `try-again` as the back-pressure signal.
//! Remote addresses are *offsets into a registration*, never virtual
//! addresses; a provider that cannot do that is refused at startup.

pub mod tcp;

use std::fmt;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Transient provider back-pressure. Retry on the next loop step.
    #[error("resource temporarily unavailable, try again")]
    TryAgain,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the endpoint with operations outstanding")]
    PeerClosed,

    #[error("message of {len} bytes arrived for a {cap}-byte receive buffer")]
    RecvTruncated { len: usize, cap: usize },

    #[error("remote write names unknown registration key {0:#x}")]
    BadKey(u64),

    #[error("remote write overruns registration {key:#x} at offset {addr}, len {len}")]
    BadWrite { key: u64, addr: u64, len: u64 },

    #[error("malformed frame kind {0:#x} on endpoint stream")]
    BadFrame(u8),

    #[error("unacceptable fabric address: {0}")]
    BadAddress(String),

    #[error("provider capability unsupported: {0}")]
    Unsupported(&'static str),
}

bitflags::bitflags! {
    /// Completion record flags.
    pub struct CompFlags: u32 {
        const MSG = 0b00001;
        const SEND = 0b00010;
        const RECV = 0b00100;
        const RMA = 0b01000;
        const WRITE = 0b10000;
    }
}

bitflags::bitflags! {
    /// Per-operation flags.
    pub struct OpFlags: u32 {
        /// Complete only after the remote side has acknowledged the data.
        const DELIVERY_COMPLETE = 0b001;
        /// Generate a completion record for this operation.
        const COMPLETION = 0b010;
        /// Do not initiate before all prior operations on the endpoint.
        const FENCE = 0b100;
    }
}

bitflags::bitflags! {
    /// Memory registration access rights.
    pub struct Access: u32 {
        /// The local NIC may read the region (message and write sources).
        const READ = 0b01;
        /// The remote peer may write the region (RDMA target).
        const REMOTE_WRITE = 0b10;
    }
}

/// Why a completion carries an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The operation was cancelled by [`tcp::Endpoint::cancel`]. Expected
    /// after an explicit cancel; the completion handlers absorb it.
    Canceled,
}

/// One completion-queue record. `token` is returned verbatim from the
/// value the operation was posted with.
#[derive(Debug, Clone)]
pub struct Completion {
    pub token: u64,
    pub flags: CompFlags,
    pub len: usize,
    pub error: Option<CompletionError>,
}

/// Raw memory span handed across the provider boundary.
///
/// Sendable because the buffer-ownership discipline guarantees the
/// program does not touch the bytes while the provider owns them, and a
/// span never outlives the posted operation it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct RawSpan {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for RawSpan {}

impl RawSpan {
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay valid and unaliased by the program for
    /// as long as the span is posted with the provider.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// Caller must hold the NIC side of the ownership discipline.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// # Safety
    ///
    /// Caller must hold the NIC side of the ownership discipline.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }

    #[inline(always)]
    pub fn desc(&self) -> u64 {
        self.ptr as u64
    }
}

/// Remote scatter-gather segment: a logical offset into a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteIovec {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// Registration handle: the remote key plus the local descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle {
    pub key: u64,
    pub desc: u64,
}

/// Opaque fabric address, at most 512 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricAddr(Vec<u8>);

impl FabricAddr {
    pub const MAX_LEN: usize = 512;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() > Self::MAX_LEN {
            return Err(Error::BadAddress(format!(
                "{} bytes exceeds the {}-byte limit",
                bytes.len(),
                Self::MAX_LEN
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for FabricAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Provider limits the core adapts itself to.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Local segments per message or write.
    pub tx_maxsegs: usize,
    /// Remote segments per write.
    pub rma_maxsegs: usize,
    /// Segments per registration call.
    pub reg_maxsegs: usize,
    /// Provider insists on virtual-address RMA. The core refuses such
    /// providers (remote addresses are registration offsets here).
    pub rma_virt_addr: bool,
}
