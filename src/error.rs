//! Error handling utils.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
///
/// Transient provider back-pressure is *not* an error: it stays inside
/// [`fabric::Error::TryAgain`](crate::fabric::Error::TryAgain) and is
/// absorbed by the connection loops before anything reaches this type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("fabric error: {0}")]
    Fabric(#[from] crate::fabric::Error),

    #[error("{0}")]
    Protocol(#[from] crate::proto::ProtocolError),

    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A completion's context token did not match the head of the posted
    /// queue it belongs to. The posted-order invariant is broken and the
    /// connection cannot be trusted any further.
    #[error("completion context mismatch: expected {expected:#x}, got {got:#x}")]
    ContextMismatch { expected: u64, got: u64 },

    #[error("unexpected completion kind {kind:?} in state {state}")]
    UnexpectedCompletion {
        kind: crate::buf::XferKind,
        state: &'static str,
    },

    /// The sink saw a byte that does not belong to the pattern stream.
    #[error("payload verification failed at stream offset {offset}")]
    Verify { offset: u64 },

    #[error("worker pool exhausted: no free session slot")]
    PoolExhausted,

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }
}
