//! Wire message codecs.
//!
//! Four out-of-band messages coordinate the one-sided writes. All
//! integers are little-endian:
//!
//! | message  | direction | layout |
//! |----------|-----------|--------|
//! | initial  | S→R | nonce `u128`, nsources `u32`, id `u32`, addrlen `u32`, addr |
//! | ack      | R→S | addrlen `u32`, addr |
//! | vector   | R→S | niovs `u32`, reserved `u32`, niovs × (addr `u64`, len `u64`, key `u64`) |
//! | progress | S→R | nfilled `u64`, nleftover `u64` |
//!
//! An empty vector (`niovs == 0`) is the receiver's end-of-stream; a
//! progress with `nleftover == 0` is the sender's. The nonce is
//! reserved: written as zero and never checked.

use std::io::{self, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::fabric::{FabricAddr, RemoteIovec};

/// Segments per vector message, and so per advertisement.
pub const MAX_RIOVS: usize = 12;

/// Maximum encoded sizes; receive buffers are allocated to these.
pub const INITIAL_MSG_MAX: usize = 16 + 4 + 4 + 4 + FabricAddr::MAX_LEN;
pub const ACK_MSG_MAX: usize = 4 + FabricAddr::MAX_LEN;
pub const VECTOR_MSG_MAX: usize = 4 + 4 + MAX_RIOVS * 24;
pub const PROGRESS_MSG_LEN: usize = 8 + 8;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated {what} message: {got} bytes")]
    Truncated { what: &'static str, got: usize },

    #[error("address length {0} exceeds the 512-byte limit")]
    AddrTooLong(u32),

    #[error("vector message advertises {0} segments, limit is 12")]
    TooManySegments(u32),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Sender's hello: who it is and where acks should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initial {
    /// Reserved; zero on the wire, ignored on receipt.
    pub nonce: u128,
    pub nsources: u32,
    pub id: u32,
    pub addr: FabricAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub addr: FabricAddr,
}

/// Advertisement of RDMA target segments. Empty means no more buffers
/// are coming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vector {
    pub iovs: Vec<RemoteIovec>,
}

/// Byte accounting since the previous progress message. `nleftover == 0`
/// promises that no more bytes will be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub nfilled: u64,
    pub nleftover: u64,
}

pub fn encode_initial(w: &mut impl Write, msg: &Initial) -> Result<(), ProtocolError> {
    w.write_u128::<LittleEndian>(msg.nonce)?;
    w.write_u32::<LittleEndian>(msg.nsources)?;
    w.write_u32::<LittleEndian>(msg.id)?;
    w.write_u32::<LittleEndian>(msg.addr.as_bytes().len() as u32)?;
    w.write_all(msg.addr.as_bytes())?;
    Ok(())
}

pub fn decode_initial(buf: &[u8]) -> Result<Initial, ProtocolError> {
    let truncated = || ProtocolError::Truncated {
        what: "initial",
        got: buf.len(),
    };
    if buf.len() < 28 {
        return Err(truncated());
    }
    let mut r = buf;
    let nonce = r.read_u128::<LittleEndian>()?;
    let nsources = r.read_u32::<LittleEndian>()?;
    let id = r.read_u32::<LittleEndian>()?;
    let addrlen = r.read_u32::<LittleEndian>()?;
    if addrlen as usize > FabricAddr::MAX_LEN {
        return Err(ProtocolError::AddrTooLong(addrlen));
    }
    if r.len() < addrlen as usize {
        return Err(truncated());
    }
    let addr = FabricAddr::from_bytes(&r[..addrlen as usize])
        .map_err(|_| ProtocolError::AddrTooLong(addrlen))?;
    Ok(Initial {
        nonce,
        nsources,
        id,
        addr,
    })
}

pub fn encode_ack(w: &mut impl Write, msg: &Ack) -> Result<(), ProtocolError> {
    w.write_u32::<LittleEndian>(msg.addr.as_bytes().len() as u32)?;
    w.write_all(msg.addr.as_bytes())?;
    Ok(())
}

pub fn decode_ack(buf: &[u8]) -> Result<Ack, ProtocolError> {
    let truncated = || ProtocolError::Truncated {
        what: "ack",
        got: buf.len(),
    };
    if buf.len() < 4 {
        return Err(truncated());
    }
    let mut r = buf;
    let addrlen = r.read_u32::<LittleEndian>()?;
    if addrlen as usize > FabricAddr::MAX_LEN {
        return Err(ProtocolError::AddrTooLong(addrlen));
    }
    if r.len() < addrlen as usize {
        return Err(truncated());
    }
    let addr = FabricAddr::from_bytes(&r[..addrlen as usize])
        .map_err(|_| ProtocolError::AddrTooLong(addrlen))?;
    Ok(Ack { addr })
}

pub fn encode_vector(w: &mut impl Write, msg: &Vector) -> Result<(), ProtocolError> {
    debug_assert!(msg.iovs.len() <= MAX_RIOVS);
    w.write_u32::<LittleEndian>(msg.iovs.len() as u32)?;
    w.write_u32::<LittleEndian>(0)?; // reserved
    for iov in &msg.iovs {
        w.write_u64::<LittleEndian>(iov.addr)?;
        w.write_u64::<LittleEndian>(iov.len)?;
        w.write_u64::<LittleEndian>(iov.key)?;
    }
    Ok(())
}

pub fn decode_vector(buf: &[u8]) -> Result<Vector, ProtocolError> {
    let truncated = || ProtocolError::Truncated {
        what: "vector",
        got: buf.len(),
    };
    if buf.len() < 8 {
        return Err(truncated());
    }
    let mut r = buf;
    let niovs = r.read_u32::<LittleEndian>()?;
    let _reserved = r.read_u32::<LittleEndian>()?;
    if niovs as usize > MAX_RIOVS {
        return Err(ProtocolError::TooManySegments(niovs));
    }
    if r.len() < niovs as usize * 24 {
        return Err(truncated());
    }
    let mut iovs = Vec::with_capacity(niovs as usize);
    for _ in 0..niovs {
        iovs.push(RemoteIovec {
            addr: r.read_u64::<LittleEndian>()?,
            len: r.read_u64::<LittleEndian>()?,
            key: r.read_u64::<LittleEndian>()?,
        });
    }
    Ok(Vector { iovs })
}

pub fn encode_progress(w: &mut impl Write, msg: &Progress) -> Result<(), ProtocolError> {
    w.write_u64::<LittleEndian>(msg.nfilled)?;
    w.write_u64::<LittleEndian>(msg.nleftover)?;
    Ok(())
}

pub fn decode_progress(buf: &[u8]) -> Result<Progress, ProtocolError> {
    if buf.len() < PROGRESS_MSG_LEN {
        return Err(ProtocolError::Truncated {
            what: "progress",
            got: buf.len(),
        });
    }
    let mut r = buf;
    Ok(Progress {
        nfilled: r.read_u64::<LittleEndian>()?,
        nleftover: r.read_u64::<LittleEndian>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn initial_roundtrip_ignores_nonce_meaning() {
        let msg = Initial {
            nonce: 0,
            nsources: 4,
            id: 2,
            addr: FabricAddr::from_bytes(b"127.0.0.1:4242").unwrap(),
        };
        let mut wire = Vec::new();
        encode_initial(&mut wire, &msg).unwrap();
        assert_eq!(wire.len(), 28 + 14);
        assert_eq!(decode_initial(&wire).unwrap(), msg);
        // nonzero nonce is reserved, not rejected
        wire[0] = 0xff;
        assert!(decode_initial(&wire).is_ok());
    }

    #[test]
    fn vector_limits() {
        let seg = RemoteIovec {
            addr: 0,
            len: 8192,
            key: 7,
        };
        let msg = Vector {
            iovs: vec![seg; MAX_RIOVS],
        };
        let mut wire = Vec::new();
        encode_vector(&mut wire, &msg).unwrap();
        assert_eq!(wire.len(), VECTOR_MSG_MAX);
        assert_eq!(decode_vector(&wire).unwrap(), msg);

        // 13 segments must be rejected even with the bytes present
        let mut bad = Vec::new();
        bad.extend_from_slice(&13u32.to_le_bytes());
        bad.extend_from_slice(&0u32.to_le_bytes());
        bad.resize(8 + 13 * 24, 0);
        assert!(matches!(
            decode_vector(&bad),
            Err(ProtocolError::TooManySegments(13))
        ));

        // truncated body
        assert!(matches!(
            decode_vector(&wire[..wire.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn ack_addrlen_bound() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&513u32.to_le_bytes());
        bad.resize(4 + 513, 0);
        assert!(matches!(
            decode_ack(&bad),
            Err(ProtocolError::AddrTooLong(513))
        ));
    }

    #[test]
    fn empty_vector_is_eof_shaped() {
        let mut wire = Vec::new();
        encode_vector(&mut wire, &Vector { iovs: vec![] }).unwrap();
        assert_eq!(wire.len(), 8);
        assert!(decode_vector(&wire).unwrap().iovs.is_empty());
    }

    #[test]
    fn progress_is_sixteen_bytes() {
        let msg = Progress {
            nfilled: 8192,
            nleftover: 1,
        };
        let mut wire = Vec::new();
        encode_progress(&mut wire, &msg).unwrap();
        assert_eq!(wire.len(), PROGRESS_MSG_LEN);
        assert_eq!(decode_progress(&wire).unwrap(), msg);
        assert!(decode_progress(&wire[..15]).is_err());
    }
}
