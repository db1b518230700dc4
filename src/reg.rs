//! Registration keys and scatter-gather registration.
//!
//! Keys must be unique process-wide while hand-out stays lock-free on
//! the hot path: a [`KeySource`] draws blocks of 256 keys from one
//! global atomic and then hands them out single-threadedly.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::fabric::tcp::Endpoint;
use crate::fabric::{self, Access, MrHandle, RawSpan};

/// Keys drawn per block.
pub const KEY_BLOCK: u64 = 256;

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Per-connection source of unique registration keys.
#[derive(Debug, Default)]
pub struct KeySource {
    next: u64,
    limit: u64,
}

impl KeySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&mut self) -> u64 {
        if self.next == self.limit {
            self.next = NEXT_KEY.fetch_add(KEY_BLOCK, Ordering::Relaxed);
            self.limit = self.next + KEY_BLOCK;
        }
        let key = self.next;
        self.next += 1;
        key
    }
}

/// One input segment's registration result.
#[derive(Debug, Clone, Copy)]
pub struct RegSeg {
    pub handle: MrHandle,
    pub desc: u64,
    /// Logical remote offset of this segment within its registration.
    pub offset: u64,
}

/// Result of [`regv_all`]: one handle per registration call, one
/// [`RegSeg`] per input segment.
#[derive(Debug)]
pub struct RegVec {
    pub handles: Vec<MrHandle>,
    pub segs: Vec<RegSeg>,
}

impl RegVec {
    pub fn close(self, ep: &mut Endpoint) {
        for h in self.handles {
            ep.mr_close(h.key);
        }
    }
}

/// Register an `iov` of any length in `ceil(n / maxsegs)` calls, one
/// fresh key per call. Remote addresses within each registration are the
/// cumulative logical offsets of its segments. On any failure every
/// registration issued so far is closed before the error returns.
pub fn regv_all(
    ep: &mut Endpoint,
    iov: &[RawSpan],
    maxsegs: usize,
    access: Access,
    keys: &mut KeySource,
) -> Result<RegVec, fabric::Error> {
    let mut handles = Vec::with_capacity(iov.len().div_ceil(maxsegs));
    let mut segs = Vec::with_capacity(iov.len());
    for chunk in iov.chunks(maxsegs) {
        let key = keys.next_key();
        match ep.mr_reg(key, chunk.to_vec(), access) {
            Ok(handle) => {
                let mut offset = 0u64;
                for span in chunk {
                    segs.push(RegSeg {
                        handle,
                        desc: span.desc(),
                        offset,
                    });
                    offset += span.len() as u64;
                }
                handles.push(handle);
            }
            Err(e) => {
                for h in handles {
                    ep.mr_close(h.key);
                }
                return Err(e);
            }
        }
    }
    Ok(RegVec { handles, segs })
}

/// Split `buf` into up to `niovs` segments with Fibonacci lengths
/// (1, 1, 2, 3, 5, …) capped at the remaining length; the final segment
/// absorbs any residue. Exercises the registration and scatter-gather
/// paths with non-uniform segment sizes.
pub fn fibonacci_iov_setup(buf: &mut [u8], niovs: usize) -> Vec<RawSpan> {
    let len = buf.len();
    let base = buf.as_mut_ptr();
    let mut out = Vec::new();
    let (mut a, mut b) = (1usize, 1usize);
    let mut off = 0usize;
    for i in 0..niovs {
        if off == len {
            break;
        }
        let seg = if i + 1 == niovs {
            len - off
        } else {
            a.min(len - off)
        };
        // SAFETY: disjoint in-bounds subranges of one mutable slice.
        out.push(unsafe { RawSpan::new(base.add(off), seg) });
        off += seg;
        let c = a + b;
        a = b;
        b = c;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fibonacci_lengths_sum_and_shape() {
        for (len, niovs) in [(0usize, 4), (1, 4), (12, 6), (100, 5), (7, 1), (1000, 12)] {
            let mut buf = vec![0u8; len];
            let iov = fibonacci_iov_setup(&mut buf, niovs);
            let total: usize = iov.iter().map(RawSpan::len).sum();
            assert_eq!(total, len, "len={len} niovs={niovs}");
            assert!(iov.len() <= niovs);
            // all but the last follow the capped Fibonacci sequence
            let (mut a, mut b) = (1usize, 1usize);
            let mut remaining = len;
            for span in iov.iter().take(iov.len().saturating_sub(1)) {
                assert_eq!(span.len(), a.min(remaining));
                remaining -= span.len();
                let c = a + b;
                a = b;
                b = c;
            }
        }
    }

    #[test]
    fn keys_unique_across_sources_and_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let mut keys = KeySource::new();
                    (0..1000).map(|_| keys.next_key()).collect::<Vec<u64>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for key in h.join().unwrap() {
                assert!(seen.insert(key), "duplicate key {key}");
            }
        }
    }
}
