//! The two process personalities: `get` listens and receives, `put`
//! dials and sends. Each accepts/dials N endpoints, builds the matching
//! connection + terminal sessions and hands them to a worker pool, then
//! waits the transfer out and folds the pool status into an exit
//! verdict.

use std::time::Duration;

use log::{debug, info, warn};

use crate::buf::{Buffer, XferKind};
use crate::cxn::{Connection, Receiver, Sender};
use crate::error::{Error, Result};
use crate::fabric::tcp::{self, Endpoint, Listener};
use crate::pool::{PoolStatus, WorkerPool};
use crate::proto::{self, INITIAL_MSG_MAX};
use crate::session::Session;
use crate::signal;
use crate::terminal::{Sink, Source, Terminal};
use crate::worker::WorkerCfg;

/// The service port, fixed by the protocol.
pub const SERVICE: &str = "4242";

#[derive(Debug, Clone)]
pub struct Config {
    pub nsessions: u32,
    /// Exit cleanly only if the run was canceled.
    pub expect_cancel: bool,
    /// Re-register payload buffers per write.
    pub reregister: bool,
    /// Contiguous-writes mode: never fragment (`rma_maxsegs` capped at 1).
    pub contiguous: bool,
    /// Worker CPU affinity range; only the listener pins threads.
    pub cpu_range: Option<(usize, usize)>,
    pub worker: WorkerCfg,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nsessions: 1,
            expect_cancel: false,
            reregister: false,
            contiguous: false,
            cpu_range: None,
            worker: WorkerCfg::default(),
        }
    }
}

/// Parse the `-p "i - j"` CPU range.
pub fn parse_cpu_range(text: &str) -> Result<(usize, usize)> {
    let parse = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| Error::Config(format!("bad cpu range {text:?}")))
    };
    let (lo, hi) = text
        .split_once('-')
        .ok_or_else(|| Error::Config(format!("bad cpu range {text:?}")))?;
    let (lo, hi) = (parse(lo)?, parse(hi)?);
    if lo > hi {
        return Err(Error::Config(format!("bad cpu range {text:?}")));
    }
    Ok((lo, hi))
}

fn with_service(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{SERVICE}")
    }
}

/// Synchronously read the initial message off a freshly accepted
/// endpoint. This is the only blocking read outside the workers and it
/// watches the cancel flag.
fn read_initial(ep: &mut Endpoint) -> Result<proto::Initial> {
    let mut buf = Buffer::new(XferKind::Initial, INITIAL_MSG_MAX);
    let token = buf.ctx.token().0;
    let span = buf.raw_span(0, buf.nallocated());
    ep.recv(span, token)?;
    loop {
        if signal::cancel_requested() {
            return Err(Error::Config("canceled during handshake".into()));
        }
        match ep.cq_read()? {
            Some(cmpl) if cmpl.token == token && cmpl.error.is_none() => {
                return Ok(proto::decode_initial(&buf.bytes()[..cmpl.len])?);
            }
            Some(_) => return Err(Error::other("unexpected completion during handshake")),
            None => {
                if ep.peer_closed() && !ep.has_completions() {
                    return Err(Error::other("peer closed before the initial message"));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn verdict(cfg: &Config, status: &PoolStatus) -> bool {
    let canceled = status.canceled || signal::cancel_requested();
    if status.failed {
        return false;
    }
    if cfg.expect_cancel {
        canceled
    } else {
        !canceled
    }
}

/// Listener personality: accept `nsessions` endpoints and run a
/// receiver + sink session for each. Returns whether the process should
/// exit cleanly.
pub fn get(bind: Option<&str>, cfg: &Config) -> Result<bool> {
    let addr = with_service(bind.unwrap_or("0.0.0.0"));
    let listener = Listener::bind(&addr)?;
    info!("listening on {}", listener.local_addr()?);
    let pool = WorkerPool::new(cfg.worker.clone(), cfg.cpu_range);

    let mut accepted = 0;
    while accepted < cfg.nsessions {
        if signal::cancel_requested() {
            break;
        }
        let Some(mut ep) = listener.accept()? else {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };
        let initial = match read_initial(&mut ep) {
            Ok(initial) => initial,
            Err(_) if signal::cancel_requested() => break,
            Err(e) => {
                // A dialer that never speaks (or dies mid-handshake) does
                // not take the listener down.
                warn!("handshake failed, dropping endpoint: {e}");
                continue;
            }
        };
        debug!(
            "accepted session {} of {} from {}",
            initial.id, initial.nsources, initial.addr
        );
        if initial.nsources != cfg.nsessions {
            warn!(
                "peer advertises {} sources, this side expects {}",
                initial.nsources, cfg.nsessions
            );
        }
        let receiver = Receiver::new(ep, cfg.reregister)?;
        let session = Session::new(Connection::Receiver(receiver), Terminal::Sink(Sink::new()));
        pool.assign(session)?;
        accepted += 1;
    }

    pool.wait_sessions();
    let status = pool.shutdown();
    Ok(verdict(cfg, &status))
}

/// Connector personality: dial `nsessions` endpoints and run a sender +
/// source session for each.
pub fn put(dest: &str, cfg: &Config) -> Result<bool> {
    let addr = with_service(dest);
    // Only the listener pins worker threads.
    let pool = WorkerPool::new(cfg.worker.clone(), None);

    for id in 0..cfg.nsessions {
        if signal::cancel_requested() {
            break;
        }
        let ep = tcp::connect(addr.as_str())?;
        let sender = Sender::new(ep, id, cfg.nsessions, cfg.reregister, cfg.contiguous)?;
        let session = Session::new(Connection::Sender(sender), Terminal::Source(Source::new()));
        pool.assign(session)?;
    }

    pool.wait_sessions();
    let status = pool.shutdown();
    Ok(verdict(cfg, &status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_range_parsing() {
        assert_eq!(parse_cpu_range("0 - 3").unwrap(), (0, 3));
        assert_eq!(parse_cpu_range("2-2").unwrap(), (2, 2));
        assert!(parse_cpu_range("3 - 1").is_err());
        assert!(parse_cpu_range("x - 1").is_err());
        assert!(parse_cpu_range("4").is_err());
    }
}
