//! End-to-end transfers over loopback: both personalities run in this
//! process, each with its own worker pool, on a per-test port.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use fabxfer::personality::{self, Config};
use fabxfer::proto;
use fabxfer::worker::WorkerCfg;

/// Wait until the listener answers, leaving a probe connection behind.
/// The listener drops silent dialers, so the probe is harmless.
fn await_listener(addr: &str) {
    for _ in 0..500 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("listener on {addr} never came up");
}

fn run_pair(port: u16, get_cfg: Config, put_cfg: Config) -> (bool, bool) {
    // The worker wakeup signal must have its no-op handler before any
    // pool delivers it; repeated installs are fine.
    fabxfer::signal::install_handlers().unwrap();
    let addr = format!("127.0.0.1:{port}");
    let get_addr = addr.clone();
    let get_handle = thread::Builder::new()
        .name("get-main".into())
        .spawn(move || personality::get(Some(&get_addr), &get_cfg).expect("get personality"))
        .unwrap();
    await_listener(&addr);
    let put_handle = thread::Builder::new()
        .name("put-main".into())
        .spawn(move || personality::put(&addr, &put_cfg).expect("put personality"))
        .unwrap();
    (get_handle.join().unwrap(), put_handle.join().unwrap())
}

#[test]
fn single_session_transfers_and_verifies() {
    let (got, put) = run_pair(46101, Config::default(), Config::default());
    assert!(got, "receiver verdict");
    assert!(put, "sender verdict");
}

#[test]
fn four_parallel_sessions() {
    let cfg = Config {
        nsessions: 4,
        ..Config::default()
    };
    let (got, put) = run_pair(46102, cfg.clone(), cfg);
    assert!(got);
    assert!(put);
}

#[test]
fn contiguous_mode_never_fragments() {
    let put_cfg = Config {
        contiguous: true,
        ..Config::default()
    };
    let (got, put) = run_pair(46103, Config::default(), put_cfg);
    assert!(got);
    assert!(put);
}

#[test]
fn reregister_per_write() {
    let cfg = Config {
        reregister: true,
        ..Config::default()
    };
    let (got, put) = run_pair(46104, cfg.clone(), cfg);
    assert!(got);
    assert!(put);
}

#[test]
fn fd_wait_mode() {
    let mut get_cfg = Config::default();
    get_cfg.worker.use_fd_wait = true;
    let mut put_cfg = Config::default();
    put_cfg.worker.use_fd_wait = true;
    let (got, put) = run_pair(46105, get_cfg, put_cfg);
    assert!(got);
    assert!(put);
}

#[test]
fn oversize_payload_fragments_across_the_window() {
    // Sender buffers larger than the whole remote write window
    // (rma_maxsegs × target size) force the fragmentation path: parents
    // retire only after their child fragments complete, and the sink
    // still sees a byte-perfect stream.
    let get_cfg = Config::default();
    let mut put_cfg = Config::default();
    put_cfg.worker = WorkerCfg {
        tx_buflen: 40960,
        ..WorkerCfg::default()
    };
    let (got, put) = run_pair(46106, get_cfg, put_cfg);
    assert!(got);
    assert!(put);
}

// ---------------------------------------------------------------------
// Zero-advertisement edge: a hand-rolled receiver answers the handshake
// and immediately advertises an empty vector. The sender must record
// remote EOF, post no writes, send `nleftover == 0` and close cleanly.
// ---------------------------------------------------------------------

const FRAME_MSG: u8 = 1;

fn send_msg_frame(stream: &mut TcpStream, payload: &[u8]) {
    let mut hdr = [0u8; 5];
    hdr[0] = FRAME_MSG;
    LittleEndian::write_u32(&mut hdr[1..5], payload.len() as u32);
    stream.write_all(&hdr).unwrap();
    stream.write_all(payload).unwrap();
}

fn read_msg_frame(stream: &mut TcpStream) -> Vec<u8> {
    let kind = stream.read_u8().unwrap();
    assert_eq!(kind, FRAME_MSG, "expected a message frame");
    let len = stream.read_u32::<byteorder::LittleEndian>().unwrap() as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    payload
}

#[test]
fn zero_advertisement_is_an_immediate_eof() {
    fabxfer::signal::install_handlers().unwrap();
    let listener = TcpListener::bind("127.0.0.1:46107").unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_nodelay(true).unwrap();

        let initial = proto::decode_initial(&read_msg_frame(&mut stream)).unwrap();
        assert_eq!(initial.nsources, 1);
        assert_eq!(initial.id, 0);
        assert_eq!(initial.nonce, 0);

        let addr = stream.local_addr().unwrap().to_string();
        let mut ack = Vec::new();
        proto::encode_ack(
            &mut ack,
            &proto::Ack {
                addr: fabxfer::fabric::FabricAddr::from_bytes(addr.as_bytes()).unwrap(),
            },
        )
        .unwrap();
        send_msg_frame(&mut stream, &ack);

        let mut empty_vector = Vec::new();
        proto::encode_vector(&mut empty_vector, &proto::Vector { iovs: Vec::new() }).unwrap();
        send_msg_frame(&mut stream, &empty_vector);

        // The sender owes exactly one progress message: the close.
        let progress = proto::decode_progress(&read_msg_frame(&mut stream)).unwrap();
        assert_eq!(progress.nfilled, 0);
        assert_eq!(progress.nleftover, 0);
    });

    let ok = personality::put("127.0.0.1:46107", &Config::default()).unwrap();
    assert!(ok, "sender must close cleanly on an empty first vector");
    server.join().unwrap();
}
