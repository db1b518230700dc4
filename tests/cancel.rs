//! Cancellation drain. Lives in its own integration binary because the
//! cancel flag is process-global.

use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use fabxfer::personality::{self, Config};
use fabxfer::signal;
use fabxfer::worker::WorkerCfg;

#[test]
fn cancel_drains_both_sides() {
    // Small buffers stretch the transfer so the flag usually lands
    // mid-stream; with cancellation expected the verdict is clean either
    // way, and the interesting assertion is that both sides drain their
    // posted queues and actually return.
    let cfg = Config {
        expect_cancel: true,
        worker: WorkerCfg {
            rx_buflen: 1024,
            tx_buflen: 1024,
            ..WorkerCfg::default()
        },
        ..Config::default()
    };

    signal::install_handlers().unwrap();
    let addr = "127.0.0.1:46201".to_string();
    let get_cfg = cfg.clone();
    let get_addr = addr.clone();
    let get_handle = thread::spawn(move || {
        personality::get(Some(&get_addr), &get_cfg).expect("get personality")
    });
    for _ in 0..500 {
        if TcpStream::connect(&addr).is_ok() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let put_cfg = cfg.clone();
    let put_addr = addr.clone();
    let put_handle =
        thread::spawn(move || personality::put(&put_addr, &put_cfg).expect("put personality"));

    thread::sleep(Duration::from_millis(15));
    signal::request_cancel();

    assert!(get_handle.join().unwrap(), "receiver exits clean under -c");
    assert!(put_handle.join().unwrap(), "sender exits clean under -c");
}
