use std::process::ExitCode;

use clap::Parser;

use fabxfer::personality::{self, Config};
use fabxfer::signal;

/// Fabric bulk-transfer listener (receiver personality).
#[derive(Parser)]
#[command(name = "fget", version)]
struct Opts {
    /// Local bind address.
    #[arg(short = 'b')]
    bind: Option<String>,

    /// Expect cancellation; exit cleanly only if canceled.
    #[arg(short = 'c')]
    expect_cancel: bool,

    /// Number of parallel sessions.
    #[arg(short = 'n', default_value_t = 1)]
    nsessions: u32,

    /// CPU range "i - j" for worker affinity.
    #[arg(short = 'p')]
    cpus: Option<String>,

    /// Re-register payload buffers per write.
    #[arg(short = 'r')]
    reregister: bool,

    /// Wait on file descriptors (epoll) instead of the fabric poll set.
    #[arg(short = 'w')]
    fd_wait: bool,
}

fn main() -> ExitCode {
    fabxfer::log::init();
    let opts = Opts::parse();
    if let Err(e) = signal::install_handlers() {
        log::error!("fget: cannot install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    let mut cfg = Config {
        nsessions: opts.nsessions,
        expect_cancel: opts.expect_cancel,
        reregister: opts.reregister,
        ..Config::default()
    };
    cfg.worker.use_fd_wait = opts.fd_wait;
    cfg.cpu_range = match opts.cpus.as_deref().map(personality::parse_cpu_range) {
        Some(Ok(range)) => Some(range),
        Some(Err(e)) => {
            log::error!("fget: {e}");
            return ExitCode::FAILURE;
        }
        None => None,
    };

    match personality::get(opts.bind.as_deref(), &cfg) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("fget: {e}");
            ExitCode::FAILURE
        }
    }
}
