use std::process::ExitCode;

use clap::Parser;

use fabxfer::personality::{self, Config};
use fabxfer::signal;

/// Fabric bulk-transfer connector (sender personality).
#[derive(Parser)]
#[command(name = "fput", version)]
struct Opts {
    /// Expect cancellation; exit cleanly only if canceled.
    #[arg(short = 'c')]
    expect_cancel: bool,

    /// Contiguous-writes mode: never fragment a payload buffer.
    #[arg(short = 'g')]
    contiguous: bool,

    /// Number of parallel sessions.
    #[arg(short = 'n', default_value_t = 1)]
    nsessions: u32,

    /// CPU range "i - j" (accepted for symmetry; only the listener pins).
    #[arg(short = 'p')]
    cpus: Option<String>,

    /// Re-register payload buffers per write.
    #[arg(short = 'r')]
    reregister: bool,

    /// Wait on file descriptors (epoll) instead of the fabric poll set.
    #[arg(short = 'w')]
    fd_wait: bool,

    /// Destination address.
    dest: String,
}

fn main() -> ExitCode {
    fabxfer::log::init();
    let opts = Opts::parse();
    if let Err(e) = signal::install_handlers() {
        log::error!("fput: cannot install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    let mut cfg = Config {
        nsessions: opts.nsessions,
        expect_cancel: opts.expect_cancel,
        reregister: opts.reregister,
        contiguous: opts.contiguous,
        ..Config::default()
    };
    cfg.worker.use_fd_wait = opts.fd_wait;
    if let Some(Err(e)) = opts.cpus.as_deref().map(personality::parse_cpu_range) {
        log::error!("fput: {e}");
        return ExitCode::FAILURE;
    }

    match personality::put(&opts.dest, &cfg) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("fput: {e}");
            ExitCode::FAILURE
        }
    }
}
