//! Logging utils. See ["log" crate documentation](https://docs.rs/log/)
//! for details.
//!
//! The binaries stand alone, so the crate carries its own backend: a
//! [`Log`] implementation that writes one line per record to stderr. The
//! maximum level is read from the `FABXFER_LOG` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace`) when the logger is
//! installed; it defaults to `info`.

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

/// Install the stderr backend. Repeated calls are no-ops (only the first
/// `set_logger` wins, which is what the in-process tests need).
pub fn init() {
    let level = level_from_env();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn level_from_env() -> LevelFilter {
    match std::env::var("FABXFER_LOG").as_deref() {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        Ok("off") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let mut err = std::io::stderr().lock();
        // A failed write to stderr has nowhere to be reported.
        let _ = writeln!(
            err,
            "{:<5} [{}] {}: {}",
            record.level(),
            thread.name().unwrap_or("?"),
            record.target(),
            record.args()
        );
    }

    #[inline(always)]
    fn flush(&self) {}
}
