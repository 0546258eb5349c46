//! Serial-backed implementation of the `log` facade.
//!
//! Records are written as `[LEVEL] message` lines to COM1 so they survive
//! screen clears and show up in the QEMU console capture.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

static LOGGER: Logger = Logger::new();

pub struct Logger {
    inner: Mutex<()>,
}

impl Logger {
    const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::sprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger. Must run once, before any subsystem logs.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}
