//! `log` facade backend: all subsystems log via `log::info!`/`warn!`/
//! `error!`/`debug!`/`trace!`; this module installs the one implementation
//! that actually writes those records anywhere.
//!
//! Compile-time level ceiling comes from the `log` crate's `max_level_*`
//! features (set in `Cargo.toml`); the runtime filter on top of that is
//! whatever [`crate::config::BootConfig::log_level`] says, settable once at
//! boot. The panic path never goes through here — see [`crate::serial::panic_print`].

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::serial;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level_tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        serial::_print(format_args!(
            "[{level_tag}] {}: {}\n",
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the serial-backed logger and set the initial runtime filter.
///
/// Must run once, early in boot, after [`serial::init`]. Calling this more
/// than once is a programmer error (`log::set_logger` would return `Err`);
/// the core calls it exactly once from `init()`.
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER).expect("logger already initialized");
    log::set_max_level(level);
}
