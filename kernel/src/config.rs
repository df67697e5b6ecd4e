//! Boot-time configuration.
//!
//! Tunables collected into a single struct constructed once during early
//! boot from compiled-in defaults and, when present, the kernel command
//! line forwarded through `BootInfo`. No dynamic reconfiguration at
//! runtime: `BootConfig` is read-only once [`init`]'s first phase completes.

use log::LevelFilter;

/// Boot-time tunables for the core.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Initial runtime log level filter (independent of the compile-time
    /// `max_level_*` feature, which only bounds what can ever be emitted).
    pub log_level: LevelFilter,
    /// Whether the AP bring-up path (C7) runs during `init()`.
    pub smp_enabled: bool,
    /// Interval, in milliseconds, used to calibrate the LAPIC timer divisor
    /// against a known-good reference count.
    pub lapic_calibration_interval_ms: u32,
    /// Size in bytes of the kernel heap region reserved at boot.
    pub heap_size: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Info,
            smp_enabled: cfg!(feature = "smp"),
            lapic_calibration_interval_ms: 10,
            heap_size: 16 * 1024 * 1024,
        }
    }
}

impl BootConfig {
    /// Build the effective configuration from compiled-in defaults,
    /// overridden by any recognized `key=value` tokens in the kernel
    /// command line (e.g. `log=debug`, `smp=off`, `heap=33554432`).
    pub fn from_cmdline(cmdline: Option<&str>) -> Self {
        let mut config = Self::default();
        let Some(cmdline) = cmdline else {
            return config;
        };

        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "log" => {
                    if let Some(level) = parse_level(value) {
                        config.log_level = level;
                    }
                }
                "smp" => config.smp_enabled = value != "off" && value != "0",
                "heap" => {
                    if let Ok(bytes) = value.parse() {
                        config.heap_size = bytes;
                    }
                }
                _ => {}
            }
        }
        config
    }
}

fn parse_level(s: &str) -> Option<LevelFilter> {
    match s {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BootConfig::default();
        assert!(config.heap_size > 0);
    }

    #[test]
    fn cmdline_overrides_log_level() {
        let config = BootConfig::from_cmdline(Some("log=debug smp=off heap=1048576"));
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert!(!config.smp_enabled);
        assert_eq!(config.heap_size, 1048576);
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let config = BootConfig::from_cmdline(Some("quiet nokaslr"));
        assert_eq!(config.log_level, BootConfig::default().log_level);
    }
}
