//! Concrete implementation of the log facade.
//!
//! Routes the `log` crate's macros to the host's stderr, one line per
//! record, with a coarse per-module filter. The arch layer would swap
//! this for its serial/framebuffer sinks; the interface to the rest of
//! the kernel is just the `log` macros.

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Per-module log level overrides, checked by longest matching prefix.
///
/// Turn a module up when debugging it, everything else stays at
/// [DEFAULT_LEVEL].
static FILTER: &[(&str, LevelFilter)] = &[
    ("borealis_kernel::futex", LevelFilter::Info),
    ("borealis_kernel::syscalls", LevelFilter::Info),
];

/// Level applied to modules without an override.
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// The logger singleton.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Max level for the given module path.
fn level_for(target: &str) -> LevelFilter {
    let mut best: Option<(&str, LevelFilter)> = None;
    for &(prefix, level) in FILTER {
        if target.starts_with(prefix) {
            match best {
                Some((p, _)) if p.len() >= prefix.len() => (),
                _ => best = Some((prefix, level)),
            }
        }
    }
    best.map_or(DEFAULT_LEVEL, |(_, level)| level)
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= level_for(metadata.target())
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let letter = match record.level() {
            Level::Error => 'E',
            Level::Warn => 'W',
            Level::Info => 'I',
            Level::Debug => 'D',
            Level::Trace => 'T',
        };
        eprintln!("[{}] {}: {}", letter, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Installs the logger. Called once from [crate::init]; a second call is
/// a no-op (the facade rejects it, we ignore the rejection).
pub fn init() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Trace));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_prefers_longest_prefix() {
        assert_eq!(level_for("borealis_kernel::futex"), LevelFilter::Info);
        assert_eq!(level_for("borealis_kernel::handle::arena"), DEFAULT_LEVEL);
    }
}
