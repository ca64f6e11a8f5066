//! Structured logging for the coherence core
//!
//! Generalizes the teacher's no_std `log_service` (a heap-free circular
//! buffer behind a `spin::Mutex`, queried directly by callers) into a
//! `std`-compatible [`log::Log`] backend: records still land in a bounded
//! ring buffer for in-process inspection (tests, a future `ctl logs`
//! command), but each record is also forwarded to stderr so a running
//! `node` process is observable without attaching a debugger.

use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Maximum number of log entries the in-process ring buffer retains.
const LOG_BUFFER_CAPACITY: usize = 1024;

/// A single structured log entry retained for inspection.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub target: String,
    pub message: String,
}

struct RingLogger {
    buffer: Mutex<Vec<LogEntry>>,
    next: Mutex<usize>,
}

impl RingLogger {
    fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::with_capacity(LOG_BUFFER_CAPACITY)),
            next: Mutex::new(0),
        }
    }

    fn push(&self, entry: LogEntry) {
        let mut buf = self.buffer.lock().unwrap();
        if buf.len() < LOG_BUFFER_CAPACITY {
            buf.push(entry);
        } else {
            let mut next = self.next.lock().unwrap();
            buf[*next] = entry;
            *next = (*next + 1) % LOG_BUFFER_CAPACITY;
        }
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = LogEntry {
            level: record.level(),
            target: record.target().to_string(),
            message: format!("{}", record.args()),
        };
        eprintln!("[{} {}] {}", entry.level, entry.target, entry.message);
        self.push(entry);
    }

    fn flush(&self) {}
}

static LOGGER: once_cell::Logger = once_cell::Logger::new();

/// Install the coherence core's logger as the global `log` backend.
///
/// Idempotent: a second call is a no-op, matching the teacher's
/// `log_service::log_init()` contract ("subsequent calls are silently
/// ignored").
pub fn init(filter: LevelFilter) {
    LOGGER.init(filter);
}

/// Drain the in-process ring buffer, oldest first.
///
/// Returns an empty vector if logging has not been initialized yet.
pub fn drain() -> Vec<LogEntry> {
    LOGGER.drain()
}

/// Minimal single-init wrapper so `init` can be called from multiple
/// daemons/binaries without racing `log::set_logger`.
mod once_cell {
    use super::RingLogger;
    use log::LevelFilter;
    use std::sync::OnceLock;

    pub struct Logger {
        cell: OnceLock<RingLogger>,
    }

    impl Logger {
        pub const fn new() -> Self {
            Self {
                cell: OnceLock::new(),
            }
        }

        pub fn init(&'static self, filter: LevelFilter) {
            let first_time = self.cell.get().is_none();
            let logger = self.cell.get_or_init(RingLogger::new);
            if first_time {
                // log::set_logger fails only if a logger was already set by
                // some other crate; in that case we still keep our ring
                // buffer populated for `drain()` callers, we just lose the
                // stderr/filter wiring.
                let _ = log::set_logger(logger);
            }
            log::set_max_level(filter);
        }

        pub fn drain(&'static self) -> Vec<super::LogEntry> {
            match self.cell.get() {
                Some(logger) => logger.buffer.lock().unwrap().clone(),
                None => Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_drain_reports_entries() {
        init(LevelFilter::Trace);
        init(LevelFilter::Trace);
        log::info!(target: "test", "hello from logging test");
        let entries = drain();
        assert!(entries.iter().any(|e| e.message.contains("hello")));
    }
}
