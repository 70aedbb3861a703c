//! Logging bootstrap (§4.10, ambient). `env_logger` drives stderr output
//! the usual way; a thin [`log::Log`] wrapper additionally forwards every
//! formatted record into the engine's `log` event channel, and keeps a
//! bounded history so the `/logs` REST endpoint has something to return
//! to a client that wasn't connected to the websocket when a line was
//! logged.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use gateway_core::{EventBus, GeneralEvent, LogLevel};
use log::LevelFilter;
use serde::Serialize;

const HISTORY_CAPACITY: usize = 500;

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub timestamp: f64,
    pub level: String,
    pub message: String,
}

/// Bounded ring buffer of recent log lines, independent of whether any
/// websocket subscriber was connected when they were emitted.
pub struct LogHistory {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogHistory {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

struct BusLogger {
    inner: env_logger::Logger,
    events: EventBus,
    history: Arc<LogHistory>,
}

impl log::Log for BusLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = match record.level() {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warning,
            _ => LogLevel::System,
        };
        let timestamp_secs = now_secs();
        let message = format!("{}", record.args());

        self.history.push(LogEntry {
            timestamp: timestamp_secs,
            level: format!("{level:?}"),
            message: message.clone(),
        });

        self.events.emit(GeneralEvent::Log {
            timestamp_secs,
            level,
            message,
        });

        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Installs the combined logger. `verbosity` is the CLI's repeated `-v`
/// count: 0 leaves `RUST_LOG`/the default filter alone, 1 forces `debug`,
/// 2+ forces `trace`. Returns the history buffer so the HTTP layer can
/// serve `/logs` reads and clears against it.
pub fn init(events: EventBus, verbosity: u8) -> Arc<LogHistory> {
    let mut builder = env_logger::Builder::from_default_env();
    match verbosity {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }

    let inner = builder.build();
    let filter = inner.filter();
    let history = Arc::new(LogHistory::new());
    let logger = BusLogger {
        inner,
        events,
        history: history.clone(),
    };

    log::set_boxed_logger(Box::new(logger)).expect("logger already initialized");
    log::set_max_level(filter);

    history
}
