//! Two-sink logging.
//!
//! Console lines are routed through the progress area so active bars stay
//! rendered; everything from trace upward also lands in an append-mode line
//! file. Handles are cheap to clone and carry a per-component prefix.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use indicatif::MultiProgress;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }
}

// Everything reaches the file; the console skips trace.
const CONSOLE_THRESHOLD: Level = Level::Debug;

struct Sinks {
    progress: MultiProgress,
    file: Mutex<Box<dyn Write + Send>>,
}

#[derive(Clone)]
pub struct SyncLog {
    prefix: Arc<str>,
    sinks: Arc<Sinks>,
}

impl SyncLog {
    pub fn new(progress: MultiProgress, file: Box<dyn Write + Send>, prefix: &str) -> Self {
        SyncLog {
            prefix: prefix.into(),
            sinks: Arc::new(Sinks {
                progress,
                file: Mutex::new(file),
            }),
        }
    }

    /// Open the line file in append mode. Failure to open degrades to a
    /// discard sink with a console warning rather than aborting.
    pub fn open(progress: MultiProgress, path: &Path, prefix: &str) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => SyncLog::new(progress, Box::new(file), prefix),
            Err(err) => {
                let log = SyncLog::new(progress, Box::new(io::sink()), prefix);
                log.warn(&format!(
                    "unable to open log file {} for writing: {err}",
                    path.display()
                ));
                log
            }
        }
    }

    /// A logger with both sinks discarded. Handy for tests and optional
    /// debug hooks.
    pub fn discard() -> Self {
        SyncLog::new(MultiProgress::new(), Box::new(io::sink()), "discard")
    }

    pub fn with_prefix(&self, prefix: &str) -> SyncLog {
        SyncLog {
            prefix: prefix.into(),
            sinks: self.sinks.clone(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn write(&self, level: Level, msg: &str) {
        let line = format!("{:5} [{}] {}", level.tag(), self.prefix, msg);
        if level >= CONSOLE_THRESHOLD {
            let _ = self.sinks.progress.println(&line);
        }
        let mut file = self.sinks.file.lock();
        let _ = writeln!(
            file,
            "[{}] {line}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
        );
    }

    pub fn trace(&self, msg: &str) {
        self.write(Level::Trace, msg);
    }

    pub fn debug(&self, msg: &str) {
        self.write(Level::Debug, msg);
    }

    pub fn info(&self, msg: &str) {
        self.write(Level::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.write(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.write(Level::Error, msg);
    }

    pub fn critical(&self, msg: &str) {
        self.write(Level::Critical, msg);
    }

    pub fn flush(&self) {
        let _ = self.sinks.file.lock().flush();
    }
}
