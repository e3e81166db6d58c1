//! Per-run text log of phase transitions and executed statements.
//!
//! Workers buffer their lines in an [`ItemLog`] and hand it to the
//! [`RunLog`] once per attempt, so the lines of concurrently processed
//! objects stay grouped. Write failures are reported once and otherwise
//! ignored.

use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;

/// Append-only log sink for one run.
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
    write_failed: AtomicBool,
}

impl RunLog {
    /// Create `<dir>/mssql-db-copy_<yyyyMMdd_HHmmss>.log`.
    pub fn create(dir: &Path, started: DateTime<Local>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "mssql-db-copy_{}.log",
            started.format("%Y%m%d_%H%M%S")
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Writing run log to {}", path.display());

        Ok(Self {
            path: Some(path),
            file: Some(Mutex::new(file)),
            write_failed: AtomicBool::new(false),
        })
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
            write_failed: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Log file path, if enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start a buffer for one item attempt.
    pub fn item_log(&self) -> ItemLog {
        ItemLog {
            enabled: self.is_enabled(),
            lines: Vec::new(),
        }
    }

    /// Append a single line.
    pub fn line(&self, message: &str) {
        if self.is_enabled() {
            self.write(&[stamp(message)]);
        }
    }

    /// Append a flushed item buffer as one block.
    pub fn write_item(&self, log: ItemLog) {
        if !log.lines.is_empty() {
            self.write(&log.lines);
        }
    }

    fn write(&self, lines: &[String]) {
        let Some(file) = &self.file else {
            return;
        };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);

        let result = lines
            .iter()
            .try_for_each(|line| writeln!(file, "{}", line))
            .and_then(|_| file.flush());

        if let Err(e) = result {
            if !self.write_failed.swap(true, Ordering::Relaxed) {
                warn!("Failed to write run log: {} (further errors suppressed)", e);
            }
        }
    }
}

/// Buffered log lines of one item attempt.
#[derive(Debug, Default)]
pub struct ItemLog {
    enabled: bool,
    lines: Vec<String>,
}

impl ItemLog {
    /// Buffer that keeps lines even without a file, for inspection.
    pub fn capturing() -> Self {
        Self {
            enabled: true,
            lines: Vec::new(),
        }
    }

    pub fn line(&mut self, message: impl AsRef<str>) {
        if self.enabled {
            self.lines.push(stamp(message.as_ref()));
        }
    }

    /// Record an executed statement and how long it took.
    pub fn statement(&mut self, sql: &str, elapsed: Duration) {
        if self.enabled {
            self.lines.push(stamp(sql.trim_end()));
            self.lines
                .push(stamp(&format!("-- {} ms", elapsed.as_millis())));
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

fn stamp(message: &str) -> String {
    format!("{} {}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"), message)
}
