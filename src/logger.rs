/// Run log -- timestamped lines to stdout plus an append-mode log file.
///
/// One file per run, named after the binary (`redgreen.log`), opened in
/// append mode and flushed after every line so an interrupted run loses
/// nothing already written. The bell helpers cover the three audible
/// signals: success, fatal/halt, and sandbox blocks.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;

pub struct Logger {
    file: Mutex<Option<File>>,
}

impl Logger {
    /// Open (or create) `redgreen.log` inside `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join("redgreen.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file at {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    /// A logger that only prints -- used by `init` and in tests.
    pub fn console_only() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Print a timestamped line and append it to the log file.
    /// File errors are swallowed -- logging must never take down a run.
    pub fn log(&self, msg: &str) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), msg);
        println!("{line}");
        if let Ok(mut guard) = self.file.lock() {
            if let Some(f) = guard.as_mut() {
                let _ = writeln!(f, "{line}");
                let _ = f.flush();
            }
        }
    }

    /// Emit a single terminal bell.
    pub fn bell(&self) {
        print!("\x07");
        let _ = std::io::stdout().flush();
    }

    /// Emit `n` bells -- three on a graceful halt.
    pub fn bells(&self, n: usize) {
        for _ in 0..n {
            self.bell();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_appends_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::open(dir.path()).unwrap();
        logger.log("first line");
        logger.log("second line");
        // flushed per line -- readable without dropping the logger
        let content = std::fs::read_to_string(dir.path().join("redgreen.log")).unwrap();
        assert!(content.contains("first line"));
        assert!(content.contains("second line"));
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_log_reopens_in_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        {
            let logger = Logger::open(dir.path()).unwrap();
            logger.log("run one");
        }
        {
            let logger = Logger::open(dir.path()).unwrap();
            logger.log("run two");
        }
        let content = std::fs::read_to_string(dir.path().join("redgreen.log")).unwrap();
        assert!(content.contains("run one"));
        assert!(content.contains("run two"));
    }

    #[test]
    fn test_console_only_does_not_create_file() {
        let logger = Logger::console_only();
        logger.log("nowhere");
        logger.bells(3);
    }
}
