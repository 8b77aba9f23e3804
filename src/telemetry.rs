//! Request telemetry: newline-delimited JSON records appended to an optional
//! size-rotated log file. Telemetry must never fail a request; write errors
//! are logged and counted.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Simple size-based rotating writer. When the file reaches `max_bytes` the
/// existing backups shift up (`<path>.1` .. `<path>.keep`) and the current
/// file is truncated.
pub struct RotatingWriter {
    path: PathBuf,
    file: std::fs::File,
    max_bytes: Option<u64>,
    keep: usize,
}

impl RotatingWriter {
    pub fn open(path: &str, max_bytes: Option<u64>, keep: usize) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.check_rotate();
        writeln!(self.file, "{}", line)
    }

    fn check_rotate(&mut self) {
        let Some(limit) = self.max_bytes else { return };
        let exceeded = self
            .path
            .metadata()
            .map(|meta| meta.len() >= limit)
            .unwrap_or(false);
        if exceeded {
            self.rotate_backups();
            self.reopen_current();
        }
    }

    fn backup_path(&self, idx: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), idx))
    }

    fn rotate_backups(&self) {
        if self.keep == 0 {
            return;
        }
        for idx in (1..=self.keep).rev() {
            let old = if idx == 1 {
                self.path.clone()
            } else {
                self.backup_path(idx - 1)
            };
            if old.exists() {
                let _ = fs::rename(&old, self.backup_path(idx));
            }
        }
    }

    fn reopen_current(&mut self) {
        if let Ok(newf) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = newf;
        }
    }
}

/// Sink for per-request JSON lines. Cloneable; shared across handlers.
#[derive(Clone)]
pub struct RequestLog {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl RequestLog {
    pub fn new(writer: Option<Arc<Mutex<RotatingWriter>>>) -> Self {
        Self {
            writer,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn emit(&self, payload: &serde_json::Value) {
        let Some(target) = self.writer.as_ref() else {
            return;
        };
        let line = payload.to_string();
        if let Ok(mut guard) = target.lock() {
            match guard.write_line(&line) {
                Ok(_) => {
                    self.lines_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(error=%e, "Failed to write request log line");
                    self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}
