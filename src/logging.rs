//! Cross-process logging.
//!
//! Worker tasks never write to the main process's stderr. Each one gets a
//! [`WorkerLog`] handle that appends to its own `worker_{id}.log` and
//! forwards a copy through a shared non-blocking channel into
//! `logs/pipeline.log`, which rotates at 10 MiB with three backups. The
//! channel's background listener is owned by [`LogRelay`] and flushed on
//! drop, so every exit path stops it.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write as _},
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

use crate::prelude::*;

/// Rotate the pipeline log beyond this size.
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Number of rotated backups kept (`pipeline.log.1` … `.3`).
const LOG_BACKUPS: usize = 3;

/// The shared log queue and its background listener.
///
/// Dropping the relay (or calling [`LogRelay::stop`]) flushes and joins the
/// listener; the scheduler keeps one alive for exactly the duration of a
/// run.
pub struct LogRelay {
    logs_dir: PathBuf,
    shared: NonBlocking,
    guard: Option<WorkerGuard>,
}

impl LogRelay {
    /// Start the listener, writing to `logs_dir/pipeline.log`.
    pub fn start(logs_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("cannot create log directory {:?}", logs_dir.display()))?;
        let writer =
            RotatingFileWriter::new(logs_dir.join("pipeline.log"), MAX_LOG_BYTES, LOG_BACKUPS)?;
        let (shared, guard) = tracing_appender::non_blocking(writer);
        Ok(LogRelay {
            logs_dir: logs_dir.to_owned(),
            shared,
            guard: Some(guard),
        })
    }

    /// Write one record from the main process.
    pub fn record(&self, level: &str, message: &str) {
        let mut shared = self.shared.clone();
        let _ = shared.write_all(format_record(level, None, message).as_bytes());
    }

    /// Create the logging handle for one worker.
    pub fn worker_log(&self, worker_id: usize) -> Result<WorkerLog> {
        let path = self.logs_dir.join(format!("worker_{worker_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open worker log {:?}", path.display()))?;
        Ok(WorkerLog {
            worker_id,
            shared: self.shared.clone(),
            worker_file: Arc::new(Mutex::new(file)),
        })
    }

    /// Stop the listener, flushing buffered records.
    pub fn stop(mut self) {
        self.guard.take();
    }
}

/// A worker's logging handle. Cheap to clone; safe to use from any task.
#[derive(Clone)]
pub struct WorkerLog {
    worker_id: usize,
    shared: NonBlocking,
    worker_file: Arc<Mutex<File>>,
}

impl WorkerLog {
    /// Write one record to the worker's own file and the shared queue.
    pub fn log(&self, level: &str, message: &str) {
        let record = format_record(level, Some(self.worker_id), message);
        if let Ok(mut file) = self.worker_file.lock() {
            let _ = file.write_all(record.as_bytes());
        }
        let mut shared = self.shared.clone();
        let _ = shared.write_all(record.as_bytes());
    }
}

/// Render one log line.
fn format_record(level: &str, worker_id: Option<usize>, message: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    match worker_id {
        Some(id) => format!(
            "{}.{:03} {:5} [worker {}] {}\n",
            now.as_secs(),
            now.subsec_millis(),
            level,
            id,
            message
        ),
        None => format!(
            "{}.{:03} {:5} {}\n",
            now.as_secs(),
            now.subsec_millis(),
            level,
            message
        ),
    }
}

/// Render an error with a truncated cause chain (the last few frames of
/// context, not the whole backtrace).
pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = vec![err.to_string()];
    parts.extend(err.chain().skip(1).take(3).map(|cause| cause.to_string()));
    parts.join(" | caused by: ")
}

/// A size-rotating file writer: `path`, then `path.1` … `path.N`.
struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    fn new(path: PathBuf, max_bytes: u64, backups: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open log file {:?}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(RotatingFileWriter {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        // Shift backups upward, dropping the oldest.
        for n in (1..self.backups).rev() {
            let from = backup_path(&self.path, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(&self.path, n + 1))?;
            }
        }
        if self.path.exists() {
            std::fs::rename(&self.path, backup_path(&self.path, 1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

impl io::Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_shifts_backups() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.log");
        let mut writer = RotatingFileWriter::new(path.clone(), 16, 3).unwrap();

        // Each record is 10 bytes; the second write forces a rotation.
        io::Write::write_all(&mut writer, b"record 1 \n").unwrap();
        io::Write::write_all(&mut writer, b"record 2 \n").unwrap();
        io::Write::write_all(&mut writer, b"record 3 \n").unwrap();
        writer.flush().unwrap();

        assert!(path.exists());
        assert!(backup_path(&path, 1).exists());
        let current = std::fs::read_to_string(&path).unwrap();
        assert!(current.contains("record 3"));
    }

    #[test]
    fn worker_records_reach_both_sinks() {
        let dir = tempfile::TempDir::new().unwrap();
        let relay = LogRelay::start(dir.path()).unwrap();
        let worker = relay.worker_log(7).unwrap();
        worker.log("INFO", "scored page 3");
        relay.record("INFO", "phase complete");
        relay.stop();

        let worker_log =
            std::fs::read_to_string(dir.path().join("worker_7.log")).unwrap();
        assert!(worker_log.contains("[worker 7] scored page 3"));
        let pipeline_log =
            std::fs::read_to_string(dir.path().join("pipeline.log")).unwrap();
        assert!(pipeline_log.contains("scored page 3"));
        assert!(pipeline_log.contains("phase complete"));
    }

    #[test]
    fn error_chain_is_truncated() {
        let err = anyhow!("root cause")
            .context("step one")
            .context("step two")
            .context("step three")
            .context("step four");
        let formatted = format_error_chain(&err);
        assert!(formatted.starts_with("step four"));
        assert!(formatted.contains("caused by"));
        // Four contexts plus the root is five entries; only the first four
        // survive truncation.
        assert_eq!(formatted.matches("caused by").count(), 3);
    }
}
