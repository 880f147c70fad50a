// src/logging.rs
//! Log sink and tracing initialization.
//!
//! Formatted lines are either written to the current log file under the
//! sink mutex (sync mode) or pushed onto a bounded queue drained by a
//! background thread (async mode). Files rotate daily and every
//! `split_lines` lines within a day. The sink is explicitly initialized
//! once and handed to the tracing subscriber as its writer; there is no
//! lazy first use.

use crate::queue::BoundedQueue;
use chrono::{Datelike, Local, NaiveDate};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Lines per file before an intra-day split.
pub const SPLIT_LINES: u64 = 800_000;
/// Async queue depth (lines).
pub const LOG_QUEUE_SIZE: usize = 800;

struct SinkFile {
    file: Option<File>,
    dir: PathBuf,
    base: String,
    today: NaiveDate,
    count: u64,
}

impl SinkFile {
    fn file_name(dir: &Path, base: &str, day: NaiveDate, split: u64) -> PathBuf {
        let stem = format!("{}_{:02}_{:02}_{}", day.year(), day.month(), day.day(), base);
        if split == 0 {
            dir.join(stem)
        } else {
            dir.join(format!("{}.{}", stem, split))
        }
    }

    fn open(dir: PathBuf, base: String) -> io::Result<Self> {
        let today = Local::now().date_naive();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_name(&dir, &base, today, 0))?;
        Ok(Self {
            file: Some(file),
            dir,
            base,
            today,
            count: 0,
        })
    }

    /// Roll to a fresh file on day change or line-count overflow.
    fn rotate_if_needed(&mut self) {
        self.count += 1;
        let today = Local::now().date_naive();
        let day_changed = today != self.today;
        let count_rolled = self.count % SPLIT_LINES == 0;
        if !day_changed && !count_rolled {
            return;
        }
        let split = if day_changed {
            self.today = today;
            self.count = 0;
            0
        } else {
            self.count / SPLIT_LINES
        };
        let path = Self::file_name(&self.dir, &self.base, self.today, split);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => self.file = Some(f),
            Err(_) => self.file = None,
        }
    }

    fn write_line(&mut self, line: &str) {
        self.rotate_if_needed();
        if let Some(f) = self.file.as_mut() {
            let _ = f.write_all(line.as_bytes());
            let _ = f.flush();
        }
    }
}

pub struct LogSink {
    inner: Mutex<SinkFile>,
    queue: Option<Arc<BoundedQueue<String>>>,
}

impl LogSink {
    /// Open the sink. `async_mode` enables the queue and drain thread.
    pub fn init(dir: impl Into<PathBuf>, base: &str, async_mode: bool) -> io::Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let queue = async_mode.then(|| Arc::new(BoundedQueue::new(LOG_QUEUE_SIZE)));
        let sink = Arc::new(Self {
            inner: Mutex::new(SinkFile::open(dir, base.to_string())?),
            queue: queue.clone(),
        });

        if let Some(queue) = queue {
            let drain_sink = sink.clone();
            thread::Builder::new()
                .name("weir-log".to_string())
                .spawn(move || loop {
                    let line = queue.pop();
                    drain_sink.inner.lock().unwrap().write_line(&line);
                })?;
        }

        Ok(sink)
    }

    /// Queue the line in async mode (falling back to a direct write when
    /// the queue is full), or write it under the mutex.
    pub fn log_line(&self, line: String) {
        if let Some(queue) = &self.queue {
            if queue.push(line.clone()) {
                return;
            }
        }
        self.inner.lock().unwrap().write_line(&line);
    }
}

/// `io::Write` adapter handed to the tracing fmt layer. Buffers until the
/// layer flushes one complete event, then forwards the line to the sink.
pub struct SinkWriter {
    sink: Arc<LogSink>,
    buf: Vec<u8>,
}

impl SinkWriter {
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(256),
        }
    }
}

impl io::Write for SinkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.sink
                .log_line(String::from_utf8_lossy(&self.buf).into_owned());
            self.buf.clear();
        }
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Install the global subscriber writing through the sink. The level is
/// controlled by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(sink: Arc<LogSink>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(move || SinkWriter::new(sink.clone())),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_layout() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        let plain = SinkFile::file_name(Path::new("/tmp/logs"), "ServerLog", day, 0);
        assert_eq!(plain, Path::new("/tmp/logs/2026_03_07_ServerLog"));
        let split = SinkFile::file_name(Path::new("/tmp/logs"), "ServerLog", day, 2);
        assert_eq!(split, Path::new("/tmp/logs/2026_03_07_ServerLog.2"));
    }

    #[test]
    fn sync_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::init(dir.path(), "ServerLog", false).unwrap();
        sink.log_line("hello sink\n".to_string());

        let day = Local::now().date_naive();
        let path = SinkFile::file_name(dir.path(), "ServerLog", day, 0);
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("hello sink"));
    }

    #[test]
    fn async_sink_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::init(dir.path(), "ServerLog", true).unwrap();
        for i in 0..10 {
            sink.log_line(format!("line {}\n", i));
        }

        let day = Local::now().date_naive();
        let path = SinkFile::file_name(dir.path(), "ServerLog", day, 0);
        // Give the drain thread a moment.
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            if let Ok(content) = std::fs::read_to_string(&path) {
                if content.lines().count() == 10 {
                    return;
                }
            }
        }
        panic!("drain thread never flushed all lines");
    }
}
