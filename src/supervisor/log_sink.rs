//! Log Sink - per-profile capture of a child's combined output.
//!
//! The child writes straight into the profile's log file (opened in append
//! mode), so it keeps logging after the daemon is gone. While the daemon
//! runs, a [`LogTail`] follows the file from the offset at launch and
//! mirrors new lines into a ring buffer, so recent output can be served
//! without re-reading the file.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::current_timestamp;

pub const DEFAULT_LOG_BUFFER: usize = 2_000;

/// Longer output without a newline is split into several lines.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

const MARKER_PREFIX: &str = "[runsh ";
const TAIL_POLL: Duration = Duration::from_millis(200);

/// A single line of output captured from a child process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    /// Sequential ID for polling (`?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Combined stdout/stderr of the script
    Output,
    /// Markers written by the supervisor itself
    System,
}

/// Ring buffer that stores recent log lines with sequential IDs.
struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(DEFAULT_LOG_BUFFER)),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, content: String) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// Push one raw line, classifying supervisor markers.
    fn push_raw(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let content = String::from_utf8_lossy(raw).into_owned();
        let source = if content.starts_with(MARKER_PREFIX) {
            LogSource::System
        } else {
            LogSource::Output
        };
        self.push(source, content);
    }

    fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

/// Per-profile log capture. Outlives individual process incarnations.
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl LogSink {
    pub fn new(buffer_lines: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::with_capacity(buffer_lines))),
        }
    }

    /// Open `path` for appending markers; creates it (and its directory) if needed.
    pub async fn open(&self, path: &Path) -> std::io::Result<LogWriter> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(LogWriter {
            path: path.to_path_buf(),
            file: Arc::new(tokio::sync::Mutex::new(file)),
        })
    }

    /// Mirror everything appended to `path` after `offset` into the ring
    /// buffer until [`LogTail::finish`] is called.
    pub fn follow(&self, path: &Path, offset: u64) -> LogTail {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(tail_file(
            path.to_path_buf(),
            offset,
            self.buffer.clone(),
            stop.clone(),
        ));
        LogTail { stop, handle }
    }

    /// Lines with `id > since_id`.
    pub fn since(&self, since_id: u64) -> Vec<LogLine> {
        lock(&self.buffer).get_since(since_id)
    }

    /// The most recent `count` lines.
    pub fn recent(&self, count: usize) -> Vec<LogLine> {
        lock(&self.buffer).get_recent(count)
    }
}

/// Marker handle for one incarnation's log file.
#[derive(Clone)]
pub struct LogWriter {
    path: PathBuf,
    file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
}

impl LogWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a timestamped supervisor marker line.
    pub async fn mark(&self, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("{}{}] {}\n", MARKER_PREFIX, stamp, message);

        let mut file = self.file.lock().await;
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to write to {}: {}", self.path.display(), e);
        }
    }

    #[cfg(test)]
    pub(crate) async fn hold(&self) -> tokio::sync::MutexGuard<'_, tokio::fs::File> {
        self.file.lock().await
    }
}

/// Running follower of a log file.
pub struct LogTail {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl LogTail {
    /// Read whatever is left in the file, then stop. Returns `false` when
    /// `limit` elapsed first and the follower was abandoned.
    pub async fn finish(mut self, limit: Duration) -> bool {
        self.stop.cancel();
        match tokio::time::timeout(limit, &mut self.handle).await {
            Ok(_) => true,
            Err(_) => {
                self.handle.abort();
                false
            }
        }
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn tail_file(
    path: PathBuf,
    offset: u64,
    buffer: Arc<Mutex<LogBuffer>>,
    stop: CancellationToken,
) {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("Cannot follow {}: {}", path.display(), e);
            return;
        }
    };
    if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
        tracing::warn!("Cannot seek {} to {}: {}", path.display(), offset, e);
        return;
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        // Checked before reading so the last pass sees everything written before `finish`.
        let last_pass = stop.is_cancelled();
        loop {
            match file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    split_lines(&mut pending, &buffer);
                }
                Err(e) => {
                    tracing::warn!("Stopped following {}: {}", path.display(), e);
                    return;
                }
            }
        }
        if last_pass {
            if !pending.is_empty() {
                lock(&buffer).push_raw(&pending);
            }
            return;
        }
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(TAIL_POLL) => {}
        }
    }
}

/// Move every complete line out of `pending`. Runs of more than
/// [`MAX_LINE_BYTES`] without a newline are cut into separate lines.
fn split_lines(pending: &mut Vec<u8>, buffer: &Mutex<LogBuffer>) {
    let mut buffer = lock(buffer);
    let mut start = 0;
    loop {
        let rest = &pending[start..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(pos) if pos <= MAX_LINE_BYTES => {
                buffer.push_raw(&rest[..pos]);
                start += pos + 1;
            }
            _ if rest.len() >= MAX_LINE_BYTES => {
                buffer.push_raw(&rest[..MAX_LINE_BYTES]);
                start += MAX_LINE_BYTES;
            }
            _ => break,
        }
    }
    pending.drain(..start);
}

fn lock(buffer: &Mutex<LogBuffer>) -> MutexGuard<'_, LogBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
