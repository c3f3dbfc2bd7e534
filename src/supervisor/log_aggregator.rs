// src/supervisor/log_aggregator.rs
//! Per-process log capture
//!
//! Captures worker stdout/stderr into bounded ring buffers, one per
//! process, queryable by process id, level, and line limit. Buffers are
//! evicted when their process is stopped or parked in a terminal state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

/// Default ring buffer capacity in lines
pub const DEFAULT_CAPACITY: usize = 1000;

/// Severity attached to a captured line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level from a query-string value
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One captured line
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A queried line joined with its owning process
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub process_id: String,
    #[serde(flatten)]
    pub line: LogLine,
}

/// Bounded ring buffer of lines for a single process
#[derive(Debug)]
struct LogBuffer {
    next_seq: u64,
    capacity: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            capacity,
            lines: VecDeque::new(),
        }
    }

    fn push(&mut self, level: LogLevel, message: String) {
        let line = LogLine {
            seq: self.next_seq,
            timestamp: Utc::now(),
            level,
            message,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    fn tail(&self, level: Option<LogLevel>, limit: usize) -> Vec<LogLine> {
        let mut newest_first: Vec<LogLine> = self
            .lines
            .iter()
            .rev()
            .filter(|line| level.map_or(true, |wanted| line.level == wanted))
            .take(limit)
            .cloned()
            .collect();
        newest_first.reverse();
        newest_first
    }
}

/// Infer a level from a line's prefix, falling back to `default`
fn classify(line: &str, default: LogLevel) -> LogLevel {
    let trimmed = line.trim_start();
    let upper: String = trimmed.chars().take(8).collect::<String>().to_ascii_uppercase();
    if upper.starts_with("ERROR") {
        LogLevel::Error
    } else if upper.starts_with("WARN") {
        LogLevel::Warn
    } else if upper.starts_with("INFO") {
        LogLevel::Info
    } else {
        default
    }
}

/// Captures and indexes output streams for the whole fleet
pub struct LogAggregator {
    capacity: usize,
    buffers: Mutex<HashMap<String, Arc<Mutex<LogBuffer>>>>,
}

impl LogAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    async fn buffer_for(&self, process_id: &str) -> Arc<Mutex<LogBuffer>> {
        let mut buffers = self.buffers.lock().await;
        buffers
            .entry(process_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LogBuffer::new(self.capacity))))
            .clone()
    }

    /// Attach a process's output streams; reader tasks run until EOF
    pub async fn attach<O, E>(&self, process_id: &str, stdout: Option<O>, stderr: Option<E>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = self.buffer_for(process_id).await;

        if let Some(stream) = stdout {
            spawn_reader(Arc::clone(&buffer), stream, LogLevel::Info);
        }
        if let Some(stream) = stderr {
            spawn_reader(buffer, stream, LogLevel::Error);
        }
        debug!("Attached log capture for {}", process_id);
    }

    /// Append a supervisor-generated event line (restarts, failures)
    pub async fn append(&self, process_id: &str, level: LogLevel, message: impl Into<String>) {
        let buffer = self.buffer_for(process_id).await;
        buffer.lock().await.push(level, message.into());
    }

    /// Query captured lines, newest-last
    pub async fn query(
        &self,
        process_id: Option<&str>,
        level: Option<LogLevel>,
        limit: usize,
    ) -> Vec<LogEntry> {
        let buffers = self.buffers.lock().await;
        let mut out = Vec::new();

        for (id, buffer) in buffers.iter() {
            if process_id.map_or(false, |wanted| wanted != id) {
                continue;
            }
            let buffer = buffer.lock().await;
            for line in buffer.tail(level, limit) {
                out.push(LogEntry {
                    process_id: id.clone(),
                    line,
                });
            }
        }

        out.sort_by_key(|entry| entry.line.timestamp);
        out
    }

    /// Drop the buffer for a stopped/failed process
    pub async fn evict(&self, process_id: &str) {
        self.buffers.lock().await.remove(process_id);
    }

    /// Drop every buffer
    pub async fn clear(&self) {
        self.buffers.lock().await.clear();
    }
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn spawn_reader<R>(buffer: Arc<Mutex<LogBuffer>>, stream: R, default_level: LogLevel)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let level = classify(&line, default_level);
            buffer.lock().await.push(level, line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_levels() {
        assert_eq!(classify("ERROR boom", LogLevel::Info), LogLevel::Error);
        assert_eq!(classify("warn: odd", LogLevel::Info), LogLevel::Warn);
        assert_eq!(classify("plain line", LogLevel::Info), LogLevel::Info);
        assert_eq!(classify("plain line", LogLevel::Error), LogLevel::Error);
        assert_eq!(classify("INFO fine", LogLevel::Error), LogLevel::Info);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..10 {
            buffer.push(LogLevel::Info, format!("line {}", i));
        }
        let tail = buffer.tail(None, 10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "line 7");
        assert_eq!(tail[2].message, "line 9");
        // Sequence numbers keep counting across eviction.
        assert_eq!(tail[2].seq, 10);
    }

    #[test]
    fn test_level_filter_and_limit() {
        let mut buffer = LogBuffer::new(16);
        buffer.push(LogLevel::Info, "a".into());
        buffer.push(LogLevel::Error, "b".into());
        buffer.push(LogLevel::Error, "c".into());

        let errors = buffer.tail(Some(LogLevel::Error), 10);
        assert_eq!(errors.len(), 2);
        // Filtered output stays oldest-first.
        assert_eq!(errors[0].message, "b");
        assert_eq!(errors[1].message, "c");

        let limited = buffer.tail(None, 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].message, "c");
    }

    #[tokio::test]
    async fn test_attach_captures_streams() {
        let aggregator = LogAggregator::new(16);
        let stdout: &[u8] = b"hello\nWARN wobbly\n";
        let stderr: &[u8] = b"ERROR broken\n";

        aggregator.attach("p1", Some(stdout), Some(stderr)).await;

        // Reader tasks drain the in-memory streams almost immediately.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let all = aggregator.query(Some("p1"), None, 10).await;
        assert_eq!(all.len(), 3);

        let errors = aggregator.query(Some("p1"), Some(LogLevel::Error), 10).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line.message, "ERROR broken");
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let aggregator = LogAggregator::new(16);
        aggregator.append("p1", LogLevel::Info, "one").await;
        aggregator.append("p2", LogLevel::Info, "two").await;

        aggregator.evict("p1").await;
        assert!(aggregator.query(Some("p1"), None, 10).await.is_empty());
        assert_eq!(aggregator.query(None, None, 10).await.len(), 1);

        aggregator.clear().await;
        assert!(aggregator.query(None, None, 10).await.is_empty());
    }
}
