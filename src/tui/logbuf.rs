//! In-memory log sink for TUI mode.
//!
//! A ring buffer that implements `MakeWriter`, so tracing-subscriber can
//! write here instead of stderr. Writing to stderr would corrupt the
//! ratatui alternate screen; the log pane renders from this buffer
//! instead.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Lines kept; older ones fall off the front.
const CAPACITY: usize = 500;

/// Thread-safe ring buffer of log lines. Cloning shares the buffer,
/// which is what `MakeWriter` needs to mint writers on demand.
#[derive(Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line, dropping the oldest at capacity. A poisoned lock
    /// is recovered rather than propagated: logging must not cascade a
    /// panic.
    pub fn push(&self, line: String) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= CAPACITY {
            guard.pop_front();
        }
        guard.push_back(line);
    }

    /// The most recent `n` lines, oldest first. The buffer keeps its
    /// contents; the log pane samples this every frame.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = guard.len().saturating_sub(n);
        guard.iter().skip(skip).cloned().collect()
    }
}

/// Buffers bytes and pushes complete lines to the shared buffer.
pub struct LineWriter {
    buffer: LogBuffer,
    pending: Vec<u8>,
}

impl LineWriter {
    fn new(buffer: LogBuffer) -> Self {
        Self { buffer, pending: Vec::new() }
    }

    fn flush_complete_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.buffer.push(text);
        }
    }
}

impl Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.flush_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push(text);
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tail_returns_newest_lines_in_order() {
        let buf = LogBuffer::new();
        buf.push("one".to_string());
        buf.push("two".to_string());
        buf.push("three".to_string());

        assert_eq!(buf.tail(2), vec!["two", "three"]);
        // Tail does not consume.
        assert_eq!(buf.tail(10), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let buf = LogBuffer::new();
        for i in 0..(CAPACITY + 100) {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.tail(CAPACITY + 100).len(), CAPACITY);
        assert_eq!(buf.tail(1), vec![format!("line {}", CAPACITY + 99)]);
    }

    #[test]
    fn test_writer_splits_lines() {
        let buf = LogBuffer::new();
        let mut writer = LineWriter::new(buf.clone());
        write!(writer, "hello\nwor").unwrap();
        write!(writer, "ld\n").unwrap();

        assert_eq!(buf.tail(10), vec!["hello", "world"]);
    }

    #[test]
    fn test_writer_flushes_partial_line_on_drop() {
        let buf = LogBuffer::new();
        {
            let mut writer = LineWriter::new(buf.clone());
            write!(writer, "partial").unwrap();
            assert!(buf.tail(10).is_empty());
        }
        assert_eq!(buf.tail(10), vec!["partial"]);
    }
}
