//! Batch buffer for sink writers
//!
//! Holds serialized rows in arrival order plus row and byte counters. The
//! buffer only reports that a threshold was crossed; deciding to flush and
//! doing the I/O is the writer's job.

use crate::config::BatchSettings;
use bytes::Bytes;
use std::time::Instant;

/// Rows handed to an external system in one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub rows: Vec<Bytes>,
    pub total_bytes: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows joined by `delimiter`, as most bulk-load endpoints expect
    pub fn join(&self, delimiter: &[u8]) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.total_bytes + delimiter.len() * self.rows.len().saturating_sub(1));
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(delimiter);
            }
            out.extend_from_slice(row);
        }
        out
    }
}

/// Accumulates serialized rows until a threshold is crossed
#[derive(Debug)]
pub struct BatchBuffer {
    max_rows: usize,
    max_bytes: usize,
    rows: Vec<Bytes>,
    bytes: usize,
    first_row_at: Option<Instant>,
}

impl BatchBuffer {
    pub fn new(settings: &BatchSettings) -> Self {
        Self {
            max_rows: settings.max_rows.max(1),
            max_bytes: settings.max_bytes.max(1),
            rows: Vec::new(),
            bytes: 0,
            first_row_at: None,
        }
    }

    /// Append a row; returns `true` when a flush threshold is now reached
    pub fn push(&mut self, row: impl Into<Bytes>) -> bool {
        let row = row.into();
        if self.rows.is_empty() {
            self.first_row_at = Some(Instant::now());
        }
        self.bytes += row.len();
        self.rows.push(row);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.max_rows || self.bytes >= self.max_bytes
    }

    /// Current contents without resetting; row payloads are shared, not copied
    pub fn snapshot(&self) -> Batch {
        Batch {
            rows: self.rows.clone(),
            total_bytes: self.bytes,
        }
    }

    /// Take the contents and reset the counters
    pub fn take(&mut self) -> Batch {
        self.first_row_at = None;
        Batch {
            rows: std::mem::take(&mut self.rows),
            total_bytes: std::mem::replace(&mut self.bytes, 0),
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.bytes = 0;
        self.first_row_at = None;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// When the oldest buffered row arrived
    pub fn oldest(&self) -> Option<Instant> {
        self.first_row_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_rows: usize, max_bytes: usize) -> BatchSettings {
        BatchSettings {
            max_rows,
            max_bytes,
            interval_ms: 0,
        }
    }

    #[test]
    fn test_row_threshold() {
        let mut buf = BatchBuffer::new(&settings(3, 1024));
        assert!(!buf.push(&b"a"[..]));
        assert!(!buf.push(&b"b"[..]));
        assert!(buf.push(&b"c"[..]));
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.bytes(), 3);
    }

    #[test]
    fn test_byte_threshold() {
        let mut buf = BatchBuffer::new(&settings(100, 10));
        assert!(!buf.push(vec![0u8; 6]));
        assert!(buf.push(vec![0u8; 6]));
    }

    #[test]
    fn test_take_resets_counters() {
        let mut buf = BatchBuffer::new(&settings(10, 1024));
        buf.push(&b"hello"[..]);
        buf.push(&b"world"[..]);
        assert!(buf.oldest().is_some());

        let batch = buf.take();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.total_bytes, 10);
        assert_eq!(batch.join(b"\n"), b"hello\nworld".to_vec());
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), 0);
        assert!(buf.oldest().is_none());
    }

    #[test]
    fn test_snapshot_keeps_contents() {
        let mut buf = BatchBuffer::new(&settings(10, 1024));
        buf.push(&b"x"[..]);
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(buf.len(), 1);
    }
}
