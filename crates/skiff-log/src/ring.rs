use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::record::LogRecord;

/// Bounded in-memory buffer between the remote layer and the uploader.
/// Back-pressure drops the oldest record and counts the drop; per-component
/// order is preserved because there is a single queue.
pub struct LogRing {
    capacity: usize,
    inner: Mutex<VecDeque<LogRecord>>,
    dropped: AtomicU64,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, record: LogRecord) {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(record);
    }

    /// Take everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<LogRecord> {
        let mut queue = self.inner.lock().unwrap();
        queue.drain(..).collect()
    }

    /// Put records back at the head after a failed upload, oldest first.
    /// Overflow beyond capacity drops the oldest of the requeued batch.
    pub fn requeue_front(&self, records: Vec<LogRecord>) {
        let mut queue = self.inner.lock().unwrap();
        let room = self.capacity.saturating_sub(queue.len());
        let skip = records.len().saturating_sub(room);
        if skip > 0 {
            self.dropped.fetch_add(skip as u64, Ordering::Relaxed);
        }
        for record in records.into_iter().skip(skip).rev() {
            queue.push_front(record);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::record::LogLevel;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(msg: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            component: Component::Agent,
            message: msg.to_string(),
            fields: BTreeMap::new(),
            sampled: false,
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let ring = LogRing::new(2);
        ring.push(record("a"));
        ring.push(record("b"));
        ring.push(record("c"));
        let drained = ring.drain();
        assert_eq!(
            drained.iter().map(|r| r.message.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert_eq!(ring.dropped(), 1);
    }

    #[test]
    fn requeue_preserves_order() {
        let ring = LogRing::new(10);
        ring.push(record("c"));
        ring.requeue_front(vec![record("a"), record("b")]);
        let drained = ring.drain();
        assert_eq!(
            drained.iter().map(|r| r.message.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn requeue_overflow_drops_oldest_of_batch() {
        let ring = LogRing::new(2);
        ring.push(record("x"));
        ring.requeue_front(vec![record("a"), record("b")]);
        let drained = ring.drain();
        assert_eq!(
            drained.iter().map(|r| r.message.as_str()).collect::<Vec<_>>(),
            vec!["b", "x"]
        );
        assert_eq!(ring.dropped(), 1);
    }
}
