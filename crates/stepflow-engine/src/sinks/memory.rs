use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use stepflow_core::error::Result;
use stepflow_core::traits::EventSink;
use stepflow_core::types::RunEvent;

/// Bounded in-memory event buffer for UIs; the oldest events fall off.
pub struct MemorySink {
    capacity: usize,
    events: Mutex<VecDeque<RunEvent>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, event: RunEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// The last `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<RunEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    /// Everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn handle(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        self.push(event);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepflow_core::types::{EventKind, RunId};

    fn event(seq: u64) -> RunEvent {
        RunEvent {
            run_id: RunId::from_str("r"),
            seq,
            timestamp: Utc::now(),
            node_id: None,
            kind: EventKind::Info,
            message: String::new(),
            context_snapshot: None,
            status: None,
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let sink = MemorySink::new(3);
        for seq in 0..5 {
            sink.push(event(seq));
        }
        let seqs: Vec<u64> = sink.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_recent_and_clear() {
        let sink = MemorySink::new(10);
        for seq in 0..4 {
            sink.push(event(seq));
        }
        let seqs: Vec<u64> = sink.recent(2).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(sink.recent(100).len(), 4);

        sink.clear();
        assert!(sink.is_empty());
    }
}
