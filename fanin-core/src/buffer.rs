use std::collections::VecDeque;

use crate::message::BufferedRecord;

/// FIFO of decoded records waiting to be emitted by one worker.
#[derive(Debug, Default)]
pub struct LocalBuffer {
    records: VecDeque<BufferedRecord>,
}

impl LocalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: BufferedRecord) {
        self.records.push_back(record);
    }

    pub fn pop(&mut self) -> Option<BufferedRecord> {
        self.records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedRecord> {
        self.records.iter()
    }

    /// Drops every record sourced from the endpoint and returns how many were dropped.
    pub fn purge_endpoint(&mut self, endpoint_index: usize) -> usize {
        let before = self.records.len();
        self.records
            .retain(|record| record.correlation.endpoint_index != endpoint_index);
        before - self.records.len()
    }

    /// Drops everything and returns how many records were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.records.len();
        self.records.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CorrelationId, Value};

    fn record(endpoint_index: usize, transaction_id: i64) -> BufferedRecord {
        BufferedRecord::new(
            vec![Value::Int(transaction_id)],
            CorrelationId::new(endpoint_index, transaction_id),
        )
    }

    #[test]
    fn test_fifo() {
        let mut buffer = LocalBuffer::new();
        assert!(buffer.pop().is_none());
        buffer.push(record(0, 1));
        buffer.push(record(1, 2));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.pop(), Some(record(0, 1)));
        assert_eq!(buffer.pop(), Some(record(1, 2)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_purge_endpoint_keeps_order_of_the_rest() {
        let mut buffer = LocalBuffer::new();
        for (endpoint, tx) in [(0, 1), (1, 2), (0, 3), (2, 4), (1, 5)] {
            buffer.push(record(endpoint, tx));
        }
        assert_eq!(buffer.purge_endpoint(1), 2);
        assert_eq!(buffer.purge_endpoint(7), 0);
        let left: Vec<i64> = buffer
            .iter()
            .map(|r| r.correlation.transaction_id)
            .collect();
        assert_eq!(left, vec![1, 3, 4]);
        assert_eq!(buffer.clear(), 3);
        assert!(buffer.is_empty());
    }
}
