use std::collections::VecDeque;

use crate::types::Timestamped;

/// Default number of samples kept per non-positional topic
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Bounded FIFO of recent samples for one topic, used for time alignment.
///
/// Pushing onto a full buffer drops the oldest entry. Consumption is one-shot:
/// entries removed by [`HistoryBuffer::advance_until`] never come back.
#[derive(Debug)]
pub struct HistoryBuffer<T> {
    samples: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T: Timestamped> HistoryBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        HistoryBuffer {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append at the tail, evicting the oldest entry when full.
    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
            self.dropped += 1;
        }
        self.samples.push_back(sample);
    }

    /// Pop entries from the head until one is newer than `threshold` and return it.
    ///
    /// Older entries popped on the way are discarded. Returns `None` once the
    /// buffer runs empty without a match.
    pub fn advance_until(&mut self, threshold: f64) -> Option<T> {
        while let Some(sample) = self.samples.pop_front() {
            if sample.timestamp() > threshold {
                return Some(sample);
            }
        }
        None
    }

    /// Most recently pushed sample
    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of entries evicted by overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.samples.iter().map(Timestamped::timestamp).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Stamp(f64);

    impl Timestamped for Stamp {
        fn timestamp(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_advance_discards_stale_and_keeps_newer() {
        let mut buffer = HistoryBuffer::new(DEFAULT_HISTORY_CAPACITY);
        for t in [99.80, 99.94, 100.02] {
            buffer.push(Stamp(t));
        }

        let matched = buffer.advance_until(100.00 - 0.08);

        assert_eq!(matched, Some(Stamp(99.94)));
        assert_eq!(buffer.timestamps(), vec![100.02]);
    }

    #[test]
    fn test_advance_on_exhausted_buffer() {
        let mut buffer = HistoryBuffer::new(4);
        buffer.push(Stamp(1.0));
        buffer.push(Stamp(2.0));

        assert_eq!(buffer.advance_until(5.0), None);
        assert!(buffer.is_empty());
        // consumed entries are gone for later, older fixes too
        assert_eq!(buffer.advance_until(0.0), None);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut buffer = HistoryBuffer::new(4);
        buffer.push(Stamp(10.0));
        buffer.push(Stamp(10.5));
        assert_eq!(buffer.advance_until(10.0), Some(Stamp(10.5)));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut buffer = HistoryBuffer::new(3);
        for t in 0..5 {
            buffer.push(Stamp(t as f64));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.timestamps(), vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.latest(), Some(&Stamp(4.0)));
    }
}
