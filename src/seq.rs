//! Process-wide sequence source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic counter handing out per-event identifiers: validation seqnos,
/// stream indices, and anything else that must stay unique for the process
/// lifetime. Values start at 0 and each one is handed out exactly once;
/// delivery order across consumers is unspecified.
#[derive(Clone, Debug, Default)]
pub struct SeqSource {
    next: Arc<AtomicU64>,
}

impl SeqSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next value.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_starts_at_zero_and_increments() {
        let seq = SeqSource::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn test_values_unique_across_threads() {
        let seq = SeqSource::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seq = seq.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| seq.next()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for v in handle.join().unwrap() {
                assert!(seen.insert(v), "value {v} handed out twice");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
