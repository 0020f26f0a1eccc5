//! Correlation id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Allocates correlation ids for outgoing requests.
///
/// Ids must be unique among the exchanges open on one peer.
pub trait IdGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

/// Monotonic base-36 id allocator.
///
/// Ids start at `"1"` and order by `(length, lexicographic)`, so a shorter
/// id was always allocated before a longer one.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn generate(&self) -> String {
        to_base36(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self) -> String {
        SequentialIdGenerator::generate(self)
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_owned();
    }
    let mut buf = Vec::with_capacity(13);
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence() {
        let ids = SequentialIdGenerator::new();
        let first: Vec<_> = (0..3).map(|_| ids.generate()).collect();
        assert_eq!(first, ["1", "2", "3"]);
    }

    #[test]
    fn test_base36_rollover() {
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(u64::MAX), "3w5e11264sgsf");
    }

    #[test]
    fn test_unique_across_threads() {
        let ids = Arc::new(SequentialIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..250).map(|_| ids.generate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
