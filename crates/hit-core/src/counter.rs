//! Counter store interface.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::key::{Count, CounterKey};

/// Persistent named counters.
///
/// Implementations must make `increment` atomic and monotonic per key.
/// `get` returns the current value without side effects; unknown keys read
/// as zero.
#[async_trait]
pub trait Counter: Send + Sync {
    async fn increment(&self, key: &CounterKey) -> Result<Count, CollaboratorError>;

    async fn get(&self, key: &CounterKey) -> Result<Count, CollaboratorError>;
}

/// In-process counter store.
///
/// Nothing survives a restart; suitable for tests and single-node setups.
#[derive(Debug, Default)]
pub struct MemoryCounter {
    counts: Mutex<HashMap<CounterKey, Count>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys seen so far.
    pub fn key_count(&self) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Counter for MemoryCounter {
    async fn increment(&self, key: &CounterKey) -> Result<Count, CollaboratorError> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key.clone()).or_default();
        *count = count.next();
        Ok(*count)
    }

    async fn get(&self, key: &CounterKey) -> Result<Count, CollaboratorError> {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(counts.get(key).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CounterKey {
        CounterKey::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_increment_is_monotonic() {
        let counter = MemoryCounter::new();
        let k = key("example.com");

        assert_eq!(counter.increment(&k).await.unwrap(), Count::new(1));
        assert_eq!(counter.increment(&k).await.unwrap(), Count::new(2));
        assert_eq!(counter.get(&k).await.unwrap(), Count::new(2));
    }

    #[tokio::test]
    async fn test_unknown_key_reads_zero() {
        let counter = MemoryCounter::new();
        assert_eq!(counter.get(&key("missing")).await.unwrap(), Count::zero());
        assert_eq!(counter.key_count(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let counter = MemoryCounter::new();
        counter.increment(&key("a")).await.unwrap();
        counter.increment(&key("a")).await.unwrap();
        counter.increment(&key("b")).await.unwrap();

        assert_eq!(counter.get(&key("a")).await.unwrap(), Count::new(2));
        assert_eq!(counter.get(&key("b")).await.unwrap(), Count::new(1));
        assert_eq!(counter.key_count(), 2);
    }
}
