//! Rate limiter interface.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::CollaboratorError;

/// Admission decision per key.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Returns `true` if an event for `key` is admitted.
    async fn allow(&self, key: &str) -> Result<bool, CollaboratorError>;
}

/// Number of tracked keys above which expired windows are pruned.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window limiter: at most `quota` admissions per key per `window`.
#[derive(Debug)]
pub struct WindowLimiter {
    quota: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl WindowLimiter {
    pub fn new(quota: u32, window: Duration) -> Self {
        Self {
            quota,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn check(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            used: 0,
        });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.used = 0;
        }

        if entry.used >= self.quota {
            return false;
        }

        entry.used += 1;
        true
    }
}

#[async_trait]
impl Limiter for WindowLimiter {
    async fn allow(&self, key: &str) -> Result<bool, CollaboratorError> {
        Ok(self.check(key, Instant::now()))
    }
}

/// Limiter that admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl Limiter for Unlimited {
    async fn allow(&self, _key: &str) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}
