//! Service orchestration.
//!
//! [`Handler`] wires the keeper and the breaker to the external collaborators
//! (counter store, rate limiter, badge renderer) and exposes the service
//! operations: recording visits, rendering badges and listing icons.
//!
//! Visit flow:
//!
//! ```text
//! record_visit(key)
//!   │ limiter.allow ── denied ──▶ VisitOutcome::Denied   (nothing mutated)
//!   ▼
//! counter.increment ──▶ cache.set ──▶ notify
//!                                       ├─ Direct:   breaker.broadcast
//!                                       └─ Deferred: keeper.submit(notify-viewers)
//! ```

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hit_core::{
    build_icon_catalog, BadgeWriter, CollaboratorError, Count, Counter, CounterKey, FlatBadge,
    IconCatalog, IconEntry, Limiter, MemoryCounter, TtlCache, WindowLimiter,
};
use hit_protocol::DaemonMessage;

use crate::breaker::{spawn_breaker, Breaker, BreakerError, ErrorSink};
use crate::config::{ConfigError, HitConfig};
use crate::keeper::{spawn_keeper, FailureSink, Keeper, KeeperError, LogSink, Task};

/// Content type of rendered badges
pub const BADGE_CONTENT_TYPE: &str = "image/svg+xml";

/// How a recorded visit reaches live viewers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOut {
    /// Broadcast inline on the visit path. Viewers see each key's counts
    /// in increasing order.
    #[default]
    Direct,

    /// Hand the broadcast to the keeper so the visit path never waits on it.
    /// With more than one worker, updates for a key may reach viewers out of
    /// order; each carries the absolute count.
    Deferred,
}

/// External collaborators the handler is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub counter: Arc<dyn Counter>,
    pub limiter: Arc<dyn Limiter>,
    pub badge: Arc<dyn BadgeWriter>,
    /// Receives keeper task failures
    pub failure_sink: Arc<dyn FailureSink>,

    /// Receives dropped viewer connections and rejected broadcasts
    pub error_sink: Arc<dyn ErrorSink>,
}

impl Collaborators {
    /// In-process collaborators sized from `config`.
    pub fn in_memory(config: &HitConfig) -> Self {
        Self {
            counter: Arc::new(MemoryCounter::new()),
            limiter: Arc::new(WindowLimiter::new(config.limiter.quota, config.limiter.window)),
            badge: Arc::new(FlatBadge::new(config.badge_label.clone())),
            failure_sink: Arc::new(LogSink),
            error_sink: Arc::new(LogSink),
        }
    }
}

/// Result of [`Handler::record_visit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// The visit was counted; carries the new count.
    Counted(Count),

    /// The rate limiter refused the visit. Not an error.
    Denied,
}

/// A rendered badge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBadge {
    pub key: CounterKey,
    pub count: Count,

    /// Icon actually drawn (`None` if none was requested or it is unknown)
    pub icon: Option<String>,

    pub body: Vec<u8>,
}

impl RenderedBadge {
    pub fn content_type(&self) -> &'static str {
        BADGE_CONTENT_TYPE
    }

    /// The body as text (badges are SVG).
    pub fn svg(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors from handler construction and operations.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start keeper: {0}")]
    Keeper(#[from] KeeperError),

    #[error("failed to start breaker: {0}")]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

/// The service.
pub struct Handler {
    counter: Arc<dyn Counter>,
    limiter: Arc<dyn Limiter>,
    badge: Arc<dyn BadgeWriter>,
    cache: TtlCache<CounterKey, Count>,
    icons: Arc<IconCatalog>,
    keeper: Keeper,
    breaker: Breaker,
    fan_out: FanOut,
    sweeper_cancel: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl Handler {
    /// Validates `config`, builds the icon catalog and starts the keeper,
    /// the breaker and the cache sweeper.
    ///
    /// On failure anything already started is shut down again.
    pub async fn new(config: &HitConfig, collaborators: Collaborators) -> Result<Self, HandlerError> {
        config.validate()?;

        let icons = Arc::new(build_icon_catalog());

        let keeper = spawn_keeper(config.keeper.clone(), collaborators.failure_sink)?;

        let breaker = match spawn_breaker(config.breaker.clone(), collaborators.error_sink) {
            Ok(breaker) => breaker,
            Err(e) => {
                keeper.shutdown().await;
                return Err(e.into());
            }
        };

        let cache = TtlCache::new(config.cache.ttl);
        let sweeper_cancel = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(config.cache.sweep_interval, sweeper_cancel.clone());

        info!(
            icons = icons.len(),
            fan_out = ?config.fan_out,
            "Handler ready"
        );

        Ok(Self {
            counter: collaborators.counter,
            limiter: collaborators.limiter,
            badge: collaborators.badge,
            cache,
            icons,
            keeper,
            breaker,
            fan_out: config.fan_out,
            sweeper_cancel,
            sweeper: StdMutex::new(Some(sweeper)),
        })
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }

    pub fn keeper(&self) -> &Keeper {
        &self.keeper
    }

    pub fn catalog(&self) -> &IconCatalog {
        &self.icons
    }

    /// Icon listing, sorted by name.
    pub fn icons(&self) -> &[IconEntry] {
        self.icons.list()
    }

    /// Counts a visit to `key`, admitting by key alone.
    pub async fn record_visit(&self, key: &CounterKey) -> Result<VisitOutcome, HandlerError> {
        self.count_visit(key, key.as_str()).await
    }

    /// Counts a visit to `key` from `visitor`, admitting per visitor and key.
    pub async fn record_visit_from(
        &self,
        key: &CounterKey,
        visitor: &str,
    ) -> Result<VisitOutcome, HandlerError> {
        let admission = key.scoped_to(visitor);
        self.count_visit(key, &admission).await
    }

    async fn count_visit(&self, key: &CounterKey, admission: &str) -> Result<VisitOutcome, HandlerError> {
        if !self.limiter.allow(admission).await? {
            debug!(key = %key, admission = %admission, "Visit denied by limiter");
            return Ok(VisitOutcome::Denied);
        }

        let count = self.counter.increment(key).await?;
        self.cache.set_max(key.clone(), count);

        // Only after the increment: viewers never see a count ahead of the store
        self.notify(key.clone(), count);

        debug!(key = %key, count = %count, "Visit counted");
        Ok(VisitOutcome::Counted(count))
    }

    /// Pushes a count update to viewers. Failures are logged, never returned.
    fn notify(&self, key: CounterKey, count: Count) {
        let line = match DaemonMessage::count_updated(key.clone(), count).to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to serialize count update");
                return;
            }
        };

        match self.fan_out {
            FanOut::Direct => {
                if let Err(e) = self.breaker.broadcast(line) {
                    warn!(key = %key, error = %e, "Count update not broadcast");
                }
            }
            FanOut::Deferred => {
                let breaker = self.breaker.clone();
                let task = Task::new("notify-viewers", async move {
                    match breaker.broadcast(line) {
                        // Already reported to the breaker's error sink
                        Err(BreakerError::PoolExhausted { .. }) => Ok(()),
                        result => result,
                    }
                });

                if let Err(e) = self.keeper.submit(task) {
                    warn!(key = %key, error = %e, "Count update not queued");
                }
            }
        }
    }

    /// Renders the badge for `key`.
    ///
    /// Reads the count through the local cache. An unknown `icon` renders a
    /// badge without an icon.
    pub async fn render_badge(
        &self,
        key: &CounterKey,
        icon: Option<&str>,
    ) -> Result<RenderedBadge, HandlerError> {
        let count = match self.cache.get(key) {
            Some(count) => count,
            None => {
                let count = self.counter.get(key).await?;
                self.cache.set_max(key.clone(), count);
                count
            }
        };

        let icon = icon.and_then(|name| {
            let found = self.icons.get(name);
            if found.is_none() {
                debug!(icon = %name, "Unknown icon, rendering without one");
            }
            found
        });

        let body = self.badge.render(icon, count)?;

        Ok(RenderedBadge {
            key: key.clone(),
            count,
            icon: icon.map(|i| i.name.clone()),
            body,
        })
    }

    /// Stops the sweeper, drains the keeper, then closes the breaker.
    pub async fn shutdown(&self) {
        self.sweeper_cancel.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache sweeper ended abnormally");
            }
        }

        // Keeper first so queued notifications can still broadcast
        self.keeper.shutdown().await;
        self.breaker.shutdown().await;

        info!("Handler stopped");
    }
}
