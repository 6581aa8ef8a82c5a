//! Hit Daemon - Task keeper, broadcast breaker and socket server
//!
//! This crate provides the concurrency core of the hit counter:
//! - `keeper` - Bounded task queue with a fixed worker pool and failure sink
//! - `breaker` - Bounded fan-out of live updates to viewer connections
//! - `handler` - Orchestration of counter, limiter, cache, keeper and breaker
//! - `server` - Unix socket server speaking the hit protocol
//! - `config` - Daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         hitd daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   HitServer     │────▶│          Handler            │    │
//! │  │ (Unix Socket)   │     │ limiter → counter → cache   │    │
//! │  └────────┬────────┘     └──────┬──────────────┬───────┘    │
//! │           │                     │ submit       │ broadcast  │
//! │           │ connections         ▼              ▼            │
//! │           ▼              ┌────────────┐  ┌────────────┐     │
//! │  ┌─────────────────┐     │   Keeper   │─▶│  Breaker   │     │
//! │  │ConnectionHandler│◀────│  workers   │  │ dispatcher │     │
//! │  │  (per client)   │     └────────────┘  └─────┬──────┘     │
//! │  └─────────────────┘◀──────────────────────────┘            │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod breaker;
pub mod config;
pub mod handler;
pub mod keeper;
pub mod server;

pub use config::HitConfig;
pub use handler::{Collaborators, FanOut, Handler, HandlerError, RenderedBadge, VisitOutcome};
