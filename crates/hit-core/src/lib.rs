//! Hit Core - Shared types for the hit counter
//!
//! This crate provides the domain types and collaborator interfaces shared
//! between the daemon (hitd) and its protocol crate:
//! - counter keys and counts
//! - the icon catalog
//! - the counter store, rate limiter and badge renderer traits, each with an
//!   in-process implementation
//! - the local TTL cache
//!
//! Production code does not panic: no `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()` or `todo!()`. Poisoned locks are recovered.

pub mod badge;
pub mod cache;
pub mod counter;
pub mod error;
pub mod icon;
pub mod key;
pub mod limiter;

// Re-exports for convenience
pub use badge::{BadgeWriter, FlatBadge};
pub use cache::TtlCache;
pub use counter::{Counter, MemoryCounter};
pub use error::{CollaboratorError, DomainError, DomainResult};
pub use icon::{build_icon_catalog, Icon, IconCatalog, IconEntry, ICON_URL_PREFIX};
pub use key::{Count, CounterKey, MAX_KEY_LEN};
pub use limiter::{Limiter, Unlimited, WindowLimiter};
