//! Concrete bus backends behind Cargo features: `embedded` (SQLite),
//! `relational` (Postgres), `streams` (Redis Streams), and
//! `partitioned-log` (Kafka).
//!
//! `in_memory` has no feature gate — it is always available, the
//! unconditional default backend.

pub mod in_memory;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "relational")]
pub mod relational;

#[cfg(feature = "streams")]
pub mod streams;

#[cfg(feature = "partitioned-log")]
pub mod partitioned_log;

pub use in_memory::InMemoryBus;

/// Raised by the tier factory, not by adapters themselves, when a requested
/// tier's Cargo feature wasn't compiled into the running binary.
#[derive(Debug, thiserror::Error)]
#[error("backend unavailable: {tier} requires building with `--features {feature}` ({hint})")]
pub struct BackendUnavailable {
    pub tier: String,
    pub feature: String,
    pub hint: String,
}
