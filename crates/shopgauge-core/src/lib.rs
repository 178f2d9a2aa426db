//! # shopgauge-core
//!
//! Shopify GraphQL Admin API usage governor - shared by the CLI and any
//! embedding application.
//!
//! This crate provides:
//! - Database operations (`db` module)
//! - The rate-limit governor and its components (`services::governor`)
//! - Unified error handling (`error` module)

pub mod db;
pub mod error;
pub mod services;

// Re-exports for convenience
pub use db::Database;
pub use error::{Error, Result};

pub use services::governor::{
    AlertMode, ApiGovernor, CostExtensions, FilePersistence, GovernorConfig, GovernorError,
    GraphQlResponse, HttpTransport, JsonStateStore, MemoryPersistence, Notification,
    NotificationKind, NotificationSystem, NotificationTopic, Persistence, Plan, PlanConfig,
    PlanRateLimits, RequestLabel, RequestOptions, SqlitePersistence, StatePatch, StateStore,
    ThrottleStatus, Transport, TransportError, UsageAnalytics, UsageAnalyticsSummary,
    UsageRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
