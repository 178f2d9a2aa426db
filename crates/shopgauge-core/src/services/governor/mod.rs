//! API usage governor
//!
//! Client-side bookkeeping for the Shopify GraphQL Admin API leaky bucket:
//! every response reports its cost and the bucket state, and the governor
//! keeps plan limits, usage analytics, notifications and optimistic
//! mutations consistent with it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ ApiGovernor                                              │
//! │   - request()   admit -> send -> resolve                 │
//! │   - mutate()    register -> request -> complete / fail   │
//! │   - update_plan()                                        │
//! └──────────────────────────────────────────────────────────┘
//!       │              │               │               │
//!       ▼              ▼               ▼               ▼
//! ┌───────────┐ ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │PlanConfig │ │UsageAnalyt. │ │Notification │ │MutationMgr  │
//! │ (plan)    │ │ (ledger)    │ │System (list)│ │ (pending)   │
//! └───────────┘ └─────────────┘ └─────────────┘ └─────────────┘
//!       │              │               │               │
//!       └──────────────┼───────────────┘               ▼
//!                      ▼                        trait StateStore
//!              trait Persistence
//!       (memory / file / SQLite adapters)
//!
//!          trait Transport (HttpTransport)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use shopgauge_core::services::governor::{ApiGovernor, HttpTransport, RequestOptions};
//!
//! let transport = Arc::new(HttpTransport::new("my-store.myshopify.com", token));
//! let governor = ApiGovernor::builder(transport).build().await;
//!
//! let response = governor
//!     .request("{ shop { name } }", None, RequestOptions::new().with_endpoint("shop"))
//!     .await?;
//! println!("{:.1}% used", governor.get_summary().await.usage_percentage);
//! ```

pub mod alert;
pub mod analytics;
pub mod client;
pub mod config;
pub mod mutations;
pub mod notifications;
pub mod persistence;
pub mod plan;
pub mod state_store;
pub mod transport;
pub mod types;

// Re-export main types
pub use types::{
    AlertLevel, CostExtensions, EndpointUsage, Notification, NotificationKind, NotificationTopic,
    Plan, PlanRateLimits, RequestLabel, ThrottleStatus, UsageAnalyticsSummary, UsageBucket,
    UsageRecord,
};

pub use alert::{AlertMode, AlertState};
pub use analytics::{aggregate_by_window, AnalyticsOptions, UsageAnalytics};
pub use client::{
    AdmissionPolicy, ApiGovernor, GovernorBuilder, GovernorError, GovernorSettings,
    RequestOptions,
};
pub use config::{AdmissionConfig, AdmissionMode, GovernorConfig};
pub use mutations::{MutationManager, MutationOperation, SweeperHandle};
pub use notifications::{
    NotificationCallback, NotificationOptions, NotificationSystem, SubscriptionId, TopicFilter,
};
pub use persistence::{
    FilePersistence, MemoryPersistence, Persistence, PersistenceError, SqlitePersistence,
};
pub use plan::{PlanChangeCallback, PlanConfig, PlanConfigOptions, DEFAULT_WARNING_PERCENTAGE};
pub use state_store::{JsonStateStore, StateError, StatePatch, StateStore};
pub use transport::{
    GraphQlError, GraphQlResponse, HttpTransport, ResponseExtensions, Transport, TransportError,
    DEFAULT_API_VERSION,
};
