//! Services module

pub mod governor;

pub use governor::{
    ApiGovernor, GovernorConfig, GovernorError, HttpTransport, MutationManager,
    NotificationSystem, PlanConfig, RequestOptions, UsageAnalytics,
};
