//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod notifications;
pub mod plan;
pub mod query;
pub mod usage;

use std::sync::Arc;

use crate::output::OutputFormat;
use shopgauge_core::services::governor::{
    AnalyticsOptions, ApiGovernor, GovernorConfig, NotificationOptions, NotificationSystem,
    Persistence, PlanConfig, PlanConfigOptions, SqlitePersistence, Transport, UsageAnalytics,
};
use shopgauge_core::Database;

/// Shared context for all commands
pub struct Context {
    pub db: Database,
    pub config: GovernorConfig,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Context {
    fn persistence(&self) -> Arc<dyn Persistence> {
        Arc::new(SqlitePersistence::new(self.db.clone()))
    }

    fn persistence_if(&self, enabled: bool) -> Option<Arc<dyn Persistence>> {
        enabled.then(|| self.persistence())
    }

    /// Plan configuration backed by the CLI database
    pub async fn plan_config(&self) -> PlanConfig {
        PlanConfig::load(
            PlanConfigOptions {
                initial_plan: self.config.initial_plan,
                storage_key: self.config.plan_key(),
                on_plan_change: None,
            },
            self.persistence_if(self.config.persist_config),
        )
        .await
    }

    /// Usage ledger backed by the CLI database
    pub async fn analytics(&self) -> UsageAnalytics {
        UsageAnalytics::load(
            AnalyticsOptions {
                max_history_length: self.config.max_history_length,
                storage_key: self.config.analytics_key(),
            },
            self.persistence_if(self.config.persist_data),
        )
        .await
    }

    /// Notification store backed by the CLI database
    pub async fn notifications(&self) -> NotificationSystem {
        NotificationSystem::load(
            NotificationOptions {
                max_notifications: self.config.max_notifications,
                storage_key: self.config.notifications_key(),
                on_new_notification: None,
            },
            self.persistence_if(self.config.persist_data),
        )
        .await
    }

    /// Full governor around `transport`
    pub async fn governor(&self, transport: Arc<dyn Transport>) -> ApiGovernor {
        log::debug!(
            "[cli] Building governor (storage key '{}', admission {})",
            self.config.storage_key,
            self.config.admission.mode
        );
        ApiGovernor::builder(transport)
            .config(self.config.clone())
            .persistence(self.persistence())
            .build()
            .await
    }
}

/// Format an optional string for table cells
pub fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}
