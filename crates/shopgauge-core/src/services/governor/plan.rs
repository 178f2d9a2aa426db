//! Plan configuration
//!
//! Holds the active subscription tier and answers rate-limit lookups for it.
//! The plan is persisted best-effort so a restart keeps the operator's choice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::persistence::{PersistSlot, Persistence};
use super::types::{Plan, PlanRateLimits};

/// Default warning percentage used by [`PlanConfig::get_warning_threshold`]
pub const DEFAULT_WARNING_PERCENTAGE: f64 = 80.0;

/// Callback invoked once per actual plan change
pub type PlanChangeCallback = Box<dyn Fn(Plan, PlanRateLimits) + Send + Sync>;

/// Construction options for [`PlanConfig`]
#[derive(Default)]
pub struct PlanConfigOptions {
    /// Plan used when nothing valid is persisted
    pub initial_plan: Option<Plan>,
    /// Storage key for the persisted plan
    pub storage_key: String,
    /// Called with the new plan and its limits after every change
    pub on_plan_change: Option<PlanChangeCallback>,
}

/// Persisted payload
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPlan {
    plan: String,
    updated_at: DateTime<Utc>,
}

/// Active plan and its rate-limit parameters
pub struct PlanConfig {
    plan: RwLock<Plan>,
    slot: PersistSlot,
    on_plan_change: Option<PlanChangeCallback>,
}

impl PlanConfig {
    /// Create an in-memory configuration (nothing is loaded or persisted)
    pub fn new(options: PlanConfigOptions) -> Self {
        let slot = PersistSlot::disabled(options.storage_key);
        Self {
            plan: RwLock::new(options.initial_plan.unwrap_or_default()),
            slot,
            on_plan_change: options.on_plan_change,
        }
    }

    /// Load the persisted plan, falling back to the configured default
    ///
    /// When nothing valid is stored, the fallback plan is persisted so the next
    /// start sees it.
    pub async fn load(
        options: PlanConfigOptions,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Self {
        let slot = PersistSlot::new(persistence, options.storage_key);
        let fallback = options.initial_plan.unwrap_or_default();

        let stored = slot
            .load::<StoredPlan>()
            .await
            .and_then(|stored| match stored.plan.parse::<Plan>() {
                Ok(plan) => Some(plan),
                Err(e) => {
                    log::warn!("[governor:plan] Ignoring persisted plan: {}", e);
                    None
                }
            });

        let config = Self {
            plan: RwLock::new(stored.unwrap_or(fallback)),
            slot,
            on_plan_change: options.on_plan_change,
        };

        match stored {
            Some(plan) => log::info!("[governor:plan] Loaded persisted plan '{}'", plan),
            None => {
                log::info!("[governor:plan] Using default plan '{}'", fallback);
                let pending = config.slot.prepare(&StoredPlan {
                    plan: fallback.to_string(),
                    updated_at: Utc::now(),
                });
                config.slot.commit(pending).await;
            }
        }

        config
    }

    /// Current plan
    pub async fn get_current_plan(&self) -> Plan {
        *self.plan.read().await
    }

    /// Rate limits of the current plan
    pub async fn get_current_rate_limits(&self) -> PlanRateLimits {
        self.get_current_plan().await.rate_limits()
    }

    /// Rate limits of any plan
    pub fn get_rate_limits_for_plan(&self, plan: Plan) -> PlanRateLimits {
        plan.rate_limits()
    }

    /// Switch to `plan`
    ///
    /// Returns `false` without persisting or notifying when `plan` is already
    /// active.
    pub async fn update_plan(&self, plan: Plan) -> bool {
        let pending = {
            let mut current = self.plan.write().await;
            if *current == plan {
                log::debug!("[governor:plan] Plan already '{}', nothing to do", plan);
                return false;
            }
            log::info!("[governor:plan] Switching plan '{}' -> '{}'", *current, plan);
            *current = plan;
            self.slot.prepare(&StoredPlan {
                plan: plan.to_string(),
                updated_at: Utc::now(),
            })
        };

        self.slot.commit(pending).await;

        if let Some(callback) = &self.on_plan_change {
            callback(plan, plan.rate_limits());
        }
        true
    }

    /// Points-per-second budget that corresponds to `percentage` of the plan
    pub async fn get_warning_threshold(&self, percentage: f64) -> u32 {
        let limits = self.get_current_rate_limits().await;
        (limits.points_per_second as f64 * percentage / 100.0).floor() as u32
    }
}

// ============================================================================
// Tests
// ============================================================================
