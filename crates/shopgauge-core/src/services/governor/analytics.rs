//! Usage analytics
//!
//! Append-only, capped ledger of request attempts. The ledger is ordered
//! newest-first by resolution time; summaries and windowed aggregates are
//! derived on demand.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::persistence::{PersistSlot, Persistence};
use super::types::{
    CostExtensions, EndpointUsage, RequestLabel, ThrottleStatus, UsageAnalyticsSummary,
    UsageBucket, UsageRecord,
};

/// Default ledger capacity
pub const DEFAULT_MAX_HISTORY_LENGTH: usize = 1000;

/// Number of records returned in a summary
pub const SUMMARY_RECENT_RECORDS: usize = 50;

/// Hourly aggregation window
pub const HOUR_WINDOW_MS: i64 = 3_600_000;

/// Daily aggregation window
pub const DAY_WINDOW_MS: i64 = 86_400_000;

/// Construction options for [`UsageAnalytics`]
#[derive(Debug, Clone)]
pub struct AnalyticsOptions {
    pub max_history_length: usize,
    pub storage_key: String,
}

impl Default for AnalyticsOptions {
    fn default() -> Self {
        Self {
            max_history_length: DEFAULT_MAX_HISTORY_LENGTH,
            storage_key: "shopgauge.analytics".to_string(),
        }
    }
}

/// Ledger state (also the persisted payload)
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerState {
    records: VecDeque<UsageRecord>,
    current_status: Option<ThrottleStatus>,
}

/// Usage ledger and its derived views
pub struct UsageAnalytics {
    state: RwLock<LedgerState>,
    max_history_length: usize,
    slot: PersistSlot,
}

impl UsageAnalytics {
    /// Create an in-memory ledger
    pub fn new(options: AnalyticsOptions) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            max_history_length: options.max_history_length.max(1),
            slot: PersistSlot::disabled(options.storage_key),
        }
    }

    /// Create a ledger restored from `persistence`
    ///
    /// A missing or unreadable payload starts an empty ledger.
    pub async fn load(
        options: AnalyticsOptions,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Self {
        let max_history_length = options.max_history_length.max(1);
        let slot = PersistSlot::new(persistence, options.storage_key);

        let mut state = slot.load::<LedgerState>().await.unwrap_or_default();
        state.records.truncate(max_history_length);
        if slot.is_enabled() {
            log::info!(
                "[governor:analytics] Restored {} usage records",
                state.records.len()
            );
        }

        Self {
            state: RwLock::new(state),
            max_history_length,
            slot,
        }
    }

    /// Record a request that reported cost extensions
    ///
    /// This is the only operation that moves `current_status`.
    pub async fn record_api_usage(
        &self,
        cost: &CostExtensions,
        label: &RequestLabel,
        success: bool,
        throttled: bool,
    ) -> UsageRecord {
        self.record_api_usage_at(cost, label, success, throttled, Utc::now())
            .await
    }

    /// [`record_api_usage`](Self::record_api_usage) with an explicit timestamp
    pub async fn record_api_usage_at(
        &self,
        cost: &CostExtensions,
        label: &RequestLabel,
        success: bool,
        throttled: bool,
        timestamp: DateTime<Utc>,
    ) -> UsageRecord {
        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            requested_cost: cost.requested_query_cost,
            actual_cost: cost.actual_cost(),
            throttle_status: cost.throttle_status,
            endpoint: label.endpoint.clone(),
            operation: label.operation.clone(),
            success,
            throttled,
        };

        log::debug!(
            "[governor:analytics] Recorded cost {}/{} ({} of {} available)",
            record.actual_cost,
            record.requested_cost,
            record.throttle_status.currently_available,
            record.throttle_status.maximum_available
        );

        self.append(record.clone(), true).await;
        record
    }

    /// Record an attempt rejected before any cost was observed
    ///
    /// Uses `last_known_status` when available, a zeroed placeholder otherwise.
    /// `current_status` is left untouched.
    pub async fn record_throttled_request(
        &self,
        last_known_status: Option<ThrottleStatus>,
        label: &RequestLabel,
    ) -> UsageRecord {
        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            requested_cost: 0.0,
            actual_cost: 0.0,
            throttle_status: last_known_status.unwrap_or_else(ThrottleStatus::placeholder),
            endpoint: label.endpoint.clone(),
            operation: label.operation.clone(),
            success: false,
            throttled: true,
        };

        log::debug!("[governor:analytics] Recorded throttled request {:?}", label.operation);
        self.append(record.clone(), false).await;
        record
    }

    /// Record a transport failure for audit purposes
    ///
    /// Zero cost, `success=false`, `throttled=false`; `current_status` is left
    /// untouched.
    pub async fn record_failed_request(&self, label: &RequestLabel) -> UsageRecord {
        let last_status = self.state.read().await.current_status;
        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            requested_cost: 0.0,
            actual_cost: 0.0,
            throttle_status: last_status.unwrap_or_else(ThrottleStatus::placeholder),
            endpoint: label.endpoint.clone(),
            operation: label.operation.clone(),
            success: false,
            throttled: false,
        };

        self.append(record.clone(), false).await;
        record
    }

    /// Prepend, trim, and persist as one unit
    async fn append(&self, record: UsageRecord, update_status: bool) {
        let pending = {
            let mut state = self.state.write().await;
            if update_status {
                state.current_status = Some(record.throttle_status);
            }
            state.records.push_front(record);
            state.records.truncate(self.max_history_length);
            self.slot.prepare(&*state)
        };
        self.slot.commit(pending).await;
    }

    /// Bucket state of the most recently resolved request with cost data
    pub async fn get_current_status(&self) -> Option<ThrottleStatus> {
        self.state.read().await.current_status
    }

    /// Usage percentage of the current status, 0 without one
    pub async fn usage_percentage(&self) -> f64 {
        self.get_current_status()
            .await
            .map(|status| status.usage_percentage())
            .unwrap_or(0.0)
    }

    /// All records, newest first
    pub async fn get_records(&self) -> Vec<UsageRecord> {
        self.state.read().await.records.iter().cloned().collect()
    }

    /// Records at or after `since`, in ledger (resolution) order
    pub async fn get_records_since(&self, since: DateTime<Utc>) -> Vec<UsageRecord> {
        self.state
            .read()
            .await
            .records
            .iter()
            .filter(|record| record.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Number of records in the ledger
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ledger capacity
    pub fn max_history_length(&self) -> usize {
        self.max_history_length
    }

    /// Derive the full summary from one consistent view of the ledger
    pub async fn get_summary(&self) -> UsageAnalyticsSummary {
        let state = self.state.read().await;
        let records: Vec<&UsageRecord> = state.records.iter().collect();

        let usage_percentage = state
            .current_status
            .map(|status| status.usage_percentage())
            .unwrap_or(0.0);

        let throttled_requests = records.iter().filter(|r| r.throttled).count();

        let successful: Vec<&&UsageRecord> = records.iter().filter(|r| r.success).collect();
        let average_query_cost = if successful.is_empty() {
            0.0
        } else {
            successful.iter().map(|r| r.actual_cost).sum::<f64>() / successful.len() as f64
        };

        UsageAnalyticsSummary {
            current_status: state.current_status,
            usage_percentage,
            recent_records: records
                .iter()
                .take(SUMMARY_RECENT_RECORDS)
                .map(|r| (*r).clone())
                .collect(),
            hourly_usage: aggregate_by_window(records.iter().copied(), HOUR_WINDOW_MS),
            daily_usage: aggregate_by_window(records.iter().copied(), DAY_WINDOW_MS),
            throttled_requests,
            average_query_cost,
            total_requests: records.len(),
        }
    }

    /// Per-endpoint statistics, busiest endpoint first
    ///
    /// Records without an endpoint label are grouped under `"unknown"`.
    pub async fn get_endpoint_breakdown(&self) -> Vec<EndpointUsage> {
        let state = self.state.read().await;
        let mut by_endpoint: HashMap<String, EndpointUsage> = HashMap::new();

        for record in &state.records {
            let endpoint = record.endpoint.clone().unwrap_or_else(|| "unknown".to_string());
            let entry = by_endpoint
                .entry(endpoint.clone())
                .or_insert_with(|| EndpointUsage {
                    endpoint,
                    requests: 0,
                    successful_cost: 0.0,
                    throttled: 0,
                });
            entry.requests += 1;
            if record.success {
                entry.successful_cost += record.actual_cost;
            }
            if record.throttled {
                entry.throttled += 1;
            }
        }

        let mut breakdown: Vec<EndpointUsage> = by_endpoint.into_values().collect();
        breakdown.sort_by(|a, b| {
            b.requests
                .cmp(&a.requests)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        breakdown
    }

    /// Empty the ledger; `current_status` is kept
    pub async fn clear_history(&self) {
        let pending = {
            let mut state = self.state.write().await;
            let cleared = state.records.len();
            state.records.clear();
            log::info!("[governor:analytics] Cleared {} usage records", cleared);
            self.slot.prepare(&*state)
        };
        self.slot.commit(pending).await;
    }
}

/// Aggregate successful records into fixed-width windows
///
/// Each record falls into the window starting at
/// `floor(timestamp_ms / window_ms) * window_ms`. Buckets come back sorted
/// ascending by window start; unsuccessful records are skipped.
pub fn aggregate_by_window<'a, I>(records: I, window_ms: i64) -> Vec<UsageBucket>
where
    I: IntoIterator<Item = &'a UsageRecord>,
{
    if window_ms <= 0 {
        return Vec::new();
    }

    let mut windows: BTreeMap<i64, (f64, u64)> = BTreeMap::new();
    for record in records.into_iter().filter(|r| r.success) {
        let start = record.timestamp_ms().div_euclid(window_ms) * window_ms;
        let entry = windows.entry(start).or_insert((0.0, 0));
        entry.0 += record.actual_cost;
        entry.1 += 1;
    }

    windows
        .into_iter()
        .filter_map(|(start, (total_cost, count))| {
            Utc.timestamp_millis_opt(start)
                .single()
                .map(|window_start| UsageBucket {
                    window_start,
                    total_cost,
                    count,
                })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
