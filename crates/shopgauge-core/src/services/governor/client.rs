//! API governor
//!
//! Wraps a [`Transport`] and keeps the plan, usage ledger and notification
//! store consistent with the bucket state the server reports.
//!
//! ```text
//!  caller ──► admit ──► Transport::execute ──► resolve ──► caller
//!               │                                 │
//!               │ (projected bucket too low)      ├─ throttled  ─► ledger + exceeded
//!               ▼                                 ├─ cost       ─► ledger + approaching?
//!        delay / reject / pass                    ├─ no cost    ─► nothing recorded
//!                                                 └─ error      ─► api_error (+ audit)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::alert::{AlertMode, AlertState};
use super::analytics::{AnalyticsOptions, UsageAnalytics};
use super::config::GovernorConfig;
use super::mutations::{MutationManager, SweeperHandle};
use super::notifications::{NotificationCallback, NotificationOptions, NotificationSystem};
use super::persistence::Persistence;
use super::plan::{PlanChangeCallback, PlanConfig, PlanConfigOptions};
use super::state_store::{JsonStateStore, StatePatch, StateStore};
use super::transport::{GraphQlResponse, Transport, TransportError};
use super::types::{
    Notification, Plan, PlanRateLimits, RequestLabel, ThrottleStatus, UsageAnalyticsSummary,
};

// ============================================================================
// Error Types
// ============================================================================

/// Errors returned by [`ApiGovernor::request`]
#[derive(Error, Debug)]
pub enum GovernorError {
    /// The transport failed; the error is passed through untouched
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local admission refused the call
    #[error("Rate limit budget exhausted, retry after {:.1}s", .retry_after.as_secs_f64())]
    Throttled { retry_after: Duration },
}

// ============================================================================
// Settings
// ============================================================================

/// Local handling of a call the projected bucket cannot afford
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Wait for the refill (at most `max_wait`), then send
    Delay { max_wait: Duration },
    /// Record a throttled attempt and return [`GovernorError::Throttled`]
    Reject,
    /// Always send
    Disabled,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::Delay {
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Runtime behaviour of the governor
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorSettings {
    pub warning_percentage: f64,
    pub critical_percentage: f64,
    pub alert_mode: AlertMode,
    pub admission: AdmissionPolicy,
    pub record_transport_failures: bool,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        GovernorConfig::default().settings()
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub label: RequestLabel,
    /// Expected cost, used for local admission
    pub estimated_cost: Option<f64>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.label = self.label.with_endpoint(endpoint);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.label = self.label.with_operation(operation);
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }
}

/// Bucket state as seen at a point in time
#[derive(Debug, Clone, Copy)]
struct Observation {
    status: ThrottleStatus,
    at: Instant,
}

impl Observation {
    fn projected(&self) -> ThrottleStatus {
        ThrottleStatus::new(
            self.status.maximum_available,
            self.status.projected_available(self.at.elapsed()),
            self.status.restore_rate,
        )
    }
}

// ============================================================================
// ApiGovernor
// ============================================================================

/// Rate-limit aware GraphQL client
pub struct ApiGovernor {
    transport: Arc<dyn Transport>,
    plan: Arc<PlanConfig>,
    analytics: Arc<UsageAnalytics>,
    notifications: Arc<NotificationSystem>,
    mutations: Arc<MutationManager>,
    settings: GovernorSettings,
    alert_state: Mutex<AlertState>,
    last_observed: RwLock<Option<Observation>>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl ApiGovernor {
    /// Start building a governor around `transport`
    pub fn builder(transport: Arc<dyn Transport>) -> GovernorBuilder {
        GovernorBuilder::new(transport)
    }

    /// Assemble a governor from existing components
    pub fn from_parts(
        transport: Arc<dyn Transport>,
        plan: Arc<PlanConfig>,
        analytics: Arc<UsageAnalytics>,
        notifications: Arc<NotificationSystem>,
        mutations: Arc<MutationManager>,
        settings: GovernorSettings,
    ) -> Self {
        Self {
            transport,
            plan,
            analytics,
            notifications,
            mutations,
            alert_state: Mutex::new(AlertState::new(settings.alert_mode)),
            settings,
            last_observed: RwLock::new(None),
            sweeper: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Execute a GraphQL document under the rate-limit budget
    ///
    /// The transport response is returned unchanged, throttled responses
    /// included. Only transport failures and local rejections are errors.
    pub async fn request(
        &self,
        document: &str,
        variables: Option<Value>,
        options: RequestOptions,
    ) -> Result<GraphQlResponse, GovernorError> {
        self.admit(&options).await?;

        match self.transport.execute(document, variables).await {
            Ok(response) => {
                self.resolve(&response, &options.label).await;
                Ok(response)
            }
            Err(e) => {
                log::error!("[governor:client] Request failed: {}", e);
                self.notifications.notify_api_error(&e).await;
                if self.settings.record_transport_failures {
                    self.analytics.record_failed_request(&options.label).await;
                }
                Err(e.into())
            }
        }
    }

    /// Execute a write, applying `optimistic_update` until it resolves
    ///
    /// The mutation fails (and rolls back) on a transport error, a local
    /// rejection, a throttled response, GraphQL errors, missing data, or
    /// non-empty `userErrors` in any payload.
    pub async fn mutate(
        &self,
        name: &str,
        document: &str,
        variables: Option<Value>,
        optimistic_update: Option<StatePatch>,
        mut options: RequestOptions,
    ) -> Result<GraphQlResponse, GovernorError> {
        if options.label.operation.is_none() {
            options.label.operation = Some(name.to_string());
        }

        let payload = variables.clone().unwrap_or(Value::Null);
        let id = self
            .mutations
            .register_mutation(name, payload, optimistic_update)
            .await;

        match self.request(document, variables, options).await {
            Ok(response) => {
                match mutation_failure(&response) {
                    Some(reason) => {
                        self.mutations.fail_mutation(&id, reason).await;
                    }
                    None => {
                        self.mutations
                            .complete_mutation(&id, response.data.as_ref())
                            .await;
                    }
                }
                Ok(response)
            }
            Err(e) => {
                self.mutations.fail_mutation(&id, &e).await;
                Err(e)
            }
        }
    }

    async fn admit(&self, options: &RequestOptions) -> Result<(), GovernorError> {
        let Some(estimated) = options.estimated_cost else {
            return Ok(());
        };
        if self.settings.admission == AdmissionPolicy::Disabled {
            return Ok(());
        }
        let Some(observation) = *self.last_observed.read().await else {
            return Ok(());
        };

        let projected = observation.projected();
        if estimated <= projected.currently_available {
            return Ok(());
        }

        // Cost above capacity can never fit; the best we can do is a full bucket
        let wait = projected
            .time_until_available(estimated)
            .or_else(|| projected.time_until_available(projected.maximum_available))
            .unwrap_or(Duration::ZERO);

        match self.settings.admission {
            AdmissionPolicy::Delay { max_wait } => {
                let wait = wait.min(max_wait);
                log::info!(
                    "[governor:client] Delaying request by {:?} ({:.0} needed, {:.1} projected)",
                    wait,
                    estimated,
                    projected.currently_available
                );
                tokio::time::sleep(wait).await;
                Ok(())
            }
            AdmissionPolicy::Reject => {
                log::warn!(
                    "[governor:client] Rejecting request ({:.0} needed, {:.1} projected)",
                    estimated,
                    projected.currently_available
                );
                self.analytics
                    .record_throttled_request(Some(projected), &options.label)
                    .await;
                self.notifications.notify_rate_limit_exceeded(&projected).await;
                Err(GovernorError::Throttled { retry_after: wait })
            }
            AdmissionPolicy::Disabled => Ok(()),
        }
    }

    async fn observe(&self, status: ThrottleStatus) {
        *self.last_observed.write().await = Some(Observation {
            status,
            at: Instant::now(),
        });
    }

    async fn resolve(&self, response: &GraphQlResponse, label: &RequestLabel) {
        // Held across the ledger append so alert levels advance in ledger order
        let mut alerts = self.alert_state.lock().await;

        if response.is_throttled() {
            let status = match response.cost() {
                Some(cost) => {
                    self.observe(cost.throttle_status).await;
                    Some(cost.throttle_status)
                }
                None => self.analytics.get_current_status().await,
            };
            log::warn!("[governor:client] Request throttled by the server");
            self.analytics.record_throttled_request(status, label).await;
            drop(alerts);
            self.notifications
                .notify_rate_limit_exceeded(&status.unwrap_or_else(ThrottleStatus::placeholder))
                .await;
            return;
        }

        let Some(cost) = response.cost() else {
            log::debug!("[governor:client] No cost data observed");
            return;
        };

        self.observe(cost.throttle_status).await;
        let record = self
            .analytics
            .record_api_usage(cost, label, !response.has_errors(), false)
            .await;

        let usage = record.throttle_status.usage_percentage();
        let level = alerts.should_alert(
            usage,
            self.settings.warning_percentage,
            self.settings.critical_percentage,
        );
        drop(alerts);

        if let Some(level) = level {
            log::info!("[governor:client] Usage at {:.1}% ({:?})", usage, level);
            self.notifications
                .notify_rate_limit_approaching(&record.throttle_status, usage)
                .await;
        }
    }

    // ------------------------------------------------------------------------
    // Plan
    // ------------------------------------------------------------------------

    /// Switch plans; notifies and re-arms alerts on an actual change
    pub async fn update_plan(&self, plan: Plan) -> bool {
        if !self.plan.update_plan(plan).await {
            return false;
        }
        self.notifications
            .notify_plan_changed(plan, &plan.rate_limits())
            .await;
        self.alert_state.lock().await.clear();
        true
    }

    pub async fn current_plan(&self) -> Plan {
        self.plan.get_current_plan().await
    }

    pub async fn current_rate_limits(&self) -> PlanRateLimits {
        self.plan.get_current_rate_limits().await
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    pub async fn get_summary(&self) -> UsageAnalyticsSummary {
        self.analytics.get_summary().await
    }

    /// Last bucket state recorded in the ledger
    pub async fn current_status(&self) -> Option<ThrottleStatus> {
        self.analytics.get_current_status().await
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    pub fn plan_config(&self) -> &Arc<PlanConfig> {
        &self.plan
    }

    pub fn analytics(&self) -> &Arc<UsageAnalytics> {
        &self.analytics
    }

    pub fn notifications(&self) -> &Arc<NotificationSystem> {
        &self.notifications
    }

    pub fn mutations(&self) -> &Arc<MutationManager> {
        &self.mutations
    }

    /// Stop background work (the mutation timeout sweeper)
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.shutdown().await;
        }
    }
}

/// Why a mutation response counts as failed, if it does
fn mutation_failure(response: &GraphQlResponse) -> Option<String> {
    if response.is_throttled() {
        return Some("request was throttled".to_string());
    }
    if let Some(errors) = response.errors.as_ref().filter(|errors| !errors.is_empty()) {
        let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
        return Some(messages.join("; "));
    }

    let Some(data) = response.data.as_ref().filter(|data| !data.is_null()) else {
        return Some("no data returned".to_string());
    };

    let user_errors: Vec<String> = data
        .as_object()
        .into_iter()
        .flat_map(|fields| fields.values())
        .filter_map(|payload| payload.get("userErrors")?.as_array())
        .flatten()
        .filter_map(|e| e.get("message")?.as_str().map(str::to_string))
        .collect();

    (!user_errors.is_empty()).then(|| user_errors.join("; "))
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ApiGovernor`]
pub struct GovernorBuilder {
    transport: Arc<dyn Transport>,
    config: GovernorConfig,
    persistence: Option<Arc<dyn Persistence>>,
    state_store: Option<Arc<dyn StateStore>>,
    on_plan_change: Option<PlanChangeCallback>,
    on_new_notification: Option<NotificationCallback>,
}

impl GovernorBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: GovernorConfig::default(),
            persistence: None,
            state_store: None,
            on_plan_change: None,
            on_new_notification: None,
        }
    }

    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage backend; persistence stays off without one
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// State store for optimistic updates (an empty JSON document by default)
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn on_plan_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(Plan, PlanRateLimits) + Send + Sync + 'static,
    {
        self.on_plan_change = Some(Box::new(callback));
        self
    }

    pub fn on_new_notification<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.on_new_notification = Some(Arc::new(callback));
        self
    }

    /// Load persisted state and assemble the governor
    pub async fn build(self) -> ApiGovernor {
        let config = self.config.validate();
        let plan_backend = self.persistence.clone().filter(|_| config.persist_config);
        let data_backend = self.persistence.filter(|_| config.persist_data);

        let plan = PlanConfig::load(
            PlanConfigOptions {
                initial_plan: config.initial_plan,
                storage_key: config.plan_key(),
                on_plan_change: self.on_plan_change,
            },
            plan_backend,
        )
        .await;

        let analytics = UsageAnalytics::load(
            AnalyticsOptions {
                max_history_length: config.max_history_length,
                storage_key: config.analytics_key(),
            },
            data_backend.clone(),
        )
        .await;

        let notifications = Arc::new(
            NotificationSystem::load(
                NotificationOptions {
                    max_notifications: config.max_notifications,
                    storage_key: config.notifications_key(),
                    on_new_notification: self.on_new_notification,
                },
                data_backend,
            )
            .await,
        );

        let store = self
            .state_store
            .unwrap_or_else(|| {
                let empty = JsonStateStore::new(Value::Object(Default::default()));
                Arc::new(empty) as Arc<dyn StateStore>
            });
        let mutations = Arc::new(MutationManager::new(store, Some(Arc::clone(&notifications))));

        let governor = ApiGovernor::from_parts(
            self.transport,
            Arc::new(plan),
            Arc::new(analytics),
            notifications,
            Arc::clone(&mutations),
            config.settings(),
        );

        if let Some(max_age) = config.mutation_timeout() {
            let interval = (max_age / 2).max(Duration::from_secs(1));
            let handle = mutations.spawn_timeout_sweeper(interval, max_age);
            *governor.sweeper.lock().await = Some(handle);
        }

        governor
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::governor::persistence::MemoryPersistence;
    use crate::services::governor::transport::{GraphQlError, ResponseExtensions};
    use crate::services::governor::types::{CostExtensions, NotificationTopic};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport replaying a fixed script of results
    struct ScriptedTransport {
        script: std::sync::Mutex<VecDeque<Result<GraphQlResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<GraphQlResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(
            &self,
            _document: &str,
            _variables: Option<Value>,
        ) -> Result<GraphQlResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("script exhausted".to_string())))
        }
    }

    fn with_cost(
        data: Value,
        requested: f64,
        actual: Option<f64>,
        available: f64,
    ) -> GraphQlResponse {
        GraphQlResponse {
            data: Some(data),
            errors: None,
            extensions: Some(ResponseExtensions {
                cost: Some(CostExtensions {
                    requested_query_cost: requested,
                    actual_query_cost: actual,
                    throttle_status: ThrottleStatus::new(100.0, available, 50.0),
                }),
            }),
        }
    }

    fn ok(available: f64) -> Result<GraphQlResponse, TransportError> {
        Ok(with_cost(json!({"ok": true}), 5.0, Some(5.0), available))
    }

    async fn governor(transport: Arc<ScriptedTransport>, config: GovernorConfig) -> ApiGovernor {
        ApiGovernor::builder(transport).config(config).build().await
    }

    #[tokio::test]
    async fn test_request_records_usage() {
        let transport = ScriptedTransport::new(vec![ok(95.0)]);
        let governor = governor(transport.clone(), GovernorConfig::default()).await;

        let response = governor
            .request("{ shop { id } }", None, RequestOptions::new().with_endpoint("shop"))
            .await
            .unwrap();

        assert_eq!(response.data, Some(json!({"ok": true})));
        let summary = governor.get_summary().await;
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.recent_records[0].endpoint.as_deref(), Some("shop"));
        assert!((summary.usage_percentage - 5.0).abs() < 1e-9);
        assert_eq!(
            governor.current_status().await,
            Some(ThrottleStatus::new(100.0, 95.0, 50.0))
        );
    }

    #[tokio::test]
    async fn test_graphql_errors_record_unsuccessful_usage() {
        let mut response = with_cost(Value::Null, 5.0, Some(1.0), 99.0);
        response.errors = Some(vec![GraphQlError::new("Field 'x' doesn't exist")]);
        let transport = ScriptedTransport::new(vec![Ok(response)]);
        let governor = governor(transport, GovernorConfig::default()).await;

        governor.request("{ x }", None, RequestOptions::new()).await.unwrap();

        let records = governor.analytics().get_records().await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(!records[0].throttled);
        assert_eq!(governor.get_summary().await.average_query_cost, 0.0);
    }

    #[tokio::test]
    async fn test_crossing_notifies_once() {
        let script = vec![ok(60.0), ok(30.0), ok(15.0), ok(12.0), ok(10.0)];
        let transport = ScriptedTransport::new(script);
        let governor = governor(transport, GovernorConfig::default()).await;

        for _ in 0..5 {
            governor.request("{ shop { id } }", None, RequestOptions::new()).await.unwrap();
        }

        let alerts = governor
            .notifications()
            .get_by_topic(&NotificationTopic::RateLimit)
            .await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("85.0%"));
    }

    #[tokio::test]
    async fn test_concurrent_alerts_follow_ledger_order() {
        let script = vec![ok(15.0), ok(60.0), ok(12.0), ok(50.0), ok(4.0), ok(70.0)];
        let transport = ScriptedTransport::new(script);
        let config = GovernorConfig::default();
        let governor = governor(transport, config.clone()).await;

        let query = || governor.request("{ shop { id } }", None, RequestOptions::new());
        let results = tokio::join!(query(), query(), query(), query(), query(), query());
        assert!(results.0.is_ok() && results.5.is_ok());

        let records = governor.analytics().get_records().await;
        assert_eq!(records.len(), 6);

        let mut replay = AlertState::new(AlertMode::Crossing);
        let expected = records
            .iter()
            .rev()
            .filter(|record| {
                replay
                    .should_alert(
                        record.throttle_status.usage_percentage(),
                        config.warning_percentage,
                        config.critical_percentage,
                    )
                    .is_some()
            })
            .count();

        let alerts = governor
            .notifications()
            .get_by_topic(&NotificationTopic::RateLimit)
            .await;
        assert!(expected > 0);
        assert_eq!(alerts.len(), expected);
    }

    #[tokio::test]
    async fn test_every_record_mode_notifies_each_time() {
        let script = vec![ok(60.0), ok(15.0), ok(12.0), ok(10.0)];
        let transport = ScriptedTransport::new(script);
        let config = GovernorConfig {
            alert_mode: AlertMode::EveryRecord,
            ..Default::default()
        };
        let governor = governor(transport, config).await;

        for _ in 0..4 {
            governor.request("{ shop { id } }", None, RequestOptions::new()).await.unwrap();
        }

        let alerts = governor
            .notifications()
            .get_by_topic(&NotificationTopic::RateLimit)
            .await;
        assert_eq!(alerts.len(), 3);
    }

    #[tokio::test]
    async fn test_throttled_response_is_recorded_and_returned() {
        let throttled = GraphQlResponse {
            data: None,
            errors: Some(vec![GraphQlError {
                message: "Throttled".to_string(),
                extensions: Some(json!({"code": "THROTTLED"})),
            }]),
            extensions: None,
        };
        let transport = ScriptedTransport::new(vec![ok(40.0), Ok(throttled)]);
        let governor = governor(transport, GovernorConfig::default()).await;

        governor.request("{ a }", None, RequestOptions::new()).await.unwrap();
        let response = governor.request("{ b }", None, RequestOptions::new()).await.unwrap();
        assert!(response.is_throttled());

        let records = governor.analytics().get_records().await;
        assert_eq!(records.len(), 2);
        assert!(records[0].throttled);
        assert_eq!(records[0].throttle_status, ThrottleStatus::new(100.0, 40.0, 50.0));
        assert_eq!(
            governor.current_status().await,
            Some(ThrottleStatus::new(100.0, 40.0, 50.0))
        );

        let notifications = governor.notifications().get_all().await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].topic, NotificationTopic::RateLimit);
        assert_eq!(governor.get_summary().await.throttled_requests, 1);
    }

    #[tokio::test]
    async fn test_exhausted_bucket_without_data_is_throttled() {
        let response = with_cost(Value::Null, 50.0, None, 3.0);
        let transport = ScriptedTransport::new(vec![Ok(response)]);
        let governor = governor(transport, GovernorConfig::default()).await;

        governor.request("{ big }", None, RequestOptions::new()).await.unwrap();

        let records = governor.analytics().get_records().await;
        assert!(records[0].throttled);
        assert_eq!(records[0].throttle_status.currently_available, 3.0);
        assert!(governor.current_status().await.is_none());
    }

    #[tokio::test]
    async fn test_response_without_cost_records_nothing() {
        let transport = ScriptedTransport::new(vec![Ok(GraphQlResponse {
            data: Some(json!({"ok": true})),
            ..Default::default()
        })]);
        let governor = governor(transport, GovernorConfig::default()).await;

        governor.request("{ a }", None, RequestOptions::new()).await.unwrap();
        assert!(governor.analytics().is_empty().await);
        assert!(governor.notifications().get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_notified_and_returned() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Network(
            "connection reset".to_string(),
        ))]);
        let governor = governor(transport, GovernorConfig::default()).await;

        let err = governor
            .request("{ a }", None, RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::Transport(TransportError::Network(_))));
        assert!(governor.analytics().is_empty().await);

        let errors = governor
            .notifications()
            .get_by_topic(&NotificationTopic::ApiError)
            .await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_transport_failure_audit_record() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Http {
            status: 502,
            body: "bad gateway".to_string(),
        })]);
        let config = GovernorConfig {
            record_transport_failures: true,
            ..Default::default()
        };
        let governor = governor(transport, config).await;

        assert!(governor.request("{ a }", None, RequestOptions::new()).await.is_err());

        let records = governor.analytics().get_records().await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(!records[0].throttled);
        assert!(governor.current_status().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_admission() {
        let transport = ScriptedTransport::new(vec![ok(10.0)]);
        let config = GovernorConfig {
            admission: crate::services::governor::config::AdmissionConfig {
                mode: crate::services::governor::config::AdmissionMode::Reject,
                ..Default::default()
            },
            ..Default::default()
        };
        let governor = governor(transport.clone(), config).await;

        governor.request("{ a }", None, RequestOptions::new()).await.unwrap();

        let err = governor
            .request("{ b }", None, RequestOptions::new().with_estimated_cost(100.0))
            .await
            .unwrap_err();
        match err {
            GovernorError::Throttled { retry_after } => {
                assert!(retry_after <= Duration::from_millis(1800));
                assert!(retry_after >= Duration::from_millis(1790));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(transport.calls(), 1);
        let records = governor.analytics().get_records().await;
        assert!(records[0].throttled);
        assert_eq!(
            governor
                .notifications()
                .get_by_topic(&NotificationTopic::RateLimit)
                .await
                .len(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_admission_waits_for_refill() {
        let transport = ScriptedTransport::new(vec![ok(10.0), ok(50.0)]);
        let governor = governor(transport.clone(), GovernorConfig::default()).await;

        governor.request("{ a }", None, RequestOptions::new()).await.unwrap();

        let start = Instant::now();
        governor
            .request("{ b }", None, RequestOptions::new().with_estimated_cost(100.0))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(1800));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped_by_max_wait() {
        let transport = ScriptedTransport::new(vec![ok(0.0), ok(50.0)]);
        let config = GovernorConfig {
            admission: crate::services::governor::config::AdmissionConfig {
                max_wait_ms: 500,
                ..Default::default()
            },
            ..Default::default()
        };
        let governor = governor(transport.clone(), config).await;

        governor.request("{ a }", None, RequestOptions::new()).await.unwrap();

        let start = Instant::now();
        governor
            .request("{ b }", None, RequestOptions::new().with_estimated_cost(100.0))
            .await
            .unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(1000));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_zero_restore_rate_does_not_panic() {
        let starved = ThrottleStatus::new(100.0, 0.0, 1e-20);
        let throttled = GraphQlResponse {
            data: None,
            errors: None,
            extensions: Some(ResponseExtensions {
                cost: Some(CostExtensions {
                    requested_query_cost: 50.0,
                    actual_query_cost: None,
                    throttle_status: starved,
                }),
            }),
        };
        let transport = ScriptedTransport::new(vec![Ok(throttled), ok(100.0)]);
        let governor = governor(transport.clone(), GovernorConfig::default()).await;

        let response = governor.request("{ a }", None, RequestOptions::new()).await.unwrap();
        assert!(response.is_throttled());

        let alerts = governor
            .notifications()
            .get_by_topic(&NotificationTopic::RateLimit)
            .await;
        assert_eq!(alerts.len(), 1);
        assert!(!alerts[0].message.contains("retry in"));

        governor
            .request("{ b }", None, RequestOptions::new().with_estimated_cost(50.0))
            .await
            .unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_affordable_request_is_not_delayed() {
        let transport = ScriptedTransport::new(vec![ok(90.0), ok(85.0)]);
        let governor = governor(transport, GovernorConfig::default()).await;

        governor.request("{ a }", None, RequestOptions::new()).await.unwrap();
        let start = Instant::now();
        governor
            .request("{ b }", None, RequestOptions::new().with_estimated_cost(10.0))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_mutate_success_keeps_optimistic_state() {
        let store = Arc::new(JsonStateStore::new(json!({"title": "Old"})));
        let transport = ScriptedTransport::new(vec![Ok(with_cost(
            json!({"productUpdate": {"product": {"id": "1"}, "userErrors": []}}),
            10.0,
            Some(10.0),
            90.0,
        ))]);
        let governor = ApiGovernor::builder(transport)
            .state_store(store.clone())
            .build()
            .await;

        governor
            .mutate(
                "productUpdate",
                "mutation { productUpdate }",
                Some(json!({"title": "New"})),
                Some(StatePatch::new(json!({"title": "New"}))),
                RequestOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(store.snapshot(), json!({"title": "New"}));
        assert!(!governor.mutations().has_pending_mutations().await);
        let records = governor.analytics().get_records().await;
        assert_eq!(records[0].operation.as_deref(), Some("productUpdate"));
    }

    #[tokio::test]
    async fn test_mutate_user_errors_roll_back() {
        let store = Arc::new(JsonStateStore::new(json!({"title": "Old"})));
        let transport = ScriptedTransport::new(vec![Ok(with_cost(
            json!({"productUpdate": {
                "product": null,
                "userErrors": [{"field": ["title"], "message": "Title can't be blank"}]
            }}),
            10.0,
            Some(10.0),
            90.0,
        ))]);
        let governor = ApiGovernor::builder(transport)
            .state_store(store.clone())
            .build()
            .await;

        governor
            .mutate(
                "productUpdate",
                "mutation { productUpdate }",
                None,
                Some(StatePatch::new(json!({"title": ""}))),
                RequestOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(store.snapshot(), json!({"title": "Old"}));
        let failures = governor
            .notifications()
            .get_by_topic(&NotificationTopic::Mutation)
            .await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("Title can't be blank"));
    }

    #[tokio::test]
    async fn test_mutate_transport_error_rolls_back() {
        let store = Arc::new(JsonStateStore::new(json!({"count": 1})));
        let transport = ScriptedTransport::new(vec![Err(TransportError::Network(
            "timeout".to_string(),
        ))]);
        let governor = ApiGovernor::builder(transport)
            .state_store(store.clone())
            .build()
            .await;

        let result = governor
            .mutate(
                "inc",
                "mutation { inc }",
                None,
                Some(StatePatch::new(json!({"count": 2}))),
                RequestOptions::new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(store.snapshot(), json!({"count": 1}));
        assert!(!governor.mutations().has_pending_mutations().await);
    }

    #[tokio::test]
    async fn test_update_plan_notifies_once_and_rearms_alerts() {
        let plan_changes = Arc::new(AtomicUsize::new(0));
        let plan_changes_clone = Arc::clone(&plan_changes);
        let transport = ScriptedTransport::new(vec![ok(15.0), ok(15.0)]);
        let governor = ApiGovernor::builder(transport)
            .on_plan_change(move |_, _| {
                plan_changes_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .await;

        governor.request("{ a }", None, RequestOptions::new()).await.unwrap();

        assert!(governor.update_plan(Plan::Plus).await);
        assert!(!governor.update_plan(Plan::Plus).await);
        assert_eq!(plan_changes.load(Ordering::SeqCst), 1);
        assert_eq!(governor.current_rate_limits().await.points_per_second, 1000);

        governor.request("{ b }", None, RequestOptions::new()).await.unwrap();

        let notifications = governor.notifications();
        assert_eq!(
            notifications.get_by_topic(&NotificationTopic::PlanChange).await.len(),
            1
        );
        assert_eq!(
            notifications.get_by_topic(&NotificationTopic::RateLimit).await.len(),
            2
        );
    }

    #[tokio::test]
    async fn test_state_survives_rebuild() {
        let backend = Arc::new(MemoryPersistence::new());

        let first = ApiGovernor::builder(ScriptedTransport::new(vec![ok(70.0)]))
            .persistence(backend.clone())
            .build()
            .await;
        first.update_plan(Plan::Advanced).await;
        first.request("{ a }", None, RequestOptions::new()).await.unwrap();

        let second = ApiGovernor::builder(ScriptedTransport::new(vec![]))
            .persistence(backend)
            .build()
            .await;
        assert_eq!(second.current_plan().await, Plan::Advanced);
        assert_eq!(second.analytics().len().await, 1);
        assert!(!second.notifications().get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_persist_flags_are_honoured() {
        let backend = Arc::new(MemoryPersistence::new());
        let config = GovernorConfig {
            persist_data: false,
            ..Default::default()
        };

        let first = ApiGovernor::builder(ScriptedTransport::new(vec![ok(70.0)]))
            .config(config.clone())
            .persistence(backend.clone())
            .build()
            .await;
        first.update_plan(Plan::Plus).await;
        first.request("{ a }", None, RequestOptions::new()).await.unwrap();

        assert!(backend.get("shopgauge.plan").await.is_some());
        assert!(backend.get("shopgauge.analytics").await.is_none());
        assert!(backend.get("shopgauge.notifications").await.is_none());
    }

    #[test]
    fn test_mutation_failure_detection() {
        assert_eq!(
            mutation_failure(&GraphQlResponse {
                data: Some(json!({"a": {"userErrors": []}})),
                ..Default::default()
            }),
            None
        );
        assert_eq!(
            mutation_failure(&GraphQlResponse::default()),
            Some("no data returned".to_string())
        );
        assert_eq!(
            mutation_failure(&GraphQlResponse {
                errors: Some(vec![GraphQlError::new("a"), GraphQlError::new("b")]),
                ..Default::default()
            }),
            Some("a; b".to_string())
        );
    }
}
