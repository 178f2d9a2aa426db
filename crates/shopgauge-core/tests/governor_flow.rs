//! End-to-end governor flow against SQLite persistence

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;

use shopgauge_core::services::governor::{
    AlertMode, ApiGovernor, CostExtensions, GovernorConfig, GraphQlResponse, JsonStateStore,
    NotificationKind, NotificationTopic, Plan, RequestOptions, ResponseExtensions,
    SqlitePersistence, StatePatch, StateStore, ThrottleStatus, Transport, TransportError,
};
use shopgauge_core::Database;

/// Bucket simulation: each call spends its cost, no refill
struct BucketTransport {
    available: Mutex<f64>,
    failures: Mutex<VecDeque<TransportError>>,
}

impl BucketTransport {
    fn new(available: f64) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(available),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    fn fail_next(&self, error: TransportError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl Transport for BucketTransport {
    async fn execute(
        &self,
        _document: &str,
        variables: Option<Value>,
    ) -> Result<GraphQlResponse, TransportError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let cost = variables
            .as_ref()
            .and_then(|v| v.get("cost"))
            .and_then(Value::as_f64)
            .unwrap_or(5.0);

        let mut available = self.available.lock().unwrap();
        let (data, actual) = if *available >= cost {
            *available -= cost;
            (Some(json!({"ok": true})), Some(cost))
        } else {
            (None, None)
        };

        Ok(GraphQlResponse {
            data,
            errors: None,
            extensions: Some(ResponseExtensions {
                cost: Some(CostExtensions {
                    requested_query_cost: cost,
                    actual_query_cost: actual,
                    throttle_status: ThrottleStatus::new(100.0, *available, 50.0),
                }),
            }),
        })
    }
}

/// Holds each call until its `id` variable is released
struct GatedTransport {
    gates: HashMap<i64, (Arc<Notify>, f64)>,
    started: AtomicUsize,
}

impl GatedTransport {
    fn new(available_by_id: &[(i64, f64)]) -> Arc<Self> {
        let gates = available_by_id
            .iter()
            .map(|&(id, available)| (id, (Arc::new(Notify::new()), available)))
            .collect();
        Arc::new(Self {
            gates,
            started: AtomicUsize::new(0),
        })
    }

    fn release(&self, id: i64) {
        self.gates[&id].0.notify_one();
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn execute(
        &self,
        _document: &str,
        variables: Option<Value>,
    ) -> Result<GraphQlResponse, TransportError> {
        let id = variables
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| TransportError::Network("missing id".to_string()))?;
        let (gate, available) = self
            .gates
            .get(&id)
            .ok_or_else(|| TransportError::Network(format!("unknown id {}", id)))?;

        self.started.fetch_add(1, Ordering::SeqCst);
        gate.notified().await;

        Ok(GraphQlResponse {
            data: Some(json!({"id": id})),
            errors: None,
            extensions: Some(ResponseExtensions {
                cost: Some(CostExtensions {
                    requested_query_cost: 5.0,
                    actual_query_cost: Some(5.0),
                    throttle_status: ThrottleStatus::new(100.0, *available, 50.0),
                }),
            }),
        })
    }
}

async fn sqlite(dir: &TempDir) -> Arc<SqlitePersistence> {
    let db = Database::open(dir.path().join("governor.db")).await.unwrap();
    Arc::new(SqlitePersistence::new(db))
}

#[tokio::test]
async fn test_bucket_drain_scenario() {
    let dir = TempDir::new().unwrap();
    let transport = BucketTransport::new(100.0);
    let config = GovernorConfig {
        admission: shopgauge_core::services::governor::AdmissionConfig {
            mode: shopgauge_core::services::governor::AdmissionMode::Disabled,
            ..Default::default()
        },
        ..Default::default()
    };
    let governor = ApiGovernor::builder(transport.clone())
        .config(config)
        .persistence(sqlite(&dir).await)
        .build()
        .await;

    assert_eq!(governor.current_plan().await, Plan::Standard);
    assert_eq!(governor.plan_config().get_warning_threshold(80.0).await, 80);

    // 100 -> 15 available in 17 steps of 5
    for _ in 0..17 {
        governor
            .request("{ shop { id } }", Some(json!({"cost": 5})), RequestOptions::new())
            .await
            .unwrap();
    }

    let summary = governor.get_summary().await;
    assert!((summary.usage_percentage - 85.0).abs() < 1e-9);
    assert_eq!(summary.total_requests, 17);
    assert_eq!(summary.average_query_cost, 5.0);

    let approaching = governor
        .notifications()
        .get_by_topic(&NotificationTopic::RateLimit)
        .await;
    assert_eq!(approaching.len(), 1);
    assert_eq!(approaching[0].kind, NotificationKind::Warning);

    // Ask for more than is left: server-side throttle
    let response = governor
        .request("{ big }", Some(json!({"cost": 50})), RequestOptions::new())
        .await
        .unwrap();
    assert!(response.is_throttled());

    let summary = governor.get_summary().await;
    assert_eq!(summary.throttled_requests, 1);
    assert_eq!(summary.total_requests, 18);
    assert_eq!(
        governor
            .notifications()
            .get_by_topic(&NotificationTopic::RateLimit)
            .await
            .len(),
        2
    );

    let total: f64 = summary.hourly_usage.iter().map(|b| b.total_cost).sum();
    assert_eq!(total, 85.0);
}

#[tokio::test]
async fn test_state_persists_across_restarts() {
    let dir = TempDir::new().unwrap();

    {
        let governor = ApiGovernor::builder(BucketTransport::new(100.0))
            .persistence(sqlite(&dir).await)
            .build()
            .await;
        assert!(governor.update_plan(Plan::Plus).await);
        governor
            .request("{ shop { id } }", None, RequestOptions::new().with_endpoint("shop"))
            .await
            .unwrap();
    }

    let governor = ApiGovernor::builder(BucketTransport::new(100.0))
        .persistence(sqlite(&dir).await)
        .build()
        .await;

    assert_eq!(governor.current_plan().await, Plan::Plus);
    let records = governor.analytics().get_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].endpoint.as_deref(), Some("shop"));
    assert_eq!(
        governor.current_status().await,
        Some(ThrottleStatus::new(100.0, 95.0, 50.0))
    );
    assert_eq!(
        governor
            .notifications()
            .get_by_topic(&NotificationTopic::PlanChange)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_clear_history_with_many_records() {
    let config = GovernorConfig {
        alert_mode: AlertMode::EveryRecord,
        ..Default::default()
    };
    let governor = ApiGovernor::builder(BucketTransport::new(100_000.0))
        .config(config)
        .build()
        .await;

    for _ in 0..500 {
        governor
            .request("{ a }", Some(json!({"cost": 1})), RequestOptions::new())
            .await
            .unwrap();
    }
    assert_eq!(governor.get_summary().await.total_requests, 500);

    governor.analytics().clear_history().await;

    let summary = governor.get_summary().await;
    assert!(summary.recent_records.is_empty());
    assert_eq!(summary.throttled_requests, 0);
    assert!(summary.current_status.is_some());
}

#[tokio::test]
async fn test_failed_mutation_rolls_back_and_reports() {
    let transport = BucketTransport::new(100.0);
    let store = Arc::new(JsonStateStore::new(json!({
        "products": {"1": {"title": "Shirt", "price": "10.00"}}
    })));
    let governor = ApiGovernor::builder(transport.clone())
        .state_store(store.clone())
        .build()
        .await;

    transport.fail_next(TransportError::Network("connection reset".to_string()));

    let result = governor
        .mutate(
            "productUpdate",
            "mutation { productUpdate }",
            None,
            Some(StatePatch::new(json!({"products": {"1": {"price": "12.00"}}}))),
            RequestOptions::new(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(
        store.snapshot(),
        json!({"products": {"1": {"title": "Shirt", "price": "10.00"}}})
    );
    assert!(!governor.mutations().has_pending_mutations().await);

    let notifications = governor.notifications();
    assert_eq!(notifications.get_by_topic(&NotificationTopic::ApiError).await.len(), 1);
    assert_eq!(notifications.get_by_topic(&NotificationTopic::Mutation).await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_keep_ledger_consistent() {
    let governor = Arc::new(
        ApiGovernor::builder(BucketTransport::new(1_000_000.0))
            .build()
            .await,
    );

    let mut handles = Vec::new();
    for i in 0..25 {
        let governor = Arc::clone(&governor);
        handles.push(tokio::spawn(async move {
            governor
                .request(
                    "{ a }",
                    Some(json!({"cost": 1})),
                    RequestOptions::new().with_endpoint(format!("e{}", i % 5)),
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let summary = governor.get_summary().await;
    assert_eq!(summary.total_requests, 25);
    let breakdown = governor.analytics().get_endpoint_breakdown().await;
    assert_eq!(breakdown.len(), 5);
    assert!(breakdown.iter().all(|e| e.requests == 5));
}

#[tokio::test]
async fn test_latest_status_follows_resolution_order() {
    let transport = GatedTransport::new(&[(1, 90.0), (2, 40.0)]);
    let governor = Arc::new(ApiGovernor::builder(transport.clone()).build().await);

    let spawn = |id: i64| {
        let governor = Arc::clone(&governor);
        tokio::spawn(async move {
            governor
                .request(
                    "{ a }",
                    Some(json!({"id": id})),
                    RequestOptions::new().with_endpoint(format!("call{}", id)),
                )
                .await
        })
    };
    let first = spawn(1);
    let second = spawn(2);
    while transport.started() < 2 {
        tokio::task::yield_now().await;
    }

    // The later call resolves first
    transport.release(2);
    second.await.unwrap().unwrap();
    transport.release(1);
    first.await.unwrap().unwrap();

    let resolved_last = ThrottleStatus::new(100.0, 90.0, 50.0);
    assert_eq!(governor.current_status().await, Some(resolved_last));

    let summary = governor.get_summary().await;
    assert_eq!(summary.current_status, Some(resolved_last));
    assert_eq!(summary.recent_records[0].throttle_status, resolved_last);
    assert_eq!(summary.recent_records[0].endpoint.as_deref(), Some("call1"));
    assert_eq!(
        summary.recent_records[1].throttle_status,
        ThrottleStatus::new(100.0, 40.0, 50.0)
    );
}
