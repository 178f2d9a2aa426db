//! Governor types
//!
//! Rate-limit, usage and notification types shared by the governor components.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Plan Types
// ============================================================================

/// Shopify subscription tier
///
/// Each tier maps to a static set of GraphQL Admin API rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    /// Basic / Shopify / standard plans
    #[default]
    Standard,
    /// Advanced Shopify
    Advanced,
    /// Shopify Plus
    Plus,
    /// Commerce Components / enterprise
    Enterprise,
}

impl Plan {
    /// Every known plan, cheapest first
    pub const ALL: [Plan; 4] = [Plan::Standard, Plan::Advanced, Plan::Plus, Plan::Enterprise];

    /// Static rate limits for this plan
    pub fn rate_limits(&self) -> PlanRateLimits {
        match self {
            Plan::Standard => PlanRateLimits::new(100, 1000, 100),
            Plan::Advanced => PlanRateLimits::new(200, 1000, 200),
            Plan::Plus => PlanRateLimits::new(1000, 1000, 1000),
            Plan::Enterprise => PlanRateLimits::new(2000, 1000, 2000),
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Plan::Standard => write!(f, "standard"),
            Plan::Advanced => write!(f, "advanced"),
            Plan::Plus => write!(f, "plus"),
            Plan::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Plan::Standard),
            "advanced" => Ok(Plan::Advanced),
            "plus" | "shopify_plus" => Ok(Plan::Plus),
            "enterprise" => Ok(Plan::Enterprise),
            _ => Err(format!("Unknown plan: {}", s)),
        }
    }
}

/// Static rate-limit parameters of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRateLimits {
    /// Query cost points restored per second
    pub points_per_second: u32,
    /// Largest cost a single query may have
    pub max_single_query_cost: u32,
    /// Bucket refill rate (points/second)
    pub restore_rate: u32,
}

impl PlanRateLimits {
    pub const fn new(
        points_per_second: u32,
        max_single_query_cost: u32,
        restore_rate: u32,
    ) -> Self {
        Self {
            points_per_second,
            max_single_query_cost,
            restore_rate,
        }
    }
}

// ============================================================================
// Bucket Types
// ============================================================================

/// Snapshot of the remote leaky bucket as reported by a response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleStatus {
    /// Bucket capacity
    pub maximum_available: f64,
    /// Points left in the bucket
    pub currently_available: f64,
    /// Refill rate in points per second
    pub restore_rate: f64,
}

impl ThrottleStatus {
    pub fn new(maximum_available: f64, currently_available: f64, restore_rate: f64) -> Self {
        Self {
            maximum_available,
            currently_available,
            restore_rate,
        }
    }

    /// Zeroed status used when a throttled attempt has no known bucket state
    pub fn placeholder() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Percentage of the bucket that is spent
    ///
    /// Returns 0 for an empty-capacity (placeholder) status.
    pub fn usage_percentage(&self) -> f64 {
        if self.maximum_available <= 0.0 {
            return 0.0;
        }
        100.0 - (self.currently_available / self.maximum_available) * 100.0
    }

    /// Points expected to be available after `elapsed`, capped at capacity
    pub fn projected_available(&self, elapsed: Duration) -> f64 {
        let refilled = self.currently_available + self.restore_rate * elapsed.as_secs_f64();
        refilled.min(self.maximum_available)
    }

    /// Time until `points` are available, starting from this snapshot
    ///
    /// Returns `None` when the bucket can never hold that many points, or
    /// when the refill time does not fit in a `Duration`.
    pub fn time_until_available(&self, points: f64) -> Option<Duration> {
        if points <= self.currently_available {
            return Some(Duration::ZERO);
        }
        if self.restore_rate <= 0.0 || points > self.maximum_available {
            return None;
        }
        let deficit = points - self.currently_available;
        Duration::try_from_secs_f64(deficit / self.restore_rate).ok()
    }
}

/// Per-request cost metadata (`extensions.cost` in a GraphQL response)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostExtensions {
    /// Cost estimated by the server before execution
    pub requested_query_cost: f64,
    /// Cost actually charged; Shopify omits it for throttled queries
    #[serde(default)]
    pub actual_query_cost: Option<f64>,
    /// Bucket state after the request executed
    pub throttle_status: ThrottleStatus,
}

impl CostExtensions {
    pub fn new(requested: f64, actual: f64, throttle_status: ThrottleStatus) -> Self {
        Self {
            requested_query_cost: requested,
            actual_query_cost: Some(actual),
            throttle_status,
        }
    }

    /// Charged cost, 0 when the server did not report one
    pub fn actual_cost(&self) -> f64 {
        self.actual_query_cost.unwrap_or(0.0)
    }
}

// ============================================================================
// Usage Types
// ============================================================================

/// Optional endpoint/operation label attached to a usage record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLabel {
    pub endpoint: Option<String>,
    pub operation: Option<String>,
}

impl RequestLabel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// One ledger entry per request attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub requested_cost: f64,
    pub actual_cost: f64,
    pub throttle_status: ThrottleStatus,
    pub endpoint: Option<String>,
    pub operation: Option<String>,
    pub success: bool,
    pub throttled: bool,
}

impl UsageRecord {
    /// Timestamp in milliseconds since the Unix epoch
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Aggregate of successful usage within one fixed-width window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBucket {
    /// Window start (aligned to the window width)
    pub window_start: DateTime<Utc>,
    /// Sum of actual query cost
    pub total_cost: f64,
    /// Number of successful requests
    pub count: u64,
}

/// Per-endpoint request statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointUsage {
    pub endpoint: String,
    pub requests: u64,
    pub successful_cost: f64,
    pub throttled: u64,
}

/// Derived view of the usage ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAnalyticsSummary {
    pub current_status: Option<ThrottleStatus>,
    pub usage_percentage: f64,
    pub recent_records: Vec<UsageRecord>,
    pub hourly_usage: Vec<UsageBucket>,
    pub daily_usage: Vec<UsageBucket>,
    pub throttled_requests: usize,
    pub average_query_cost: f64,
    pub total_requests: usize,
}

// ============================================================================
// Alert Level
// ============================================================================

/// Alert level for bucket usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Below the warning percentage
    Normal,
    /// At or above the warning percentage
    Warning,
    /// At or above the critical percentage
    Critical,
}

impl AlertLevel {
    /// Determine alert level based on usage percentage and thresholds
    pub fn from_usage(used_percent: f64, warning_threshold: f64, critical_threshold: f64) -> Self {
        if used_percent >= critical_threshold {
            AlertLevel::Critical
        } else if used_percent >= warning_threshold {
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }
}

// ============================================================================
// Notification Types
// ============================================================================

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
    Success,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Info => write!(f, "info"),
            NotificationKind::Warning => write!(f, "warning"),
            NotificationKind::Error => write!(f, "error"),
            NotificationKind::Success => write!(f, "success"),
        }
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(NotificationKind::Info),
            "warning" | "warn" => Ok(NotificationKind::Warning),
            "error" => Ok(NotificationKind::Error),
            "success" => Ok(NotificationKind::Success),
            _ => Err(format!("Unknown notification type: {}", s)),
        }
    }
}

/// Topic a notification is published under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationTopic {
    RateLimit,
    Mutation,
    System,
    ApiError,
    PlanChange,
    /// Application-defined topic
    Other(String),
}

impl std::fmt::Display for NotificationTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationTopic::RateLimit => write!(f, "rate_limit"),
            NotificationTopic::Mutation => write!(f, "mutation"),
            NotificationTopic::System => write!(f, "system"),
            NotificationTopic::ApiError => write!(f, "api_error"),
            NotificationTopic::PlanChange => write!(f, "plan_change"),
            NotificationTopic::Other(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for NotificationTopic {
    fn from(s: &str) -> Self {
        match s {
            "rate_limit" => NotificationTopic::RateLimit,
            "mutation" => NotificationTopic::Mutation,
            "system" => NotificationTopic::System,
            "api_error" => NotificationTopic::ApiError,
            "plan_change" => NotificationTopic::PlanChange,
            other => NotificationTopic::Other(other.to_string()),
        }
    }
}

impl From<String> for NotificationTopic {
    fn from(s: String) -> Self {
        NotificationTopic::from(s.as_str())
    }
}

impl From<NotificationTopic> for String {
    fn from(topic: NotificationTopic) -> Self {
        topic.to_string()
    }
}

/// Operator-facing event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub topic: NotificationTopic,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Notification {
    /// Create a new unread notification
    pub fn new(
        message: impl Into<String>,
        kind: NotificationKind,
        topic: NotificationTopic,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            topic,
            message: message.into(),
            timestamp: Utc::now(),
            read: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
