//! Governor configuration
//!
//! Every field has a default, so an empty JSON object (or no config at all)
//! yields a working governor. `SHOPGAUGE_*` environment variables override
//! individual fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::alert::AlertMode;
use super::analytics::DEFAULT_MAX_HISTORY_LENGTH;
use super::client::{AdmissionPolicy, GovernorSettings};
use super::notifications::DEFAULT_MAX_NOTIFICATIONS;
use super::plan::DEFAULT_WARNING_PERCENTAGE;
use super::types::Plan;

// ============================================================================
// Constants
// ============================================================================

/// Default storage key prefix
pub const DEFAULT_STORAGE_KEY: &str = "shopgauge";

/// Default critical threshold (percentage)
pub const DEFAULT_CRITICAL_PERCENTAGE: f64 = 95.0;

/// Default upper bound for an admission delay
pub const DEFAULT_MAX_WAIT_MS: u64 = 10_000;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "SHOPGAUGE_";

// ============================================================================
// Admission
// ============================================================================

/// What to do with a call the projected bucket cannot afford
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    #[default]
    Delay,
    Reject,
    Disabled,
}

impl std::fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionMode::Delay => write!(f, "delay"),
            AdmissionMode::Reject => write!(f, "reject"),
            AdmissionMode::Disabled => write!(f, "disabled"),
        }
    }
}

impl std::str::FromStr for AdmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "delay" => Ok(AdmissionMode::Delay),
            "reject" => Ok(AdmissionMode::Reject),
            "disabled" | "off" | "none" => Ok(AdmissionMode::Disabled),
            _ => Err(format!("Unknown admission mode: {}", s)),
        }
    }
}

/// Local admission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionConfig {
    pub mode: AdmissionMode,
    /// Longest delay before a call is sent anyway
    pub max_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            mode: AdmissionMode::Delay,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
        }
    }
}

impl AdmissionConfig {
    pub fn policy(&self) -> AdmissionPolicy {
        match self.mode {
            AdmissionMode::Delay => AdmissionPolicy::Delay {
                max_wait: Duration::from_millis(self.max_wait_ms),
            },
            AdmissionMode::Reject => AdmissionPolicy::Reject,
            AdmissionMode::Disabled => AdmissionPolicy::Disabled,
        }
    }
}

// ============================================================================
// GovernorConfig
// ============================================================================

/// Construction-time configuration of the governor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernorConfig {
    /// Plan used when none is persisted
    pub initial_plan: Option<Plan>,
    /// Usage ledger capacity
    pub max_history_length: usize,
    /// Notification list capacity
    pub max_notifications: usize,
    /// Persist the ledger and notifications
    pub persist_data: bool,
    /// Persist the active plan
    pub persist_config: bool,
    /// Prefix of every storage key
    pub storage_key: String,
    pub warning_percentage: f64,
    pub critical_percentage: f64,
    pub alert_mode: AlertMode,
    pub admission: AdmissionConfig,
    /// Record transport failures as zero-cost audit entries
    pub record_transport_failures: bool,
    /// Fail mutations pending longer than this
    pub mutation_timeout_secs: Option<u64>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            initial_plan: None,
            max_history_length: DEFAULT_MAX_HISTORY_LENGTH,
            max_notifications: DEFAULT_MAX_NOTIFICATIONS,
            persist_data: true,
            persist_config: true,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            warning_percentage: DEFAULT_WARNING_PERCENTAGE,
            critical_percentage: DEFAULT_CRITICAL_PERCENTAGE,
            alert_mode: AlertMode::Crossing,
            admission: AdmissionConfig::default(),
            record_transport_failures: false,
            mutation_timeout_secs: None,
        }
    }
}

impl GovernorConfig {
    /// Defaults with `SHOPGAUGE_*` overrides from the process environment
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (keyed by full variable name)
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(value) = get("PLAN") {
            override_parsed(&mut self.initial_plan, "PLAN", &value, |v| v.parse().map(Some));
        }
        if let Some(value) = get("MAX_HISTORY_LENGTH") {
            override_parsed(&mut self.max_history_length, "MAX_HISTORY_LENGTH", &value, |v| {
                v.parse::<usize>().map_err(|e| e.to_string())
            });
        }
        if let Some(value) = get("MAX_NOTIFICATIONS") {
            override_parsed(&mut self.max_notifications, "MAX_NOTIFICATIONS", &value, |v| {
                v.parse::<usize>().map_err(|e| e.to_string())
            });
        }
        if let Some(value) = get("PERSIST_DATA") {
            override_parsed(&mut self.persist_data, "PERSIST_DATA", &value, parse_bool);
        }
        if let Some(value) = get("PERSIST_CONFIG") {
            override_parsed(&mut self.persist_config, "PERSIST_CONFIG", &value, parse_bool);
        }
        if let Some(value) = get("STORAGE_KEY") {
            self.storage_key = value;
        }
        if let Some(value) = get("WARNING_PERCENTAGE") {
            override_parsed(&mut self.warning_percentage, "WARNING_PERCENTAGE", &value, |v| {
                v.parse::<f64>().map_err(|e| e.to_string())
            });
        }
        if let Some(value) = get("CRITICAL_PERCENTAGE") {
            override_parsed(&mut self.critical_percentage, "CRITICAL_PERCENTAGE", &value, |v| {
                v.parse::<f64>().map_err(|e| e.to_string())
            });
        }
        if let Some(value) = get("ALERT_MODE") {
            override_parsed(&mut self.alert_mode, "ALERT_MODE", &value, |v| v.parse());
        }
        if let Some(value) = get("ADMISSION") {
            override_parsed(&mut self.admission.mode, "ADMISSION", &value, |v| v.parse());
        }
        if let Some(value) = get("MAX_WAIT_MS") {
            override_parsed(&mut self.admission.max_wait_ms, "MAX_WAIT_MS", &value, |v| {
                v.parse::<u64>().map_err(|e| e.to_string())
            });
        }
        if let Some(value) = get("RECORD_TRANSPORT_FAILURES") {
            override_parsed(
                &mut self.record_transport_failures,
                "RECORD_TRANSPORT_FAILURES",
                &value,
                parse_bool,
            );
        }
        if let Some(value) = get("MUTATION_TIMEOUT_SECS") {
            override_parsed(&mut self.mutation_timeout_secs, "MUTATION_TIMEOUT_SECS", &value, |v| {
                v.parse::<u64>().map(Some).map_err(|e| e.to_string())
            });
        }

        self.validate()
    }

    /// Validate and normalize the configuration
    pub fn validate(&self) -> Self {
        let warning_percentage = self.warning_percentage.clamp(0.0, 100.0);
        let storage_key = self.storage_key.trim();

        Self {
            initial_plan: self.initial_plan,
            max_history_length: self.max_history_length.max(1),
            max_notifications: self.max_notifications.max(1),
            persist_data: self.persist_data,
            persist_config: self.persist_config,
            storage_key: if storage_key.is_empty() {
                DEFAULT_STORAGE_KEY.to_string()
            } else {
                storage_key.to_string()
            },
            warning_percentage,
            critical_percentage: self
                .critical_percentage
                .clamp(0.0, 100.0)
                .max(warning_percentage),
            alert_mode: self.alert_mode,
            admission: self.admission.clone(),
            record_transport_failures: self.record_transport_failures,
            mutation_timeout_secs: self.mutation_timeout_secs.filter(|secs| *secs > 0),
        }
    }

    pub fn plan_key(&self) -> String {
        format!("{}.plan", self.storage_key)
    }

    pub fn analytics_key(&self) -> String {
        format!("{}.analytics", self.storage_key)
    }

    pub fn notifications_key(&self) -> String {
        format!("{}.notifications", self.storage_key)
    }

    /// Runtime settings for [`ApiGovernor`](super::ApiGovernor)
    pub fn settings(&self) -> GovernorSettings {
        GovernorSettings {
            warning_percentage: self.warning_percentage,
            critical_percentage: self.critical_percentage,
            alert_mode: self.alert_mode,
            admission: self.admission.policy(),
            record_transport_failures: self.record_transport_failures,
        }
    }

    pub fn mutation_timeout(&self) -> Option<Duration> {
        self.mutation_timeout_secs.map(Duration::from_secs)
    }
}

fn override_parsed<T, P>(field: &mut T, name: &str, value: &str, parse: P)
where
    P: FnOnce(&str) -> Result<T, String>,
{
    match parse(value.trim()) {
        Ok(parsed) => *field = parsed,
        Err(e) => log::warn!(
            "[governor:config] Ignoring {}{}={:?}: {}",
            ENV_PREFIX,
            name,
            value,
            e
        ),
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("expected a boolean, got '{}'", value)),
    }
}
