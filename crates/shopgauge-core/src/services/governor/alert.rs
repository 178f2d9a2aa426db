//! Threshold alerting for bucket usage

use serde::{Deserialize, Serialize};

use super::types::AlertLevel;

/// When a usage record above the warning percentage raises a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMode {
    /// Once per upward level crossing; re-armed when usage drops back
    #[default]
    Crossing,
    /// On every record at or above the warning percentage
    EveryRecord,
}

impl std::fmt::Display for AlertMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertMode::Crossing => write!(f, "crossing"),
            AlertMode::EveryRecord => write!(f, "every_record"),
        }
    }
}

impl std::str::FromStr for AlertMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "crossing" => Ok(AlertMode::Crossing),
            "every_record" | "every" => Ok(AlertMode::EveryRecord),
            _ => Err(format!("Unknown alert mode: {}", s)),
        }
    }
}

/// Tracks the last alerted level so crossings fire once
#[derive(Debug, Clone)]
pub struct AlertState {
    mode: AlertMode,
    last_level: AlertLevel,
}

impl AlertState {
    pub fn new(mode: AlertMode) -> Self {
        Self {
            mode,
            last_level: AlertLevel::Normal,
        }
    }

    pub fn mode(&self) -> AlertMode {
        self.mode
    }

    /// Level to alert at for this usage, if any
    pub fn should_alert(
        &mut self,
        current_percent: f64,
        warning_threshold: f64,
        critical_threshold: f64,
    ) -> Option<AlertLevel> {
        let current_level =
            AlertLevel::from_usage(current_percent, warning_threshold, critical_threshold);
        let last_level = std::mem::replace(&mut self.last_level, current_level);

        match self.mode {
            AlertMode::EveryRecord => {
                (current_level != AlertLevel::Normal).then_some(current_level)
            }
            AlertMode::Crossing => (current_level > last_level).then_some(current_level),
        }
    }

    /// Forget the last level (e.g. after a plan change)
    pub fn clear(&mut self) {
        self.last_level = AlertLevel::Normal;
    }
}

impl Default for AlertState {
    fn default() -> Self {
        Self::new(AlertMode::default())
    }
}
