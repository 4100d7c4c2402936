//! Typed duration values used by waits, timeouts and retry policies.

use serde::{Deserialize, Serialize};

/// A duration expressed in calendar-free units.
///
/// ```json
/// { "minutes": 5, "seconds": 30 }
/// ```
///
/// All arithmetic goes through whole milliseconds; there is no floating
/// point anywhere in the conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowDuration {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub days: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub hours: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub minutes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seconds: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub milliseconds: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl WorkflowDuration {
    pub fn from_millis(milliseconds: u64) -> Self {
        Self {
            milliseconds,
            ..Self::default()
        }
    }

    pub fn from_secs(seconds: u64) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    pub fn from_minutes(minutes: u64) -> Self {
        Self {
            minutes,
            ..Self::default()
        }
    }

    /// Total length in milliseconds (saturating).
    pub fn total_millis(&self) -> u64 {
        self.days
            .saturating_mul(86_400_000)
            .saturating_add(self.hours.saturating_mul(3_600_000))
            .saturating_add(self.minutes.saturating_mul(60_000))
            .saturating_add(self.seconds.saturating_mul(1_000))
            .saturating_add(self.milliseconds)
    }

    pub fn is_zero(&self) -> bool {
        self.total_millis() == 0
    }

    pub fn to_std(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.total_millis())
    }

    pub fn to_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.total_millis()).unwrap_or(i64::MAX))
    }
}

impl From<std::time::Duration> for WorkflowDuration {
    fn from(d: std::time::Duration) -> Self {
        Self::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_millis_sums_units() {
        let d = WorkflowDuration {
            days: 1,
            hours: 2,
            minutes: 3,
            seconds: 4,
            milliseconds: 5,
        };
        assert_eq!(d.total_millis(), 86_400_000 + 7_200_000 + 180_000 + 4_000 + 5);
    }

    #[test]
    fn deserializes_partial_units() {
        let d: WorkflowDuration = serde_json::from_str(r#"{"seconds": 30}"#).unwrap();
        assert_eq!(d.to_std(), std::time::Duration::from_secs(30));
        assert_eq!(d.to_chrono(), chrono::Duration::seconds(30));
    }

    #[test]
    fn zero_duration() {
        assert!(WorkflowDuration::default().is_zero());
        assert!(!WorkflowDuration::from_millis(1).is_zero());
    }
}
