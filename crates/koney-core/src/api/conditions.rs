//! Policy status conditions.
//!
//! Conditions follow the familiar cluster-API convention: an array
//! keyed by `type`, each entry carrying a tri-state status, a machine
//! reason, and a human message. Writes are diff-minimized so that
//! re-asserting an unchanged condition produces no API traffic and
//! `lastTransitionTime` only advances when the status actually flips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known condition types written by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    /// All traps passed validation under the strict rules.
    PolicyValid,
    /// Every required decoy is installed.
    DecoysDeployed,
    /// Every tracing policy is present.
    CaptorsDeployed,
    /// Conjunction of the above.
    Ready,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PolicyValid => write!(f, "PolicyValid"),
            Self::DecoysDeployed => write!(f, "DecoysDeployed"),
            Self::CaptorsDeployed => write!(f, "CaptorsDeployed"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The controller cannot tell.
    Unknown,
}

/// One entry of the status conditions array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// The condition type (unique within the array).
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Current status.
    pub status: ConditionStatus,

    /// Machine-readable reason for the status.
    pub reason: String,

    /// Human-readable detail.
    pub message: String,

    /// When `status` last changed.
    pub last_transition_time: DateTime<Utc>,
}

/// Observed state of a policy: its conditions array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatus {
    /// Conditions keyed by type.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl PolicyStatus {
    /// Look up a condition by type.
    #[must_use]
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Whether the `Ready` condition is `True`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.condition(ConditionType::Ready)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Upsert a condition, advancing `lastTransitionTime` only when the
    /// status flips. Returns true when the stored array changed at all
    /// (status, reason, or message), so callers can skip the API write
    /// for a no-op diff.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let reason = reason.into();
        let message = message.into();

        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status == status && existing.reason == reason && existing.message == message
            {
                return false;
            }
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            return true;
        }

        self.conditions.push(Condition {
            condition_type,
            status,
            reason,
            message,
            last_transition_time: now,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2025-06-01T00:00:00Z".parse().unwrap()
    }

    fn t1() -> DateTime<Utc> {
        "2025-06-01T00:05:00Z".parse().unwrap()
    }

    #[test]
    fn test_set_condition_inserts() {
        let mut status = PolicyStatus::default();
        let changed = status.set_condition(
            ConditionType::PolicyValid,
            ConditionStatus::True,
            "Validated",
            "all traps valid",
            t0(),
        );
        assert!(changed);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_unchanged_condition_is_a_noop() {
        let mut status = PolicyStatus::default();
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::True,
            "Ready",
            "ok",
            t0(),
        );
        let changed = status.set_condition(
            ConditionType::Ready,
            ConditionStatus::True,
            "Ready",
            "ok",
            t1(),
        );
        assert!(!changed);
        assert_eq!(
            status.condition(ConditionType::Ready).unwrap().last_transition_time,
            t0(),
            "lastTransitionTime must not advance on identical writes"
        );
    }

    #[test]
    fn test_transition_time_only_advances_on_status_flip() {
        let mut status = PolicyStatus::default();
        status.set_condition(
            ConditionType::DecoysDeployed,
            ConditionStatus::False,
            "Deploying",
            "0/2 installed",
            t0(),
        );

        // Message-only change: the array changes but the transition time holds.
        let changed = status.set_condition(
            ConditionType::DecoysDeployed,
            ConditionStatus::False,
            "Deploying",
            "1/2 installed",
            t1(),
        );
        assert!(changed);
        let cond = status.condition(ConditionType::DecoysDeployed).unwrap();
        assert_eq!(cond.last_transition_time, t0());

        // Status flip advances it.
        status.set_condition(
            ConditionType::DecoysDeployed,
            ConditionStatus::True,
            "Deployed",
            "2/2 installed",
            t1(),
        );
        let cond = status.condition(ConditionType::DecoysDeployed).unwrap();
        assert_eq!(cond.last_transition_time, t1());
    }

    #[test]
    fn test_is_ready() {
        let mut status = PolicyStatus::default();
        assert!(!status.is_ready());
        status.set_condition(
            ConditionType::Ready,
            ConditionStatus::True,
            "Ready",
            "ok",
            t0(),
        );
        assert!(status.is_ready());
    }
}
