//! The status machine.
//!
//! Each reconcile pass is summarized into a [`PassOutcome`]; this
//! module folds the outcome into the policy's conditions array. The
//! fold is diff-minimized by construction (see
//! [`koney_core::api::PolicyStatus::set_condition`]): unchanged
//! conditions produce no write, and transition times advance only on
//! status flips.

use chrono::{DateTime, Utc};
use koney_core::api::{
    ConditionStatus, ConditionType, PolicyStatus, TrapRejection,
};

/// Deployment summary for one trap.
#[derive(Debug, Default)]
pub struct TrapOutcome {
    /// Trap index in the spec.
    pub index: usize,

    /// Targets whose decoy is present after the pass.
    pub satisfied_targets: usize,

    /// Planned targets.
    pub total_targets: usize,

    /// Per-container failures recorded during the pass.
    pub failure_count: usize,
}

/// Everything a pass learned, ready to be folded into conditions.
#[derive(Debug, Default)]
pub struct PassOutcome {
    /// Validation rejections.
    pub rejections: Vec<TrapRejection>,

    /// Strict mode blocked deployment entirely.
    pub blocked_by_validation: bool,

    /// Per-trap decoy summaries (valid traps only).
    pub traps: Vec<TrapOutcome>,

    /// Tracing policies present after the pass.
    pub captors_present: usize,

    /// Captor install failures, rendered.
    pub captor_failures: Vec<String>,
}

impl PassOutcome {
    fn decoys_ok(&self) -> bool {
        self.traps
            .iter()
            .all(|t| t.satisfied_targets == t.total_targets && t.failure_count == 0)
    }

    fn decoy_breakdown(&self) -> String {
        if self.traps.is_empty() {
            return "no traps to deploy".to_string();
        }
        self.traps
            .iter()
            .map(|t| {
                format!(
                    "trap[{}]: {}/{} workloads",
                    t.index, t.satisfied_targets, t.total_targets
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Fold a pass outcome into the conditions array. Returns whether the
/// array changed and therefore needs a status write.
pub fn apply_conditions(
    status: &mut PolicyStatus,
    outcome: &PassOutcome,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = false;

    let valid = outcome.rejections.is_empty();
    changed |= if valid {
        status.set_condition(
            ConditionType::PolicyValid,
            ConditionStatus::True,
            "Validated",
            "all traps passed validation",
            now,
        )
    } else {
        let message = outcome
            .rejections
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        status.set_condition(
            ConditionType::PolicyValid,
            ConditionStatus::False,
            "PolicyInvalid",
            message,
            now,
        )
    };

    let (decoys, decoys_reason, decoys_message) = if outcome.blocked_by_validation {
        (
            ConditionStatus::False,
            "ValidationBlocked",
            "strict validation failed; nothing deployed".to_string(),
        )
    } else if outcome.decoys_ok() {
        (
            ConditionStatus::True,
            "Deployed",
            outcome.decoy_breakdown(),
        )
    } else {
        (
            ConditionStatus::False,
            "DeployIncomplete",
            outcome.decoy_breakdown(),
        )
    };
    changed |= status.set_condition(
        ConditionType::DecoysDeployed,
        decoys,
        decoys_reason,
        decoys_message,
        now,
    );

    let (captors, captors_reason, captors_message) = if outcome.blocked_by_validation {
        (
            ConditionStatus::False,
            "ValidationBlocked",
            "strict validation failed; nothing deployed".to_string(),
        )
    } else if outcome.captor_failures.is_empty() {
        (
            ConditionStatus::True,
            "Deployed",
            format!("{} tracing policies present", outcome.captors_present),
        )
    } else {
        (
            ConditionStatus::False,
            "CaptorInstallError",
            outcome.captor_failures.join("; "),
        )
    };
    changed |= status.set_condition(
        ConditionType::CaptorsDeployed,
        captors,
        captors_reason,
        captors_message,
        now,
    );

    let ready = valid
        && !outcome.blocked_by_validation
        && outcome.decoys_ok()
        && outcome.captor_failures.is_empty();
    changed |= status.set_condition(
        ConditionType::Ready,
        if ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        if ready { "Ready" } else { "NotReady" },
        if ready {
            "decoys and captors deployed".to_string()
        } else {
            "see PolicyValid, DecoysDeployed, CaptorsDeployed".to_string()
        },
        now,
    );

    changed
}

#[cfg(test)]
mod tests {
    use koney_core::api::ValidationError;

    use super::*;

    fn successful_outcome() -> PassOutcome {
        PassOutcome {
            rejections: Vec::new(),
            blocked_by_validation: false,
            traps: vec![TrapOutcome {
                index: 0,
                satisfied_targets: 1,
                total_targets: 1,
                failure_count: 0,
            }],
            captors_present: 1,
            captor_failures: Vec::new(),
        }
    }

    #[test]
    fn test_ready_when_everything_deployed() {
        let mut status = PolicyStatus::default();
        let changed = apply_conditions(&mut status, &successful_outcome(), Utc::now());
        assert!(changed);
        assert!(status.is_ready());
        assert_eq!(
            status
                .condition(ConditionType::DecoysDeployed)
                .unwrap()
                .message,
            "trap[0]: 1/1 workloads"
        );
    }

    #[test]
    fn test_second_identical_fold_is_a_noop() {
        let mut status = PolicyStatus::default();
        let now = Utc::now();
        apply_conditions(&mut status, &successful_outcome(), now);
        let changed = apply_conditions(&mut status, &successful_outcome(), now);
        assert!(!changed);
    }

    #[test]
    fn test_strict_validation_blocks_everything() {
        let mut status = PolicyStatus::default();
        let outcome = PassOutcome {
            rejections: vec![TrapRejection {
                index: 0,
                error: ValidationError::MissingFilePath,
            }],
            blocked_by_validation: true,
            ..PassOutcome::default()
        };
        apply_conditions(&mut status, &outcome, Utc::now());

        let valid = status.condition(ConditionType::PolicyValid).unwrap();
        assert_eq!(valid.status, ConditionStatus::False);
        assert_eq!(valid.reason, "PolicyInvalid");
        assert!(!status.is_ready());
    }

    #[test]
    fn test_captor_failures_surface() {
        let mut status = PolicyStatus::default();
        let outcome = PassOutcome {
            captor_failures: vec!["trap[0]: probe host rejected the policy".to_string()],
            ..successful_outcome()
        };
        apply_conditions(&mut status, &outcome, Utc::now());
        let captors = status.condition(ConditionType::CaptorsDeployed).unwrap();
        assert_eq!(captors.status, ConditionStatus::False);
        assert_eq!(captors.reason, "CaptorInstallError");
    }
}
