//! Status conditions accumulated during a reconcile and folded into the `Ready`/`Updating`
//! pair the engine writes back via `setStatus`: canonical reasons and `lastTransitionTime`
//! preservation, styled after `kube_runtime::conditions`-style condition bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tri-state condition status, matching the Kubernetes API convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Canonical reasons the engine assigns to `Ready`/`Updating` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    Stable,
    InProgress,
    Initializing,
    ConfigError,
    PreconditionError,
    VerificationError,
    ClusterError,
    RolloutError,
    Errored,
    Finalizing,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub const READY_TYPE: &str = "Ready";
pub const UPDATING_TYPE: &str = "Updating";

/// A single status condition, mirroring the Kubernetes condition shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    #[must_use]
    pub fn new(condition_type: impl Into<String>, status: ConditionStatus, reason: Reason, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: now,
        }
    }

    /// Replace `self` with `next`, preserving `lastTransitionTime` when the reason is
    /// unchanged.
    #[must_use]
    pub fn transition(&self, next_status: ConditionStatus, next_reason: Reason, next_message: impl Into<String>, now: DateTime<Utc>) -> Self {
        let next_reason_str = next_reason.to_string();
        let last_transition_time = if self.reason == next_reason_str { self.last_transition_time } else { now };
        Self {
            condition_type: self.condition_type.clone(),
            status: next_status,
            reason: next_reason_str,
            message: next_message.into(),
            last_transition_time,
        }
    }
}

/// Per-component rollout outcome used to fold the aggregate `Ready`/`Updating` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentOutcome {
    Verified,
    Unverified,
    Disabled,
    Failed(Failure),
}

/// The failure taxonomy surfaced to controllers and folded into status conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    ConfigError,
    PreconditionError,
    VerificationError,
    ClusterError,
    RolloutError,
    Errored,
}

impl Failure {
    #[must_use]
    pub fn reason(self) -> Reason {
        match self {
            Self::ConfigError => Reason::ConfigError,
            Self::PreconditionError => Reason::PreconditionError,
            Self::VerificationError => Reason::VerificationError,
            Self::ClusterError => Reason::ClusterError,
            Self::RolloutError => Reason::RolloutError,
            Self::Errored => Reason::Errored,
        }
    }

    /// Whether a reconcile should be requeued by default given this failure class.
    #[must_use]
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::ConfigError)
    }
}

/// Fold per-component outcomes into the aggregate `(Ready, Updating)` reason pair. Ties
/// among failures are broken by taxonomy severity, preferring the first classified failure
/// encountered in iteration order for determinism.
#[must_use]
pub fn aggregate_reason(outcomes: &[ComponentOutcome]) -> (ConditionStatus, Reason, ConditionStatus, Reason) {
    if let Some(failure) = outcomes.iter().find_map(|o| match o {
        ComponentOutcome::Failed(f) => Some(*f),
        _ => None,
    }) {
        let reason = failure.reason();
        return (ConditionStatus::False, reason, ConditionStatus::False, reason);
    }
    if outcomes.iter().any(|o| matches!(o, ComponentOutcome::Unverified)) {
        return (
            ConditionStatus::False,
            Reason::InProgress,
            ConditionStatus::True,
            Reason::InProgress,
        );
    }
    (ConditionStatus::True, Reason::Stable, ConditionStatus::False, Reason::Stable)
}

/// Build the next `Ready`/`Updating` condition pair, preserving `lastTransitionTime` on
/// each when its reason is unchanged from `previous`.
#[must_use]
pub fn compute_status(previous: &[Condition], outcomes: &[ComponentOutcome], now: DateTime<Utc>) -> Vec<Condition> {
    let (ready_status, ready_reason, updating_status, updating_reason) = aggregate_reason(outcomes);

    let ready_message = match ready_reason {
        Reason::Stable => "all components deployed and verified".to_string(),
        other => format!("not ready: {other}"),
    };
    let updating_message = match updating_reason {
        Reason::InProgress => "rollout in progress".to_string(),
        Reason::Stable => "no updates in progress".to_string(),
        other => format!("updating blocked: {other}"),
    };

    let mut conditions = Vec::with_capacity(previous.len().max(2));
    conditions.push(next_condition(previous, READY_TYPE, ready_status, ready_reason, ready_message, now));
    conditions.push(next_condition(previous, UPDATING_TYPE, updating_status, updating_reason, updating_message, now));

    for existing in previous {
        if existing.condition_type != READY_TYPE && existing.condition_type != UPDATING_TYPE {
            conditions.push(existing.clone());
        }
    }
    conditions
}

fn next_condition(previous: &[Condition], condition_type: &str, status: ConditionStatus, reason: Reason, message: String, now: DateTime<Utc>) -> Condition {
    match previous.iter().find(|c| c.condition_type == condition_type) {
        Some(existing) => existing.transition(status, reason, message, now),
        None => Condition::new(condition_type, status, reason, message, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn all_verified_yields_stable_ready() {
        let outcomes = [ComponentOutcome::Verified, ComponentOutcome::Verified];
        let (ready_status, ready_reason, updating_status, _) = aggregate_reason(&outcomes);
        assert_eq!(ready_status, ConditionStatus::True);
        assert_eq!(ready_reason, Reason::Stable);
        assert_eq!(updating_status, ConditionStatus::False);
    }

    #[test]
    fn unverified_component_yields_in_progress() {
        let outcomes = [ComponentOutcome::Verified, ComponentOutcome::Unverified];
        let (ready_status, ready_reason, updating_status, updating_reason) = aggregate_reason(&outcomes);
        assert_eq!(ready_status, ConditionStatus::False);
        assert_eq!(ready_reason, Reason::InProgress);
        assert_eq!(updating_status, ConditionStatus::True);
        assert_eq!(updating_reason, Reason::InProgress);
    }

    #[test]
    fn classified_failure_propagates_reason() {
        let outcomes = [ComponentOutcome::Failed(Failure::ClusterError)];
        let (ready_status, ready_reason, ..) = aggregate_reason(&outcomes);
        assert_eq!(ready_status, ConditionStatus::False);
        assert_eq!(ready_reason, Reason::ClusterError);
    }

    #[test]
    fn last_transition_time_preserved_when_reason_unchanged() {
        let previous = vec![Condition::new(READY_TYPE, ConditionStatus::True, Reason::Stable, "ok", t(100))];
        let outcomes = [ComponentOutcome::Verified];
        let next = compute_status(&previous, &outcomes, t(200));
        let ready = next.iter().find(|c| c.condition_type == READY_TYPE).unwrap();
        assert_eq!(ready.last_transition_time, t(100));
    }

    #[test]
    fn last_transition_time_updates_when_reason_changes() {
        let previous = vec![Condition::new(READY_TYPE, ConditionStatus::True, Reason::Stable, "ok", t(100))];
        let outcomes = [ComponentOutcome::Failed(Failure::RolloutError)];
        let next = compute_status(&previous, &outcomes, t(200));
        let ready = next.iter().find(|c| c.condition_type == READY_TYPE).unwrap();
        assert_eq!(ready.last_transition_time, t(200));
        assert_eq!(ready.reason, "RolloutError");
    }

    #[test]
    fn non_ready_updating_conditions_survive_unchanged() {
        let previous = vec![
            Condition::new(READY_TYPE, ConditionStatus::True, Reason::Stable, "ok", t(1)),
            Condition::new("CustomSubsystem", ConditionStatus::True, Reason::Stable, "fine", t(1)),
        ];
        let outcomes = [ComponentOutcome::Verified];
        let next = compute_status(&previous, &outcomes, t(2));
        assert!(next.iter().any(|c| c.condition_type == "CustomSubsystem"));
    }
}
