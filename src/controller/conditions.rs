//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Anomaly, AnomalyKind, ClusterPhase, Condition};

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";
pub const CONDITION_TYPE_SPEC_VALID: &str = "SpecValid";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

fn status_str(value: bool) -> &'static str {
    if value {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    }
}

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips; reason, message and
/// observed generation are always refreshed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Refresh Ready, Progressing, Degraded and SpecValid from one aggregation
pub fn apply_phase_conditions(
    conditions: &mut Vec<Condition>,
    phase: ClusterPhase,
    anomalies: &[Anomaly],
    unavailable: usize,
    generation: Option<i64>,
) {
    let phase_reason = phase.to_string();

    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        status_str(phase == ClusterPhase::Running),
        &phase_reason,
        match phase {
            ClusterPhase::Running => "Active instance elected and all replicas answering",
            ClusterPhase::Initializing => "Waiting for the cluster to be initialized",
            ClusterPhase::Sealed => "All reachable instances are sealed",
            ClusterPhase::Unsealing => "Waiting for instances to unseal and elect a leader",
            ClusterPhase::Degraded => "Cluster is degraded",
        },
        generation,
    );

    let progressing = matches!(
        phase,
        ClusterPhase::Initializing | ClusterPhase::Sealed | ClusterPhase::Unsealing
    );
    set_condition(
        conditions,
        CONDITION_TYPE_PROGRESSING,
        status_str(progressing),
        &phase_reason,
        "",
        generation,
    );

    let split_brain = anomalies.iter().find(|a| a.kind == AnomalyKind::SplitBrain);
    let (reason, message) = match (phase, split_brain) {
        (_, Some(anomaly)) => ("SplitBrain", anomaly.message.clone()),
        (ClusterPhase::Degraded, None) if unavailable > 0 => (
            "InstancesUnavailable",
            format!("{unavailable} declared instance(s) not answering"),
        ),
        (ClusterPhase::Degraded, None) => ("Degraded", String::new()),
        _ => ("NoIssues", String::new()),
    };
    set_condition(
        conditions,
        CONDITION_TYPE_DEGRADED,
        status_str(phase == ClusterPhase::Degraded),
        reason,
        &message,
        generation,
    );

    let invalid: Vec<&str> = anomalies
        .iter()
        .filter(|a| a.kind == AnomalyKind::Validation)
        .map(|a| a.message.as_str())
        .collect();
    set_condition(
        conditions,
        CONDITION_TYPE_SPEC_VALID,
        status_str(invalid.is_empty()),
        if invalid.is_empty() { "Valid" } else { "Invalid" },
        &invalid.join("; "),
        generation,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "Running",
            "All good",
            Some(2),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_transition_time_moves_only_on_status_flip() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_READY.to_string(),
            status: CONDITION_STATUS_FALSE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "Sealed".to_string(),
            message: String::new(),
            observed_generation: None,
        }];

        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_FALSE,
            "Unsealing",
            "",
            None,
        );
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, "Unsealing");

        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "Running",
            "",
            None,
        );
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_running_phase_conditions() {
        let mut conditions = Vec::new();
        apply_phase_conditions(&mut conditions, ClusterPhase::Running, &[], 0, Some(1));

        assert!(is_condition_true(&conditions, CONDITION_TYPE_READY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_PROGRESSING));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
        assert!(is_condition_true(&conditions, CONDITION_TYPE_SPEC_VALID));
    }

    #[test]
    fn test_split_brain_conditions() {
        let anomalies = vec![Anomaly::split_brain(vec!["a".into(), "b".into()])];
        let mut conditions = Vec::new();
        apply_phase_conditions(&mut conditions, ClusterPhase::Degraded, &anomalies, 0, None);

        let degraded = find_condition(&conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.status, CONDITION_STATUS_TRUE);
        assert_eq!(degraded.reason, "SplitBrain");
        assert!(degraded.message.contains("a, b"));
    }

    #[test]
    fn test_validation_anomaly_marks_spec_invalid() {
        let anomalies = vec![Anomaly::validation("spec.replicas: must be odd")];
        let mut conditions = Vec::new();
        apply_phase_conditions(&mut conditions, ClusterPhase::Sealed, &anomalies, 0, None);

        let valid = find_condition(&conditions, CONDITION_TYPE_SPEC_VALID).unwrap();
        assert_eq!(valid.status, CONDITION_STATUS_FALSE);
        assert!(valid.message.contains("must be odd"));
        assert!(is_condition_true(&conditions, CONDITION_TYPE_PROGRESSING));
    }
}
