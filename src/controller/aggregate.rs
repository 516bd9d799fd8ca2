//! Status aggregation
//!
//! Folds one pass worth of probe results into a single cluster status.
//! Pure: the same inputs always give the same output.

use std::collections::BTreeSet;

use super::probe::ProbeResult;
use crate::crd::{Anomaly, ClusterPhase};

/// Cluster state derived from one set of probe results
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregation {
    pub phase: ClusterPhase,
    pub available_nodes: Vec<String>,
    pub sealed_nodes: Vec<String>,
    pub standby_nodes: Vec<String>,
    pub active_node: Option<String>,
    pub unavailable_nodes: Vec<String>,
    pub anomalies: Vec<Anomaly>,
    pub initialized: bool,
}

impl Aggregation {
    /// Every instance reported as leader, split-brain contenders included
    pub fn leaders(&self) -> Vec<&str> {
        self.anomalies
            .iter()
            .flat_map(|a| a.nodes.iter().map(String::as_str))
            .chain(self.active_node.as_deref())
            .collect()
    }
}

/// Merge probe results into a status.
///
/// `declared` is every instance the cluster should have; declared ids with
/// no reachable result are reported unavailable. `previously_initialized`
/// carries the marker from the last written status, so a cluster that was
/// initialized once never falls back to `Initializing`.
pub fn aggregate(
    desired_replicas: i32,
    declared: &[String],
    results: &[ProbeResult],
    previously_initialized: bool,
) -> Aggregation {
    let mut available = BTreeSet::new();
    let mut sealed = BTreeSet::new();
    let mut standby = BTreeSet::new();
    let mut active = BTreeSet::new();
    let mut initialized = previously_initialized;

    for result in results.iter().filter(|r| r.reachable) {
        available.insert(result.instance_id.clone());
        if result.sealed {
            sealed.insert(result.instance_id.clone());
            // A sealed instance that does not say otherwise is assumed initialized
            if result.initialized != Some(false) {
                initialized = true;
            }
        } else {
            initialized = true;
            if result.standby {
                standby.insert(result.instance_id.clone());
            } else {
                active.insert(result.instance_id.clone());
            }
        }
    }

    let unavailable: BTreeSet<String> = declared
        .iter()
        .chain(results.iter().filter(|r| !r.reachable).map(|r| &r.instance_id))
        .filter(|id| !available.contains(*id))
        .cloned()
        .collect();

    let mut anomalies = Vec::new();
    let split_brain = active.len() > 1;
    let active_node = if split_brain {
        let contenders: Vec<String> = active.iter().cloned().collect();
        anomalies.push(Anomaly::split_brain(contenders));
        // Contenders stay in the available partition without a leader slot
        standby.extend(std::mem::take(&mut active));
        None
    } else {
        active.into_iter().next()
    };

    let unsealed = standby.len() + usize::from(active_node.is_some());
    let reachable = available.len();
    let desired = usize::try_from(desired_replicas).unwrap_or(0);

    let phase = if split_brain {
        ClusterPhase::Degraded
    } else if !initialized {
        ClusterPhase::Initializing
    } else if reachable == 0 {
        ClusterPhase::Degraded
    } else if unsealed == 0 {
        ClusterPhase::Sealed
    } else if !sealed.is_empty() {
        ClusterPhase::Unsealing
    } else if active_node.is_none() {
        ClusterPhase::Unsealing
    } else if reachable < desired {
        ClusterPhase::Degraded
    } else {
        ClusterPhase::Running
    };

    Aggregation {
        phase,
        available_nodes: available.into_iter().collect(),
        sealed_nodes: sealed.into_iter().collect(),
        standby_nodes: standby.into_iter().collect(),
        active_node,
        unavailable_nodes: unavailable.into_iter().collect(),
        anomalies,
        initialized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::probe::ProbeError;
    use crate::crd::AnomalyKind;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("vault-{i}")).collect()
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_all_sealed() {
        let results: Vec<_> = ids(3)
            .into_iter()
            .map(|id| ProbeResult::sealed(id, true))
            .collect();

        let agg = aggregate(3, &ids(3), &results, false);

        assert_eq!(agg.phase, ClusterPhase::Sealed);
        assert_eq!(agg.active_node, None);
        assert_eq!(agg.sealed_nodes, ids(3));
        assert_eq!(agg.available_nodes, ids(3));
        assert!(agg.unavailable_nodes.is_empty());
    }

    #[test]
    fn test_one_leader_two_standby_is_running() {
        let results = vec![
            ProbeResult::unsealed("vault-0", true),
            ProbeResult::unsealed("vault-1", false),
            ProbeResult::unsealed("vault-2", true),
        ];

        let agg = aggregate(3, &ids(3), &results, true);

        assert_eq!(agg.phase, ClusterPhase::Running);
        assert_eq!(agg.active_node.as_deref(), Some("vault-1"));
        assert_eq!(agg.standby_nodes, names(&["vault-0", "vault-2"]));
        assert!(agg.anomalies.is_empty());
    }

    #[test]
    fn test_two_leaders_is_split_brain() {
        let results = vec![
            ProbeResult::unsealed("vault-0", false),
            ProbeResult::unsealed("vault-1", false),
            ProbeResult::unsealed("vault-2", true),
        ];

        let agg = aggregate(3, &ids(3), &results, true);

        assert_eq!(agg.phase, ClusterPhase::Degraded);
        assert_eq!(agg.active_node, None);
        assert_eq!(agg.anomalies.len(), 1);
        assert_eq!(agg.anomalies[0].kind, AnomalyKind::SplitBrain);
        assert_eq!(agg.anomalies[0].nodes, names(&["vault-0", "vault-1"]));
        assert_eq!(agg.standby_nodes, ids(3));
        assert_eq!(agg.leaders(), vec!["vault-0", "vault-1"]);
    }

    #[test]
    fn test_timed_out_instance_is_unavailable() {
        let results = vec![
            ProbeResult::unsealed("vault-0", false),
            ProbeResult::unsealed("vault-1", true),
            ProbeResult::unreachable("vault-2", ProbeError::Timeout),
        ];

        let agg = aggregate(3, &ids(3), &results, true);

        assert_eq!(agg.unavailable_nodes, names(&["vault-2"]));
        assert_eq!(agg.available_nodes, names(&["vault-0", "vault-1"]));
        assert_eq!(agg.phase, ClusterPhase::Degraded);
        assert_eq!(agg.active_node.as_deref(), Some("vault-0"));
    }

    #[test]
    fn test_declared_but_never_probed_is_unavailable() {
        let results = vec![ProbeResult::sealed("vault-0", true)];
        let agg = aggregate(3, &ids(3), &results, true);
        assert_eq!(agg.unavailable_nodes, names(&["vault-1", "vault-2"]));
    }

    #[test]
    fn test_uninitialized_cluster() {
        let results: Vec<_> = ids(3)
            .into_iter()
            .map(|id| ProbeResult::sealed(id, false))
            .collect();

        let agg = aggregate(3, &ids(3), &results, false);

        assert_eq!(agg.phase, ClusterPhase::Initializing);
        assert!(!agg.initialized);
        assert_eq!(agg.sealed_nodes.len(), 3);
    }

    #[test]
    fn test_initialized_marker_survives_restart() {
        // After a full restart instances report sealed, but init happened before
        let results: Vec<_> = ids(3)
            .into_iter()
            .map(|id| ProbeResult::sealed(id, false))
            .collect();
        let agg = aggregate(3, &ids(3), &results, true);
        assert_eq!(agg.phase, ClusterPhase::Sealed);
        assert!(agg.initialized);
    }

    #[test]
    fn test_nothing_reachable_on_new_cluster_is_initializing() {
        let results = vec![ProbeResult::unreachable(
            "vault-0",
            ProbeError::Connect("refused".into()),
        )];
        let agg = aggregate(1, &ids(1), &results, false);
        assert_eq!(agg.phase, ClusterPhase::Initializing);
        assert_eq!(agg.unavailable_nodes, ids(1));
    }

    #[test]
    fn test_nothing_reachable_after_init_is_degraded() {
        let agg = aggregate(3, &ids(3), &[], true);
        assert_eq!(agg.phase, ClusterPhase::Degraded);
        assert_eq!(agg.unavailable_nodes, ids(3));
    }

    #[test]
    fn test_partially_unsealed_is_unsealing() {
        let results = vec![
            ProbeResult::unsealed("vault-0", false),
            ProbeResult::sealed("vault-1", true),
        ];
        let agg = aggregate(1, &names(&["vault-0", "vault-1"]), &results, true);
        assert_eq!(agg.phase, ClusterPhase::Unsealing);
        assert_eq!(agg.active_node.as_deref(), Some("vault-0"));
        assert_eq!(agg.sealed_nodes, names(&["vault-1"]));
    }

    #[test]
    fn test_unsealed_without_leader_is_unsealing() {
        let results = vec![ProbeResult::unsealed("vault-0", true)];
        let agg = aggregate(1, &ids(1), &results, true);
        assert_eq!(agg.phase, ClusterPhase::Unsealing);
        assert_eq!(agg.active_node, None);
    }

    #[test]
    fn test_results_order_does_not_matter() {
        let mut results = vec![
            ProbeResult::unsealed("vault-2", true),
            ProbeResult::sealed("vault-0", true),
            ProbeResult::unsealed("vault-1", false),
        ];
        let a = aggregate(3, &ids(3), &results, true);
        results.reverse();
        let b = aggregate(3, &ids(3), &results, true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_undeclared_instance_still_counted() {
        // A pod pending deletion still answers probes
        let results = vec![
            ProbeResult::unsealed("vault-0", false),
            ProbeResult::unsealed("vault-3", true),
        ];
        let agg = aggregate(1, &ids(1), &results, true);
        assert_eq!(agg.available_nodes, names(&["vault-0", "vault-3"]));
        assert_eq!(agg.phase, ClusterPhase::Running);
    }
}
