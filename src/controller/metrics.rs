//! Prometheus metrics for the Vault operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `vault_operator_reconcile_duration_seconds` (histogram): pass duration labeled by outcome.
//! - `vault_operator_reconcile_errors_total` (counter): failed passes labeled by error kind.
//! - `vault_operator_probe_results_total` (counter): instance probes labeled by outcome.
//! - `vault_operator_cluster_nodes` (gauge): instances per cluster labeled by state.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::VaultClusterStatus;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// "success" or "error"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error category, e.g. "kube", "tls", "timeout"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    /// "active", "standby", "sealed", or the failure kind
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterNodeLabels {
    pub namespace: String,
    pub name: String,
    pub state: String,
}

/// Histogram tracking reconcile pass duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> =
    Lazy::new(|| {
        fn reconcile_histogram() -> Histogram {
            // 5ms .. ~80s across 15 buckets
            Histogram::new(exponential_buckets(0.005, 2.0, 15))
        }

        Family::new_with_constructor(reconcile_histogram)
    });

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static PROBE_RESULTS_TOTAL: Lazy<Family<ProbeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CLUSTER_NODES: Lazy<Family<ClusterNodeLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "vault_operator_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "vault_operator_reconcile_errors",
        "Reconcile passes that ended in an error",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "vault_operator_probe_results",
        "Instance probe results by outcome",
        PROBE_RESULTS_TOTAL.clone(),
    );
    registry.register(
        "vault_operator_cluster_nodes",
        "Instances per cluster in each lifecycle state",
        CLUSTER_NODES.clone(),
    );

    registry
});

pub fn observe_reconcile_duration_seconds(outcome: &str, seconds: f64) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileLabels {
            outcome: outcome.to_string(),
        })
        .observe(seconds);
}

pub fn inc_reconcile_error(kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            kind: kind.to_string(),
        })
        .inc();
}

pub fn inc_probe_result(outcome: &str) {
    PROBE_RESULTS_TOTAL
        .get_or_create(&ProbeLabels {
            outcome: outcome.to_string(),
        })
        .inc();
}

/// Publish node counts from a freshly written status
pub fn set_cluster_nodes(namespace: &str, name: &str, status: &VaultClusterStatus) {
    let counts = [
        ("available", status.available_nodes.len()),
        ("sealed", status.sealed_nodes.len()),
        ("standby", status.standby_nodes.len()),
        ("active", usize::from(status.active_node.is_some())),
        ("unavailable", status.unavailable_nodes.len()),
    ];

    for (state, count) in counts {
        CLUSTER_NODES
            .get_or_create(&ClusterNodeLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                state: state.to_string(),
            })
            .set(count as i64);
    }
}
