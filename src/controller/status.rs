//! Status composition and resourceVersion-guarded status writes

use std::future::Future;

use chrono::Utc;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, warn};

use super::aggregate::Aggregation;
use super::conditions::apply_phase_conditions;
use crate::crd::{Anomaly, VaultCluster, VaultClusterStatus};
use crate::error::{Error, Result};

/// Build the status to publish from this pass's aggregation
///
/// Conditions and the CA fingerprint carry over from `previous` so that
/// transition times survive and a pass that skipped TLS keeps the last
/// known fingerprint.
pub fn compose_status(
    previous: Option<&VaultClusterStatus>,
    aggregation: Aggregation,
    extra_anomalies: Vec<Anomaly>,
    next_ordinal: i32,
    ca_fingerprint: Option<String>,
    generation: Option<i64>,
) -> VaultClusterStatus {
    let mut anomalies = extra_anomalies;
    anomalies.extend(aggregation.anomalies);

    let mut conditions = previous.map(|p| p.conditions.clone()).unwrap_or_default();
    apply_phase_conditions(
        &mut conditions,
        aggregation.phase,
        &anomalies,
        aggregation.unavailable_nodes.len(),
        generation,
    );

    VaultClusterStatus {
        phase: aggregation.phase,
        available_nodes: aggregation.available_nodes,
        sealed_nodes: aggregation.sealed_nodes,
        standby_nodes: aggregation.standby_nodes,
        active_node: aggregation.active_node,
        unavailable_nodes: aggregation.unavailable_nodes,
        anomalies,
        initialized: aggregation.initialized,
        next_ordinal: next_ordinal.max(previous.map_or(0, |p| p.next_ordinal)),
        ca_fingerprint: ca_fingerprint.or_else(|| previous.and_then(|p| p.ca_fingerprint.clone())),
        observed_generation: generation,
        conditions,
        last_probe_time: Some(Utc::now().to_rfc3339()),
    }
}

/// Run `attempt` until it succeeds, fails with something other than a
/// conflict, or `max_attempts` conflicts in a row have been seen.
///
/// The closure receives the 1-based attempt number.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut n = 0;
    loop {
        n += 1;
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                if n >= max_attempts {
                    warn!("Status write still conflicting after {} attempts", n);
                    return Err(Error::StatusConflict { attempts: n });
                }
                debug!("Status write conflicted on attempt {}, retrying", n);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Merge patch body carrying the status and, when known, the resourceVersion
/// precondition the API server checks
///
/// A merge patch keeps fields it does not mention, so a cleared leader is
/// sent as an explicit null.
pub fn status_patch(status: &VaultClusterStatus, resource_version: Option<&str>) -> serde_json::Value {
    let mut body = json!(status);
    if status.active_node.is_none() {
        body["activeNode"] = serde_json::Value::Null;
    }
    match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": body }),
        None => json!({ "status": body }),
    }
}

/// Write `status` guarded by `resource_version`. On conflict, re-read the
/// object and retry the same status against the fresh resourceVersion.
pub async fn write_status(
    api: &Api<VaultCluster>,
    name: &str,
    status: &VaultClusterStatus,
    resource_version: Option<&str>,
    max_attempts: u32,
) -> Result<VaultCluster> {
    retry_on_conflict(max_attempts, |attempt| async move {
        let rv = if attempt == 1 {
            resource_version.map(str::to_string)
        } else {
            api.get_status(name).await?.metadata.resource_version
        };

        let patch = status_patch(status, rv.as_deref());
        let updated = api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(updated)
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::controller::probe::ProbeResult;
    use crate::controller::aggregate::aggregate;
    use crate::crd::ClusterPhase;

    fn conflict() -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_conflicts() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(5, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(conflict())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(4, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::StatusConflict { attempts: 4 }));
        assert!(err.is_retriable());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_conflict_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(5, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Tls("bad".into())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Tls(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_patch_carries_resource_version() {
        let status = VaultClusterStatus::default();
        let patch = status_patch(&status, Some("42"));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["phase"], "Initializing");

        let unguarded = status_patch(&status, None);
        assert!(unguarded.get("metadata").is_none());
    }

    #[test]
    fn test_patch_clears_lost_leader() {
        let status = VaultClusterStatus::default();
        let patch = status_patch(&status, None);
        assert!(patch["status"]["activeNode"].is_null());
        assert!(patch["status"].as_object().unwrap().contains_key("activeNode"));

        let led = VaultClusterStatus {
            active_node: Some("vault-0".to_string()),
            ..Default::default()
        };
        assert_eq!(status_patch(&led, None)["status"]["activeNode"], "vault-0");
    }

    #[test]
    fn test_compose_keeps_previous_fingerprint_and_ordinal() {
        let previous = VaultClusterStatus {
            next_ordinal: 7,
            ca_fingerprint: Some("abc".to_string()),
            ..Default::default()
        };
        let agg = aggregate(1, &["vault-6".to_string()], &[ProbeResult::unsealed("vault-6", false)], true);

        let status = compose_status(Some(&previous), agg, Vec::new(), 3, None, Some(4));

        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.next_ordinal, 7);
        assert_eq!(status.ca_fingerprint.as_deref(), Some("abc"));
        assert_eq!(status.observed_generation, Some(4));
        assert!(status.last_probe_time.is_some());
        assert!(!status.conditions.is_empty());
    }

    #[test]
    fn test_compose_lists_extra_anomalies_first() {
        let agg = aggregate(
            3,
            &[],
            &[
                ProbeResult::unsealed("vault-0", false),
                ProbeResult::unsealed("vault-1", false),
            ],
            true,
        );
        let status = compose_status(
            None,
            agg,
            vec![Anomaly::validation("spec.replicas: must be odd")],
            0,
            None,
            None,
        );

        assert_eq!(status.anomalies.len(), 2);
        assert_eq!(status.anomalies[0].kind, crate::crd::AnomalyKind::Validation);
        assert!(status.has_split_brain());
    }
}
