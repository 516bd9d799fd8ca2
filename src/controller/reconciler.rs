//! Main reconciler for VaultCluster resources
//!
//! Implements the controller pattern using kube-rs runtime. The runtime
//! never runs two passes for the same object at once; triggers arriving
//! mid-pass are coalesced into one follow-up pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        predicates, reflector, watcher, WatchStreamExt,
    },
    Resource, ResourceExt,
};
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use super::aggregate::aggregate;
use super::probe::{probe_all, HttpsProber, ProbeResult, ProbeTarget};
use super::resources;
use super::sizer::{self, LastSeen, ObservedInstance, ScalePlan, SizingAction};
use super::status::{compose_status, write_status};
use super::tls::{
    ca_fingerprint, CertPolicy, KubeSecretStore, SecretStore, TrustBundle, TrustManager,
};
use crate::config::OperatorConfig;
use crate::crd::{Anomaly, AnomalyKind, VaultCluster, VaultClusterStatus};
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
use super::metrics;

/// Requeue delay after a transient failure
const TRANSIENT_RETRY: Duration = Duration::from_secs(5);
/// Requeue delay after any other failure
const ERROR_RETRY: Duration = Duration::from_secs(30);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.config.namespace.clone();
    let clusters: Api<VaultCluster> = scoped_api(&client, namespace.as_deref());

    info!(
        "Starting VaultCluster controller (namespace: {})",
        namespace.as_deref().unwrap_or("<all>")
    );

    match clusters.list(&Default::default()).await {
        Ok(_) => info!("VaultCluster CRD is available"),
        Err(e) => {
            error!(
                "VaultCluster CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "VaultCluster CRD not installed".to_string(),
            ));
        }
    }

    // Status writes bump resourceVersion but not generation; only spec
    // changes of the cluster itself trigger a pass. Owned objects and the
    // resync tick cover everything else.
    let (reader, writer) = reflector::store();
    let triggers = watcher(clusters, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    let ns = namespace.as_deref();
    Controller::for_stream(triggers, reader)
        .owns::<Pod>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<Service>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<ConfigMap>(scoped_api(&client, ns), watcher::Config::default())
        .owns::<Secret>(scoped_api(&client, ns), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {}", obj.name),
                Err(e) => warn!("Reconcile error: {}", e),
            }
        })
        .await;

    Ok(())
}

/// Emit a Kubernetes Event. Events are best-effort; failures are only logged.
async fn emit_event(
    client: &Client,
    cluster: &VaultCluster,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", cluster.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: cluster.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    if let Err(e) = events.create(&PostParams::default(), &event).await {
        warn!("Failed to emit {} event {}: {}", event_type, reason, e);
    }
}

/// The main reconciliation function
///
/// Called whenever a VaultCluster or one of its owned objects changes, and
/// on every resync tick. The pass runs under an outer deadline; a pass that
/// overruns writes no status and is retried.
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub(crate) async fn reconcile(obj: Arc<VaultCluster>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let deadline = ctx.config.pass_deadline;

    let result = match tokio::time::timeout(deadline, reconcile_pass(&ctx, &obj)).await {
        Ok(result) => result,
        Err(_) => Err(Error::PassTimeout(deadline)),
    };

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(
        if result.is_ok() { "success" } else { "error" },
        started.elapsed().as_secs_f64(),
    );
    debug!("Pass finished in {:?}", started.elapsed());

    result?;
    Ok(Action::requeue(jittered(ctx.config.resync_interval)))
}

/// What a pass decided before touching the workload
pub(crate) struct PassDecision {
    /// Structural anomalies found this pass
    pub anomalies: Vec<Anomaly>,
    /// Sizing and issuance held back
    pub paused: bool,
    pub plan: ScalePlan,
    /// Instances the cluster should have once the plan is applied
    pub declared: Vec<String>,
    pub targets: Vec<ProbeTarget>,
    /// Trust material to probe with; `None` before anything was issued
    pub bundle: Option<TrustBundle>,
    /// Set only when the CA was confirmed this pass
    pub fingerprint: Option<String>,
}

/// One reconcile pass: size the workload, manage TLS, probe, publish status
async fn reconcile_pass(ctx: &ControllerState, cluster: &VaultCluster) -> Result<()> {
    let client = &ctx.client;
    let config = &ctx.config;
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

    info!("Reconciling VaultCluster {}/{}", namespace, name);

    let pods = resources::list_instance_pods(client, cluster).await?;
    let observed = resources::observe_instances(&pods);

    let trust = TrustManager::new(
        KubeSecretStore::new(client, cluster)?,
        name.clone(),
        namespace.clone(),
        cluster.spec.tls_config.clone(),
        CertPolicy {
            leaf_validity: config.cert_validity,
            ..Default::default()
        },
    );

    let decision = match decide_pass(cluster, &namespace, &observed, &trust).await {
        Ok(decision) => decision,
        Err(e) => {
            error!("TLS management failed for {}/{}: {}", namespace, name, e);
            emit_event(client, cluster, "Warning", "TlsFailed", &e.status_message()).await;
            return Err(e);
        }
    };

    if !decision.paused {
        resources::ensure_service(client, cluster).await?;
        resources::ensure_config_map(client, cluster).await?;
    }

    let workload = KubeWorkload { client, cluster };
    let outcomes = apply_plan(&workload, &decision.plan).await;
    report_sizing(client, cluster, outcomes).await;
    clean_up_finished_pods(client, cluster, &pods).await;

    let results = match &decision.bundle {
        Some(bundle) => {
            let prober = HttpsProber::new(bundle, config.probe_timeout)?;
            probe_all(
                &prober,
                &decision.targets,
                config.max_concurrent_probes,
                config.probe_timeout,
            )
            .await
        }
        None => {
            warn!("No trust material for {}/{} yet, skipping probes", namespace, name);
            Vec::new()
        }
    };
    record_probe_results(&results);

    let status = conclude_pass(cluster, decision, &results);
    announce_transitions(client, cluster, &status).await;

    let api: Api<VaultCluster> = Api::namespaced(client.clone(), &namespace);
    write_status(
        &api,
        &name,
        &status,
        cluster.resource_version().as_deref(),
        config.status_write_attempts,
    )
    .await?;

    #[cfg(feature = "metrics")]
    metrics::set_cluster_nodes(&namespace, &name, &status);

    info!(
        "VaultCluster {}/{} is {} (active: {}, sealed: {}, unavailable: {})",
        namespace,
        name,
        status.phase,
        status.active_node.as_deref().unwrap_or("-"),
        status.sealed_nodes.len(),
        status.unavailable_nodes.len()
    );
    Ok(())
}

/// Validate, size and issue trust material for one pass.
///
/// An invalid spec or an unusable CA issuer records an anomaly and holds
/// back sizing and issuance; probing then falls back to the client secret
/// from an earlier pass. Any other TLS failure is returned.
pub(crate) async fn decide_pass<S: SecretStore>(
    cluster: &VaultCluster,
    namespace: &str,
    observed: &[ObservedInstance],
    trust: &TrustManager<S>,
) -> Result<PassDecision> {
    let name = cluster.name_any();
    let previous = cluster.status.as_ref();
    let previous_next = previous.map_or(0, |s| s.next_ordinal);

    let mut anomalies = Vec::new();
    if let Err(errors) = cluster.spec.validate() {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!("Validation failed for {}/{}: {}", namespace, name, message);
        anomalies.extend(errors.iter().map(|e| Anomaly::validation(e.to_string())));
    }

    let mut plan = ScalePlan {
        actions: Vec::new(),
        next_ordinal: previous_next,
    };
    let mut issued = None;

    if anomalies.is_empty() {
        let proposed = sizer::plan(
            &name,
            cluster.spec.replicas,
            observed,
            &LastSeen::from_status(previous),
            previous_next,
            &cluster.spec.image(),
        );

        // Certificates exist before the pods that mount them
        match ensure_trust(trust, &declared_instances(observed, &proposed)).await {
            Ok(material) => {
                issued = Some(material);
                plan = proposed;
            }
            Err(Error::TlsIssuer(message)) => {
                warn!("CA issuer for {}/{} unusable: {}", namespace, name, message);
                anomalies.push(Anomaly::tls(message));
            }
            Err(e) => return Err(e),
        }
    }

    let (bundle, fingerprint) = match issued {
        Some((bundle, fingerprint)) => (Some(bundle), Some(fingerprint)),
        None => (trust.load_trust_bundle().await?, None),
    };

    Ok(PassDecision {
        paused: !anomalies.is_empty(),
        declared: declared_instances(observed, &plan),
        targets: probe_targets(&name, namespace, observed, &plan),
        anomalies,
        plan,
        bundle,
        fingerprint,
    })
}

/// Aggregate probe results into the status this pass publishes
pub(crate) fn conclude_pass(
    cluster: &VaultCluster,
    decision: PassDecision,
    results: &[ProbeResult],
) -> VaultClusterStatus {
    let previous = cluster.status.as_ref();
    let aggregation = aggregate(
        cluster.spec.replicas,
        &decision.declared,
        results,
        previous.map_or(false, |s| s.initialized),
    );

    compose_status(
        previous,
        aggregation,
        decision.anomalies,
        decision.plan.next_ordinal,
        decision.fingerprint,
        cluster.metadata.generation,
    )
}

/// Ensure the CA, every instance certificate and the client certificate
async fn ensure_trust<S: SecretStore>(
    trust: &TrustManager<S>,
    instances: &[String],
) -> Result<(TrustBundle, String)> {
    let ca = trust.ensure_ca().await?;
    for instance in instances {
        trust.ensure_instance_cert(&ca, instance).await?;
    }
    let client = trust.ensure_client_cert(&ca).await?;
    let fingerprint = ca_fingerprint(ca.cert_pem().as_bytes())?;
    Ok((trust.trust_bundle(&ca, &client), fingerprint))
}

/// Creates and removes instance pods
#[async_trait]
pub(crate) trait Workload: Send + Sync {
    async fn create(&self, instance_id: &str, ordinal: i32) -> Result<()>;
    async fn delete(&self, instance_id: &str) -> Result<()>;
}

struct KubeWorkload<'a> {
    client: &'a Client,
    cluster: &'a VaultCluster,
}

#[async_trait]
impl<'a> Workload for KubeWorkload<'a> {
    async fn create(&self, instance_id: &str, ordinal: i32) -> Result<()> {
        resources::create_instance_pod(self.client, self.cluster, instance_id, ordinal).await
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        resources::delete_instance_pod(self.client, self.cluster, instance_id).await
    }
}

/// Apply every sizing action, in order. A failed action does not stop the
/// rest; the next pass plans again from what actually exists.
pub(crate) async fn apply_plan<'p, W>(
    workload: &W,
    plan: &'p ScalePlan,
) -> Vec<(&'p SizingAction, Result<()>)>
where
    W: Workload + ?Sized,
{
    let mut outcomes = Vec::with_capacity(plan.actions.len());
    for action in &plan.actions {
        let outcome = match action {
            SizingAction::Create { id, ordinal } => workload.create(id, *ordinal).await,
            SizingAction::Delete { id, .. } => workload.delete(id).await,
        };
        outcomes.push((action, outcome));
    }
    outcomes
}

async fn report_sizing(
    client: &Client,
    cluster: &VaultCluster,
    outcomes: Vec<(&SizingAction, Result<()>)>,
) {
    for (action, outcome) in outcomes {
        let (reason, message) = match action {
            SizingAction::Create { id, .. } => ("InstanceCreated", format!("Created instance {id}")),
            SizingAction::Delete { id, reason } => (
                "InstanceDeleted",
                format!("Deleted instance {id} ({reason})"),
            ),
        };

        match outcome {
            Ok(()) => emit_event(client, cluster, "Normal", reason, &message).await,
            Err(e) => {
                warn!("Sizing action on {} failed: {}", action.id(), e);
                emit_event(
                    client,
                    cluster,
                    "Warning",
                    "SizingFailed",
                    &format!("{} failed: {}", action.id(), e.status_message()),
                )
                .await;
            }
        }
    }
}

/// Remove pods that exited for good so their names and volumes are released
async fn clean_up_finished_pods(client: &Client, cluster: &VaultCluster, pods: &[Pod]) {
    for pod in pods
        .iter()
        .filter(|p| resources::is_finished(p) && p.metadata.deletion_timestamp.is_none())
    {
        if let Err(e) = resources::delete_instance_pod(client, cluster, &pod.name_any()).await {
            warn!("Failed to remove finished pod {}: {}", pod.name_any(), e);
        }
    }
}

async fn announce_transitions(client: &Client, cluster: &VaultCluster, status: &VaultClusterStatus) {
    let previous = cluster.status.as_ref();

    for anomaly in new_anomalies(previous, status) {
        warn!("{}", anomaly.message);
        emit_event(client, cluster, "Warning", anomaly_reason(anomaly.kind), &anomaly.message).await;
    }

    let previous_phase = previous.map(|s| s.phase);
    if previous_phase != Some(status.phase) {
        let message = format!(
            "Phase changed from {} to {}",
            previous_phase.map_or_else(|| "<none>".to_string(), |p| p.to_string()),
            status.phase
        );
        emit_event(client, cluster, "Normal", "PhaseChanged", &message).await;
    }
}

/// Anomalies not already published in the previous status
pub(crate) fn new_anomalies<'a>(
    previous: Option<&VaultClusterStatus>,
    current: &'a VaultClusterStatus,
) -> Vec<&'a Anomaly> {
    current
        .anomalies
        .iter()
        .filter(|a| previous.map_or(true, |p| !p.anomalies.contains(a)))
        .collect()
}

fn anomaly_reason(kind: AnomalyKind) -> &'static str {
    match kind {
        AnomalyKind::SplitBrain => "SplitBrain",
        AnomalyKind::Validation => "ValidationFailed",
        AnomalyKind::Tls => "TlsIssuerUnusable",
    }
}

fn record_probe_results(results: &[ProbeResult]) {
    for result in results {
        if let Some(e) = &result.error {
            debug!("Probe of {} failed: {}", result.instance_id, e);
        }
        #[cfg(feature = "metrics")]
        metrics::inc_probe_result(result.outcome());
    }
}

/// Instances the cluster should have once `plan` is applied, sorted
pub(crate) fn declared_instances(observed: &[ObservedInstance], plan: &ScalePlan) -> Vec<String> {
    let deleted: BTreeSet<&str> = plan
        .actions
        .iter()
        .filter(|a| matches!(a, SizingAction::Delete { .. }))
        .map(SizingAction::id)
        .collect();

    let mut declared: Vec<String> = observed
        .iter()
        .filter(|i| !i.terminating && !deleted.contains(i.id.as_str()))
        .map(|i| i.id.clone())
        .chain(plan.creates().map(|(id, _)| id.to_string()))
        .collect();
    declared.sort();
    declared.dedup();
    declared
}

/// Live instances that stay after this pass; new pods cannot answer yet
pub(crate) fn probe_targets(
    cluster: &str,
    namespace: &str,
    observed: &[ObservedInstance],
    plan: &ScalePlan,
) -> Vec<ProbeTarget> {
    let created: BTreeSet<&str> = plan.creates().map(|(id, _)| id).collect();
    declared_instances(observed, plan)
        .iter()
        .filter(|id| !created.contains(id.as_str()))
        .map(|id| ProbeTarget::for_instance(cluster, namespace, id))
        .collect()
}

/// Resync interval plus up to 20% random jitter
pub(crate) fn jittered(base: Duration) -> Duration {
    let max_jitter = base.as_millis() as u64 / 5;
    if max_jitter == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Error policy for the controller
pub(crate) fn error_policy(
    cluster: Arc<VaultCluster>,
    error: &Error,
    _ctx: Arc<ControllerState>,
) -> Action {
    error!("Reconciliation error for {}: {}", cluster.name_any(), error);

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(error.metric_label());

    if error.is_retriable() {
        Action::requeue(TRANSIENT_RETRY)
    } else {
        Action::requeue(ERROR_RETRY)
    }
}
