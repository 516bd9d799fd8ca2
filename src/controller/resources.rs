//! Kubernetes resource builders for VaultCluster
//!
//! This module creates and manages the objects backing each VaultCluster:
//! the headless Service that gives instances stable DNS names, the server
//! ConfigMap, and one Pod per instance.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar,
    HTTPGetAction, Pod, PodSpec, Probe, ResourceRequirements as K8sResources,
    SecretVolumeSource, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::probe::VAULT_API_PORT;
use super::sizer::ObservedInstance;
use super::tls::server_secret_name;
use crate::crd::{ResourceSpec, VaultCluster};
use crate::error::{Error, Result};

/// Server-side apply field manager
pub const FIELD_MANAGER: &str = "vault-operator";

pub const CLUSTER_LABEL: &str = "vault.security.coreos.com/cluster";
pub const ORDINAL_LABEL: &str = "vault.security.coreos.com/ordinal";

pub const VAULT_CLUSTER_PORT: u16 = 8201;

const CONFIG_MOUNT_PATH: &str = "/vault/config";
const TLS_MOUNT_PATH: &str = "/vault/tls";
const CONTAINER_NAME: &str = "vault";

/// Get the standard labels for a VaultCluster's resources
pub fn standard_labels(cluster: &VaultCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "vault".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), cluster.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels.insert(CLUSTER_LABEL.to_string(), cluster.name_any());
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(cluster: &VaultCluster) -> OwnerReference {
    OwnerReference {
        api_version: VaultCluster::api_version(&()).to_string(),
        kind: VaultCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn namespace_of(cluster: &VaultCluster) -> String {
    cluster.namespace().unwrap_or_else(|| "default".to_string())
}

pub fn config_map_name(cluster: &VaultCluster) -> String {
    format!("{}-config", cluster.name_any())
}

fn object_meta(cluster: &VaultCluster, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(standard_labels(cluster)),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

// ============================================================================
// Headless Service
// ============================================================================

/// Ensure the headless Service that resolves `{instance}.{cluster}.{ns}.svc`
#[instrument(skip(client, cluster), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
pub async fn ensure_service(client: &Client, cluster: &VaultCluster) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace_of(cluster));
    let name = cluster.name_any();

    let service = build_service(cluster);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&service),
    )
    .await?;

    Ok(())
}

pub(crate) fn build_service(cluster: &VaultCluster) -> Service {
    let mut selector = BTreeMap::new();
    selector.insert(CLUSTER_LABEL.to_string(), cluster.name_any());

    Service {
        metadata: object_meta(cluster, cluster.name_any()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            // Sealed instances are not ready but must still resolve
            publish_not_ready_addresses: Some(true),
            selector: Some(selector),
            ports: Some(vec![
                ServicePort {
                    name: Some("api".to_string()),
                    port: i32::from(VAULT_API_PORT),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("cluster".to_string()),
                    port: i32::from(VAULT_CLUSTER_PORT),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// ConfigMap
// ============================================================================

/// Ensure the ConfigMap holding `vault.hcl`
#[instrument(skip(client, cluster), fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
pub async fn ensure_config_map(client: &Client, cluster: &VaultCluster) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace_of(cluster));
    let name = config_map_name(cluster);

    let cm = build_config_map(cluster);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&cm),
    )
    .await?;

    Ok(())
}

pub(crate) fn build_config_map(cluster: &VaultCluster) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("vault.hcl".to_string(), render_server_config(cluster));

    ConfigMap {
        metadata: object_meta(cluster, config_map_name(cluster)),
        data: Some(data),
        ..Default::default()
    }
}

/// Server configuration: a TLS listener on the API and cluster ports,
/// followed by the user's snippet (storage and HA backend)
pub fn render_server_config(cluster: &VaultCluster) -> String {
    let mut config = format!(
        r#"listener "tcp" {{
  address            = "0.0.0.0:{api}"
  cluster_address    = "0.0.0.0:{cluster_port}"
  tls_cert_file      = "{tls}/tls.crt"
  tls_key_file       = "{tls}/tls.key"
  tls_client_ca_file = "{tls}/ca.crt"
}}
"#,
        api = VAULT_API_PORT,
        cluster_port = VAULT_CLUSTER_PORT,
        tls = TLS_MOUNT_PATH,
    );

    if let Some(snippet) = cluster.spec.config_snippet.as_deref() {
        config.push('\n');
        config.push_str(snippet.trim_end());
        config.push('\n');
    }
    config
}

// ============================================================================
// Instance Pods
// ============================================================================

/// All pods belonging to the cluster, terminating ones included
pub async fn list_instance_pods(client: &Client, cluster: &VaultCluster) -> Result<Vec<Pod>> {
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace_of(cluster));
    let lp = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, cluster.name_any()));
    Ok(api.list(&lp).await?.items)
}

/// Translate pods into sizer input. Pods without a parseable ordinal label
/// are not ours to manage and are skipped.
pub fn observe_instances(pods: &[Pod]) -> Vec<ObservedInstance> {
    pods.iter()
        .filter_map(|pod| {
            let id = pod.name_any();
            let ordinal = match pod.labels().get(ORDINAL_LABEL).map(|o| o.parse::<i32>()) {
                Some(Ok(ordinal)) => ordinal,
                _ => {
                    warn!("Pod {} has no valid {} label, ignoring", id, ORDINAL_LABEL);
                    return None;
                }
            };
            let image = pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.iter().find(|c| c.name == CONTAINER_NAME))
                .and_then(|c| c.image.clone())
                .unwrap_or_default();

            Some(ObservedInstance {
                id,
                ordinal,
                image,
                terminating: is_terminating(pod),
            })
        })
        .collect()
}

/// Deleted, or exited for good and waiting to be cleaned up
fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some() || is_finished(pod)
}

/// Exited for good; the pod will never serve again
pub fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Failed") | Some("Succeeded")
    )
}

/// Create the pod for one instance. An existing pod with that name is left alone.
#[instrument(skip(client, cluster), fields(name = %cluster.name_any()))]
pub async fn create_instance_pod(
    client: &Client,
    cluster: &VaultCluster,
    instance_id: &str,
    ordinal: i32,
) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace_of(cluster));
    let pod = build_pod(cluster, instance_id, ordinal);

    match api.create(&PostParams::default(), &pod).await {
        Ok(_) => info!("Created pod {}", instance_id),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            info!("Pod {} already exists", instance_id);
        }
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}

/// Delete the pod for one instance
#[instrument(skip(client, cluster), fields(name = %cluster.name_any()))]
pub async fn delete_instance_pod(
    client: &Client,
    cluster: &VaultCluster,
    instance_id: &str,
) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace_of(cluster));

    match api.delete(instance_id, &DeleteParams::default()).await {
        Ok(_) => info!("Deleted pod {}", instance_id),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            warn!("Pod {} not found", instance_id);
        }
        Err(e) => return Err(Error::KubeError(e)),
    }
    Ok(())
}

pub(crate) fn build_pod(cluster: &VaultCluster, instance_id: &str, ordinal: i32) -> Pod {
    let name = cluster.name_any();
    let namespace = namespace_of(cluster);

    let mut labels = standard_labels(cluster);
    labels.insert(ORDINAL_LABEL.to_string(), ordinal.to_string());

    let mut metadata = object_meta(cluster, instance_id.to_string());
    metadata.labels = Some(labels);

    Pod {
        metadata,
        spec: Some(PodSpec {
            hostname: Some(instance_id.to_string()),
            subdomain: Some(name.clone()),
            containers: vec![build_container(cluster, instance_id, &name, &namespace)],
            volumes: Some(vec![
                Volume {
                    name: "config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(config_map_name(cluster)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "tls".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(server_secret_name(instance_id)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

fn build_container(
    cluster: &VaultCluster,
    instance_id: &str,
    cluster_name: &str,
    namespace: &str,
) -> Container {
    let fqdn = format!("{instance_id}.{cluster_name}.{namespace}.svc");

    let env = vec![
        EnvVar {
            name: "VAULT_API_ADDR".to_string(),
            value: Some(format!("https://{fqdn}:{VAULT_API_PORT}")),
            ..Default::default()
        },
        EnvVar {
            name: "VAULT_CLUSTER_ADDR".to_string(),
            value: Some(format!("https://{fqdn}:{VAULT_CLUSTER_PORT}")),
            ..Default::default()
        },
        // The operator probes over the CA it manages; the local CLI does too
        EnvVar {
            name: "VAULT_CACERT".to_string(),
            value: Some(format!("{TLS_MOUNT_PATH}/ca.crt")),
            ..Default::default()
        },
    ];

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(cluster.spec.image()),
        command: Some(vec![
            "vault".to_string(),
            "server".to_string(),
            format!("-config={CONFIG_MOUNT_PATH}/vault.hcl"),
        ]),
        env: Some(env),
        ports: Some(vec![
            ContainerPort {
                name: Some("api".to_string()),
                container_port: i32::from(VAULT_API_PORT),
                ..Default::default()
            },
            ContainerPort {
                name: Some("cluster".to_string()),
                container_port: i32::from(VAULT_CLUSTER_PORT),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "tls".to_string(),
                mount_path: TLS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            // Lets Vault mlock secrets out of swap
            capabilities: Some(Capabilities {
                add: Some(vec!["IPC_LOCK".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        // Ready only when unsealed; sealed pods still resolve through the headless Service
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/v1/sys/health?standbyok=true".to_string()),
                port: IntOrString::Int(i32::from(VAULT_API_PORT)),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            period_seconds: Some(5),
            ..Default::default()
        }),
        resources: build_resources(cluster),
        ..Default::default()
    }
}

fn build_resources(cluster: &VaultCluster) -> Option<K8sResources> {
    fn quantities(spec: &ResourceSpec) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        map.insert("cpu".to_string(), Quantity(spec.cpu.clone()));
        map.insert("memory".to_string(), Quantity(spec.memory.clone()));
        map
    }

    let resources = cluster.spec.resources.as_ref()?;
    Some(K8sResources {
        requests: resources.requests.as_ref().map(quantities),
        limits: resources.limits.as_ref().map(quantities),
        ..Default::default()
    })
}
