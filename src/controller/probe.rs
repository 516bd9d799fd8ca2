//! Instance prober
//!
//! Queries each Vault instance for its seal and leadership state over
//! mutually authenticated TLS. A probe is read-only, bounded by a deadline
//! and never retried here: the next reconcile tick is the retry.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use reqwest::{Certificate, Client, Identity};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::tls::TrustBundle;
use crate::error::{Error, Result};

/// Port of the Vault HTTP API
pub const VAULT_API_PORT: u16 = 8200;

const SEAL_STATUS_PATH: &str = "/v1/sys/seal-status";
const LEADER_PATH: &str = "/v1/sys/leader";

/// Why an instance could not be classified
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeError {
    /// The deadline elapsed before the instance answered
    Timeout,
    /// Connection or TLS handshake failed
    Connect(String),
    /// The instance answered with a non-success HTTP status
    Status(u16),
    /// The response body was not what the API documents
    Decode(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Timeout => write!(f, "probe timed out"),
            ProbeError::Connect(e) => write!(f, "connection failed: {e}"),
            ProbeError::Status(code) => write!(f, "unexpected HTTP status {code}"),
            ProbeError::Decode(e) => write!(f, "malformed response: {e}"),
        }
    }
}

impl ProbeError {
    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            ProbeError::Timeout => "timeout",
            ProbeError::Connect(_) => "connect",
            ProbeError::Status(_) => "status",
            ProbeError::Decode(_) => "decode",
        }
    }
}

/// Outcome of probing one instance during one pass
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeResult {
    pub instance_id: String,
    pub reachable: bool,
    pub sealed: bool,
    /// Meaningful only when unsealed
    pub standby: bool,
    pub initialized: Option<bool>,
    pub version: Option<String>,
    pub error: Option<ProbeError>,
}

impl ProbeResult {
    pub fn unreachable(instance_id: impl Into<String>, error: ProbeError) -> Self {
        Self {
            instance_id: instance_id.into(),
            reachable: false,
            sealed: false,
            standby: false,
            initialized: None,
            version: None,
            error: Some(error),
        }
    }

    pub fn sealed(instance_id: impl Into<String>, initialized: bool) -> Self {
        Self {
            instance_id: instance_id.into(),
            reachable: true,
            sealed: true,
            standby: false,
            initialized: Some(initialized),
            version: None,
            error: None,
        }
    }

    pub fn unsealed(instance_id: impl Into<String>, standby: bool) -> Self {
        Self {
            instance_id: instance_id.into(),
            reachable: true,
            sealed: false,
            standby,
            initialized: Some(true),
            version: None,
            error: None,
        }
    }

    /// Reachable, unsealed and claiming leadership
    pub fn is_active(&self) -> bool {
        self.reachable && !self.sealed && !self.standby
    }

    /// Short label for metrics
    pub fn outcome(&self) -> &'static str {
        match (&self.error, self.reachable, self.sealed, self.standby) {
            (Some(e), _, _, _) => e.label(),
            (None, true, true, _) => "sealed",
            (None, true, false, true) => "standby",
            (None, true, false, false) => "active",
            (None, false, _, _) => "unreachable",
        }
    }
}

/// Where to reach one instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeTarget {
    pub instance_id: String,
    pub base_url: String,
}

impl ProbeTarget {
    /// Target addressed through the cluster's headless service
    pub fn for_instance(cluster: &str, namespace: &str, instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            base_url: format!(
                "https://{instance_id}.{cluster}.{namespace}.svc:{VAULT_API_PORT}"
            ),
        }
    }
}

/// Anything that can classify one instance
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult;
}

/// Subset of `GET /v1/sys/seal-status`
#[derive(Debug, Deserialize)]
struct SealStatusResponse {
    sealed: bool,
    #[serde(default)]
    initialized: Option<bool>,
    #[serde(default)]
    version: Option<String>,
}

/// Subset of `GET /v1/sys/leader`
#[derive(Debug, Deserialize)]
struct LeaderResponse {
    #[serde(default)]
    ha_enabled: bool,
    #[serde(default)]
    is_self: bool,
}

/// Prober talking to the Vault HTTP API
pub struct HttpsProber {
    client: Client,
    timeout: Duration,
}

impl HttpsProber {
    /// Build a client that trusts only this cluster's CA and presents the
    /// controller's client certificate
    pub fn new(bundle: &TrustBundle, timeout: Duration) -> Result<Self> {
        let ca = Certificate::from_pem(&bundle.ca_cert_pem)
            .map_err(|e| Error::Tls(format!("invalid CA certificate: {e}")))?;

        let mut identity_pem = bundle.client_cert_pem.clone();
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&bundle.client_key_pem);
        let identity = Identity::from_pem(&identity_pem)
            .map_err(|e| Error::Tls(format!("invalid client identity: {e}")))?;

        let client = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .connect_timeout(timeout)
            .user_agent(concat!("vault-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self { client, timeout })
    }

    /// Use a preconfigured client
    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        target: &ProbeTarget,
        path: &str,
    ) -> std::result::Result<T, ProbeError> {
        let url = format!("{}{}", target.base_url.trim_end_matches('/'), path);
        let resp = self.client.get(&url).send().await.map_err(classify)?;

        if !resp.status().is_success() {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ProbeError::Decode(e.to_string()))
    }

    async fn query(&self, target: &ProbeTarget) -> std::result::Result<ProbeResult, ProbeError> {
        let seal: SealStatusResponse = self.get_json(target, SEAL_STATUS_PATH).await?;

        if seal.sealed {
            return Ok(ProbeResult {
                instance_id: target.instance_id.clone(),
                reachable: true,
                sealed: true,
                standby: false,
                initialized: seal.initialized,
                version: seal.version,
                error: None,
            });
        }

        let leader: LeaderResponse = self.get_json(target, LEADER_PATH).await?;
        // Without HA the only unsealed instance is the active one
        let standby = leader.ha_enabled && !leader.is_self;

        Ok(ProbeResult {
            instance_id: target.instance_id.clone(),
            reachable: true,
            sealed: false,
            standby,
            initialized: Some(true),
            version: seal.version,
            error: None,
        })
    }
}

#[async_trait]
impl Prober for HttpsProber {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        debug!("Probing {} at {}", target.instance_id, target.base_url);

        match tokio::time::timeout(self.timeout, self.query(target)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", target.instance_id, e);
                ProbeResult::unreachable(&target.instance_id, e)
            }
            Err(_) => ProbeResult::unreachable(&target.instance_id, ProbeError::Timeout),
        }
    }
}

fn classify(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout
    } else if e.is_decode() {
        ProbeError::Decode(e.to_string())
    } else {
        ProbeError::Connect(e.to_string())
    }
}

/// Probe every target concurrently, at most `max_concurrency` at a time.
///
/// Each probe is additionally bounded by `deadline`, so one hanging instance
/// cannot hold back the pass. Returns only once every target has a result,
/// sorted by instance id.
pub async fn probe_all<P>(
    prober: &P,
    targets: &[ProbeTarget],
    max_concurrency: usize,
    deadline: Duration,
) -> Vec<ProbeResult>
where
    P: Prober + ?Sized,
{
    let probes: Vec<BoxFuture<'_, ProbeResult>> = targets
        .iter()
        .map(|target| -> BoxFuture<'_, ProbeResult> {
            Box::pin(async move {
                match tokio::time::timeout(deadline, prober.probe(target)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Probe of {} exceeded {:?}", target.instance_id, deadline);
                        ProbeResult::unreachable(&target.instance_id, ProbeError::Timeout)
                    }
                }
            })
        })
        .collect();
    let mut results: Vec<ProbeResult> = stream::iter(probes)
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await;

    results.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    results
}
