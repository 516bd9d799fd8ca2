//! TLS trust domain management
//!
//! Each VaultCluster gets its own CA. The operator issues one server
//! certificate per instance and one client certificate for itself, stored
//! as Secrets owned by the cluster. Certificates are reused until they
//! enter the renewal window; nothing still valid is ever revoked.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use x509_parser::extensions::GeneralName;

use super::resources::{owner_reference, standard_labels, FIELD_MANAGER};
use crate::crd::{TlsConfig, TlsMode, VaultCluster};
use crate::error::{Error, Result};

pub const KEY_CA_CERT: &str = "ca.crt";
pub const KEY_CA_KEY: &str = "ca.key";
pub const KEY_TLS_CERT: &str = "tls.crt";
pub const KEY_TLS_KEY: &str = "tls.key";

/// Common name of the operator's client certificate
pub const CLIENT_COMMON_NAME: &str = "vault-operator";

/// Backdate `notBefore` to tolerate clock skew between nodes
const CLOCK_SKEW_ALLOWANCE: i64 = 5 * 60;

pub type SecretData = BTreeMap<String, Vec<u8>>;

pub fn ca_secret_name(cluster: &str) -> String {
    format!("{cluster}-ca")
}

pub fn server_secret_name(instance_id: &str) -> String {
    format!("{instance_id}-tls")
}

pub fn client_secret_name(cluster: &str) -> String {
    format!("{cluster}-client-tls")
}

/// DNS names an instance is reachable under
pub fn instance_dns_names(cluster: &str, namespace: &str, instance_id: &str) -> Vec<String> {
    vec![
        instance_id.to_string(),
        format!("{instance_id}.{cluster}"),
        format!("{instance_id}.{cluster}.{namespace}.svc"),
        format!("{instance_id}.{cluster}.{namespace}.svc.cluster.local"),
        "localhost".to_string(),
    ]
}

/// Persistence for TLS material
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<SecretData>>;
    async fn put(&self, name: &str, data: SecretData) -> Result<()>;
}

/// Secrets in the cluster's namespace, owned by the VaultCluster
pub struct KubeSecretStore {
    api: Api<Secret>,
    namespace: String,
    labels: BTreeMap<String, String>,
    owner: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
}

impl KubeSecretStore {
    pub fn new(client: &Client, cluster: &VaultCluster) -> Result<Self> {
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        Ok(Self {
            api: Api::namespaced(client.clone(), &namespace),
            namespace,
            labels: standard_labels(cluster),
            owner: owner_reference(cluster),
        })
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretData>> {
        let secret = self.api.get_opt(name).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn put(&self, name: &str, data: SecretData) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        };

        self.api
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        Ok(())
    }
}

/// CA certificate and key. Only the TLS manager ever holds the key.
#[derive(Clone)]
pub struct CaMaterial {
    cert_pem: String,
    key_pem: String,
}

impl fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaMaterial")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl CaMaterial {
    /// Generate a fresh self-signed CA
    pub fn generate(cluster: &str, validity: Duration, now: OffsetDateTime) -> Result<Self> {
        let key = KeyPair::generate().map_err(|e| tls_error("generate CA key", e))?;
        let params = ca_params(cluster, now, validity);
        let cert = params
            .self_signed(&key)
            .map_err(|e| tls_error("self-sign CA", e))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Load a CA from PEM, failing if either half does not parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem).map_err(|e| tls_error("parse CA key", e))?;
        let info = inspect_cert(cert_pem.as_bytes())?;
        if !info.is_ca {
            return Err(Error::Tls("certificate is not a CA".to_string()));
        }
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    fn from_secret(data: &SecretData) -> Result<Self> {
        let cert = data
            .get(KEY_CA_CERT)
            .or_else(|| data.get(KEY_TLS_CERT))
            .ok_or_else(|| Error::Tls("CA secret has no certificate".to_string()))?;
        let key = data
            .get(KEY_CA_KEY)
            .or_else(|| data.get(KEY_TLS_KEY))
            .ok_or_else(|| Error::Tls("CA secret has no private key".to_string()))?;

        let cert = std::str::from_utf8(cert)
            .map_err(|e| tls_error("decode CA certificate", e))?;
        let key = std::str::from_utf8(key).map_err(|e| tls_error("decode CA key", e))?;
        Self::from_pem(cert, key)
    }

    fn to_secret_data(&self) -> SecretData {
        let mut data = BTreeMap::new();
        data.insert(KEY_CA_CERT.to_string(), self.cert_pem.clone().into_bytes());
        data.insert(KEY_CA_KEY.to_string(), self.key_pem.clone().into_bytes());
        data
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Re-sign the CA with the same key and subject. Certificates issued by
    /// the old CA certificate keep validating against the new one.
    fn reissue(&self, validity: Duration, now: OffsetDateTime) -> Result<Self> {
        let key = KeyPair::from_pem(&self.key_pem).map_err(|e| tls_error("parse CA key", e))?;
        let mut params = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .map_err(|e| tls_error("parse CA certificate", e))?;
        set_validity(&mut params, now, validity);
        let cert = params
            .self_signed(&key)
            .map_err(|e| tls_error("re-sign CA", e))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: self.key_pem.clone(),
        })
    }

    fn issuer(&self) -> Result<(Certificate, KeyPair)> {
        let key = KeyPair::from_pem(&self.key_pem).map_err(|e| tls_error("parse CA key", e))?;
        let params = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .map_err(|e| tls_error("parse CA certificate", e))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| tls_error("load CA issuer", e))?;
        Ok((cert, key))
    }
}

/// Certificate, key and the CA chain a peer needs to validate it
#[derive(Clone, PartialEq, Eq)]
pub struct CertBundle {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Vec<u8>,
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("cert_pem", &String::from_utf8_lossy(&self.cert_pem))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl CertBundle {
    fn from_secret(data: &SecretData) -> Option<Self> {
        Some(Self {
            cert_pem: data.get(KEY_TLS_CERT)?.clone(),
            key_pem: data.get(KEY_TLS_KEY)?.clone(),
            ca_pem: data.get(KEY_CA_CERT)?.clone(),
        })
    }

    fn to_secret_data(&self) -> SecretData {
        let mut data = BTreeMap::new();
        data.insert(KEY_TLS_CERT.to_string(), self.cert_pem.clone());
        data.insert(KEY_TLS_KEY.to_string(), self.key_pem.clone());
        data.insert(KEY_CA_CERT.to_string(), self.ca_pem.clone());
        data
    }
}

/// Everything needed to dial an instance. Never carries the CA key.
#[derive(Clone)]
pub struct TrustBundle {
    pub ca_cert_pem: Vec<u8>,
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Vec<u8>,
}

/// Validity windows for issued material
#[derive(Clone, Copy, Debug)]
pub struct CertPolicy {
    pub ca_validity: Duration,
    pub leaf_validity: Duration,
}

impl Default for CertPolicy {
    fn default() -> Self {
        Self {
            ca_validity: Duration::from_secs(10 * 365 * 24 * 3600),
            leaf_validity: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

/// What a certificate says about itself
#[derive(Debug)]
struct CertInfo {
    not_before: i64,
    not_after: i64,
    is_ca: bool,
    dns_names: BTreeSet<String>,
}

fn inspect_cert(pem: &[u8]) -> Result<CertInfo> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem)
        .map_err(|e| tls_error("decode certificate PEM", e))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| tls_error("parse certificate", e))?;

    let mut dns_names = BTreeSet::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.insert(dns.to_string());
            }
        }
    }

    Ok(CertInfo {
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        is_ca: cert.is_ca(),
        dns_names,
    })
}

/// True once less than a third of the certificate's lifetime remains
pub fn needs_renewal(cert_pem: &[u8], now: OffsetDateTime) -> Result<bool> {
    let info = inspect_cert(cert_pem)?;
    Ok(in_renewal_window(info.not_before, info.not_after, now))
}

fn in_renewal_window(not_before: i64, not_after: i64, now: OffsetDateTime) -> bool {
    let total = not_after - not_before;
    let remaining = not_after - now.unix_timestamp();
    remaining * 3 < total
}

/// Hex SHA-256 of the certificate's DER encoding
pub fn ca_fingerprint(cert_pem: &[u8]) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem)
        .map_err(|e| tls_error("decode certificate PEM", e))?;
    Ok(hex::encode(Sha256::digest(&pem.contents)))
}

fn tls_error(action: &str, e: impl fmt::Display) -> Error {
    Error::Tls(format!("failed to {action}: {e}"))
}

fn set_validity(params: &mut CertificateParams, now: OffsetDateTime, validity: Duration) {
    params.not_before = now - time::Duration::seconds(CLOCK_SKEW_ALLOWANCE);
    params.not_after = now + time::Duration::seconds(validity.as_secs() as i64);
}

fn ca_params(cluster: &str, now: OffsetDateTime, validity: Duration) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{cluster}-vault-ca"));
    dn.push(DnType::OrganizationName, "vault-operator");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, now, validity);
    params
}

/// Subject and usage of a leaf certificate
struct LeafSpec {
    common_name: String,
    subject_alt_names: Vec<String>,
    usages: Vec<ExtendedKeyUsagePurpose>,
}

impl LeafSpec {
    fn expected_dns_names(&self) -> BTreeSet<String> {
        self.subject_alt_names
            .iter()
            .filter(|n| n.parse::<std::net::IpAddr>().is_err())
            .cloned()
            .collect()
    }
}

fn issue_leaf(
    ca: &CaMaterial,
    spec: &LeafSpec,
    validity: Duration,
    now: OffsetDateTime,
) -> Result<CertBundle> {
    let (issuer, issuer_key) = ca.issuer()?;

    let mut params = CertificateParams::new(spec.subject_alt_names.clone())
        .map_err(|e| tls_error("build certificate params", e))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, spec.common_name.clone());
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = spec.usages.clone();
    set_validity(&mut params, now, validity);

    let key = KeyPair::generate().map_err(|e| tls_error("generate key", e))?;
    let cert = params
        .signed_by(&key, &issuer, &issuer_key)
        .map_err(|e| tls_error("sign certificate", e))?;

    Ok(CertBundle {
        cert_pem: cert.pem().into_bytes(),
        key_pem: key.serialize_pem().into_bytes(),
        ca_pem: ca.cert_pem.clone().into_bytes(),
    })
}

/// Owns one cluster's trust domain for the duration of a pass
pub struct TrustManager<S> {
    store: S,
    cluster: String,
    namespace: String,
    tls: TlsConfig,
    policy: CertPolicy,
    clock: fn() -> OffsetDateTime,
}

impl<S: SecretStore> TrustManager<S> {
    pub fn new(
        store: S,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        tls: TlsConfig,
        policy: CertPolicy,
    ) -> Self {
        Self {
            store,
            cluster: cluster.into(),
            namespace: namespace.into(),
            tls,
            policy,
            clock: OffsetDateTime::now_utc,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    /// Return the cluster CA, creating it on first use
    pub async fn ensure_ca(&self) -> Result<CaMaterial> {
        match self.tls.mode {
            TlsMode::External => self.load_external_ca().await,
            TlsMode::SelfSigned => self.ensure_self_signed_ca().await,
        }
    }

    async fn load_external_ca(&self) -> Result<CaMaterial> {
        let name = self
            .tls
            .ca_secret_name
            .as_deref()
            .ok_or_else(|| Error::TlsIssuer("External TLS requires caSecretName".into()))?;

        let data = self
            .store
            .get(name)
            .await?
            .ok_or_else(|| Error::TlsIssuer(format!("external CA secret {name} not found")))?;
        let ca = CaMaterial::from_secret(&data).map_err(|e| match e {
            Error::Tls(msg) => Error::TlsIssuer(format!("external CA secret {name}: {msg}")),
            other => other,
        })?;

        if needs_renewal(ca.cert_pem.as_bytes(), (self.clock)())? {
            warn!(
                "External CA {} for cluster {} is close to expiry",
                name, self.cluster
            );
        }
        Ok(ca)
    }

    async fn ensure_self_signed_ca(&self) -> Result<CaMaterial> {
        let name = ca_secret_name(&self.cluster);
        let now = (self.clock)();

        if let Some(data) = self.store.get(&name).await? {
            let ca = CaMaterial::from_secret(&data)?;
            if !needs_renewal(ca.cert_pem.as_bytes(), now)? {
                return Ok(ca);
            }
            info!("Re-issuing CA {} with its existing key", name);
            let renewed = ca.reissue(self.policy.ca_validity, now)?;
            self.store.put(&name, renewed.to_secret_data()).await?;
            return Ok(renewed);
        }

        info!("Creating CA {} for cluster {}", name, self.cluster);
        let ca = CaMaterial::generate(&self.cluster, self.policy.ca_validity, now)?;
        self.store.put(&name, ca.to_secret_data()).await?;
        Ok(ca)
    }

    /// Server certificate for one instance, bound to its network names
    pub async fn ensure_instance_cert(
        &self,
        ca: &CaMaterial,
        instance_id: &str,
    ) -> Result<CertBundle> {
        let mut subject_alt_names = instance_dns_names(&self.cluster, &self.namespace, instance_id);
        subject_alt_names.push("127.0.0.1".to_string());

        let spec = LeafSpec {
            common_name: instance_id.to_string(),
            subject_alt_names,
            // The cluster port authenticates peers with the same certificate
            usages: vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        };
        self.ensure_leaf(ca, &server_secret_name(instance_id), &spec)
            .await
    }

    /// The operator's own client certificate
    pub async fn ensure_client_cert(&self, ca: &CaMaterial) -> Result<CertBundle> {
        let spec = LeafSpec {
            common_name: CLIENT_COMMON_NAME.to_string(),
            subject_alt_names: vec![CLIENT_COMMON_NAME.to_string()],
            usages: vec![ExtendedKeyUsagePurpose::ClientAuth],
        };
        self.ensure_leaf(ca, &client_secret_name(&self.cluster), &spec)
            .await
    }

    async fn ensure_leaf(&self, ca: &CaMaterial, name: &str, spec: &LeafSpec) -> Result<CertBundle> {
        let now = (self.clock)();

        if let Some(existing) = self
            .store
            .get(name)
            .await?
            .as_ref()
            .and_then(CertBundle::from_secret)
        {
            match self.rotation_reason(&existing, ca, spec, now) {
                None => {
                    debug!("Certificate {} is current", name);
                    return Ok(existing);
                }
                Some(reason) => info!("Rotating certificate {}: {}", name, reason),
            }
        }

        let bundle = issue_leaf(ca, spec, self.policy.leaf_validity, now)?;
        self.store.put(name, bundle.to_secret_data()).await?;
        Ok(bundle)
    }

    fn rotation_reason(
        &self,
        existing: &CertBundle,
        ca: &CaMaterial,
        spec: &LeafSpec,
        now: OffsetDateTime,
    ) -> Option<&'static str> {
        if existing.ca_pem != ca.cert_pem.as_bytes() {
            return Some("issued by a different CA certificate");
        }
        let info = match inspect_cert(&existing.cert_pem) {
            Ok(info) => info,
            Err(_) => return Some("stored certificate does not parse"),
        };
        if info.dns_names != spec.expected_dns_names() {
            return Some("subject alternative names changed");
        }
        if in_renewal_window(info.not_before, info.not_after, now) {
            return Some("inside renewal window");
        }
        None
    }

    /// CA pool plus client identity for dialing instances
    pub fn trust_bundle(&self, ca: &CaMaterial, client: &CertBundle) -> TrustBundle {
        TrustBundle {
            ca_cert_pem: ca.cert_pem.clone().into_bytes(),
            client_cert_pem: client.cert_pem.clone(),
            client_key_pem: client.key_pem.clone(),
        }
    }

    /// Trust material issued by an earlier pass, without issuing anything.
    /// The client secret carries the CA it was signed by.
    pub async fn load_trust_bundle(&self) -> Result<Option<TrustBundle>> {
        let client = self
            .store
            .get(&client_secret_name(&self.cluster))
            .await?
            .as_ref()
            .and_then(CertBundle::from_secret);

        Ok(client.map(|c| TrustBundle {
            ca_cert_pem: c.ca_pem,
            client_cert_pem: c.cert_pem,
            client_key_pem: c.key_pem,
        }))
    }
}

/// In-memory store for exercising the trust manager without an API server
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    inner: std::sync::Arc<std::sync::Mutex<HashMap<String, SecretData>>>,
}

impl MemorySecretStore {
    pub fn insert(&self, name: &str, data: SecretData) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(name.to_string(), data);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<Option<SecretData>> {
        let map = self
            .inner
            .lock()
            .map_err(|_| Error::ConfigError("secret store lock poisoned".into()))?;
        Ok(map.get(name).cloned())
    }

    async fn put(&self, name: &str, data: SecretData) -> Result<()> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| Error::ConfigError("secret store lock poisoned".into()))?;
        map.insert(name.to_string(), data);
        Ok(())
    }
}
