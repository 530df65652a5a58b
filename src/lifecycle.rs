//! Certificate Lifecycle Module
//!
//! Obtains and renews the node identity: reuses the on-disk key when one
//! exists, resolves the signing path (local signer, or the remote signing
//! endpoint reached through a [`CertificateIssuer`]), waits out pending
//! issuance on store events, resolves the at-rest KEK from the cluster
//! spec, and persists the result atomically through the
//! [`KeyReadWriter`].

use crate::chain_validation::{asn1_to_unix, validate_cert_chain};
use crate::error::{SignerError, TrustError};
use crate::key_read_writer::{KekUpdate, KeyReadWriter};
use crate::messages::{IssuanceState, NodeRole};
use crate::root_authority::{
    csr_from_key, generate_new_csr, BundleDigest, RootCA, DEFAULT_NODE_CERT_EXPIRATION,
};
use crate::store::{MemoryStore, StoreEvent};
use crate::watch::EventFilter;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::X509;
use rand::Rng;
use secrecy::Secret;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Outcome of submitting a CSR to the cluster's signing endpoint.
#[derive(Debug, Clone)]
pub enum IssueResponse {
    /// The chain was signed synchronously.
    Issued { chain_pem: Vec<u8> },
    /// Issuance is queued; progress lands on the node's store row.
    Pending { node_id: String },
    /// The request was refused outright.
    Rejected { reason: String },
}

/// Connection seam to the remote CA endpoints. The transport (connection
/// brokering, retries at the RPC layer) lives with the implementor.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Submit a CSR together with the caller's join token. Distinct
    /// tokens encode the manager and worker roles.
    async fn issue_certificate(
        &self,
        csr_pem: &[u8],
        token: &str,
    ) -> Result<IssueResponse, SignerError>;

    /// Fetch the current cluster root bundle over an unauthenticated
    /// channel. Callers must pin-verify the result.
    async fn fetch_root_bundle(&self) -> Result<Vec<u8>, SignerError>;
}

/// Parameters of one certificate request.
pub struct CertificateRequestConfig {
    /// Join token presented to the remote signing endpoint.
    pub token: Option<String>,
    /// Organization (cluster identity) stamped into the leaf.
    pub org: String,
    /// Common name for locally signed leaves; remote issuance derives it
    /// server-side.
    pub cn: String,
    /// Role for locally signed leaves.
    pub role: NodeRole,
    /// Deadline for a pending issuance to complete.
    pub issuance_timeout: Duration,
}

impl CertificateRequestConfig {
    pub fn new(cn: &str, role: NodeRole, org: &str) -> Self {
        Self {
            token: None,
            org: org.to_string(),
            cn: cn.to_string(),
            role,
            issuance_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }
}

/// Which signing path a request resolves to.
enum SigningBackend<'a> {
    Local,
    External(&'a dyn CertificateIssuer),
    None,
}

/// Issue (or renew) the node identity and persist it.
///
/// The on-disk private key is reused when readable; the signing path is
/// the local signer when the `root_ca` carries one, otherwise the remote
/// endpoint with the configured join token. Manager keys are encrypted at
/// rest with the cluster unlock key when `auto_lock_managers` is set;
/// worker keys are always stored in the clear.
pub async fn request_and_save_new_certificates(
    root_ca: &RootCA,
    store: &MemoryStore,
    krw: &KeyReadWriter,
    issuer: &dyn CertificateIssuer,
    config: &CertificateRequestConfig,
) -> Result<X509> {
    // Reuse the existing key where possible so a renewal does not churn
    // the node identity.
    let (csr_pem, key_pem) = match krw.read() {
        Ok((_, key_pem)) => {
            let key = PKey::private_key_from_pem(&key_pem)
                .context("Failed to parse existing private key")?;
            (csr_from_key(&key)?, key_pem)
        }
        Err(_) => generate_new_csr()?,
    };

    let backend = if root_ca.signer().is_ok() {
        SigningBackend::Local
    } else if config.token.is_some() {
        SigningBackend::External(issuer)
    } else {
        SigningBackend::None
    };

    let chain_pem = match backend {
        SigningBackend::Local => {
            debug!(cn = config.cn.as_str(), "signing certificate locally");
            root_ca.parse_validate_and_sign_csr(
                &csr_pem,
                &config.cn,
                config.role.organizational_unit(),
                &config.org,
            )?
        }
        SigningBackend::External(issuer) => {
            let token = config.token.as_deref().expect("checked above");
            match issuer.issue_certificate(&csr_pem, token).await? {
                IssueResponse::Issued { chain_pem } => chain_pem,
                IssueResponse::Rejected { reason } => {
                    return Err(SignerError::Rejected(reason).into())
                }
                IssueResponse::Pending { node_id } => {
                    debug!(node_id = node_id.as_str(), "issuance pending, waiting on store");
                    wait_for_issuance(store, &node_id, config.issuance_timeout).await?
                }
            }
        }
        SigningBackend::None => return Err(TrustError::NoValidSigner.into()),
    };

    // The leaf must verify against our roots before we trust it with the
    // node identity.
    let certs = validate_cert_chain(root_ca.roots(), &chain_pem, false)
        .context("issued certificate chain failed validation")?;
    let leaf = certs[0].clone();
    let role = leaf_role(&leaf)?;

    let kek = resolve_at_rest_kek(store, role);
    krw.write(&chain_pem, &key_pem, KekUpdate::Set(kek))
        .context("Failed to persist issued certificate")?;

    info!(role = role.organizational_unit(), "node certificate saved");
    Ok(leaf)
}

/// Re-run the request flow before the current certificate expires. The
/// key on disk is reused, so the node identity is stable across renewals.
pub async fn renew_tls_config(
    root_ca: &RootCA,
    store: &MemoryStore,
    krw: &KeyReadWriter,
    issuer: &dyn CertificateIssuer,
    config: &CertificateRequestConfig,
) -> Result<X509> {
    request_and_save_new_certificates(root_ca, store, krw, issuer, config).await
}

/// Delay before attempting renewal: a random point between half and 80%
/// of the certificate's remaining validity, so a fleet issued together
/// does not renew together.
pub fn renewal_delay(cert: &X509) -> Result<Duration, TrustError> {
    let expires = asn1_to_unix(cert.not_after())?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let remaining = expires - now;
    if remaining <= 0 {
        return Ok(Duration::ZERO);
    }
    let low = remaining / 2;
    let high = remaining * 4 / 5;
    let chosen = if high <= low {
        low
    } else {
        rand::thread_rng().gen_range(low..=high)
    };
    Ok(Duration::from_secs(chosen as u64))
}

/// Fetch the cluster root bundle through `issuer` and verify it against
/// the pinned digest. On a match the bundle becomes a verification-only
/// [`RootCA`]; on a mismatch the fetch fails with
/// [`TrustError::FingerprintMismatch`].
pub async fn get_remote_ca(
    pinned: &BundleDigest,
    issuer: &dyn CertificateIssuer,
) -> Result<RootCA> {
    let bundle = issuer
        .fetch_root_bundle()
        .await
        .context("Failed to fetch remote CA bundle")?;
    let actual = BundleDigest::of(&bundle);
    if *pinned != actual {
        return Err(TrustError::FingerprintMismatch {
            expected: pinned.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(RootCA::from_bundle(&bundle, DEFAULT_NODE_CERT_EXPIRATION)?)
}

/// Block until the node's certificate row reaches `Issued`, bounded by
/// `timeout`.
async fn wait_for_issuance(
    store: &MemoryStore,
    node_id: &str,
    timeout: Duration,
) -> Result<Vec<u8>> {
    // Subscribe first, then read the current row, so a concurrent update
    // cannot slip between the two.
    let filter_node_id = node_id.to_string();
    let filter: EventFilter = Arc::new(move |event| {
        matches!(
            event,
            StoreEvent::CreateNode(n) | StoreEvent::UpdateNode(n) if n.spec.id == filter_node_id
        )
    });
    let mut events = store.watch_queue().watch(filter);

    if let Some(node) = store.view(|tx| tx.get_node(node_id)) {
        if let Some(certificate) = &node.certificate {
            match certificate.state {
                IssuanceState::Issued => return Ok(certificate.issued_chain.clone()),
                IssuanceState::Rejected => {
                    return Err(SignerError::Rejected("issuance rejected".to_string()).into())
                }
                IssuanceState::Pending => {}
            }
        }
    }

    tokio::time::timeout(timeout, async move {
        loop {
            let node = match events.recv().await {
                Some(StoreEvent::CreateNode(node)) | Some(StoreEvent::UpdateNode(node)) => node,
                Some(_) => continue,
                None => bail!("issuance watch disconnected"),
            };
            if let Some(certificate) = node.certificate {
                match certificate.state {
                    IssuanceState::Issued => return Ok(certificate.issued_chain),
                    IssuanceState::Rejected => {
                        bail!(SignerError::Rejected("issuance rejected".to_string()))
                    }
                    IssuanceState::Pending => {}
                }
            }
        }
    })
    .await
    .context("timed out waiting for certificate issuance")?
}

fn leaf_role(leaf: &X509) -> Result<NodeRole> {
    let ou = leaf
        .subject_name()
        .entries_by_nid(Nid::ORGANIZATIONALUNITNAME)
        .next()
        .context("issued certificate carries no organizational unit")?
        .data()
        .as_utf8()
        .context("issued certificate organizational unit is not UTF-8")?
        .to_string();
    NodeRole::from_organizational_unit(&ou)
        .with_context(|| format!("issued certificate carries unknown role {:?}", ou))
}

/// Managers under auto-lock store their key under the cluster unlock key;
/// everything else is stored in the clear.
fn resolve_at_rest_kek(store: &MemoryStore, role: NodeRole) -> Option<Secret<Vec<u8>>> {
    if role != NodeRole::Manager {
        return None;
    }
    let cluster = store.view(|tx| tx.cluster());
    if !cluster.auto_lock_managers {
        return None;
    }
    cluster.unlock_key.map(Secret::new)
}
