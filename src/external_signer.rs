//! External Signer Client
//!
//! Submits CSRs to a remote signing service over mutual TLS. The client
//! pins the holding [`RootCA`]'s roots as its trust store and walks its
//! URL list in order until one signer answers; transient failures move on
//! to the next URL, a definitive rejection stops the walk. Returned
//! bundles are validated against the root pool before being handed back.

use crate::chain_validation::validate_cert_chain;
use crate::error::SignerError;
use crate::messages::NodeRole;
use crate::root_authority::RootCA;
use openssl::pkey::PKey;
use openssl::x509::X509;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Default per-request deadline against one signer URL.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire body consumed by the signing endpoint.
#[derive(Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
    role: &'a str,
    org: &'a str,
}

/// Client credential for the mTLS connection to the signer.
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// mTLS client for a set of external signing endpoints.
pub struct ExternalCa {
    client: reqwest::Client,
    urls: Mutex<Vec<String>>,
    roots: Vec<X509>,
}

impl ExternalCa {
    /// Build a client trusting `root_ca`'s roots, optionally presenting
    /// `identity` to the signer.
    pub fn new(
        root_ca: &RootCA,
        identity: Option<&ClientIdentity>,
        urls: Vec<String>,
    ) -> Result<ExternalCa, SignerError> {
        Self::with_timeout(root_ca, identity, urls, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        root_ca: &RootCA,
        identity: Option<&ClientIdentity>,
        urls: Vec<String>,
        request_timeout: Duration,
    ) -> Result<ExternalCa, SignerError> {
        let mut builder = reqwest::Client::builder()
            .timeout(request_timeout)
            .tls_built_in_root_certs(false);

        for root in root_ca.roots() {
            let der = root
                .to_der()
                .map_err(|e| SignerError::Transport(e.to_string()))?;
            let cert = reqwest::Certificate::from_der(&der)?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(identity) = identity {
            // The key read-writer hands out traditional PEM; the TLS
            // stack wants PKCS#8.
            let key = PKey::private_key_from_pem(&identity.key_pem)
                .map_err(|e| SignerError::Transport(e.to_string()))?;
            let key_pkcs8 = key
                .private_key_to_pem_pkcs8()
                .map_err(|e| SignerError::Transport(e.to_string()))?;
            builder =
                builder.identity(reqwest::Identity::from_pkcs8_pem(&identity.cert_pem, &key_pkcs8)?);
        }

        Ok(ExternalCa {
            client: builder.build()?,
            urls: Mutex::new(urls),
            roots: root_ca.roots().to_vec(),
        })
    }

    /// Swap the signer URL list, e.g. after a manager-set change.
    pub fn update_urls(&self, urls: Vec<String>) {
        *self.urls.lock().unwrap() = urls;
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Submit a CSR, returning the signed PEM bundle. Walks the URL list
    /// in order; fails with [`SignerError::NoSignerAvailable`] once every
    /// URL has been tried.
    pub async fn sign(
        &self,
        csr_pem: &[u8],
        role: NodeRole,
        org: &str,
    ) -> Result<Vec<u8>, SignerError> {
        let urls = self.urls();
        let csr = String::from_utf8_lossy(csr_pem);
        let body = SignRequest {
            csr: &csr,
            role: role.organizational_unit(),
            org,
        };

        let mut attempts = 0;
        for url in &urls {
            attempts += 1;
            match self.submit(url, &body).await {
                Ok(bundle) => {
                    // Never hand back a bundle the pinned roots cannot
                    // verify.
                    validate_cert_chain(&self.roots, &bundle, false)?;
                    return Ok(bundle);
                }
                Err(e @ SignerError::Rejected(_)) => return Err(e),
                Err(e) => {
                    warn!(url = url.as_str(), error = %e, "external signer attempt failed");
                }
            }
        }
        Err(SignerError::NoSignerAvailable(attempts))
    }

    async fn submit(&self, url: &str, body: &SignRequest<'_>) -> Result<Vec<u8>, SignerError> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.bytes().await?.to_vec());
        }
        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(SignerError::Rejected(format!("{}: {}", status, detail)))
        } else {
            Err(SignerError::Transport(format!("{}: {}", status, detail)))
        }
    }
}
