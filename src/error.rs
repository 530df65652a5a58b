//! Error types shared across the certificate authority and the dispatcher.

use thiserror::Error;

/// Errors raised while validating or constructing trust material.
///
/// These surface verbatim to callers: the messages are part of the API and
/// are matched by operators and tests alike.
#[derive(Error, Debug)]
pub enum TrustError {
    /// A PEM block could not be decoded into a certificate
    #[error("Failed to decode certificate: {0}")]
    Malformed(String),

    /// The bundle contained no certificates at all
    #[error("no certificates to validate")]
    Empty,

    /// Adjacent certificates in the bundle are not issuer/subject pairs
    #[error("certificates do not form a chain")]
    NotAChain,

    /// No path from the leaf to any trusted root
    #[error("unknown authority: {0}")]
    UnknownAuthority(String),

    /// A certificate's not-before lies in the future
    #[error("certificate not yet valid: not valid before {0}")]
    NotYetValid(String),

    /// A certificate's not-after has passed
    #[error("certificate expired: not valid after {0}")]
    Expired(String),

    /// With expiry tolerance, the validity windows share no common instant
    #[error("there is no time span during which all certificates in the chain are valid")]
    NoTimeOverlap,

    /// Signature algorithm outside the approved set (SHA-1, DSA, ...)
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// RSA key below the minimum modulus size
    #[error("unsupported RSA key parameters")]
    UnsupportedRsaParameters,

    /// ECDSA curve below P-256
    #[error("unsupported ECDSA key parameters")]
    UnsupportedEcdsaParameters,

    /// The supplied private key does not match the certificate public key
    #[error("certificate key mismatch")]
    KeyMismatch,

    /// Cross-sign input was not a CA certificate
    #[error("certificate is not a CA certificate")]
    NotACA,

    /// A remote bundle did not hash to the pinned digest
    #[error("remote CA does not match fingerprint. Expected: {expected}, got: {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// The root bundle parsed but held no usable root
    #[error("no valid root CA certificates found")]
    NoValidRoots,

    /// The signer material parsed but held no usable certificate
    #[error("no valid signing CA certificates found")]
    NoValidSignerCert,

    /// This RootCA is verification-only
    #[error("no valid signer found")]
    NoValidSigner,

    /// No root bundle exists on disk
    #[error("no local root CA certificate found")]
    NoLocalRootCA,

    /// A private key PEM could not be parsed
    #[error("malformed private key")]
    MalformedKey,

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Errors from the remote signing path.
#[derive(Error, Debug)]
pub enum SignerError {
    /// Every configured signer URL failed
    #[error("no remote signer available after {0} attempts")]
    NoSignerAvailable(usize),

    /// The signer refused the request outright
    #[error("certificate request rejected: {0}")]
    Rejected(String),

    /// The signer returned a bundle that fails validation against the pool
    #[error(transparent)]
    InvalidResponse(#[from] TrustError),

    #[error("signer transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for SignerError {
    fn from(err: reqwest::Error) -> Self {
        SignerError::Transport(err.to_string())
    }
}

/// Errors from the on-disk key pair read/write path.
#[derive(Error, Debug)]
pub enum KeyError {
    /// Certificate or key file is absent
    #[error("no certificate or key found on disk")]
    NotFound,

    /// The key is encrypted and neither KEK slot can unlock it
    #[error("key is encrypted and could not be decrypted with any available key")]
    Undecryptable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Errors from the in-memory store.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// Create on an id that already exists
    #[error("object already exists in store")]
    Exist,

    /// Update or delete on an id that does not exist
    #[error("object does not exist in store")]
    NotFound,
}

/// Errors from the dispatcher contract.
#[derive(Error, Debug)]
pub enum DispatcherError {
    /// No registered entry for the node id
    #[error("node not registered")]
    NodeNotRegistered,

    /// A registration collided with a live entry for the same identity
    #[error("node already registered")]
    AlreadyRegistered,

    /// The session in use is no longer valid; the node must re-register
    #[error("session invalid")]
    InvalidSession,

    #[error(transparent)]
    Store(#[from] StoreError),
}
