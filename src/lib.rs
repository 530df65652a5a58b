//! Armada - Cluster Trust and Membership Core
//!
//! The security and membership backbone of a cluster orchestration plane,
//! in two cooperating subsystems:
//!
//! ```text
//! Root CA (self-signed, ~20 years)
//!   └── optional intermediates (cross-signed during root rotation)
//!       └── node leaf certificates (mTLS identity, role in OU)
//!
//! node ──Register──▶ Dispatcher ──▶ session + heartbeat deadline
//!      ◀──Tasks────  (store-watch driven full task set)
//!      ◀──Session──  (manager peers, reconnect hints)
//! ```
//!
//! # Certificate Authority
//!
//! - [`root_authority::RootCA`]: byte-exact trusted root bundle, content
//!   digest for pinning, optional local signer with an intermediate chain
//!   prepended to every emitted leaf. Creation ([`root_authority::RootCA::create_root_ca`]),
//!   reload, CSR signing with server-side subject override, and
//!   cross-signing for root rotation.
//! - [`chain_validation::validate_cert_chain`]: ordered-bundle chain
//!   validation with an expiry-tolerant mode for rotation windows, plus
//!   the approved-algorithm policy (no SHA-1, no DSA, RSA 2048 and up,
//!   ECDSA P-256 and up).
//! - [`key_read_writer::KeyReadWriter`]: atomic persistence of the node
//!   PEM pair, optional KEK encryption at rest with a rolling
//!   previous-KEK slot.
//! - [`external_signer::ExternalCa`]: mTLS client for remote signing
//!   endpoints with URL rotation.
//! - [`lifecycle`]: request/renew/save of the node identity, digest-pinned
//!   remote CA bootstrap, auto-lock handling for manager keys.
//!
//! # Dispatcher
//!
//! - [`dispatcher::Dispatcher`]: node registration with per-registration
//!   session identifiers, jittered heartbeat liveness, task state
//!   streaming, and manager gossip, backed by the watchable
//!   [`store::MemoryStore`].
//! - [`heartbeat::Heartbeat`]: self-rescheduling deadline with a
//!   fire-once timeout callback.
//! - [`watch::WatchQueue`]: bounded, filtered per-subscriber event queues
//!   over store changes.
//!
//! # Security Considerations
//!
//! - Subject names and SANs of issued leaves are always server-supplied;
//!   CSR-provided names are discarded.
//! - Private keys at rest: `0600`, optionally encrypted (traditional PEM,
//!   `DEK-Info: AES-256-CBC`); certificates `0644`.
//! - Root key passphrases come from the environment and are captured once
//!   at construction, with a previous slot for rolling rotation.
//! - Session identifiers are high-entropy, never logged, and invalidated
//!   by every re-registration; authorization stays with the TLS layer.

pub mod chain_validation;
pub mod configs;
pub mod dispatcher;
pub mod error;
pub mod external_signer;
pub mod heartbeat;
pub mod key_read_writer;
pub mod lifecycle;
pub mod messages;
pub mod root_authority;
pub mod store;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use chain_validation::validate_cert_chain;
pub use configs::{AppConfig, CertificatePaths, DispatcherConfig, PassphraseSlots};
pub use dispatcher::Dispatcher;
pub use error::{DispatcherError, KeyError, SignerError, StoreError, TrustError};
pub use external_signer::ExternalCa;
pub use heartbeat::Heartbeat;
pub use key_read_writer::{KekUpdate, KeyReadWriter};
pub use lifecycle::{
    get_remote_ca, renew_tls_config, request_and_save_new_certificates, CertificateIssuer,
    CertificateRequestConfig, IssueResponse,
};
pub use messages::{
    Node, NodeRole, NodeSpec, NodeState, SessionMessage, Task, TaskState, TasksMessage,
};
pub use root_authority::{
    generate_new_csr, get_local_root_ca, save_root_ca, BundleDigest, RootCA,
};
pub use store::MemoryStore;
