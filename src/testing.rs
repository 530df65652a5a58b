//! Certificate fixtures shared by the module test suites.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use std::time::{SystemTime, UNIX_EPOCH};

const DAY: i64 = 86_400;

/// Validity window (seconds relative to now) and signature digest for a
/// generated certificate.
pub(crate) struct CertSpec {
    not_before_offset: i64,
    not_after_offset: i64,
    digest: MessageDigest,
}

impl Default for CertSpec {
    fn default() -> Self {
        Self {
            not_before_offset: -60,
            not_after_offset: 365 * DAY,
            digest: MessageDigest::sha256(),
        }
    }
}

impl CertSpec {
    pub(crate) fn window(not_before_offset: i64, not_after_offset: i64) -> Self {
        Self {
            not_before_offset,
            not_after_offset,
            ..Self::default()
        }
    }

    pub(crate) fn sha1(mut self) -> Self {
        self.digest = MessageDigest::sha1();
        self
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn gen_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn gen_cert(
    cn: &str,
    issuer: Option<&(X509, PKey<Private>)>,
    ca: bool,
    spec: CertSpec,
) -> (X509, PKey<Private>) {
    let key = gen_key();

    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some((issuer_cert, _)) => builder.set_issuer_name(issuer_cert.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }

    let now = now_unix();
    builder
        .set_not_before(&Asn1Time::from_unix(now + spec.not_before_offset).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + spec.not_after_offset).unwrap())
        .unwrap();

    builder.set_pubkey(&key).unwrap();

    let mut bc = BasicConstraints::new();
    bc.critical();
    if ca {
        bc.ca();
    }
    builder.append_extension(bc.build().unwrap()).unwrap();

    let mut ku = KeyUsage::new();
    ku.critical();
    if ca {
        ku.key_cert_sign().crl_sign();
    }
    ku.digital_signature();
    builder.append_extension(ku.build().unwrap()).unwrap();

    let signing_key = issuer.map(|(_, k)| k).unwrap_or(&key);
    builder.sign(signing_key, spec.digest).unwrap();

    (builder.build(), key)
}

/// Generate a CA certificate; self-signed when `issuer` is `None`.
pub(crate) fn gen_ca_cert(
    cn: &str,
    issuer: Option<&(X509, PKey<Private>)>,
    spec: CertSpec,
) -> (X509, PKey<Private>) {
    gen_cert(cn, issuer, true, spec)
}

/// Generate an end-entity certificate signed by `issuer`.
pub(crate) fn gen_leaf_cert(
    cn: &str,
    issuer: &(X509, PKey<Private>),
    spec: CertSpec,
) -> (X509, PKey<Private>) {
    gen_cert(cn, Some(issuer), false, spec)
}

/// Concatenate certificates into one PEM bundle.
pub(crate) fn chain_pem(certs: &[&X509]) -> Vec<u8> {
    let mut bundle = Vec::new();
    for cert in certs {
        bundle.extend_from_slice(&cert.to_pem().unwrap());
    }
    bundle
}

/// PEM-encode a private key in its traditional form.
pub(crate) fn key_pem(key: &PKey<Private>) -> Vec<u8> {
    key.ec_key().unwrap().private_key_to_pem().unwrap()
}
