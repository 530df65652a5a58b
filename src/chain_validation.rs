//! Certificate chain validation.
//!
//! Validates an ordered PEM bundle (leaf first) against a set of trusted
//! roots, with an optional tolerance for expired certificates used while
//! re-establishing trust during root rotation. Also home of the
//! approved-algorithm policy enforced on every certificate the authority
//! touches.

use crate::error::TrustError;
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKeyRef};
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509StoreContext, X509VerifyResult, X509};

/// Signature algorithms accepted anywhere in a chain. DSA and anything
/// based on SHA-1 are rejected.
const APPROVED_SIGNATURE_ALGORITHMS: &[Nid] = &[
    Nid::ECDSA_WITH_SHA256,
    Nid::ECDSA_WITH_SHA384,
    Nid::ECDSA_WITH_SHA512,
    Nid::SHA256WITHRSAENCRYPTION,
    Nid::SHA384WITHRSAENCRYPTION,
    Nid::SHA512WITHRSAENCRYPTION,
];

const MIN_RSA_MODULUS_BITS: i32 = 2048;

const APPROVED_EC_CURVES: &[Nid] = &[Nid::X9_62_PRIME256V1, Nid::SECP384R1, Nid::SECP521R1];

/// Parse a PEM bundle into its ordered certificates.
///
/// Fails with [`TrustError::Empty`] when the input holds no certificates
/// and [`TrustError::Malformed`] when a block does not decode.
pub fn parse_certificates_pem(pem: &[u8]) -> Result<Vec<X509>, TrustError> {
    if pem.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(TrustError::Empty);
    }
    let certs = X509::stack_from_pem(pem).map_err(|e| TrustError::Malformed(e.to_string()))?;
    if certs.is_empty() {
        return Err(TrustError::Empty);
    }
    Ok(certs)
}

/// Parse a PEM bundle expected to hold exactly one certificate.
pub fn parse_certificate_pem(pem: &[u8]) -> Result<X509, TrustError> {
    let mut certs = parse_certificates_pem(pem)?;
    Ok(certs.remove(0))
}

/// Validate `bundle` (leaf first, intermediates following in issuing
/// order) against `roots` and return the parsed bundle.
///
/// With `allow_expiry` set, expired certificates are tolerated as long as
/// a common validity instant exists across the bundle and at least one
/// root; future-dated certificates are never accepted.
pub fn validate_cert_chain(
    roots: &[X509],
    bundle: &[u8],
    allow_expiry: bool,
) -> Result<Vec<X509>, TrustError> {
    let certs = parse_certificates_pem(bundle)?;

    // Adjacency: each certificate must be issued by its successor.
    for pair in certs.windows(2) {
        let (cert, issuer) = (&pair[0], &pair[1]);
        if issuer.issued(cert) != X509VerifyResult::OK
            || !cert.verify(issuer.public_key()?.as_ref())?
        {
            return Err(TrustError::NotAChain);
        }
    }

    check_time_windows(&certs, roots, allow_expiry)?;

    // Chain building. Time semantics were enforced above, so with expiry
    // tolerance the store check runs with time checking disabled.
    let store = build_root_store(roots, allow_expiry)?;
    let mut untrusted = Stack::new()?;
    for intermediate in &certs[1..] {
        untrusted.push(intermediate.clone())?;
    }
    let mut context = X509StoreContext::new()?;
    let (verified, verify_error) = context.init(&store, &certs[0], &untrusted, |c| {
        let verified = c.verify_cert()?;
        Ok((verified, c.error()))
    })?;
    if !verified {
        return Err(map_verify_error(verify_error));
    }

    for cert in &certs {
        check_certificate_policy(cert)?;
    }

    Ok(certs)
}

/// Build a verification store from trusted roots.
pub(crate) fn build_root_store(
    roots: &[X509],
    no_check_time: bool,
) -> Result<X509Store, ErrorStack> {
    let mut builder = X509StoreBuilder::new()?;
    for root in roots {
        builder.add_cert(root.clone())?;
    }
    if no_check_time {
        builder.set_flags(X509VerifyFlags::NO_CHECK_TIME)?;
    }
    Ok(builder.build())
}

fn map_verify_error(result: X509VerifyResult) -> TrustError {
    let reason = result.error_string().to_string();
    if reason.contains("expired") {
        TrustError::Expired(reason)
    } else if reason.contains("not yet valid") {
        TrustError::NotYetValid(reason)
    } else {
        TrustError::UnknownAuthority(reason)
    }
}

/// Convert an ASN.1 time to seconds since the Unix epoch.
pub(crate) fn asn1_to_unix(time: &Asn1TimeRef) -> Result<i64, ErrorStack> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

fn check_time_windows(
    certs: &[X509],
    roots: &[X509],
    allow_expiry: bool,
) -> Result<(), TrustError> {
    let now = Asn1Time::days_from_now(0)?;
    let now_secs = asn1_to_unix(&now)?;

    let mut window_start = i64::MIN;
    let mut window_end = i64::MAX;
    for cert in certs {
        let not_before = asn1_to_unix(cert.not_before())?;
        let not_after = asn1_to_unix(cert.not_after())?;

        // Future-dated certificates are rejected in both modes.
        if not_before > now_secs {
            return Err(TrustError::NotYetValid(format!(
                "not valid before {}",
                cert.not_before()
            )));
        }
        if !allow_expiry && not_after < now_secs {
            return Err(TrustError::Expired(format!(
                "not valid after {}",
                cert.not_after()
            )));
        }
        window_start = window_start.max(not_before);
        window_end = window_end.min(not_after);
    }

    if allow_expiry {
        if window_start > window_end {
            return Err(TrustError::NoTimeOverlap);
        }
        // Some root must share an instant with the bundle's window.
        let mut overlaps_root = false;
        for root in roots {
            let root_start = asn1_to_unix(root.not_before())?;
            let root_end = asn1_to_unix(root.not_after())?;
            if window_start.max(root_start) <= window_end.min(root_end) {
                overlaps_root = true;
                break;
            }
        }
        if !overlaps_root {
            return Err(TrustError::NoTimeOverlap);
        }
    }
    Ok(())
}

/// Reject certificates signed or keyed outside the approved set.
pub fn check_certificate_policy(cert: &X509) -> Result<(), TrustError> {
    let sig_nid = cert.signature_algorithm().object().nid();
    if !APPROVED_SIGNATURE_ALGORITHMS.contains(&sig_nid) {
        return Err(TrustError::UnsupportedAlgorithm(
            sig_nid.long_name().unwrap_or("unknown").to_string(),
        ));
    }
    check_key_policy(cert.public_key()?.as_ref())
}

/// Approved public key parameters: RSA with a modulus of at least 2048
/// bits, ECDSA on P-256 or stronger.
pub fn check_key_policy<T: HasPublic>(key: &PKeyRef<T>) -> Result<(), TrustError> {
    use openssl::pkey::Id;
    match key.id() {
        Id::RSA => {
            let rsa = key.rsa()?;
            if rsa.n().num_bits() < MIN_RSA_MODULUS_BITS {
                return Err(TrustError::UnsupportedRsaParameters);
            }
            Ok(())
        }
        Id::EC => {
            let ec = key.ec_key()?;
            match ec.group().curve_name() {
                Some(curve) if APPROVED_EC_CURVES.contains(&curve) => Ok(()),
                _ => Err(TrustError::UnsupportedEcdsaParameters),
            }
        }
        Id::DSA => Err(TrustError::UnsupportedAlgorithm("DSA".to_string())),
        _ => Err(TrustError::UnsupportedAlgorithm(
            "unsupported key type".to_string(),
        )),
    }
}
