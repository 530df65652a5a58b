//! Key Read-Writer Module
//!
//! Scoped, atomic persistence of a node's PEM certificate/key pair with
//! optional at-rest encryption of the private key under a key-encryption
//! key (KEK). Two KEK slots are kept: the active one and, during a rolling
//! rotation, the previous one. A key unlocked with the previous KEK is
//! re-wrapped under the active KEK the next time the pair is written,
//! because every write re-encrypts under the active KEK.
//!
//! # File format
//!
//! The certificate is a plain `CERTIFICATE` PEM bundle (mode 0644). The
//! key is a traditional `EC PRIVATE KEY` PEM (mode 0600); when a KEK is
//! active it carries the legacy encryption headers:
//!
//! ```text
//! Proc-Type: 4,ENCRYPTED
//! DEK-Info: AES-256-CBC,<iv-hex>
//! ```
//!
//! # Atomicity
//!
//! Both files are written to sibling `.tmp` paths and renamed into place.
//! If a rename fails mid-way the previously consistent pair is restored,
//! so a reader never observes a half-updated pair.

use crate::configs::CertPaths;
use crate::error::KeyError;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use secrecy::{ExposeSecret, Secret};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Mutex;

/// Marker header present in every legacy-encrypted PEM block.
const ENCRYPTED_PEM_HEADER: &str = "Proc-Type: 4,ENCRYPTED";

const CERT_FILE_MODE: u32 = 0o644;
const KEY_FILE_MODE: u32 = 0o600;

/// Requested change to the active KEK on a write.
pub enum KekUpdate {
    /// Keep whatever KEK is currently active.
    Keep,
    /// Replace the active KEK; `None` clears encryption entirely.
    Set(Option<Secret<Vec<u8>>>),
}

struct KekSlots {
    current: Option<Secret<Vec<u8>>>,
    previous: Option<Secret<Vec<u8>>>,
}

/// Serialized reader/writer for one on-disk certificate/key pair.
pub struct KeyReadWriter {
    paths: CertPaths,
    slots: Mutex<KekSlots>,
}

impl KeyReadWriter {
    pub fn new(paths: CertPaths, kek: Option<Vec<u8>>, previous_kek: Option<Vec<u8>>) -> Self {
        Self {
            paths,
            slots: Mutex::new(KekSlots {
                current: kek.map(Secret::new),
                previous: previous_kek.map(Secret::new),
            }),
        }
    }

    pub fn paths(&self) -> &CertPaths {
        &self.paths
    }

    /// Read the pair from disk. The returned key PEM is decrypted.
    ///
    /// Fails with [`KeyError::NotFound`] when either file is absent and
    /// [`KeyError::Undecryptable`] when the key is encrypted and neither
    /// KEK slot unlocks it.
    pub fn read(&self) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
        let cert_pem = read_pem(&self.paths.cert)?;
        let key_pem = read_pem(&self.paths.key)?;

        let slots = self.slots.lock().unwrap();
        let key_pem = decrypt_key_pem(&key_pem, &slots)?;
        Ok((cert_pem, key_pem))
    }

    /// Atomically persist the pair. `key_pem` must be a plaintext key PEM;
    /// it is encrypted under the active KEK (after applying `kek_update`)
    /// before touching disk.
    pub fn write(
        &self,
        cert_pem: &[u8],
        key_pem: &[u8],
        kek_update: KekUpdate,
    ) -> Result<(), KeyError> {
        let mut slots = self.slots.lock().unwrap();

        let target = match kek_update {
            KekUpdate::Keep => slots
                .current
                .as_ref()
                .map(|kek| Secret::new(kek.expose_secret().clone())),
            KekUpdate::Set(kek) => kek,
        };

        let key_bytes = match &target {
            Some(kek) => encrypt_key_pem(key_pem, kek.expose_secret())?,
            None => key_pem.to_vec(),
        };

        write_pair_atomically(&self.paths, cert_pem, &key_bytes)?;

        // The write is the rewrap point: once the new pair is on disk the
        // previous KEK can no longer unlock anything we own.
        slots.current = target;
        slots.previous = None;
        Ok(())
    }

    /// Re-encrypt the on-disk key under `new_kek`, discarding the previous
    /// KEK slot.
    pub fn rotate_kek(&self, new_kek: Option<Vec<u8>>) -> Result<(), KeyError> {
        let (cert_pem, key_pem) = self.read()?;
        self.write(&cert_pem, &key_pem, KekUpdate::Set(new_kek.map(Secret::new)))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, KeyError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(KeyError::NotFound),
        Err(e) => Err(e.into()),
    }
}

fn decrypt_key_pem(key_pem: &[u8], slots: &KekSlots) -> Result<Vec<u8>, KeyError> {
    if !pem_is_encrypted(key_pem) {
        // Parse to catch corrupt material early.
        PKey::private_key_from_pem(key_pem)?;
        return Ok(key_pem.to_vec());
    }

    for kek in [&slots.current, &slots.previous].into_iter().flatten() {
        if let Ok(key) = PKey::private_key_from_pem_passphrase(key_pem, kek.expose_secret()) {
            return Ok(private_key_to_plain_pem(&key)?);
        }
    }
    Err(KeyError::Undecryptable)
}

fn encrypt_key_pem(key_pem: &[u8], passphrase: &[u8]) -> Result<Vec<u8>, KeyError> {
    let key = PKey::private_key_from_pem(key_pem)?;
    let ec_key = key.ec_key()?;
    Ok(ec_key.private_key_to_pem_passphrase(Cipher::aes_256_cbc(), passphrase)?)
}

fn private_key_to_plain_pem(key: &PKey<Private>) -> Result<Vec<u8>, KeyError> {
    let ec_key = key.ec_key()?;
    Ok(ec_key.private_key_to_pem()?)
}

/// True when the PEM block carries the legacy encryption header.
pub fn pem_is_encrypted(pem: &[u8]) -> bool {
    // The header sits in the first few lines; a lossy scan is fine since
    // PEM is ASCII.
    String::from_utf8_lossy(pem).contains(ENCRYPTED_PEM_HEADER)
}

fn write_pair_atomically(
    paths: &CertPaths,
    cert_pem: &[u8],
    key_bytes: &[u8],
) -> Result<(), KeyError> {
    if let Some(parent) = paths.cert.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Some(parent) = paths.key.parent() {
        fs::create_dir_all(parent)?;
    }

    let cert_tmp = paths.cert.with_extension("pem.tmp");
    let key_tmp = paths.key.with_extension("pem.tmp");

    write_with_mode(&cert_tmp, cert_pem, CERT_FILE_MODE)?;
    write_with_mode(&key_tmp, key_bytes, KEY_FILE_MODE)?;

    let prior_cert = fs::read(&paths.cert).ok();

    if let Err(e) = fs::rename(&cert_tmp, &paths.cert) {
        let _ = fs::remove_file(&cert_tmp);
        let _ = fs::remove_file(&key_tmp);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&key_tmp, &paths.key) {
        // Roll the certificate back so the old pair stays consistent.
        if let Some(prior) = prior_cert {
            let _ = write_with_mode(&paths.cert, &prior, CERT_FILE_MODE);
        } else {
            let _ = fs::remove_file(&paths.cert);
        }
        let _ = fs::remove_file(&key_tmp);
        return Err(e.into());
    }
    Ok(())
}

fn write_with_mode(path: &Path, bytes: &[u8], mode: u32) -> Result<(), KeyError> {
    fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}
