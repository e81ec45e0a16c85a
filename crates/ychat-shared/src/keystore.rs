//! Passphrase-protected storage of the identity key.
//!
//! The key file holds a single base64 string:
//!
//! ```text
//! base64( salt[16] || nonce[12] || ChaCha20-Poly1305(secret_key[32]) )
//! ```
//!
//! The symmetric key is derived from the passphrase with Argon2id, so an
//! offline guess costs a full memory-hard derivation. The AEAD tag turns a
//! wrong passphrase or a modified file into [`KeystoreError::Authentication`].

use std::fs;
use std::io::Write;
use std::path::Path;

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::constants::{KEYFILE_NONCE_SIZE, SALT_SIZE, SECRET_KEY_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, KeystoreError};
use crate::identity::Identity;

/// Poly1305 tag appended by the AEAD.
const TAG_SIZE: usize = 16;

/// Generate a new identity. Thin wrapper kept next to the file helpers so
/// callers bootstrapping a node only need this module.
pub fn generate_identity_key() -> Result<Identity, CryptoError> {
    Identity::generate()
}

/// Encrypt `identity` under `passphrase` and write it to `path`.
///
/// A fresh salt and nonce are drawn on every call, so saving the same key
/// twice produces different files. On Unix the file is created with mode
/// `0600`.
pub fn encrypt_and_save_identity_key(
    passphrase: &str,
    identity: &Identity,
    path: &Path,
) -> Result<(), KeystoreError> {
    let mut salt = [0u8; SALT_SIZE];
    fill_random(&mut salt)?;
    let mut nonce_bytes = [0u8; KEYFILE_NONCE_SIZE];
    fill_random(&mut nonce_bytes)?;

    let key = derive_file_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new((&key).into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), identity.secret_bytes().as_slice())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut combined = Vec::with_capacity(SALT_SIZE + KEYFILE_NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&salt);
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    let encoded = BASE64.encode(combined);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_private_file(path, encoded.as_bytes())?;

    info!(path = %path.display(), pubkey = %identity.public_key_hex(), "Identity key saved");
    Ok(())
}

/// Read the key file at `path` and decrypt it with `passphrase`.
pub fn load_and_decrypt_key(passphrase: &str, path: &Path) -> Result<Identity, KeystoreError> {
    let data = fs::read_to_string(path)?;
    let decoded = BASE64
        .decode(data.trim())
        .map_err(|e| KeystoreError::Format(format!("invalid base64: {e}")))?;

    if decoded.len() < SALT_SIZE + KEYFILE_NONCE_SIZE + TAG_SIZE {
        return Err(KeystoreError::Format(format!(
            "file too short: {} bytes",
            decoded.len()
        )));
    }

    let (salt, rest) = decoded.split_at(SALT_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(KEYFILE_NONCE_SIZE);

    let key = derive_file_key(passphrase, salt)?;
    let cipher = ChaCha20Poly1305::new((&key).into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| KeystoreError::Authentication)?;

    let secret: [u8; SECRET_KEY_SIZE] = plaintext.as_slice().try_into().map_err(|_| {
        KeystoreError::Format(format!(
            "expected {SECRET_KEY_SIZE}-byte secret key, got {}",
            plaintext.len()
        ))
    })?;

    let identity = Identity::from_secret_bytes(&secret);
    debug!(path = %path.display(), pubkey = %identity.public_key_hex(), "Identity key decrypted");
    Ok(identity)
}

/// Load the identity at `path`, or generate and save a new one when the file
/// does not exist yet (first run).
pub fn ensure_identity(passphrase: &str, path: &Path) -> Result<Identity, KeystoreError> {
    if path.exists() {
        return load_and_decrypt_key(passphrase, path);
    }

    info!(path = %path.display(), "No identity found, generating a new one");
    let identity = generate_identity_key()?;
    encrypt_and_save_identity_key(passphrase, &identity, path)?;
    Ok(identity)
}

fn derive_file_key(passphrase: &str, salt: &[u8]) -> Result<[u8; SYMMETRIC_KEY_SIZE], CryptoError> {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::Entropy(e.to_string()))
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
