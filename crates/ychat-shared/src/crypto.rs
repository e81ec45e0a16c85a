//! Session-encryption primitives: ephemeral X25519 agreement, BLAKE3 key
//! derivation and XChaCha20-Poly1305 message sealing.
//!
//! Nothing on the current chat path calls these yet; chat payloads travel
//! as plain JSON inside the authenticated transport. They are the building
//! blocks for end-to-end payload encryption in `Peer::send` and the read
//! loop.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

use crate::constants::{KDF_CONTEXT_SESSION_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// A sealed chat message: random nonce plus AEAD ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Fresh single-use key pair for one session key agreement.
pub fn generate_ephemeral_keypair() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Diffie-Hellman with the peer's ephemeral public key. Consumes the secret
/// so it cannot be reused for a second session.
pub fn derive_shared_secret(
    secret: EphemeralSecret,
    peer_public: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    let shared = secret.diffie_hellman(peer_public);
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(shared)
}

/// Hash the raw DH output into a symmetric key.
pub fn derive_symmetric_key(shared: &SharedSecret) -> SymmetricKey {
    blake3::derive_key(KDF_CONTEXT_SESSION_KEY, shared.as_bytes())
}

pub fn generate_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(nonce)
}

pub fn encrypt_message(key: &SymmetricKey, message: &str) -> Result<SealedMessage, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = generate_nonce()?;

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), message.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(SealedMessage { nonce, ciphertext })
}

pub fn decrypt_message(key: &SymmetricKey, sealed: &SealedMessage) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let plaintext = cipher
        .decrypt(XNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}
