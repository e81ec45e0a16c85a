use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Entropy source failure: {0}")]
    Entropy(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Key agreement produced a non-contributory shared secret")]
    NonContributory,
}

/// Failures while persisting or loading the encrypted identity file.
#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Identity file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed identity file: {0}")]
    Format(String),

    #[error("Wrong passphrase or tampered identity file")]
    Authentication,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
