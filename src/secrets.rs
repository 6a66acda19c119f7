use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::config::LaunchConfig;

// At-rest format for launch-config blobs: base64(salt | nonce | ciphertext).
// AES-256-GCM with a PBKDF2-SHA256 derived key; the GCM tag is appended to
// the ciphertext by the cipher itself.

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug)]
pub enum SecretError {
    Malformed(String),
    Crypto(String),
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretError::Malformed(msg) => write!(f, "malformed blob: {msg}"),
            SecretError::Crypto(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SecretError {}

fn derive_key(key_source: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(key_source.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

pub fn encrypt_blob(key_source: &str, plaintext: &str) -> Result<String, SecretError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(key_source, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| SecretError::Crypto(format!("encrypt: {e}")))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(B64.encode(out))
}

pub fn decrypt_blob(key_source: &str, blob: &str) -> Result<String, SecretError> {
    let raw = B64
        .decode(blob.trim())
        .map_err(|e| SecretError::Malformed(format!("base64: {e}")))?;
    if raw.len() <= SALT_LEN + NONCE_LEN {
        return Err(SecretError::Malformed("blob too short".into()));
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(key_source, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| SecretError::Crypto("decrypt failed (wrong key or corrupt blob)".into()))?;
    String::from_utf8(plaintext).map_err(|e| SecretError::Malformed(format!("utf8: {e}")))
}

pub fn encrypt_launch_config(
    key_source: &str,
    config: &LaunchConfig,
) -> Result<String, SecretError> {
    let json = serde_json::to_string(config)
        .map_err(|e| SecretError::Malformed(format!("serialize: {e}")))?;
    encrypt_blob(key_source, &json)
}

pub fn decrypt_launch_config(key_source: &str, blob: &str) -> Result<LaunchConfig, SecretError> {
    let json = decrypt_blob(key_source, blob)?;
    serde_json::from_str(&json).map_err(|e| SecretError::Malformed(format!("deserialize: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let blob = encrypt_blob("token-abc", "{\"command\":\"echo\"}").unwrap();
        let plain = decrypt_blob("token-abc", &blob).unwrap();
        assert_eq!(plain, "{\"command\":\"echo\"}");
    }

    #[test]
    fn wrong_key_fails() {
        let blob = encrypt_blob("token-abc", "secret").unwrap();
        assert!(decrypt_blob("token-xyz", &blob).is_err());
    }

    #[test]
    fn fresh_salt_and_nonce_per_encryption() {
        let a = encrypt_blob("k", "same").unwrap();
        let b = encrypt_blob("k", "same").unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt_blob("k", &a).unwrap(), decrypt_blob("k", &b).unwrap());
    }

    #[test]
    fn truncated_blob_is_malformed() {
        let err = decrypt_blob("k", "AAAA").unwrap_err();
        assert!(matches!(err, SecretError::Malformed(_)));
    }

    #[test]
    fn launch_config_roundtrip() {
        let cfg = LaunchConfig {
            command: Some("npx".into()),
            args: vec!["server".into()],
            ..Default::default()
        };
        let blob = encrypt_launch_config("k", &cfg).unwrap();
        let back = decrypt_launch_config("k", &blob).unwrap();
        assert_eq!(back.command.as_deref(), Some("npx"));
        assert_eq!(back.args, vec!["server".to_string()]);
    }
}
