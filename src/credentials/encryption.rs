//! AES-256-GCM sealing for the cached bearer token.
//!
//! A sealed value is a single string `<nonce>.<ciphertext>` (both base64) so it
//! fits one row of the key/value session cache.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Decodes a base64 master key and checks it is exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))
}

/// Encrypts `plaintext` with a fresh random nonce.
pub fn seal(plaintext: &str, key: &[u8]) -> Result<String> {
    let cipher = cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(format!("{}.{}", BASE64.encode(nonce), BASE64.encode(ciphertext)))
}

/// Reverses [`seal`]. Fails on a wrong key or a tampered value.
pub fn open(sealed: &str, key: &[u8]) -> Result<String> {
    let cipher = cipher(key)?;

    let (nonce_b64, ciphertext_b64) = sealed
        .split_once('.')
        .ok_or_else(|| anyhow!("Sealed value is missing the nonce separator"))?;

    let nonce_bytes = BASE64.decode(nonce_b64).context("Failed to decode nonce")?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        ));
    }
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .context("Failed to decode ciphertext")?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Vec<u8> {
        vec![7u8; KEY_SIZE]
    }

    #[test]
    fn test_seal_open() {
        let sealed = seal("eyJhbGciOi.token", &key()).unwrap();
        assert!(!sealed.contains("eyJhbGciOi"));
        assert_eq!(open(&sealed, &key()).unwrap(), "eyJhbGciOi.token");
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let a = seal("same", &key()).unwrap();
        let b = seal("same", &key()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = seal("secret", &key()).unwrap();
        assert!(open(&sealed, &[9u8; KEY_SIZE]).is_err());
    }

    #[test]
    fn test_tampered_value_rejected() {
        let sealed = seal("secret", &key()).unwrap();
        let (nonce, _) = sealed.split_once('.').unwrap();
        let forged = format!("{}.{}", nonce, BASE64.encode(b"not the ciphertext"));
        assert!(open(&forged, &key()).is_err());
        assert!(open("no-separator", &key()).is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key(&BASE64.encode([0u8; 32])).is_ok());
        assert!(validate_key(&BASE64.encode([0u8; 16])).is_err());
        assert!(validate_key("not base64!!").is_err());
    }
}
