use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed ciphertext")]
    Malformed,
}

/// Seal a wallet private key with AES-256-GCM. Output is hex of
/// nonce || ciphertext; the nonce is random per call.
pub fn seal_key(key: &[u8; 32], plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Open a sealed wallet key. Callers must drop the result as soon as the
/// broadcast call returns; decrypted material never crosses a request
/// boundary.
pub fn open_key(key: &[u8; 32], sealed_hex: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = hex::decode(sealed_hex).map_err(|_| CryptoError::Malformed)?;
    if raw.len() < NONCE_LEN + 1 {
        return Err(CryptoError::Malformed);
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [42u8; 32];
        let secret = b"xprv-test-material";
        let sealed = seal_key(&key, secret).unwrap();
        assert_ne!(sealed, hex::encode(secret));
        assert_eq!(open_key(&key, &sealed).unwrap(), secret);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal_key(&[1u8; 32], b"secret").unwrap();
        assert!(matches!(
            open_key(&[2u8; 32], &sealed),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn nonce_is_random() {
        let key = [9u8; 32];
        let a = seal_key(&key, b"same").unwrap();
        let b = seal_key(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        assert!(matches!(
            open_key(&[0u8; 32], "abcdef"),
            Err(CryptoError::Malformed)
        ));
    }
}
