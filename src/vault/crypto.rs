use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::Digest;

pub const NONCE_LEN: usize = 24;

pub fn random_key_32() -> [u8; 32] {
    let mut out = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Encrypt `plaintext`, returning `nonce || ciphertext+tag`.
pub fn seal_xchacha20poly1305(
    key_32: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, String> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key_32));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| "encrypt failed".to_string())?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal_xchacha20poly1305`].
pub fn open_xchacha20poly1305(
    key_32: &[u8; 32],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, String> {
    if sealed.len() <= NONCE_LEN {
        return Err("ciphertext too short".to_string());
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key_32));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| "decrypt failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_returns_plaintext() {
        let key = random_key_32();
        let sealed = seal_xchacha20poly1305(&key, b"plaintext", b"aad").unwrap();
        assert_eq!(
            open_xchacha20poly1305(&key, &sealed, b"aad").unwrap(),
            b"plaintext".to_vec()
        );
    }

    #[test]
    fn aead_rejects_tampered_ciphertext_or_aad() {
        let key = random_key_32();
        let aad = b"aifabrix:aad";
        let sealed = seal_xchacha20poly1305(&key, b"plaintext", aad).unwrap();

        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(open_xchacha20poly1305(&key, &tampered, aad).is_err());

        assert!(open_xchacha20poly1305(&key, &sealed, b"aifabrix:other-aad").is_err());
        assert!(open_xchacha20poly1305(&key, &sealed[..10], aad).is_err());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let key = random_key_32();
        let a = seal_xchacha20poly1305(&key, b"same", b"").unwrap();
        let b = seal_xchacha20poly1305(&key, b"same", b"").unwrap();
        assert_ne!(a, b);
    }
}
