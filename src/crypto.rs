//! Optional encryption of the segmentation cookie payload.
//!
//! When the host configures the two secrets, the codec's plaintext is sealed
//! with AES-256-GCM and carried as URL-safe base64. The authenticated tag
//! makes the cookie tamper-evident: a forged or foreign payload fails to
//! open and is treated exactly like an absent cookie, never as an error.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use tracing::error;

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for the segmentation cookie.
///
/// The key is SHA-256 of the configured key material; the nonce is the first
/// twelve bytes of SHA-256 of the configured IV material. Both secrets are
/// request-independent, so equal registry state produces an equal cookie —
/// the front-line cache relies on that stability for its variant key.
pub struct CookieCipher {
    cipher: Aes256Gcm,
    nonce: [u8; NONCE_LEN],
}

impl CookieCipher {
    /// Build a cipher from the configured key and IV material.
    ///
    /// # Panics
    ///
    /// Panics when either secret is empty. Half-configured encryption is a
    /// deployment mistake; refusing to start beats silently issuing
    /// plaintext cookies.
    pub fn from_secrets(key_material: &str, iv_material: &str) -> Self {
        assert!(
            !key_material.is_empty(),
            "segmentation cookie encryption requires non-empty key material"
        );
        assert!(
            !iv_material.is_empty(),
            "segmentation cookie encryption requires non-empty IV material"
        );

        let key: [u8; 32] = Sha256::digest(key_material.as_bytes()).into();
        let digest: [u8; 32] = Sha256::digest(iv_material.as_bytes()).into();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);

        Self {
            cipher: Aes256Gcm::new(&key.into()),
            nonce,
        }
    }

    /// Seal a codec payload for transport.
    ///
    /// The empty payload stays empty: "no state" serializes to "no cookie"
    /// in both modes.
    pub fn seal(&self, plaintext: &str) -> String {
        if plaintext.is_empty() {
            return String::new();
        }
        match self
            .cipher
            .encrypt(Nonce::from_slice(&self.nonce), plaintext.as_bytes())
        {
            Ok(ciphertext) => URL_SAFE_NO_PAD.encode(ciphertext),
            Err(_) => {
                error!("segmentation cookie encryption failed; clearing payload");
                String::new()
            }
        }
    }

    /// Open a transported payload back into codec plaintext.
    ///
    /// Returns `None` when the payload is not valid base64, fails tag
    /// verification, or does not decrypt to UTF-8 — the caller treats all
    /// three exactly like an empty cookie.
    pub fn open(&self, payload: &str) -> Option<String> {
        if payload.is_empty() {
            return Some(String::new());
        }
        let ciphertext = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&self.nonce), ciphertext.as_slice())
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}
