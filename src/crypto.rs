//! Credential store for mailbox passwords.
//!
//! Passwords are sealed with AES-256-GCM under a single master key. The
//! ciphertext layout is `base64(nonce || ciphertext || tag)`.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use keyring::Entry;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::info;
use zeroize::Zeroize;

pub const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

const KEYRING_SERVICE: &str = "mailsync";
const KEYRING_USER: &str = "master_key";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid master key: {0}")]
    InvalidKey(String),
    #[error("Encryption failed")]
    Seal,
    #[error("Decryption failed - invalid key or corrupted data")]
    Open,
    #[error("Malformed ciphertext: {0}")]
    Malformed(String),
    #[error("Random number generator failure")]
    Rng,
    #[error("Keyring error: {0}")]
    Keyring(String),
}

pub struct CredentialCipher {
    key_bytes: [u8; KEY_LEN],
    rng: SystemRandom,
}

impl Drop for CredentialCipher {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl CredentialCipher {
    pub fn new(key_bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key_bytes,
            rng: SystemRandom::new(),
        }
    }

    pub fn from_base64_key(encoded: &str) -> Result<Self, CryptoError> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        if decoded.len() != KEY_LEN {
            let len = decoded.len();
            decoded.zeroize();
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN, len
            )));
        }

        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self::new(key_bytes))
    }

    fn sealing_key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key_bytes)
            .map_err(|_| CryptoError::InvalidKey("rejected by AES-256-GCM".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let key = self.sealing_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Rng)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(STANDARD.encode(&sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let data = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;

        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed("ciphertext too short".to_string()));
        }

        let key = self.sealing_key()?;
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::Malformed("invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Open)?;

        let result = String::from_utf8(plaintext.to_vec())
            .map_err(|e| CryptoError::Malformed(e.to_string()));
        in_out.zeroize();
        result
    }
}

/// Fresh random master key, base64 encoded.
pub fn generate_key() -> Result<String, CryptoError> {
    let mut key = [0u8; KEY_LEN];
    SystemRandom::new().fill(&mut key).map_err(|_| CryptoError::Rng)?;
    let encoded = STANDARD.encode(key);
    key.zeroize();
    Ok(encoded)
}

/// Uses the configured key when present, otherwise the one kept in the OS keyring,
/// creating and storing a new key on first use.
pub fn resolve_master_key(configured: Option<&str>) -> Result<CredentialCipher, CryptoError> {
    if let Some(key) = configured.filter(|k| !k.trim().is_empty()) {
        return CredentialCipher::from_base64_key(key);
    }

    let entry = Entry::new(KEYRING_SERVICE, KEYRING_USER)
        .map_err(|e| CryptoError::Keyring(e.to_string()))?;

    match entry.get_password() {
        Ok(stored) => CredentialCipher::from_base64_key(&stored),
        Err(keyring::Error::NoEntry) => {
            let key = generate_key()?;
            entry
                .set_password(&key)
                .map_err(|e| CryptoError::Keyring(e.to_string()))?;
            info!("Generated a new master key and stored it in the OS keyring");
            CredentialCipher::from_base64_key(&key)
        }
        Err(e) => Err(CryptoError::Keyring(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::from_base64_key(&generate_key().unwrap()).unwrap()
    }

    #[test]
    fn round_trips_unicode_and_empty_passwords() {
        let cipher = cipher();
        for password in ["hunter2", "", "şifre123!@#ğüışöç"] {
            let sealed = cipher.encrypt(password).unwrap();
            assert_ne!(sealed, password);
            assert_eq!(cipher.decrypt(&sealed).unwrap(), password);
        }
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let cipher = cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = cipher().encrypt("secret").unwrap();
        assert!(matches!(cipher().decrypt(&sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn rejects_short_keys_and_garbage() {
        assert!(matches!(
            CredentialCipher::from_base64_key(&STANDARD.encode([1u8; 16])),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            cipher().decrypt("not base64!"),
            Err(CryptoError::Malformed(_))
        ));
        assert!(matches!(
            cipher().decrypt(&STANDARD.encode([0u8; 8])),
            Err(CryptoError::Malformed(_))
        ));
    }

    #[test]
    fn configured_key_wins_over_keyring() {
        let key = generate_key().unwrap();
        let sealed = CredentialCipher::from_base64_key(&key)
            .unwrap()
            .encrypt("pw")
            .unwrap();
        let resolved = resolve_master_key(Some(&key)).unwrap();
        assert_eq!(resolved.decrypt(&sealed).unwrap(), "pw");
    }
}
