//! Credential vault: AES-256-GCM with per-record scrypt key derivation.
//!
//! Every record gets a fresh salt and IV; the GCM tag is stored separately
//! so tampering with any of the three fields fails decryption.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::RngCore;
use scrypt::Params;

use crate::error::{Result, SitepulseError};

const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const MIN_MASTER_LEN: usize = 32;

/// An encrypted secret as persisted on a credential row. All fields are
/// base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
    pub salt: String,
}

/// Decrypted credential material. The backing buffer is wiped on drop so
/// plaintext never outlives the job that needed it.
pub struct Plaintext(Vec<u8>);

impl Plaintext {
    pub fn expose(&self) -> &str {
        // Constructed from verified UTF-8 in decrypt().
        std::str::from_utf8(&self.0).unwrap_or("")
    }
}

impl Drop for Plaintext {
    fn drop(&mut self) {
        for b in self.0.iter_mut() {
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

impl std::fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Plaintext([REDACTED])")
    }
}

#[derive(Clone)]
pub struct Vault {
    master: String,
}

impl Vault {
    /// Build a vault from the process-wide master passphrase.
    /// A short passphrase is a fatal startup error.
    pub fn new(master: impl Into<String>) -> Result<Self> {
        let master = master.into();
        if master.len() < MIN_MASTER_LEN {
            return Err(SitepulseError::WeakEncryptionKey);
        }
        Ok(Self { master })
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
        let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
            .map_err(|e| SitepulseError::InvalidCredential(format!("scrypt params: {e}")))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(self.master.as_bytes(), salt, &params, &mut key)
            .map_err(|e| SitepulseError::InvalidCredential(format!("key derivation: {e}")))?;
        Ok(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| SitepulseError::InvalidCredential("encryption failed".into()))?;

        // aes-gcm appends the tag; split it off for separate storage.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedSecret {
            ciphertext: B64.encode(&sealed),
            iv: B64.encode(iv),
            auth_tag: B64.encode(&tag),
            salt: B64.encode(salt),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Plaintext> {
        let invalid = |what: &str| SitepulseError::InvalidCredential(format!("bad {what}"));

        let mut sealed = B64.decode(&secret.ciphertext).map_err(|_| invalid("ciphertext"))?;
        let iv = B64.decode(&secret.iv).map_err(|_| invalid("iv"))?;
        let tag = B64.decode(&secret.auth_tag).map_err(|_| invalid("auth tag"))?;
        let salt = B64.decode(&secret.salt).map_err(|_| invalid("salt"))?;

        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(invalid("field length"));
        }

        sealed.extend_from_slice(&tag);
        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plain = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| SitepulseError::InvalidCredential("GCM tag verification failed".into()))?;

        if std::str::from_utf8(&plain).is_err() {
            return Err(invalid("plaintext encoding"));
        }
        Ok(Plaintext(plain))
    }
}

/// Generate a fresh IndexNow verification key: 32 lowercase hex chars.
pub fn generate_indexnow_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
