//! Encrypted-at-rest record fields.
//!
//! Sensitive job fields (wallet addresses) are held as [`SecureField`]
//! envelopes. Nothing is decrypted implicitly: reading a value requires an
//! explicit [`SecureField::reveal`] with the process [`FieldCipher`], and
//! writing one requires [`SecureField::obscure`].
//!
//! Envelope format: `v1:<base64 nonce>:<base64 ciphertext||tag>` where the
//! plaintext is the JSON encoding of the value, sealed with AES-256-GCM.

use std::fmt;
use std::marker::PhantomData;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hkdf::Hkdf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{EscrowResult, error::EscrowError};

const ENVELOPE_VERSION: &str = "v1";
const FIELD_KEY_INFO: &[u8] = b"trustdeal/secure-field/v1";

/// AES-256-GCM key for record fields, derived once from the configured
/// field secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FieldCipher {
    key: [u8; 32],
}

impl FieldCipher {
    /// Derive the field key from the process secret with HKDF-SHA256.
    pub fn derive(secret: &[u8]) -> EscrowResult<Self> {
        if secret.len() < 32 {
            return Err(EscrowError::config(
                "field secret must be at least 32 bytes",
            ));
        }
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; 32];
        hk.expand(FIELD_KEY_INFO, &mut key)
            .map_err(|e| EscrowError::crypto(format!("field key derivation failed: {e}")))?;
        Ok(Self { key })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.key.into())
    }

    fn seal(&self, plaintext: &[u8]) -> EscrowResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher()
            .encrypt(&nonce, plaintext)
            .map_err(|e| EscrowError::crypto(format!("field encryption failed: {e}")))?;
        Ok(format!(
            "{ENVELOPE_VERSION}:{}:{}",
            B64.encode(nonce),
            B64.encode(sealed)
        ))
    }

    fn open(&self, envelope: &str) -> EscrowResult<Vec<u8>> {
        let mut parts = envelope.splitn(3, ':');
        let (Some(version), Some(nonce), Some(sealed)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(EscrowError::crypto("malformed field envelope"));
        };
        if version != ENVELOPE_VERSION {
            return Err(EscrowError::crypto(format!(
                "unsupported field envelope version {version}"
            )));
        }

        let nonce = B64
            .decode(nonce)
            .map_err(|e| EscrowError::crypto(format!("invalid envelope nonce: {e}")))?;
        if nonce.len() != 12 {
            return Err(EscrowError::crypto("envelope nonce must be 12 bytes"));
        }
        let sealed = B64
            .decode(sealed)
            .map_err(|e| EscrowError::crypto(format!("invalid envelope body: {e}")))?;

        self.cipher()
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| EscrowError::AuthenticationFailure)
    }
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldCipher([REDACTED])")
    }
}

/// A value stored encrypted at rest.
pub struct SecureField<T> {
    envelope: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> SecureField<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Encrypt `value` into a fresh envelope (new nonce every call).
    pub fn obscure(value: &T, cipher: &FieldCipher) -> EscrowResult<Self> {
        let mut plaintext = serde_json::to_vec(value)?;
        let envelope = cipher.seal(&plaintext);
        plaintext.zeroize();
        Ok(Self {
            envelope: envelope?,
            _value: PhantomData,
        })
    }

    /// Decrypt the stored value.
    pub fn reveal(&self, cipher: &FieldCipher) -> EscrowResult<T> {
        let mut plaintext = cipher.open(&self.envelope)?;
        let value = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        Ok(value?)
    }

    /// Reveal and compare against `candidate`.
    pub fn matches(&self, candidate: &T, cipher: &FieldCipher) -> EscrowResult<bool>
    where
        T: PartialEq,
    {
        Ok(&self.reveal(cipher)? == candidate)
    }
}

impl<T> SecureField<T> {
    /// The stored envelope, as persisted.
    pub fn envelope(&self) -> &str {
        &self.envelope
    }
}

impl<T> Clone for SecureField<T> {
    fn clone(&self) -> Self {
        Self {
            envelope: self.envelope.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for SecureField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureField(<encrypted>)")
    }
}

impl<T> Serialize for SecureField<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.envelope)
    }
}

impl<'de, T> Deserialize<'de> for SecureField<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = String::deserialize(deserializer)?;
        if !envelope.starts_with("v1:") {
            return Err(serde::de::Error::custom("not a secure field envelope"));
        }
        Ok(Self {
            envelope,
            _value: PhantomData,
        })
    }
}
