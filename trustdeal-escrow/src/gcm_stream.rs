//! Incremental AES-256-GCM
//!
//! `aes-gcm` only offers one-shot encryption over an in-memory buffer. Large
//! deliverables are processed chunk by chunk instead, using the same
//! primitives `aes-gcm` is built from: AES-256 in 32-bit big-endian counter
//! mode for confidentiality and GHASH over the ciphertext for the tag. The
//! output (ciphertext plus detached 16-byte tag, empty associated data) is
//! byte-identical to `Aes256Gcm::encrypt_in_place_detached`.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use ghash::GHash;
use ghash::universal_hash::UniversalHash;
use subtle::ConstantTimeEq;

use crate::{EscrowResult, error::EscrowError};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const BLOCK_LEN: usize = 16;

/// GCM caps a single message at 2^32 - 2 blocks.
pub const MAX_PLAINTEXT_LEN: u64 = ((1u64 << 32) - 2) * BLOCK_LEN as u64;

/// Running GHASH over ciphertext that may arrive in arbitrary-sized pieces.
struct GhashAccumulator {
    ghash: GHash,
    pending: [u8; BLOCK_LEN],
    pending_len: usize,
    total_len: u64,
}

impl GhashAccumulator {
    fn new(h: &[u8; BLOCK_LEN]) -> Self {
        Self {
            ghash: GHash::new(GenericArray::from_slice(h)),
            pending: [0u8; BLOCK_LEN],
            pending_len: 0,
            total_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        self.total_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (BLOCK_LEN - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            if self.pending_len < BLOCK_LEN {
                return;
            }
            self.ghash.update_padded(&self.pending);
            self.pending_len = 0;
        }

        let whole = data.len() - data.len() % BLOCK_LEN;
        if whole > 0 {
            self.ghash.update_padded(&data[..whole]);
        }

        let rest = &data[whole..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finalize(mut self, tag_mask: &[u8; BLOCK_LEN]) -> [u8; TAG_LEN] {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }

        // No associated data: the AAD bit length is zero.
        let mut lengths = [0u8; BLOCK_LEN];
        lengths[8..].copy_from_slice(&(self.total_len * 8).to_be_bytes());
        self.ghash.update_padded(&lengths);

        let digest = self.ghash.finalize();
        let mut tag = [0u8; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = digest[i] ^ tag_mask[i];
        }
        tag
    }
}

/// Shared state for both directions: keystream, GHASH and tag mask.
struct GcmCore {
    keystream: Ctr32BE<Aes256>,
    ghash: GhashAccumulator,
    tag_mask: [u8; BLOCK_LEN],
}

impl GcmCore {
    fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        let block_cipher = Aes256::new(GenericArray::from_slice(key));

        let mut h = GenericArray::clone_from_slice(&[0u8; BLOCK_LEN]);
        block_cipher.encrypt_block(&mut h);
        let mut h_bytes = [0u8; BLOCK_LEN];
        h_bytes.copy_from_slice(&h);

        // J0 = nonce || 0^31 || 1 for 96-bit nonces.
        let mut j0 = [0u8; BLOCK_LEN];
        j0[..NONCE_LEN].copy_from_slice(nonce);
        j0[BLOCK_LEN - 1] = 1;

        let mut mask = GenericArray::clone_from_slice(&j0);
        block_cipher.encrypt_block(&mut mask);
        let mut tag_mask = [0u8; BLOCK_LEN];
        tag_mask.copy_from_slice(&mask);

        // Payload keystream starts at inc32(J0).
        let mut counter = j0;
        counter[BLOCK_LEN - 1] = 2;
        let keystream = <Ctr32BE<Aes256> as KeyIvInit>::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&counter),
        );

        Self {
            keystream,
            ghash: GhashAccumulator::new(&h_bytes),
            tag_mask,
        }
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) -> EscrowResult<()> {
        if self.ghash.total_len + buf.len() as u64 > MAX_PLAINTEXT_LEN {
            return Err(EscrowError::crypto("message exceeds the AES-GCM length limit"));
        }
        self.keystream
            .try_apply_keystream(buf)
            .map_err(|_| EscrowError::crypto("AES-GCM counter exhausted"))
    }
}

/// Encrypts a message incrementally.
pub struct GcmStreamEncryptor {
    core: GcmCore,
}

impl GcmStreamEncryptor {
    pub fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        Self {
            core: GcmCore::new(key, nonce),
        }
    }

    /// Encrypt `buf` in place.
    pub fn encrypt_chunk(&mut self, buf: &mut [u8]) -> EscrowResult<()> {
        self.core.apply_keystream(buf)?;
        self.core.ghash.update(buf);
        Ok(())
    }

    /// Bytes processed so far.
    pub fn processed(&self) -> u64 {
        self.core.ghash.total_len
    }

    /// Consume the encryptor and return the authentication tag.
    pub fn finalize(self) -> [u8; TAG_LEN] {
        self.core.ghash.finalize(&self.core.tag_mask)
    }
}

/// Decrypts a message incrementally.
///
/// Plaintext produced before [`GcmStreamDecryptor::verify`] succeeds is
/// unauthenticated; callers must not release it until then.
pub struct GcmStreamDecryptor {
    core: GcmCore,
}

impl GcmStreamDecryptor {
    pub fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        Self {
            core: GcmCore::new(key, nonce),
        }
    }

    /// Decrypt `buf` in place.
    pub fn decrypt_chunk(&mut self, buf: &mut [u8]) -> EscrowResult<()> {
        self.core.ghash.update(buf);
        self.core.apply_keystream(buf)
    }

    /// Check the expected tag against everything seen so far.
    pub fn verify(self, expected: &[u8; TAG_LEN]) -> EscrowResult<()> {
        let computed = self.core.ghash.finalize(&self.core.tag_mask);
        verify_tag(&computed, expected)
    }
}

/// Tag check over ciphertext only, no keystream. Used for the verification
/// pass that precedes any plaintext release.
pub struct GcmTagVerifier {
    ghash: GhashAccumulator,
    tag_mask: [u8; BLOCK_LEN],
}

impl GcmTagVerifier {
    pub fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        let core = GcmCore::new(key, nonce);
        Self {
            ghash: core.ghash,
            tag_mask: core.tag_mask,
        }
    }

    pub fn absorb(&mut self, ciphertext: &[u8]) {
        self.ghash.update(ciphertext);
    }

    pub fn verify(self, expected: &[u8; TAG_LEN]) -> EscrowResult<()> {
        let computed = self.ghash.finalize(&self.tag_mask);
        verify_tag(&computed, expected)
    }
}

fn verify_tag(computed: &[u8; TAG_LEN], expected: &[u8; TAG_LEN]) -> EscrowResult<()> {
    if bool::from(computed.ct_eq(expected)) {
        Ok(())
    } else {
        Err(EscrowError::AuthenticationFailure)
    }
}
