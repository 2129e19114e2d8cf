//! Cipher Engine - Authenticated encryption of deliverable files
//!
//! Deliverables are encrypted chunk by chunk with AES-256-GCM under a fresh
//! key and nonce per call. Decryption always authenticates the complete
//! ciphertext before the first plaintext byte leaves this module, and every
//! file this module writes goes through a `.partial` staging path so failed
//! runs leave nothing behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::clock::Clock;
use crate::gcm_stream::{
    GcmStreamDecryptor, GcmStreamEncryptor, GcmTagVerifier, KEY_LEN, NONCE_LEN, TAG_LEN,
};
use crate::models::{AssetKey, EncryptedAsset};
use crate::{EscrowResult, error::EscrowError};

/// Configuration for the cipher engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherEngineConfig {
    /// Directory holding ciphertext blobs
    pub storage_dir: PathBuf,
    /// Directory for short-lived decrypted copies
    pub ephemeral_dir: PathBuf,
    /// Read/write buffer size in bytes
    pub chunk_size: usize,
    /// Lifetime of an ephemeral copy in seconds
    pub ephemeral_ttl_secs: u64,
}

impl Default for CipherEngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data/deliverables"),
            ephemeral_dir: std::env::temp_dir().join("trustdeal-previews"),
            chunk_size: 64 * 1024,
            ephemeral_ttl_secs: 120, // 2 minutes
        }
    }
}

/// Decrypted plaintext, chunk by chunk
pub type PlaintextStream = BoxStream<'static, EscrowResult<Bytes>>;

/// Streaming AES-256-GCM over files
pub struct CipherEngine {
    config: CipherEngineConfig,
    clock: Arc<dyn Clock>,
}

impl CipherEngine {
    /// Create a new cipher engine
    pub fn new(config: CipherEngineConfig, clock: Arc<dyn Clock>) -> EscrowResult<Self> {
        if config.chunk_size == 0 {
            return Err(EscrowError::config("cipher chunk_size must be positive"));
        }
        Ok(Self { config, clock })
    }

    pub fn config(&self) -> &CipherEngineConfig {
        &self.config
    }

    /// Encrypt everything `reader` yields into a new ciphertext blob.
    pub async fn encrypt_stream<R>(&self, mut reader: R, mime_type: &str) -> EscrowResult<EncryptedAsset>
    where
        R: AsyncRead + Unpin,
    {
        tokio::fs::create_dir_all(&self.config.storage_dir).await?;

        let mut key = [0u8; KEY_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut nonce);

        let target = self.config.storage_dir.join(format!("{}.enc", Uuid::new_v4()));
        let staged = StagedFile::new(&target);
        let mut out = File::create(staged.path()).await?;

        let mut encryptor = GcmStreamEncryptor::new(&key, &nonce);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.config.chunk_size];

        let result = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                encryptor.encrypt_chunk(&mut buf[..n])?;
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n]).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok::<_, EscrowError>(())
        }
        .await;
        buf.zeroize();
        drop(out);

        if let Err(e) = result {
            key.zeroize();
            warn!("Encryption aborted, discarding staged ciphertext: {}", e);
            return Err(e);
        }

        let plaintext_len = encryptor.processed();
        let auth_tag = encryptor.finalize();
        staged.commit(&target).await?;

        let asset = EncryptedAsset {
            ciphertext_location: target,
            key: AssetKey::from_bytes(key),
            nonce,
            auth_tag,
            mime_type: mime_type.to_string(),
            plaintext_len,
            ciphertext_sha256: hex::encode(hasher.finalize()),
            created_at: self.clock.now(),
        };
        key.zeroize();

        info!(
            "Encrypted {} bytes into {}",
            asset.plaintext_len,
            asset.ciphertext_location.display()
        );
        Ok(asset)
    }

    /// Encrypt a file on disk, taking the MIME type from its extension.
    pub async fn encrypt_file(&self, path: &Path) -> EscrowResult<EncryptedAsset> {
        let file = File::open(path).await?;
        self.encrypt_stream(file, detect_mime_type(path)).await
    }

    /// Authenticate the whole ciphertext without producing plaintext.
    pub async fn verify(&self, asset: &EncryptedAsset) -> EscrowResult<()> {
        let mut file = open_ciphertext(asset).await?;
        self.authenticate(&mut file, asset).await
    }

    async fn authenticate(&self, file: &mut File, asset: &EncryptedAsset) -> EscrowResult<()> {
        let mut verifier = GcmTagVerifier::new(asset.key.as_bytes(), &asset.nonce);
        let mut buf = vec![0u8; self.config.chunk_size];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            verifier.absorb(&buf[..n]);
        }

        verifier.verify(&asset.auth_tag).inspect_err(|_| {
            warn!(
                "Ciphertext {} failed authentication",
                asset.ciphertext_location.display()
            );
        })
    }

    /// Decrypt an asset as a stream.
    ///
    /// The tag is checked over the complete ciphertext before the stream is
    /// returned, and once more at the end of the stream. Both passes read the
    /// same open file, so replacing the ciphertext in between has no effect.
    pub async fn decrypt(&self, asset: &EncryptedAsset) -> EscrowResult<PlaintextStream> {
        let mut file = open_ciphertext(asset).await?;
        self.authenticate(&mut file, asset).await?;
        file.seek(std::io::SeekFrom::Start(0)).await?;

        let state = DecryptState {
            file,
            decryptor: Some(GcmStreamDecryptor::new(asset.key.as_bytes(), &asset.nonce)),
            tag: asset.auth_tag,
            chunk_size: self.config.chunk_size,
        };
        debug!("Streaming plaintext of {}", asset.ciphertext_location.display());
        Ok(futures::stream::try_unfold(state, next_plaintext_chunk).boxed())
    }

    /// Decrypt an asset into `target`. Returns the plaintext length.
    ///
    /// Output is staged next to `target` and only renamed into place once the
    /// tag verifies.
    pub async fn decrypt_to_path(&self, asset: &EncryptedAsset, target: &Path) -> EscrowResult<u64> {
        let mut input = open_ciphertext(asset).await?;
        let staged = StagedFile::new(target);
        let mut out = File::create(staged.path()).await?;

        let mut decryptor = GcmStreamDecryptor::new(asset.key.as_bytes(), &asset.nonce);
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut written = 0u64;

        let result = async {
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                decryptor.decrypt_chunk(&mut buf[..n])?;
                out.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            out.flush().await?;
            Ok::<_, EscrowError>(())
        }
        .await;
        buf.zeroize();
        drop(out);
        result?;

        decryptor.verify(&asset.auth_tag)?;
        staged.commit(target).await?;
        Ok(written)
    }

    /// Decrypt into a fresh file under the ephemeral directory that is
    /// deleted once the configured TTL elapses, whether or not it was read.
    pub async fn decrypt_to_ephemeral(&self, asset: &EncryptedAsset) -> EscrowResult<EphemeralFile> {
        tokio::fs::create_dir_all(&self.config.ephemeral_dir).await?;

        let path = self
            .config
            .ephemeral_dir
            .join(format!("preview-{}{}", Uuid::new_v4(), extension_for_mime(&asset.mime_type)));
        self.decrypt_to_path(asset, &path).await?;

        let ttl = Duration::from_secs(self.config.ephemeral_ttl_secs);
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| EscrowError::config(format!("invalid ephemeral ttl: {e}")))?;

        let expiry_path = path.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            remove_ephemeral(&expiry_path).await;
        });

        info!("Ephemeral copy {} expires at {}", path.display(), expires_at);
        Ok(EphemeralFile {
            path,
            expires_at,
            expiry,
        })
    }
}

/// A decrypted copy with a scheduled deletion
#[derive(Debug)]
pub struct EphemeralFile {
    path: PathBuf,
    expires_at: DateTime<Utc>,
    expiry: JoinHandle<()>,
}

impl EphemeralFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Stop the scheduled deletion. The file then belongs to the caller.
    pub fn cancel_expiry(&self) {
        self.expiry.abort();
    }

    /// Delete the file immediately.
    pub async fn remove_now(self) {
        self.expiry.abort();
        remove_ephemeral(&self.path).await;
    }
}

/// Map a file extension to the MIME type served for previews.
pub fn detect_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" => "image/jpeg",
        "mp4" | "mov" | "avi" => "video/mp4",
        "mp3" | "wav" | "ogg" => "audio/mpeg",
        "pdf" => "application/pdf",
        "doc" | "docx" => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "application/octet-stream",
    }
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => ".jpg",
        "video/mp4" => ".mp4",
        "audio/mpeg" => ".mp3",
        "application/pdf" => ".pdf",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        _ => "",
    }
}

async fn open_ciphertext(asset: &EncryptedAsset) -> EscrowResult<File> {
    File::open(&asset.ciphertext_location).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EscrowError::not_found(format!(
                "ciphertext {}",
                asset.ciphertext_location.display()
            ))
        } else {
            EscrowError::Io(e)
        }
    })
}

async fn remove_ephemeral(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed ephemeral copy {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Ephemeral copy {} already gone", path.display())
        }
        Err(e) => warn!("Failed to remove ephemeral copy {}: {}", path.display(), e),
    }
}

struct DecryptState {
    file: File,
    decryptor: Option<GcmStreamDecryptor>,
    tag: [u8; TAG_LEN],
    chunk_size: usize,
}

async fn next_plaintext_chunk(mut state: DecryptState) -> EscrowResult<Option<(Bytes, DecryptState)>> {
    if state.decryptor.is_none() {
        return Ok(None);
    }

    let mut buf = vec![0u8; state.chunk_size];
    let n = state.file.read(&mut buf).await?;
    if n == 0 {
        // Ciphertext may have changed since the verification pass.
        if let Some(decryptor) = state.decryptor.take() {
            decryptor.verify(&state.tag)?;
        }
        return Ok(None);
    }

    buf.truncate(n);
    if let Some(decryptor) = state.decryptor.as_mut() {
        decryptor.decrypt_chunk(&mut buf)?;
    }
    Ok(Some((Bytes::from(buf), state)))
}

/// Output file written under `<target>.partial` and removed on drop unless
/// committed.
struct StagedFile {
    partial: PathBuf,
    committed: bool,
}

impl StagedFile {
    fn new(target: &Path) -> Self {
        let mut name = target.as_os_str().to_owned();
        name.push(".partial");
        Self {
            partial: PathBuf::from(name),
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.partial
    }

    async fn commit(mut self, target: &Path) -> EscrowResult<()> {
        tokio::fs::rename(&self.partial, target).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.partial) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove staged file {}: {}", self.partial.display(), e);
                }
            }
        }
    }
}
