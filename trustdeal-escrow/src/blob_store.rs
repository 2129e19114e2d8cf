//! Blob storage for ciphertext uploads and released deliverables
//!
//! Blobs are addressed by the SHA-256 of their content. The shipped store
//! keeps them in a local directory tree with separate public and private
//! areas; a pinning service can sit behind the same trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{EscrowResult, error::EscrowError};

/// Configuration for the local blob store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// Root directory of the store
    pub root_dir: PathBuf,
    /// Base URL blobs are served from
    pub gateway_url: String,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data/blobs"),
            gateway_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobReceipt {
    pub cid: String,
    pub size: u64,
    pub file_url: String,
    pub name: String,
    pub mime_type: String,
    pub visibility: Visibility,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `source`.
    async fn put(
        &self,
        source: &Path,
        name: &str,
        mime_type: &str,
        visibility: Visibility,
    ) -> EscrowResult<BlobReceipt>;

    /// Whether a blob with `cid` exists in the given area.
    async fn contains(&self, cid: &str, visibility: Visibility) -> EscrowResult<bool>;
}

/// Content-addressed directory store
pub struct LocalBlobStore {
    config: BlobStoreConfig,
}

impl LocalBlobStore {
    pub fn new(config: BlobStoreConfig) -> Self {
        Self { config }
    }

    fn area(&self, visibility: Visibility) -> PathBuf {
        self.config.root_dir.join(visibility.dir_name())
    }

    fn blob_path(&self, cid: &str, visibility: Visibility) -> EscrowResult<PathBuf> {
        let valid = cid
            .strip_prefix("sha256-")
            .is_some_and(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()));
        if !valid {
            return Err(EscrowError::validation(format!("Malformed blob cid: {cid}")));
        }
        Ok(self.area(visibility).join(cid))
    }

    fn file_url(&self, cid: &str) -> String {
        format!("{}/ipfs/{}", self.config.gateway_url.trim_end_matches('/'), cid)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        source: &Path,
        name: &str,
        mime_type: &str,
        visibility: Visibility,
    ) -> EscrowResult<BlobReceipt> {
        let area = self.area(visibility);
        tokio::fs::create_dir_all(&area).await?;

        // Copy into a scratch file while hashing, then move under the cid.
        let scratch = area.join(format!(".upload-{}", Uuid::new_v4()));
        let mut input = File::open(source).await?;
        let mut output = File::create(&scratch).await?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        let copied = async {
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                output.write_all(&buf[..n]).await?;
                size += n as u64;
            }
            output.flush().await
        }
        .await;
        drop(output);
        if let Err(e) = copied {
            discard_scratch(&scratch).await;
            return Err(EscrowError::integration(format!("blob upload failed: {e}")));
        }

        let cid = format!("sha256-{}", hex::encode(hasher.finalize()));
        let target = area.join(&cid);
        let placed = async {
            // Write-once: identical content is already stored.
            if tokio::fs::try_exists(&target).await? {
                return Ok(false);
            }
            tokio::fs::rename(&scratch, &target).await.map(|()| true)
        }
        .await;
        match placed {
            Ok(true) => {}
            Ok(false) => {
                debug!("Blob {} already present", cid);
                discard_scratch(&scratch).await;
            }
            Err(e) => {
                discard_scratch(&scratch).await;
                return Err(e.into());
            }
        }

        info!("Stored {:?} blob {} ({} bytes)", visibility, cid, size);
        Ok(BlobReceipt {
            file_url: self.file_url(&cid),
            cid,
            size,
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            visibility,
        })
    }

    async fn contains(&self, cid: &str, visibility: Visibility) -> EscrowResult<bool> {
        let path = self.blob_path(cid, visibility)?;
        Ok(tokio::fs::try_exists(path).await?)
    }
}

async fn discard_scratch(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove upload scratch {}: {}", path.display(), e),
    }
}
