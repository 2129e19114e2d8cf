//! Process configuration
//!
//! Every component takes its own config struct; [`EscrowConfig`] bundles
//! them and is loaded once at startup from an optional TOML file plus
//! `TRUSTDEAL__SECTION__FIELD` environment overrides. Secrets are split off
//! into [`EscrowSecrets`] right after loading.

use std::fmt;
use std::path::Path;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::blob_store::BlobStoreConfig;
use crate::cipher_engine::CipherEngineConfig;
use crate::escrow_bridge::{ConfirmationConfig, EvmAddress};
use crate::job_manager::JobManagerConfig;
use crate::preview_token::PreviewTokenConfig;
use crate::secure_field::FieldCipher;
use crate::{EscrowResult, error::EscrowError};

/// Minimum length of each configured secret in bytes
pub const MIN_SECRET_LEN: usize = 32;

const ENV_PREFIX: &str = "TRUSTDEAL";

/// Raw secret material as read from configuration
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// HS256 key for preview tokens
    pub token_secret: String,
    /// Root secret for encrypted record fields
    pub field_secret: String,
}

impl fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretsConfig([REDACTED])")
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    pub cipher: CipherEngineConfig,
    pub preview: PreviewTokenConfig,
    pub confirmation: ConfirmationConfig,
    pub blobs: BlobStoreConfig,
    pub jobs: JobManagerConfig,
    pub secrets: SecretsConfig,
}

impl EscrowConfig {
    /// Load from `path` (if given and present) and the environment.
    pub fn load(path: Option<&Path>) -> EscrowResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EscrowError::config(format!("failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field sanity checks
    pub fn validate(&self) -> EscrowResult<()> {
        if self.cipher.chunk_size == 0 {
            return Err(EscrowError::config("cipher.chunk_size must be positive"));
        }
        if self.preview.ttl_secs == 0 {
            return Err(EscrowError::config("preview.ttl_secs must be positive"));
        }
        if self.confirmation.max_attempts == 0 {
            return Err(EscrowError::config("confirmation.max_attempts must be positive"));
        }
        EvmAddress::parse(&self.confirmation.contract_address).map_err(|e| {
            EscrowError::config(format!("confirmation.contract_address is invalid: {e}"))
        })?;
        if self.jobs.min_title_len > self.jobs.max_title_len {
            return Err(EscrowError::config("jobs title length bounds are inverted"));
        }
        Ok(())
    }
}

/// Secrets loaded once per process and handed to the components that need
/// them.
#[derive(Clone)]
pub struct EscrowSecrets {
    token_secret: Zeroizing<Vec<u8>>,
    fields: FieldCipher,
}

impl EscrowSecrets {
    pub fn new(token_secret: &[u8], field_secret: &[u8]) -> EscrowResult<Self> {
        if token_secret.len() < MIN_SECRET_LEN {
            return Err(EscrowError::config(format!(
                "token secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if token_secret == field_secret {
            return Err(EscrowError::config(
                "token and field secrets must differ",
            ));
        }
        Ok(Self {
            token_secret: Zeroizing::new(token_secret.to_vec()),
            fields: FieldCipher::derive(field_secret)?,
        })
    }

    pub fn from_config(config: &SecretsConfig) -> EscrowResult<Self> {
        Self::new(config.token_secret.as_bytes(), config.field_secret.as_bytes())
    }

    pub fn token_secret(&self) -> &[u8] {
        &self.token_secret
    }

    pub fn fields(&self) -> &FieldCipher {
        &self.fields
    }
}

impl fmt::Debug for EscrowSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EscrowSecrets([REDACTED])")
    }
}

/// Non-secret settings as they may be echoed in diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub storage_dir: String,
    pub ephemeral_ttl_secs: u64,
    pub preview_ttl_secs: u64,
    pub confirmation_attempts: u32,
    pub mirror_node_url: String,
    pub contract_address: String,
}

impl From<&EscrowConfig> for ConfigSummary {
    fn from(config: &EscrowConfig) -> Self {
        Self {
            storage_dir: config.cipher.storage_dir.display().to_string(),
            ephemeral_ttl_secs: config.cipher.ephemeral_ttl_secs,
            preview_ttl_secs: config.preview.ttl_secs,
            confirmation_attempts: config.confirmation.max_attempts,
            mirror_node_url: config.confirmation.mirror_node_url.clone(),
            contract_address: config.confirmation.contract_address.clone(),
        }
    }
}
