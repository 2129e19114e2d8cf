//! Core data models for the escrow system
//!
//! Job records, the job status state machine, encrypted asset metadata and
//! the audit trail entries written on every transition.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::gcm_stream::{KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::secure_field::{FieldCipher, SecureField};
use crate::{EscrowResult, error::EscrowError};

/// Job state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job posted, escrow not yet funded on chain
    Pending,
    /// Escrow project created and funded on chain
    Funded,
    /// Encrypted deliverable stored
    #[serde(alias = "deliverd")]
    Delivered,
    /// Deliverable released to the client
    Approved,
    /// Funds returned to the client
    Refunded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::Delivered => "delivered",
            Self::Approved => "approved",
            Self::Refunded => "refunded",
        }
    }

    /// Check if this state allows previewing the deliverable
    pub fn can_preview(&self) -> bool {
        matches!(self, Self::Delivered | Self::Approved)
    }

    /// Whether an encrypted asset must be attached in this state
    pub fn holds_asset(&self) -> bool {
        matches!(self, Self::Delivered | Self::Approved)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "funded" => Ok(Self::Funded),
            // Older records carry the misspelt status.
            "delivered" | "deliverd" => Ok(Self::Delivered),
            "approved" => Ok(Self::Approved),
            "refunded" => Ok(Self::Refunded),
            other => Err(EscrowError::validation(format!("Invalid status value: {other}"))),
        }
    }
}

/// Terminal outcome produced by the escrow contract on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainOutcome {
    /// Client refunded (explicitly or after a missed delivery deadline)
    Refunded,
    /// Payment released after the client let the approval window lapse
    AutoApproved,
}

impl ChainOutcome {
    /// Local status the outcome settles the job into
    pub fn target_status(&self) -> JobStatus {
        match self {
            Self::Refunded => JobStatus::Refunded,
            Self::AutoApproved => JobStatus::Approved,
        }
    }
}

/// Wallet address, normalised to trimmed lowercase.
///
/// Deliberately has no `Display` impl; it is sensitive and must not end up in
/// log lines.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(raw: &str) -> EscrowResult<Self> {
        let normalised = raw.trim().to_ascii_lowercase();
        if normalised.is_empty() {
            return Err(EscrowError::validation("Wallet address cannot be empty"));
        }
        if normalised.chars().any(char::is_whitespace) {
            return Err(EscrowError::validation(
                "Wallet address cannot contain whitespace",
            ));
        }
        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WalletAddress(<redacted>)")
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = EscrowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

/// Serde helpers for fixed-size byte arrays stored as base64.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let raw = B64.decode(encoded).map_err(serde::de::Error::custom)?;
        raw.try_into().map_err(|raw: Vec<u8>| {
            serde::de::Error::custom(format!("expected {N} bytes, got {}", raw.len()))
        })
    }
}

/// 256-bit content key of one encrypted asset. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(#[serde(with = "base64_bytes")] [u8; KEY_LEN]);

impl AssetKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AssetKey([REDACTED])")
    }
}

/// Metadata of one stored ciphertext blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedAsset {
    pub ciphertext_location: PathBuf,
    pub key: AssetKey,
    #[serde(with = "base64_bytes")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "base64_bytes")]
    pub auth_tag: [u8; TAG_LEN],
    pub mime_type: String,
    pub plaintext_len: u64,
    /// Hex SHA-256 of the ciphertext file
    pub ciphertext_sha256: String,
    pub created_at: DateTime<Utc>,
}

/// Job model representing one escrowed freelance deal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub status: JobStatus,

    // Parties (encrypted at rest)
    pub client_address: SecureField<WalletAddress>,
    pub freelancer_address: Option<SecureField<WalletAddress>>,

    // Deadlines
    pub delivery_deadline: Option<DateTime<Utc>>,
    pub approval_deadline: Option<DateTime<Utc>>,

    // On-chain references
    pub project_id: Option<u64>,
    pub funding_tx: Option<String>,

    // Deliverable
    pub encrypted_asset: Option<EncryptedAsset>,
    /// Blob cid of the uploaded ciphertext
    pub preview_hash: Option<String>,
    /// Blob cid of the released plaintext
    pub final_hash: Option<String>,

    pub is_deleted: bool,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job
    pub fn new(
        title: String,
        description: String,
        price: Decimal,
        client_address: SecureField<WalletAddress>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            price,
            status: JobStatus::Pending,
            client_address,
            freelancer_address: None,
            delivery_deadline: None,
            approval_deadline: None,
            project_id: None,
            funding_tx: None,
            encrypted_asset: None,
            preview_hash: None,
            final_hash: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
            funded_at: None,
            delivered_at: None,
            resolved_at: None,
        }
    }

    /// Validate a state transition
    pub fn validate_transition(&self, to_state: JobStatus) -> EscrowResult<()> {
        let valid = matches!(
            (self.status, to_state),
            (JobStatus::Pending, JobStatus::Funded)
                | (JobStatus::Funded, JobStatus::Delivered)
                | (JobStatus::Funded, JobStatus::Refunded)
                | (JobStatus::Delivered, JobStatus::Approved)
        );

        if valid {
            Ok(())
        } else {
            Err(EscrowError::invalid_transition(
                self.status.as_str(),
                to_state.as_str(),
                "Invalid state transition",
            ))
        }
    }

    /// Structural invariants every stored job must satisfy
    pub fn check_invariants(&self) -> EscrowResult<()> {
        if self.status.holds_asset() != self.encrypted_asset.is_some() {
            return Err(EscrowError::internal(format!(
                "job {} in status {} has inconsistent asset presence",
                self.id, self.status
            )));
        }
        if self.status == JobStatus::Approved && self.final_hash.is_none() {
            return Err(EscrowError::internal(format!(
                "approved job {} has no final hash",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether every field required for funding is set
    pub fn missing_funding_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.freelancer_address.is_none() {
            missing.push("freelancer_address");
        }
        if self.delivery_deadline.is_none() {
            missing.push("delivery_deadline");
        }
        if self.approval_deadline.is_none() {
            missing.push("approval_deadline");
        }
        missing
    }

    /// Delivery deadline has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.delivery_deadline.is_some_and(|deadline| now > deadline)
    }

    /// Which automatic resolution the contract may apply at `now`, if any
    pub fn resolution_due(&self, now: DateTime<Utc>) -> Option<ChainOutcome> {
        match self.status {
            JobStatus::Funded if self.is_expired(now) => Some(ChainOutcome::Refunded),
            JobStatus::Delivered
                if self.approval_deadline.is_some_and(|deadline| now > deadline) =>
            {
                Some(ChainOutcome::AutoApproved)
            }
            _ => None,
        }
    }

    /// Outward projection with addresses revealed and key material removed
    pub fn view(&self, fields: &FieldCipher, now: DateTime<Utc>) -> EscrowResult<JobView> {
        let freelancer_address = match &self.freelancer_address {
            Some(field) => Some(field.reveal(fields)?),
            None => None,
        };

        Ok(JobView {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            price: self.price,
            status: self.status,
            client_address: self.client_address.reveal(fields)?,
            freelancer_address,
            delivery_deadline: self.delivery_deadline,
            approval_deadline: self.approval_deadline,
            project_id: self.project_id,
            preview_hash: self.preview_hash.clone(),
            final_hash: self.final_hash.clone(),
            is_deleted: self.is_deleted,
            is_expired: self.is_expired(now),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Job as handed to the web layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub status: JobStatus,
    pub client_address: WalletAddress,
    pub freelancer_address: Option<WalletAddress>,
    pub delivery_deadline: Option<DateTime<Utc>>,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub project_id: Option<u64>,
    pub preview_hash: Option<String>,
    pub final_hash: Option<String>,
    pub is_deleted: bool,
    pub is_expired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who triggered a job event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Client,
    Freelancer,
    Chain,
}

/// Job event for audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: u64,
    pub job_id: Uuid,
    pub event_type: String,
    pub actor: ActorRole,
    pub status: JobStatus,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Freelancer's response to a posted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub job_id: Uuid,
    pub content: String,
    pub freelancer_address: SecureField<WalletAddress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(
        job_id: Uuid,
        content: String,
        freelancer_address: SecureField<WalletAddress>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            content,
            freelancer_address,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn view(&self, fields: &FieldCipher) -> EscrowResult<CommentView> {
        Ok(CommentView {
            id: self.id,
            job_id: self.job_id,
            content: self.content.clone(),
            freelancer_address: self.freelancer_address.reveal(fields)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Comment as handed to the web layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentView {
    pub id: Uuid,
    pub job_id: Uuid,
    pub content: String,
    pub freelancer_address: WalletAddress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
