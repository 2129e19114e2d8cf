//! Job Manager - Coordinates the escrowed deliverable lifecycle
//!
//! This module drives a job from creation through funding, delivery,
//! preview and approval (or refund). Every mutating operation takes the
//! job's lock, checks legality against the state machine, performs its
//! cryptographic or chain side effect, and then commits with a conditional
//! write on the status it started from.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob_store::{BlobReceipt, BlobStore, Visibility};
use crate::cipher_engine::{CipherEngine, EphemeralFile};
use crate::clock::Clock;
use crate::escrow_bridge::{
    ContractCall, ContractSubmitter, EscrowConfirmationBridge, price_in_tinybars,
};
use crate::job_store::{JobLocks, JobStore};
use crate::models::{
    ActorRole, ChainOutcome, Comment, CommentView, Job, JobEvent, JobStatus, JobView, WalletAddress,
};
use crate::preview_token::{IssuedPreviewToken, PreviewTokenIssuer};
use crate::secure_field::{FieldCipher, SecureField};
use crate::{EscrowResult, error::EscrowError};

/// Configuration for the job manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    pub min_title_len: usize,
    pub max_title_len: usize,
    pub max_description_len: usize,
    pub max_comment_len: usize,
    /// Upper bound on a job price
    pub max_price: Decimal,
    /// Scratch directory for plaintext copies being published
    pub release_dir: PathBuf,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            min_title_len: 3,
            max_title_len: 100,
            max_description_len: 2000,
            max_comment_len: 2000,
            max_price: Decimal::new(1_000_000_000, 0),
            release_dir: std::env::temp_dir().join("trustdeal-release"),
        }
    }
}

/// Job creation request
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub client_address: WalletAddress,
}

/// Freelancer assignment request
#[derive(Debug, Clone)]
pub struct AssignFreelancerRequest {
    pub job_id: Uuid,
    pub caller: WalletAddress,
    pub freelancer_address: WalletAddress,
    pub delivery_deadline: DateTime<Utc>,
    pub approval_deadline: DateTime<Utc>,
}

/// Comment posted by a freelancer on a job
#[derive(Debug, Clone)]
pub struct CreateCommentRequest {
    pub job_id: Uuid,
    pub content: String,
    pub freelancer_address: WalletAddress,
}

/// A decrypted preview handed to the client
#[derive(Debug)]
pub struct PreviewAccess {
    pub file: EphemeralFile,
    pub mime_type: String,
}

/// Main job manager
pub struct JobManager {
    config: JobManagerConfig,
    store: Arc<dyn JobStore>,
    locks: JobLocks,
    cipher: Arc<CipherEngine>,
    tokens: Arc<PreviewTokenIssuer>,
    bridge: Arc<EscrowConfirmationBridge>,
    blobs: Arc<dyn BlobStore>,
    fields: FieldCipher,
    clock: Arc<dyn Clock>,
}

impl JobManager {
    /// Create a new job manager
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: JobManagerConfig,
        store: Arc<dyn JobStore>,
        cipher: Arc<CipherEngine>,
        tokens: Arc<PreviewTokenIssuer>,
        bridge: Arc<EscrowConfirmationBridge>,
        blobs: Arc<dyn BlobStore>,
        fields: FieldCipher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            locks: JobLocks::new(),
            cipher,
            tokens,
            bridge,
            blobs,
            fields,
            clock,
        }
    }

    /// Create a new pending job
    pub async fn create_job(&self, request: CreateJobRequest) -> EscrowResult<JobView> {
        self.validate_create_job_request(&request)?;

        let now = self.clock.now();
        let job = Job::new(
            request.title.trim().to_string(),
            request.description.trim().to_string(),
            request.price,
            SecureField::obscure(&request.client_address, &self.fields)?,
            now,
        );
        self.store.insert(job.clone()).await?;

        self.record_event(
            &job,
            "job.created",
            ActorRole::Client,
            Some(serde_json::json!({ "title": job.title, "price": job.price })),
        )
        .await?;

        info!("Created job: {}", job.id);
        job.view(&self.fields, now)
    }

    /// Name the freelancer and both deadlines. Client only, before funding.
    pub async fn assign_freelancer(&self, request: AssignFreelancerRequest) -> EscrowResult<JobView> {
        let _guard = self.locks.acquire(request.job_id).await;
        let mut job = self.load_active(request.job_id).await?;
        self.require_client(&job, &request.caller)?;

        if job.status != JobStatus::Pending {
            return Err(EscrowError::invalid_transition(
                job.status.as_str(),
                job.status.as_str(),
                "Freelancer can only be assigned before funding",
            ));
        }

        let now = self.clock.now();
        if request.delivery_deadline <= now {
            return Err(EscrowError::validation("Delivery deadline must be in the future"));
        }
        if request.approval_deadline <= request.delivery_deadline {
            return Err(EscrowError::validation(
                "Approval deadline must be after the delivery deadline",
            ));
        }
        if request.freelancer_address == request.caller {
            return Err(EscrowError::validation("Client cannot be their own freelancer"));
        }

        job.freelancer_address = Some(SecureField::obscure(&request.freelancer_address, &self.fields)?);
        job.delivery_deadline = Some(request.delivery_deadline);
        job.approval_deadline = Some(request.approval_deadline);
        let job = self.commit(JobStatus::Pending, job).await?;

        self.record_event(
            &job,
            "job.freelancer_assigned",
            ActorRole::Client,
            Some(serde_json::json!({
                "delivery_deadline": request.delivery_deadline,
                "approval_deadline": request.approval_deadline,
            })),
        )
        .await?;

        info!("Assigned freelancer to job: {}", job.id);
        job.view(&self.fields, now)
    }

    /// Mirror an on-chain project creation: `pending -> funded`.
    pub async fn confirm_funding(
        &self,
        job_id: Uuid,
        caller: &WalletAddress,
        tx_ref: &str,
    ) -> EscrowResult<JobView> {
        info!("Confirming funding of job {} via {}", job_id, tx_ref);

        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.load_active(job_id).await?;
        self.require_client(&job, caller)?;
        job.validate_transition(JobStatus::Funded)?;

        let missing = job.missing_funding_fields();
        if !missing.is_empty() {
            return Err(EscrowError::precondition(format!(
                "Job cannot be funded without {}",
                missing.join(", ")
            )));
        }

        let expected = self.funding_call(&job)?;
        let confirmation = self.bridge.confirm_project_created(tx_ref, &expected).await?;

        let now = self.clock.now();
        job.status = JobStatus::Funded;
        job.project_id = Some(confirmation.project_id);
        job.funding_tx = Some(confirmation.tx_ref);
        job.funded_at = Some(now);
        let job = self.commit(JobStatus::Pending, job).await?;

        self.record_event(
            &job,
            "job.funded",
            ActorRole::Client,
            Some(serde_json::json!({ "project_id": confirmation.project_id, "tx_ref": tx_ref })),
        )
        .await?;

        info!("Funded job {} as project {}", job.id, confirmation.project_id);
        job.view(&self.fields, now)
    }

    /// Encrypt and store the freelancer's file: `funded -> delivered`.
    pub async fn deliver(
        &self,
        job_id: Uuid,
        caller: &WalletAddress,
        source: &Path,
    ) -> EscrowResult<JobView> {
        info!("Delivering work for job: {}", job_id);

        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.load_active(job_id).await?;
        self.require_freelancer(&job, caller)?;
        job.validate_transition(JobStatus::Delivered)?;

        let now = self.clock.now();
        if job.is_expired(now) {
            return Err(EscrowError::precondition("Delivery deadline has passed"));
        }

        let asset = self.cipher.encrypt_file(source).await?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.id.to_string());

        let upload = self
            .blobs
            .put(&asset.ciphertext_location, &name, &asset.mime_type, Visibility::Private)
            .await;
        let receipt = match upload {
            Ok(receipt) => receipt,
            Err(e) => {
                discard_ciphertext(&asset.ciphertext_location).await;
                return Err(e);
            }
        };

        let location = asset.ciphertext_location.clone();
        job.status = JobStatus::Delivered;
        job.encrypted_asset = Some(asset);
        job.preview_hash = Some(receipt.cid.clone());
        job.delivered_at = Some(now);
        let job = match self.commit(JobStatus::Funded, job).await {
            Ok(job) => job,
            Err(e) => {
                discard_ciphertext(&location).await;
                return Err(e);
            }
        };

        self.record_event(
            &job,
            "job.delivered",
            ActorRole::Freelancer,
            Some(serde_json::json!({ "preview_hash": receipt.cid, "size": receipt.size })),
        )
        .await?;

        info!("Delivered job {} as blob {}", job.id, receipt.cid);
        job.view(&self.fields, now)
    }

    /// Issue a preview token to the client of a delivered job.
    pub async fn generate_preview(
        &self,
        job_id: Uuid,
        caller: &WalletAddress,
    ) -> EscrowResult<IssuedPreviewToken> {
        let job = self.load_active(job_id).await?;
        self.require_client(&job, caller)?;
        if !job.status.can_preview() {
            return Err(EscrowError::precondition("No deliverable to preview yet"));
        }

        let issued = self.tokens.issue(job.id, caller)?;
        self.record_event(
            &job,
            "preview.issued",
            ActorRole::Client,
            Some(serde_json::json!({ "expires_at": issued.expires_at })),
        )
        .await?;
        Ok(issued)
    }

    /// Redeem a preview token for a short-lived decrypted copy.
    pub async fn preview_work(
        &self,
        job_id: Uuid,
        caller: &WalletAddress,
        token: &str,
    ) -> EscrowResult<PreviewAccess> {
        self.tokens.redeem(token, job_id, caller)?;

        let job = self.load_active(job_id).await?;
        self.require_client(&job, caller)?;
        if !job.status.can_preview() {
            return Err(EscrowError::precondition("No deliverable to preview yet"));
        }
        let asset = job
            .encrypted_asset
            .as_ref()
            .ok_or_else(|| EscrowError::internal(format!("job {} has no asset", job.id)))?;

        let file = self.cipher.decrypt_to_ephemeral(asset).await?;
        self.record_event(&job, "job.previewed", ActorRole::Client, None).await?;

        Ok(PreviewAccess {
            file,
            mime_type: asset.mime_type.clone(),
        })
    }

    /// Release the deliverable to the client: `delivered -> approved`.
    ///
    /// The plaintext is published before the status changes, so a failed
    /// decrypt or upload leaves the job `delivered`.
    pub async fn approve_work(&self, job_id: Uuid, caller: &WalletAddress) -> EscrowResult<JobView> {
        info!("Approving work for job: {}", job_id);

        let _guard = self.locks.acquire(job_id).await;
        let job = self.load_active(job_id).await?;
        self.require_client(&job, caller)?;

        let job = self.release(job, ActorRole::Client, "job.approved", None).await?;
        job.view(&self.fields, self.clock.now())
    }

    /// Mirror a terminal outcome the contract reached, after confirming that
    /// `tx_ref` executed a call producing it for this job's project.
    ///
    /// The contract enforces who may call what; the call binding carries that
    /// authorization over to the local record.
    pub async fn apply_chain_outcome(
        &self,
        job_id: Uuid,
        outcome: ChainOutcome,
        tx_ref: &str,
    ) -> EscrowResult<JobView> {
        info!("Applying {:?} to job {} via {}", outcome, job_id, tx_ref);

        let _guard = self.locks.acquire(job_id).await;
        let job = self.load_active(job_id).await?;
        job.validate_transition(outcome.target_status())?;

        let accepted = settling_calls(&job, outcome, self.clock.now())?;
        self.bridge.confirm_outcome(tx_ref, &accepted).await?;
        let job = self.settle(job, outcome, tx_ref).await?;
        job.view(&self.fields, self.clock.now())
    }

    /// Status change requested by the web layer after a wallet-side
    /// contract call. Only terminal outcomes are mirrored this way.
    pub async fn update_job_status(
        &self,
        job_id: Uuid,
        requested: JobStatus,
        tx_ref: &str,
    ) -> EscrowResult<JobView> {
        match requested {
            JobStatus::Refunded => self.apply_chain_outcome(job_id, ChainOutcome::Refunded, tx_ref).await,
            JobStatus::Approved => {
                self.apply_chain_outcome(job_id, ChainOutcome::AutoApproved, tx_ref).await
            }
            JobStatus::Funded | JobStatus::Delivered => Err(EscrowError::precondition(format!(
                "Status {requested} is only reached through its own operation"
            ))),
            JobStatus::Pending => {
                let job = self.load_active(job_id).await?;
                Err(EscrowError::invalid_transition(
                    job.status.as_str(),
                    requested.as_str(),
                    "Jobs never return to pending",
                ))
            }
        }
    }

    /// Trigger the contract's deadline resolution for an overdue job and
    /// mirror its outcome.
    pub async fn resolve_overdue(
        &self,
        job_id: Uuid,
        submitter: &dyn ContractSubmitter,
    ) -> EscrowResult<JobView> {
        let _guard = self.locks.acquire(job_id).await;
        let job = self.load_active(job_id).await?;

        let outcome = job
            .resolution_due(self.clock.now())
            .ok_or_else(|| EscrowError::precondition("No deadline has lapsed for this job"))?;
        let project_id = job
            .project_id
            .ok_or_else(|| EscrowError::precondition("Job has no on-chain project"))?;

        info!("Resolving overdue job {} as {:?}", job.id, outcome);
        let result = self
            .bridge
            .submit_and_confirm(submitter, ContractCall::resolving(outcome, project_id))
            .await?;

        let job = self.settle(job, outcome, &result.tx_ref).await?;
        job.view(&self.fields, self.clock.now())
    }

    /// Soft-delete a job. Client only.
    pub async fn delete_job(&self, job_id: Uuid, caller: &WalletAddress) -> EscrowResult<()> {
        let _guard = self.locks.acquire(job_id).await;
        let mut job = self.load_active(job_id).await?;
        self.require_client(&job, caller)?;

        if job.status == JobStatus::Funded || job.status == JobStatus::Delivered {
            warn!("Deleting job {} while escrow is open ({})", job.id, job.status);
        }

        let status = job.status;
        job.is_deleted = true;
        let job = self.commit(status, job).await?;
        self.record_event(&job, "job.deleted", ActorRole::Client, None).await?;

        info!("Deleted job: {}", job_id);
        Ok(())
    }

    /// Get a job by id
    pub async fn get_job(&self, job_id: Uuid) -> EscrowResult<JobView> {
        let job = self.load_active(job_id).await?;
        job.view(&self.fields, self.clock.now())
    }

    /// All jobs that are not deleted
    pub async fn list_jobs(&self) -> EscrowResult<Vec<JobView>> {
        let now = self.clock.now();
        self.store
            .list()
            .await?
            .iter()
            .filter(|job| !job.is_deleted)
            .map(|job| job.view(&self.fields, now))
            .collect()
    }

    /// Jobs where `address` is the client or the freelancer
    pub async fn jobs_for_address(&self, address: &WalletAddress) -> EscrowResult<Vec<JobView>> {
        let mut views = Vec::new();
        for view in self.list_jobs().await? {
            let is_party = view.client_address == *address
                || view.freelancer_address.as_ref() == Some(address);
            if is_party {
                views.push(view);
            }
        }
        Ok(views)
    }

    /// Audit trail of a job
    pub async fn job_events(&self, job_id: Uuid) -> EscrowResult<Vec<JobEvent>> {
        self.store.events_for(job_id).await
    }

    /// Post a freelancer's response to a job.
    pub async fn create_comment(&self, request: CreateCommentRequest) -> EscrowResult<CommentView> {
        let job = self.load_active(request.job_id).await?;
        if job.client_address.matches(&request.freelancer_address, &self.fields)? {
            return Err(EscrowError::validation("Clients cannot comment on their own job"));
        }

        let content = request.content.trim();
        let content_len = content.chars().count();
        if content_len == 0 || content_len > self.config.max_comment_len {
            return Err(EscrowError::validation(format!(
                "Comment must be between 1 and {} characters",
                self.config.max_comment_len
            )));
        }

        let comment = Comment::new(
            job.id,
            content.to_string(),
            SecureField::obscure(&request.freelancer_address, &self.fields)?,
            self.clock.now(),
        );
        self.store.insert_comment(comment.clone()).await?;
        self.record_event(
            &job,
            "comment.created",
            ActorRole::Freelancer,
            Some(serde_json::json!({ "comment_id": comment.id })),
        )
        .await?;

        info!("Comment {} posted on job {}", comment.id, job.id);
        comment.view(&self.fields)
    }

    /// Comments on a job, oldest first
    pub async fn job_comments(&self, job_id: Uuid) -> EscrowResult<Vec<CommentView>> {
        self.load_active(job_id).await?;
        self.store
            .comments_for(job_id)
            .await?
            .iter()
            .map(|comment| comment.view(&self.fields))
            .collect()
    }

    /// The project creation that funds `job` on its agreed terms
    fn funding_call(&self, job: &Job) -> EscrowResult<ContractCall> {
        let missing = || EscrowError::precondition("Job terms are incomplete");
        Ok(ContractCall::CreateProject {
            freelancer: job.freelancer_address.as_ref().ok_or_else(missing)?.reveal(&self.fields)?,
            price: job.price,
            delivery_deadline: job.delivery_deadline.ok_or_else(missing)?,
            approval_deadline: job.approval_deadline.ok_or_else(missing)?,
        })
    }

    /// Decrypt, publish and commit `delivered -> approved`.
    async fn release(
        &self,
        mut job: Job,
        actor: ActorRole,
        event_type: &str,
        tx_ref: Option<&str>,
    ) -> EscrowResult<Job> {
        job.validate_transition(JobStatus::Approved)?;

        let receipt = self.publish_release(&job).await?;

        job.status = JobStatus::Approved;
        job.final_hash = Some(receipt.cid.clone());
        job.resolved_at = Some(self.clock.now());
        let job = self.commit(JobStatus::Delivered, job).await?;

        self.record_event(
            &job,
            event_type,
            actor,
            Some(serde_json::json!({
                "final_hash": receipt.cid,
                "file_url": receipt.file_url,
                "tx_ref": tx_ref,
            })),
        )
        .await?;

        info!("Released job {} as blob {}", job.id, receipt.cid);
        Ok(job)
    }

    async fn settle(&self, mut job: Job, outcome: ChainOutcome, tx_ref: &str) -> EscrowResult<Job> {
        match outcome {
            ChainOutcome::Refunded => {
                job.validate_transition(JobStatus::Refunded)?;
                job.status = JobStatus::Refunded;
                job.resolved_at = Some(self.clock.now());
                let job = self.commit(JobStatus::Funded, job).await?;

                self.record_event(
                    &job,
                    "job.refunded",
                    ActorRole::Chain,
                    Some(serde_json::json!({ "tx_ref": tx_ref })),
                )
                .await?;
                info!("Refunded job: {}", job.id);
                Ok(job)
            }
            ChainOutcome::AutoApproved => {
                self.release(job, ActorRole::Chain, "job.auto_approved", Some(tx_ref))
                    .await
            }
        }
    }

    async fn publish_release(&self, job: &Job) -> EscrowResult<BlobReceipt> {
        let asset = job
            .encrypted_asset
            .as_ref()
            .ok_or_else(|| EscrowError::internal(format!("job {} has no asset", job.id)))?;

        tokio::fs::create_dir_all(&self.config.release_dir).await?;
        let staging = self.config.release_dir.join(format!("{}-{}", job.id, Uuid::new_v4()));

        self.cipher.decrypt_to_path(asset, &staging).await.inspect_err(|e| {
            error!("Decrypting deliverable of job {} failed: {}", job.id, e);
        })?;

        let receipt = self
            .blobs
            .put(
                &staging,
                &format!("deliverable-{}", job.id),
                &asset.mime_type,
                Visibility::Public,
            )
            .await;

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            warn!("Failed to remove release copy {}: {}", staging.display(), e);
        }
        receipt
    }

    async fn load_active(&self, job_id: Uuid) -> EscrowResult<Job> {
        match self.store.get(job_id).await? {
            Some(job) if !job.is_deleted => Ok(job),
            _ => Err(EscrowError::not_found(format!("Job {job_id}"))),
        }
    }

    async fn commit(&self, expected: JobStatus, mut job: Job) -> EscrowResult<Job> {
        job.updated_at = self.clock.now();
        self.store.update_if_status(expected, job).await
    }

    fn require_client(&self, job: &Job, caller: &WalletAddress) -> EscrowResult<()> {
        if job.client_address.matches(caller, &self.fields)? {
            Ok(())
        } else {
            Err(EscrowError::unauthorized("Only the client can perform this action"))
        }
    }

    fn require_freelancer(&self, job: &Job, caller: &WalletAddress) -> EscrowResult<()> {
        let assigned = match &job.freelancer_address {
            Some(field) => field.matches(caller, &self.fields)?,
            None => false,
        };
        if assigned {
            Ok(())
        } else {
            Err(EscrowError::unauthorized(
                "Only the assigned freelancer can perform this action",
            ))
        }
    }

    async fn record_event(
        &self,
        job: &Job,
        event_type: &str,
        actor: ActorRole,
        metadata: Option<serde_json::Value>,
    ) -> EscrowResult<JobEvent> {
        let event = JobEvent {
            id: 0,
            job_id: job.id,
            event_type: event_type.to_string(),
            actor,
            status: job.status,
            metadata,
            created_at: self.clock.now(),
        };
        self.store.append_event(event).await
    }

    /// Validate job creation request
    fn validate_create_job_request(&self, request: &CreateJobRequest) -> EscrowResult<()> {
        let title_len = request.title.trim().chars().count();
        if title_len < self.config.min_title_len || title_len > self.config.max_title_len {
            return Err(EscrowError::validation(format!(
                "Title must be between {} and {} characters",
                self.config.min_title_len, self.config.max_title_len
            )));
        }

        let description_len = request.description.trim().chars().count();
        if description_len == 0 || description_len > self.config.max_description_len {
            return Err(EscrowError::validation(format!(
                "Description must be between 1 and {} characters",
                self.config.max_description_len
            )));
        }

        if request.price <= Decimal::ZERO {
            return Err(EscrowError::validation("Price must be positive"));
        }
        if request.price > self.config.max_price {
            return Err(EscrowError::validation(format!(
                "Price exceeds maximum: {}",
                self.config.max_price
            )));
        }
        price_in_tinybars(request.price)?;

        Ok(())
    }
}

/// Contract calls that legitimately settle `job` as `outcome` at `now`
fn settling_calls(
    job: &Job,
    outcome: ChainOutcome,
    now: DateTime<Utc>,
) -> EscrowResult<Vec<ContractCall>> {
    let project_id = job
        .project_id
        .ok_or_else(|| EscrowError::precondition("Job has no on-chain project"))?;

    match outcome {
        ChainOutcome::Refunded => {
            let mut calls = vec![ContractCall::RequestRefund { project_id }];
            if job.is_expired(now) {
                calls.push(ContractCall::AutoRefundIfLate { project_id });
            }
            Ok(calls)
        }
        ChainOutcome::AutoApproved => {
            if job.resolution_due(now) != Some(ChainOutcome::AutoApproved) {
                return Err(EscrowError::precondition(
                    "Approval window has not lapsed; only the client can approve",
                ));
            }
            Ok(vec![ContractCall::AutoApproveIfClientSilent { project_id }])
        }
    }
}

async fn discard_ciphertext(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to discard ciphertext {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStoreConfig, LocalBlobStore};
    use crate::cipher_engine::CipherEngineConfig;
    use crate::clock::ManualClock;
    use crate::escrow_bridge::ConfirmationConfig;
    use crate::job_store::InMemoryJobStore;
    use crate::mocks::{SCRIPTED_CONTRACT_ID, ScriptStep, ScriptedContract};
    use crate::preview_token::PreviewTokenConfig;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Harness {
        manager: Arc<JobManager>,
        contract: Arc<ScriptedContract>,
        clock: ManualClock,
        blobs: Arc<LocalBlobStore>,
        dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::default_time();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let contract = Arc::new(ScriptedContract::new());

        let cipher = CipherEngine::new(
            CipherEngineConfig {
                storage_dir: dir.path().join("ciphertext"),
                ephemeral_dir: dir.path().join("ephemeral"),
                chunk_size: 512,
                ephemeral_ttl_secs: 120,
            },
            shared_clock.clone(),
        )
        .unwrap();
        let tokens = PreviewTokenIssuer::new(
            PreviewTokenConfig::default(),
            b"job-manager-token-secret-0123456789abcdef",
            shared_clock.clone(),
        )
        .unwrap();
        let bridge = EscrowConfirmationBridge::new(
            ConfirmationConfig {
                max_attempts: 3,
                poll_interval_ms: 1,
                contract_address: SCRIPTED_CONTRACT_ID.to_string(),
                ..Default::default()
            },
            contract.clone(),
        )
        .unwrap();
        let blobs = Arc::new(LocalBlobStore::new(BlobStoreConfig {
            root_dir: dir.path().join("blobs"),
            gateway_url: "https://gateway.test".to_string(),
        }));

        let manager = JobManager::new(
            JobManagerConfig {
                release_dir: dir.path().join("release"),
                ..Default::default()
            },
            Arc::new(InMemoryJobStore::new()),
            Arc::new(cipher),
            Arc::new(tokens),
            Arc::new(bridge),
            blobs.clone(),
            FieldCipher::derive(b"job-manager-field-secret-0123456789abcdef").unwrap(),
            shared_clock,
        );

        Harness {
            manager: Arc::new(manager),
            contract,
            clock,
            blobs,
            dir,
        }
    }

    fn client() -> WalletAddress {
        WalletAddress::parse("0.0.1001").unwrap()
    }

    fn freelancer() -> WalletAddress {
        WalletAddress::parse("0.0.2002").unwrap()
    }

    fn create_request() -> CreateJobRequest {
        CreateJobRequest {
            title: "Quarterly report".to_string(),
            description: "Typeset the Q3 report".to_string(),
            price: Decimal::new(100, 0),
            client_address: client(),
        }
    }

    async fn assigned_job(h: &Harness) -> Uuid {
        let job = h.manager.create_job(create_request()).await.unwrap();
        let now = h.clock.now();
        h.manager
            .assign_freelancer(AssignFreelancerRequest {
                job_id: job.id,
                caller: client(),
                freelancer_address: freelancer(),
                delivery_deadline: now + Duration::days(3),
                approval_deadline: now + Duration::days(5),
            })
            .await
            .unwrap();
        job.id
    }

    fn create_project_call(h: &Harness, price: Decimal) -> ContractCall {
        ContractCall::CreateProject {
            freelancer: freelancer(),
            price,
            delivery_deadline: h.clock.now() + Duration::days(3),
            approval_deadline: h.clock.now() + Duration::days(5),
        }
    }

    async fn funded_job(h: &Harness) -> Uuid {
        let id = assigned_job(h).await;
        let tx = h
            .contract
            .submit(create_project_call(h, Decimal::new(100, 0)))
            .await
            .unwrap();
        h.manager.confirm_funding(id, &client(), &tx).await.unwrap();
        id
    }

    async fn delivered_job(h: &Harness, contents: &[u8]) -> Uuid {
        let id = funded_job(h).await;
        let source = h.dir.path().join("report.pdf");
        tokio::fs::write(&source, contents).await.unwrap();
        h.manager.deliver(id, &freelancer(), &source).await.unwrap();
        id
    }

    async fn stored(h: &Harness, id: Uuid) -> Job {
        h.manager.store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_create_job_validation() {
        let h = harness();

        let mut short = create_request();
        short.title = "ab".to_string();
        assert!(matches!(
            h.manager.create_job(short).await,
            Err(EscrowError::Validation(_))
        ));

        let mut free = create_request();
        free.price = Decimal::ZERO;
        assert!(h.manager.create_job(free).await.is_err());

        let mut sub_tinybar = create_request();
        sub_tinybar.price = Decimal::new(1, 9);
        assert!(matches!(
            h.manager.create_job(sub_tinybar).await,
            Err(EscrowError::Validation(_))
        ));

        let mut empty = create_request();
        empty.description = "   ".to_string();
        assert!(h.manager.create_job(empty).await.is_err());

        let view = h.manager.create_job(create_request()).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.client_address, client());
    }

    #[tokio::test]
    async fn test_client_address_encrypted_at_rest() {
        let h = harness();
        let view = h.manager.create_job(create_request()).await.unwrap();

        let job = stored(&h, view.id).await;
        let serialized = serde_json::to_string(&job).unwrap();
        assert!(!serialized.contains("0.0.1001"));
    }

    #[tokio::test]
    async fn test_assign_freelancer_rules() {
        let h = harness();
        let job = h.manager.create_job(create_request()).await.unwrap();
        let now = h.clock.now();

        let mut request = AssignFreelancerRequest {
            job_id: job.id,
            caller: freelancer(),
            freelancer_address: freelancer(),
            delivery_deadline: now + Duration::days(3),
            approval_deadline: now + Duration::days(5),
        };
        assert!(matches!(
            h.manager.assign_freelancer(request.clone()).await,
            Err(EscrowError::Unauthorized(_))
        ));

        request.caller = client();
        request.approval_deadline = now + Duration::days(2);
        assert!(matches!(
            h.manager.assign_freelancer(request.clone()).await,
            Err(EscrowError::Validation(_))
        ));

        request.approval_deadline = now + Duration::days(5);
        let view = h.manager.assign_freelancer(request).await.unwrap();
        assert_eq!(view.freelancer_address, Some(freelancer()));
    }

    #[tokio::test]
    async fn test_funding_requires_assignment() {
        let h = harness();
        let job = h.manager.create_job(create_request()).await.unwrap();
        h.contract
            .script_project_created("0.0.5005@77", &create_project_call(&h, Decimal::new(100, 0)), 77)
            .await
            .unwrap();

        match h.manager.confirm_funding(job.id, &client(), "0.0.5005@77").await {
            Err(EscrowError::PreconditionFailed(msg)) => assert!(msg.contains("freelancer_address")),
            other => panic!("Expected precondition failure, got {other:?}"),
        }
        assert_eq!(h.contract.fetch_count("0.0.5005@77").await, 0);
    }

    #[tokio::test]
    async fn test_funding_records_project_id() {
        let h = harness();
        let id = funded_job(&h).await;

        let job = stored(&h, id).await;
        assert_eq!(job.status, JobStatus::Funded);
        assert_eq!(job.project_id, Some(1));
        assert_eq!(job.funding_tx.as_deref(), Some("0.0.5005@1"));
    }

    #[tokio::test]
    async fn test_funding_must_match_job_terms() {
        let h = harness();
        let id = assigned_job(&h).await;
        let tx = h
            .contract
            .submit(create_project_call(&h, Decimal::new(9999, 0)))
            .await
            .unwrap();

        assert!(matches!(
            h.manager.confirm_funding(id, &client(), &tx).await,
            Err(EscrowError::PreconditionFailed(_))
        ));
        assert_eq!(stored(&h, id).await.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_funding_tx_backs_one_job_only() {
        let h = harness();
        let first = assigned_job(&h).await;
        let tx = h
            .contract
            .submit(create_project_call(&h, Decimal::new(100, 0)))
            .await
            .unwrap();
        h.manager.confirm_funding(first, &client(), &tx).await.unwrap();

        // Same terms, same transaction: the project is already taken.
        let twin = assigned_job(&h).await;
        assert!(matches!(
            h.manager.confirm_funding(twin, &client(), &tx).await,
            Err(EscrowError::PreconditionFailed(_))
        ));
        assert_eq!(stored(&h, twin).await.status, JobStatus::Pending);

        // Different price: the transaction does not fund these terms.
        let mut pricier = create_request();
        pricier.price = Decimal::new(9999, 0);
        let pricier = h.manager.create_job(pricier).await.unwrap();
        h.manager
            .assign_freelancer(AssignFreelancerRequest {
                job_id: pricier.id,
                caller: client(),
                freelancer_address: freelancer(),
                delivery_deadline: h.clock.now() + Duration::days(3),
                approval_deadline: h.clock.now() + Duration::days(5),
            })
            .await
            .unwrap();
        assert!(matches!(
            h.manager.confirm_funding(pricier.id, &client(), &tx).await,
            Err(EscrowError::PreconditionFailed(_))
        ));
        assert_eq!(stored(&h, pricier.id).await.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_funding_timeout_leaves_job_pending() {
        let h = harness();
        let id = assigned_job(&h).await;

        let err = h.manager.confirm_funding(id, &client(), "0.0.5005@404").await.unwrap_err();
        assert!(matches!(err, EscrowError::ConfirmationTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(stored(&h, id).await.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_deliver_requires_assigned_freelancer() {
        let h = harness();
        let id = funded_job(&h).await;
        let source = h.dir.path().join("work.pdf");
        tokio::fs::write(&source, b"work").await.unwrap();

        assert!(matches!(
            h.manager.deliver(id, &client(), &source).await,
            Err(EscrowError::Unauthorized(_))
        ));
        assert_eq!(stored(&h, id).await.status, JobStatus::Funded);
    }

    #[tokio::test]
    async fn test_deliver_after_deadline_fails() {
        let h = harness();
        let id = funded_job(&h).await;
        let source = h.dir.path().join("late.pdf");
        tokio::fs::write(&source, b"late work").await.unwrap();

        h.clock.advance(Duration::days(4));
        assert!(matches!(
            h.manager.deliver(id, &freelancer(), &source).await,
            Err(EscrowError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_stores_private_ciphertext() {
        let h = harness();
        let id = delivered_job(&h, b"%PDF-1.7 deliverable").await;

        let job = stored(&h, id).await;
        assert_eq!(job.status, JobStatus::Delivered);
        let asset = job.encrypted_asset.unwrap();
        assert_eq!(asset.mime_type, "application/pdf");

        let preview_hash = job.preview_hash.unwrap();
        assert!(h.blobs.contains(&preview_hash, Visibility::Private).await.unwrap());
        assert!(!h.blobs.contains(&preview_hash, Visibility::Public).await.unwrap());

        // A second delivery is not a legal transition.
        let source = h.dir.path().join("report.pdf");
        assert!(matches!(
            h.manager.deliver(id, &freelancer(), &source).await,
            Err(EscrowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_preview_flow() {
        let h = harness();
        let funded = funded_job(&h).await;
        assert!(matches!(
            h.manager.generate_preview(funded, &client()).await,
            Err(EscrowError::PreconditionFailed(_))
        ));

        let id = delivered_job(&h, b"preview me").await;
        assert!(matches!(
            h.manager.generate_preview(id, &freelancer()).await,
            Err(EscrowError::Unauthorized(_))
        ));

        let issued = h.manager.generate_preview(id, &client()).await.unwrap();
        let access = h.manager.preview_work(id, &client(), &issued.token).await.unwrap();
        assert_eq!(access.mime_type, "application/pdf");
        assert_eq!(tokio::fs::read(access.file.path()).await.unwrap(), b"preview me");
        access.file.remove_now().await;

        assert!(matches!(
            h.manager.preview_work(id, &freelancer(), &issued.token).await,
            Err(EscrowError::Unauthorized(_))
        ));

        h.clock.advance(Duration::minutes(11));
        assert!(matches!(
            h.manager.preview_work(id, &client(), &issued.token).await,
            Err(EscrowError::InvalidOrExpiredToken)
        ));
    }

    #[tokio::test]
    async fn test_approve_publishes_plaintext_once() {
        let h = harness();
        let id = delivered_job(&h, b"final contents").await;
        let before = stored(&h, id).await.encrypted_asset.unwrap();

        assert!(matches!(
            h.manager.approve_work(id, &freelancer()).await,
            Err(EscrowError::Unauthorized(_))
        ));

        let view = h.manager.approve_work(id, &client()).await.unwrap();
        assert_eq!(view.status, JobStatus::Approved);
        let final_hash = view.final_hash.unwrap();
        assert!(h.blobs.contains(&final_hash, Visibility::Public).await.unwrap());

        let after = stored(&h, id).await.encrypted_asset.unwrap();
        assert_eq!(after.key, before.key);
        assert_eq!(after.nonce, before.nonce);

        assert!(matches!(
            h.manager.approve_work(id, &client()).await,
            Err(EscrowError::InvalidTransition { .. })
        ));
        assert_eq!(stored(&h, id).await.final_hash.as_deref(), Some(final_hash.as_str()));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_blocks_approval() {
        let h = harness();
        let id = delivered_job(&h, b"untouched deliverable bytes").await;
        let asset = stored(&h, id).await.encrypted_asset.unwrap();

        let mut bytes = tokio::fs::read(&asset.ciphertext_location).await.unwrap();
        bytes[0] ^= 0x01;
        tokio::fs::write(&asset.ciphertext_location, bytes).await.unwrap();

        assert!(matches!(
            h.manager.approve_work(id, &client()).await,
            Err(EscrowError::AuthenticationFailure)
        ));
        let job = stored(&h, id).await;
        assert_eq!(job.status, JobStatus::Delivered);
        assert!(job.final_hash.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_approvals_release_once() {
        let h = harness();
        let id = delivered_job(&h, b"race").await;

        let a = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.approve_work(id, &client()).await })
        };
        let b = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.approve_work(id, &client()).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let approvals = h
            .manager
            .job_events(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == "job.approved")
            .count();
        assert_eq!(approvals, 1);
    }

    #[tokio::test]
    async fn test_refund_only_from_funded() {
        let h = harness();
        let id = funded_job(&h).await;
        h.contract
            .script_call(
                "0.0.5005@900",
                &ContractCall::RequestRefund { project_id: 1 },
                vec![ScriptStep::Success(Vec::new())],
            )
            .await
            .unwrap();

        let view = h
            .manager
            .update_job_status(id, JobStatus::Refunded, "0.0.5005@900")
            .await
            .unwrap();
        assert_eq!(view.status, JobStatus::Refunded);

        let delivered = delivered_job(&h, b"done").await;
        assert!(matches!(
            h.manager
                .update_job_status(delivered, JobStatus::Refunded, "0.0.5005@900")
                .await,
            Err(EscrowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.manager
                .update_job_status(delivered, JobStatus::Funded, "0.0.5005@900")
                .await,
            Err(EscrowError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_chain_outcome_needs_matching_transaction() {
        let h = harness();
        let id = delivered_job(&h, b"SECRET DELIVERABLE").await;
        let funding_tx = stored(&h, id).await.funding_tx.unwrap();
        let auto_approve = ContractCall::AutoApproveIfClientSilent { project_id: 1 };
        h.contract
            .script_call("0.0.5005@700", &auto_approve, vec![ScriptStep::Success(Vec::new())])
            .await
            .unwrap();

        // Inside the approval window nothing but the client approves.
        assert!(matches!(
            h.manager
                .update_job_status(id, JobStatus::Approved, "0.0.5005@700")
                .await,
            Err(EscrowError::PreconditionFailed(_))
        ));

        // Past the window, an unrelated successful transaction is refused.
        h.clock.advance(Duration::days(6));
        assert!(matches!(
            h.manager.update_job_status(id, JobStatus::Approved, &funding_tx).await,
            Err(EscrowError::PreconditionFailed(_))
        ));
        let job = stored(&h, id).await;
        assert_eq!(job.status, JobStatus::Delivered);
        assert!(job.final_hash.is_none());
        assert!(job.encrypted_asset.is_some());

        let view = h
            .manager
            .update_job_status(id, JobStatus::Approved, "0.0.5005@700")
            .await
            .unwrap();
        assert_eq!(view.status, JobStatus::Approved);
    }

    #[tokio::test]
    async fn test_refund_of_another_project_is_refused() {
        let h = harness();
        let id = funded_job(&h).await;
        h.contract
            .script_call(
                "0.0.5005@800",
                &ContractCall::RequestRefund { project_id: 42 },
                vec![ScriptStep::Success(Vec::new())],
            )
            .await
            .unwrap();

        assert!(matches!(
            h.manager
                .update_job_status(id, JobStatus::Refunded, "0.0.5005@800")
                .await,
            Err(EscrowError::PreconditionFailed(_))
        ));
        assert_eq!(stored(&h, id).await.status, JobStatus::Funded);
    }

    #[tokio::test]
    async fn test_comments() {
        let h = harness();
        let job = h.manager.create_job(create_request()).await.unwrap();

        let comment = h
            .manager
            .create_comment(CreateCommentRequest {
                job_id: job.id,
                content: "  I can deliver by Friday  ".to_string(),
                freelancer_address: freelancer(),
            })
            .await
            .unwrap();
        assert_eq!(comment.content, "I can deliver by Friday");
        assert_eq!(comment.freelancer_address, freelancer());

        let too_long = CreateCommentRequest {
            job_id: job.id,
            content: "x".repeat(2001),
            freelancer_address: freelancer(),
        };
        assert!(matches!(
            h.manager.create_comment(too_long).await,
            Err(EscrowError::Validation(_))
        ));
        let own_job = CreateCommentRequest {
            job_id: job.id,
            content: "Bump".to_string(),
            freelancer_address: client(),
        };
        assert!(matches!(
            h.manager.create_comment(own_job).await,
            Err(EscrowError::Validation(_))
        ));
        let missing = CreateCommentRequest {
            job_id: Uuid::new_v4(),
            content: "Hello".to_string(),
            freelancer_address: freelancer(),
        };
        assert!(matches!(
            h.manager.create_comment(missing).await,
            Err(EscrowError::NotFound(_))
        ));

        let comments = h.manager.job_comments(job.id).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, comment.id);

        let stored_comments = h.manager.store.comments_for(job.id).await.unwrap();
        assert!(!serde_json::to_string(&stored_comments).unwrap().contains("0.0.2002"));
    }

    #[tokio::test]
    async fn test_overdue_delivery_is_refunded() {
        let h = harness();
        let id = funded_job(&h).await;

        assert!(matches!(
            h.manager.resolve_overdue(id, h.contract.as_ref()).await,
            Err(EscrowError::PreconditionFailed(_))
        ));

        h.clock.advance(Duration::days(4));
        let view = h.manager.resolve_overdue(id, h.contract.as_ref()).await.unwrap();
        assert_eq!(view.status, JobStatus::Refunded);
        assert!(h
            .contract
            .submitted()
            .await
            .contains(&ContractCall::AutoRefundIfLate { project_id: 1 }));
    }

    #[tokio::test]
    async fn test_silent_client_is_auto_approved() {
        let h = harness();
        let id = delivered_job(&h, b"auto").await;

        h.clock.advance(Duration::days(6));
        let view = h.manager.resolve_overdue(id, h.contract.as_ref()).await.unwrap();
        assert_eq!(view.status, JobStatus::Approved);
        assert!(view.final_hash.is_some());

        let events = h.manager.job_events(id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, "job.auto_approved");
        assert_eq!(last.actor, ActorRole::Chain);
    }

    #[tokio::test]
    async fn test_listing_and_soft_delete() {
        let h = harness();
        let first = assigned_job(&h).await;
        let mut other = create_request();
        other.client_address = WalletAddress::parse("0.0.3003").unwrap();
        let second = h.manager.create_job(other).await.unwrap();

        assert_eq!(h.manager.list_jobs().await.unwrap().len(), 2);
        let mine = h.manager.jobs_for_address(&freelancer()).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, first);

        assert!(matches!(
            h.manager.delete_job(second.id, &client()).await,
            Err(EscrowError::Unauthorized(_))
        ));
        h.manager
            .delete_job(first, &client())
            .await
            .unwrap();

        assert_eq!(h.manager.list_jobs().await.unwrap().len(), 1);
        assert!(matches!(
            h.manager.get_job(first).await,
            Err(EscrowError::NotFound(_))
        ));
        assert!(stored(&h, first).await.is_deleted);
    }

    #[tokio::test]
    async fn test_audit_trail_has_no_plaintext_addresses() {
        let h = harness();
        let id = delivered_job(&h, b"audit").await;
        h.manager.approve_work(id, &client()).await.unwrap();

        let events = h.manager.job_events(id).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "job.created",
                "job.freelancer_assigned",
                "job.funded",
                "job.delivered",
                "job.approved"
            ]
        );

        let dump = serde_json::to_string(&events).unwrap();
        assert!(!dump.contains("0.0.1001"));
        assert!(!dump.contains("0.0.2002"));
    }
}
