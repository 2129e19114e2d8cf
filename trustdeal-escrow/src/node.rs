//! Main Escrow Node - High-level API for the escrow system
//!
//! This is the surface the web layer calls. It wires every component from
//! one [`EscrowConfig`] and one [`EscrowSecrets`], accepts raw wallet
//! addresses and status strings as they arrive over HTTP, and returns
//! [`EscrowResult`]s whose errors map to response codes through
//! [`EscrowError::status_code`].

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::blob_store::{BlobStore, LocalBlobStore};
use crate::cipher_engine::CipherEngine;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigSummary, EscrowConfig, EscrowSecrets};
use crate::escrow_bridge::{
    ContractResultSource, ContractSubmitter, EscrowConfirmationBridge, MirrorNodeClient,
};
use crate::job_manager::{self, JobManager, PreviewAccess};
use crate::job_store::{InMemoryJobStore, JobStore};
use crate::models::{CommentView, JobEvent, JobStatus, JobView, WalletAddress};
use crate::preview_token::{IssuedPreviewToken, PreviewTokenIssuer};
use crate::{EscrowResult, error::EscrowError};

/// Job creation request
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub client_address: String,
}

/// Freelancer assignment request
#[derive(Debug, Clone)]
pub struct AssignFreelancerRequest {
    pub job_id: Uuid,
    pub caller: String,
    pub freelancer_address: String,
    pub delivery_deadline: DateTime<Utc>,
    pub approval_deadline: DateTime<Utc>,
}

/// Comment creation request
#[derive(Debug, Clone)]
pub struct CreateCommentRequest {
    pub job_id: Uuid,
    pub content: String,
    pub freelancer_address: String,
}

/// Collaborators the node runs against. Production defaults come from
/// [`NodeComponents::from_config`].
pub struct NodeComponents {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub results: Arc<dyn ContractResultSource>,
}

impl NodeComponents {
    pub fn from_config(config: &EscrowConfig) -> EscrowResult<Self> {
        Ok(Self {
            clock: Arc::new(SystemClock),
            store: Arc::new(InMemoryJobStore::new()),
            blobs: Arc::new(LocalBlobStore::new(config.blobs.clone())),
            results: Arc::new(MirrorNodeClient::new(&config.confirmation)?),
        })
    }
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    config: EscrowConfig,
    job_manager: Arc<JobManager>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl EscrowNode {
    /// Create a node with the production collaborators
    pub fn new(config: EscrowConfig, secrets: EscrowSecrets) -> EscrowResult<Self> {
        let components = NodeComponents::from_config(&config)?;
        Self::with_components(config, secrets, components)
    }

    /// Create a node with explicit collaborators
    pub fn with_components(
        config: EscrowConfig,
        secrets: EscrowSecrets,
        components: NodeComponents,
    ) -> EscrowResult<Self> {
        info!("Initializing escrow node");
        config.validate()?;

        let cipher = Arc::new(CipherEngine::new(config.cipher.clone(), components.clock.clone())?);
        let tokens = Arc::new(PreviewTokenIssuer::new(
            config.preview.clone(),
            secrets.token_secret(),
            components.clock.clone(),
        )?);
        let bridge = Arc::new(EscrowConfirmationBridge::new(
            config.confirmation.clone(),
            components.results,
        )?);

        let job_manager = Arc::new(JobManager::new(
            config.jobs.clone(),
            components.store.clone(),
            cipher,
            tokens,
            bridge,
            components.blobs,
            secrets.fields().clone(),
            components.clock.clone(),
        ));

        info!("Escrow node initialized: {:?}", ConfigSummary::from(&config));
        Ok(Self {
            config,
            job_manager,
            store: components.store,
            clock: components.clock,
        })
    }

    /// Create a new job
    pub async fn create_job(&self, request: CreateJobRequest) -> EscrowResult<JobView> {
        self.job_manager
            .create_job(job_manager::CreateJobRequest {
                title: request.title,
                description: request.description,
                price: request.price,
                client_address: WalletAddress::parse(&request.client_address)?,
            })
            .await
    }

    /// Assign the freelancer and deadlines
    pub async fn assign_freelancer(&self, request: AssignFreelancerRequest) -> EscrowResult<JobView> {
        self.job_manager
            .assign_freelancer(job_manager::AssignFreelancerRequest {
                job_id: request.job_id,
                caller: WalletAddress::parse(&request.caller)?,
                freelancer_address: WalletAddress::parse(&request.freelancer_address)?,
                delivery_deadline: request.delivery_deadline,
                approval_deadline: request.approval_deadline,
            })
            .await
    }

    /// Confirm the on-chain project creation for a job
    pub async fn confirm_funding(&self, job_id: Uuid, caller: &str, tx_ref: &str) -> EscrowResult<JobView> {
        let caller = WalletAddress::parse(caller)?;
        self.job_manager.confirm_funding(job_id, &caller, tx_ref).await
    }

    /// Deliver the file at `source`
    pub async fn deliver(&self, job_id: Uuid, caller: &str, source: &Path) -> EscrowResult<JobView> {
        let caller = WalletAddress::parse(caller)?;
        self.job_manager.deliver(job_id, &caller, source).await
    }

    /// Issue a preview token
    pub async fn generate_preview(&self, job_id: Uuid, caller: &str) -> EscrowResult<IssuedPreviewToken> {
        let caller = WalletAddress::parse(caller)?;
        self.job_manager.generate_preview(job_id, &caller).await
    }

    /// Redeem a preview token
    pub async fn preview_work(&self, job_id: Uuid, caller: &str, token: &str) -> EscrowResult<PreviewAccess> {
        let caller = WalletAddress::parse(caller)?;
        self.job_manager.preview_work(job_id, &caller, token).await
    }

    /// Approve the delivered work
    pub async fn approve_work(&self, job_id: Uuid, caller: &str) -> EscrowResult<JobView> {
        let caller = WalletAddress::parse(caller)?;
        self.job_manager.approve_work(job_id, &caller).await
    }

    /// Mirror a terminal status reached on chain
    pub async fn update_job_status(&self, job_id: Uuid, status: &str, tx_ref: &str) -> EscrowResult<JobView> {
        let status: JobStatus = status.parse()?;
        self.job_manager.update_job_status(job_id, status, tx_ref).await
    }

    /// Trigger deadline resolution for an overdue job
    pub async fn resolve_overdue(
        &self,
        job_id: Uuid,
        submitter: &dyn ContractSubmitter,
    ) -> EscrowResult<JobView> {
        self.job_manager.resolve_overdue(job_id, submitter).await
    }

    /// Soft-delete a job
    pub async fn delete_job(&self, job_id: Uuid, caller: &str) -> EscrowResult<()> {
        let caller = WalletAddress::parse(caller)?;
        self.job_manager.delete_job(job_id, &caller).await
    }

    /// Get a job by id
    pub async fn get_job(&self, job_id: Uuid) -> EscrowResult<JobView> {
        self.job_manager.get_job(job_id).await
    }

    /// All live jobs
    pub async fn list_jobs(&self) -> EscrowResult<Vec<JobView>> {
        self.job_manager.list_jobs().await
    }

    /// Jobs where `address` is a party
    pub async fn get_jobs_by_user(&self, address: &str) -> EscrowResult<Vec<JobView>> {
        let address = WalletAddress::parse(address)?;
        self.job_manager.jobs_for_address(&address).await
    }

    /// Audit trail of a job
    pub async fn job_events(&self, job_id: Uuid) -> EscrowResult<Vec<JobEvent>> {
        self.job_manager.job_events(job_id).await
    }

    /// Post a comment on a job
    pub async fn create_comment(&self, request: CreateCommentRequest) -> EscrowResult<CommentView> {
        self.job_manager
            .create_comment(job_manager::CreateCommentRequest {
                job_id: request.job_id,
                content: request.content,
                freelancer_address: WalletAddress::parse(&request.freelancer_address)?,
            })
            .await
    }

    /// Comments on a job
    pub async fn job_comments(&self, job_id: Uuid) -> EscrowResult<Vec<CommentView>> {
        self.job_manager.job_comments(job_id).await
    }

    /// Check storage and directories are usable
    pub async fn health_check(&self) -> EscrowResult<NodeHealth> {
        let mut issues = Vec::new();

        if let Err(e) = self.store.list().await {
            issues.push(format!("Job store error: {}", e));
        }

        for dir in [
            &self.config.cipher.storage_dir,
            &self.config.cipher.ephemeral_dir,
            &self.config.jobs.release_dir,
        ] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                issues.push(format!("Directory {} unusable: {}", dir.display(), e));
            }
        }

        Ok(NodeHealth {
            healthy: issues.is_empty(),
            issues,
            timestamp: self.clock.now(),
        })
    }

    /// Map an error to the HTTP status the web layer should answer with
    pub fn http_status(error: &EscrowError) -> u16 {
        error.status_code()
    }
}

/// Node health status
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
