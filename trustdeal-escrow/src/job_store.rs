//! Job persistence seam
//!
//! All job writes go through [`JobStore::update_if_status`], which only
//! succeeds while the stored status still equals the status the caller read.
//! An on-chain project backs at most one job: the store refuses a write that
//! would bind a funding transaction or project id another job already holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Comment, Job, JobEvent, JobStatus};
use crate::{EscrowResult, error::EscrowError};

/// Storage for job records and their audit trail
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job. Fails if the id is taken.
    async fn insert(&self, job: Job) -> EscrowResult<()>;

    /// Load a job by id, including soft-deleted ones.
    async fn get(&self, id: Uuid) -> EscrowResult<Option<Job>>;

    /// All stored jobs, including soft-deleted ones.
    async fn list(&self) -> EscrowResult<Vec<Job>>;

    /// Replace the stored job if its status is still `expected`.
    ///
    /// Fails with `PreconditionFailed` if another job already holds the same
    /// `funding_tx` or `project_id`.
    async fn update_if_status(&self, expected: JobStatus, job: Job) -> EscrowResult<Job>;

    /// Append an audit event, assigning its sequence number.
    async fn append_event(&self, event: JobEvent) -> EscrowResult<JobEvent>;

    /// Audit events of one job in insertion order.
    async fn events_for(&self, job_id: Uuid) -> EscrowResult<Vec<JobEvent>>;

    /// Store a comment on a job.
    async fn insert_comment(&self, comment: Comment) -> EscrowResult<()>;

    /// Comments on one job, oldest first.
    async fn comments_for(&self, job_id: Uuid) -> EscrowResult<Vec<Comment>>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    events: Arc<RwLock<Vec<JobEvent>>>,
    comments: Arc<RwLock<Vec<Comment>>>,
    next_event_id: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> EscrowResult<()> {
        job.check_invariants()?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(EscrowError::validation(format!("Job {} already exists", job.id)));
        }
        debug!("Stored job {}", job.id);
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EscrowResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list(&self) -> EscrowResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|job| job.created_at);
        Ok(all)
    }

    async fn update_if_status(&self, expected: JobStatus, job: Job) -> EscrowResult<Job> {
        job.check_invariants()?;
        let mut jobs = self.jobs.write().await;

        let binding_taken = jobs.values().any(|other| {
            other.id != job.id
                && ((job.funding_tx.is_some() && other.funding_tx == job.funding_tx)
                    || (job.project_id.is_some() && other.project_id == job.project_id))
        });
        if binding_taken {
            warn!("Job {} would reuse another job's escrow project", job.id);
            return Err(EscrowError::precondition(
                "Funding transaction or project is already bound to another job",
            ));
        }

        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| EscrowError::not_found(format!("Job {}", job.id)))?;

        if stored.status != expected {
            warn!(
                "Conditional update of job {} lost: expected {}, found {}",
                job.id, expected, stored.status
            );
            return Err(EscrowError::invalid_transition(
                stored.status.as_str(),
                job.status.as_str(),
                "Job status changed concurrently",
            ));
        }

        *stored = job.clone();
        Ok(job)
    }

    async fn append_event(&self, mut event: JobEvent) -> EscrowResult<JobEvent> {
        event.id = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.write().await.push(event.clone());
        Ok(event)
    }

    async fn events_for(&self, job_id: Uuid) -> EscrowResult<Vec<JobEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| e.job_id == job_id).cloned().collect())
    }

    async fn insert_comment(&self, comment: Comment) -> EscrowResult<()> {
        debug!("Stored comment {} on job {}", comment.id, comment.job_id);
        self.comments.write().await.push(comment);
        Ok(())
    }

    async fn comments_for(&self, job_id: Uuid) -> EscrowResult<Vec<Comment>> {
        let comments = self.comments.read().await;
        Ok(comments.iter().filter(|c| c.job_id == job_id).cloned().collect())
    }
}

type LockMap = HashMap<Uuid, Arc<Mutex<()>>>;

/// Per-job async mutexes serializing mutating operations on one job.
///
/// A job's entry is dropped again once its last holder or waiter is gone.
#[derive(Default)]
pub struct JobLocks {
    locks: Arc<std::sync::Mutex<LockMap>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `job_id`.
    pub async fn acquire(&self, job_id: Uuid) -> JobLockGuard {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        JobLockGuard {
            job_id,
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive access to one job, released on drop
pub struct JobLockGuard {
    job_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<std::sync::Mutex<LockMap>>,
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Waiters clone the entry under this map lock, so a count of one
        // means nobody else can still reach it.
        if locks
            .get(&self.job_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorRole, Comment, WalletAddress};
    use crate::secure_field::{FieldCipher, SecureField};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn job() -> Job {
        let fields = FieldCipher::derive(b"job-store-tests-field-secret-0123456789").unwrap();
        let client = WalletAddress::parse("0.0.1001").unwrap();
        Job::new(
            "Landing page".to_string(),
            "Single page site".to_string(),
            Decimal::new(250, 0),
            SecureField::obscure(&client, &fields).unwrap(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert(job.clone()).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Landing page");
        assert!(store.insert(job).await.is_err());
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_if_status_compare_and_swap() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert(job.clone()).await.unwrap();

        let mut funded = job.clone();
        funded.status = JobStatus::Funded;
        store.update_if_status(JobStatus::Pending, funded.clone()).await.unwrap();

        // A second writer that also read `pending` loses.
        let mut stale = job.clone();
        stale.status = JobStatus::Funded;
        stale.title = "Stale".to_string();
        let err = store.update_if_status(JobStatus::Pending, stale).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidTransition { .. }));
        assert_eq!(store.get(job.id).await.unwrap().unwrap().title, "Landing page");
    }

    #[tokio::test]
    async fn test_update_rejects_broken_invariants() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.insert(job.clone()).await.unwrap();

        // Delivered without an asset.
        let mut broken = job.clone();
        broken.status = JobStatus::Delivered;
        assert!(matches!(
            store.update_if_status(JobStatus::Pending, broken).await,
            Err(EscrowError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_numbered_per_store() {
        let store = InMemoryJobStore::new();
        let job = job();
        let event = JobEvent {
            id: 0,
            job_id: job.id,
            event_type: "job_created".to_string(),
            actor: ActorRole::Client,
            status: JobStatus::Pending,
            metadata: None,
            created_at: Utc::now(),
        };

        let first = store.append_event(event.clone()).await.unwrap();
        let second = store.append_event(event).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(store.events_for(job.id).await.unwrap().len(), 2);
        assert!(store.events_for(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_locks_serialize_same_job() {
        let locks = Arc::new(JobLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        // Other jobs are not blocked.
        let _other = locks.acquire(Uuid::new_v4()).await;

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_job_locks_are_evicted_after_release() {
        let locks = Arc::new(JobLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Still waited on, so the entry survives the first release.
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);

        for _ in 0..100 {
            let _guard = locks.acquire(Uuid::new_v4()).await;
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_project_binds_to_one_job() {
        let store = InMemoryJobStore::new();
        let first = job();
        let second = job();
        store.insert(first.clone()).await.unwrap();
        store.insert(second.clone()).await.unwrap();

        let mut funded = first.clone();
        funded.status = JobStatus::Funded;
        funded.project_id = Some(1);
        funded.funding_tx = Some("0.0.5005@1".to_string());
        store.update_if_status(JobStatus::Pending, funded).await.unwrap();

        let mut same_tx = second.clone();
        same_tx.status = JobStatus::Funded;
        same_tx.project_id = Some(2);
        same_tx.funding_tx = Some("0.0.5005@1".to_string());
        assert!(matches!(
            store.update_if_status(JobStatus::Pending, same_tx).await,
            Err(EscrowError::PreconditionFailed(_))
        ));

        let mut same_project = second.clone();
        same_project.status = JobStatus::Funded;
        same_project.project_id = Some(1);
        same_project.funding_tx = Some("0.0.5005@2".to_string());
        assert!(matches!(
            store.update_if_status(JobStatus::Pending, same_project).await,
            Err(EscrowError::PreconditionFailed(_))
        ));
        assert_eq!(store.get(second.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_comments_are_kept_per_job() {
        let store = InMemoryJobStore::new();
        let job = job();
        let fields = FieldCipher::derive(b"job-store-tests-field-secret-0123456789").unwrap();
        let freelancer = SecureField::obscure(&WalletAddress::parse("0.0.2002").unwrap(), &fields).unwrap();

        store
            .insert_comment(Comment::new(job.id, "First".to_string(), freelancer.clone(), Utc::now()))
            .await
            .unwrap();
        store
            .insert_comment(Comment::new(job.id, "Second".to_string(), freelancer.clone(), Utc::now()))
            .await
            .unwrap();
        store
            .insert_comment(Comment::new(Uuid::new_v4(), "Elsewhere".to_string(), freelancer, Utc::now()))
            .await
            .unwrap();

        let contents: Vec<String> = store
            .comments_for(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.content)
            .collect();
        assert_eq!(contents, vec!["First", "Second"]);
    }
}
