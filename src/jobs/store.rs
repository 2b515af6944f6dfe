//! Job state persistence seam.
//!
//! The service's relational store owns job rows; the core needs create,
//! status updates, lookup, and tenant-scoped listing. Status updates are
//! partial: only the provided fields change.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::{RagError, Result};
use crate::types::{Job, JobId, JobStatus, TenantId};

/// Partial update applied to a job row.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub result: Option<HashMap<String, serde_json::Value>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: HashMap<String, serde_json::Value>) -> Self {
        self.result = Some(result);
        self
    }
}

/// Seam to the external job state store.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<()>;

    async fn update_status(&self, job_id: JobId, update: JobUpdate) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Jobs for a tenant, optionally filtered by status, newest first.
    async fn list(&self, tenant_id: TenantId, status: Option<JobStatus>) -> Result<Vec<Job>>;

    /// Delete every job owned by a tenant.
    async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()>;
}

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<()> {
        self.jobs.write().unwrap().insert(job.job_id, job);
        Ok(())
    }

    async fn update_status(&self, job_id: JobId, update: JobUpdate) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Err(RagError::Internal(format!("unknown job {}", job_id)));
        };

        if let Some(status) = update.status {
            job.status = status;
        }
        if let Some(progress) = update.progress {
            job.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn list(&self, tenant_id: TenantId, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap();
        let mut listed: Vec<Job> = jobs
            .values()
            .filter(|job| job.tenant_id == tenant_id)
            .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listed)
    }

    async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()> {
        self.jobs
            .write()
            .unwrap()
            .retain(|_, job| job.tenant_id != tenant_id);
        Ok(())
    }
}
