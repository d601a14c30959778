//! Job Store (C4): thread↔job mapping and idle detection.
//!
//! A thin, named seam over [`crate::db::Datastore`] rather than a second
//! copy of its logic — the get-or-create and idle-reaping *contracts* are
//! the component named in spec §4.4, but the actual transactional
//! implementation lives with the repository (Postgres `ON CONFLICT` upsert
//! in [`crate::db::postgres`], a mutex-guarded map in
//! [`crate::testutil::FakeDatastore`]) since duplicating it here would just
//! be an extra indirection with no new behavior.

use std::sync::Arc;

use chrono::Utc;

use crate::db::{Created, Datastore, NewJob};
use crate::error::Result;
use crate::ids::{IntegrationId, JobId, OrgId};
use crate::models::Job;

pub struct JobStore {
    db: Arc<dyn Datastore>,
}

impl JobStore {
    pub fn new(db: Arc<dyn Datastore>) -> Self {
        Self { db }
    }

    pub async fn get_or_create(&self, new_job: NewJob) -> Result<(Job, Created)> {
        self.db.get_or_create_job(new_job).await
    }

    pub async fn find_by_thread(&self, org_id: &OrgId, integration_id: &IntegrationId, thread_key: &str) -> Result<Option<Job>> {
        self.db.find_job_by_thread(org_id, integration_id, thread_key).await
    }

    pub async fn touch(&self, org_id: &OrgId, job_id: &JobId) -> Result<()> {
        self.db.touch_job(org_id, job_id).await
    }

    /// Idempotent: a second delete of the same job returns `Ok(false)`.
    pub async fn delete(&self, org_id: &OrgId, job_id: &JobId) -> Result<bool> {
        self.db.delete_job(org_id, job_id).await
    }

    /// Jobs whose `updated_at` is older than `minutes` ago. Default
    /// threshold is 60 minutes, overridable per-org via the `settings`
    /// table (see [`crate::commands::Settings::idle_threshold_minutes`]).
    pub async fn get_idle_jobs(&self, org_id: &OrgId, minutes: i64) -> Result<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes.max(0));
        self.db.list_idle_jobs(org_id, cutoff).await
    }
}
