//! The `Datastore` trait: the one seam between the dispatch/lifecycle core
//! and the transactional persistence layer.
//!
//! This module defines the trait the scheduler/lifecycle/registry/job-store
//! components depend on,
//! plus two implementations: [`postgres::PostgresDatastore`] for production
//! and [`crate::testutil::FakeDatastore`] for tests that need to run
//! scheduler scenarios without a real database.
//!
//! Every method takes `org_id` (or a type that embeds it) as a mandatory
//! filter; implementations must reject cross-organization reads/writes with
//! [`BrokerError::NotFound`] rather than leaking existence, per the
//! authorization error-handling policy.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::ids::{ActiveAgentId, IntegrationId, JobId, OrgId, ProcessedMessageId};
use crate::models::{
    ActiveAgent, AgentJobAssignment, ChatPlatformKind, ConnectedChannel, Integration, Job,
    MessageStatus, Organization, ProcessedMessage, SettingValue,
};

/// Whether a get-or-create call found an existing row or inserted a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    Found,
    Created,
}

/// Input to [`Datastore::get_or_create_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    pub platform: ChatPlatformKind,
    pub channel_key: String,
    pub thread_key: String,
    pub originating_user: String,
}

/// Input to [`Datastore::create_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub job_id: JobId,
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    pub channel_key: String,
    pub message_id: String,
    pub text: String,
    /// Whether the scheduler found a usable agent (already assigned-and-live,
    /// or a live candidate to assign) at the moment of creation. `false`
    /// forces the message to `Queued` even with no `InProgress` sibling,
    /// implementing the "zero live agents -> back-pressure" rule (spec
    /// §4.1) atomically alongside the at-most-one-`InProgress` check.
    pub agent_available: bool,
}

#[async_trait]
pub trait Datastore: Send + Sync {
    // -- Organization -----------------------------------------------------

    async fn get_org(&self, org_id: &OrgId) -> Result<Organization>;

    /// Every organization id known to the instance. Used by the C7 periodic
    /// sweeps, which have no chat event to scope them to a single org and
    /// must iterate every tenant on each pass.
    async fn list_all_org_ids(&self) -> Result<Vec<OrgId>>;

    /// Replaces the stored (peppered, hashed) secret key, bumping
    /// `ccagent_secret_key_generated_at`. Does not itself disconnect
    /// sockets; callers combine this with
    /// [`Datastore::delete_agents_by_org`] and the gateway's own socket
    /// closes, per the rotation scenario.
    async fn rotate_secret_key(&self, org_id: &OrgId, new_hash: &str) -> Result<Organization>;

    async fn resolve_org_by_secret_hash(&self, hash: &str) -> Result<Organization>;

    // -- Integrations -------------------------------------------------------

    async fn upsert_integration(
        &self,
        org_id: &OrgId,
        platform: ChatPlatformKind,
        platform_team_or_guild_id: &str,
        display_name: &str,
        auth_token: &str,
    ) -> Result<Integration>;

    async fn get_integration_by_platform_id(
        &self,
        platform: ChatPlatformKind,
        platform_team_or_guild_id: &str,
    ) -> Result<Integration>;

    async fn get_integration(&self, org_id: &OrgId, integration_id: &IntegrationId) -> Result<Integration>;

    async fn get_integration_auth_token(&self, integration_id: &IntegrationId) -> Result<String>;

    async fn list_integrations(&self, org_id: &OrgId) -> Result<Vec<Integration>>;

    // -- Connected channels -------------------------------------------------

    async fn upsert_connected_channel(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
    ) -> Result<ConnectedChannel>;

    async fn set_default_repo(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
        repo_url: &str,
    ) -> Result<ConnectedChannel>;

    async fn get_connected_channel(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
    ) -> Result<ConnectedChannel>;

    // -- Jobs -----------------------------------------------------------------

    /// Transactional get-or-create keyed by `(org_id, integration_id,
    /// thread_key)`. Serializable: concurrent duplicate thread-root events
    /// are guaranteed to yield exactly one created row and N-1 `Found`
    /// results.
    async fn get_or_create_job(&self, new_job: NewJob) -> Result<(Job, Created)>;

    async fn get_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Job>;

    async fn find_job_by_thread(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        thread_key: &str,
    ) -> Result<Option<Job>>;

    /// Bumps `updated_at` to now; called on every agent- or user-originated
    /// activity so the idle reaper's clock resets.
    async fn touch_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<()>;

    /// Deletes the job, cascading to its processed messages and assignment.
    /// Idempotent: a second call returns `Ok(false)`, never an error.
    async fn delete_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<bool>;

    async fn list_idle_jobs(&self, org_id: &OrgId, older_than: DateTime<Utc>) -> Result<Vec<Job>>;

    // -- Processed messages -----------------------------------------------

    /// Creates a message, deciding `InProgress` vs `Queued` in the same
    /// transaction as the existence check for a sibling `InProgress`
    /// message, so two concurrent arrivals can never both become
    /// `InProgress`. `InProgress` additionally requires
    /// `new_message.agent_available`; otherwise the message is `Queued`
    /// regardless of siblings, so a job never gets a new `InProgress`
    /// message when no agent is actually free to take it.
    async fn create_message(&self, new_message: NewMessage) -> Result<ProcessedMessage>;

    async fn get_message(&self, org_id: &OrgId, message_id: &ProcessedMessageId) -> Result<ProcessedMessage>;

    /// QUEUED siblings of a job, FIFO ordered by `created_at`.
    async fn list_queued_for_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Vec<ProcessedMessage>>;

    /// All QUEUED messages for an integration, used by the re-dispatch
    /// sweep to find candidates across every job in one query.
    async fn list_queued_for_integration(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
    ) -> Result<Vec<ProcessedMessage>>;

    /// Checked transition; rejects regressions and transitions out of the
    /// terminal `Completed` state with [`crate::error::BrokerError::Fatal`].
    async fn transition_message(
        &self,
        org_id: &OrgId,
        message_id: &ProcessedMessageId,
        next: MessageStatus,
    ) -> Result<ProcessedMessage>;

    // -- Agent registry -----------------------------------------------------

    async fn upsert_agent(
        &self,
        org_id: &OrgId,
        ws_connection_id: &str,
        ccagent_id: &str,
        repo_url: Option<&str>,
    ) -> Result<ActiveAgent>;

    async fn delete_agent_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>>;

    async fn delete_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<bool>;

    async fn get_agent_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>>;

    async fn get_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<ActiveAgent>;

    async fn touch_agent_heartbeat(&self, ws_connection_id: &str) -> Result<()>;

    async fn list_agents_by_org(&self, org_id: &OrgId) -> Result<Vec<ActiveAgent>>;

    async fn list_inactive_agents(&self, org_id: &OrgId, threshold: DateTime<Utc>) -> Result<Vec<ActiveAgent>>;

    /// Deletes every agent row owned by the org; returns the deleted rows so
    /// the gateway can close their sockets. Used on secret-key rotation and
    /// by the stale-agent sweep's org-wide variant.
    async fn delete_agents_by_org(&self, org_id: &OrgId) -> Result<Vec<ActiveAgent>>;

    // -- Assignments -----------------------------------------------------------

    /// Inserts the assignment; rejects with `Conflict` if the job already
    /// has one (partial unique index on `job_id`).
    async fn assign(&self, org_id: &OrgId, agent_id: &ActiveAgentId, job_id: &JobId) -> Result<AgentJobAssignment>;

    async fn unassign_by_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Option<AgentJobAssignment>>;

    async fn get_assignment_by_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Option<AgentJobAssignment>>;

    async fn count_assignments_for_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<i64>;

    /// Every assignment currently held by `agent_id`, used by the
    /// scheduler's reclaim path to find the jobs to unassign and requeue.
    async fn list_assignments_by_agent(
        &self,
        org_id: &OrgId,
        agent_id: &ActiveAgentId,
    ) -> Result<Vec<AgentJobAssignment>>;

    // -- Settings -----------------------------------------------------------

    async fn get_setting(&self, org_id: &OrgId, key: &str) -> Result<Option<SettingValue>>;

    async fn upsert_setting(&self, org_id: &OrgId, key: &str, value: SettingValue) -> Result<()>;
}
