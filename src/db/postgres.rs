//! `sqlx`-backed `Datastore` implementation.
//!
//! Uses the runtime query API (`sqlx::query`/`query_as`) rather than the
//! `query!`/`query_as!` macros, since the macros require a live database at
//! build time to check column types; this crate is built without a
//! database available in CI or for contributors who have not run the
//! migrations yet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::db::{Created, Datastore, NewJob, NewMessage};
use crate::error::{BrokerError, Result};
use crate::ids::{ActiveAgentId, AssignmentId, IntegrationId, JobId, OrgId, ProcessedMessageId};
use crate::models::{
    ActiveAgent, AgentJobAssignment, ChatPlatformKind, ConnectedChannel, Integration, Job,
    MessageStatus, Organization, ProcessedMessage, SettingValue,
};
use crate::util::retry::retry_with_backoff;

/// Postgres-backed datastore. Holds a connection pool; cheap to clone
/// (`PgPool` is itself an `Arc`-wrapped handle), so this type is shared as
/// `Arc<dyn Datastore>` across the scheduler, registry, and periodic tasks.
pub struct PostgresDatastore {
    pool: PgPool,
}

impl PostgresDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the embedded migrations. Called once at startup.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn platform_str(p: ChatPlatformKind) -> &'static str {
    p.as_str()
}

fn parse_platform(s: &str) -> Result<ChatPlatformKind> {
    match s {
        "slack" => Ok(ChatPlatformKind::Slack),
        "discord" => Ok(ChatPlatformKind::Discord),
        other => Err(BrokerError::Fatal(format!("unknown platform discriminant {other:?}"))),
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        integration_id: row.try_get("integration_id")?,
        platform: parse_platform(row.try_get::<String, _>("platform")?.as_str())?,
        channel_key: row.try_get("channel_key")?,
        thread_key: row.try_get("thread_key")?,
        originating_user: row.try_get("originating_user")?,
        updated_at: row.try_get("updated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<ProcessedMessage> {
    Ok(ProcessedMessage {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        org_id: row.try_get("org_id")?,
        integration_id: row.try_get("integration_id")?,
        channel_key: row.try_get("channel_key")?,
        message_id: row.try_get("message_id")?,
        text: row.try_get("text")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_agent(row: &sqlx::postgres::PgRow) -> Result<ActiveAgent> {
    Ok(ActiveAgent {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        ws_connection_id: row.try_get("ws_connection_id")?,
        ccagent_id: row.try_get("ccagent_id")?,
        repo_url: row.try_get("repo_url")?,
        last_active_at: row.try_get("last_active_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_assignment(row: &sqlx::postgres::PgRow) -> Result<AgentJobAssignment> {
    Ok(AgentJobAssignment {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        agent_id: row.try_get("agent_id")?,
        job_id: row.try_get("job_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_integration(row: &sqlx::postgres::PgRow) -> Result<Integration> {
    Ok(Integration {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        platform: parse_platform(row.try_get::<String, _>("platform")?.as_str())?,
        platform_team_or_guild_id: row.try_get("platform_team_or_guild_id")?,
        display_name: row.try_get("display_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Datastore for PostgresDatastore {
    async fn get_org(&self, org_id: &OrgId) -> Result<Organization> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::NotFound)?;
        Ok(Organization {
            id: row.try_get("id")?,
            ccagent_secret_key_hash: row.try_get("ccagent_secret_key_hash")?,
            ccagent_secret_key_generated_at: row.try_get("ccagent_secret_key_generated_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn list_all_org_ids(&self) -> Result<Vec<OrgId>> {
        let rows = sqlx::query("SELECT id FROM organizations").fetch_all(&self.pool).await?;
        rows.iter().map(|row| Ok(row.try_get("id")?)).collect()
    }

    async fn rotate_secret_key(&self, org_id: &OrgId, new_hash: &str) -> Result<Organization> {
        sqlx::query(
            "UPDATE organizations SET ccagent_secret_key_hash = $1, ccagent_secret_key_generated_at = now() WHERE id = $2",
        )
        .bind(new_hash)
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        self.get_org(org_id).await
    }

    async fn resolve_org_by_secret_hash(&self, hash: &str) -> Result<Organization> {
        let row = sqlx::query("SELECT * FROM organizations WHERE ccagent_secret_key_hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::Unauthorized)?;
        Ok(Organization {
            id: row.try_get("id")?,
            ccagent_secret_key_hash: row.try_get("ccagent_secret_key_hash")?,
            ccagent_secret_key_generated_at: row.try_get("ccagent_secret_key_generated_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn upsert_integration(
        &self,
        org_id: &OrgId,
        platform: ChatPlatformKind,
        platform_team_or_guild_id: &str,
        display_name: &str,
        auth_token: &str,
    ) -> Result<Integration> {
        let id = crate::ids::IntegrationId::generate();
        let row = sqlx::query(
            "INSERT INTO integrations (id, org_id, platform, platform_team_or_guild_id, display_name, auth_token, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, now(), now())
             ON CONFLICT (platform, platform_team_or_guild_id)
             DO UPDATE SET display_name = excluded.display_name, auth_token = excluded.auth_token, updated_at = now()
             RETURNING *",
        )
        .bind(&id)
        .bind(org_id)
        .bind(platform_str(platform))
        .bind(platform_team_or_guild_id)
        .bind(display_name)
        .bind(auth_token)
        .fetch_one(&self.pool)
        .await?;
        row_to_integration(&row)
    }

    async fn get_integration_by_platform_id(
        &self,
        platform: ChatPlatformKind,
        platform_team_or_guild_id: &str,
    ) -> Result<Integration> {
        let row = sqlx::query("SELECT * FROM integrations WHERE platform = $1 AND platform_team_or_guild_id = $2")
            .bind(platform_str(platform))
            .bind(platform_team_or_guild_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::NotFound)?;
        row_to_integration(&row)
    }

    async fn get_integration(&self, org_id: &OrgId, integration_id: &IntegrationId) -> Result<Integration> {
        let row = sqlx::query("SELECT * FROM integrations WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(integration_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::NotFound)?;
        row_to_integration(&row)
    }

    async fn get_integration_auth_token(&self, integration_id: &IntegrationId) -> Result<String> {
        let row = sqlx::query("SELECT auth_token FROM integrations WHERE id = $1")
            .bind(integration_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::NotFound)?;
        Ok(row.try_get("auth_token")?)
    }

    async fn list_integrations(&self, org_id: &OrgId) -> Result<Vec<Integration>> {
        let rows = sqlx::query("SELECT * FROM integrations WHERE org_id = $1")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_integration).collect()
    }

    async fn upsert_connected_channel(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
    ) -> Result<ConnectedChannel> {
        let row = sqlx::query(
            "INSERT INTO connected_channels (org_id, integration_id, channel_key, created_at, updated_at)
             VALUES ($1, $2, $3, now(), now())
             ON CONFLICT (org_id, integration_id, channel_key) DO UPDATE SET updated_at = now()
             RETURNING *",
        )
        .bind(org_id)
        .bind(integration_id)
        .bind(channel_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(ConnectedChannel {
            org_id: row.try_get("org_id")?,
            integration_id: row.try_get("integration_id")?,
            channel_key: row.try_get("channel_key")?,
            default_repo_url: row.try_get("default_repo_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn set_default_repo(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
        repo_url: &str,
    ) -> Result<ConnectedChannel> {
        let row = sqlx::query(
            "UPDATE connected_channels SET default_repo_url = $1, updated_at = now()
             WHERE org_id = $2 AND integration_id = $3 AND channel_key = $4
             RETURNING *",
        )
        .bind(repo_url)
        .bind(org_id)
        .bind(integration_id)
        .bind(channel_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BrokerError::NotFound)?;
        Ok(ConnectedChannel {
            org_id: row.try_get("org_id")?,
            integration_id: row.try_get("integration_id")?,
            channel_key: row.try_get("channel_key")?,
            default_repo_url: row.try_get("default_repo_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn get_connected_channel(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
    ) -> Result<ConnectedChannel> {
        let row = sqlx::query(
            "SELECT * FROM connected_channels WHERE org_id = $1 AND integration_id = $2 AND channel_key = $3",
        )
        .bind(org_id)
        .bind(integration_id)
        .bind(channel_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BrokerError::NotFound)?;
        Ok(ConnectedChannel {
            org_id: row.try_get("org_id")?,
            integration_id: row.try_get("integration_id")?,
            channel_key: row.try_get("channel_key")?,
            default_repo_url: row.try_get("default_repo_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn get_or_create_job(&self, new_job: NewJob) -> Result<(Job, Created)> {
        retry_with_backoff(3, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;

            let id = JobId::generate();
            let row = sqlx::query(
                "INSERT INTO jobs (id, org_id, integration_id, platform, channel_key, thread_key, originating_user, updated_at, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now())
                 ON CONFLICT (org_id, integration_id, thread_key) DO UPDATE SET updated_at = jobs.updated_at
                 RETURNING *, (xmax = 0) AS inserted",
            )
            .bind(&id)
            .bind(&new_job.org_id)
            .bind(&new_job.integration_id)
            .bind(platform_str(new_job.platform))
            .bind(&new_job.channel_key)
            .bind(&new_job.thread_key)
            .bind(&new_job.originating_user)
            .fetch_one(&mut *tx)
            .await?;

            let inserted: bool = row.try_get("inserted")?;
            let job = row_to_job(&row)?;
            tx.commit().await?;
            Ok((job, if inserted { Created::Created } else { Created::Found }))
        })
        .await
    }

    async fn get_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::NotFound)?;
        row_to_job(&row)
    }

    async fn find_job_by_thread(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        thread_key: &str,
    ) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE org_id = $1 AND integration_id = $2 AND thread_key = $3")
            .bind(org_id)
            .bind(integration_id)
            .bind(thread_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn touch_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<()> {
        sqlx::query("UPDATE jobs SET updated_at = now() WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_idle_jobs(&self, org_id: &OrgId, older_than: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE org_id = $1 AND updated_at < $2")
            .bind(org_id)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn create_message(&self, new_message: NewMessage) -> Result<ProcessedMessage> {
        retry_with_backoff(3, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;

            let existing_in_progress: Option<sqlx::postgres::PgRow> = sqlx::query(
                "SELECT 1 as present FROM processed_messages WHERE org_id = $1 AND job_id = $2 AND status = 'in_progress'",
            )
            .bind(&new_message.org_id)
            .bind(&new_message.job_id)
            .fetch_optional(&mut *tx)
            .await?;

            let status = if existing_in_progress.is_some() || !new_message.agent_available {
                MessageStatus::Queued
            } else {
                MessageStatus::InProgress
            };

            let id = ProcessedMessageId::generate();
            let row = sqlx::query(
                "INSERT INTO processed_messages
                    (id, job_id, org_id, integration_id, channel_key, message_id, text, status, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now(), now())
                 RETURNING *",
            )
            .bind(&id)
            .bind(&new_message.job_id)
            .bind(&new_message.org_id)
            .bind(&new_message.integration_id)
            .bind(&new_message.channel_key)
            .bind(&new_message.message_id)
            .bind(&new_message.text)
            .bind(status)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            row_to_message(&row)
        })
        .await
    }

    async fn get_message(&self, org_id: &OrgId, message_id: &ProcessedMessageId) -> Result<ProcessedMessage> {
        let row = sqlx::query("SELECT * FROM processed_messages WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::NotFound)?;
        row_to_message(&row)
    }

    async fn list_queued_for_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Vec<ProcessedMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM processed_messages WHERE org_id = $1 AND job_id = $2 AND status = 'queued' ORDER BY created_at ASC",
        )
        .bind(org_id)
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn list_queued_for_integration(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
    ) -> Result<Vec<ProcessedMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM processed_messages WHERE org_id = $1 AND integration_id = $2 AND status = 'queued' ORDER BY created_at ASC",
        )
        .bind(org_id)
        .bind(integration_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn transition_message(
        &self,
        org_id: &OrgId,
        message_id: &ProcessedMessageId,
        next: MessageStatus,
    ) -> Result<ProcessedMessage> {
        let current = self.get_message(org_id, message_id).await?;
        if !current.status.can_transition_to(next) {
            return Err(BrokerError::Fatal(format!(
                "illegal transition {:?} -> {:?} for message {message_id}",
                current.status, next
            )));
        }
        let row = sqlx::query(
            "UPDATE processed_messages SET status = $1, updated_at = now() WHERE org_id = $2 AND id = $3 RETURNING *",
        )
        .bind(next)
        .bind(org_id)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        row_to_message(&row)
    }

    async fn upsert_agent(
        &self,
        org_id: &OrgId,
        ws_connection_id: &str,
        ccagent_id: &str,
        repo_url: Option<&str>,
    ) -> Result<ActiveAgent> {
        let id = ActiveAgentId::generate();
        let row = sqlx::query(
            "INSERT INTO active_agents (id, org_id, ws_connection_id, ccagent_id, repo_url, last_active_at, created_at)
             VALUES ($1, $2, $3, $4, $5, now(), now())
             ON CONFLICT (ws_connection_id) DO UPDATE SET last_active_at = now(), repo_url = excluded.repo_url
             RETURNING *",
        )
        .bind(&id)
        .bind(org_id)
        .bind(ws_connection_id)
        .bind(ccagent_id)
        .bind(repo_url)
        .fetch_one(&self.pool)
        .await?;
        row_to_agent(&row)
    }

    async fn delete_agent_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>> {
        let row = sqlx::query("DELETE FROM active_agents WHERE ws_connection_id = $1 RETURNING *")
            .bind(ws_connection_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn delete_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM active_agents WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_agent_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>> {
        let row = sqlx::query("SELECT * FROM active_agents WHERE ws_connection_id = $1")
            .bind(ws_connection_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn get_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<ActiveAgent> {
        let row = sqlx::query("SELECT * FROM active_agents WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BrokerError::NotFound)?;
        row_to_agent(&row)
    }

    async fn touch_agent_heartbeat(&self, ws_connection_id: &str) -> Result<()> {
        sqlx::query("UPDATE active_agents SET last_active_at = now() WHERE ws_connection_id = $1")
            .bind(ws_connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_agents_by_org(&self, org_id: &OrgId) -> Result<Vec<ActiveAgent>> {
        let rows = sqlx::query("SELECT * FROM active_agents WHERE org_id = $1")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn list_inactive_agents(&self, org_id: &OrgId, threshold: DateTime<Utc>) -> Result<Vec<ActiveAgent>> {
        let rows = sqlx::query("SELECT * FROM active_agents WHERE org_id = $1 AND last_active_at < $2")
            .bind(org_id)
            .bind(threshold)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn delete_agents_by_org(&self, org_id: &OrgId) -> Result<Vec<ActiveAgent>> {
        let rows = sqlx::query("DELETE FROM active_agents WHERE org_id = $1 RETURNING *")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn assign(&self, org_id: &OrgId, agent_id: &ActiveAgentId, job_id: &JobId) -> Result<AgentJobAssignment> {
        let id = AssignmentId::generate();
        let row = sqlx::query(
            "INSERT INTO agent_job_assignments (id, org_id, agent_id, job_id, created_at)
             VALUES ($1, $2, $3, $4, now())
             RETURNING *",
        )
        .bind(&id)
        .bind(org_id)
        .bind(agent_id)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                BrokerError::Conflict(format!("job {job_id} already has an assigned agent"))
            }
            other => other.into(),
        })?;
        row_to_assignment(&row)
    }

    async fn unassign_by_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Option<AgentJobAssignment>> {
        let row = sqlx::query("DELETE FROM agent_job_assignments WHERE org_id = $1 AND job_id = $2 RETURNING *")
            .bind(org_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_assignment).transpose()
    }

    async fn get_assignment_by_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Option<AgentJobAssignment>> {
        let row = sqlx::query("SELECT * FROM agent_job_assignments WHERE org_id = $1 AND job_id = $2")
            .bind(org_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_assignment).transpose()
    }

    async fn count_assignments_for_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<i64> {
        let row = sqlx::query("SELECT count(*) as n FROM agent_job_assignments WHERE org_id = $1 AND agent_id = $2")
            .bind(org_id)
            .bind(agent_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn list_assignments_by_agent(
        &self,
        org_id: &OrgId,
        agent_id: &ActiveAgentId,
    ) -> Result<Vec<AgentJobAssignment>> {
        let rows = sqlx::query("SELECT * FROM agent_job_assignments WHERE org_id = $1 AND agent_id = $2")
            .bind(org_id)
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_assignment).collect()
    }

    async fn get_setting(&self, org_id: &OrgId, key: &str) -> Result<Option<SettingValue>> {
        let row = sqlx::query("SELECT value_json FROM settings WHERE org_id = $1 AND key = $2")
            .bind(org_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let raw: serde_json::Value = row.try_get("value_json")?;
                Ok(Some(serde_json::from_value(raw).map_err(|e| {
                    BrokerError::Fatal(format!("corrupt setting value for {key}: {e}"))
                })?))
            }
        }
    }

    async fn upsert_setting(&self, org_id: &OrgId, key: &str, value: SettingValue) -> Result<()> {
        let json = serde_json::to_value(&value).expect("SettingValue always serializes");
        sqlx::query(
            "INSERT INTO settings (org_id, key, value_json, value_type, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (org_id, key) DO UPDATE SET value_json = excluded.value_json, value_type = excluded.value_type, updated_at = now()",
        )
        .bind(org_id)
        .bind(key)
        .bind(json)
        .bind(value.type_tag())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
