//! In-memory fake [`Datastore`] used by scheduler/lifecycle/registry unit
//! tests and the cross-module scenario tests under `tests/`, so full
//! dispatch scenarios can run without a real Postgres instance.
//! Not a second production backend: no serializable-isolation subtleties
//! are modeled beyond what the invariants require (single `Mutex` guarding
//! all state gives the same "no two concurrent writers interleave" property
//! a real serializable transaction gives us, which is sufficient here).

#![cfg(any(test, feature = "test-util"))]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{Created, Datastore, NewJob, NewMessage};
use crate::error::{BrokerError, Result};
use crate::ids::{ActiveAgentId, AssignmentId, IntegrationId, JobId, OrgId, ProcessedMessageId};
use crate::models::{
    ActiveAgent, AgentJobAssignment, ChatPlatformKind, ConnectedChannel, Integration, Job, MessageStatus,
    Organization, ProcessedMessage, SettingValue,
};

#[derive(Default)]
struct State {
    orgs: HashMap<OrgId, Organization>,
    integrations: HashMap<IntegrationId, Integration>,
    channels: HashMap<(OrgId, IntegrationId, String), ConnectedChannel>,
    jobs: HashMap<JobId, Job>,
    messages: HashMap<ProcessedMessageId, ProcessedMessage>,
    agents: HashMap<ActiveAgentId, ActiveAgent>,
    assignments: HashMap<AssignmentId, AgentJobAssignment>,
    settings: HashMap<(OrgId, String), SettingValue>,
}

pub struct FakeDatastore {
    state: Mutex<State>,
}

impl FakeDatastore {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    /// Test convenience: inserts and returns a fresh organization id.
    pub async fn seed_org(&self) -> OrgId {
        let org = Organization::new(OrgId::generate());
        let id = org.id.clone();
        self.state.lock().unwrap().orgs.insert(id.clone(), org);
        id
    }

    pub async fn seed_integration(&self, org_id: &OrgId, platform: ChatPlatformKind) -> IntegrationId {
        let id = IntegrationId::generate();
        let now = Utc::now();
        self.state.lock().unwrap().integrations.insert(
            id.clone(),
            Integration {
                id: id.clone(),
                org_id: org_id.clone(),
                platform,
                platform_team_or_guild_id: format!("team-{id}"),
                display_name: "test".into(),
                created_at: now,
                updated_at: now,
            },
        );
        id
    }
}

#[async_trait]
impl Datastore for FakeDatastore {
    async fn get_org(&self, org_id: &OrgId) -> Result<Organization> {
        self.state.lock().unwrap().orgs.get(org_id).cloned().ok_or(BrokerError::NotFound)
    }

    async fn list_all_org_ids(&self) -> Result<Vec<OrgId>> {
        Ok(self.state.lock().unwrap().orgs.keys().cloned().collect())
    }

    async fn rotate_secret_key(&self, org_id: &OrgId, new_hash: &str) -> Result<Organization> {
        let mut state = self.state.lock().unwrap();
        let org = state.orgs.get_mut(org_id).ok_or(BrokerError::NotFound)?;
        org.ccagent_secret_key_hash = Some(new_hash.to_string());
        org.ccagent_secret_key_generated_at = Some(Utc::now());
        Ok(org.clone())
    }

    async fn resolve_org_by_secret_hash(&self, hash: &str) -> Result<Organization> {
        self.state
            .lock()
            .unwrap()
            .orgs
            .values()
            .find(|o| o.ccagent_secret_key_hash.as_deref() == Some(hash))
            .cloned()
            .ok_or(BrokerError::Unauthorized)
    }

    async fn upsert_integration(
        &self,
        org_id: &OrgId,
        platform: ChatPlatformKind,
        platform_team_or_guild_id: &str,
        display_name: &str,
        _auth_token: &str,
    ) -> Result<Integration> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .integrations
            .values_mut()
            .find(|i| i.platform == platform && i.platform_team_or_guild_id == platform_team_or_guild_id)
        {
            existing.display_name = display_name.to_string();
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }
        let id = IntegrationId::generate();
        let now = Utc::now();
        let integration = Integration {
            id: id.clone(),
            org_id: org_id.clone(),
            platform,
            platform_team_or_guild_id: platform_team_or_guild_id.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
            updated_at: now,
        };
        state.integrations.insert(id, integration.clone());
        Ok(integration)
    }

    async fn get_integration_by_platform_id(
        &self,
        platform: ChatPlatformKind,
        platform_team_or_guild_id: &str,
    ) -> Result<Integration> {
        self.state
            .lock()
            .unwrap()
            .integrations
            .values()
            .find(|i| i.platform == platform && i.platform_team_or_guild_id == platform_team_or_guild_id)
            .cloned()
            .ok_or(BrokerError::NotFound)
    }

    async fn get_integration(&self, org_id: &OrgId, integration_id: &IntegrationId) -> Result<Integration> {
        self.state
            .lock()
            .unwrap()
            .integrations
            .get(integration_id)
            .filter(|i| &i.org_id == org_id)
            .cloned()
            .ok_or(BrokerError::NotFound)
    }

    async fn get_integration_auth_token(&self, _integration_id: &IntegrationId) -> Result<String> {
        Ok("fake-token".to_string())
    }

    async fn list_integrations(&self, org_id: &OrgId) -> Result<Vec<Integration>> {
        Ok(self.state.lock().unwrap().integrations.values().filter(|i| &i.org_id == org_id).cloned().collect())
    }

    async fn upsert_connected_channel(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
    ) -> Result<ConnectedChannel> {
        let mut state = self.state.lock().unwrap();
        let key = (org_id.clone(), integration_id.clone(), channel_key.to_string());
        let now = Utc::now();
        let entry = state.channels.entry(key).or_insert_with(|| ConnectedChannel {
            org_id: org_id.clone(),
            integration_id: integration_id.clone(),
            channel_key: channel_key.to_string(),
            default_repo_url: None,
            created_at: now,
            updated_at: now,
        });
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn set_default_repo(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
        repo_url: &str,
    ) -> Result<ConnectedChannel> {
        let mut state = self.state.lock().unwrap();
        let key = (org_id.clone(), integration_id.clone(), channel_key.to_string());
        let entry = state.channels.get_mut(&key).ok_or(BrokerError::NotFound)?;
        entry.default_repo_url = Some(repo_url.to_string());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn get_connected_channel(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        channel_key: &str,
    ) -> Result<ConnectedChannel> {
        let key = (org_id.clone(), integration_id.clone(), channel_key.to_string());
        self.state.lock().unwrap().channels.get(&key).cloned().ok_or(BrokerError::NotFound)
    }

    async fn get_or_create_job(&self, new_job: NewJob) -> Result<(Job, Created)> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.jobs.values().find(|j| {
            j.org_id == new_job.org_id && j.integration_id == new_job.integration_id && j.thread_key == new_job.thread_key
        }) {
            return Ok((existing.clone(), Created::Found));
        }
        let now = Utc::now();
        let job = Job {
            id: JobId::generate(),
            org_id: new_job.org_id,
            integration_id: new_job.integration_id,
            platform: new_job.platform,
            channel_key: new_job.channel_key,
            thread_key: new_job.thread_key,
            originating_user: new_job.originating_user,
            updated_at: now,
            created_at: now,
        };
        state.jobs.insert(job.id.clone(), job.clone());
        Ok((job, Created::Created))
    }

    async fn get_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Job> {
        self.state.lock().unwrap().jobs.get(job_id).filter(|j| &j.org_id == org_id).cloned().ok_or(BrokerError::NotFound)
    }

    async fn find_job_by_thread(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
        thread_key: &str,
    ) -> Result<Option<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| &j.org_id == org_id && &j.integration_id == integration_id && j.thread_key == thread_key)
            .cloned())
    }

    async fn touch_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let job = state.jobs.get_mut(job_id).filter(|j| &j.org_id == org_id).ok_or(BrokerError::NotFound)?;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let existed = state.jobs.remove(job_id).filter(|j| &j.org_id == org_id).is_some();
        state.messages.retain(|_, m| &m.job_id != job_id);
        state.assignments.retain(|_, a| &a.job_id != job_id);
        Ok(existed)
    }

    async fn list_idle_jobs(&self, org_id: &OrgId, older_than: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| &j.org_id == org_id && j.updated_at < older_than)
            .cloned()
            .collect())
    }

    async fn create_message(&self, new_message: NewMessage) -> Result<ProcessedMessage> {
        let mut state = self.state.lock().unwrap();
        let has_in_progress = state
            .messages
            .values()
            .any(|m| m.job_id == new_message.job_id && m.status == MessageStatus::InProgress);
        let status = if has_in_progress || !new_message.agent_available {
            MessageStatus::Queued
        } else {
            MessageStatus::InProgress
        };
        let now = Utc::now();
        let message = ProcessedMessage {
            id: ProcessedMessageId::generate(),
            job_id: new_message.job_id,
            org_id: new_message.org_id,
            integration_id: new_message.integration_id,
            channel_key: new_message.channel_key,
            message_id: new_message.message_id,
            text: new_message.text,
            status,
            created_at: now,
            updated_at: now,
        };
        state.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn get_message(&self, org_id: &OrgId, message_id: &ProcessedMessageId) -> Result<ProcessedMessage> {
        self.state.lock().unwrap().messages.get(message_id).filter(|m| &m.org_id == org_id).cloned().ok_or(BrokerError::NotFound)
    }

    async fn list_queued_for_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Vec<ProcessedMessage>> {
        let mut msgs: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .messages
            .values()
            .filter(|m| &m.org_id == org_id && &m.job_id == job_id && m.status == MessageStatus::Queued)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.created_at);
        Ok(msgs)
    }

    async fn list_queued_for_integration(
        &self,
        org_id: &OrgId,
        integration_id: &IntegrationId,
    ) -> Result<Vec<ProcessedMessage>> {
        let mut msgs: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .messages
            .values()
            .filter(|m| &m.org_id == org_id && &m.integration_id == integration_id && m.status == MessageStatus::Queued)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.created_at);
        Ok(msgs)
    }

    async fn transition_message(
        &self,
        org_id: &OrgId,
        message_id: &ProcessedMessageId,
        next: MessageStatus,
    ) -> Result<ProcessedMessage> {
        let mut state = self.state.lock().unwrap();
        let message = state.messages.get_mut(message_id).filter(|m| &m.org_id == org_id).ok_or(BrokerError::NotFound)?;
        if !message.status.can_transition_to(next) {
            return Err(BrokerError::Fatal(format!(
                "illegal transition {:?} -> {:?} for message {message_id}",
                message.status, next
            )));
        }
        message.status = next;
        message.updated_at = Utc::now();
        Ok(message.clone())
    }

    async fn upsert_agent(
        &self,
        org_id: &OrgId,
        ws_connection_id: &str,
        ccagent_id: &str,
        repo_url: Option<&str>,
    ) -> Result<ActiveAgent> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.agents.values_mut().find(|a| a.ws_connection_id == ws_connection_id) {
            existing.last_active_at = Utc::now();
            existing.repo_url = repo_url.map(str::to_string);
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let agent = ActiveAgent {
            id: ActiveAgentId::generate(),
            org_id: org_id.clone(),
            ws_connection_id: ws_connection_id.to_string(),
            ccagent_id: ccagent_id.to_string(),
            repo_url: repo_url.map(str::to_string),
            last_active_at: now,
            created_at: now,
        };
        state.agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    async fn delete_agent_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>> {
        let mut state = self.state.lock().unwrap();
        let id = state.agents.values().find(|a| a.ws_connection_id == ws_connection_id).map(|a| a.id.clone());
        let removed = id.and_then(|id| state.agents.remove(&id));
        if let Some(agent) = &removed {
            state.assignments.retain(|_, a| a.agent_id != agent.id);
        }
        Ok(removed)
    }

    async fn delete_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let existed = state.agents.get(agent_id).filter(|a| &a.org_id == org_id).is_some();
        if existed {
            state.agents.remove(agent_id);
            state.assignments.retain(|_, a| &a.agent_id != agent_id);
        }
        Ok(existed)
    }

    async fn get_agent_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>> {
        Ok(self.state.lock().unwrap().agents.values().find(|a| a.ws_connection_id == ws_connection_id).cloned())
    }

    async fn get_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<ActiveAgent> {
        self.state.lock().unwrap().agents.get(agent_id).filter(|a| &a.org_id == org_id).cloned().ok_or(BrokerError::NotFound)
    }

    async fn touch_agent_heartbeat(&self, ws_connection_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(agent) = state.agents.values_mut().find(|a| a.ws_connection_id == ws_connection_id) {
            agent.last_active_at = Utc::now();
        }
        Ok(())
    }

    async fn list_agents_by_org(&self, org_id: &OrgId) -> Result<Vec<ActiveAgent>> {
        Ok(self.state.lock().unwrap().agents.values().filter(|a| &a.org_id == org_id).cloned().collect())
    }

    async fn list_inactive_agents(&self, org_id: &OrgId, threshold: DateTime<Utc>) -> Result<Vec<ActiveAgent>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .agents
            .values()
            .filter(|a| &a.org_id == org_id && a.last_active_at < threshold)
            .cloned()
            .collect())
    }

    async fn delete_agents_by_org(&self, org_id: &OrgId) -> Result<Vec<ActiveAgent>> {
        let mut state = self.state.lock().unwrap();
        let (removed, kept): (Vec<_>, Vec<_>) = state.agents.drain().map(|(_, v)| v).partition(|a| &a.org_id == org_id);
        state.agents = kept.into_iter().map(|a| (a.id.clone(), a)).collect();
        let removed_ids: std::collections::HashSet<_> = removed.iter().map(|a| a.id.clone()).collect();
        state.assignments.retain(|_, a| !removed_ids.contains(&a.agent_id));
        Ok(removed)
    }

    async fn assign(&self, org_id: &OrgId, agent_id: &ActiveAgentId, job_id: &JobId) -> Result<AgentJobAssignment> {
        let mut state = self.state.lock().unwrap();
        if state.assignments.values().any(|a| &a.job_id == job_id) {
            return Err(BrokerError::Conflict(format!("job {job_id} already has an assigned agent")));
        }
        let assignment = AgentJobAssignment {
            id: AssignmentId::generate(),
            org_id: org_id.clone(),
            agent_id: agent_id.clone(),
            job_id: job_id.clone(),
            created_at: Utc::now(),
        };
        state.assignments.insert(assignment.id.clone(), assignment.clone());
        Ok(assignment)
    }

    async fn unassign_by_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Option<AgentJobAssignment>> {
        let mut state = self.state.lock().unwrap();
        let id = state.assignments.values().find(|a| &a.org_id == org_id && &a.job_id == job_id).map(|a| a.id.clone());
        Ok(id.and_then(|id| state.assignments.remove(&id)))
    }

    async fn get_assignment_by_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Option<AgentJobAssignment>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .assignments
            .values()
            .find(|a| &a.org_id == org_id && &a.job_id == job_id)
            .cloned())
    }

    async fn count_assignments_for_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .assignments
            .values()
            .filter(|a| &a.org_id == org_id && &a.agent_id == agent_id)
            .count() as i64)
    }

    async fn list_assignments_by_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId) -> Result<Vec<AgentJobAssignment>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .assignments
            .values()
            .filter(|a| &a.org_id == org_id && &a.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn get_setting(&self, org_id: &OrgId, key: &str) -> Result<Option<SettingValue>> {
        Ok(self.state.lock().unwrap().settings.get(&(org_id.clone(), key.to_string())).cloned())
    }

    async fn upsert_setting(&self, org_id: &OrgId, key: &str, value: SettingValue) -> Result<()> {
        self.state.lock().unwrap().settings.insert((org_id.clone(), key.to_string()), value);
        Ok(())
    }
}
