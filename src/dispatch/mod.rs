//! Dispatch/Scheduler (C1): the core of the broker. Decides which agent
//! receives a piece of work, and when.
//!
//! `Scheduler` bundles the dependencies every dispatch-path call needs —
//! the datastore, the agent registry (C3), the gateway's live-connection
//! set (C5, used both to check liveness and to enqueue outbound frames),
//! and the per-integration chat-platform clients (C6) — generalizing the
//! teacher's `AgentDeps`/`ChannelState.deps` pattern
//! (`andrasbacsai-spacebot/src/agent/channel.rs`) of carrying one
//! dependency bundle by value into long-lived process state, rather than
//! threading five separate `Arc`s through every call site.

use std::sync::Arc;

use crate::auth::hash_secret_key;
use crate::db::{Datastore, NewJob, NewMessage};
use crate::error::{BrokerError, Result};
use crate::gateway::protocol::GatewayMessage;
use crate::gateway::{LiveConnectionSet, ReclaimCause};
use crate::ids::{ActiveAgentId, JobId, OrgId, ProcessedMessageId};
use crate::jobstore::JobStore;
use crate::lifecycle::{self, ReactionTarget};
use crate::models::{ActiveAgent, Job, MessageStatus, ProcessedMessage};
use crate::platform::event::ChatEvent;
use crate::platform::PlatformRegistry;
use crate::prompts;
use crate::registry::AgentRegistry;
use crate::util::retry::retry_with_backoff;

/// Outcome of [`Scheduler::dispatch_incoming_message`].
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Dispatched { job: Job, message: ProcessedMessage },
    /// A thread reply targeted a job that does not exist. The refusal text
    /// has already been posted to the originating channel.
    Refused { reason: &'static str },
}

pub struct Scheduler {
    db: Arc<dyn Datastore>,
    jobstore: Arc<JobStore>,
    registry: Arc<AgentRegistry>,
    live: Arc<LiveConnectionSet>,
    platforms: Arc<PlatformRegistry>,
    secret_pepper: String,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Datastore>,
        registry: Arc<AgentRegistry>,
        live: Arc<LiveConnectionSet>,
        platforms: Arc<PlatformRegistry>,
        secret_pepper: String,
    ) -> Self {
        let jobstore = Arc::new(JobStore::new(db.clone()));
        Self { db, jobstore, registry, live, platforms, secret_pepper }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Resolves a presented `ccagent_secret_key` to an organization, hashing
    /// it with the instance pepper before lookup (§4.5's auth step).
    pub async fn authenticate_agent(&self, secret_key: &str) -> Result<OrgId> {
        let hash = hash_secret_key(secret_key, &self.secret_pepper);
        let org = self.db.resolve_org_by_secret_hash(&hash).await.map_err(|err| match err {
            BrokerError::NotFound => BrokerError::Unauthorized,
            other => other,
        })?;
        Ok(org.id)
    }

    // -- Public contract (spec §4.1) -------------------------------------

    /// Routes a chat event targeting the broker (mention or thread reply)
    /// to an agent, enqueues it, or refuses it with a user-visible message.
    pub async fn dispatch_incoming_message(&self, event: &ChatEvent) -> Result<DispatchOutcome> {
        if !event.is_top_level() {
            let existing = self.jobstore.find_by_thread(&event.org_id, &event.integration_id, &event.thread_key).await?;
            if existing.is_none() {
                self.post_to_channel(event, prompts::NEW_JOB_REQUIRES_TOP_LEVEL).await;
                return Ok(DispatchOutcome::Refused { reason: prompts::NEW_JOB_REQUIRES_TOP_LEVEL });
            }
        }

        let new_job = NewJob {
            org_id: event.org_id.clone(),
            integration_id: event.integration_id.clone(),
            platform: event.platform,
            channel_key: event.channel_key.clone(),
            thread_key: event.thread_key.clone(),
            originating_user: event.user.clone(),
        };
        let (job, _created) = retry_with_backoff(3, || self.jobstore.get_or_create(new_job.clone())).await?;

        let pick = self.pick_agent_for_job(&job.org_id, &job.id).await?;
        let new_message = NewMessage {
            job_id: job.id.clone(),
            org_id: job.org_id.clone(),
            integration_id: job.integration_id.clone(),
            channel_key: event.channel_key.clone(),
            message_id: event.message_id.clone(),
            text: event.text.clone(),
            agent_available: pick.is_some(),
        };
        let message = retry_with_backoff(3, || self.db.create_message(new_message.clone())).await?;
        self.jobstore.touch(&job.org_id, &job.id).await?;
        self.apply_reaction_for(&job, &message).await;

        if message.status == MessageStatus::InProgress {
            if let Some((agent, reused)) = pick {
                self.commit_assignment_and_send(&job, &message, &agent, reused).await?;
            }
        }

        Ok(DispatchOutcome::Dispatched { job, message })
    }

    /// Attempts to move the earliest queued message of `job_id` to
    /// `InProgress` by picking a least-loaded live agent. Returns the
    /// assigned agent's `ws_connection_id` and whether anything happened.
    pub async fn try_assign_queued_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<(Option<String>, bool)> {
        let mut queued = self.db.list_queued_for_job(org_id, job_id).await?;
        if queued.is_empty() {
            return Ok((None, false));
        }
        let Some((agent, reused)) = self.pick_agent_for_job(org_id, job_id).await? else {
            return Ok((None, false));
        };
        queued.sort_by_key(|m| m.created_at);
        let earliest = queued.remove(0);

        let message = retry_with_backoff(3, || {
            self.db.transition_message(org_id, &earliest.id, MessageStatus::InProgress)
        })
        .await?;
        let job = self.db.get_job(org_id, job_id).await?;
        self.commit_assignment_and_send(&job, &message, &agent, reused).await?;
        self.apply_reaction_for(&job, &message).await;
        Ok((Some(agent.ws_connection_id), true))
    }

    /// Guard used by agent-originated callbacks: confirms `ws_connection_id`
    /// is currently assigned to `job_id`, in the org it claims. Cross-org or
    /// cross-job traffic is rejected as not-found so existence never leaks.
    pub async fn validate_assignment(&self, ws_connection_id: &str, job_id: &JobId) -> Result<ActiveAgent> {
        let agent = self.registry.get_by_ws(ws_connection_id).await?.ok_or(BrokerError::NotFound)?;
        let assignment = self.db.get_assignment_by_job(&agent.org_id, job_id).await?;
        match assignment {
            Some(a) if a.agent_id == agent.id => Ok(agent),
            _ => Err(BrokerError::cross_org()),
        }
    }

    /// Called when an agent disconnects, identified by its socket. Looks up
    /// the registry row (already deleted by the gateway's disconnect path)
    /// and reclaims every job it held.
    pub async fn reclaim_agent_by_ws(&self, ws_connection_id: &str, cause: ReclaimCause) -> Result<()> {
        let Some(agent) = self.registry.delete_by_ws(ws_connection_id).await? else {
            return Ok(());
        };
        self.reclaim_agent(&agent.org_id, &agent.id, cause).await
    }

    /// Unassigns every job held by `agent_id` and, for a disconnect/stale
    /// reclaim (as opposed to manual rotation, which the caller has already
    /// notified), posts the disconnect notice and marks the job for
    /// re-dispatch by the next queued-job sweep. Per spec §4.1/§4.7, a
    /// disconnected agent's jobs are abandoned, not requeued atomically
    /// here — the requeue sweep picks the now-unassigned QUEUED messages
    /// back up on its own cadence.
    pub async fn reclaim_agent(&self, org_id: &OrgId, agent_id: &ActiveAgentId, cause: ReclaimCause) -> Result<()> {
        let assignments = self.db.list_assignments_by_agent(org_id, agent_id).await?;
        let mut errors = Vec::new();
        for assignment in assignments {
            if let Err(err) = self.reclaim_job(org_id, &assignment.job_id, cause).await {
                errors.push(err);
            }
        }
        if let Some(first) = errors.into_iter().next() {
            return Err(first);
        }
        Ok(())
    }

    async fn reclaim_job(&self, org_id: &OrgId, job_id: &JobId, cause: ReclaimCause) -> Result<()> {
        // The agent that held this job is the one being reclaimed (its
        // socket is already gone or going), so there is no live peer to
        // notify with a `job_unassigned` frame here — unlike the idle
        // reaper (C7), which unassigns a still-connected agent and must
        // tell it to stop. We just clear the assignment row.
        self.db.unassign_by_job(org_id, job_id).await?;
        if matches!(cause, ReclaimCause::Disconnected | ReclaimCause::StaleSweep) {
            if let Ok(job) = self.db.get_job(org_id, job_id).await {
                self.apply_root_reaction(&job, ReactionTarget::X).await;
                self.post_system_message(&job, prompts::AGENT_DISCONNECTED).await;
            }
        }
        Ok(())
    }

    // -- Agent-originated callbacks (spec §6.1) ---------------------------

    pub async fn on_processing_message(&self, ws_connection_id: &str, message_id: &ProcessedMessageId) -> Result<()> {
        let agent = self.registry.get_by_ws(ws_connection_id).await?.ok_or(BrokerError::NotFound)?;
        let message = match self.db.get_message(&agent.org_id, message_id).await {
            Ok(m) => m,
            Err(BrokerError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.validate_assignment(ws_connection_id, &message.job_id).await?;
        let job = self.db.get_job(&agent.org_id, &message.job_id).await?;
        self.apply_reaction_for(&job, &message).await;
        Ok(())
    }

    pub async fn on_assistant_message(
        &self,
        ws_connection_id: &str,
        job_id: &JobId,
        message_id: &ProcessedMessageId,
        text: &str,
    ) -> Result<()> {
        let agent = self.validate_assignment(ws_connection_id, job_id).await?;
        let job = match self.db.get_job(&agent.org_id, job_id).await {
            Ok(job) => job,
            Err(BrokerError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        let message = retry_with_backoff(3, || {
            self.db.transition_message(&agent.org_id, message_id, MessageStatus::Completed)
        })
        .await?;
        self.jobstore.touch(&agent.org_id, job_id).await?;
        self.apply_reaction_for(&job, &message).await;
        self.post_system_message(&job, text).await;

        let remaining = self.db.list_queued_for_job(&agent.org_id, job_id).await?;
        if remaining.is_empty() {
            self.apply_root_reaction(&job, ReactionTarget::Hand).await;
        } else {
            self.try_assign_queued_job(&agent.org_id, job_id).await?;
        }
        Ok(())
    }

    pub async fn on_system_message(&self, ws_connection_id: &str, job_id: &JobId, text: &str) -> Result<()> {
        let agent = self.validate_assignment(ws_connection_id, job_id).await?;
        let job = match self.db.get_job(&agent.org_id, job_id).await {
            Ok(job) => job,
            Err(BrokerError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        if is_known_error_pattern(text) {
            self.apply_root_reaction(&job, ReactionTarget::X).await;
            self.post_system_message(&job, &prompts::job_failed(text)).await;
            self.db.unassign_by_job(&agent.org_id, job_id).await?;
            self.jobstore.delete(&agent.org_id, job_id).await?;
        } else {
            self.post_system_message(&job, text).await;
        }
        Ok(())
    }

    pub async fn on_job_complete(&self, ws_connection_id: &str, job_id: &JobId, reason: &str) -> Result<()> {
        let agent = self.validate_assignment(ws_connection_id, job_id).await?;
        let job = match self.db.get_job(&agent.org_id, job_id).await {
            Ok(job) => job,
            Err(BrokerError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        self.post_system_message(&job, reason).await;
        self.apply_root_reaction(&job, ReactionTarget::WhiteCheckMark).await;
        self.jobstore.delete(&agent.org_id, job_id).await?;
        Ok(())
    }

    /// Invoked when a platform adapter reports a reaction-add event for a
    /// job's thread root with a completion emoji (spec §8 seed test 5).
    /// The human has already placed the checkmark, so this only notifies a
    /// live assignee, posts the completion notice, and deletes the job —
    /// it never re-applies the reaction itself. Returns `Ok(false)` if no
    /// job matches the thread (already completed, or never existed).
    pub async fn complete_job_manually(
        &self,
        org_id: &OrgId,
        integration_id: &crate::ids::IntegrationId,
        thread_key: &str,
    ) -> Result<bool> {
        let Some(job) = self.jobstore.find_by_thread(org_id, integration_id, thread_key).await? else {
            return Ok(false);
        };
        if let Some(assignment) = self.db.get_assignment_by_job(org_id, &job.id).await? {
            if let Ok(agent) = self.db.get_agent(org_id, &assignment.agent_id).await {
                let _ = self.live.send(&agent.ws_connection_id, GatewayMessage::JobUnassigned { job_id: job.id.clone() });
            }
            self.db.unassign_by_job(org_id, &job.id).await?;
        }
        self.post_system_message(&job, prompts::MANUALLY_COMPLETED).await;
        self.jobstore.delete(org_id, &job.id).await?;
        Ok(true)
    }

    /// Invoked by the dashboard's secret-key rotation endpoint. Deletes
    /// every agent row for the org and closes their sockets before the
    /// caller reports success, per the rotation scenario (spec §8 seed
    /// test 6).
    pub async fn rotate_secret_key_and_disconnect(&self, org_id: &OrgId, new_hash: &str) -> Result<()> {
        self.db.rotate_secret_key(org_id, new_hash).await?;
        let agents = self.registry.disconnect_all_by_org(org_id).await?;
        for agent in agents {
            let _ = self.live.close(&agent.ws_connection_id);
        }
        Ok(())
    }

    /// Best-effort snapshot for the `/cc status` command (§10 supplemented
    /// feature): live agent count for the org, its queued-message count for
    /// `integration_id`, and an approximate in-progress count. The latter
    /// is the org's total live-agent assignment count rather than a direct
    /// message query, since each assignment backs at most one `InProgress`
    /// message (spec §4.4's invariant) — close enough for a status line,
    /// not relied on for any correctness check.
    pub async fn status_summary(&self, org_id: &OrgId, integration_id: &crate::ids::IntegrationId) -> Result<(usize, usize, usize)> {
        let connected = self.registry.list_connected(org_id, self.live.as_ref()).await?;
        let mut in_progress = 0i64;
        for agent in &connected {
            in_progress += self.db.count_assignments_for_agent(org_id, &agent.id).await?;
        }
        let queued = self.db.list_queued_for_integration(org_id, integration_id).await?.len();
        Ok((connected.len(), in_progress as usize, queued))
    }

    // -- Internal helpers ---------------------------------------------------

    /// Picks the agent that should receive work for `job_id`, per the
    /// tie-break in spec §4.1: reuse the existing live assignment if any;
    /// otherwise the least-loaded live agent in the org, ties broken by the
    /// lexicographically smallest agent id. Returns `(agent, reused)` where
    /// `reused` is true iff an assignment row already existed.
    async fn pick_agent_for_job(&self, org_id: &OrgId, job_id: &JobId) -> Result<Option<(ActiveAgent, bool)>> {
        if let Some(assignment) = self.db.get_assignment_by_job(org_id, job_id).await? {
            let agent = self.db.get_agent(org_id, &assignment.agent_id).await?;
            if self.live.is_live(&agent.ws_connection_id) {
                return Ok(Some((agent, true)));
            }
            // The assigned agent is no longer live but the row survived
            // (disconnect reclaim should have cleared it already); self-heal
            // so a stale assignment never blocks reassignment.
            self.db.unassign_by_job(org_id, job_id).await?;
        }

        let connected = self.registry.list_connected(org_id, self.live.as_ref()).await?;
        if connected.is_empty() {
            return Ok(None);
        }
        let mut candidates = Vec::with_capacity(connected.len());
        for agent in connected {
            let load = self.db.count_assignments_for_agent(org_id, &agent.id).await?;
            candidates.push((agent, load));
        }
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.id.as_str().cmp(b.0.id.as_str())));
        Ok(candidates.into_iter().next().map(|(agent, _)| (agent, false)))
    }

    /// Inserts the assignment (if new) and enqueues the work frame, in that
    /// order — the outbound send only happens after the assignment write
    /// lands, matching §4.5/§9's "never send before commit" rule.
    async fn commit_assignment_and_send(
        &self,
        job: &Job,
        message: &ProcessedMessage,
        agent: &ActiveAgent,
        reused: bool,
    ) -> Result<()> {
        if !reused {
            retry_with_backoff(3, || self.db.assign(&job.org_id, &agent.id, &job.id)).await?;
        }
        let frame = if reused {
            GatewayMessage::UserMessage {
                message: message.text.clone(),
                processed_message_id: message.id.clone(),
                link: None,
                job_id: job.id.clone(),
            }
        } else {
            GatewayMessage::StartConversation {
                message: message.text.clone(),
                processed_message_id: message.id.clone(),
                link: None,
                job_id: job.id.clone(),
            }
        };
        if let Err(err) = self.live.send(&agent.ws_connection_id, frame) {
            tracing::warn!(%err, agent_id = %agent.id, job_id = %job.id, "failed to enqueue work frame for agent");
        }
        Ok(())
    }

    async fn apply_reaction_for(&self, job: &Job, message: &ProcessedMessage) {
        if job.is_thread_root(&message.message_id) {
            return;
        }
        let Some(platform) = self.platforms.get(&job.integration_id) else {
            return;
        };
        let target = ReactionTarget::for_status(message.status);
        lifecycle::apply_reaction(platform.as_ref(), &job.channel_key, &message.message_id, target).await;
    }

    async fn apply_root_reaction(&self, job: &Job, target: ReactionTarget) {
        let Some(platform) = self.platforms.get(&job.integration_id) else {
            return;
        };
        lifecycle::apply_reaction(platform.as_ref(), &job.channel_key, &job.thread_key, target).await;
    }

    async fn post_system_message(&self, job: &Job, text: &str) {
        let Some(platform) = self.platforms.get(&job.integration_id) else {
            return;
        };
        if let Err(err) = platform.post_message(&job.channel_key, Some(&job.thread_key), text).await {
            tracing::warn!(%err, job_id = %job.id, "failed to post message to thread");
        }
    }

    async fn post_to_channel(&self, event: &ChatEvent, text: &str) {
        let Some(platform) = self.platforms.get(&event.integration_id) else {
            return;
        };
        if let Err(err) = platform.post_message(&event.channel_key, Some(&event.thread_key), text).await {
            tracing::warn!(%err, integration_id = %event.integration_id, "failed to post refusal message");
        }
    }
}

/// Heuristic match for an agent-reported system message that represents a
/// failure rather than an informational note (spec §7's failure-semantics
/// table). Intentionally conservative: only unambiguous failure markers
/// trigger job teardown, since a false positive here destroys a job the
/// agent may still finish.
fn is_known_error_pattern(text: &str) -> bool {
    let lower = text.to_lowercase();
    const MARKERS: &[&str] = &["fatal:", "panic:", "unrecoverable error", "agent crashed"];
    MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatPlatformKind;
    use crate::testutil::FakeDatastore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingPlatform {
        posted: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl crate::platform::ChatPlatform for RecordingPlatform {
        async fn post_message(&self, channel: &str, _thread: Option<&str>, text: &str) -> Result<()> {
            self.posted.lock().unwrap().push((channel.to_string(), text.to_string()));
            Ok(())
        }
        async fn set_reaction(&self, _channel: &str, _message_id: &str, _emoji: &str) -> Result<()> {
            Ok(())
        }
        async fn clear_reaction(&self, _channel: &str, _message_id: &str, _emoji: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn make_scheduler(db: Arc<FakeDatastore>) -> (Scheduler, Arc<LiveConnectionSet>, Arc<PlatformRegistry>) {
        let registry = Arc::new(AgentRegistry::new(db.clone()));
        let live = Arc::new(LiveConnectionSet::new());
        let platforms = Arc::new(PlatformRegistry::new());
        let scheduler = Scheduler::new(db, registry, live.clone(), platforms.clone(), "pepper".into());
        (scheduler, live, platforms)
    }

    fn event(org: OrgId, integration: crate::ids::IntegrationId, thread: &str, message_id: &str, text: &str) -> ChatEvent {
        ChatEvent {
            org_id: org,
            integration_id: integration,
            platform: ChatPlatformKind::Slack,
            channel_key: "C1".into(),
            thread_key: thread.into(),
            message_id: message_id.into(),
            user: "U1".into(),
            text: text.into(),
            is_reaction: false,
            reaction_emoji: None,
        }
    }

    #[tokio::test]
    async fn happy_path_assigns_live_agent_and_completes() {
        let db = Arc::new(FakeDatastore::new());
        let org = db.seed_org().await;
        let integration = db.seed_integration(&org, ChatPlatformKind::Slack).await;
        let (scheduler, live, platforms) = make_scheduler(db.clone()).await;
        platforms.insert(integration.clone(), Arc::new(RecordingPlatform::default()));

        let (_tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        live.register_for_test("ws-1".into());
        scheduler.registry().upsert(&org, "ws-1", "agent-a", None).await.unwrap();

        let outcome = scheduler
            .dispatch_incoming_message(&event(org.clone(), integration.clone(), "T1", "T1", "hi"))
            .await
            .unwrap();
        let (job, message) = match outcome {
            DispatchOutcome::Dispatched { job, message } => (job, message),
            other => panic!("expected dispatched, got {other:?}"),
        };
        assert_eq!(message.status, MessageStatus::InProgress);

        scheduler.on_assistant_message("ws-1", &job.id, &message.id, "hello").await.unwrap();
        let completed = db.get_message(&org, &message.id).await.unwrap();
        assert_eq!(completed.status, MessageStatus::Completed);
    }

    #[tokio::test]
    async fn thread_reply_without_job_is_refused() {
        let db = Arc::new(FakeDatastore::new());
        let org = db.seed_org().await;
        let integration = db.seed_integration(&org, ChatPlatformKind::Slack).await;
        let (scheduler, _live, platforms) = make_scheduler(db).await;
        platforms.insert(integration.clone(), Arc::new(RecordingPlatform::default()));

        let mut reply = event(org, integration, "T1", "T2", "continuing");
        reply.thread_key = "T1".into();
        reply.message_id = "T2".into();
        let outcome = scheduler.dispatch_incoming_message(&reply).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Refused { .. }));
    }

    #[tokio::test]
    async fn no_live_agents_queues_message() {
        let db = Arc::new(FakeDatastore::new());
        let org = db.seed_org().await;
        let integration = db.seed_integration(&org, ChatPlatformKind::Slack).await;
        let (scheduler, _live, platforms) = make_scheduler(db).await;
        platforms.insert(integration.clone(), Arc::new(RecordingPlatform::default()));

        let outcome = scheduler.dispatch_incoming_message(&event(org, integration, "T1", "T1", "hi")).await.unwrap();
        match outcome {
            DispatchOutcome::Dispatched { message, .. } => assert_eq!(message.status, MessageStatus::Queued),
            other => panic!("expected dispatched/queued, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_message_while_in_progress_is_queued_then_promoted() {
        let db = Arc::new(FakeDatastore::new());
        let org = db.seed_org().await;
        let integration = db.seed_integration(&org, ChatPlatformKind::Slack).await;
        let (scheduler, live, platforms) = make_scheduler(db.clone()).await;
        platforms.insert(integration.clone(), Arc::new(RecordingPlatform::default()));
        live.register_for_test("ws-1".into());
        scheduler.registry().upsert(&org, "ws-1", "agent-a", None).await.unwrap();

        let first = scheduler.dispatch_incoming_message(&event(org.clone(), integration.clone(), "T1", "T1", "hi")).await.unwrap();
        let (job, m1) = match first {
            DispatchOutcome::Dispatched { job, message } => (job, message),
            other => panic!("{other:?}"),
        };
        assert_eq!(m1.status, MessageStatus::InProgress);

        let mut second = event(org.clone(), integration, "T1", "T3", "again");
        second.thread_key = "T1".into();
        let outcome2 = scheduler.dispatch_incoming_message(&second).await.unwrap();
        let m2 = match outcome2 {
            DispatchOutcome::Dispatched { message, .. } => message,
            other => panic!("{other:?}"),
        };
        assert_eq!(m2.status, MessageStatus::Queued);

        scheduler.on_assistant_message("ws-1", &job.id, &m1.id, "done with first").await.unwrap();
        let promoted = db.get_message(&org, &m2.id).await.unwrap();
        assert_eq!(promoted.status, MessageStatus::InProgress);
    }

    #[tokio::test]
    async fn assignment_tie_break_prefers_lowest_load_then_lexicographic_id() {
        let db = Arc::new(FakeDatastore::new());
        let org = db.seed_org().await;
        let integration = db.seed_integration(&org, ChatPlatformKind::Slack).await;
        let (scheduler, live, platforms) = make_scheduler(db.clone()).await;
        platforms.insert(integration.clone(), Arc::new(RecordingPlatform::default()));

        live.register_for_test("ws-a".into());
        live.register_for_test("ws-b".into());
        scheduler.registry().upsert(&org, "ws-a", "agent-a", None).await.unwrap();
        scheduler.registry().upsert(&org, "ws-b", "agent-b", None).await.unwrap();

        let outcome = scheduler.dispatch_incoming_message(&event(org, integration, "T1", "T1", "hi")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
    }
}
