//! Periodic Tasks (C7): the three fixed-interval sweeps that keep work
//! flowing without a chat event to trigger it — queued-job re-dispatch,
//! idle-job reaping, and the stale-agent sweep (spec §4.7).
//!
//! Each sweep's single pass is a plain async function independent of the
//! `tokio::time::interval` wrapper that drives it in `main.rs`, so
//! scenario tests can invoke one pass directly without waiting on real
//! wall-clock time — the same "separate the loop driver from the unit of
//! work" shape `gateway::write_loop` uses for its heartbeat ticker.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::commands::Settings;
use crate::db::Datastore;
use crate::dispatch::Scheduler;
use crate::error::{BrokerError, MultiError, Result};
use crate::gateway::protocol::GatewayMessage;
use crate::gateway::{LiveConnectionSet, ReclaimCause};
use crate::ids::OrgId;
use crate::jobstore::JobStore;
use crate::platform::PlatformRegistry;
use crate::prompts;
use crate::registry::AgentRegistry;

/// Shared dependencies for every sweep. Distinct from `dispatch::Scheduler`
/// even though it wraps one: the sweeps need direct `Datastore`/`registry`
/// access for the org- and agent-enumeration queries the scheduler's public
/// contract has no reason to expose. Job lookups/deletes still go through
/// `jobstore` (C4's named seam) rather than `db` directly, same as
/// `dispatch::Scheduler`.
#[derive(Clone)]
pub struct TaskContext {
    pub db: Arc<dyn Datastore>,
    pub jobstore: Arc<JobStore>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<AgentRegistry>,
    pub live: Arc<LiveConnectionSet>,
    pub platforms: Arc<PlatformRegistry>,
    pub settings: Arc<Settings>,
    pub default_idle_threshold_minutes: i64,
    pub default_inactive_threshold_minutes: i64,
}

/// Spawns the three sweeps as independent `tokio::spawn`ed loops, each
/// cancelled by `shutdown`. Returns their join handles so `main.rs` can
/// await a clean shutdown.
pub fn spawn_all(
    ctx: TaskContext,
    redispatch_interval: Duration,
    idle_reap_interval: Duration,
    stale_sweep_interval: Duration,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(run_loop(ctx.clone(), redispatch_interval, shutdown.clone(), |ctx| {
            Box::pin(async move {
                if let Err(err) = requeue::pass(&ctx).await {
                    tracing::warn!(%err, "queued-job re-dispatch pass had errors");
                }
            })
        })),
        tokio::spawn(run_loop(ctx.clone(), idle_reap_interval, shutdown.clone(), |ctx| {
            Box::pin(async move {
                if let Err(err) = idle_reaper::pass(&ctx).await {
                    tracing::warn!(%err, "idle-job reaper pass had errors");
                }
            })
        })),
        tokio::spawn(run_loop(ctx, stale_sweep_interval, shutdown, |ctx| {
            Box::pin(async move {
                if let Err(err) = stale_agent_sweep::pass(&ctx).await {
                    tracing::warn!(%err, "stale-agent sweep pass had errors");
                }
            })
        })),
    ]
}

type BoxedPass = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

async fn run_loop<F>(ctx: TaskContext, interval: Duration, shutdown: CancellationToken, pass: F)
where
    F: Fn(TaskContext) -> BoxedPass + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => pass(ctx.clone()).await,
        }
    }
}

fn into_multi(errors: Vec<BrokerError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(BrokerError::Transient(MultiError(errors).to_string()))
    }
}

pub mod requeue {
    use super::*;

    /// Every 15s (configurable): for each integration, list QUEUED
    /// messages, group by job, and attempt to assign each job's earliest
    /// queued message to a live agent via the scheduler's own contract
    /// method (never duplicates `pick_agent_for_job`'s logic here).
    pub async fn pass(ctx: &TaskContext) -> Result<()> {
        let mut errors = Vec::new();
        let org_ids = ctx.db.list_all_org_ids().await?;
        for org_id in org_ids {
            let integrations = match ctx.db.list_integrations(&org_id).await {
                Ok(v) => v,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            for integration in integrations {
                let queued = match ctx.db.list_queued_for_integration(&org_id, &integration.id).await {
                    Ok(v) => v,
                    Err(err) => {
                        errors.push(err);
                        continue;
                    }
                };
                let mut seen_jobs = std::collections::HashSet::new();
                for message in queued {
                    if !seen_jobs.insert(message.job_id.clone()) {
                        continue;
                    }
                    if let Err(err) = ctx.scheduler.try_assign_queued_job(&org_id, &message.job_id).await {
                        errors.push(err);
                    }
                }
            }
        }
        into_multi(errors)
    }
}

pub mod idle_reaper {
    use super::*;
    use crate::models::Job;

    /// Every 60s: for each org, close jobs whose `updated_at` is older than
    /// the (per-org-overridable) idle threshold. A still-assigned agent is
    /// told to stop via `job_unassigned` before the job row is deleted —
    /// unlike `Scheduler::reclaim_job`, which never notifies because its
    /// agent is the one going away.
    pub async fn pass(ctx: &TaskContext) -> Result<()> {
        let mut errors = Vec::new();
        let org_ids = ctx.db.list_all_org_ids().await?;
        for org_id in org_ids {
            let minutes = ctx.settings.idle_threshold_minutes(&org_id, ctx.default_idle_threshold_minutes).await;
            let idle_jobs = match ctx.jobstore.get_idle_jobs(&org_id, minutes).await {
                Ok(v) => v,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            for job in &idle_jobs {
                if let Err(err) = close_idle_job(ctx, &org_id, job, minutes).await {
                    errors.push(err);
                }
            }
        }
        into_multi(errors)
    }

    async fn close_idle_job(ctx: &TaskContext, org_id: &OrgId, job: &Job, minutes: i64) -> Result<()> {
        if let Some(assignment) = ctx.db.get_assignment_by_job(org_id, &job.id).await? {
            if let Ok(agent) = ctx.db.get_agent(org_id, &assignment.agent_id).await {
                let _ = ctx.live.send(&agent.ws_connection_id, GatewayMessage::JobUnassigned { job_id: job.id.clone() });
            }
            ctx.db.unassign_by_job(org_id, &job.id).await?;
        }
        if let Some(platform) = ctx.platforms.get(&job.integration_id) {
            let _ = platform.post_message(&job.channel_key, Some(&job.thread_key), &prompts::idle_closed(minutes)).await;
        }
        ctx.jobstore.delete(org_id, &job.id).await?;
        Ok(())
    }
}

pub mod stale_agent_sweep {
    use super::*;

    /// Every 30s: delete any `ActiveAgent` whose connection id is no longer
    /// live, or whose `last_active_at` exceeds the inactive threshold.
    /// Cascading reclaim runs through the same `Scheduler::reclaim_agent`
    /// path a disconnect would take, so the job gets the same disconnect
    /// notice and is freed up for the next re-dispatch pass.
    pub async fn pass(ctx: &TaskContext) -> Result<()> {
        let mut errors = Vec::new();
        let org_ids = ctx.db.list_all_org_ids().await?;
        for org_id in org_ids {
            let connected = match ctx.registry.list_connected(&org_id, ctx.live.as_ref()).await {
                Ok(v) => v,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            let live_ids: std::collections::HashSet<_> = connected.iter().map(|a| a.id.clone()).collect();

            let all_agents = match ctx.db.list_agents_by_org(&org_id).await {
                Ok(v) => v,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            for agent in &all_agents {
                if live_ids.contains(&agent.id) {
                    continue;
                }
                if let Err(err) = ctx.scheduler.reclaim_agent(&org_id, &agent.id, ReclaimCause::StaleSweep).await {
                    errors.push(err);
                    continue;
                }
                if let Err(err) = ctx.db.delete_agent(&org_id, &agent.id).await {
                    errors.push(err);
                }
            }

            let inactive = match ctx.registry.list_inactive(&org_id, ctx.default_inactive_threshold_minutes).await {
                Ok(v) => v,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            for agent in inactive {
                if let Err(err) = ctx.scheduler.reclaim_agent(&org_id, &agent.id, ReclaimCause::StaleSweep).await {
                    errors.push(err);
                    continue;
                }
                let _ = ctx.live.close(&agent.ws_connection_id);
                if let Err(err) = ctx.db.delete_agent(&org_id, &agent.id).await {
                    errors.push(err);
                }
            }
        }
        into_multi(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewJob, NewMessage};
    use crate::models::{ChatPlatformKind, MessageStatus};
    use crate::testutil::FakeDatastore;
    use async_trait::async_trait;

    #[derive(Default)]
    struct NoopPlatform;

    #[async_trait]
    impl crate::platform::ChatPlatform for NoopPlatform {
        async fn post_message(&self, _channel: &str, _thread: Option<&str>, _text: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn set_reaction(&self, _channel: &str, _message_id: &str, _emoji: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn clear_reaction(&self, _channel: &str, _message_id: &str, _emoji: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    async fn make_ctx() -> (TaskContext, Arc<FakeDatastore>, OrgId, crate::ids::IntegrationId) {
        let db = Arc::new(FakeDatastore::new());
        let org = db.seed_org().await;
        let integration = db.seed_integration(&org, ChatPlatformKind::Slack).await;
        let registry = Arc::new(AgentRegistry::new(db.clone()));
        let live = Arc::new(LiveConnectionSet::new());
        let platforms = Arc::new(PlatformRegistry::new());
        platforms.insert(integration.clone(), Arc::new(NoopPlatform));
        let scheduler = Arc::new(Scheduler::new(db.clone(), registry.clone(), live.clone(), platforms.clone(), "pepper".into()));
        let settings = Arc::new(Settings::new(db.clone()));
        let ctx = TaskContext {
            db: db.clone(),
            jobstore: Arc::new(JobStore::new(db.clone())),
            scheduler,
            registry,
            live,
            platforms,
            settings,
            default_idle_threshold_minutes: 60,
            default_inactive_threshold_minutes: 2,
        };
        (ctx, db, org, integration)
    }

    #[tokio::test]
    async fn requeue_pass_promotes_queued_message_once_an_agent_is_live() {
        let (ctx, db, org, integration) = make_ctx().await;
        let (job, _) = db
            .get_or_create_job(NewJob {
                org_id: org.clone(),
                integration_id: integration.clone(),
                platform: ChatPlatformKind::Slack,
                channel_key: "C1".into(),
                thread_key: "T1".into(),
                originating_user: "U1".into(),
            })
            .await
            .unwrap();
        let message = db
            .create_message(NewMessage {
                job_id: job.id.clone(),
                org_id: org.clone(),
                integration_id: integration.clone(),
                channel_key: "C1".into(),
                message_id: "T1".into(),
                text: "hi".into(),
                agent_available: false,
            })
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Queued);

        ctx.live.register_for_test("ws-1".into());
        ctx.registry.upsert(&org, "ws-1", "agent-a", None).await.unwrap();

        requeue::pass(&ctx).await.unwrap();
        let promoted = db.get_message(&org, &message.id).await.unwrap();
        assert_eq!(promoted.status, MessageStatus::InProgress);
    }

    #[tokio::test]
    async fn stale_sweep_removes_agents_not_in_live_set() {
        let (ctx, db, org, _integration) = make_ctx().await;
        ctx.registry.upsert(&org, "ws-dead", "agent-z", None).await.unwrap();
        // Never registered as live.
        stale_agent_sweep::pass(&ctx).await.unwrap();
        let remaining = db.list_agents_by_org(&org).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn idle_reaper_deletes_job_and_unassigns_live_agent() {
        let (ctx, db, org, integration) = make_ctx().await;
        let (job, _) = db
            .get_or_create_job(NewJob {
                org_id: org.clone(),
                integration_id: integration.clone(),
                platform: ChatPlatformKind::Slack,
                channel_key: "C1".into(),
                thread_key: "T1".into(),
                originating_user: "U1".into(),
            })
            .await
            .unwrap();
        ctx.live.register_for_test("ws-1".into());
        let agent = ctx.registry.upsert(&org, "ws-1", "agent-a", None).await.unwrap();
        db.assign(&org, &agent.id, &job.id).await.unwrap();

        let mut reaped_ctx = ctx.clone();
        reaped_ctx.default_idle_threshold_minutes = -1;
        idle_reaper::pass(&reaped_ctx).await.unwrap();
        let err = db.get_job(&org, &job.id).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound));
    }

    #[test]
    fn job_unassigned_frame_serializes_expected_tag() {
        let env = crate::gateway::protocol::Envelope::new(GatewayMessage::JobUnassigned {
            job_id: crate::ids::JobId::generate(),
        });
        let json = serde_json::to_value(env).unwrap();
        assert_eq!(json["type"], "job_unassigned");
    }
}
