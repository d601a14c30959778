//! Agent Registry (C3): canonical truth about which agents are currently
//! usable.
//!
//! "Live" is never stored: it is computed by intersecting the persisted
//! `active_agents` rows against the gateway's in-memory live-connection set
//! (spec §3/§9 — no object graph duplicated in memory). This module owns
//! that intersection plus the registry operations named in spec §4.3; the
//! connection set itself is owned by [`crate::gateway`] and handed in by
//! reference so the registry never has to reach into gateway internals.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::db::Datastore;
use crate::error::Result;
use crate::ids::OrgId;
use crate::models::ActiveAgent;

/// Read-only view of the gateway's live-connection ids, passed by the
/// gateway into registry calls that need liveness. A plain trait (rather
/// than a concrete `DashMap` reference) keeps the registry testable without
/// spinning up real sockets.
pub trait LiveConnections: Send + Sync {
    fn is_live(&self, ws_connection_id: &str) -> bool;
    fn snapshot_ids(&self) -> HashSet<String>;
}

pub struct AgentRegistry {
    db: Arc<dyn Datastore>,
}

impl AgentRegistry {
    pub fn new(db: Arc<dyn Datastore>) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        org_id: &OrgId,
        ws_connection_id: &str,
        ccagent_id: &str,
        repo_url: Option<&str>,
    ) -> Result<ActiveAgent> {
        self.db.upsert_agent(org_id, ws_connection_id, ccagent_id, repo_url).await
    }

    pub async fn delete_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>> {
        self.db.delete_agent_by_ws(ws_connection_id).await
    }

    pub async fn get_by_ws(&self, ws_connection_id: &str) -> Result<Option<ActiveAgent>> {
        self.db.get_agent_by_ws(ws_connection_id).await
    }

    pub async fn heartbeat_touch(&self, ws_connection_id: &str) -> Result<()> {
        self.db.touch_agent_heartbeat(ws_connection_id).await
    }

    pub async fn get_assignments(&self, org_id: &OrgId, agent_id: &crate::ids::ActiveAgentId) -> Result<i64> {
        self.db.count_assignments_for_agent(org_id, agent_id).await
    }

    /// Agents belonging to `org_id` whose `ws_connection_id` is currently
    /// live, per [`LiveConnections`].
    pub async fn list_connected(&self, org_id: &OrgId, live: &dyn LiveConnections) -> Result<Vec<ActiveAgent>> {
        let all = self.db.list_agents_by_org(org_id).await?;
        Ok(all.into_iter().filter(|a| live.is_live(&a.ws_connection_id)).collect())
    }

    /// Agents whose `last_active_at` is older than `threshold_minutes`.
    /// Liveness (connection-set membership) is checked separately by the
    /// stale-agent sweep, which also has the live set on hand.
    pub async fn list_inactive(&self, org_id: &OrgId, threshold_minutes: i64) -> Result<Vec<ActiveAgent>> {
        let cutoff = Utc::now() - chrono::Duration::minutes(threshold_minutes.max(0));
        self.db.list_inactive_agents(org_id, cutoff).await
    }

    /// Deletes every agent row for the org. Callers (the rotation endpoint)
    /// are responsible for also closing the corresponding gateway sockets;
    /// the registry only owns the persisted rows.
    pub async fn disconnect_all_by_org(&self, org_id: &OrgId) -> Result<Vec<ActiveAgent>> {
        self.db.delete_agents_by_org(org_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDatastore;

    struct FixedLive(HashSet<String>);
    impl LiveConnections for FixedLive {
        fn is_live(&self, id: &str) -> bool {
            self.0.contains(id)
        }
        fn snapshot_ids(&self) -> HashSet<String> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn list_connected_filters_by_liveness() {
        let db = Arc::new(FakeDatastore::new());
        let org = db.seed_org().await;
        let registry = AgentRegistry::new(db.clone());
        registry.upsert(&org, "ws-1", "agent-a", None).await.unwrap();
        registry.upsert(&org, "ws-2", "agent-b", None).await.unwrap();

        let live = FixedLive(HashSet::from(["ws-1".to_string()]));
        let connected = registry.list_connected(&org, &live).await.unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].ws_connection_id, "ws-1");
    }
}
