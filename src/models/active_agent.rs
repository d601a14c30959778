use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActiveAgentId, OrgId};

/// A registered agent bound to a live WebSocket connection.
///
/// "Live" is not a field on this struct: it is computed by intersecting
/// `ws_connection_id` against the gateway's in-memory live-connection set
/// (see [`crate::registry::AgentRegistry::list_connected`]), per the design
/// note that no liveness state is duplicated in the datastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAgent {
    pub id: ActiveAgentId,
    pub org_id: OrgId,
    pub ws_connection_id: String,
    /// Stable across reconnects, supplied by the agent at connect time.
    pub ccagent_id: String,
    pub repo_url: Option<String>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
