use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IntegrationId, OrgId};

/// Per-(org, integration, channel) state, upserted on every inbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedChannel {
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    pub channel_key: String,
    pub default_repo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
