use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::OrgId;

/// The tenant boundary. Every other entity is scoped by `org_id` and every
/// repository method takes it as a mandatory filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    /// Hashed-at-rest agent auth secret; `None` until first generated.
    pub ccagent_secret_key_hash: Option<String>,
    pub ccagent_secret_key_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(id: OrgId) -> Self {
        Self {
            id,
            ccagent_secret_key_hash: None,
            ccagent_secret_key_generated_at: None,
            created_at: Utc::now(),
        }
    }
}
