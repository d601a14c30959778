use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{OrgId, UserId};

/// A dashboard principal, bound to exactly one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub org_id: OrgId,
    pub auth_provider: String,
    pub auth_provider_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}
