use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IntegrationId, OrgId};

/// Which chat platform a bot installation belongs to. The scheduler and
/// lifecycle engine are generic over this; only posting/reaction calls
/// branch on it (see [`crate::platform::ChatPlatform`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPlatformKind {
    Slack,
    Discord,
}

impl ChatPlatformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatPlatformKind::Slack => "slack",
            ChatPlatformKind::Discord => "discord",
        }
    }
}

/// A bot installation bound to a specific Slack team or Discord guild.
/// `auth_token` is write-only from the repository's perspective: it is
/// accepted on insert/update but never returned by read queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub org_id: OrgId,
    pub platform: ChatPlatformKind,
    /// Slack team id or Discord guild id. Unique per platform.
    pub platform_team_or_guild_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
