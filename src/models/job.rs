use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IntegrationId, JobId, OrgId};
use crate::models::ChatPlatformKind;

/// A unit of conversational work bound to exactly one chat thread.
///
/// `updated_at` is advanced on every agent- or user-originated activity and
/// is what the idle-job reaper (C7) compares against the per-org idle
/// threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    pub platform: ChatPlatformKind,
    pub channel_key: String,
    /// The platform's thread identifier (Slack thread_ts, Discord message id
    /// that started the thread). Forms the unique key alongside
    /// `(org_id, integration_id)`.
    pub thread_key: String,
    pub originating_user: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether `message_id` is this job's thread root, i.e. the message
    /// that created it. Per-message reactions are suppressed on the root;
    /// only thread-root lifecycle reactions apply.
    pub fn is_thread_root(&self, message_id: &str) -> bool {
        self.thread_key == message_id
    }
}
