use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IntegrationId, JobId, OrgId, ProcessedMessageId};

/// Lifecycle status of a single user utterance.
///
/// Transitions only ever move forward: `Queued -> InProgress -> Completed`
/// or directly `InProgress -> Completed` for a thread's first message.
/// `Completed` is terminal; no code path may set a message back to
/// `Queued` or `InProgress` once it reaches `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    InProgress,
    Queued,
    Completed,
}

impl MessageStatus {
    /// True if transitioning from `self` to `next` is a legal forward move.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Queued, InProgress) => true,
            (InProgress, Completed) => true,
            (same, other) if same == other => true,
            _ => false,
        }
    }
}

/// A single user utterance being worked on within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub id: ProcessedMessageId,
    pub job_id: JobId,
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    pub channel_key: String,
    /// Platform message timestamp/id; equal to the job's `thread_key` when
    /// this message is the thread root.
    pub message_id: String,
    pub text: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
