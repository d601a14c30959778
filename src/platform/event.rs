//! Platform-neutral event shape that both Slack and Discord handlers
//! normalize into before handing off to [`crate::dispatch::Scheduler`].

use crate::ids::{IntegrationId, OrgId};
use crate::models::ChatPlatformKind;

#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    pub platform: ChatPlatformKind,
    pub channel_key: String,
    /// Thread root identifier: Slack `thread_ts` (or this message's own
    /// `ts` when it starts a new thread), Discord's thread-starting
    /// message id.
    pub thread_key: String,
    /// This event's own message id/ts; equals `thread_key` for a top-level
    /// message that starts a new thread.
    pub message_id: String,
    pub user: String,
    pub text: String,
    /// True for a reaction-added event (used only for the manual-completion
    /// scenario — a `white_check_mark` added to the thread root by a human).
    pub is_reaction: bool,
    /// The emoji name when `is_reaction` is true.
    pub reaction_emoji: Option<String>,
}

impl ChatEvent {
    pub fn is_top_level(&self) -> bool {
        self.thread_key == self.message_id
    }
}
