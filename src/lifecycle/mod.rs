//! Lifecycle state machine (C2): per-message status transitions and the
//! reaction side-effects that make them observable on the chat side.
//!
//! The state machine itself (`MessageStatus::can_transition_to`) lives on
//! the model in [`crate::models::processed_message`]; this module owns the
//! *mapping* from status/event to emoji and the idempotent apply routine
//! described in spec §4.2.

use async_trait::async_trait;

use crate::models::MessageStatus;

/// Known status-reaction emoji, used both as the target and as the set that
/// gets cleared before the target is applied (so a message only ever shows
/// its current status, never a stale one left over from an earlier state).
pub const KNOWN_STATUS_EMOJI: &[&str] = &["eyes", "hourglass", "white_check_mark", "hand", "x"];

/// Reaction target for a given message status or lifecycle event, per the
/// table in spec §4.2 (the REDESIGN FLAG's resolution: `eyes` for
/// IN_PROGRESS, `hourglass` for QUEUED).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionTarget {
    Eyes,
    Hourglass,
    WhiteCheckMark,
    Hand,
    X,
}

impl ReactionTarget {
    pub fn emoji(self) -> &'static str {
        match self {
            ReactionTarget::Eyes => "eyes",
            ReactionTarget::Hourglass => "hourglass",
            ReactionTarget::WhiteCheckMark => "white_check_mark",
            ReactionTarget::Hand => "hand",
            ReactionTarget::X => "x",
        }
    }

    /// Per-message reaction for a `ProcessedMessage`'s current status.
    /// `COMPLETED` maps to `white_check_mark` regardless of whether this is
    /// the thread root; suppression of per-message reactions on the root is
    /// the caller's job (`Job::is_thread_root`), not this mapping's.
    pub fn for_status(status: MessageStatus) -> Self {
        match status {
            MessageStatus::InProgress => ReactionTarget::Eyes,
            MessageStatus::Queued => ReactionTarget::Hourglass,
            MessageStatus::Completed => ReactionTarget::WhiteCheckMark,
        }
    }
}

/// Narrow seam over a chat platform's reaction API, implemented per-platform
/// by [`crate::platform::ChatPlatform`]. Kept separate from the full
/// `ChatPlatform` trait so lifecycle tests can mock just the reaction calls.
#[async_trait]
pub trait ReactionSink: Send + Sync {
    async fn add_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> crate::error::Result<()>;
    async fn remove_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> crate::error::Result<()>;
}

/// Idempotently sets `target` as the sole known-status reaction on a
/// message: removes every other known-status emoji (ignoring
/// "reaction not found"), then adds the target (ignoring "already
/// reacted"). Never propagates a failure to the caller — reaction updates
/// are logged and swallowed per spec §4.2/§7, since the chat-side reaction
/// is an observability aid, not a correctness-bearing side-effect.
pub async fn apply_reaction(sink: &dyn ReactionSink, channel: &str, message_id: &str, target: ReactionTarget) {
    for &emoji in KNOWN_STATUS_EMOJI {
        if emoji == target.emoji() {
            continue;
        }
        if let Err(err) = sink.remove_reaction(channel, message_id, emoji).await {
            tracing::debug!(%err, channel, message_id, emoji, "reaction removal failed (ignored)");
        }
    }
    if let Err(err) = sink.add_reaction(channel, message_id, target.emoji()).await {
        tracing::warn!(%err, channel, message_id, emoji = target.emoji(), "reaction add failed (logged, not propagated)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        fail_not_found: bool,
    }

    #[async_trait]
    impl ReactionSink for RecordingSink {
        async fn add_reaction(&self, _channel: &str, _message_id: &str, emoji: &str) -> crate::error::Result<()> {
            self.added.lock().unwrap().push(emoji.to_string());
            Ok(())
        }

        async fn remove_reaction(&self, _channel: &str, _message_id: &str, emoji: &str) -> crate::error::Result<()> {
            self.removed.lock().unwrap().push(emoji.to_string());
            if self.fail_not_found {
                return Err(crate::error::BrokerError::NotFound);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn applies_target_and_clears_others() {
        let sink = RecordingSink::default();
        apply_reaction(&sink, "C1", "123", ReactionTarget::Eyes).await;
        assert_eq!(sink.added.lock().unwrap().as_slice(), ["eyes"]);
        assert_eq!(sink.removed.lock().unwrap().len(), KNOWN_STATUS_EMOJI.len() - 1);
        assert!(!sink.removed.lock().unwrap().contains(&"eyes".to_string()));
    }

    #[tokio::test]
    async fn tolerates_not_found_on_removal() {
        let sink = RecordingSink { fail_not_found: true, ..Default::default() };
        apply_reaction(&sink, "C1", "123", ReactionTarget::WhiteCheckMark).await;
        assert_eq!(sink.added.lock().unwrap().as_slice(), ["white_check_mark"]);
    }

    #[test]
    fn status_mapping_matches_redesign_flag() {
        assert_eq!(ReactionTarget::for_status(MessageStatus::InProgress), ReactionTarget::Eyes);
        assert_eq!(ReactionTarget::for_status(MessageStatus::Queued), ReactionTarget::Hourglass);
        assert_eq!(ReactionTarget::for_status(MessageStatus::Completed), ReactionTarget::WhiteCheckMark);
    }
}
