//! Discord adapter: one `serenity` gateway session per Discord
//! integration, plus the posting/reaction surface `ChatPlatform` needs.
//!
//! Mirrors [`super::slack`]'s shape within this same crate — both are thin
//! adapters over the `ChatPlatform` seam, generalized to Discord's own SDK.
//! Unlike Slack, Discord has no webhook ingress to verify: events arrive
//! over the bot's own authenticated gateway session, so this module owns
//! starting and supervising that session rather than an `axum` route.

use std::sync::Arc;

use async_trait::async_trait;
use serenity::all::{
    ChannelId, Context, CreateMessage, EventHandler, GatewayIntents, Message, MessageId, Reaction,
    ReactionType,
};
use serenity::Client;

use crate::db::Datastore;
use crate::dispatch::Scheduler;
use crate::error::{BrokerError, Result};
use crate::ids::{IntegrationId, OrgId};
use crate::models::ChatPlatformKind;
use crate::platform::event::ChatEvent;
use crate::platform::{PlatformRegistry, CHAT_PLATFORM_HTTP_TIMEOUT};

/// One token-authenticated Discord client. `post_message`/`set_reaction`/
/// `clear_reaction` go through `serenity`'s REST `Http` handle, which is
/// independent of (and outlives reconnects of) the gateway session that
/// receives inbound events.
pub struct DiscordClient {
    http: Arc<serenity::http::Http>,
}

impl DiscordClient {
    pub fn new(bot_token: &str) -> Self {
        Self { http: Arc::new(serenity::http::Http::new(bot_token)) }
    }

    fn http(&self) -> Arc<serenity::http::Http> {
        self.http.clone()
    }
}

#[async_trait]
impl super::ChatPlatform for DiscordClient {
    async fn post_message(&self, channel: &str, thread: Option<&str>, text: &str) -> Result<()> {
        let channel_id = parse_channel_id(thread.unwrap_or(channel))?;
        let builder = CreateMessage::new().content(text);
        tokio::time::timeout(CHAT_PLATFORM_HTTP_TIMEOUT, channel_id.send_message(self.http(), builder))
            .await
            .map_err(|_| BrokerError::Transient("discord send_message timed out".into()))?
            .map_err(|err| BrokerError::Transient(format!("discord send_message failed: {err}")))?;
        Ok(())
    }

    async fn set_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()> {
        let channel_id = parse_channel_id(channel)?;
        let msg_id = parse_message_id(message_id)?;
        match tokio::time::timeout(CHAT_PLATFORM_HTTP_TIMEOUT, self.http.create_reaction(channel_id, msg_id, &emoji_reaction(emoji))).await {
            Err(_) => Err(BrokerError::Transient("discord create_reaction timed out".into())),
            Ok(Ok(())) => Ok(()),
            // Discord returns 10014 (Unknown Emoji) only for genuinely bad
            // names; a duplicate reaction from the same bot is a silent
            // no-op on Discord's side, so there is no "already reacted"
            // error to swallow here the way Slack has one.
            Ok(Err(err)) => Err(BrokerError::Transient(format!("discord create_reaction failed: {err}"))),
        }
    }

    async fn clear_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()> {
        let channel_id = parse_channel_id(channel)?;
        let msg_id = parse_message_id(message_id)?;
        match tokio::time::timeout(CHAT_PLATFORM_HTTP_TIMEOUT, self.http.delete_own_reaction(channel_id, msg_id, &emoji_reaction(emoji))).await {
            Err(_) => Err(BrokerError::Transient("discord delete_reaction timed out".into())),
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if is_unknown_reaction(&err) => Ok(()),
            Ok(Err(err)) => Err(BrokerError::Transient(format!("discord delete_reaction failed: {err}"))),
        }
    }
}

/// Status reactions flow through this crate as Slack shortcode names
/// (`eyes`, `hourglass`, ...); Discord's REST API wants the actual unicode
/// grapheme. `emojis` (already in the dependency graph for exactly this
/// kind of shortcode lookup) bridges the two.
fn emoji_reaction(name: &str) -> ReactionType {
    let unicode = emojis::get_by_shortcode(name).map(|e| e.as_str()).unwrap_or(name);
    ReactionType::Unicode(unicode.to_string())
}

fn parse_channel_id(raw: &str) -> Result<ChannelId> {
    raw.parse::<u64>().map(ChannelId::new).map_err(|_| BrokerError::Validation(format!("bad discord channel id {raw:?}")))
}

fn parse_message_id(raw: &str) -> Result<MessageId> {
    raw.parse::<u64>().map(MessageId::new).map_err(|_| BrokerError::Validation(format!("bad discord message id {raw:?}")))
}

/// Discord's equivalent of Slack's `no_reaction`/`already_reacted`: a 404
/// when the bot's own reaction is already gone. Expected on the idempotent
/// apply path, not worth surfacing.
fn is_unknown_reaction(err: &serenity::Error) -> bool {
    err.to_string().contains("Unknown Message") || err.to_string().contains("10014")
}

/// Intents requested for the gateway session: guild messages (to see
/// `message_create`), message content (the bot needs the actual text, a
/// privileged intent Discord requires opting into explicitly), and guild
/// message reactions (needed for the manual-completion checkmark flow).
fn intents() -> GatewayIntents {
    GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT | GatewayIntents::GUILD_MESSAGE_REACTIONS
}

/// `serenity::EventHandler` bound to one integration. Normalizes
/// `message_create`/`reaction_add` into [`ChatEvent`] and hands off to the
/// scheduler (C1), mirroring [`super::slack::handle_callback`]'s shape.
struct Handler {
    db: Arc<dyn Datastore>,
    scheduler: Arc<Scheduler>,
    platforms: Arc<PlatformRegistry>,
    org_id: OrgId,
    integration_id: IntegrationId,
    command_prefix: Arc<str>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(event) = self.normalize(&msg) else { return };
        if let Some(command) = crate::commands::parse_command(&event.text, &self.command_prefix) {
            self.handle_command(&event, command).await;
            return;
        }
        if let Err(err) = self.scheduler.dispatch_incoming_message(&event).await {
            tracing::warn!(%err, "discord dispatch failed");
        }
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        let is_checkmark = match &reaction.emoji {
            ReactionType::Unicode(name) => emojis::get(name).and_then(|e| e.shortcode()) == Some("white_check_mark"),
            _ => false,
        };
        if !is_checkmark {
            return;
        }
        if let Err(err) = self
            .scheduler
            .complete_job_manually(&self.org_id, &self.integration_id, &reaction.message_id.to_string())
            .await
        {
            tracing::warn!(%err, "manual completion via discord reaction failed");
        }
    }
}

impl Handler {
    fn normalize(&self, msg: &Message) -> Option<ChatEvent> {
        if msg.content.trim().is_empty() {
            return None;
        }
        let message_id = msg.id.to_string();
        let thread_key = msg.referenced_message.as_ref().map(|m| m.id.to_string()).unwrap_or_else(|| message_id.clone());
        Some(ChatEvent {
            org_id: self.org_id.clone(),
            integration_id: self.integration_id.clone(),
            platform: ChatPlatformKind::Discord,
            channel_key: msg.channel_id.to_string(),
            thread_key,
            message_id,
            user: msg.author.id.to_string(),
            text: msg.content.clone(),
            is_reaction: false,
            reaction_emoji: None,
        })
    }

    async fn handle_command(&self, event: &ChatEvent, command: crate::commands::Command) {
        let Some(platform) = self.platforms.get(&self.integration_id) else { return };
        let reply = match command {
            crate::commands::Command::Help => crate::prompts::help_text(&self.command_prefix),
            crate::commands::Command::SetRepo(url) => {
                match self.db.set_default_repo(&event.org_id, &event.integration_id, &event.channel_key, &url).await {
                    Ok(_) => format!("default repo set to {url}"),
                    Err(err) => {
                        tracing::warn!(%err, "set-repo failed");
                        "failed to update default repo".to_string()
                    }
                }
            }
            crate::commands::Command::Status => {
                match self.scheduler.status_summary(&event.org_id, &event.integration_id).await {
                    Ok((live, in_progress, queued)) => crate::prompts::status_summary(live, in_progress, queued),
                    Err(err) => {
                        tracing::warn!(%err, "status summary failed");
                        "failed to fetch status".to_string()
                    }
                }
            }
        };
        let _ = platform.post_message(&event.channel_key, Some(&event.thread_key), &reply).await;
    }
}

/// Supervises one `serenity::Client` gateway session per Discord
/// integration, restarting with exponential-ish backoff if `client.start()`
/// returns (network blip, invalid session, Discord-side restart request).
/// `serenity` already retries transient gateway disconnects internally;
/// this loop only covers the outer case where `start()` itself returns an
/// `Err` and the task would otherwise silently die.
pub async fn run_gateway_session(
    bot_token: String,
    db: Arc<dyn Datastore>,
    scheduler: Arc<Scheduler>,
    platforms: Arc<PlatformRegistry>,
    org_id: OrgId,
    integration_id: IntegrationId,
    command_prefix: Arc<str>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        let handler = Handler {
            db: db.clone(),
            scheduler: scheduler.clone(),
            platforms: platforms.clone(),
            org_id: org_id.clone(),
            integration_id: integration_id.clone(),
            command_prefix: command_prefix.clone(),
        };
        let mut client = match Client::builder(&bot_token, intents()).event_handler(handler).await {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(%err, %integration_id, "failed to build discord client, retrying in 30s");
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                continue;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                client.shard_manager.shutdown_all().await;
                return;
            }
            result = client.start() => {
                if let Err(err) = result {
                    tracing::warn!(%err, %integration_id, "discord gateway session ended, reconnecting in 10s");
                }
            }
        }

        if shutdown.is_cancelled() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    }
}
