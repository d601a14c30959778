//! Chat-Platform Handlers: thin per-platform adapters that verify inbound
//! webhooks/gateway events, normalize them into [`event::ChatEvent`], and
//! carry the narrow posting/reaction surface the dispatch/lifecycle core
//! needs ([`ChatPlatform`]) — generalizing Slack and Discord as variants of
//! one abstract chat platform.

pub mod discord;
pub mod event;
pub mod slack;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::ids::IntegrationId;
use crate::lifecycle::ReactionSink;

/// Deadline applied to every outbound chat-platform HTTP call (spec §5:
/// "Deadlines default to 10s for chat-platform HTTP calls"), shared by both
/// [`slack::SlackClient`] and [`discord::DiscordClient`].
pub const CHAT_PLATFORM_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Object-safe seam over a chat platform's posting/reaction surface. Both
/// [`slack::SlackClient`] and [`discord::DiscordClient`] implement it; the
/// scheduler and periodic tasks hold `Arc<dyn ChatPlatform>` resolved by
/// integration id through [`PlatformRegistry`], never a concrete type.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn post_message(&self, channel: &str, thread: Option<&str>, text: &str) -> Result<()>;
    async fn set_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()>;
    async fn clear_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()>;
}

#[async_trait]
impl ReactionSink for dyn ChatPlatform {
    async fn add_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.set_reaction(channel, message_id, emoji).await
    }

    async fn remove_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.clear_reaction(channel, message_id, emoji).await
    }
}

/// Cache of per-integration chat clients, instantiated lazily with that
/// integration's auth token and kept for the process lifetime; clients are
/// safe for concurrent use. A `DashMap` rather than a `Mutex<HashMap>` so a
/// cache hit on one integration never blocks a cache miss being inserted
/// for another.
#[derive(Default)]
pub struct PlatformRegistry {
    clients: DashMap<IntegrationId, Arc<dyn ChatPlatform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, integration_id: &IntegrationId) -> Option<Arc<dyn ChatPlatform>> {
        self.clients.get(integration_id).map(|c| c.clone())
    }

    pub fn insert(&self, integration_id: IntegrationId, client: Arc<dyn ChatPlatform>) {
        self.clients.insert(integration_id, client);
    }

    pub fn remove(&self, integration_id: &IntegrationId) {
        self.clients.remove(integration_id);
    }
}
