//! Slack adapter: webhook ingress plus the posting/reaction surface
//! `ChatPlatform` needs, both built on `slack-morphism` rather than a
//! hand-rolled HTTP client, posting through its own typed clients rather
//! than raw `reqwest` calls.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use slack_morphism::prelude::*;
use slack_morphism::signature_verifier::SlackEventSignatureVerifier;

use crate::db::Datastore;
use crate::dispatch::Scheduler;
use crate::error::{BrokerError, Result};
use crate::ids::IntegrationId;
use crate::models::ChatPlatformKind;
use crate::platform::event::ChatEvent;
use crate::platform::{ChatPlatform, PlatformRegistry, CHAT_PLATFORM_HTTP_TIMEOUT};

type HyperConnector = SlackClientHyperConnector<
    slack_morphism::hyper_tokio::SlackClientHyperHttpsConnector,
>;

/// One token-authenticated Slack client, cached per integration so repeat
/// webhook deliveries reuse the same underlying HTTP connector (spec
/// §4.6's "cached clients are safe for concurrent use").
pub struct SlackClient {
    client: Arc<slack_morphism::SlackClient<HyperConnector>>,
    token: SlackApiToken,
}

impl SlackClient {
    pub fn new(client: Arc<slack_morphism::SlackClient<HyperConnector>>, bot_token: String) -> Self {
        Self { client, token: SlackApiToken::new(bot_token.into()) }
    }

    fn session(&self) -> slack_morphism::SlackApiTokenSessionClient<'_, HyperConnector> {
        self.client.open_session(&self.token)
    }
}

#[async_trait]
impl ChatPlatform for SlackClient {
    async fn post_message(&self, channel: &str, thread: Option<&str>, text: &str) -> Result<()> {
        let mut request = SlackApiChatPostMessageRequest::new(
            SlackChannelId(channel.to_string()),
            SlackMessageContent::new().with_text(text.to_string()),
        );
        request.thread_ts = thread.map(|ts| SlackTs(ts.to_string()));
        tokio::time::timeout(CHAT_PLATFORM_HTTP_TIMEOUT, self.session().chat_post_message(&request))
            .await
            .map_err(|_| BrokerError::Transient("slack chat.postMessage timed out".into()))?
            .map_err(|err| BrokerError::Transient(format!("slack post_message failed: {err}")))?;
        Ok(())
    }

    async fn set_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()> {
        let request = SlackApiReactionsAddRequest::new(
            SlackChannelId(channel.to_string()),
            SlackReactionName(emoji.to_string()),
            SlackTs(message_id.to_string()),
        );
        match tokio::time::timeout(CHAT_PLATFORM_HTTP_TIMEOUT, self.session().reactions_add(&request)).await {
            Err(_) => Err(BrokerError::Transient("slack reactions.add timed out".into())),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if is_already_reacted(&err) => Ok(()),
            Ok(Err(err)) => Err(BrokerError::Transient(format!("slack reactions.add failed: {err}"))),
        }
    }

    async fn clear_reaction(&self, channel: &str, message_id: &str, emoji: &str) -> Result<()> {
        let request = SlackApiReactionsRemoveRequest::new(
            SlackReactionName(emoji.to_string()),
        )
        .with_channel(SlackChannelId(channel.to_string()))
        .with_timestamp(SlackTs(message_id.to_string()));
        match tokio::time::timeout(CHAT_PLATFORM_HTTP_TIMEOUT, self.session().reactions_remove(&request)).await {
            Err(_) => Err(BrokerError::Transient("slack reactions.remove timed out".into())),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if is_no_reaction(&err) => Ok(()),
            Ok(Err(err)) => Err(BrokerError::Transient(format!("slack reactions.remove failed: {err}"))),
        }
    }
}

/// Slack error responses carry a stable `error` code string; these two
/// are expected steady-state outcomes of an idempotent reaction apply,
/// not failures worth surfacing.
fn is_already_reacted(err: &impl std::fmt::Display) -> bool {
    err.to_string().contains("already_reacted")
}

fn is_no_reaction(err: &impl std::fmt::Display) -> bool {
    err.to_string().contains("no_reaction")
}

/// Replay guard for spec §6.2/§8: `SlackEventSignatureVerifier::verify`
/// only recomputes the `v0:<ts>:<body>` HMAC, it never bounds the age of
/// `ts` itself, so a captured request replayed with its still-valid
/// signature would otherwise pass forever. Rejects anything whose
/// `X-Slack-Request-Timestamp` is more than `skew_seconds` away from now
/// in either direction.
const SLACK_TIMESTAMP_SKEW_SECONDS: i64 = 300;

fn timestamp_within_skew(timestamp: &str, skew_seconds: i64) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else { return false };
    (chrono::Utc::now().timestamp() - ts).abs() <= skew_seconds
}

/// Shared state for the `/slack/events` route: the signing secret used to
/// verify deliveries, the scheduler to hand normalized events to, the
/// command prefix, and the lazily populated per-integration client cache.
#[derive(Clone)]
pub struct SlackWebhookState {
    pub signing_secret: Arc<str>,
    pub db: Arc<dyn Datastore>,
    pub scheduler: Arc<Scheduler>,
    pub platforms: Arc<PlatformRegistry>,
    pub http_client: Arc<slack_morphism::SlackClient<HyperConnector>>,
    pub command_prefix: Arc<str>,
}

/// `POST /slack/events`. Verifies `X-Slack-Signature`/`X-Slack-Request-Timestamp`
/// against `v0:<ts>:<body>`, echoes `url_verification` challenges verbatim,
/// and normalizes `message` callbacks into [`ChatEvent`]s for dispatch.
/// Unknown team ids are acknowledged with `200 OK` and otherwise ignored,
/// so a scan for valid team ids can't distinguish "unknown" from
/// "known but not routed" by response code.
pub async fn handle_event(
    State(state): State<Arc<SlackWebhookState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let Some(signature) = headers.get("X-Slack-Signature").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::UNAUTHORIZED, "missing signature").into_response();
    };
    let Some(timestamp) = headers.get("X-Slack-Request-Timestamp").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::UNAUTHORIZED, "missing timestamp").into_response();
    };

    let verifier = SlackEventSignatureVerifier::new(&state.signing_secret);
    let body_str = String::from_utf8_lossy(&body);
    if verifier.verify(signature, &body_str, timestamp).is_err() {
        return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
    }
    if !timestamp_within_skew(timestamp, SLACK_TIMESTAMP_SKEW_SECONDS) {
        return (StatusCode::UNAUTHORIZED, "stale timestamp").into_response();
    }

    let push_event: SlackPushEvent = match serde_json::from_slice(&body) {
        Ok(ev) => ev,
        Err(err) => {
            tracing::warn!(%err, "unparseable slack event payload");
            return StatusCode::OK.into_response();
        }
    };

    match push_event {
        SlackPushEvent::UrlVerification(challenge) => {
            Json(serde_json::json!({ "challenge": challenge.challenge })).into_response()
        }
        SlackPushEvent::EventCallback(callback) => {
            handle_callback(&state, callback).await;
            StatusCode::OK.into_response()
        }
        _ => StatusCode::OK.into_response(),
    }
}

async fn handle_callback(state: &SlackWebhookState, callback: SlackPushEventCallback) {
    let team_id = callback.team_id.to_string();
    let integration = match state.db.get_integration_by_platform_id(ChatPlatformKind::Slack, &team_id).await {
        Ok(integration) => integration,
        Err(_) => {
            tracing::info!(team_id, "slack event for unknown team, acking without action");
            return;
        }
    };

    match callback.event {
        SlackEventCallbackBody::Message(message_event) => {
            let Some(event) = normalize_message(&integration.org_id, &integration.id, &message_event) else {
                return;
            };
            handle_message_event(state, event).await;
        }
        SlackEventCallbackBody::ReactionAdded(reaction_event) => {
            handle_reaction_added(state, &integration.org_id, &integration.id, &reaction_event).await;
        }
        _ => {}
    }
}

async fn handle_message_event(state: &SlackWebhookState, event: ChatEvent) {
    if let Some(command) = crate::commands::parse_command(&event.text, &state.command_prefix) {
        handle_command(state, &event, command).await;
        return;
    }
    if let Err(err) = state.scheduler.dispatch_incoming_message(&event).await {
        tracing::warn!(%err, "slack dispatch failed");
    }
}

/// A human reacting with `white_check_mark` on a thread root manually
/// closes the job; every other reaction is ignored.
async fn handle_reaction_added(
    state: &SlackWebhookState,
    org_id: &crate::ids::OrgId,
    integration_id: &IntegrationId,
    reaction_event: &SlackReactionAddedEvent,
) {
    if reaction_event.reaction.as_ref() != "white_check_mark" {
        return;
    }
    let SlackReactionsItem::Message(item) = &reaction_event.item else { return };
    if let Err(err) = state.scheduler.complete_job_manually(org_id, integration_id, item.ts.as_ref()).await {
        tracing::warn!(%err, "manual completion via reaction failed");
    }
}

async fn handle_command(state: &SlackWebhookState, event: &ChatEvent, command: crate::commands::Command) {
    let Some(platform) = state.platforms.get(&event.integration_id) else { return };
    let reply = match command {
        crate::commands::Command::Help => crate::prompts::help_text(&state.command_prefix),
        crate::commands::Command::SetRepo(url) => {
            match state.db.set_default_repo(&event.org_id, &event.integration_id, &event.channel_key, &url).await {
                Ok(_) => format!("default repo set to {url}"),
                Err(err) => {
                    tracing::warn!(%err, "set-repo failed");
                    "failed to update default repo".to_string()
                }
            }
        }
        crate::commands::Command::Status => {
            match state.scheduler.status_summary(&event.org_id, &event.integration_id).await {
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

/// Normalizes a Slack `message` callback into the platform-neutral
/// [`ChatEvent`] shape. Messages from bots (including the broker's own
/// posts) are dropped to avoid feedback loops; messages with no channel
/// or text are dropped as unaddressable/non-substantive.
fn normalize_message(
    org_id: &crate::ids::OrgId,
    integration_id: &IntegrationId,
    event: &SlackMessageEvent,
) -> Option<ChatEvent> {
    if event.sender.bot_id.is_some() {
        return None;
    }
    let channel = event.origin.channel.as_ref()?.to_string();
    let text = event.content.as_ref().and_then(|c| c.text.clone())?;
    let ts = event.origin.ts.to_string();
    let thread_key = event.origin.thread_ts.as_ref().map(|t| t.to_string()).unwrap_or_else(|| ts.clone());
    let user = event.sender.user.as_ref().map(|u| u.to_string()).unwrap_or_default();

    Some(ChatEvent {
        org_id: org_id.clone(),
        integration_id: integration_id.clone(),
        platform: ChatPlatformKind::Slack,
        channel_key: channel,
        thread_key,
        message_id: ts,
        user,
        text,
        is_reaction: false,
        reaction_emoji: None,
    })
}

/// Default `hyper`-backed connector, shared across every `SlackClient`.
pub fn new_http_client() -> Arc<slack_morphism::SlackClient<HyperConnector>> {
    Arc::new(slack_morphism::SlackClient::new(SlackClientHyperConnector::new().expect("tls backend available")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_within_skew_accepts_recent_and_rejects_old() {
        let now = chrono::Utc::now().timestamp();
        assert!(timestamp_within_skew(&now.to_string(), SLACK_TIMESTAMP_SKEW_SECONDS));
        assert!(timestamp_within_skew(&(now - 290).to_string(), SLACK_TIMESTAMP_SKEW_SECONDS));
        assert!(!timestamp_within_skew(&(now - 301).to_string(), SLACK_TIMESTAMP_SKEW_SECONDS));
        assert!(!timestamp_within_skew(&(now + 301).to_string(), SLACK_TIMESTAMP_SKEW_SECONDS));
    }

    #[test]
    fn timestamp_within_skew_rejects_unparseable_value() {
        assert!(!timestamp_within_skew("not-a-number", SLACK_TIMESTAMP_SKEW_SECONDS));
    }
}
