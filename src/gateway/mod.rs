//! WebSocket Gateway: authenticated agent sessions, heartbeat, message
//! dispatch.
//!
//! Implemented as an `axum::extract::ws` upgrade handler colocated with the
//! chat-webhook HTTP surface — a logical component of the same process
//! rather than a second listener — instead of a bare `tokio-tungstenite`
//! listener. Per connection: one read task, one write task fed by an
//! `mpsc` outbox; the scheduler commits its transaction, then enqueues
//! into the outbox, so it never holds a lock across the socket-send
//! boundary.

pub mod protocol;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::dispatch::Scheduler;
use crate::error::{BrokerError, Result};
use crate::registry::LiveConnections;

use protocol::{Envelope, GatewayMessage};

/// An item on a connection's outbox: either a frame to write, or a request
/// to close the socket from the write side (secret rotation, idle reap of
/// a still-connected agent).
pub enum Outbound {
    Frame(Envelope),
    Close,
}

/// The gateway's authoritative set of open connection ids, each mapped to
/// the outbox that feeds its write task. A `DashMap` gives per-shard
/// locking rather than one global `RwLock<HashMap<..>>`, so the write
/// task's sends never block a concurrent connect/disconnect on another
/// connection — readers never block writers — achieved without
/// hand-rolling a copy-on-write snapshot type.
#[derive(Default)]
pub struct LiveConnectionSet {
    outboxes: DashMap<String, mpsc::UnboundedSender<Outbound>>,
}

impl LiveConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, ws_connection_id: String, tx: mpsc::UnboundedSender<Outbound>) {
        self.outboxes.insert(ws_connection_id, tx);
    }

    fn unregister(&self, ws_connection_id: &str) {
        self.outboxes.remove(ws_connection_id);
    }

    /// Enqueues `message` on `ws_connection_id`'s outbox. A missing or
    /// closed connection is reported as `BrokerError::NotFound` so callers
    /// (the scheduler, periodic tasks) can decide whether that should be
    /// treated as "agent already gone" rather than a hard failure.
    pub fn send(&self, ws_connection_id: &str, message: GatewayMessage) -> Result<()> {
        let tx = self.outboxes.get(ws_connection_id).ok_or(BrokerError::NotFound)?;
        tx.send(Outbound::Frame(Envelope::new(message))).map_err(|_| BrokerError::NotFound)
    }

    /// Asks the write task for `ws_connection_id` to close the socket.
    /// Used by secret-key rotation and the idle-job reaper, which both need
    /// to drop a still-live connection rather than react to its own
    /// disconnect.
    pub fn close(&self, ws_connection_id: &str) -> Result<()> {
        let tx = self.outboxes.get(ws_connection_id).ok_or(BrokerError::NotFound)?;
        tx.send(Outbound::Close).map_err(|_| BrokerError::NotFound)
    }

    /// Test-only: registers a connection id as live without a backing
    /// socket, paired with a channel the test can ignore or drain. Used by
    /// `dispatch` unit tests that only need liveness, not real I/O.
    #[cfg(any(test, feature = "test-util"))]
    pub fn register_for_test(&self, ws_connection_id: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        self.register(ws_connection_id, tx);
    }
}

impl LiveConnections for LiveConnectionSet {
    fn is_live(&self, ws_connection_id: &str) -> bool {
        self.outboxes.contains_key(ws_connection_id)
    }

    fn snapshot_ids(&self) -> HashSet<String> {
        self.outboxes.iter().map(|e| e.key().clone()).collect()
    }
}

/// Shared state handed to every connection's tasks.
#[derive(Clone)]
pub struct GatewayState {
    pub scheduler: Arc<Scheduler>,
    pub live: Arc<LiveConnectionSet>,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub shutdown: CancellationToken,
}

/// Drives one agent connection from its `axum` `WebSocket` until it closes.
/// Blocks on the connect-time `Hello` frame's auth step before
/// doing anything else; on auth failure the socket is closed with
/// WebSocket close code 4401 (private-use range; WS has no native 401).
pub async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (mut sink, mut stream) = socket.split();

    let hello = match recv_hello(&mut stream).await {
        Ok(hello) => hello,
        Err(_) => {
            let _ = sink.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 4401,
                reason: "invalid hello frame".into(),
            }))).await;
            return;
        }
    };

    let org_id = match state.scheduler.authenticate_agent(&hello.ccagent_secret_key).await {
        Ok(org_id) => org_id,
        Err(_) => {
            let _ = sink.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 4401,
                reason: "unauthorized".into(),
            }))).await;
            return;
        }
    };

    let ws_connection_id = uuid::Uuid::new_v4().to_string();
    if let Err(err) = state
        .scheduler
        .registry()
        .upsert(&org_id, &ws_connection_id, &hello.ccagent_id, hello.repo_url.as_deref())
        .await
    {
        tracing::warn!(%err, "failed to register agent on connect");
        return;
    }

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    state.live.register(ws_connection_id.clone(), outbox_tx);
    tracing::info!(org_id = %org_id, ws_connection_id, ccagent_id = hello.ccagent_id, "agent connected");

    let last_active = Arc::new(Mutex::new(Instant::now()));

    let write_task = tokio::spawn(write_loop(
        sink,
        outbox_rx,
        state.heartbeat_interval,
        state.shutdown.clone(),
    ));
    let read_result = read_loop(&mut stream, &state, &ws_connection_id, last_active.clone(), state.pong_timeout).await;

    write_task.abort();
    state.live.unregister(&ws_connection_id);
    if let Err(err) = state.scheduler.reclaim_agent_by_ws(&ws_connection_id, ReclaimCause::Disconnected).await {
        tracing::warn!(%err, ws_connection_id, "reclaim on disconnect failed");
    }
    if let Err(err) = read_result {
        tracing::info!(%err, ws_connection_id, "agent connection closed");
    }
}

struct Hello {
    ccagent_secret_key: String,
    ccagent_id: String,
    repo_url: Option<String>,
}

async fn recv_hello(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> std::result::Result<Hello, ()> {
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|_| ())?;
        let text = match frame {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return Err(()),
        };
        let envelope: Envelope = serde_json::from_str(&text).map_err(|_| ())?;
        return match envelope.message {
            GatewayMessage::Hello { ccagent_secret_key, ccagent_id, repo_url } => {
                Ok(Hello { ccagent_secret_key, ccagent_id, repo_url })
            }
            _ => Err(()),
        };
    }
    Err(())
}

/// Reasons a job's agent is reclaimed, threaded through to
/// [`crate::dispatch::Scheduler::reclaim_agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimCause {
    Disconnected,
    StaleSweep,
    SecretRotation,
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbox_rx: mpsc::UnboundedReceiver<Outbound>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(heartbeat_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Graceful shutdown: drain whatever is already queued within
                // a bounded deadline, then close.
                let drain = async {
                    while let Ok(item) = outbox_rx.try_recv() {
                        if let Outbound::Frame(env) = item {
                            if send_envelope(&mut sink, &env).await.is_err() {
                                break;
                            }
                        }
                    }
                };
                let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = ticker.tick() => {
                if send_envelope(&mut sink, &Envelope::new(GatewayMessage::HealthcheckPing)).await.is_err() {
                    break;
                }
            }
            maybe_item = outbox_rx.recv() => {
                match maybe_item {
                    Some(Outbound::Frame(env)) => {
                        if send_envelope(&mut sink, &env).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

async fn send_envelope(sink: &mut futures::stream::SplitSink<WebSocket, Message>, env: &Envelope) -> std::result::Result<(), ()> {
    let text = serde_json::to_string(env).map_err(|_| ())?;
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn read_loop(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    state: &GatewayState,
    ws_connection_id: &str,
    last_active: Arc<Mutex<Instant>>,
    pong_timeout: Duration,
) -> std::result::Result<(), &'static str> {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = tokio::time::sleep(pong_timeout) => {
                let elapsed = last_active.lock().await.elapsed();
                if elapsed >= pong_timeout {
                    return Err("missed pong, closing");
                }
                continue;
            }
        };
        let Some(frame) = frame else { return Ok(()) };
        let frame = frame.map_err(|_| "socket error")?;
        *last_active.lock().await = Instant::now();
        if let Err(err) = state.scheduler.registry().heartbeat_touch(ws_connection_id).await {
            tracing::debug!(%err, "heartbeat touch failed");
        }

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(()),
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(err) => {
                tracing::warn!(%err, ws_connection_id, "dropping frame with unparseable/unknown type");
                continue;
            }
        };

        if let Err(err) = handle_agent_frame(state, ws_connection_id, envelope.message).await {
            tracing::warn!(%err, ws_connection_id, "agent frame handling failed");
        }
    }
}

async fn handle_agent_frame(state: &GatewayState, ws_connection_id: &str, message: GatewayMessage) -> Result<()> {
    match message {
        GatewayMessage::HealthcheckAck | GatewayMessage::HealthcheckPing => Ok(()),
        GatewayMessage::ProcessingMessage { processed_message_id } => {
            state.scheduler.on_processing_message(ws_connection_id, &processed_message_id).await
        }
        GatewayMessage::AssistantMessage { job_id, processed_message_id, message } => {
            state.scheduler.on_assistant_message(ws_connection_id, &job_id, &processed_message_id, &message).await
        }
        GatewayMessage::SystemMessage { job_id, message } => {
            state.scheduler.on_system_message(ws_connection_id, &job_id, &message).await
        }
        GatewayMessage::JobComplete { job_id, reason } => {
            state.scheduler.on_job_complete(ws_connection_id, &job_id, &reason).await
        }
        GatewayMessage::Hello { .. } | GatewayMessage::StartConversation { .. } | GatewayMessage::UserMessage { .. } | GatewayMessage::JobUnassigned { .. } => {
            Err(BrokerError::Validation("received a broker->agent-only frame from an agent".into()))
        }
    }
}
