//! ccbroker process entry point: loads configuration, opens the Postgres
//! pool, wires the dispatch core to an `axum` HTTP/WebSocket listener, and
//! spawns the periodic sweeps, following the teacher's own
//! config-then-log-then-serve `main` shape.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use ccbroker::commands::Settings;
use ccbroker::config::AppConfig;
use ccbroker::db::postgres::PostgresDatastore;
use ccbroker::db::Datastore;
use ccbroker::dispatch::Scheduler;
use ccbroker::gateway::{GatewayState, LiveConnectionSet};
use ccbroker::models::ChatPlatformKind;
use ccbroker::platform::discord::DiscordClient;
use ccbroker::platform::slack::{SlackClient, SlackWebhookState};
use ccbroker::platform::{ChatPlatform, PlatformRegistry};
use ccbroker::registry::AgentRegistry;
use ccbroker::tasks::TaskContext;

/// Interval the idle-job reaper runs at. Not operator-configurable (unlike
/// the redispatch/stale-sweep intervals in [`AppConfig`]): idle thresholds
/// are minutes-scale by nature, so a fixed one-minute cadence is fine
/// resolution without adding a fourth knob nobody asked for.
const IDLE_REAP_INTERVAL: Duration = Duration::from_secs(60);

struct AppState {
    scheduler: Arc<Scheduler>,
    registry: Arc<AgentRegistry>,
    live: Arc<LiveConnectionSet>,
    config: AppConfig,
    started_at: std::time::Instant,
    #[cfg(feature = "metrics")]
    metrics: Arc<ccbroker::telemetry::metrics::Metrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = ccbroker::telemetry::init_tracing();

    let config = AppConfig::load()?;
    tracing::info!(bind_addr = %config.bind_addr, "starting ccbroker");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.datastore_dsn)
        .await?;
    let pg = PostgresDatastore::new(pool);
    pg.migrate().await?;
    let db: Arc<dyn Datastore> = Arc::new(pg);

    let registry = Arc::new(AgentRegistry::new(db.clone()));
    let live = Arc::new(LiveConnectionSet::new());
    let platforms = Arc::new(PlatformRegistry::new());
    let settings = Arc::new(Settings::new(db.clone()));

    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        registry.clone(),
        live.clone(),
        platforms.clone(),
        config.ccagent_secret_signing_key_pepper.clone(),
    ));

    let shutdown = CancellationToken::new();

    bootstrap_platform_clients(&db, &platforms, &scheduler, &config, &shutdown).await?;

    let task_ctx = TaskContext {
        db: db.clone(),
        jobstore: Arc::new(ccbroker::jobstore::JobStore::new(db.clone())),
        scheduler: scheduler.clone(),
        registry: registry.clone(),
        live: live.clone(),
        platforms: platforms.clone(),
        settings,
        default_idle_threshold_minutes: config.idle_job_threshold_minutes,
        default_inactive_threshold_minutes: config.agent_inactive_threshold_minutes,
    };
    let sweep_handles = ccbroker::tasks::spawn_all(
        task_ctx,
        Duration::from_secs(config.queue_redispatch_interval_seconds),
        IDLE_REAP_INTERVAL,
        Duration::from_secs(config.stale_agent_sweep_interval_seconds),
        shutdown.clone(),
    );

    #[cfg(feature = "metrics")]
    let metrics = Arc::new(ccbroker::telemetry::metrics::Metrics::new());

    let app_state = Arc::new(AppState {
        scheduler: scheduler.clone(),
        registry: registry.clone(),
        live: live.clone(),
        config: config.clone(),
        started_at: std::time::Instant::now(),
        #[cfg(feature = "metrics")]
        metrics: metrics.clone(),
    });

    let slack_state = Arc::new(SlackWebhookState {
        signing_secret: config.slack_signing_secret.clone().unwrap_or_default().into(),
        db: db.clone(),
        scheduler: scheduler.clone(),
        platforms: platforms.clone(),
        http_client: ccbroker::platform::slack::new_http_client(),
        command_prefix: config.command_prefix.clone().into(),
    });

    let gateway_state = GatewayState {
        scheduler: scheduler.clone(),
        live: live.clone(),
        heartbeat_interval: Duration::from_secs(config.ws_heartbeat_interval_seconds),
        pong_timeout: Duration::from_secs(config.ws_pong_timeout_seconds),
        shutdown: shutdown.clone(),
    };

    let mut router = Router::new()
        .route("/slack/events", post(ccbroker::platform::slack::handle_event))
        .with_state(slack_state)
        .route("/agents/ws", get(ws_upgrade))
        .with_state(gateway_state)
        .route(
            "/internal/organizations/:id/ccagent_secret_key/rotate",
            post(rotate_secret_key),
        )
        .route("/healthz", get(healthz))
        .with_state(app_state.clone());

    #[cfg(feature = "metrics")]
    {
        router = router.route("/metrics", get(render_metrics)).with_state(app_state.clone());
    }

    let router = router.layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(bind_addr = %config.bind_addr, "listening");

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            let ctrl_c = async { tokio::signal::ctrl_c().await.expect("ctrl_c handler install failed") };
            #[cfg(unix)]
            let terminate = async {
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler install failed")
                    .recv()
                    .await;
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate => {}
            }
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    };

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    for handle in sweep_handles {
        let _ = handle.await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn ws_upgrade(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ccbroker::gateway::handle_socket(socket, state))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.live.snapshot_ids().len();
    let uptime = state.started_at.elapsed().as_secs();
    axum::Json(serde_json::json!({
        "status": "ok",
        "connected_agents": connected,
        "uptime_seconds": uptime,
    }))
}

#[cfg(feature = "metrics")]
async fn render_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render()
}

/// `POST /internal/organizations/:id/ccagent_secret_key/rotate`. Generates
/// a fresh agent secret, stores only its peppered hash, and disconnects
/// every currently-live agent for the org so they reconnect with the new
/// key (spec §8 seed test 6). Returns the plaintext key once; it is never
/// retrievable again.
async fn rotate_secret_key(State(state): State<Arc<AppState>>, Path(org_id): Path<String>) -> impl IntoResponse {
    let org_id = match org_id.parse::<ccbroker::ids::OrgId>() {
        Ok(id) => id,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed organization id").into_response(),
    };
    let new_secret = ccbroker::auth::generate_secret_key();
    let new_hash = ccbroker::auth::hash_secret_key(&new_secret, &state.config.ccagent_secret_signing_key_pepper);

    match state.scheduler.rotate_secret_key_and_disconnect(&org_id, &new_hash).await {
        Ok(()) => axum::Json(serde_json::json!({ "ccagent_secret_key": new_secret })).into_response(),
        Err(err) => {
            tracing::warn!(%err, %org_id, "secret rotation failed");
            (StatusCode::NOT_FOUND, "organization not found").into_response()
        }
    }
}

/// Populates the per-integration platform client cache at startup and, for
/// Discord integrations, spawns the long-lived gateway session each one
/// needs. Slack has no persistent connection to start — its webhook route
/// handles ingress — so only its client is cached up front.
async fn bootstrap_platform_clients(
    db: &Arc<dyn Datastore>,
    platforms: &Arc<PlatformRegistry>,
    scheduler: &Arc<Scheduler>,
    config: &AppConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let http_client = ccbroker::platform::slack::new_http_client();
    let command_prefix: Arc<str> = config.command_prefix.clone().into();

    for org_id in db.list_all_org_ids().await? {
        for integration in db.list_integrations(&org_id).await? {
            let token = match db.get_integration_auth_token(&integration.id).await {
                Ok(token) => token,
                Err(err) => {
                    tracing::warn!(%err, integration_id = %integration.id, "skipping integration with unreadable auth token");
                    continue;
                }
            };

            match integration.platform {
                ChatPlatformKind::Slack => {
                    let client: Arc<dyn ChatPlatform> = Arc::new(SlackClient::new(http_client.clone(), token));
                    platforms.insert(integration.id.clone(), client);
                }
                ChatPlatformKind::Discord => {
                    let client: Arc<dyn ChatPlatform> = Arc::new(DiscordClient::new(&token));
                    platforms.insert(integration.id.clone(), client);

                    tokio::spawn(ccbroker::platform::discord::run_gateway_session(
                        token,
                        db.clone(),
                        scheduler.clone(),
                        platforms.clone(),
                        org_id.clone(),
                        integration.id.clone(),
                        command_prefix.clone(),
                        shutdown.clone(),
                    ));
                }
            }
        }
    }

    Ok(())
}
