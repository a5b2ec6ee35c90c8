mod logging;
mod routes;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use autoboard_core::{config::Config, service::AutoModeService, worktree::WorktreeRegistry};
use autoboard_gateway::{spawn_event_stream, HttpGateway};
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::routes::*;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub service: Arc<AutoModeService>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Projects
        .route("/api/projects", post(open_project))
        .route("/api/projects/:id", delete(close_project))
        .route("/api/projects/:id/active", post(set_active))
        // Auto mode
        .route("/api/projects/:id/auto-mode", get(get_auto_mode))
        .route("/api/projects/:id/auto-mode/start", post(start_auto_mode))
        .route("/api/projects/:id/auto-mode/stop", post(stop_auto_mode))
        .route("/api/projects/:id/auto-mode/tick", post(tick))
        // Features
        .route("/api/projects/:id/features", get(list_features).put(put_features))
        .route("/api/projects/:id/features/:fid/stop", post(stop_feature))
        .route("/api/projects/:id/features/:fid/resume", post(resume_feature))
        .route("/api/projects/:id/features/:fid/follow-up", post(follow_up_feature))
        .route("/api/projects/:id/features/:fid/approve-plan", post(approve_plan))
        // Worktrees
        .route("/api/projects/:id/worktrees", put(put_worktrees))
        // Streams
        .route("/api/projects/:id/activity", get(sse_activity))
        .route("/api/events", get(sse_board_events))
        .route("/api/logs", get(sse_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _log_rx) = broadcast::channel::<String>(256);
    let log_ring = Arc::new(Mutex::new(VecDeque::with_capacity(logging::LOG_RING_SIZE)));

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "autoboard_server=info,autoboard_core=info,autoboard_gateway=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(logging::BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;

    let gateway = Arc::new(HttpGateway::new(
        config.gateway_url.clone(),
        Duration::from_secs(config.gateway_timeout_s),
    )?);
    let service = AutoModeService::new(
        config.service_options(),
        Arc::new(WorktreeRegistry::new()),
        gateway.clone(),
        gateway.clone(),
    );
    service.set_active_project(config.active_project.clone());

    // Router before the stream so no event is published without a subscriber.
    service.spawn_event_router();
    spawn_event_stream(&gateway);

    match service.restore().await {
        Ok(n) if n > 0 => info!("restored auto mode for {n} project(s)"),
        Ok(_) => {}
        Err(e) => warn!("could not restore auto-mode state: {e:#}"),
    }

    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!(gateway = %config.gateway_url, "Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
