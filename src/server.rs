//! Service assembly and HTTP serving.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::config::SwitchboardConfig;
use crate::dispatch::{EffectSenders, HttpEffectSender};
use crate::engine::{EngineSet, HttpEngine};
use crate::events;
use crate::models::{EffectChannel, Stage};
use crate::store::{CallStore, StoreHandle};

/// Build the full application router with API and WebSocket event stream.
pub fn build_router(state: SharedState) -> Router {
    let events_tx = state.events.clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| events::ws_handler(ws_upgrade, events_tx)),
        )
        .with_state(state)
}

/// Wire HTTP engines and effect senders from config.
pub fn build_state(config: &SwitchboardConfig, store: StoreHandle) -> SharedState {
    let engines = EngineSet {
        transcribe: Arc::new(HttpEngine::new(
            Stage::Transcribe,
            &config.engines.transcribe_url,
            &config.engines.transcribe_version,
        )),
        analyze: Arc::new(HttpEngine::new(
            Stage::Analyze,
            &config.engines.analyze_url,
            &config.engines.analyze_version,
        )),
        infer: Arc::new(HttpEngine::new(
            Stage::Infer,
            &config.engines.infer_url,
            &config.engines.infer_version,
        )),
        decide: Arc::new(HttpEngine::new(
            Stage::Decide,
            &config.engines.decide_url,
            &config.engines.decide_version,
        )),
    };
    let senders = EffectSenders {
        email: Arc::new(HttpEffectSender::new(
            EffectChannel::Email,
            &config.effects.email_url,
        )),
        crm: Arc::new(HttpEffectSender::new(
            EffectChannel::Crm,
            &config.effects.crm_url,
        )),
    };

    Arc::new(AppState::new(
        store,
        engines,
        senders,
        config.retry.clone(),
        config.pipeline.persist_debug_artifacts,
    ))
}

/// Start the orchestrator service.
pub async fn start_server(config: SwitchboardConfig) -> Result<()> {
    if let Some(parent) = config.server.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = StoreHandle::new(
        CallStore::new(&config.server.db_path).context("Failed to initialize call store")?,
    );

    let state = build_state(&config, store);
    let mut app = build_router(state);

    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!("switchboard listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutting down");
}
