//! Marble-Live Server
//!
//! Runs the authoritative race simulation and serves snapshots to clients over
//! WebSocket, with a small JSON API for entries and moderation.

use std::future::IntoFuture;

use anyhow::Context;
use axum::http::{Method, header};
use marble_core::config::GameConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::common::state::AppState;
use crate::config::ServerConfig;
use crate::service::results::report_results;
use crate::service::simulation::Simulation;
use crate::service::supervisor::supervise;

mod common;
mod config;
mod handler;
mod service;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = ServerConfig::from_env()?;
    let game = match &config.game_config {
        Some(path) => GameConfig::load(path)
            .with_context(|| format!("failed to load game config {}", path.display()))?,
        None => GameConfig::default(),
    };

    let (simulation, commands) = Simulation::new(game);
    let tick_loop = tokio::spawn(simulation.clone().run_tick_loop(commands));
    let reporter = tokio::spawn(report_results(simulation.subscribe()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let app = handler::app(AppState::new(simulation))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("Server listening on {addr}");
    tracing::info!("  - WebSocket: ws://{addr}/ws");
    tracing::info!("  - Round API: http://{addr}/round");

    // Any stopped background task takes the process down with it.
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result.context("server error"),
        err = supervise("tick loop", tick_loop) => Err(err),
        err = supervise("results reporter", reporter) => Err(err),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    }
}
