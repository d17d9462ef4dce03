//! # klangraum-observability
//!
//! Observability-Crate fuer Klangraum:
//! - Prometheus-kompatible Metriken (`/metrics`)
//! - Health-Check-Endpunkt (`/health`)
//! - Structured Logging via tracing-subscriber (Text oder JSON, optional Datei)

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{health_router, HealthResponse, HealthState, HealthStatus};
pub use logging::{log_format_gueltig, log_level_gueltig, logging_initialisieren};
pub use metrics::{metrics_router, KlangraumMetrics, MetrikSchnappschuss};

use anyhow::Result;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

/// Startet den Observability-HTTP-Server (Metriken + Health)
///
/// Endpunkte:
/// - `GET /metrics` – Prometheus scrape format
/// - `GET /health`  – Health-Check JSON
pub async fn observability_server_starten(
    bind_addr: SocketAddr,
    metriken: KlangraumMetrics,
    health: HealthState,
) -> Result<()> {
    let app = axum::Router::new()
        .merge(metrics_router(metriken))
        .merge(health_router(health))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "Observability-Server gestartet");

    axum::serve(listener, app).await?;
    Ok(())
}
