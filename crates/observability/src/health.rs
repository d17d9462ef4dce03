//! Health-Check-Endpunkt fuer Klangraum
//!
//! Endpoint: `GET /health`
//! Response: JSON mit Status, Version, Uptime, Verbindungen und Mix-Takt

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Status des Health-Checks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Antwort des Health-Check-Endpunkts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub verbunden: usize,
    pub max_kanaele: usize,
    pub mix_takt_aktiv: bool,
}

/// Geteilter Zustand fuer den Health-Check-Handler
#[derive(Clone)]
pub struct HealthState {
    start_time: Arc<Instant>,
    verbunden: Arc<AtomicUsize>,
    max_kanaele: usize,
    mix_takt_aktiv: Arc<AtomicBool>,
}

impl HealthState {
    pub fn neu(max_kanaele: usize) -> Self {
        Self {
            start_time: Arc::new(Instant::now()),
            verbunden: Arc::new(AtomicUsize::new(0)),
            max_kanaele,
            mix_takt_aktiv: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn verbunden_setzen(&self, anzahl: usize) {
        self.verbunden.store(anzahl, Ordering::Relaxed);
    }

    pub fn mix_takt_setzen(&self, aktiv: bool) {
        self.mix_takt_aktiv.store(aktiv, Ordering::Relaxed);
    }

    pub fn antwort(&self) -> HealthResponse {
        let mix_takt_aktiv = self.mix_takt_aktiv.load(Ordering::Relaxed);
        let verbunden = self.verbunden.load(Ordering::Relaxed);
        let status = if !mix_takt_aktiv {
            HealthStatus::Unhealthy
        } else if verbunden >= self.max_kanaele {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime_seconds(),
            verbunden,
            max_kanaele: self.max_kanaele,
            mix_takt_aktiv,
        }
    }
}

/// Axum-Router fuer den `/health`-Endpunkt
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `GET /health` – gibt den Serverstatus zurueck
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let response = state.antwort();
    let http_status = match response.status {
        // Voller Server ist kein Fehler fuer den Health-Check
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(response))
}
