//! Prometheus-kompatible Metriken fuer Klangraum
//!
//! Registrierte Metriken:
//! - `klangraum_connected_clients` – Gauge: Aktuell verbundene Clients
//! - `klangraum_directory_servers` – Gauge: Beim Verzeichnis angemeldete Server
//! - `klangraum_mix_ticks_total` – Counter: Mix-Takte
//! - `klangraum_mix_overload_ticks_total` – Counter: Takte mit Lastabwurf
//! - `klangraum_shed_inputs_total` – Counter: Abgeworfene Eingaenge
//! - `klangraum_concealed_frames_total` – Counter: Verdeckte Frames
//! - `klangraum_clipped_samples_total` – Counter: Uebersteuerte Samples
//! - `klangraum_discarded_datagrams_total` – Counter: Verworfene Datagramme
//! - `klangraum_send_dropped_total` – Counter: Wegen voller Queue nicht gesendet
//! - `klangraum_jitter_seconds` – Histogram: Geschaetzter Jitter pro Verbindung
//!
//! Die Zaehler im Mix-Pfad sind Atomics; der Server uebertraegt sie
//! periodisch per [`KlangraumMetrics::uebernehmen`].

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Zaehlerstaende zum Zeitpunkt einer Abfrage
#[derive(Debug, Clone, Default)]
pub struct MetrikSchnappschuss {
    pub verbunden: usize,
    pub verzeichnis_server: usize,
    pub mix_ticks: u64,
    pub ueberlast_ticks: u64,
    pub abgeworfene_eingaenge: u64,
    pub verdeckte_frames: u64,
    pub uebersteuerte_samples: u64,
    pub verworfene_datagramme: u64,
    pub sende_verworfen: u64,
    /// Jitter pro Verbindung in Millisekunden
    pub jitter_ms: Vec<f64>,
}

/// Alle Klangraum-Prometheus-Metriken
#[derive(Clone)]
pub struct KlangraumMetrics {
    pub registry: Arc<Registry>,

    pub connected_clients: IntGauge,
    pub directory_servers: IntGauge,
    pub mix_ticks_total: IntCounter,
    pub mix_overload_ticks_total: IntCounter,
    pub shed_inputs_total: IntCounter,
    pub concealed_frames_total: IntCounter,
    pub clipped_samples_total: IntCounter,
    pub discarded_datagrams_total: IntCounter,
    pub send_dropped_total: IntCounter,
    pub jitter_seconds: Histogram,
}

impl KlangraumMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let gauge = |name: &str, hilfe: &str| -> Result<IntGauge> {
            let g = IntGauge::with_opts(Opts::new(name, hilfe))?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let counter = |name: &str, hilfe: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, hilfe))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let connected_clients = gauge(
            "klangraum_connected_clients",
            "Anzahl aktuell verbundener Clients",
        )?;
        let directory_servers = gauge(
            "klangraum_directory_servers",
            "Beim Verzeichnis angemeldete Server",
        )?;
        let mix_ticks_total = counter("klangraum_mix_ticks_total", "Anzahl Mix-Takte")?;
        let mix_overload_ticks_total = counter(
            "klangraum_mix_overload_ticks_total",
            "Mix-Takte, in denen Last abgeworfen wurde",
        )?;
        let shed_inputs_total = counter(
            "klangraum_shed_inputs_total",
            "Wegen Ueberlast nur verdeckte Eingaenge",
        )?;
        let concealed_frames_total = counter(
            "klangraum_concealed_frames_total",
            "Durch Verdeckung ersetzte Frames",
        )?;
        let clipped_samples_total = counter(
            "klangraum_clipped_samples_total",
            "Beim Mischen begrenzte Samples",
        )?;
        let discarded_datagrams_total = counter(
            "klangraum_discarded_datagrams_total",
            "Ungueltige oder unerwartete Datagramme",
        )?;
        let send_dropped_total = counter(
            "klangraum_send_dropped_total",
            "Wegen voller Sende-Queue verworfene Datagramme",
        )?;

        let jitter_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "klangraum_jitter_seconds",
                "Geschaetzter Jitter pro Verbindung in Sekunden",
            )
            .buckets(vec![0.0005, 0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1]),
        )?;
        registry.register(Box::new(jitter_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            connected_clients,
            directory_servers,
            mix_ticks_total,
            mix_overload_ticks_total,
            shed_inputs_total,
            concealed_frames_total,
            clipped_samples_total,
            discarded_datagrams_total,
            send_dropped_total,
            jitter_seconds,
        })
    }

    /// Uebernimmt Zaehlerstaende; Counter wachsen nur um die Differenz
    pub fn uebernehmen(&self, s: &MetrikSchnappschuss) {
        self.connected_clients.set(s.verbunden as i64);
        self.directory_servers.set(s.verzeichnis_server as i64);
        nachziehen(&self.mix_ticks_total, s.mix_ticks);
        nachziehen(&self.mix_overload_ticks_total, s.ueberlast_ticks);
        nachziehen(&self.shed_inputs_total, s.abgeworfene_eingaenge);
        nachziehen(&self.concealed_frames_total, s.verdeckte_frames);
        nachziehen(&self.clipped_samples_total, s.uebersteuerte_samples);
        nachziehen(&self.discarded_datagrams_total, s.verworfene_datagramme);
        nachziehen(&self.send_dropped_total, s.sende_verworfen);
        for ms in &s.jitter_ms {
            self.jitter_seconds.observe(ms / 1000.0);
        }
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn nachziehen(counter: &IntCounter, stand: u64) {
    let bisher = counter.get();
    if stand > bisher {
        counter.inc_by(stand - bisher);
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: KlangraumMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(State(metriken): State<KlangraumMetrics>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            axum::http::StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metriken_erstellen_erfolgreich() {
        let metriken = KlangraumMetrics::neu().unwrap();
        assert!(!metriken.registry.gather().is_empty());
    }

    #[test]
    fn uebernehmen_zieht_counter_nach() {
        let metriken = KlangraumMetrics::neu().unwrap();
        let mut s = MetrikSchnappschuss {
            verbunden: 3,
            mix_ticks: 100,
            verdeckte_frames: 4,
            ..Default::default()
        };
        metriken.uebernehmen(&s);
        s.mix_ticks = 250;
        s.verbunden = 2;
        metriken.uebernehmen(&s);

        assert_eq!(metriken.connected_clients.get(), 2);
        assert_eq!(metriken.mix_ticks_total.get(), 250);
        assert_eq!(metriken.concealed_frames_total.get(), 4);
    }

    #[test]
    fn jitter_wird_in_sekunden_beobachtet() {
        let metriken = KlangraumMetrics::neu().unwrap();
        metriken.uebernehmen(&MetrikSchnappschuss {
            jitter_ms: vec![1.5, 3.0],
            ..Default::default()
        });
        assert_eq!(metriken.jitter_seconds.get_sample_count(), 2);
        assert!((metriken.jitter_seconds.get_sample_sum() - 0.0045).abs() < 1e-9);
    }

    #[test]
    fn metriken_export_prometheus_format() {
        let metriken = KlangraumMetrics::neu().unwrap();
        metriken.connected_clients.set(5);
        metriken.mix_ticks_total.inc();

        let output = metriken.exportieren().unwrap();
        assert!(output.contains("klangraum_connected_clients 5"));
        assert!(output.contains("klangraum_mix_ticks_total 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
