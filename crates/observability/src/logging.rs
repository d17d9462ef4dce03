//! Structured Logging Setup via tracing-subscriber
//!
//! Konfigurierbar per Umgebungsvariable (hat Vorrang vor der Config-Datei):
//! - `KLANGRAUM_LOG_LEVEL`: Filter (trace/debug/info/warn/error oder EnvFilter-Syntax)
//! - `KLANGRAUM_LOG_FORMAT`: Format (text/json)
//!
//! Mit `datei` gehen die Logs zusaetzlich ohne ANSI-Farben in eine Datei.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const ENV_LOG_LEVEL: &str = "KLANGRAUM_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "KLANGRAUM_LOG_FORMAT";

/// Initialisiert das Logging-System.
///
/// Faellt auf `info` zurueck, wenn der Filter nicht parsebar ist.
pub fn logging_initialisieren(level: &str, format: &str, datei: Option<&Path>) -> Result<()> {
    let filter = || {
        EnvFilter::try_from_env(ENV_LOG_LEVEL)
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let format = std::env::var(ENV_LOG_FORMAT).unwrap_or_else(|_| format.to_string());
    let json = format == "json";

    let konsole = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true)
            .with_filter(filter())
            .boxed()
    } else {
        fmt::layer().with_target(true).with_filter(filter()).boxed()
    };

    let datei_layer = match datei {
        Some(pfad) => {
            if let Some(parent) = pfad.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Log-Verzeichnis {} nicht anlegbar", parent.display()))?;
            }
            let datei = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(pfad)
                .with_context(|| format!("Log-Datei {} nicht oeffenbar", pfad.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(datei));
            Some(if json {
                layer.json().with_filter(filter()).boxed()
            } else {
                layer.with_filter(filter()).boxed()
            })
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(konsole)
        .with(datei_layer)
        .try_init()
        .context("Logging bereits initialisiert")?;
    Ok(())
}

/// Validiert ob ein Log-Level-String gueltig ist.
pub fn log_level_gueltig(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}

/// Validiert ob ein Log-Format-String gueltig ist.
pub fn log_format_gueltig(format: &str) -> bool {
    matches!(format, "text" | "json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_gueltige_werte() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(log_level_gueltig(level), "{level}");
        }
    }

    #[test]
    fn log_level_ungueltige_werte() {
        assert!(!log_level_gueltig("verbose"));
        assert!(!log_level_gueltig("INFO")); // Gross-/Kleinschreibung
        assert!(!log_level_gueltig(""));
    }

    #[test]
    fn log_format_werte() {
        assert!(log_format_gueltig("text"));
        assert!(log_format_gueltig("json"));
        assert!(!log_format_gueltig("xml"));
        assert!(!log_format_gueltig("JSON"));
    }

    #[test]
    fn logging_mit_datei() {
        let dir = tempfile::tempdir().unwrap();
        let pfad = dir.path().join("logs").join("klangraum.log");
        logging_initialisieren("info", "text", Some(&pfad)).unwrap();
        tracing::info!("Testeintrag");
        assert!(pfad.exists());

        // Zweite Initialisierung schlaegt fehl statt zu paniken
        assert!(logging_initialisieren("info", "text", None).is_err());
    }
}
