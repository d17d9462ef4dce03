//! Klangraum Server – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und startet den Server.

use anyhow::Result;
use klangraum_observability::logging_initialisieren;
use klangraum_server::{config::ServerConfig, Server};
use std::path::Path;

#[tokio::main]
async fn main() -> Result<()> {
    // Konfigurationsdatei-Pfad aus Umgebungsvariable oder Standard
    let config_pfad = std::env::var("KLANGRAUM_CONFIG").unwrap_or_else(|_| "klangraum.toml".into());

    let config = ServerConfig::laden(&config_pfad)?;

    logging_initialisieren(
        &config.logging.level,
        &config.logging.format,
        config.logging.datei.as_deref().map(Path::new),
    )?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        "Klangraum Server wird initialisiert"
    );

    Server::neu(config).starten().await
}
