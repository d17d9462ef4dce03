//! Fehlertypen fuer das Session-Crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SitzungsFehler {
    #[error("Ungueltige Eingabe: {0}")]
    UngueltigeEingabe(String),

    #[error("Ungueltiger Server-Info-Text: {0}")]
    ServerInfo(String),

    #[error("Serialisierung fehlgeschlagen: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

pub type SitzungsResult<T> = Result<T, SitzungsFehler>;
