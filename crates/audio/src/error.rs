//! Fehlertypen fuer die Audio-Pipeline
//!
//! Defekte Payloads sind hier absichtlich kein Fehler, sie laufen als
//! `DecodeErgebnis::Verdeckt` weiter.

use thiserror::Error;

/// Alle moeglichen Fehler der Audio-Pipeline
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Frame-Laenge passt nicht: erwartet {erwartet} Samples, erhalten {erhalten}")]
    FrameLaenge { erwartet: usize, erhalten: usize },

    #[error("Block-Groesse ungueltig: {0}")]
    BlockGroesse(usize),

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("Ring-Buffer voll")]
    RingBufferVoll,

    #[error("Aufnahme-Kanal geschlossen")]
    AufnahmeGeschlossen,

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),
}

pub type AudioResult<T> = Result<T, AudioError>;
