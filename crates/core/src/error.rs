//! Fehlertypen fuer Klangraum
//!
//! Zentraler Fehler-Enum fuer alle Zustaende, die tatsaechlich bis zum
//! Aufrufer durchgereicht werden. Netzwerk-Anomalien (Verlust, Jitter,
//! Umordnung) tauchen hier nicht auf: sie werden im Jitter Buffer
//! verdeckt und sind nie ein Fehler.

use thiserror::Error;

/// Globaler Result-Alias fuer Klangraum
pub type Result<T> = std::result::Result<T, KlangraumError>;

/// Alle moeglichen Fehler im Klangraum-System
#[derive(Debug, Error)]
pub enum KlangraumError {
    // --- Verbindung & Netzwerk ---
    #[error("Verbindung fehlgeschlagen: {0}")]
    Verbindung(String),

    #[error("Verbindung getrennt: {0}")]
    Getrennt(String),

    #[error("Zeitlimit ueberschritten: {0}")]
    Zeitlimit(String),

    // --- Protokoll ---
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    #[error("Protokollversion nicht unterstuetzt: erwartet={erwartet}, erhalten={erhalten}")]
    ProtokollVersion { erwartet: u8, erhalten: u8 },

    // --- Ressourcen ---
    #[error("Server voll: alle {max} Kanal-Slots belegt")]
    ServerVoll { max: usize },

    #[error("Kanal-Slot {0} ist nicht belegt")]
    SlotFrei(u16),

    #[error("Unbekannte Gegenstelle: {0}")]
    UnbekannteAdresse(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Audio ---
    #[error("Audiofehler: {0}")]
    Audio(String),

    // --- Persistenz ---
    #[error("Speicherfehler: {0}")]
    Speicher(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl KlangraumError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler wiederholbar sein koennte
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(
            self,
            Self::Zeitlimit(_) | Self::Verbindung(_) | Self::Getrennt(_) | Self::ServerVoll { .. }
        )
    }
}
