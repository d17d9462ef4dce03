//! Gemeinsame Identifikationstypen fuer Klangraum
//!
//! IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Eindeutige ID einer Verbindung (eine pro Lebensdauer, auch bei gleicher Adresse)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerbindungsId(pub Uuid);

impl VerbindungsId {
    /// Erstellt eine neue zufaellige VerbindungsId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for VerbindungsId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VerbindungsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verbindung:{}", self.0)
    }
}

/// Index eines Kanal-Slots in der Mix-Arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl SlotId {
    /// Index fuer Array-Zugriffe
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

/// Grund fuer das Ende einer Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrennGrund {
    /// Gegenstelle hat sich abgemeldet
    ClientBeendet,
    /// Kein Verkehr innerhalb des Timeouts
    Zeitueberschreitung,
    /// Vom Server-Betreiber entfernt
    Gekickt,
    /// Kein freier Kanal-Slot
    ServerVoll,
    /// Server faehrt herunter
    ServerBeendet,
}

impl std::fmt::Display for TrennGrund {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::ClientBeendet => "client_beendet",
            Self::Zeitueberschreitung => "zeitueberschreitung",
            Self::Gekickt => "gekickt",
            Self::ServerVoll => "server_voll",
            Self::ServerBeendet => "server_beendet",
        };
        f.write_str(text)
    }
}
