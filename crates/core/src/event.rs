//! Sitzungs-Ereignisse
//!
//! Der UDP-Task meldet Lebenszyklus-Uebergaenge der Verbindungen ueber einen
//! tokio-broadcast-Kanal. Abonnenten sind Historie und Status-Schnappschuss.

use crate::types::{SlotId, TrennGrund, VerbindungsId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Alle Lebenszyklus-Ereignisse einer Verbindung
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SitzungsEreignis {
    /// Handshake akzeptiert, Slot vergeben (Phase `Verbindend`)
    Verbunden {
        id: VerbindungsId,
        adresse: SocketAddr,
        name: String,
        slot: SlotId,
    },
    /// Erstes Audio-Frame empfangen (Phase `Aktiv`)
    Aktiviert { id: VerbindungsId, slot: SlotId },
    /// Verbindung beendet (Phase `Getrennt`)
    Getrennt {
        id: VerbindungsId,
        adresse: SocketAddr,
        name: String,
        verbunden_um: DateTime<Utc>,
        dauer_s: u64,
        /// War die Verbindung vor dem Trennen `Aktiv`?
        war_aktiv: bool,
        grund: TrennGrund,
    },
}

impl SitzungsEreignis {
    /// Verbindungs-ID des Ereignisses
    pub fn verbindung(&self) -> VerbindungsId {
        match self {
            Self::Verbunden { id, .. } | Self::Aktiviert { id, .. } | Self::Getrennt { id, .. } => {
                *id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ereignis_ist_serde_kompatibel() {
        let id = VerbindungsId::new();
        let event = SitzungsEreignis::Getrennt {
            id,
            adresse: "127.0.0.1:22134".parse().unwrap(),
            name: "Bass".into(),
            verbunden_um: Utc::now(),
            dauer_s: 42,
            war_aktiv: true,
            grund: TrennGrund::ClientBeendet,
        };
        let json = serde_json::to_string(&event).unwrap();
        let zurueck: SitzungsEreignis = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck.verbindung(), id);
    }
}
