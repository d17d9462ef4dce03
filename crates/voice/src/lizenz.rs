//! Lizenz-Tor pro Verbindung
//!
//! Solange eine Verbindung nicht zugestimmt hat, ist ihr Audio aus allen
//! Mixen ausgeschlossen und sie selbst hoert nur Stille. Steuernachrichten
//! laufen weiter, sonst koennte die Zustimmung nie ankommen.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LizenzStatus {
    NichtAkzeptiert,
    Akzeptiert,
    NichtErforderlich,
}

/// Server-weite Lizenz-Einstellung
#[derive(Debug, Clone, Copy, Default)]
pub struct LizenzTor {
    erforderlich: bool,
}

impl LizenzTor {
    pub fn neu(erforderlich: bool) -> Self {
        Self { erforderlich }
    }

    pub fn ist_erforderlich(&self) -> bool {
        self.erforderlich
    }

    /// Status einer frisch verbundenen Verbindung
    pub fn anfangs_status(&self) -> LizenzStatus {
        if self.erforderlich {
            LizenzStatus::NichtAkzeptiert
        } else {
            LizenzStatus::NichtErforderlich
        }
    }

    /// Verarbeitet eine Zustimmung
    ///
    /// Gibt `true` zurueck wenn sich der Status geaendert hat. Wiederholte
    /// Zustimmungen sind wirkungslos.
    pub fn akzeptieren(&self, status: &mut LizenzStatus) -> bool {
        match status {
            LizenzStatus::NichtAkzeptiert => {
                *status = LizenzStatus::Akzeptiert;
                true
            }
            LizenzStatus::Akzeptiert | LizenzStatus::NichtErforderlich => false,
        }
    }

    pub fn darf_gemischt_werden(status: LizenzStatus) -> bool {
        !matches!(status, LizenzStatus::NichtAkzeptiert)
    }
}
