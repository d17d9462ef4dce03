//! Steuerungs- und Verzeichnis-Nachrichten
//!
//! Alle Nicht-Audio-Nachrichten laufen ebenfalls als einzelne Datagramme.
//!
//! ## Design
//! - JSON-Serialisierung via serde (nicht zeitkritisch)
//! - Idempotent: Duplikate und Wiederholungen sind gefahrlos verarbeitbar
//! - Laengen-Grenzen werden beim Dekodieren geprueft (`pruefen`)

use crate::codec::FrameFormat;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub use klangraum_core::types::TrennGrund;

/// Maximale Laenge von Namen (Client, Server, Stadt) in Zeichen
pub const MAX_NAME_LAENGE: usize = 32;

/// Maximale Laenge einer Chat-Nachricht in Zeichen
pub const MAX_CHAT_LAENGE: usize = 1600;

/// Maximale Anzahl Eintraege einer Server-Liste pro Datagramm
pub const MAX_LISTEN_EINTRAEGE: usize = 200;

fn laenge_pruefen(feld: &str, wert: &str, max: usize) -> Result<(), String> {
    let laenge = wert.chars().count();
    if laenge > max {
        return Err(format!("{feld} zu lang: {laenge} Zeichen (Maximum {max})"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Verbindungsaufbau
// ---------------------------------------------------------------------------

/// Handshake des Clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verbinden {
    pub client_name: String,
    /// Frame-Format, in dem der Client sendet und empfangen will
    pub format: FrameFormat,
}

/// Antwort des Servers auf einen akzeptierten Handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerbindungBestaetigt {
    /// Zugewiesener Kanal-Slot
    pub slot: u16,
    /// Bestaetigtes Frame-Format der Verbindung
    pub format: FrameFormat,
    /// Willkommensnachricht des Servers
    pub willkommen: Option<String>,
}

/// Abmeldung (Client → Server) oder Ablehnung (Server → Client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trennen {
    pub grund: TrennGrund,
}

/// Entfernung durch den Server-Betreiber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kick {
    pub grund: Option<String>,
}

// ---------------------------------------------------------------------------
// Kanal-Informationen
// ---------------------------------------------------------------------------

/// Selbstauskunft eines Clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KanalInfo {
    pub name: String,
    pub stadt: String,
    /// Laendercode (numerisch)
    pub land: u16,
    pub instrument: Option<String>,
}

/// Ein Eintrag der verteilten Teilnehmerliste
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KanalEintrag {
    pub slot: u16,
    pub info: KanalInfo,
}

/// Lautstaerke und Panorama, die der Sender dieser Nachricht fuer den Slot
/// `quelle` in seinem eigenen Mix hoeren will
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainSetzen {
    pub quelle: u16,
    /// Linearer Faktor, 0.0 = stumm, 1.0 = unveraendert
    pub gain: f32,
    /// 0.0 = links, 0.5 = Mitte, 1.0 = rechts
    pub pan: f32,
}

// ---------------------------------------------------------------------------
// Chat & Ping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatNachricht {
    pub text: String,
}

/// Ping bzw. Ping-Antwort (der Zeitstempel wird unveraendert gespiegelt)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub zeitstempel_ms: u64,
}

// ---------------------------------------------------------------------------
// Lizenz
// ---------------------------------------------------------------------------

/// Art der Lizenz, der ein Client vor dem Mischen zustimmen muss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LizenzTyp {
    CreativeCommons,
}

// ---------------------------------------------------------------------------
// Verzeichnis
// ---------------------------------------------------------------------------

/// Identitaet eines Servers, wie er sich beim Verzeichnis anmeldet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub stadt: String,
    pub land: u16,
    pub max_kanaele: u16,
}

/// Ein Datensatz der Server-Liste (Reihenfolge bleibt erhalten)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListenEintrag {
    pub adresse: SocketAddr,
    pub name: String,
    pub stadt: String,
    pub land: u16,
    pub kanaele: u16,
}

// ---------------------------------------------------------------------------
// Pruefungen
// ---------------------------------------------------------------------------

impl Verbinden {
    pub fn pruefen(&self) -> Result<(), String> {
        laenge_pruefen("Client-Name", &self.client_name, MAX_NAME_LAENGE)
    }
}

impl KanalInfo {
    pub fn pruefen(&self) -> Result<(), String> {
        laenge_pruefen("Name", &self.name, MAX_NAME_LAENGE)?;
        laenge_pruefen("Stadt", &self.stadt, MAX_NAME_LAENGE)?;
        if let Some(instrument) = &self.instrument {
            laenge_pruefen("Instrument", instrument, MAX_NAME_LAENGE)?;
        }
        Ok(())
    }
}

impl ChatNachricht {
    pub fn pruefen(&self) -> Result<(), String> {
        laenge_pruefen("Chat-Text", &self.text, MAX_CHAT_LAENGE)
    }
}

impl GainSetzen {
    pub fn pruefen(&self) -> Result<(), String> {
        if !self.gain.is_finite() || self.gain < 0.0 {
            return Err(format!("Ungueltiger Gain: {}", self.gain));
        }
        if !self.pan.is_finite() || !(0.0..=1.0).contains(&self.pan) {
            return Err(format!("Ungueltiges Panorama: {}", self.pan));
        }
        Ok(())
    }
}

impl ServerInfo {
    pub fn pruefen(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Server-Name darf nicht leer sein".into());
        }
        laenge_pruefen("Server-Name", &self.name, MAX_NAME_LAENGE)?;
        laenge_pruefen("Stadt", &self.stadt, MAX_NAME_LAENGE)
    }
}
