//! klangraum-session – Sitzungs-Buchhaltung
//!
//! Verbindungs-Historie, Server-Verzeichnis (Liste und Anmelde-Dienst),
//! Server-Info-Text und Status-Schnappschuss. Das Crate haelt keinen
//! Socket; der UDP-Task spricht ueber Kanaele mit dem Verzeichnis-Dienst.

pub mod directory;
pub mod error;
pub mod history;
pub mod serverinfo;
pub mod status;

pub use directory::{
    ServerListe, VerzeichnisAuftrag, VerzeichnisConfig, VerzeichnisDienst, VerzeichnisEintrag,
    VerzeichnisEreignis, PING_INTERVALL, REGISTRIERUNGS_INTERVALL,
};
pub use error::{SitzungsFehler, SitzungsResult};
pub use history::{
    historie_fuehren, Historie, HistorienEintrag, HistorienSpeicher, JsonZeilenSpeicher,
    SpeicherHistorie, STANDARD_TAGE, TAGE_BEREICH,
};
pub use serverinfo::{ServerKennung, STANDARD_PORT};
pub use status::{JsonDateiSenke, ServerStatus, StatusSenke, Teilnehmer};
