//! klangraum-core – Gemeinsame Typen, Ereignisse und Fehlertypen
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen Klangraum-Crates gemeinsam genutzt werden.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{KlangraumError, Result};
pub use event::SitzungsEreignis;
pub use types::{SlotId, TrennGrund, VerbindungsId};
