//! klangraum-protocol – Netzwerkprotokoll-Definitionen
//!
//! Dieses Crate definiert alle Nachrichtentypen, die zwischen Client,
//! Server und Verzeichnis als UDP-Datagramme ausgetauscht werden.

pub mod codec;
pub mod control;
pub mod voice;
pub mod wire;

pub use codec::{CodecTyp, FrameFormat, FrameGroesse, KanalAnzahl, SAMPLE_RATE};
pub use voice::AudioPaket;
pub use wire::{DatagrammCodec, Nachricht, WireFehler};
