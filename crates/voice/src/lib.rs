//! klangraum-voice – Echtzeit-Audio
//!
//! Vom Datagramm bis zum persoenlichen Mix.
//!
//! ## Module
//! - [`jitter_buffer`] – Adaptiver Jitter Buffer pro Verbindung und Richtung
//! - [`mixer`] – Slot-Arena und Mix-Engine mit Mix pro Hoerer
//! - [`takt`] – Mix-Takt auf eigenem OS-Thread
//! - [`udp`] – UDP-Server: Empfang, Dispatch, Sende-Queue
//! - [`state`] – Verbindungs-Register
//! - [`lizenz`] – Lizenz-Tor vor dem Mischen
//! - [`aufnahme`] – Nicht-blockierende Aufnahme-Weiche
//! - [`client`] – Client-Engine fuer den Audio-Treiber

pub mod aufnahme;
pub mod client;
pub mod jitter_buffer;
pub mod lizenz;
pub mod mixer;
pub mod state;
pub mod takt;
pub mod udp;

pub use aufnahme::{Aufnahme, AufnahmeFrame, AufnahmeWeiche};
pub use client::{ClientConfig, ClientEreignis, KlangraumClient};
pub use jitter_buffer::{AdaptiveJitterBuffer, JitterBufferConfig, JitterBufferModus};
pub use lizenz::{LizenzStatus, LizenzTor};
pub use mixer::{MixConfig, MixEngine, MixStatistik, MAX_NUM_CHANNELS};
pub use state::{VerbindungsRegister, VERBINDUNGS_TIMEOUT};
pub use takt::MixTakt;
pub use udp::{VoiceServer, VoiceServerConfig, VoiceStatistik};
