//! klangraum-audio – Sample-Ebene der Jam-Engine
//!
//! - Frames fester Laenge (64/128 Samples, Mono/Stereo, i16)
//! - Codecs: PCM16 und IMA-ADPCM hinter `FrameCodec`
//! - Verdeckung fehlender oder defekter Frames
//! - Block-Adapter zwischen Treiber-Callbacks und Netzwerk-Frames
//! - Gain/Pan pro Hoerer-Paar mit Begrenzung

pub mod adapter;
pub mod codec;
pub mod error;
pub mod frame;
pub mod plc;
pub mod volume;

pub use adapter::BlockAdapter;
pub use codec::{codec_erstellen, FrameCodec, FrameDecoder, ImaAdpcmCodec, Pcm16Codec};
pub use error::{AudioError, AudioResult};
pub use frame::AudioFrame;
pub use plc::{DecodeErgebnis, PlcStatistik, VerdeckungsArt, VerdeckungsGrund, Verdecker};
pub use volume::{begrenzen, mischen_in, KanalGain};
