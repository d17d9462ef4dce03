//! Frame-Format einer Verbindung
//!
//! Wird beim Handshake (`Verbinden`) festgelegt und bleibt fuer die
//! Lebensdauer der Verbindung konstant. Aenderungen erfordern einen neuen
//! Handshake.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Feste Abtastrate des gesamten Systems
pub const SAMPLE_RATE: u32 = 48_000;

// ---------------------------------------------------------------------------
// Frame-Groesse
// ---------------------------------------------------------------------------

/// Samples pro Kanal und Frame
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameGroesse {
    /// 64 Samples (1,33 ms bei 48 kHz) – minimale Latenz
    Samples64 = 64,
    /// 128 Samples (2,67 ms bei 48 kHz) – Standard
    #[default]
    Samples128 = 128,
}

impl FrameGroesse {
    /// Samples pro Kanal
    pub fn samples(&self) -> usize {
        *self as usize
    }

    /// Dauer eines Frames bei `SAMPLE_RATE`
    pub fn dauer(&self) -> Duration {
        Duration::from_nanos(self.samples() as u64 * 1_000_000_000 / SAMPLE_RATE as u64)
    }

    /// Parst eine Sample-Anzahl (nur 64 und 128 sind gueltig)
    pub fn aus_samples(samples: usize) -> Option<Self> {
        match samples {
            64 => Some(Self::Samples64),
            128 => Some(Self::Samples128),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Kanalanzahl
// ---------------------------------------------------------------------------

/// Anzahl der Audio-Kanaele einer Verbindung
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanalAnzahl {
    #[default]
    Mono = 1,
    Stereo = 2,
}

impl KanalAnzahl {
    pub fn anzahl(&self) -> usize {
        *self as usize
    }
}

// ---------------------------------------------------------------------------
// Codec-Typ
// ---------------------------------------------------------------------------

/// Kompressionsverfahren fuer die Audio-Nutzdaten
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecTyp {
    /// Unkomprimiert, 16 Bit big-endian
    Pcm16,
    /// IMA-ADPCM, 4 Bit pro Sample
    #[default]
    ImaAdpcm,
}

// ---------------------------------------------------------------------------
// FrameFormat
// ---------------------------------------------------------------------------

/// Vollstaendige Audio-Parameter einer Verbindung
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameFormat {
    pub groesse: FrameGroesse,
    pub kanaele: KanalAnzahl,
    pub codec: CodecTyp,
}

impl FrameFormat {
    pub fn neu(groesse: FrameGroesse, kanaele: KanalAnzahl, codec: CodecTyp) -> Self {
        Self {
            groesse,
            kanaele,
            codec,
        }
    }

    /// Anzahl interleavter Samples eines Frames (alle Kanaele)
    pub fn samples_gesamt(&self) -> usize {
        self.groesse.samples() * self.kanaele.anzahl()
    }

    /// Dauer eines Frames
    pub fn frame_dauer(&self) -> Duration {
        self.groesse.dauer()
    }

    /// Exakte Laenge der kodierten Nutzdaten eines Frames in Bytes
    ///
    /// ADPCM: pro Kanal 4 Byte Blockkopf (Startwert + Schrittindex),
    /// danach zwei Samples pro Byte fuer die restlichen `n - 1` Samples.
    pub fn nutzdaten_laenge(&self) -> usize {
        let n = self.groesse.samples();
        let k = self.kanaele.anzahl();
        match self.codec {
            CodecTyp::Pcm16 => n * k * 2,
            CodecTyp::ImaAdpcm => k * (4 + n.saturating_sub(1).div_ceil(2)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_groesse_samples_und_dauer() {
        assert_eq!(FrameGroesse::Samples64.samples(), 64);
        assert_eq!(FrameGroesse::Samples128.samples(), 128);
        // 128 / 48000 s = 2,666 ms
        assert_eq!(FrameGroesse::Samples128.dauer().as_micros(), 2666);
    }

    #[test]
    fn frame_groesse_parsen() {
        assert_eq!(FrameGroesse::aus_samples(64), Some(FrameGroesse::Samples64));
        assert_eq!(FrameGroesse::aus_samples(256), None);
    }

    #[test]
    fn nutzdaten_laenge_pcm_und_adpcm() {
        let pcm = FrameFormat::neu(FrameGroesse::Samples64, KanalAnzahl::Stereo, CodecTyp::Pcm16);
        assert_eq!(pcm.nutzdaten_laenge(), 64 * 2 * 2);

        let adpcm = FrameFormat::neu(FrameGroesse::Samples128, KanalAnzahl::Mono, CodecTyp::ImaAdpcm);
        // 4 Byte Kopf + ceil(127 / 2) = 64 Byte
        assert_eq!(adpcm.nutzdaten_laenge(), 68);
    }

    #[test]
    fn format_serde_roundtrip() {
        let format = FrameFormat::default();
        let json = serde_json::to_string(&format).unwrap();
        assert!(json.contains("\"samples128\""));
        let zurueck: FrameFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck, format);
    }
}
