//! Audio-Frame – die Arbeitseinheit von Netzwerk und Mixer

use klangraum_protocol::codec::{FrameFormat, KanalAnzahl};

/// Ein Frame interleavter 16-Bit-Samples fester Laenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    kanaele: KanalAnzahl,
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Erstellt einen Frame aus vorhandenen Samples
    ///
    /// Gibt `None` zurueck wenn die Sample-Anzahl kein Vielfaches der
    /// Kanalanzahl ist.
    pub fn neu(kanaele: KanalAnzahl, samples: Vec<i16>) -> Option<Self> {
        if samples.len() % kanaele.anzahl() != 0 {
            return None;
        }
        Some(Self { kanaele, samples })
    }

    /// Stille im gegebenen Format
    pub fn stille(format: &FrameFormat) -> Self {
        Self {
            kanaele: format.kanaele,
            samples: vec![0; format.samples_gesamt()],
        }
    }

    pub fn kanaele(&self) -> KanalAnzahl {
        self.kanaele
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    /// Samples pro Kanal
    pub fn laenge(&self) -> usize {
        self.samples.len() / self.kanaele.anzahl()
    }

    /// Prueft ob der Frame exakt zum Format passt
    pub fn passt_zu(&self, format: &FrameFormat) -> bool {
        self.kanaele == format.kanaele && self.samples.len() == format.samples_gesamt()
    }

    pub fn ist_stille(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klangraum_protocol::codec::{CodecTyp, FrameGroesse};

    #[test]
    fn stille_hat_formatlaenge() {
        let format = FrameFormat::neu(FrameGroesse::Samples64, KanalAnzahl::Stereo, CodecTyp::Pcm16);
        let frame = AudioFrame::stille(&format);
        assert_eq!(frame.samples().len(), 128);
        assert_eq!(frame.laenge(), 64);
        assert!(frame.passt_zu(&format));
        assert!(frame.ist_stille());
    }

    #[test]
    fn ungerade_stereo_laenge_abgelehnt() {
        assert!(AudioFrame::neu(KanalAnzahl::Stereo, vec![1, 2, 3]).is_none());
        assert!(AudioFrame::neu(KanalAnzahl::Mono, vec![1, 2, 3]).is_some());
    }
}
