//! Frame-Codecs: PCM16 und IMA-ADPCM
//!
//! Beide Codecs arbeiten auf genau einem Frame fester Laenge und haben eine
//! vom Inhalt unabhaengige Laufzeit (eine Schleife ueber alle Samples).
//! Die kodierte Laenge ist durch das `FrameFormat` fest vorgegeben, jede
//! andere Laenge gilt beim Dekodieren als defekt.
//!
//! ## ADPCM-Block pro Kanal
//!
//! ```text
//! Offset  Len  Beschreibung
//!  0       2   Startwert = erstes Sample (i16 big-endian)
//!  2       1   Schrittindex (0..=88)
//!  3       1   Reserviert (0)
//!  4       M   Nibbles fuer Sample 1..n, unteres Nibble zuerst
//! ```

use crate::error::{AudioError, AudioResult};
use crate::frame::AudioFrame;
use crate::plc::{DecodeErgebnis, PlcStatistik, Verdecker, VerdeckungsGrund};
use klangraum_protocol::codec::{CodecTyp, FrameFormat};

// ---------------------------------------------------------------------------
// FrameCodec-Trait
// ---------------------------------------------------------------------------

/// Kodiert und dekodiert genau einen Frame
pub trait FrameCodec: Send {
    /// Format, fuer das dieser Codec erstellt wurde
    fn format(&self) -> &FrameFormat;

    /// Kodiert einen Frame
    ///
    /// # Fehler
    /// `FrameLaenge` wenn der Frame nicht exakt zum Format passt.
    fn encode(&mut self, frame: &AudioFrame) -> AudioResult<Vec<u8>>;

    /// Dekodiert eine Payload; `None` wenn sie beschaedigt ist
    fn decode(&mut self, daten: &[u8]) -> Option<AudioFrame>;
}

/// Erstellt den passenden Codec fuer ein Format
pub fn codec_erstellen(format: FrameFormat) -> Box<dyn FrameCodec> {
    match format.codec {
        CodecTyp::Pcm16 => Box::new(Pcm16Codec::neu(format)),
        CodecTyp::ImaAdpcm => Box::new(ImaAdpcmCodec::neu(format)),
    }
}

fn laenge_pruefen(format: &FrameFormat, frame: &AudioFrame) -> AudioResult<()> {
    if frame.passt_zu(format) {
        Ok(())
    } else {
        Err(AudioError::FrameLaenge {
            erwartet: format.samples_gesamt(),
            erhalten: frame.samples().len(),
        })
    }
}

// ---------------------------------------------------------------------------
// PCM16
// ---------------------------------------------------------------------------

/// Unkomprimierte 16-Bit-Samples (big-endian)
pub struct Pcm16Codec {
    format: FrameFormat,
}

impl Pcm16Codec {
    pub fn neu(format: FrameFormat) -> Self {
        Self { format }
    }
}

impl FrameCodec for Pcm16Codec {
    fn format(&self) -> &FrameFormat {
        &self.format
    }

    fn encode(&mut self, frame: &AudioFrame) -> AudioResult<Vec<u8>> {
        laenge_pruefen(&self.format, frame)?;
        let mut out = Vec::with_capacity(self.format.nutzdaten_laenge());
        for s in frame.samples() {
            out.extend_from_slice(&s.to_be_bytes());
        }
        Ok(out)
    }

    fn decode(&mut self, daten: &[u8]) -> Option<AudioFrame> {
        if daten.len() != self.format.nutzdaten_laenge() {
            return None;
        }
        let samples = daten
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .collect();
        AudioFrame::neu(self.format.kanaele, samples)
    }
}

// ---------------------------------------------------------------------------
// IMA-ADPCM
// ---------------------------------------------------------------------------

const INDEX_TABELLE: [i8; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const SCHRITT_TABELLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

const MAX_INDEX: u8 = 88;
const BLOCK_KOPF: usize = 4;

/// Praediktor-Zustand eines Kanals
#[derive(Debug, Clone, Copy, Default)]
struct AdpcmZustand {
    praediktor: i32,
    index: u8,
}

impl AdpcmZustand {
    /// Wendet ein Nibble an; Kodierer und Dekodierer teilen sich diesen Schritt
    fn anwenden(&mut self, nibble: u8) -> i16 {
        let schritt = SCHRITT_TABELLE[self.index as usize];
        let mut delta = schritt >> 3;
        if nibble & 4 != 0 {
            delta += schritt;
        }
        if nibble & 2 != 0 {
            delta += schritt >> 1;
        }
        if nibble & 1 != 0 {
            delta += schritt >> 2;
        }
        if nibble & 8 != 0 {
            self.praediktor -= delta;
        } else {
            self.praediktor += delta;
        }
        self.praediktor = self.praediktor.clamp(i16::MIN as i32, i16::MAX as i32);
        let index = self.index as i32 + INDEX_TABELLE[nibble as usize] as i32;
        self.index = index.clamp(0, MAX_INDEX as i32) as u8;
        self.praediktor as i16
    }

    fn kodieren(&mut self, sample: i16) -> u8 {
        let schritt = SCHRITT_TABELLE[self.index as usize];
        let mut diff = sample as i32 - self.praediktor;
        let mut nibble = 0u8;
        if diff < 0 {
            nibble = 8;
            diff = -diff;
        }
        if diff >= schritt {
            nibble |= 4;
            diff -= schritt;
        }
        if diff >= schritt >> 1 {
            nibble |= 2;
            diff -= schritt >> 1;
        }
        if diff >= schritt >> 2 {
            nibble |= 1;
        }
        self.anwenden(nibble);
        nibble
    }
}

/// 4-Bit IMA-ADPCM, jeder Frame ist ohne Vorgaenger dekodierbar
pub struct ImaAdpcmCodec {
    format: FrameFormat,
    /// Schrittindex pro Kanal wird ueber Frames weitergetragen
    index: Vec<u8>,
}

impl ImaAdpcmCodec {
    pub fn neu(format: FrameFormat) -> Self {
        Self {
            index: vec![0; format.kanaele.anzahl()],
            format,
        }
    }

    fn block_laenge(&self) -> usize {
        self.format.nutzdaten_laenge() / self.format.kanaele.anzahl()
    }
}

impl FrameCodec for ImaAdpcmCodec {
    fn format(&self) -> &FrameFormat {
        &self.format
    }

    fn encode(&mut self, frame: &AudioFrame) -> AudioResult<Vec<u8>> {
        laenge_pruefen(&self.format, frame)?;
        let kanaele = self.format.kanaele.anzahl();
        let n = self.format.groesse.samples();
        let samples = frame.samples();
        let mut out = Vec::with_capacity(self.format.nutzdaten_laenge());

        for k in 0..kanaele {
            let erstes = samples[k];
            let mut zustand = AdpcmZustand {
                praediktor: erstes as i32,
                index: self.index[k],
            };
            out.extend_from_slice(&erstes.to_be_bytes());
            out.push(zustand.index);
            out.push(0);

            let mut offen: Option<u8> = None;
            for i in 1..n {
                let nibble = zustand.kodieren(samples[i * kanaele + k]);
                match offen.take() {
                    None => offen = Some(nibble),
                    Some(unten) => out.push(unten | (nibble << 4)),
                }
            }
            if let Some(unten) = offen {
                out.push(unten);
            }
            self.index[k] = zustand.index;
        }

        Ok(out)
    }

    fn decode(&mut self, daten: &[u8]) -> Option<AudioFrame> {
        if daten.len() != self.format.nutzdaten_laenge() {
            return None;
        }
        let kanaele = self.format.kanaele.anzahl();
        let n = self.format.groesse.samples();
        let block = self.block_laenge();
        let mut samples = vec![0i16; n * kanaele];

        for (k, blk) in daten.chunks_exact(block).enumerate() {
            let erstes = i16::from_be_bytes([blk[0], blk[1]]);
            let index = blk[2];
            if index > MAX_INDEX || blk[3] != 0 {
                return None;
            }
            let mut zustand = AdpcmZustand {
                praediktor: erstes as i32,
                index,
            };
            samples[k] = erstes;

            let nibbles = blk[BLOCK_KOPF..]
                .iter()
                .flat_map(|b| [b & 0x0F, b >> 4])
                .take(n - 1);
            for (i, nibble) in nibbles.enumerate() {
                samples[(i + 1) * kanaele + k] = zustand.anwenden(nibble);
            }
        }

        AudioFrame::neu(self.format.kanaele, samples)
    }
}

// ---------------------------------------------------------------------------
// FrameDecoder – Codec + Verdeckung
// ---------------------------------------------------------------------------

/// Empfangspfad einer Verbindung: dekodiert oder verdeckt, nie ein Fehler
pub struct FrameDecoder {
    codec: Box<dyn FrameCodec>,
    verdecker: Verdecker,
}

impl FrameDecoder {
    pub fn neu(format: FrameFormat) -> Self {
        Self {
            codec: codec_erstellen(format),
            verdecker: Verdecker::neu(format),
        }
    }

    /// Dekodiert eine Payload (`None` = Frame fehlt)
    ///
    /// Liefert immer einen Frame voller Laenge.
    pub fn dekodieren(&mut self, daten: Option<&[u8]>) -> DecodeErgebnis {
        let Some(daten) = daten else {
            return self.verdecker.verdecken(VerdeckungsGrund::Fehlend);
        };
        match self.codec.decode(daten) {
            Some(frame) => {
                self.verdecker.original(&frame);
                DecodeErgebnis::Dekodiert(frame)
            }
            None => {
                tracing::trace!(bytes = daten.len(), "Defekte Payload verdeckt");
                self.verdecker.verdecken(VerdeckungsGrund::Defekt)
            }
        }
    }

    /// Verdeckt einen bewusst uebersprungenen Frame (Lastabwurf)
    pub fn ueberspringen(&mut self) -> DecodeErgebnis {
        self.verdecker.verdecken(VerdeckungsGrund::Ueberlast)
    }

    pub fn format(&self) -> &FrameFormat {
        self.codec.format()
    }

    pub fn statistik(&self) -> &PlcStatistik {
        self.verdecker.statistik()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::VerdeckungsArt;
    use klangraum_protocol::codec::{FrameGroesse, KanalAnzahl};

    fn format(codec: CodecTyp, kanaele: KanalAnzahl) -> FrameFormat {
        FrameFormat::neu(FrameGroesse::Samples128, kanaele, codec)
    }

    fn sinus(format: &FrameFormat, amplitude: f32) -> AudioFrame {
        let k = format.kanaele.anzahl();
        let samples = (0..format.samples_gesamt())
            .map(|i| {
                let t = (i / k) as f32 / 48_000.0;
                (amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect();
        AudioFrame::neu(format.kanaele, samples).unwrap()
    }

    #[test]
    fn pcm16_ist_verlustfrei() {
        let f = format(CodecTyp::Pcm16, KanalAnzahl::Stereo);
        let mut codec = Pcm16Codec::neu(f);
        let frame = sinus(&f, 20_000.0);
        let bytes = codec.encode(&frame).unwrap();
        assert_eq!(bytes.len(), f.nutzdaten_laenge());
        assert_eq!(codec.decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn adpcm_haelt_laenge_und_naehert_signal() {
        for kanaele in [KanalAnzahl::Mono, KanalAnzahl::Stereo] {
            let f = format(CodecTyp::ImaAdpcm, kanaele);
            let mut codec = ImaAdpcmCodec::neu(f);
            let frame = sinus(&f, 8_000.0);

            // Mehrere Frames, damit sich der Schrittindex einschwingt
            let mut bytes = codec.encode(&frame).unwrap();
            for _ in 0..4 {
                bytes = codec.encode(&frame).unwrap();
            }
            assert_eq!(bytes.len(), f.nutzdaten_laenge());

            let dekodiert = codec.decode(&bytes).unwrap();
            assert_eq!(dekodiert.samples().len(), frame.samples().len());
            let max_abweichung = frame
                .samples()
                .iter()
                .zip(dekodiert.samples())
                .map(|(a, b)| (*a as i32 - *b as i32).abs())
                .max()
                .unwrap();
            assert!(max_abweichung < 2_000, "Abweichung zu gross: {max_abweichung}");
        }
    }

    #[test]
    fn adpcm_erstes_sample_exakt() {
        let f = format(CodecTyp::ImaAdpcm, KanalAnzahl::Mono);
        let mut codec = ImaAdpcmCodec::neu(f);
        let frame = AudioFrame::neu(KanalAnzahl::Mono, vec![-1234; 128]).unwrap();
        let kodiert = codec.encode(&frame).unwrap();
        let dekodiert = codec.decode(&kodiert).unwrap();
        assert_eq!(dekodiert.samples()[0], -1234);
        assert_eq!(dekodiert.samples()[127], -1234);
    }

    #[test]
    fn falsche_framelaenge_beim_kodieren() {
        let f = format(CodecTyp::ImaAdpcm, KanalAnzahl::Mono);
        let mut codec = codec_erstellen(f);
        let kurz = AudioFrame::neu(KanalAnzahl::Mono, vec![0; 64]).unwrap();
        assert!(matches!(
            codec.encode(&kurz),
            Err(AudioError::FrameLaenge { erwartet: 128, erhalten: 64 })
        ));
    }

    #[test]
    fn defekte_payload_liefert_frame_voller_laenge() {
        for codec in [CodecTyp::Pcm16, CodecTyp::ImaAdpcm] {
            let f = format(codec, KanalAnzahl::Stereo);
            let mut decoder = FrameDecoder::neu(f);

            for muell in [&[][..], &[1, 2, 3][..], &vec![0xFF; f.nutzdaten_laenge() + 1][..]] {
                let ergebnis = decoder.dekodieren(Some(muell));
                assert!(ergebnis.ist_verdeckt());
                assert_eq!(ergebnis.frame().samples().len(), f.samples_gesamt());
            }
        }
    }

    #[test]
    fn adpcm_ungueltiger_index_ist_defekt() {
        let f = format(CodecTyp::ImaAdpcm, KanalAnzahl::Mono);
        let mut decoder = FrameDecoder::neu(f);
        let mut bytes = vec![0u8; f.nutzdaten_laenge()];
        bytes[2] = 200;
        match decoder.dekodieren(Some(&bytes)) {
            DecodeErgebnis::Verdeckt { grund, art, .. } => {
                assert_eq!(grund, VerdeckungsGrund::Defekt);
                assert_eq!(art, VerdeckungsArt::Stille);
            }
            DecodeErgebnis::Dekodiert(_) => panic!("Defekt erwartet"),
        }
    }

    #[test]
    fn fehlender_frame_wiederholt_letzten() {
        let f = format(CodecTyp::Pcm16, KanalAnzahl::Mono);
        let mut enc = Pcm16Codec::neu(f);
        let mut decoder = FrameDecoder::neu(f);
        let frame = AudioFrame::neu(KanalAnzahl::Mono, vec![400; 128]).unwrap();
        let bytes = enc.encode(&frame).unwrap();

        assert!(!decoder.dekodieren(Some(&bytes)).ist_verdeckt());
        let ersatz = decoder.dekodieren(None);
        assert!(matches!(
            ersatz,
            DecodeErgebnis::Verdeckt {
                art: VerdeckungsArt::Wiederholung,
                grund: VerdeckungsGrund::Fehlend,
                ..
            }
        ));
        assert_eq!(ersatz.frame().samples()[0], 300);
        assert_eq!(decoder.statistik().originale, 1);
    }
}
