//! Verdeckung fehlender oder defekter Frames (Packet Loss Concealment)
//!
//! Ein fehlender Frame (Luecke im Jitter Buffer) oder eine nicht dekodierbare
//! Payload fuehrt nie zu einem Fehler, sondern zu einem Ersatz-Frame voller
//! Laenge. Das Ergebnis ist als eigene Variante typisiert, damit Aufrufer und
//! Tests Verdeckung von echter Dekodierung unterscheiden koennen.
//!
//! ## Strategien
//! 1. **Wiederholung mit Fade**: der letzte gute Frame wird mit abnehmendem
//!    Pegel wiederholt.
//! 2. **Stille**: nach `MAX_WIEDERHOLUNGEN` aufeinanderfolgenden Verlusten
//!    oder wenn noch nie ein guter Frame ankam.

use crate::frame::AudioFrame;
use klangraum_protocol::codec::FrameFormat;

/// Maximale Anzahl von Wiederholungen vor dem Uebergang zu Stille
pub const MAX_WIEDERHOLUNGEN: u32 = 3;

/// Fade-Faktor pro Wiederholung (0.75 = 25% Abnahme pro Frame)
pub const FADE_FAKTOR: f32 = 0.75;

// ---------------------------------------------------------------------------
// Ergebnis-Typen
// ---------------------------------------------------------------------------

/// Warum verdeckt wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdeckungsGrund {
    /// Frame war zur Abspielzeit nicht im Jitter Buffer
    Fehlend,
    /// Payload war beschaedigt oder hatte die falsche Laenge
    Defekt,
    /// Eingang wurde wegen Ueberlast in diesem Tick uebersprungen
    Ueberlast,
}

/// Wie verdeckt wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdeckungsArt {
    Wiederholung,
    Stille,
}

/// Ergebnis einer Dekodierung
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeErgebnis {
    /// Payload erfolgreich dekodiert
    Dekodiert(AudioFrame),
    /// Ersatz-Frame voller Laenge
    Verdeckt {
        frame: AudioFrame,
        art: VerdeckungsArt,
        grund: VerdeckungsGrund,
    },
}

impl DecodeErgebnis {
    pub fn frame(&self) -> &AudioFrame {
        match self {
            Self::Dekodiert(f) | Self::Verdeckt { frame: f, .. } => f,
        }
    }

    pub fn into_frame(self) -> AudioFrame {
        match self {
            Self::Dekodiert(f) | Self::Verdeckt { frame: f, .. } => f,
        }
    }

    pub fn ist_verdeckt(&self) -> bool {
        matches!(self, Self::Verdeckt { .. })
    }
}

// ---------------------------------------------------------------------------
// Statistiken
// ---------------------------------------------------------------------------

/// Verdeckungs-Statistiken
#[derive(Debug, Clone, Default)]
pub struct PlcStatistik {
    pub originale: u64,
    pub wiederholungen: u64,
    pub stille_eingefuegt: u64,
    pub defekte_payloads: u64,
}

impl PlcStatistik {
    /// Anteil verdeckter Frames (0.0–1.0)
    pub fn verdeckungs_rate(&self) -> f64 {
        let verdeckt = self.wiederholungen + self.stille_eingefuegt;
        let gesamt = self.originale + verdeckt;
        if gesamt == 0 {
            0.0
        } else {
            verdeckt as f64 / gesamt as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Verdecker
// ---------------------------------------------------------------------------

/// Erzeugt Ersatz-Frames fuer einen Empfangspfad
///
/// Pro Verbindung eine Instanz, nicht thread-safe.
pub struct Verdecker {
    format: FrameFormat,
    letzter_frame: Option<AudioFrame>,
    aufeinanderfolgende_verluste: u32,
    aktueller_fade: f32,
    statistik: PlcStatistik,
}

impl Verdecker {
    pub fn neu(format: FrameFormat) -> Self {
        Self {
            format,
            letzter_frame: None,
            aufeinanderfolgende_verluste: 0,
            aktueller_fade: 1.0,
            statistik: PlcStatistik::default(),
        }
    }

    /// Merkt sich einen erfolgreich dekodierten Frame
    pub fn original(&mut self, frame: &AudioFrame) {
        self.statistik.originale += 1;
        self.aufeinanderfolgende_verluste = 0;
        self.aktueller_fade = 1.0;
        match &mut self.letzter_frame {
            Some(letzter) if letzter.kanaele() == frame.kanaele() => {
                letzter.samples_mut().copy_from_slice(frame.samples());
            }
            _ => self.letzter_frame = Some(frame.clone()),
        }
    }

    /// Liefert einen Ersatz-Frame fuer einen Verlust
    pub fn verdecken(&mut self, grund: VerdeckungsGrund) -> DecodeErgebnis {
        self.aufeinanderfolgende_verluste += 1;
        if grund == VerdeckungsGrund::Defekt {
            self.statistik.defekte_payloads += 1;
        }

        let wiederholbar = self.aufeinanderfolgende_verluste <= MAX_WIEDERHOLUNGEN;
        match (&self.letzter_frame, wiederholbar) {
            (Some(letzter), true) => {
                self.aktueller_fade *= FADE_FAKTOR;
                let fade = self.aktueller_fade;
                let mut frame = letzter.clone();
                for s in frame.samples_mut() {
                    *s = (*s as f32 * fade) as i16;
                }
                self.statistik.wiederholungen += 1;
                DecodeErgebnis::Verdeckt {
                    frame,
                    art: VerdeckungsArt::Wiederholung,
                    grund,
                }
            }
            _ => {
                self.statistik.stille_eingefuegt += 1;
                DecodeErgebnis::Verdeckt {
                    frame: AudioFrame::stille(&self.format),
                    art: VerdeckungsArt::Stille,
                    grund,
                }
            }
        }
    }

    pub fn statistik(&self) -> &PlcStatistik {
        &self.statistik
    }

    /// Anzahl aufeinanderfolgender Verluste
    pub fn verluste_in_folge(&self) -> u32 {
        self.aufeinanderfolgende_verluste
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use klangraum_protocol::codec::{CodecTyp, FrameGroesse, KanalAnzahl};

    fn format() -> FrameFormat {
        FrameFormat::neu(FrameGroesse::Samples64, KanalAnzahl::Mono, CodecTyp::Pcm16)
    }

    fn frame(wert: i16) -> AudioFrame {
        AudioFrame::neu(KanalAnzahl::Mono, vec![wert; 64]).unwrap()
    }

    #[test]
    fn ohne_vorgeschichte_stille() {
        let mut v = Verdecker::neu(format());
        let ergebnis = v.verdecken(VerdeckungsGrund::Fehlend);
        match ergebnis {
            DecodeErgebnis::Verdeckt { frame, art, grund } => {
                assert_eq!(art, VerdeckungsArt::Stille);
                assert_eq!(grund, VerdeckungsGrund::Fehlend);
                assert!(frame.ist_stille());
                assert_eq!(frame.samples().len(), 64);
            }
            DecodeErgebnis::Dekodiert(_) => panic!("Verdeckung erwartet"),
        }
    }

    #[test]
    fn wiederholung_mit_fade_dann_stille() {
        let mut v = Verdecker::neu(format());
        v.original(&frame(1000));

        let mut pegel = Vec::new();
        for _ in 0..MAX_WIEDERHOLUNGEN {
            let e = v.verdecken(VerdeckungsGrund::Fehlend);
            assert!(matches!(
                e,
                DecodeErgebnis::Verdeckt {
                    art: VerdeckungsArt::Wiederholung,
                    ..
                }
            ));
            pegel.push(e.frame().samples()[0]);
        }
        assert_eq!(pegel, vec![750, 562, 421], "Pegel muss pro Wiederholung sinken");

        let danach = v.verdecken(VerdeckungsGrund::Fehlend);
        assert!(danach.frame().ist_stille());
        assert_eq!(v.statistik().wiederholungen, 3);
        assert_eq!(v.statistik().stille_eingefuegt, 1);
    }

    #[test]
    fn original_setzt_fade_zurueck() {
        let mut v = Verdecker::neu(format());
        v.original(&frame(800));
        v.verdecken(VerdeckungsGrund::Defekt);
        v.original(&frame(800));
        assert_eq!(v.verluste_in_folge(), 0);
        let e = v.verdecken(VerdeckungsGrund::Fehlend);
        assert_eq!(e.frame().samples()[0], 600);
        assert_eq!(v.statistik().defekte_payloads, 1);
    }

    #[test]
    fn verdeckungs_rate() {
        let mut v = Verdecker::neu(format());
        v.original(&frame(1));
        v.verdecken(VerdeckungsGrund::Fehlend);
        assert!((v.statistik().verdeckungs_rate() - 0.5).abs() < f64::EPSILON);
    }
}
