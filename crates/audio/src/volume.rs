//! Gain/Pan pro Hoerer-Paar und Summierung in den Mix-Akkumulator
//!
//! Jeder Hoerer stellt fuer jede Quelle eigene Werte ein, es gibt keine
//! globale Lautstaerke pro Quelle. Gemischt wird in einen `f32`-Akkumulator,
//! erst `begrenzen` bringt das Ergebnis zurueck in den i16-Bereich.

use crate::frame::AudioFrame;
use klangraum_protocol::codec::KanalAnzahl;

/// Hoechster zulaessiger Gain (entspricht etwa +12 dB)
pub const MAX_GAIN: f32 = 4.0;

/// Gain und Pan einer Quelle aus Sicht eines Hoerers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KanalGain {
    /// Linearer Faktor (0.0 = stumm, 1.0 = unveraendert)
    pub gain: f32,
    /// 0.0 = ganz links, 0.5 = Mitte, 1.0 = ganz rechts
    pub pan: f32,
}

impl Default for KanalGain {
    fn default() -> Self {
        Self { gain: 1.0, pan: 0.5 }
    }
}

impl KanalGain {
    /// Erstellt einen Gain, ungueltige Werte werden begrenzt
    pub fn neu(gain: f32, pan: f32) -> Self {
        let gain = if gain.is_finite() { gain.clamp(0.0, MAX_GAIN) } else { 1.0 };
        let pan = if pan.is_finite() { pan.clamp(0.0, 1.0) } else { 0.5 };
        Self { gain, pan }
    }

    pub fn ist_stumm(&self) -> bool {
        self.gain <= 0.0
    }

    /// Faktoren (links, rechts) nach dem Pan-Gesetz
    ///
    /// In der Mitte bleiben beide Seiten bei vollem Pegel, zum Rand hin wird
    /// nur die Gegenseite abgesenkt.
    pub fn faktoren(&self) -> (f32, f32) {
        let links = (2.0 * (1.0 - self.pan)).min(1.0);
        let rechts = (2.0 * self.pan).min(1.0);
        (self.gain * links, self.gain * rechts)
    }
}

/// Addiert `quelle` mit `gain` in den Akkumulator
///
/// `akku` ist interleavt im Zielformat `ziel` und hat dieselbe Anzahl
/// Samples pro Kanal wie `quelle`. Passt die Laenge nicht, wird nichts
/// addiert.
pub fn mischen_in(akku: &mut [f32], quelle: &AudioFrame, ziel: KanalAnzahl, gain: KanalGain) {
    if gain.ist_stumm() || akku.len() != quelle.laenge() * ziel.anzahl() {
        return;
    }
    let (links, rechts) = gain.faktoren();
    let samples = quelle.samples();

    match (quelle.kanaele(), ziel) {
        (KanalAnzahl::Mono, KanalAnzahl::Mono) => {
            for (a, &s) in akku.iter_mut().zip(samples) {
                *a += s as f32 * gain.gain;
            }
        }
        (KanalAnzahl::Mono, KanalAnzahl::Stereo) => {
            for (a, &s) in akku.chunks_exact_mut(2).zip(samples) {
                a[0] += s as f32 * links;
                a[1] += s as f32 * rechts;
            }
        }
        (KanalAnzahl::Stereo, KanalAnzahl::Mono) => {
            for (a, s) in akku.iter_mut().zip(samples.chunks_exact(2)) {
                *a += (s[0] as f32 + s[1] as f32) * 0.5 * gain.gain;
            }
        }
        (KanalAnzahl::Stereo, KanalAnzahl::Stereo) => {
            for (a, s) in akku.chunks_exact_mut(2).zip(samples.chunks_exact(2)) {
                a[0] += s[0] as f32 * links;
                a[1] += s[1] as f32 * rechts;
            }
        }
    }
}

/// Schreibt den Akkumulator hart begrenzt nach i16
pub fn begrenzen(akku: &[f32], ziel: &mut [i16]) -> usize {
    let mut uebersteuert = 0;
    for (z, &a) in ziel.iter_mut().zip(akku) {
        let gerundet = a.round();
        if gerundet > i16::MAX as f32 || gerundet < i16::MIN as f32 {
            uebersteuert += 1;
        }
        *z = gerundet.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
    uebersteuert
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(wert: i16, n: usize) -> AudioFrame {
        AudioFrame::neu(KanalAnzahl::Mono, vec![wert; n]).unwrap()
    }

    #[test]
    fn summe_bei_einheits_gain() {
        let mut akku = vec![0.0f32; 64];
        mischen_in(&mut akku, &mono(100, 64), KanalAnzahl::Mono, KanalGain::default());
        mischen_in(&mut akku, &mono(250, 64), KanalAnzahl::Mono, KanalGain::default());
        let mut aus = vec![0i16; 64];
        assert_eq!(begrenzen(&akku, &mut aus), 0);
        assert!(aus.iter().all(|&s| s == 350));
    }

    #[test]
    fn begrenzung_statt_ueberlauf() {
        let mut akku = vec![0.0f32; 8];
        for _ in 0..3 {
            mischen_in(&mut akku, &mono(20_000, 8), KanalAnzahl::Mono, KanalGain::default());
        }
        let mut aus = vec![0i16; 8];
        assert_eq!(begrenzen(&akku, &mut aus), 8);
        assert!(aus.iter().all(|&s| s == i16::MAX));

        let mut akku = vec![0.0f32; 8];
        for _ in 0..3 {
            mischen_in(&mut akku, &mono(-20_000, 8), KanalAnzahl::Mono, KanalGain::default());
        }
        begrenzen(&akku, &mut aus);
        assert!(aus.iter().all(|&s| s == i16::MIN));
    }

    #[test]
    fn pan_ganz_links() {
        let mut akku = vec![0.0f32; 8];
        mischen_in(&mut akku, &mono(1000, 4), KanalAnzahl::Stereo, KanalGain::neu(1.0, 0.0));
        let mut aus = vec![0i16; 8];
        begrenzen(&akku, &mut aus);
        assert_eq!(aus, vec![1000, 0, 1000, 0, 1000, 0, 1000, 0]);
    }

    #[test]
    fn stereo_nach_mono_mittelt() {
        let quelle = AudioFrame::neu(KanalAnzahl::Stereo, vec![1000, 0, 400, 600]).unwrap();
        let mut akku = vec![0.0f32; 2];
        mischen_in(&mut akku, &quelle, KanalAnzahl::Mono, KanalGain::default());
        assert_eq!(akku, vec![500.0, 500.0]);
    }

    #[test]
    fn stumm_und_ungueltige_werte() {
        let mut akku = vec![0.0f32; 4];
        mischen_in(&mut akku, &mono(1000, 4), KanalAnzahl::Mono, KanalGain::neu(0.0, 0.5));
        assert!(akku.iter().all(|&a| a == 0.0));

        let g = KanalGain::neu(f32::NAN, 7.0);
        assert_eq!(g.gain, 1.0);
        assert_eq!(g.pan, 1.0);
        assert_eq!(KanalGain::neu(10.0, 0.5).gain, MAX_GAIN);
    }

    #[test]
    fn falsche_laenge_wird_ignoriert() {
        let mut akku = vec![0.0f32; 3];
        mischen_in(&mut akku, &mono(1, 4), KanalAnzahl::Mono, KanalGain::default());
        assert!(akku.iter().all(|&a| a == 0.0));
    }
}
