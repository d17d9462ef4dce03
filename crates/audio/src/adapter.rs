//! Block-Adapter zwischen Treiber-Blockgroesse und Netzwerk-Frame
//!
//! Der Audio-Treiber liefert Callbacks mit beliebiger Blockgroesse, Netzwerk
//! und Mixer arbeiten mit festen Frames (64 oder 128 Samples). Der Adapter
//! sammelt Samples in einem Ring-Buffer und gibt nur ganze Bloecke heraus.
//! Die zusaetzliche Latenz ist dadurch auf weniger als einen Block begrenzt.
//!
//! Wird derselbe Adapter zwischen zwei Frame-Groessen eingesetzt (64 ↔ 128),
//! dient er gleichzeitig als Frame-Groessen-Wandler im Mixer.

use crate::error::{AudioError, AudioResult};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

/// Sammelt interleavte Samples und gibt Bloecke fester Groesse aus
pub struct BlockAdapter {
    puffer: HeapRb<i16>,
    block: usize,
    verworfen: u64,
}

impl BlockAdapter {
    /// Erstellt einen Adapter fuer Ausgabe-Bloecke von `block` Samples
    ///
    /// `kapazitaet` muss mindestens zwei Bloecke fassen.
    pub fn neu(block: usize, kapazitaet: usize) -> AudioResult<Self> {
        if block == 0 {
            return Err(AudioError::BlockGroesse(block));
        }
        if kapazitaet < 2 * block {
            return Err(AudioError::Konfiguration(format!(
                "Kapazitaet {kapazitaet} kleiner als zwei Bloecke zu {block}"
            )));
        }
        Ok(Self {
            puffer: HeapRb::new(kapazitaet),
            block,
            verworfen: 0,
        })
    }

    /// Adapter mit fester Vorlauf-Latenz aus Stille
    pub fn mit_vorlauf(block: usize, kapazitaet: usize, vorlauf: usize) -> AudioResult<Self> {
        let mut adapter = Self::neu(block, kapazitaet)?;
        if vorlauf > kapazitaet {
            return Err(AudioError::Konfiguration(format!(
                "Vorlauf {vorlauf} groesser als Kapazitaet {kapazitaet}"
            )));
        }
        let stille = vec![0i16; vorlauf];
        adapter.puffer.push_slice(&stille);
        Ok(adapter)
    }

    /// Nimmt Samples auf
    ///
    /// Reicht der Platz nicht, werden die aeltesten ganzen Bloecke verworfen,
    /// damit die Latenz begrenzt bleibt. Gibt die Anzahl verworfener Samples
    /// zurueck.
    pub fn einspeisen(&mut self, samples: &[i16]) -> usize {
        let mut verworfen = 0;
        while self.puffer.vacant_len() < samples.len() && self.puffer.occupied_len() > 0 {
            verworfen += self.puffer.skip(self.block);
        }
        let geschrieben = self.puffer.push_slice(samples);
        verworfen += samples.len() - geschrieben;
        if verworfen > 0 {
            self.verworfen += verworfen as u64;
            tracing::debug!(verworfen, "Block-Adapter uebergelaufen");
        }
        verworfen
    }

    /// Entnimmt den naechsten ganzen Block, falls vorhanden
    pub fn block_entnehmen(&mut self) -> Option<Vec<i16>> {
        let mut block = vec![0i16; self.block];
        self.block_lesen(&mut block).then_some(block)
    }

    /// Fuellt `ziel` (genau ein Block) ohne Allokation
    ///
    /// Gibt `false` zurueck und laesst den Puffer unveraendert, wenn noch
    /// kein ganzer Block vorhanden ist oder `ziel` nicht Blockgroesse hat.
    pub fn block_lesen(&mut self, ziel: &mut [i16]) -> bool {
        if ziel.len() != self.block || self.puffer.occupied_len() < self.block {
            return false;
        }
        self.puffer.pop_slice(ziel) == self.block
    }

    /// Anzahl gepufferter Samples
    pub fn verfuegbar(&self) -> usize {
        self.puffer.occupied_len()
    }

    /// Anzahl sofort entnehmbarer Bloecke
    pub fn bloecke_verfuegbar(&self) -> usize {
        self.puffer.occupied_len() / self.block
    }

    pub fn block_groesse(&self) -> usize {
        self.block
    }

    /// Gesamtzahl durch Ueberlauf verlorener Samples
    pub fn verworfen(&self) -> u64 {
        self.verworfen
    }

    pub fn leeren(&mut self) {
        self.puffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nur_ganze_bloecke() {
        let mut a = BlockAdapter::neu(128, 1024).unwrap();
        a.einspeisen(&[1; 100]);
        assert!(a.block_entnehmen().is_none(), "Kein Teil-Block erlaubt");
        a.einspeisen(&[2; 100]);
        let block = a.block_entnehmen().unwrap();
        assert_eq!(block.len(), 128);
        assert_eq!(&block[..100], &[1; 100][..]);
        assert_eq!(&block[100..], &[2; 28][..]);
        assert_eq!(a.verfuegbar(), 72);
    }

    #[test]
    fn treiberblock_kleiner_als_frame() {
        // Treiber mit 48er Bloecken, Netzwerk mit 64er Frames
        let mut a = BlockAdapter::neu(64, 512).unwrap();
        let mut frames = 0;
        for i in 0..4 {
            a.einspeisen(&[i as i16; 48]);
            while a.block_entnehmen().is_some() {
                frames += 1;
            }
        }
        // 4 * 48 = 192 = 3 * 64
        assert_eq!(frames, 3);
        assert_eq!(a.verfuegbar(), 0);
    }

    #[test]
    fn ueberlauf_verwirft_aelteste_bloecke() {
        let mut a = BlockAdapter::neu(4, 8).unwrap();
        a.einspeisen(&[1, 1, 1, 1, 2, 2, 2, 2]);
        let verworfen = a.einspeisen(&[3, 3, 3, 3]);
        assert_eq!(verworfen, 4);
        assert_eq!(a.block_entnehmen().unwrap(), vec![2, 2, 2, 2]);
        assert_eq!(a.block_entnehmen().unwrap(), vec![3, 3, 3, 3]);
        assert_eq!(a.verworfen(), 4);
    }

    #[test]
    fn vorlauf_ist_stille() {
        let mut a = BlockAdapter::mit_vorlauf(64, 256, 64).unwrap();
        assert_eq!(a.bloecke_verfuegbar(), 1);
        assert!(a.block_entnehmen().unwrap().iter().all(|&s| s == 0));
    }

    #[test]
    fn falsche_zielgroesse_liest_nichts() {
        let mut a = BlockAdapter::neu(4, 16).unwrap();
        a.einspeisen(&[5; 8]);
        let mut ziel = [0i16; 3];
        assert!(!a.block_lesen(&mut ziel));
        assert_eq!(a.verfuegbar(), 8);
    }

    #[test]
    fn ungueltige_konfiguration() {
        assert!(BlockAdapter::neu(0, 16).is_err());
        assert!(BlockAdapter::neu(64, 100).is_err());
    }
}
