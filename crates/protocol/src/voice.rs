//! Audio-Nutzdaten (UDP)
//!
//! Binaere Struktur der `Audio`-Nachricht. Kein serde, da sie mit jeder
//! Frame-Periode pro Verbindung einmal in jede Richtung laeuft.
//!
//! ## Payload-Format
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       4   Sequenznummer der Verbindung (big-endian, wrapping)
//!  4       N   Kodierte Frame-Bytes (Laenge durch das FrameFormat fest)
//! ```

use crate::wire::WireFehler;
use bytes::{BufMut, BytesMut};

/// Maximale Laenge der kodierten Frame-Bytes
///
/// 128 Samples Stereo PCM16 belegen 512 Byte; der Rest ist Reserve.
pub const MAX_NUTZDATEN_LAENGE: usize = 1280;

/// Laenge des Sequenzfelds
pub const SEQUENZ_LAENGE: usize = 4;

/// Ein Audio-Frame auf dem Draht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPaket {
    /// Monoton steigende Sequenznummer pro Verbindung und Richtung
    pub sequenz: u32,
    /// Kodierte Frame-Bytes
    pub nutzdaten: Vec<u8>,
}

impl AudioPaket {
    pub fn neu(sequenz: u32, nutzdaten: Vec<u8>) -> Self {
        Self { sequenz, nutzdaten }
    }

    /// Laenge der serialisierten Payload
    pub fn payload_laenge(&self) -> usize {
        SEQUENZ_LAENGE + self.nutzdaten.len()
    }

    /// Schreibt die Payload an das Ende von `buf`
    pub fn payload_schreiben(&self, buf: &mut BytesMut) {
        buf.put_u32(self.sequenz);
        buf.put_slice(&self.nutzdaten);
    }

    /// Liest die Payload einer `Audio`-Nachricht
    ///
    /// # Fehler
    /// - `PayloadZuKurz` ohne vollstaendige Sequenznummer
    /// - `PayloadZuGross` wenn die Nutzdaten `MAX_NUTZDATEN_LAENGE` ueberschreiten
    pub fn payload_lesen(payload: &[u8]) -> Result<Self, WireFehler> {
        if payload.len() < SEQUENZ_LAENGE {
            return Err(WireFehler::PayloadZuKurz {
                erwartet: SEQUENZ_LAENGE,
                erhalten: payload.len(),
            });
        }
        let nutzdaten = &payload[SEQUENZ_LAENGE..];
        if nutzdaten.len() > MAX_NUTZDATEN_LAENGE {
            return Err(WireFehler::PayloadZuGross(nutzdaten.len()));
        }
        let sequenz = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(Self {
            sequenz,
            nutzdaten: nutzdaten.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_schreiben_und_lesen() {
        let paket = AudioPaket::neu(0xDEAD_BEEF, vec![1, 2, 3]);
        let mut buf = BytesMut::new();
        paket.payload_schreiben(&mut buf);
        assert_eq!(buf.len(), paket.payload_laenge());
        assert_eq!(&buf[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);

        let gelesen = AudioPaket::payload_lesen(&buf).unwrap();
        assert_eq!(gelesen, paket);
    }

    #[test]
    fn payload_ohne_sequenz_abgelehnt() {
        let err = AudioPaket::payload_lesen(&[0, 1]).unwrap_err();
        assert!(matches!(err, WireFehler::PayloadZuKurz { erwartet: 4, erhalten: 2 }));
    }

    #[test]
    fn leere_nutzdaten_sind_gueltig() {
        // Leere Frames werden erst vom Codec als defekt erkannt
        let paket = AudioPaket::payload_lesen(&[0, 0, 0, 9]).unwrap();
        assert_eq!(paket.sequenz, 9);
        assert!(paket.nutzdaten.is_empty());
    }

    #[test]
    fn zu_grosse_nutzdaten_abgelehnt() {
        let payload = vec![0u8; SEQUENZ_LAENGE + MAX_NUTZDATEN_LAENGE + 1];
        assert!(matches!(
            AudioPaket::payload_lesen(&payload),
            Err(WireFehler::PayloadZuGross(_))
        ));
    }
}
