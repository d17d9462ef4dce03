//! Aufnahme als rohes PCM
//!
//! Eine Datei pro Slot und Belegung: `slot-<n>-<zeitstempel>.pcm`,
//! 16 Bit little-endian, 48 kHz, Kanaele interleaved wie empfangen.
//! Wird ein Slot frei, wird die Spur geschlossen; die naechste Belegung
//! beginnt eine neue Datei.

use chrono::Utc;
use klangraum_core::SlotId;
use klangraum_voice::{Aufnahme, AufnahmeFrame};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Nach so vielen Frames wird eine Spur auf die Platte geschrieben (~1 s)
const FLUSH_INTERVALL: u32 = 375;

struct Spur {
    datei: BufWriter<File>,
    seit_flush: u32,
}

/// Schreibt jede Spur in eine eigene `.pcm`-Datei
pub struct PcmAufnahme {
    verzeichnis: PathBuf,
    spuren: HashMap<SlotId, Spur>,
}

impl PcmAufnahme {
    /// Legt das Zielverzeichnis an, falls noetig
    pub fn neu(verzeichnis: impl Into<PathBuf>) -> std::io::Result<Self> {
        let verzeichnis = verzeichnis.into();
        std::fs::create_dir_all(&verzeichnis)?;
        Ok(Self {
            verzeichnis,
            spuren: HashMap::new(),
        })
    }

    pub fn verzeichnis(&self) -> &Path {
        &self.verzeichnis
    }

    fn spur_oeffnen(&self, slot: SlotId) -> std::io::Result<Spur> {
        let name = format!(
            "slot-{}-{}.pcm",
            slot.0,
            Utc::now().format("%Y%m%d-%H%M%S%.3f")
        );
        let pfad = self.verzeichnis.join(name);
        tracing::info!(slot = %slot, pfad = %pfad.display(), "Aufnahme-Spur geoeffnet");
        Ok(Spur {
            datei: BufWriter::new(File::create(pfad)?),
            seit_flush: 0,
        })
    }
}

impl Aufnahme for PcmAufnahme {
    fn frame_schreiben(&mut self, frame: &AufnahmeFrame) -> std::io::Result<()> {
        if !self.spuren.contains_key(&frame.slot) {
            let spur = self.spur_oeffnen(frame.slot)?;
            self.spuren.insert(frame.slot, spur);
        }
        let Some(spur) = self.spuren.get_mut(&frame.slot) else {
            return Ok(());
        };

        let bytes: Vec<u8> = frame
            .frame
            .samples()
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        spur.datei.write_all(&bytes)?;

        spur.seit_flush += 1;
        if spur.seit_flush >= FLUSH_INTERVALL {
            spur.datei.flush()?;
            spur.seit_flush = 0;
        }
        Ok(())
    }

    fn spur_beenden(&mut self, slot: SlotId) -> std::io::Result<()> {
        if let Some(mut spur) = self.spuren.remove(&slot) {
            spur.datei.flush()?;
            tracing::info!(slot = %slot, "Aufnahme-Spur geschlossen");
        }
        Ok(())
    }

    fn beenden(&mut self) -> std::io::Result<()> {
        for (_, mut spur) in self.spuren.drain() {
            spur.datei.flush()?;
        }
        Ok(())
    }
}
