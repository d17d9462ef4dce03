//! Aufnahme-Weiche: dekodierte Frames pro Slot an einen Aufnahme-Thread
//!
//! Der Mix-Takt darf nie auf Platten-I/O warten. Die Weiche reicht Frames
//! per `try_send` an einen eigenen Thread weiter, bei vollem Kanal wird
//! verworfen und gezaehlt.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use klangraum_audio::AudioFrame;
use klangraum_core::SlotId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Frames, die der Aufnahme-Thread maximal puffert
pub const STANDARD_KAPAZITAET: usize = 4096;

/// Ein aufzuzeichnender Frame
#[derive(Debug, Clone)]
pub struct AufnahmeFrame {
    pub slot: SlotId,
    pub frame: AudioFrame,
}

/// Ziel der Aufnahme (Dateiformat liegt beim Implementierer)
pub trait Aufnahme: Send + 'static {
    fn frame_schreiben(&mut self, frame: &AufnahmeFrame) -> std::io::Result<()>;

    /// Ein Slot wurde frei, seine Spur kann abgeschlossen werden
    fn spur_beenden(&mut self, slot: SlotId) -> std::io::Result<()>;

    fn beenden(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum AufnahmeAuftrag {
    Frame(AufnahmeFrame),
    SpurEnde(SlotId),
    Beenden,
}

/// Maximale Wartezeit, bis der Beenden-Auftrag in den Kanal passt
const BEENDEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Nicht-blockierender Eingang zum Aufnahme-Thread
pub struct AufnahmeWeiche {
    sender: Sender<AufnahmeAuftrag>,
    verworfen: AtomicU64,
}

impl AufnahmeWeiche {
    /// Startet den Aufnahme-Thread
    ///
    /// Der Thread endet mit [`AufnahmeWeiche::beenden`] oder wenn die Weiche
    /// gedroppt wird.
    pub fn starten(
        aufnahme: Box<dyn Aufnahme>,
        kapazitaet: usize,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (sender, empfaenger) = bounded(kapazitaet);
        let handle = std::thread::Builder::new()
            .name("klangraum-aufnahme".into())
            .spawn(move || aufnahme_loop(aufnahme, empfaenger))?;
        Ok((
            Self {
                sender,
                verworfen: AtomicU64::new(0),
            },
            handle,
        ))
    }

    /// Bietet einen Frame an, verwirft bei vollem Kanal
    pub fn anbieten(&self, slot: SlotId, frame: &AudioFrame) {
        let auftrag = AufnahmeAuftrag::Frame(AufnahmeFrame {
            slot,
            frame: frame.clone(),
        });
        if let Err(TrySendError::Full(_)) = self.sender.try_send(auftrag) {
            let n = self.verworfen.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 1_000 == 1 {
                tracing::warn!(verworfen = n, "Aufnahme kommt nicht hinterher");
            }
        }
    }

    pub fn spur_beenden(&self, slot: SlotId) {
        let _ = self.sender.try_send(AufnahmeAuftrag::SpurEnde(slot));
    }

    pub fn verworfen(&self) -> u64 {
        self.verworfen.load(Ordering::Relaxed)
    }

    /// Schliesst die Aufnahme ab, ohne die Weiche zu droppen
    ///
    /// Bereits angebotene Frames werden noch geschrieben, danach ruft der
    /// Thread [`Aufnahme::beenden`] und endet. Spaetere Frames verfallen.
    pub fn beenden(&self) {
        if self
            .sender
            .send_timeout(AufnahmeAuftrag::Beenden, BEENDEN_TIMEOUT)
            .is_err()
        {
            tracing::warn!("Aufnahme-Thread nimmt keinen Beenden-Auftrag an");
        }
    }
}

fn aufnahme_loop(mut aufnahme: Box<dyn Aufnahme>, empfaenger: Receiver<AufnahmeAuftrag>) {
    tracing::debug!("Aufnahme-Thread gestartet");
    for auftrag in empfaenger.iter() {
        let ergebnis = match auftrag {
            AufnahmeAuftrag::Frame(frame) => aufnahme.frame_schreiben(&frame),
            AufnahmeAuftrag::SpurEnde(slot) => aufnahme.spur_beenden(slot),
            AufnahmeAuftrag::Beenden => break,
        };
        if let Err(e) = ergebnis {
            tracing::warn!("Aufnahme-Fehler: {}", e);
        }
    }
    if let Err(e) = aufnahme.beenden() {
        tracing::warn!("Aufnahme konnte nicht abgeschlossen werden: {}", e);
    }
    tracing::debug!("Aufnahme-Thread beendet");
}

#[cfg(test)]
mod tests {
    use super::*;
    use klangraum_protocol::codec::KanalAnzahl;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Sammler {
        frames: Arc<Mutex<Vec<(SlotId, i16)>>>,
        beendet: Arc<Mutex<Vec<SlotId>>>,
    }

    impl Aufnahme for Sammler {
        fn frame_schreiben(&mut self, frame: &AufnahmeFrame) -> std::io::Result<()> {
            self.frames.lock().push((frame.slot, frame.frame.samples()[0]));
            Ok(())
        }

        fn spur_beenden(&mut self, slot: SlotId) -> std::io::Result<()> {
            self.beendet.lock().push(slot);
            Ok(())
        }
    }

    #[test]
    fn frames_erreichen_die_aufnahme() {
        let sammler = Sammler::default();
        let frames = sammler.frames.clone();
        let beendet = sammler.beendet.clone();

        let (weiche, handle) = AufnahmeWeiche::starten(Box::new(sammler), 16).unwrap();
        let frame = AudioFrame::neu(KanalAnzahl::Mono, vec![7; 64]).unwrap();
        weiche.anbieten(SlotId(2), &frame);
        weiche.spur_beenden(SlotId(2));
        drop(weiche);
        handle.join().unwrap();

        assert_eq!(*frames.lock(), vec![(SlotId(2), 7)]);
        assert_eq!(*beendet.lock(), vec![SlotId(2)]);
    }

    #[derive(Default)]
    struct Zaehler {
        frames: Arc<Mutex<usize>>,
        abgeschlossen: Arc<Mutex<bool>>,
    }

    impl Aufnahme for Zaehler {
        fn frame_schreiben(&mut self, _frame: &AufnahmeFrame) -> std::io::Result<()> {
            *self.frames.lock() += 1;
            Ok(())
        }

        fn spur_beenden(&mut self, _slot: SlotId) -> std::io::Result<()> {
            Ok(())
        }

        fn beenden(&mut self) -> std::io::Result<()> {
            *self.abgeschlossen.lock() = true;
            Ok(())
        }
    }

    #[test]
    fn beenden_schreibt_rest_und_schliesst_ab() {
        let zaehler = Zaehler::default();
        let frames = zaehler.frames.clone();
        let abgeschlossen = zaehler.abgeschlossen.clone();

        let (weiche, handle) = AufnahmeWeiche::starten(Box::new(zaehler), 64).unwrap();
        let frame = AudioFrame::neu(KanalAnzahl::Mono, vec![1; 64]).unwrap();
        for _ in 0..20 {
            weiche.anbieten(SlotId(0), &frame);
        }
        // Weiche lebt weiter, der Thread endet trotzdem
        weiche.beenden();
        handle.join().unwrap();

        assert_eq!(*frames.lock(), 20);
        assert!(*abgeschlossen.lock());

        // Nach dem Ende verfallen Frames ohne Panik
        weiche.anbieten(SlotId(0), &frame);
    }
}
