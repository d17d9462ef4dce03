//! Mix-Takt: eigener OS-Thread, der `MixEngine::tick` im Frame-Raster aufruft
//!
//! Die Deadlines sind absolut (`start + n * periode`), Verspaetungen einzelner
//! Ticks summieren sich daher nicht. Liegt der Takt mehr als
//! [`MAX_RUECKSTAND`] Perioden zurueck, wird das Raster neu verankert statt
//! die verpassten Ticks nachzuholen.
//!
//! Ausgehende Datagramme gehen per `try_send` an die Sende-Queue; bei voller
//! Queue wird verworfen, der Takt wartet nie auf das Netz.

use crate::mixer::MixEngine;
use crate::udp::Ausgehend;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Perioden Rueckstand, ab denen das Raster neu verankert wird
pub const MAX_RUECKSTAND: u32 = 8;

/// Laufender Mix-Takt
pub struct MixTakt {
    laeuft: Arc<AtomicBool>,
    verworfen: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MixTakt {
    /// Startet den Takt-Thread
    pub fn starten(
        engine: Arc<MixEngine>,
        sender: mpsc::Sender<Ausgehend>,
    ) -> std::io::Result<Self> {
        let periode = engine.config().tick_dauer();
        let laeuft = Arc::new(AtomicBool::new(true));
        let verworfen = Arc::new(AtomicU64::new(0));

        let laeuft_t = Arc::clone(&laeuft);
        let verworfen_t = Arc::clone(&verworfen);
        let handle = std::thread::Builder::new()
            .name("klangraum-mix-takt".to_string())
            .spawn(move || takt_loop(engine, sender, periode, laeuft_t, verworfen_t))?;

        tracing::info!(periode_us = periode.as_micros() as u64, "Mix-Takt gestartet");
        Ok(Self {
            laeuft,
            verworfen,
            handle: Some(handle),
        })
    }

    /// Wegen voller Sende-Queue verworfene Datagramme
    pub fn verworfen(&self) -> u64 {
        self.verworfen.load(Ordering::Relaxed)
    }

    /// Geteilter Zaehler fuer Metrik-Abfragen ohne Zugriff auf den Takt
    pub fn verworfen_zaehler(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.verworfen)
    }

    /// Stoppt den Takt und wartet auf das Thread-Ende
    pub fn stoppen(mut self) {
        self.anhalten();
    }

    fn anhalten(&mut self) {
        self.laeuft.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Mix-Takt-Thread ist abgestuerzt");
            }
        }
    }
}

impl Drop for MixTakt {
    fn drop(&mut self) {
        self.anhalten();
    }
}

fn takt_loop(
    engine: Arc<MixEngine>,
    sender: mpsc::Sender<Ausgehend>,
    periode: Duration,
    laeuft: Arc<AtomicBool>,
    verworfen: Arc<AtomicU64>,
) {
    let mut naechster = Instant::now() + periode;
    let mut neu_verankert: u64 = 0;

    while laeuft.load(Ordering::Acquire) {
        let jetzt = Instant::now();
        if naechster > jetzt {
            std::thread::sleep(naechster - jetzt);
        }

        for ausgabe in engine.tick() {
            if sender.try_send((ausgabe.adresse, ausgabe.datagramm)).is_err() {
                let n = verworfen.fetch_add(1, Ordering::Relaxed) + 1;
                if n % 1_000 == 1 {
                    tracing::warn!(verworfen = n, "Sende-Queue voll, Mix-Datagramme verworfen");
                }
            }
        }

        naechster += periode;
        let jetzt = Instant::now();
        if jetzt > naechster + periode * MAX_RUECKSTAND {
            neu_verankert += 1;
            tracing::warn!(
                rueckstand_ms = (jetzt - naechster).as_millis() as u64,
                neu_verankert,
                "Mix-Takt hinkt hinterher, Raster neu verankert"
            );
            naechster = jetzt + periode;
        }
    }
    tracing::info!("Mix-Takt beendet");
}
