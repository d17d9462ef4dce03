//! Adaptiver Jitter Buffer und Frame-Scheduler
//!
//! Ordnet eingehende Audio-Pakete nach Sequenznummer und gibt pro Tick genau
//! ein Ergebnis zurueck. Ein Tick blockiert nie: fehlt der erwartete Frame,
//! meldet der Buffer `Fehlt` und der Aufrufer verdeckt.
//!
//! ## Zustaende
//! - **Priming**: sammelt bis zum Ziel-Fuellstand, Ausgabe ist Stille
//! - **Steady**: pro Tick der naechste Frame oder `Fehlt`
//! - **Resyncing**: nach einem Sprung ausserhalb des Fensters, wie Priming
//!   aber ab der neuen Basis
//!
//! ## Modi
//! - **Adaptiv**: Ziel-Fuellstand folgt dem gemessenen Jitter
//! - **Fixed**: konstanter Ziel-Fuellstand (deterministische Latenz)
//!
//! Die Pakete liegen in einem `VecDeque<Option<_>>`, Index 0 ist immer die
//! naechste erwartete Sequenznummer. Damit ist Wrap-Around der `u32`-Sequenz
//! ohne Sonderfall abgedeckt.

use klangraum_protocol::voice::AudioPaket;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Glaettung der Jitter-Schaetzung (RFC 3550: 1/16)
const JITTER_GLAETTUNG: f64 = 1.0 / 16.0;

/// Ueberfuellung ab Ziel + diesem Wert
const UEBERFUELLUNG_TOLERANZ: usize = 2;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Modus des Jitter Buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterBufferModus {
    /// Ziel-Fuellstand passt sich dem gemessenen Jitter an
    #[default]
    Adaptiv,
    /// Konstanter Ziel-Fuellstand (`start_ziel`)
    Fixed,
}

/// Konfiguration fuer den Jitter Buffer
///
/// Alle Schwellen sind Tuning-Werte, kein Protokollbestandteil.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    pub modus: JitterBufferModus,
    /// Fenstergroesse in Frames; Spruenge darueber hinaus erzwingen Resync
    pub kapazitaet: usize,
    /// Ziel-Fuellstand beim Start und im Fixed-Modus
    pub start_ziel: usize,
    pub min_ziel: usize,
    pub max_ziel: usize,
    /// Zusaetzliche Frames ueber dem gemessenen Jitter
    pub sicherheit: usize,
    /// Ruhige Ticks bis das Ziel um einen Frame sinkt
    pub abkling_ticks: u32,
    /// Dauer eines Frames (Sende-Takt)
    pub frame_dauer: Duration,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            modus: JitterBufferModus::Adaptiv,
            kapazitaet: 64,
            start_ziel: 4,
            min_ziel: 2,
            max_ziel: 24,
            sicherheit: 1,
            abkling_ticks: 500,
            // 128 Samples bei 48 kHz
            frame_dauer: Duration::from_micros(2_667),
        }
    }
}

// ---------------------------------------------------------------------------
// Zustand & Ergebnis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterZustand {
    Priming,
    Steady,
    Resyncing,
}

/// Ergebnis eines Ticks
#[derive(Debug, Clone, PartialEq)]
pub enum TickErgebnis {
    /// Noch nicht genug gepuffert, Stille ausgeben
    Priming,
    /// Naechster Frame in Sequenz
    Frame(AudioPaket),
    /// Erwarteter Frame fehlt, Verdeckung ausgeben
    Fehlt { sequenz: u32 },
}

/// Statistiken des Jitter Buffers (Snapshot)
#[derive(Debug, Clone, Default)]
pub struct JitterBufferStatistik {
    pub empfangen: u64,
    pub abgespielt: u64,
    pub duplikate: u64,
    /// Zu spaet angekommen (bereits abgespielt oder uebersprungen)
    pub verspaetet: u64,
    /// Ticks ohne Frame
    pub fehlend: u64,
    /// Wegen Ueberfuellung verworfen
    pub verworfen: u64,
    pub resyncs: u64,
    pub fuellstand: usize,
    pub ziel: usize,
    pub jitter_ms: f64,
}

// ---------------------------------------------------------------------------
// AdaptiveJitterBuffer
// ---------------------------------------------------------------------------

/// Adaptiver Jitter Buffer fuer eine Verbindung
///
/// Nicht thread-safe, die Synchronisation liegt beim Slot-Lock des Mixers.
pub struct AdaptiveJitterBuffer {
    config: JitterBufferConfig,
    zustand: JitterZustand,
    /// Index 0 = `naechste`
    fenster: VecDeque<Option<AudioPaket>>,
    naechste: Option<u32>,
    belegt: usize,
    ziel: usize,
    ruhige_ticks: u32,
    fehlend_in_folge: usize,
    /// Geglaetteter Jitter in Sekunden
    jitter: f64,
    letzte_ankunft: Option<(u32, Instant)>,
    statistik: JitterBufferStatistik,
}

impl AdaptiveJitterBuffer {
    pub fn neu(config: JitterBufferConfig) -> Self {
        let ziel = config.start_ziel.clamp(config.min_ziel, config.max_ziel);
        Self {
            fenster: VecDeque::with_capacity(config.kapazitaet),
            config,
            zustand: JitterZustand::Priming,
            naechste: None,
            belegt: 0,
            ziel,
            ruhige_ticks: 0,
            fehlend_in_folge: 0,
            jitter: 0.0,
            letzte_ankunft: None,
            statistik: JitterBufferStatistik::default(),
        }
    }

    pub fn standard() -> Self {
        Self::neu(JitterBufferConfig::default())
    }

    /// Fuegt ein Paket ein
    ///
    /// Erkennt Duplikate, Verspaetungen und Spruenge ausserhalb des
    /// Fensters (Resync).
    pub fn einfuegen(&mut self, paket: AudioPaket, ankunft: Instant) {
        let seq = paket.sequenz;
        self.statistik.empfangen += 1;
        self.jitter_messen(seq, ankunft);

        let Some(naechste) = self.naechste else {
            self.basis_setzen(paket);
            return;
        };

        let kapazitaet = self.config.kapazitaet;
        if ist_sequenz_alt(seq, naechste) {
            let rueckstand = naechste.wrapping_sub(seq) as usize;
            if rueckstand > kapazitaet {
                tracing::debug!(sequenz = seq, erwartet = naechste, "Sequenz weit zurueck, Resync");
                self.resync(paket);
            } else if self.zustand != JitterZustand::Steady
                && self.fenster.len() + rueckstand <= kapazitaet
            {
                // Vor dem ersten Abspielen darf die Basis nach vorne wandern
                for _ in 0..rueckstand {
                    self.fenster.push_front(None);
                }
                self.naechste = Some(seq);
                self.fenster[0] = Some(paket);
                self.belegt += 1;
            } else {
                self.statistik.verspaetet += 1;
                tracing::trace!(sequenz = seq, erwartet = naechste, "Verspaetetes Paket verworfen");
            }
            return;
        }

        let abstand = seq.wrapping_sub(naechste) as usize;
        if abstand >= kapazitaet {
            tracing::debug!(sequenz = seq, erwartet = naechste, "Sequenz-Sprung, Resync");
            self.resync(paket);
            return;
        }

        if self.fenster.len() <= abstand {
            self.fenster.resize(abstand + 1, None);
        }
        if self.fenster[abstand].is_some() {
            self.statistik.duplikate += 1;
            return;
        }
        self.fenster[abstand] = Some(paket);
        self.belegt += 1;

        if self.zustand == JitterZustand::Steady {
            self.ueberfuellung_abbauen();
        }
        self.statistik.fuellstand = self.belegt;
    }

    /// Ein Frame-Takt: liefert den naechsten Frame, `Fehlt` oder `Priming`
    pub fn tick(&mut self) -> TickErgebnis {
        if self.config.modus == JitterBufferModus::Adaptiv {
            self.ziel_anpassen();
        }

        if self.zustand != JitterZustand::Steady {
            if self.naechste.is_none() || self.belegt < self.ziel {
                return TickErgebnis::Priming;
            }
            tracing::trace!(ziel = self.ziel, "Jitter Buffer gefuellt");
            self.zustand = JitterZustand::Steady;
        }

        let Some(sequenz) = self.naechste else {
            return TickErgebnis::Priming;
        };
        self.naechste = Some(sequenz.wrapping_add(1));
        self.statistik.fuellstand = self.belegt;

        match self.fenster.pop_front().flatten() {
            Some(paket) => {
                self.belegt -= 1;
                self.fehlend_in_folge = 0;
                self.statistik.abgespielt += 1;
                self.statistik.fuellstand = self.belegt;
                TickErgebnis::Frame(paket)
            }
            None => {
                self.statistik.fehlend += 1;
                self.fehlend_in_folge += 1;
                if self.belegt == 0 && self.fehlend_in_folge >= self.config.kapazitaet {
                    // Sender verstummt: veralteten Zustand verwerfen
                    tracing::debug!(sequenz, "Jitter Buffer gealtert, neues Priming");
                    self.zuruecksetzen();
                }
                TickErgebnis::Fehlt { sequenz }
            }
        }
    }

    /// Verwirft alle Pakete und die Sequenz-Basis
    pub fn zuruecksetzen(&mut self) {
        self.fenster.clear();
        self.belegt = 0;
        self.naechste = None;
        self.fehlend_in_folge = 0;
        self.letzte_ankunft = None;
        self.zustand = JitterZustand::Priming;
        self.statistik.fuellstand = 0;
    }

    pub fn zustand(&self) -> JitterZustand {
        self.zustand
    }

    pub fn fuellstand(&self) -> usize {
        self.belegt
    }

    pub fn ziel(&self) -> usize {
        self.ziel
    }

    /// Geglaetteter Jitter in Millisekunden
    pub fn jitter_ms(&self) -> f64 {
        self.jitter * 1_000.0
    }

    pub fn statistik(&self) -> JitterBufferStatistik {
        let mut s = self.statistik.clone();
        s.ziel = self.ziel;
        s.jitter_ms = self.jitter_ms();
        s
    }

    // -----------------------------------------------------------------------
    // Interne Hilfsfunktionen
    // -----------------------------------------------------------------------

    fn basis_setzen(&mut self, paket: AudioPaket) {
        self.fenster.clear();
        self.naechste = Some(paket.sequenz);
        self.fenster.push_back(Some(paket));
        self.belegt = 1;
        self.fehlend_in_folge = 0;
        self.statistik.fuellstand = 1;
    }

    fn resync(&mut self, paket: AudioPaket) {
        self.statistik.resyncs += 1;
        self.basis_setzen(paket);
        self.zustand = JitterZustand::Resyncing;
    }

    /// Verwirft die aeltesten Frames bis der Fuellstand wieder passt
    fn ueberfuellung_abbauen(&mut self) {
        let grenze = self.ziel + UEBERFUELLUNG_TOLERANZ;
        while self.belegt > grenze {
            let Some(naechste) = self.naechste else {
                break;
            };
            if self.fenster.pop_front().flatten().is_some() {
                self.belegt -= 1;
                self.statistik.verworfen += 1;
                tracing::trace!(sequenz = naechste, "Ueberfuellung: Frame verworfen");
            }
            self.naechste = Some(naechste.wrapping_add(1));
        }
    }

    /// Interarrival-Jitter nach RFC 3550, bezogen auf den Sende-Takt
    fn jitter_messen(&mut self, seq: u32, ankunft: Instant) {
        if let Some((letzte_seq, letzte_ankunft)) = self.letzte_ankunft {
            let seq_abstand = seq.wrapping_sub(letzte_seq) as i32 as f64;
            let ankunft_abstand = if ankunft >= letzte_ankunft {
                (ankunft - letzte_ankunft).as_secs_f64()
            } else {
                -(letzte_ankunft - ankunft).as_secs_f64()
            };
            let abweichung =
                (ankunft_abstand - seq_abstand * self.config.frame_dauer.as_secs_f64()).abs();
            self.jitter += (abweichung - self.jitter) * JITTER_GLAETTUNG;
        }
        self.letzte_ankunft = Some((seq, ankunft));
    }

    /// Ziel waechst sofort mit dem Jitter und sinkt langsam
    fn ziel_anpassen(&mut self) {
        let frame = self.config.frame_dauer.as_secs_f64();
        let jitter_frames = if frame > 0.0 {
            (self.jitter / frame).ceil() as usize
        } else {
            0
        };
        let benoetigt =
            (jitter_frames + self.config.sicherheit).clamp(self.config.min_ziel, self.config.max_ziel);

        if benoetigt > self.ziel {
            tracing::trace!(alt = self.ziel, neu = benoetigt, "Jitter-Ziel erhoeht");
            self.ziel = benoetigt;
            self.ruhige_ticks = 0;
        } else if benoetigt < self.ziel {
            self.ruhige_ticks += 1;
            if self.ruhige_ticks >= self.config.abkling_ticks {
                self.ziel -= 1;
                self.ruhige_ticks = 0;
            }
        } else {
            self.ruhige_ticks = 0;
        }
    }
}

/// Prueft ob `seq` aelter als `referenz` ist (mit Wrap-Around-Behandlung)
///
/// RTP-Konvention: Differenz > 2^31 gilt als "aelter".
fn ist_sequenz_alt(seq: u32, referenz: u32) -> bool {
    seq.wrapping_sub(referenz) > u32::MAX / 2
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
