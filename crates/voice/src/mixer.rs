//! Server-Mix-Engine – ein persoenlicher Mix pro Kanal-Slot
//!
//! Die Slots liegen in einer Arena fester Groesse, jeder hinter einem eigenen
//! kurzen `parking_lot::Mutex`. Der UDP-Task belegt, fuettert und gibt Slots
//! frei, der Mix-Takt ruft einmal pro Frame-Periode [`MixEngine::tick`].
//! Es werden nie zwei Slot-Locks gleichzeitig gehalten.
//!
//! ## Ablauf eines Ticks
//! 1. **Dekodieren**: pro belegtem Slot (stabilste Verbindung zuerst) Jitter
//!    Buffer ticken, dekodieren oder verdecken, auf die Engine-Blockgroesse
//!    bringen. Ist das Budget ueberschritten, werden die restlichen Eingaenge
//!    in diesem Tick nur verdeckt (Lastabwurf).
//! 2. **Mischen**: pro Slot `i` die Summe aller anderen freigegebenen Slots
//!    mit Gain/Pan aus Sicht von `i`, begrenzt auf den i16-Bereich.
//! 3. **Kodieren**: auf die Frame-Groesse der Verbindung bringen, kodieren,
//!    Sequenz stempeln, Datagramme zurueckgeben.

use crate::aufnahme::AufnahmeWeiche;
use crate::jitter_buffer::{AdaptiveJitterBuffer, JitterBufferConfig, TickErgebnis};
use crate::lizenz::{LizenzStatus, LizenzTor};
use bytes::Bytes;
use klangraum_audio::{
    begrenzen, codec_erstellen, mischen_in, AudioFrame, BlockAdapter, FrameCodec, FrameDecoder,
    KanalGain,
};
use klangraum_core::{KlangraumError, Result, SlotId};
use klangraum_protocol::codec::{FrameFormat, FrameGroesse};
use klangraum_protocol::voice::AudioPaket;
use klangraum_protocol::Nachricht;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Harte Obergrenze fuer Kanal-Slots (Mix-Aufwand waechst quadratisch)
pub const MAX_NUM_CHANNELS: usize = 150;

/// Bloecke, die ein Block-Adapter hoechstens puffert
const ADAPTER_BLOECKE: usize = 4;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MixConfig {
    pub max_kanaele: usize,
    /// Blockgroesse des Mix-Takts
    pub frame_groesse: FrameGroesse,
    pub jitter: JitterBufferConfig,
    /// Zeit fuer die Dekodier-Phase, danach wird Last abgeworfen
    pub mix_budget: Duration,
    pub lizenz_erforderlich: bool,
}

impl Default for MixConfig {
    fn default() -> Self {
        let frame_groesse = FrameGroesse::default();
        Self {
            max_kanaele: 10,
            frame_groesse,
            jitter: JitterBufferConfig::default(),
            mix_budget: frame_groesse.dauer() / 2,
            lizenz_erforderlich: false,
        }
    }
}

impl MixConfig {
    /// Periode des Mix-Takts
    pub fn tick_dauer(&self) -> Duration {
        self.frame_groesse.dauer()
    }
}

// ---------------------------------------------------------------------------
// Ausgabe & Statistik
// ---------------------------------------------------------------------------

/// Ein fertig kodiertes Datagramm fuer eine Verbindung
#[derive(Debug, Clone)]
pub struct MixAusgabe {
    pub adresse: SocketAddr,
    pub slot: SlotId,
    pub datagramm: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct MixStatistik {
    pub ticks: u64,
    pub ueberlast_ticks: u64,
    /// Eingaenge, die wegen Ueberlast nur verdeckt wurden
    pub abgeworfene_eingaenge: u64,
    pub verdeckte_frames: u64,
    pub uebersteuerte_samples: u64,
}

#[derive(Default)]
struct MixZaehler {
    ticks: AtomicU64,
    ueberlast_ticks: AtomicU64,
    abgeworfene_eingaenge: AtomicU64,
    verdeckte_frames: AtomicU64,
    uebersteuerte_samples: AtomicU64,
}

// ---------------------------------------------------------------------------
// Slot-Zustand
// ---------------------------------------------------------------------------

/// Alles, was ein belegter Slot fuer Empfang, Mix und Versand braucht
struct SlotZustand {
    adresse: SocketAddr,
    format: FrameFormat,
    lizenz: LizenzStatus,
    jitter: AdaptiveJitterBuffer,
    decoder: FrameDecoder,
    encoder: Box<dyn FrameCodec>,
    /// Verbindungs-Frames → Engine-Bloecke
    eingang: BlockAdapter,
    /// Engine-Bloecke → Verbindungs-Frames
    ausgang: BlockAdapter,
    sende_seq: u32,
    /// Gain/Pan pro Quell-Slot aus Sicht dieses Hoerers
    gains: Vec<KanalGain>,
}

impl SlotZustand {
    fn neu(
        adresse: SocketAddr,
        format: FrameFormat,
        config: &MixConfig,
        lizenz: LizenzStatus,
    ) -> Result<Self> {
        let kanaele = format.kanaele.anzahl();
        let engine_block = config.frame_groesse.samples() * kanaele;
        let verbindungs_block = format.samples_gesamt();
        let kapazitaet = ADAPTER_BLOECKE * engine_block.max(verbindungs_block);
        let adapter = |block| {
            BlockAdapter::neu(block, kapazitaet).map_err(|e| KlangraumError::Audio(e.to_string()))
        };

        let jitter_config = JitterBufferConfig {
            frame_dauer: format.frame_dauer(),
            ..config.jitter.clone()
        };

        Ok(Self {
            adresse,
            format,
            lizenz,
            jitter: AdaptiveJitterBuffer::neu(jitter_config),
            decoder: FrameDecoder::neu(format),
            encoder: codec_erstellen(format),
            eingang: adapter(engine_block)?,
            ausgang: adapter(verbindungs_block)?,
            sende_seq: 0,
            gains: vec![KanalGain::default(); config.max_kanaele],
        })
    }

    /// Fuellt den Eingangs-Adapter bis ein Engine-Block bereitsteht
    ///
    /// Gibt den Block und die Zahl verdeckter Frames zurueck.
    fn engine_block(&mut self, abwerfen: bool) -> (Option<AudioFrame>, u64) {
        let mut verdeckt = 0;
        while self.eingang.bloecke_verfuegbar() == 0 {
            let frame = match self.jitter.tick() {
                TickErgebnis::Priming => AudioFrame::stille(&self.format),
                TickErgebnis::Frame(_) | TickErgebnis::Fehlt { .. } if abwerfen => {
                    verdeckt += 1;
                    self.decoder.ueberspringen().into_frame()
                }
                TickErgebnis::Frame(paket) => {
                    let ergebnis = self.decoder.dekodieren(Some(&paket.nutzdaten));
                    if ergebnis.ist_verdeckt() {
                        verdeckt += 1;
                    }
                    ergebnis.into_frame()
                }
                TickErgebnis::Fehlt { .. } => {
                    verdeckt += 1;
                    self.decoder.dekodieren(None).into_frame()
                }
            };
            self.eingang.einspeisen(frame.samples());
        }
        let block = self
            .eingang
            .block_entnehmen()
            .and_then(|samples| AudioFrame::neu(self.format.kanaele, samples));
        (block, verdeckt)
    }

    /// Kodiert einen Verbindungs-Frame und verpackt ihn als Datagramm
    fn datagramm(&mut self, samples: Vec<i16>) -> Option<Bytes> {
        let frame = AudioFrame::neu(self.format.kanaele, samples)?;
        let nutzdaten = match self.encoder.encode(&frame) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(adresse = %self.adresse, "Mix konnte nicht kodiert werden: {}", e);
                return None;
            }
        };
        let paket = AudioPaket::neu(self.sende_seq, nutzdaten);
        self.sende_seq = self.sende_seq.wrapping_add(1);
        match Nachricht::Audio(paket).encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(adresse = %self.adresse, "Mix-Datagramm fehlerhaft: {}", e);
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MixEngine
// ---------------------------------------------------------------------------

/// Slot-Arena und Mix-Logik
pub struct MixEngine {
    config: MixConfig,
    lizenz: LizenzTor,
    slots: Box<[Mutex<Option<SlotZustand>>]>,
    aufnahme: Option<AufnahmeWeiche>,
    zaehler: MixZaehler,
}

impl MixEngine {
    pub fn neu(config: MixConfig) -> Result<Self> {
        if config.max_kanaele == 0 || config.max_kanaele > MAX_NUM_CHANNELS {
            return Err(KlangraumError::Konfiguration(format!(
                "max_kanaele muss zwischen 1 und {MAX_NUM_CHANNELS} liegen, ist {}",
                config.max_kanaele
            )));
        }
        let slots = (0..config.max_kanaele)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            lizenz: LizenzTor::neu(config.lizenz_erforderlich),
            config,
            slots,
            aufnahme: None,
            zaehler: MixZaehler::default(),
        })
    }

    /// Leitet dekodierte Frames zusaetzlich an eine Aufnahme
    pub fn mit_aufnahme(mut self, weiche: AufnahmeWeiche) -> Self {
        self.aufnahme = Some(weiche);
        self
    }

    /// Schliesst eine angebundene Aufnahme ab, nach dem letzten Tick aufrufen
    pub fn aufnahme_beenden(&self) {
        if let Some(aufnahme) = &self.aufnahme {
            aufnahme.beenden();
        }
    }

    pub fn config(&self) -> &MixConfig {
        &self.config
    }

    pub fn lizenz_tor(&self) -> LizenzTor {
        self.lizenz
    }

    pub fn max_kanaele(&self) -> usize {
        self.slots.len()
    }

    // -----------------------------------------------------------------------
    // Slot-Verwaltung (UDP-Task)
    // -----------------------------------------------------------------------

    /// Belegt den ersten freien Slot
    ///
    /// # Fehler
    /// `ServerVoll` wenn alle Slots belegt sind.
    pub fn slot_belegen(&self, adresse: SocketAddr, format: FrameFormat) -> Result<SlotId> {
        let zustand = SlotZustand::neu(adresse, format, &self.config, self.lizenz.anfangs_status())?;
        let mut zustand = Some(zustand);

        let mut belegt = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.lock().is_some() {
                continue;
            }
            // Einstellungen frueherer Belegungen gelten nicht fuer den Neuen;
            // zuruecksetzen, bevor der Slot gemischt werden kann
            self.gains_zuruecksetzen(i);
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = zustand.take();
                belegt = Some(SlotId(i as u16));
                break;
            }
        }
        let slot = belegt.ok_or(KlangraumError::ServerVoll {
            max: self.slots.len(),
        })?;
        tracing::debug!(adresse = %adresse, slot = %slot, "Slot belegt");
        Ok(slot)
    }

    /// Setzt bei allen Hoerern den Gain fuer `quelle` auf den Standard
    fn gains_zuruecksetzen(&self, quelle: usize) {
        for (i, hoerer) in self.slots.iter().enumerate() {
            if i == quelle {
                continue;
            }
            if let Some(z) = hoerer.lock().as_mut() {
                z.gains[quelle] = KanalGain::default();
            }
        }
    }

    /// Setzt einen belegten Slot nach erneutem Handshake zurueck
    ///
    /// Jitter Buffer, Codecs, Sequenz und Lizenz beginnen neu.
    pub fn slot_zuruecksetzen(
        &self,
        slot: SlotId,
        adresse: SocketAddr,
        format: FrameFormat,
    ) -> Result<()> {
        let frisch = SlotZustand::neu(adresse, format, &self.config, self.lizenz.anfangs_status())?;
        let eintrag = self.slots.get(slot.index()).ok_or(KlangraumError::SlotFrei(slot.0))?;
        let alt = {
            let mut guard = eintrag.lock();
            match guard.as_ref().map(|z| z.adresse) {
                None => return Err(KlangraumError::SlotFrei(slot.0)),
                Some(belegt) if belegt != adresse => {
                    return Err(KlangraumError::intern(format!(
                        "{slot} gehoert {belegt} statt {adresse}"
                    )));
                }
                Some(_) => guard.replace(frisch),
            }
        };
        drop(alt);
        Ok(())
    }

    /// Gibt einen Slot frei
    ///
    /// Der Slot ist nach dem kurzen Lock sofort frei; die Puffer werden erst
    /// danach abgebaut, ein laufender Tick sieht also entweder den ganzen
    /// Zustand oder gar keinen.
    pub fn slot_freigeben(&self, slot: SlotId) -> bool {
        let Some(eintrag) = self.slots.get(slot.index()) else {
            return false;
        };
        let alt = eintrag.lock().take();
        let war_belegt = alt.is_some();
        drop(alt);
        if war_belegt {
            if let Some(aufnahme) = &self.aufnahme {
                aufnahme.spur_beenden(slot);
            }
            tracing::debug!(slot = %slot, "Slot freigegeben");
        }
        war_belegt
    }

    /// Legt ein empfangenes Audio-Paket in den Jitter Buffer des Slots
    pub fn audio_einspeisen(&self, slot: SlotId, paket: AudioPaket, ankunft: Instant) -> bool {
        self.mit_slot(slot, |z| z.jitter.einfuegen(paket, ankunft)).is_some()
    }

    /// Setzt Gain/Pan von `quelle` im Mix von `hoerer`
    pub fn gain_setzen(&self, hoerer: SlotId, quelle: SlotId, gain: KanalGain) -> bool {
        if quelle.index() >= self.slots.len() {
            return false;
        }
        self.mit_slot(hoerer, |z| z.gains[quelle.index()] = gain).is_some()
    }

    /// Verarbeitet die Lizenz-Zustimmung; `true` bei Statuswechsel
    pub fn lizenz_akzeptieren(&self, slot: SlotId) -> bool {
        let tor = self.lizenz;
        self.mit_slot(slot, |z| tor.akzeptieren(&mut z.lizenz)).unwrap_or(false)
    }

    pub fn lizenz_status(&self, slot: SlotId) -> Option<LizenzStatus> {
        self.mit_slot(slot, |z| z.lizenz)
    }

    pub fn belegte_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().is_some()).count()
    }

    /// Geschaetzter Jitter pro belegtem Slot in Millisekunden
    pub fn jitter_ms(&self) -> Vec<(SlotId, f64)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.lock().as_ref().map(|z| (SlotId(i as u16), z.jitter.jitter_ms())))
            .collect()
    }

    pub fn statistik(&self) -> MixStatistik {
        let z = &self.zaehler;
        MixStatistik {
            ticks: z.ticks.load(Ordering::Relaxed),
            ueberlast_ticks: z.ueberlast_ticks.load(Ordering::Relaxed),
            abgeworfene_eingaenge: z.abgeworfene_eingaenge.load(Ordering::Relaxed),
            verdeckte_frames: z.verdeckte_frames.load(Ordering::Relaxed),
            uebersteuerte_samples: z.uebersteuerte_samples.load(Ordering::Relaxed),
        }
    }

    fn mit_slot<T>(&self, slot: SlotId, f: impl FnOnce(&mut SlotZustand) -> T) -> Option<T> {
        let eintrag = self.slots.get(slot.index())?;
        let mut guard = eintrag.lock();
        guard.as_mut().map(f)
    }

    // -----------------------------------------------------------------------
    // Mix-Takt
    // -----------------------------------------------------------------------

    /// Ein Frame-Takt ueber alle Slots
    pub fn tick(&self) -> Vec<MixAusgabe> {
        let tick = self.zaehler.ticks.fetch_add(1, Ordering::Relaxed);
        let bloecke = self.dekodieren();
        let ausgaben = self.mischen(&bloecke);
        tracing::trace!(tick, ausgaben = ausgaben.len(), "Mix-Tick");
        ausgaben
    }

    /// Phase 1: ein Engine-Block pro mischbarem Slot
    fn dekodieren(&self) -> Vec<Option<AudioFrame>> {
        let mut reihenfolge: Vec<(usize, f64)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.lock().as_ref().map(|z| (i, z.jitter.jitter_ms())))
            .collect();
        reihenfolge.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut bloecke: Vec<Option<AudioFrame>> = vec![None; self.slots.len()];
        let start = Instant::now();
        let mut abgeworfen = 0u64;
        let mut verdeckt_gesamt = 0u64;

        for (n, &(i, _)) in reihenfolge.iter().enumerate() {
            let abwerfen = n > 0 && start.elapsed() >= self.config.mix_budget;
            let mut guard = self.slots[i].lock();
            let Some(zustand) = guard.as_mut() else {
                continue;
            };
            let (block, verdeckt) = zustand.engine_block(abwerfen);
            let mischbar = LizenzTor::darf_gemischt_werden(zustand.lizenz);
            drop(guard);

            verdeckt_gesamt += verdeckt;
            if abwerfen {
                abgeworfen += 1;
            }
            if !mischbar {
                continue;
            }
            if let (Some(aufnahme), Some(block), false) = (&self.aufnahme, &block, abwerfen) {
                aufnahme.anbieten(SlotId(i as u16), block);
            }
            bloecke[i] = block;
        }

        self.zaehler
            .verdeckte_frames
            .fetch_add(verdeckt_gesamt, Ordering::Relaxed);
        if abgeworfen > 0 {
            self.zaehler
                .abgeworfene_eingaenge
                .fetch_add(abgeworfen, Ordering::Relaxed);
            let n = self.zaehler.ueberlast_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 1_000 == 1 {
                tracing::warn!(
                    ueberlast_ticks = n,
                    abgeworfen,
                    budget_us = self.config.mix_budget.as_micros() as u64,
                    "Mix-Budget ueberschritten, Eingaenge abgeworfen"
                );
            }
        }
        bloecke
    }

    /// Phase 2+3: Mix pro Hoerer, kodieren, verpacken
    fn mischen(&self, bloecke: &[Option<AudioFrame>]) -> Vec<MixAusgabe> {
        let engine_n = self.config.frame_groesse.samples();
        let mut ausgaben = Vec::with_capacity(bloecke.len());
        let mut uebersteuert = 0u64;

        for (i, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock();
            let Some(zustand) = guard.as_mut() else {
                continue;
            };
            let kanaele = zustand.format.kanaele;
            let mut akku = vec![0.0f32; engine_n * kanaele.anzahl()];

            // Nicht freigegebene Hoerer bekommen Stille
            if LizenzTor::darf_gemischt_werden(zustand.lizenz) {
                for (j, block) in bloecke.iter().enumerate() {
                    if j == i {
                        continue;
                    }
                    if let Some(block) = block {
                        mischen_in(&mut akku, block, kanaele, zustand.gains[j]);
                    }
                }
            }

            let mut mix = vec![0i16; akku.len()];
            uebersteuert += begrenzen(&akku, &mut mix) as u64;
            zustand.ausgang.einspeisen(&mix);

            while let Some(samples) = zustand.ausgang.block_entnehmen() {
                if let Some(datagramm) = zustand.datagramm(samples) {
                    ausgaben.push(MixAusgabe {
                        adresse: zustand.adresse,
                        slot: SlotId(i as u16),
                        datagramm,
                    });
                }
            }
        }

        if uebersteuert > 0 {
            self.zaehler
                .uebersteuerte_samples
                .fetch_add(uebersteuert, Ordering::Relaxed);
        }
        ausgaben
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
