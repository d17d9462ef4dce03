//! UDP Jam-Server – Empfangs-Loop, Dispatch und Sende-Task
//!
//! Ein Socket fuer alles: Audio, Steuerung und Verzeichnis.
//!
//! ## Architektur
//!
//! ```text
//! UDP Socket (recv_from)
//!     |
//!     v
//! Nachricht::decode()            <- Kennung, Version, Laenge, CRC
//!     |
//!     +-- Audio -----------> MixEngine::audio_einspeisen (Jitter Buffer)
//!     +-- Steuerung -------> VerbindungsRegister / MixEngine
//!     +-- Verzeichnis -----> ServerListe / VerzeichnisDienst (mpsc)
//!
//! MixTakt-Thread ---try_send---+
//! Dispatch ---------try_send---+--> Sende-Queue (mpsc) --> send_to Task
//! VerzeichnisDienst -----------+
//! ```
//!
//! Lebenszyklus-Uebergaenge werden als `SitzungsEreignis` per broadcast
//! gemeldet (Historie, Status).

use crate::mixer::MixEngine;
use crate::state::{Trennung, VerbindungsRegister, VERBINDUNGS_TIMEOUT};
use bytes::Bytes;
use klangraum_audio::KanalGain;
use klangraum_core::{KlangraumError, SitzungsEreignis, SlotId, TrennGrund};
use klangraum_protocol::control::{
    ChatNachricht, GainSetzen, KanalInfo, Kick, LizenzTyp, Ping, ServerInfo, Trennen, Verbinden,
    VerbindungBestaetigt,
};
use klangraum_protocol::wire::MAX_DATAGRAMM_LAENGE;
use klangraum_protocol::Nachricht;
use klangraum_session::{ServerListe, VerzeichnisAuftrag, VerzeichnisEreignis};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Ein zu versendendes Datagramm
pub type Ausgehend = (SocketAddr, Bytes);

/// Intervall der Timeout-Pruefung im Empfangs-Loop
const WARTUNGS_INTERVALL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VoiceServerConfig {
    /// Bind-Adresse (z.B. "0.0.0.0:22124")
    pub bind_addr: SocketAddr,
    /// Groesse der gemeinsamen Sende-Queue
    pub send_queue_groesse: usize,
    pub verbindungs_timeout: Duration,
    /// Wird mit `VerbindungBestaetigt` verschickt
    pub willkommen: Option<String>,
    /// Unerreichbare Server in `ServerListe`-Antworten zeigen
    pub alle_anzeigen: bool,
}

impl VoiceServerConfig {
    pub fn neu(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            send_queue_groesse: 1024,
            verbindungs_timeout: VERBINDUNGS_TIMEOUT,
            willkommen: None,
            alle_anzeigen: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistik
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct VoiceStatistik {
    pub empfangen: u64,
    /// Nicht dekodierbare oder unerwartete Datagramme
    pub verworfen: u64,
    /// Wegen voller Sende-Queue nicht versendete Datagramme
    pub sende_verworfen: u64,
}

#[derive(Default)]
struct VoiceZaehler {
    empfangen: AtomicU64,
    verworfen: AtomicU64,
    sende_verworfen: AtomicU64,
}

// ---------------------------------------------------------------------------
// VoiceServer
// ---------------------------------------------------------------------------

/// Anbindung an den Verzeichnis-Teil
#[derive(Default)]
struct VerzeichnisAnbindung {
    /// Nur gesetzt, wenn dieser Server selbst Verzeichnis ist
    liste: Option<Arc<ServerListe>>,
    ereignisse: Option<mpsc::Sender<VerzeichnisEreignis>>,
}

/// UDP Jam-Server
pub struct VoiceServer {
    config: VoiceServerConfig,
    socket: Arc<UdpSocket>,
    engine: Arc<MixEngine>,
    register: VerbindungsRegister,
    ereignisse: broadcast::Sender<SitzungsEreignis>,
    sende_tx: mpsc::Sender<Ausgehend>,
    _sende_task: tokio::task::JoinHandle<()>,
    verzeichnis: VerzeichnisAnbindung,
    zaehler: VoiceZaehler,
}

impl VoiceServer {
    /// Bindet den UDP-Socket und startet den Sende-Task
    pub async fn binden(
        config: VoiceServerConfig,
        engine: Arc<MixEngine>,
        register: VerbindungsRegister,
        ereignisse: broadcast::Sender<SitzungsEreignis>,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        tracing::info!(addr = %socket.local_addr()?, "UDP Jam-Server gebunden");

        let (sende_tx, sende_rx) = mpsc::channel(config.send_queue_groesse);
        let sende_task = tokio::spawn(sende_loop(Arc::clone(&socket), sende_rx));

        Ok(Self {
            config,
            socket,
            engine,
            register,
            ereignisse,
            sende_tx,
            _sende_task: sende_task,
            verzeichnis: VerzeichnisAnbindung::default(),
            zaehler: VoiceZaehler::default(),
        })
    }

    /// Verbindet den Server mit Verzeichnis-Liste und -Dienst
    pub fn verzeichnis_anbinden(
        &mut self,
        liste: Option<Arc<ServerListe>>,
        ereignisse: Option<mpsc::Sender<VerzeichnisEreignis>>,
    ) {
        self.verzeichnis = VerzeichnisAnbindung { liste, ereignisse };
    }

    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Eingang der Sende-Queue (fuer den Mix-Takt)
    pub fn sender(&self) -> mpsc::Sender<Ausgehend> {
        self.sende_tx.clone()
    }

    pub fn register(&self) -> &VerbindungsRegister {
        &self.register
    }

    pub fn engine(&self) -> &Arc<MixEngine> {
        &self.engine
    }

    pub fn statistik(&self) -> VoiceStatistik {
        VoiceStatistik {
            empfangen: self.zaehler.empfangen.load(Ordering::Relaxed),
            verworfen: self.zaehler.verworfen.load(Ordering::Relaxed),
            sende_verworfen: self.zaehler.sende_verworfen.load(Ordering::Relaxed),
        }
    }

    /// Reicht Auftraege des Verzeichnis-Dienstes an die Sende-Queue weiter
    pub fn verzeichnis_auftraege_weiterleiten(
        self: &Arc<Self>,
        mut auftraege: mpsc::Receiver<VerzeichnisAuftrag>,
    ) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(auftrag) = auftraege.recv().await {
                server.senden(auftrag.ziel, &auftrag.nachricht);
            }
        })
    }

    /// Startet die Empfangs-Loop (laeuft bis `shutdown_rx` ein Signal sendet)
    pub async fn empfangs_loop_starten(&self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAMM_LAENGE];
        let mut wartung = tokio::time::interval(WARTUNGS_INTERVALL);
        wartung.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("Empfangs-Loop gestartet");

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, absender)) => {
                            let ankunft = Instant::now();
                            self.zaehler.empfangen.fetch_add(1, Ordering::Relaxed);
                            self.datagramm_verarbeiten(&buf[..len], absender, ankunft);
                        }
                        Err(e) => {
                            // ICMP "port unreachable" meldet sich unter Windows als Fehler
                            tracing::debug!(fehler = %e, "UDP-Empfangsfehler");
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    }
                }

                _ = wartung.tick() => {
                    self.inaktive_trennen();
                }

                _ = &mut shutdown_rx => {
                    tracing::info!("Shutdown-Signal empfangen");
                    break;
                }
            }
        }

        tracing::info!("Empfangs-Loop beendet");
    }

    // -----------------------------------------------------------------------
    // Betreiber-Aktionen
    // -----------------------------------------------------------------------

    /// Entfernt eine Verbindung auf Betreiber-Wunsch
    pub fn verbindung_kicken(&self, adresse: &SocketAddr, grund: Option<String>) -> bool {
        if !self.register.ist_verbunden(adresse) {
            return false;
        }
        self.senden(*adresse, &Nachricht::Kick(Kick { grund }));
        self.trennung_durchfuehren(adresse, TrennGrund::Gekickt)
    }

    /// Trennt alle Verbindungen und benachrichtigt die Clients
    pub fn alle_trennen(&self, grund: TrennGrund) -> usize {
        let adressen = self.register.adressen();
        for adresse in &adressen {
            self.senden(*adresse, &Nachricht::Trennen(Trennen { grund }));
            if let Some(t) = self.register.trennen(adresse, grund) {
                self.trennung_abschliessen(t);
            }
        }
        if !adressen.is_empty() {
            tracing::info!(anzahl = adressen.len(), grund = %grund, "Alle Clients getrennt");
        }
        adressen.len()
    }

    /// Trennt Verbindungen ohne Verkehr seit dem Timeout
    pub fn inaktive_trennen(&self) -> usize {
        let getrennt = self.register.inaktive_entfernen(self.config.verbindungs_timeout);
        let anzahl = getrennt.len();
        for t in getrennt {
            self.trennung_abschliessen(t);
        }
        if anzahl > 0 {
            self.kanal_liste_verteilen();
        }
        anzahl
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn datagramm_verarbeiten(&self, daten: &[u8], absender: SocketAddr, ankunft: Instant) {
        let nachricht = match Nachricht::decode(daten) {
            Ok(n) => n,
            Err(e) => {
                self.zaehler.verworfen.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fehler = %e, absender = %absender, "Ungueltiges Datagramm");
                return;
            }
        };

        match nachricht {
            Nachricht::Audio(paket) => self.audio_empfangen(absender, paket, ankunft),
            Nachricht::Verbinden(v) => self.verbinden(absender, v),
            Nachricht::Trennen(_) => {
                if self.trennung_durchfuehren(&absender, TrennGrund::ClientBeendet) {
                    self.kanal_liste_verteilen();
                }
            }
            Nachricht::KanalInfo(info) => self.kanal_info(absender, info),
            Nachricht::Chat(chat) => self.chat(absender, chat),
            Nachricht::Ping(ping) => self.ping(absender, ping),
            Nachricht::PingAntwort(_) => {
                self.verzeichnis_melden(VerzeichnisEreignis::PingAntwort { von: absender });
            }
            Nachricht::LizenzAkzeptiert => self.lizenz_akzeptiert(absender),
            Nachricht::GainSetzen(g) => self.gain(absender, g),
            Nachricht::ServerListeAnfordern => self.server_liste_senden(absender),
            Nachricht::ServerListe(eintraege) => {
                self.verzeichnis_melden(VerzeichnisEreignis::ServerListe {
                    von: absender,
                    eintraege,
                });
            }
            Nachricht::ServerRegistrieren(info) => self.server_registrieren(absender, info),
            Nachricht::ServerAbmelden => {
                if let Some(liste) = &self.verzeichnis.liste {
                    liste.abmelden(&absender);
                }
            }
            andere => {
                self.zaehler.verworfen.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    absender = %absender,
                    typ = ?andere.typ(),
                    "Nachricht ist nur fuer Clients bestimmt"
                );
            }
        }
    }

    fn audio_empfangen(
        &self,
        absender: SocketAddr,
        paket: klangraum_protocol::AudioPaket,
        ankunft: Instant,
    ) {
        let Some(slot) = self.register.slot_von(&absender) else {
            self.zaehler.verworfen.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(absender = %absender, "Audio von unbekannter Adresse");
            return;
        };
        self.register.paket_empfangen(&absender);
        if let Some(ereignis) = self.register.aktivieren(&absender) {
            self.melden(ereignis);
        }
        let sequenz = paket.sequenz;
        if !self.engine.audio_einspeisen(slot, paket, ankunft) {
            tracing::debug!(absender = %absender, slot = %slot, sequenz, "Audio fuer freien Slot");
        }
    }

    fn verbinden(&self, absender: SocketAddr, v: Verbinden) {
        if let Err(e) = v.pruefen() {
            self.zaehler.verworfen.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(absender = %absender, "Handshake abgelehnt: {}", e);
            return;
        }

        let slot = match self.register.slot_von(&absender) {
            Some(slot) => {
                if let Err(e) = self.engine.slot_zuruecksetzen(slot, absender, v.format) {
                    tracing::warn!(absender = %absender, slot = %slot, "Slot-Reset fehlgeschlagen: {}", e);
                    return;
                }
                self.register.verbinden(absender, slot, v.client_name, v.format);
                slot
            }
            None => match self.engine.slot_belegen(absender, v.format) {
                Ok(slot) => {
                    let ergebnis =
                        self.register.verbinden(absender, slot, v.client_name, v.format);
                    self.melden(ergebnis.verbindung.verbunden_ereignis());
                    slot
                }
                Err(KlangraumError::ServerVoll { max }) => {
                    tracing::warn!(absender = %absender, max, "Server voll, Verbindung abgelehnt");
                    self.senden(
                        absender,
                        &Nachricht::Trennen(Trennen {
                            grund: TrennGrund::ServerVoll,
                        }),
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(absender = %absender, "Slot konnte nicht belegt werden: {}", e);
                    return;
                }
            },
        };

        self.senden(
            absender,
            &Nachricht::VerbindungBestaetigt(VerbindungBestaetigt {
                slot: slot.0,
                format: v.format,
                willkommen: self.config.willkommen.clone(),
            }),
        );
        if self.engine.lizenz_tor().ist_erforderlich() {
            self.senden(
                absender,
                &Nachricht::LizenzErforderlich(LizenzTyp::CreativeCommons),
            );
        }
        self.kanal_liste_verteilen();
    }

    fn kanal_info(&self, absender: SocketAddr, info: KanalInfo) {
        if let Err(e) = info.pruefen() {
            tracing::debug!(absender = %absender, "Kanal-Info abgelehnt: {}", e);
            return;
        }
        if self.register.kanal_info_setzen(&absender, info) {
            self.register.paket_empfangen(&absender);
            self.kanal_liste_verteilen();
        }
    }

    fn chat(&self, absender: SocketAddr, chat: ChatNachricht) {
        if let Err(e) = chat.pruefen() {
            tracing::debug!(absender = %absender, "Chat abgelehnt: {}", e);
            return;
        }
        let Some(verbindung) = self.register.verbindung(&absender) else {
            return;
        };
        self.register.paket_empfangen(&absender);
        let weiter = Nachricht::Chat(ChatNachricht {
            text: format!("{}: {}", verbindung.kanal_info.name, chat.text),
        });
        for ziel in self.register.adressen() {
            self.senden(ziel, &weiter);
        }
    }

    fn ping(&self, absender: SocketAddr, ping: Ping) {
        self.register.paket_empfangen(&absender);
        self.senden(absender, &Nachricht::PingAntwort(ping));
    }

    fn lizenz_akzeptiert(&self, absender: SocketAddr) {
        let Some(slot) = self.register.slot_von(&absender) else {
            return;
        };
        if self.engine.lizenz_akzeptieren(slot) {
            tracing::info!(absender = %absender, slot = %slot, "Lizenz akzeptiert");
        }
    }

    fn gain(&self, absender: SocketAddr, g: GainSetzen) {
        if let Err(e) = g.pruefen() {
            tracing::debug!(absender = %absender, "Gain abgelehnt: {}", e);
            return;
        }
        let Some(hoerer) = self.register.slot_von(&absender) else {
            return;
        };
        self.engine
            .gain_setzen(hoerer, SlotId(g.quelle), KanalGain::neu(g.gain, g.pan));
    }

    fn server_liste_senden(&self, absender: SocketAddr) {
        let Some(liste) = &self.verzeichnis.liste else {
            tracing::debug!(absender = %absender, "Server-Liste angefragt, aber kein Verzeichnis");
            return;
        };
        let eintraege = liste.eintraege(self.config.alle_anzeigen);
        self.senden(absender, &Nachricht::ServerListe(eintraege));
    }

    fn server_registrieren(&self, absender: SocketAddr, info: ServerInfo) {
        let Some(liste) = &self.verzeichnis.liste else {
            return;
        };
        if let Err(e) = info.pruefen() {
            tracing::debug!(absender = %absender, "Server-Anmeldung abgelehnt: {}", e);
            return;
        }
        liste.registrieren(absender, info);
    }

    // -----------------------------------------------------------------------
    // Hilfen
    // -----------------------------------------------------------------------

    /// Trennt eine Verbindung; `false` wenn sie nicht (mehr) existiert
    fn trennung_durchfuehren(&self, adresse: &SocketAddr, grund: TrennGrund) -> bool {
        match self.register.trennen(adresse, grund) {
            Some(t) => {
                self.trennung_abschliessen(t);
                true
            }
            None => false,
        }
    }

    fn trennung_abschliessen(&self, trennung: Trennung) {
        self.engine.slot_freigeben(trennung.verbindung.slot);
        self.melden(trennung.ereignis);
    }

    /// Verteilt die Teilnehmerliste an alle Verbindungen
    fn kanal_liste_verteilen(&self) {
        let liste = Nachricht::KanalListe(self.register.kanal_liste());
        for ziel in self.register.adressen() {
            self.senden(ziel, &liste);
        }
    }

    fn melden(&self, ereignis: SitzungsEreignis) {
        // Ohne Abonnenten geht das Ereignis verloren
        let _ = self.ereignisse.send(ereignis);
    }

    fn verzeichnis_melden(&self, ereignis: VerzeichnisEreignis) {
        if let Some(tx) = &self.verzeichnis.ereignisse {
            if tx.try_send(ereignis).is_err() {
                tracing::debug!("Verzeichnis-Ereignis verworfen");
            }
        }
    }

    fn senden(&self, ziel: SocketAddr, nachricht: &Nachricht) {
        let bytes = match nachricht.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(ziel = %ziel, typ = ?nachricht.typ(), "Nachricht nicht kodierbar: {}", e);
                return;
            }
        };
        if self.sende_tx.try_send((ziel, bytes)).is_err() {
            self.zaehler.sende_verworfen.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(ziel = %ziel, "Sende-Queue voll, Datagramm verworfen");
        }
    }
}

/// Liest aus der Sende-Queue und versendet via UDP
async fn sende_loop(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Ausgehend>) {
    while let Some((ziel, daten)) = rx.recv().await {
        match socket.send_to(&daten, ziel).await {
            Ok(_) => {
                tracing::trace!(bytes = daten.len(), ziel = %ziel, "Datagramm gesendet");
            }
            Err(e) => {
                tracing::debug!(fehler = %e, ziel = %ziel, "UDP-Sendefehler");
            }
        }
    }
    tracing::debug!("Sende-Task beendet");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lizenz::LizenzTor;
    use crate::mixer::MixConfig;
    use klangraum_protocol::codec::{CodecTyp, FrameFormat, FrameGroesse, KanalAnzahl};
    use std::net::{IpAddr, Ipv4Addr};

    fn slot_wird_gemischt(engine: &MixEngine, slot: SlotId) -> bool {
        engine
            .lizenz_status(slot)
            .is_some_and(LizenzTor::darf_gemischt_werden)
    }

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn format() -> FrameFormat {
        FrameFormat::neu(FrameGroesse::Samples128, KanalAnzahl::Mono, CodecTyp::Pcm16)
    }

    async fn server(max_kanaele: usize, lizenz: bool) -> (Arc<VoiceServer>, broadcast::Receiver<SitzungsEreignis>) {
        let engine = MixEngine::neu(MixConfig {
            max_kanaele,
            lizenz_erforderlich: lizenz,
            ..MixConfig::default()
        })
        .unwrap();
        let (tx, rx) = broadcast::channel(64);
        let server = VoiceServer::binden(
            VoiceServerConfig::neu(localhost(0)),
            Arc::new(engine),
            VerbindungsRegister::neu(),
            tx,
        )
        .await
        .expect("Server muss binden koennen");
        (Arc::new(server), rx)
    }

    fn verbinden(name: &str) -> Vec<u8> {
        Nachricht::Verbinden(Verbinden {
            client_name: name.into(),
            format: format(),
        })
        .encode()
        .unwrap()
        .to_vec()
    }

    #[tokio::test]
    async fn handshake_belegt_slot_und_meldet_ereignis() {
        let (server, mut rx) = server(4, false).await;
        let client = localhost(40001);

        server.datagramm_verarbeiten(&verbinden("Anna"), client, Instant::now());
        assert_eq!(server.register().slot_von(&client), Some(SlotId(0)));
        assert_eq!(server.engine().belegte_slots(), 1);
        assert!(matches!(rx.try_recv(), Ok(SitzungsEreignis::Verbunden { .. })));

        // Wiederholter Handshake: gleicher Slot, kein zweites Ereignis
        server.datagramm_verarbeiten(&verbinden("Anna"), client, Instant::now());
        assert_eq!(server.register().anzahl(), 1);
        assert_eq!(server.engine().belegte_slots(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn voller_server_lehnt_ab() {
        let (server, _rx) = server(1, false).await;
        server.datagramm_verarbeiten(&verbinden("A"), localhost(40001), Instant::now());
        server.datagramm_verarbeiten(&verbinden("B"), localhost(40002), Instant::now());
        assert_eq!(server.register().anzahl(), 1);
        assert!(!server.register().ist_verbunden(&localhost(40002)));
    }

    #[tokio::test]
    async fn trennen_ist_idempotent() {
        let (server, mut rx) = server(4, false).await;
        let client = localhost(40001);
        server.datagramm_verarbeiten(&verbinden("A"), client, Instant::now());
        let _ = rx.try_recv();

        let trennen = Nachricht::Trennen(Trennen {
            grund: TrennGrund::ClientBeendet,
        })
        .encode()
        .unwrap();
        server.datagramm_verarbeiten(&trennen, client, Instant::now());
        server.datagramm_verarbeiten(&trennen, client, Instant::now());

        assert_eq!(server.engine().belegte_slots(), 0);
        assert!(matches!(
            rx.try_recv(),
            Ok(SitzungsEreignis::Getrennt { war_aktiv: false, .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn erstes_audio_aktiviert() {
        let (server, mut rx) = server(4, false).await;
        let client = localhost(40001);
        server.datagramm_verarbeiten(&verbinden("A"), client, Instant::now());
        let _ = rx.try_recv();

        let audio = Nachricht::Audio(klangraum_protocol::AudioPaket::neu(0, vec![0; 256]))
            .encode()
            .unwrap();
        server.datagramm_verarbeiten(&audio, client, Instant::now());
        server.datagramm_verarbeiten(&audio, client, Instant::now());
        assert!(matches!(rx.try_recv(), Ok(SitzungsEreignis::Aktiviert { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lizenz_schaltet_mischen_frei() {
        let (server, _rx) = server(4, true).await;
        let client = localhost(40001);
        server.datagramm_verarbeiten(&verbinden("A"), client, Instant::now());
        assert!(!slot_wird_gemischt(server.engine(), SlotId(0)));

        let ok = Nachricht::LizenzAkzeptiert.encode().unwrap();
        server.datagramm_verarbeiten(&ok, client, Instant::now());
        server.datagramm_verarbeiten(&ok, client, Instant::now());
        assert!(slot_wird_gemischt(server.engine(), SlotId(0)));
    }

    #[tokio::test]
    async fn muell_wird_gezaehlt_nicht_verarbeitet() {
        let (server, _rx) = server(4, false).await;
        server.datagramm_verarbeiten(b"kein Datagramm", localhost(40001), Instant::now());
        let audio_fremd = Nachricht::Audio(klangraum_protocol::AudioPaket::neu(0, vec![0; 256]))
            .encode()
            .unwrap();
        server.datagramm_verarbeiten(&audio_fremd, localhost(40002), Instant::now());

        assert_eq!(server.statistik().verworfen, 2);
        assert_eq!(server.register().anzahl(), 0);
    }

    #[tokio::test]
    async fn kick_und_alle_trennen() {
        let (server, _rx) = server(4, false).await;
        server.datagramm_verarbeiten(&verbinden("A"), localhost(40001), Instant::now());
        server.datagramm_verarbeiten(&verbinden("B"), localhost(40002), Instant::now());

        assert!(server.verbindung_kicken(&localhost(40001), Some("Test".into())));
        assert!(!server.verbindung_kicken(&localhost(40001), None));
        assert_eq!(server.alle_trennen(TrennGrund::ServerBeendet), 1);
        assert_eq!(server.engine().belegte_slots(), 0);
    }
}
